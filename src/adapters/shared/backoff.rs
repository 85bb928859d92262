//! Reconnection backoff policy with exponential delay and jitter
//!
//! Each connection loop owns one `BackoffPolicy`. The delay doubles on every
//! consecutive failure, is capped, and carries ±20% random jitter to prevent
//! thundering-herd reconnects. The failure counter resets on the first
//! successfully received message after a reconnect, so a flaky-but-working
//! connection returns to the base delay.

use std::time::Duration;

use rand::Rng;

/// Jitter band applied to every computed delay (±20%)
const JITTER_FRACTION: f64 = 0.2;

/// Configuration for reconnection delays
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    /// Initial delay in milliseconds (doubles each consecutive failure)
    pub base_ms: u64,
    /// Maximum delay cap in milliseconds
    pub cap_ms: u64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_ms: 1_000,
            cap_ms: 30_000,
        }
    }
}

/// Per-connection backoff state
#[derive(Debug)]
pub struct BackoffPolicy {
    config: BackoffConfig,
    failures: u32,
}

impl BackoffPolicy {
    pub fn new(config: BackoffConfig) -> Self {
        Self {
            config,
            failures: 0,
        }
    }

    /// Record a failure and return the delay to sleep before the next attempt
    pub fn next_delay(&mut self) -> Duration {
        let delay_ms = self.delay_for(self.failures);
        self.failures = self.failures.saturating_add(1);
        let jitter_span = (delay_ms as f64 * JITTER_FRACTION).round() as i64;
        let jitter = if jitter_span > 0 {
            rand::thread_rng().gen_range(-jitter_span..=jitter_span)
        } else {
            0
        };
        let jittered = (delay_ms as i64 + jitter).max(0) as u64;
        Duration::from_millis(jittered)
    }

    /// Base delay (before jitter) for a given consecutive-failure count
    pub fn delay_for(&self, failures: u32) -> u64 {
        let shift = failures.min(31);
        let raw = self.config.base_ms.saturating_mul(1u64 << shift);
        raw.min(self.config.cap_ms)
    }

    /// Reset the failure counter; called on the first message received after
    /// a (re)connect.
    pub fn reset(&mut self) {
        self.failures = 0;
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn policy() -> BackoffPolicy {
        BackoffPolicy::new(BackoffConfig {
            base_ms: 1_000,
            cap_ms: 30_000,
        })
    }

    #[test]
    fn test_delay_doubles_until_cap() {
        let p = policy();
        assert_eq!(p.delay_for(0), 1_000);
        assert_eq!(p.delay_for(1), 2_000);
        assert_eq!(p.delay_for(2), 4_000);
        assert_eq!(p.delay_for(3), 8_000);
        assert_eq!(p.delay_for(4), 16_000);
        assert_eq!(p.delay_for(5), 30_000, "capped");
        assert_eq!(p.delay_for(20), 30_000, "stays capped");
    }

    #[test]
    fn test_reset_returns_to_base() {
        let mut p = policy();
        let _ = p.next_delay();
        let _ = p.next_delay();
        let _ = p.next_delay();
        assert_eq!(p.failures(), 3);
        p.reset();
        assert_eq!(p.failures(), 0);
        assert_eq!(p.delay_for(p.failures()), 1_000);
    }

    #[test]
    fn test_next_delay_stays_in_jitter_band() {
        let mut p = policy();
        for expected in [1_000u64, 2_000, 4_000] {
            let d = p.next_delay().as_millis() as u64;
            let lo = (expected as f64 * (1.0 - JITTER_FRACTION)) as u64;
            let hi = (expected as f64 * (1.0 + JITTER_FRACTION)) as u64;
            assert!(d >= lo && d <= hi, "delay {} outside [{}, {}]", d, lo, hi);
        }
    }

    #[test]
    fn test_large_shift_does_not_overflow() {
        let p = policy();
        assert_eq!(p.delay_for(u32::MAX), 30_000);
    }

    proptest! {
        #[test]
        fn prop_base_delays_non_decreasing_and_capped(
            base in 1u64..5_000,
            cap_mult in 1u64..64,
            failures in 0u32..40,
        ) {
            let cap = base * cap_mult;
            let p = BackoffPolicy::new(BackoffConfig { base_ms: base, cap_ms: cap });
            let mut prev = 0u64;
            for n in 0..failures {
                let d = p.delay_for(n);
                prop_assert!(d >= prev, "delay decreased: {} < {}", d, prev);
                prop_assert!(d <= cap, "delay {} above cap {}", d, cap);
                prev = d;
            }
        }

        #[test]
        fn prop_jittered_delay_within_band(base in 100u64..5_000) {
            let mut p = BackoffPolicy::new(BackoffConfig { base_ms: base, cap_ms: base * 32 });
            let d = p.next_delay().as_millis() as u64;
            let lo = (base as f64 * (1.0 - JITTER_FRACTION)).floor() as u64;
            let hi = (base as f64 * (1.0 + JITTER_FRACTION)).ceil() as u64;
            prop_assert!(d >= lo && d <= hi);
        }
    }
}
