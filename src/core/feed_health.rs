//! Feed health monitoring: duplicates, freshness, crossing, synchronization
//!
//! Consumes every inbound message and every book update to maintain
//! per-asset/per-kind health indicators and process-wide counters. Purely an
//! observability/safety layer: it never mutates trading state, the decision
//! engine only reads its per-asset snapshot.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use serde_json::Value;

use crate::config::FeedHealthSettings;
use crate::core::state::{current_time_ms, MarketKind};

/// Health of one (asset, kind) book
#[derive(Debug, Clone, Copy, Default)]
pub struct BookHealth {
    /// Unix ms of the last observed update; 0 = never observed
    pub ts: u64,
    pub best_bid: f64,
    pub best_ask: f64,
    pub incomplete: bool,
    pub crossed: bool,
}

impl BookHealth {
    /// Age of the last update in ms; infinity if never observed
    pub fn age_ms(&self, now: u64) -> f64 {
        if self.ts == 0 {
            return f64::INFINITY;
        }
        now.saturating_sub(self.ts) as f64
    }
}

/// Health of one asset across both books
#[derive(Debug, Clone, Copy, Default)]
pub struct AssetHealth {
    pub spot: BookHealth,
    pub perp: BookHealth,
    pub stale: bool,
    pub out_of_sync: bool,
}

/// Point-in-time health view for one asset, plus process-wide counters
#[derive(Debug, Clone)]
pub struct FeedHealthSnapshot {
    pub asset: String,
    pub spot_age_ms: f64,
    pub perp_age_ms: f64,
    pub spot_incomplete: bool,
    pub perp_incomplete: bool,
    pub stale: bool,
    pub crossed: bool,
    pub out_of_sync: bool,
    pub spot_bid: f64,
    pub spot_ask: f64,
    pub perp_bid: f64,
    pub perp_ask: f64,
    pub ws_msgs_total: u64,
    pub duplicate_events: u64,
    pub heartbeat_only: u64,
    pub book_incomplete: u64,
    pub stale_book: u64,
    pub crossed_book: u64,
    pub out_of_sync_count: u64,
}

#[derive(Debug, Default)]
struct HealthInner {
    asset_health: HashMap<String, AssetHealth>,
    dedup_cache: HashMap<String, u64>,
}

/// Process-wide feed health tracker
#[derive(Debug)]
pub struct FeedHealthTracker {
    settings: FeedHealthSettings,
    ws_msgs_total: AtomicU64,
    duplicate_events: AtomicU64,
    heartbeat_only: AtomicU64,
    book_incomplete: AtomicU64,
    stale_book: AtomicU64,
    crossed_book: AtomicU64,
    out_of_sync: AtomicU64,
    inner: Mutex<HealthInner>,
}

impl FeedHealthTracker {
    pub fn new(settings: FeedHealthSettings) -> Self {
        Self {
            settings,
            ws_msgs_total: AtomicU64::new(0),
            duplicate_events: AtomicU64::new(0),
            heartbeat_only: AtomicU64::new(0),
            book_incomplete: AtomicU64::new(0),
            stale_book: AtomicU64::new(0),
            crossed_book: AtomicU64::new(0),
            out_of_sync: AtomicU64::new(0),
            inner: Mutex::new(HealthInner::default()),
        }
    }

    pub fn settings(&self) -> &FeedHealthSettings {
        &self.settings
    }

    /// Register a raw inbound message; returns true if it is a duplicate
    /// observed within the dedup TTL. Counting aside, duplicates mutate
    /// nothing.
    pub fn register_message(&self, msg: &Value) -> bool {
        self.ws_msgs_total.fetch_add(1, Ordering::Relaxed);
        let now = current_time_ms();
        let ttl = self.settings.dedup_ttl_ms;
        let key = dedup_key(msg);

        let mut inner = self.inner.lock().expect("feed health lock poisoned");
        inner
            .dedup_cache
            .retain(|_, seen| now.saturating_sub(*seen) <= ttl);

        let Some(key) = key else {
            return false;
        };
        if let Some(seen) = inner.dedup_cache.get(&key) {
            if now.saturating_sub(*seen) <= ttl {
                self.duplicate_events.fetch_add(1, Ordering::Relaxed);
                inner.dedup_cache.insert(key, now);
                return true;
            }
        }
        inner.dedup_cache.insert(key, now);
        false
    }

    /// Track heartbeat/keepalive messages that do not update books
    pub fn register_heartbeat(&self, msg: &Value) {
        if looks_like_heartbeat(msg) {
            self.heartbeat_only.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Feed one normalized book update into the health state
    #[allow(clippy::too_many_arguments)]
    pub fn on_book_update(
        &self,
        asset: &str,
        kind: MarketKind,
        best_bid: f64,
        best_ask: f64,
        observed_at: u64,
        had_bids: bool,
        had_asks: bool,
    ) {
        let now = current_time_ms();
        let mut inner = self.inner.lock().expect("feed health lock poisoned");
        let health = inner.asset_health.entry(asset.to_string()).or_default();
        let target = match kind {
            MarketKind::Perp => &mut health.perp,
            MarketKind::Spot => &mut health.spot,
        };
        target.ts = if observed_at > 0 { observed_at } else { now };
        target.best_bid = best_bid.max(0.0);
        target.best_ask = best_ask.max(0.0);
        target.incomplete =
            !(had_bids && had_asks && target.best_bid > 0.0 && target.best_ask > 0.0);
        target.crossed =
            target.best_bid >= target.best_ask && target.best_bid > 0.0 && target.best_ask > 0.0;

        let incomplete = target.incomplete;
        let crossed = target.crossed;
        let age = target.age_ms(now);

        if incomplete {
            self.book_incomplete.fetch_add(1, Ordering::Relaxed);
        }
        if age > self.settings.stale_ms as f64 {
            health.stale = true;
            self.stale_book.fetch_add(1, Ordering::Relaxed);
        } else {
            health.stale = false;
        }
        if crossed {
            self.crossed_book.fetch_add(1, Ordering::Relaxed);
        }

        // Recompute the cross-market sync flag from both observation times
        let spot_ts = health.spot.ts;
        let perp_ts = health.perp.ts;
        if spot_ts > 0 && perp_ts > 0 {
            let delta_ms = spot_ts.abs_diff(perp_ts);
            health.out_of_sync = delta_ms > self.settings.out_of_sync_ms;
            if health.out_of_sync {
                self.out_of_sync.fetch_add(1, Ordering::Relaxed);
            }
        } else {
            health.out_of_sync = false;
        }
    }

    /// Raw per-asset health (creates the entry if missing)
    pub fn asset_health(&self, asset: &str) -> AssetHealth {
        let mut inner = self.inner.lock().expect("feed health lock poisoned");
        *inner.asset_health.entry(asset.to_string()).or_default()
    }

    /// Pure read: point-in-time snapshot for one asset
    pub fn snapshot(&self, asset: &str) -> FeedHealthSnapshot {
        let now = current_time_ms();
        let health = self.asset_health(asset);
        let spot_age = health.spot.age_ms(now);
        let perp_age = health.perp.age_ms(now);
        let stale_now =
            spot_age > self.settings.stale_ms as f64 || perp_age > self.settings.stale_ms as f64;
        FeedHealthSnapshot {
            asset: asset.to_string(),
            spot_age_ms: spot_age,
            perp_age_ms: perp_age,
            spot_incomplete: health.spot.incomplete,
            perp_incomplete: health.perp.incomplete,
            stale: stale_now || health.stale,
            crossed: health.spot.crossed || health.perp.crossed,
            out_of_sync: health.out_of_sync,
            spot_bid: health.spot.best_bid,
            spot_ask: health.spot.best_ask,
            perp_bid: health.perp.best_bid,
            perp_ask: health.perp.best_ask,
            ws_msgs_total: self.ws_msgs_total.load(Ordering::Relaxed),
            duplicate_events: self.duplicate_events.load(Ordering::Relaxed),
            heartbeat_only: self.heartbeat_only.load(Ordering::Relaxed),
            book_incomplete: self.book_incomplete.load(Ordering::Relaxed),
            stale_book: self.stale_book.load(Ordering::Relaxed),
            crossed_book: self.crossed_book.load(Ordering::Relaxed),
            out_of_sync_count: self.out_of_sync.load(Ordering::Relaxed),
        }
    }

    /// Drop per-asset health state (asset untracked)
    pub fn remove_asset(&self, asset: &str) {
        let mut inner = self.inner.lock().expect("feed health lock poisoned");
        inner.asset_health.remove(asset);
    }
}

// =============================================================================
// Dedup key derivation
// =============================================================================

fn extract_payload<'a>(msg: &'a Value) -> Option<&'a Value> {
    for key in ["data", "result", "levels", "payload"] {
        if let Some(val) = msg.get(key) {
            if val.is_object() {
                return Some(val);
            }
        }
    }
    None
}

fn str_field<'a>(msg: &'a Value, payload: Option<&'a Value>, keys: &[&str]) -> Option<&'a str> {
    for src in payload.into_iter().chain(std::iter::once(msg)) {
        for key in keys {
            if let Some(v) = src.get(*key).and_then(Value::as_str) {
                return Some(v);
            }
        }
    }
    None
}

fn raw_field<'a>(msg: &'a Value, payload: Option<&'a Value>, keys: &[&str]) -> Option<&'a Value> {
    for src in payload.into_iter().chain(std::iter::once(msg)) {
        for key in keys {
            if let Some(v) = src.get(*key) {
                if !v.is_null() {
                    return Some(v);
                }
            }
        }
    }
    None
}

fn content_hash(msg: &Value) -> u64 {
    let mut hasher = DefaultHasher::new();
    msg.to_string().hash(&mut hasher);
    hasher.finish()
}

/// Dedup key from (channel, coin, sequence-or-timestamp), with a content
/// hash fallback when the identifying fields are missing.
fn dedup_key(msg: &Value) -> Option<String> {
    let payload = extract_payload(msg);
    let channel = str_field(msg, None, &["channel", "type"]);
    let coin = str_field(msg, payload, &["coin", "asset"]);
    let seq = raw_field(msg, payload, &["seq"]);
    let ts = raw_field(msg, payload, &["ts", "time"]);

    match (channel, coin) {
        (Some(channel), Some(coin)) => {
            if let Some(marker) = seq.or(ts) {
                Some(format!("{}:{}:{}", channel, coin, marker))
            } else {
                Some(format!("{}:{}:{:x}", channel, coin, content_hash(msg)))
            }
        }
        _ => Some(format!("{:x}", content_hash(msg))),
    }
}

fn looks_like_heartbeat(msg: &Value) -> bool {
    let channel = msg
        .get("channel")
        .or_else(|| msg.get("type"))
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_lowercase();
    if matches!(channel.as_str(), "pong" | "ping" | "heartbeat") {
        return true;
    }
    let Some(obj) = msg.as_object() else {
        return false;
    };
    obj.keys()
        .all(|k| matches!(k.as_str(), "channel" | "type" | "time" | "ts"))
}

// =============================================================================
// Tests
// =============================================================================
