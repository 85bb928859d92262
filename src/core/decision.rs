//! Readiness gates and cross-market edge computation
//!
//! Pure functions over already-cached state: no I/O, no locks, safe to run
//! inline on the feed callback. The gate precedence and the two directional
//! spread formulas are load-bearing; downstream thresholds are tuned against
//! them. In particular the directional spreads use different denominators
//! (`(perp_bid-spot_ask)/spot_ask` vs `(spot_bid-perp_ask)/spot_bid`) and
//! must stay that way.

use serde::{Deserialize, Serialize};

use crate::config::TradingSettings;
use crate::core::feed_health::FeedHealthSnapshot;
use crate::core::state::{AssetMarketState, BookQuote};

// =============================================================================
// Reason codes
// =============================================================================

/// Why an evaluation did not produce a tradeable edge
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SkipReason {
    /// Real spot book failed the spread sanity cap or was incomplete
    SpotSanityFailed,
    /// Perp book flagged incomplete
    Incomplete,
    /// Mark price missing or non-positive
    NoMark,
    /// No usable spot source or no liquid perp book
    NoBook,
    /// A book aged past the staleness threshold
    Stale,
    /// Spot and perp observed too far apart in time
    OutOfSync,
    /// A book is crossed (bid >= ask)
    InvalidBbo,
    /// Gross spread below the effective minimum-edge threshold
    BelowMinEdge,
    /// Net PnL estimate (or gross spread) non-positive
    PnlNonPos,
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SkipReason::SpotSanityFailed => "spot_sanity_failed",
            SkipReason::Incomplete => "SKIP_INCOMPLETE",
            SkipReason::NoMark => "SKIP_NO_MARK",
            SkipReason::NoBook => "SKIP_NO_BOOK",
            SkipReason::Stale => "SKIP_STALE",
            SkipReason::OutOfSync => "SKIP_OUT_OF_SYNC",
            SkipReason::InvalidBbo => "SKIP_INVALID_BBO",
            SkipReason::BelowMinEdge => "BELOW_MIN_EDGE",
            SkipReason::PnlNonPos => "PNL_NONPOS",
        }
    }
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Trade direction of the larger directional spread
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    /// Buy spot at the ask, sell perp at the bid
    SpotLong,
    /// Sell spot at the bid, buy perp at the ask
    SpotShort,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::SpotLong => "spot_long",
            Direction::SpotShort => "spot_short",
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Gate evaluation
// =============================================================================

/// Individual gate outcomes, reported alongside the first failing reason
#[derive(Debug, Clone, Copy, Default)]
pub struct GateReport {
    pub ready: bool,
    pub reason: Option<SkipReason>,
    pub spot_sane: bool,
    pub not_incomplete: bool,
    pub has_mark: bool,
    pub has_books: bool,
    pub not_stale: bool,
    pub in_sync: bool,
    pub not_crossed: bool,
    /// Evaluation fell back to the spot-proxy price
    pub used_spot_proxy: bool,
}

/// Evaluate the readiness gates in precedence order. The reported reason is
/// the first failing gate; the report still records every gate's outcome.
pub fn evaluate_gates(
    trading: &TradingSettings,
    stale_ms: u64,
    state: &AssetMarketState,
    health: &FeedHealthSnapshot,
    now_ms: u64,
) -> GateReport {
    let mut report = GateReport::default();

    let spot_real = state.spot.has_two_sides();
    let effective_spot = state.effective_spot();
    report.used_spot_proxy = matches!(effective_spot, Some((_, true)));

    // 1. Spot spread sanity applies only to a real (non-proxy) spot book
    report.spot_sane = if spot_real {
        state
            .spot
            .spread_bps()
            .map(|bps| bps <= trading.max_spot_spread_bps)
            .unwrap_or(false)
    } else {
        true
    };

    // 2. Completeness per side
    report.not_incomplete = !health.spot_incomplete && !health.perp_incomplete;

    // 3. Mark price present and positive
    report.has_mark = state.mark_price > 0.0;

    // 4. Usable spot source and a two-sided perp book. Crossed books pass
    //    here and are rejected by gate 7.
    report.has_books = effective_spot.is_some() && state.perp.has_two_sides();

    // 5. Freshness: real spot age from the health tracker, proxy age from
    //    its own observation time; perp always from the tracker
    let spot_age_ms = if spot_real {
        health.spot_age_ms
    } else if state.spot_proxy_observed_at > 0 {
        now_ms.saturating_sub(state.spot_proxy_observed_at) as f64
    } else {
        f64::INFINITY
    };
    report.not_stale = spot_age_ms <= stale_ms as f64 && health.perp_age_ms <= stale_ms as f64;

    // 6. Cross-market synchronization
    report.in_sync = !health.out_of_sync;

    // 7. Crossed books
    report.not_crossed = !health.crossed;

    report.reason = if !report.spot_sane {
        Some(SkipReason::SpotSanityFailed)
    } else if health.spot_incomplete {
        Some(SkipReason::SpotSanityFailed)
    } else if health.perp_incomplete {
        Some(SkipReason::Incomplete)
    } else if !report.has_mark {
        Some(SkipReason::NoMark)
    } else if !report.has_books {
        Some(SkipReason::NoBook)
    } else if !report.not_stale {
        Some(SkipReason::Stale)
    } else if !report.in_sync {
        Some(SkipReason::OutOfSync)
    } else if !report.not_crossed {
        Some(SkipReason::InvalidBbo)
    } else {
        None
    };
    report.ready = report.reason.is_none();
    report
}

// =============================================================================
// Edge computation
// =============================================================================

/// Normalize a configured threshold/slippage input: values >= 1 are basis
/// points, values in (0,1) are already a rate.
pub fn normalize_rate(value: f64) -> f64 {
    if !value.is_finite() || value <= 0.0 {
        0.0
    } else if value >= 1.0 {
        value / 10_000.0
    } else {
        value
    }
}

/// Final verdict of one evaluation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Pass,
    Reject(SkipReason),
}

/// Fully-detailed edge decision; recomputed on every evaluation
#[derive(Debug, Clone)]
pub struct EdgeDecision {
    pub asset: String,
    pub direction: Direction,
    pub spot_price: f64,
    pub perp_price: f64,
    pub mark_price: f64,
    pub notional: f64,
    pub fee_spot: f64,
    pub fee_perp: f64,
    pub slippage_cost: f64,
    pub funding_cost: f64,
    pub spread_gross: f64,
    pub pnl_net_est: f64,
    pub edge_bps: f64,
    pub min_edge_bps: f64,
    pub effective_threshold_bps: f64,
    pub below_min_edge: bool,
    pub verdict: Verdict,
}

/// Compute the cross-market edge once all readiness gates have passed.
///
/// `spot` is the effective spot quote (real book or proxy).
pub fn compute_edge(
    trading: &TradingSettings,
    asset: &str,
    spot: BookQuote,
    perp: BookQuote,
    mark_price: f64,
    funding_rate: f64,
) -> EdgeDecision {
    let notional = trading.min_position_size.max(1.0);

    let spread_long = if spot.best_ask > 0.0 {
        (perp.best_bid - spot.best_ask) / spot.best_ask
    } else {
        f64::NEG_INFINITY
    };
    let spread_short = if spot.best_bid > 0.0 && perp.best_ask > 0.0 {
        (spot.best_bid - perp.best_ask) / spot.best_bid
    } else {
        f64::NEG_INFINITY
    };

    let (direction, spread_gross, spot_price, perp_price) = if spread_long >= spread_short {
        (Direction::SpotLong, spread_long, spot.best_ask, perp.best_bid)
    } else {
        (Direction::SpotShort, spread_short, spot.best_bid, perp.best_ask)
    };

    let fee_spot = trading.spot_fee_rate() * notional;
    let fee_perp = trading.perp_fee_rate() * notional;
    let slippage_rate =
        normalize_rate(trading.slippage_rate) + normalize_rate(trading.safety_slippage_buffer);
    let slippage_cost = slippage_rate * notional;
    let funding_cost = funding_rate * notional;

    let pnl_net_est =
        spread_gross * notional - fee_spot - fee_perp - slippage_cost - funding_cost;

    let min_edge_rate = normalize_rate(trading.min_edge_threshold);
    let cost_rate = (fee_spot + fee_perp + slippage_cost) / notional;
    let effective_threshold_rate = min_edge_rate.max(cost_rate);
    let below_min_edge = spread_gross < effective_threshold_rate;

    let verdict = if spread_gross <= 0.0 || pnl_net_est <= 0.0 {
        Verdict::Reject(SkipReason::PnlNonPos)
    } else if below_min_edge {
        Verdict::Reject(SkipReason::BelowMinEdge)
    } else {
        Verdict::Pass
    };

    EdgeDecision {
        asset: asset.to_string(),
        direction,
        spot_price,
        perp_price,
        mark_price,
        notional,
        fee_spot,
        fee_perp,
        slippage_cost,
        funding_cost,
        spread_gross,
        pnl_net_est,
        edge_bps: spread_gross * 10_000.0,
        min_edge_bps: min_edge_rate * 10_000.0,
        effective_threshold_bps: effective_threshold_rate * 10_000.0,
        below_min_edge,
        verdict,
    }
}

// =============================================================================
// Full evaluation
// =============================================================================

/// One complete evaluation: gates plus (when they pass) the edge decision
#[derive(Debug, Clone)]
pub struct Evaluation {
    pub asset: String,
    pub gates: GateReport,
    pub decision: Option<EdgeDecision>,
}

impl Evaluation {
    /// True only for an above-threshold, net-PnL-positive candidate
    pub fn is_pass(&self) -> bool {
        matches!(
            self.decision.as_ref().map(|d| d.verdict),
            Some(Verdict::Pass)
        )
    }

    /// ("WOULD_TRADE" | "SKIP", reason) pair for the validation trace
    pub fn outcome(&self) -> (&'static str, Option<SkipReason>) {
        if self.is_pass() {
            return ("WOULD_TRADE", None);
        }
        let reason = self.gates.reason.or_else(|| {
            self.decision.as_ref().and_then(|d| match d.verdict {
                Verdict::Reject(reason) => Some(reason),
                Verdict::Pass => None,
            })
        });
        ("SKIP", reason)
    }
}

/// Evaluate one asset end to end: gates first, edge only when ready.
pub fn evaluate(
    trading: &TradingSettings,
    stale_ms: u64,
    asset: &str,
    state: &AssetMarketState,
    health: &FeedHealthSnapshot,
    now_ms: u64,
) -> Evaluation {
    let gates = evaluate_gates(trading, stale_ms, state, health, now_ms);
    if !gates.ready {
        return Evaluation {
            asset: asset.to_string(),
            gates,
            decision: None,
        };
    }

    // Gate 4 guarantees a usable spot source when ready
    let Some((spot, _proxied)) = state.effective_spot() else {
        return Evaluation {
            asset: asset.to_string(),
            gates: GateReport {
                ready: false,
                reason: Some(SkipReason::NoBook),
                ..gates
            },
            decision: None,
        };
    };
    let decision = compute_edge(
        trading,
        asset,
        spot,
        state.perp,
        state.mark_price,
        state.funding_rate,
    );

    Evaluation {
        asset: asset.to_string(),
        gates,
        decision: Some(decision),
    }
}

// =============================================================================
// Tests
// =============================================================================
