//! Per-asset market state store
//!
//! In-memory record of the latest spot book, perp book, mark price, funding
//! rate, and spot-proxy per tracked asset, plus update counters. Each asset
//! lives behind its own lock: a given asset's state is written only by that
//! asset's feed callbacks, while snapshot reads from other tasks never
//! contend across assets.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

/// Current timestamp in milliseconds (Unix epoch)
pub fn current_time_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Which market a book update belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MarketKind {
    Spot,
    Perp,
}

impl std::fmt::Display for MarketKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MarketKind::Spot => write!(f, "spot"),
            MarketKind::Perp => write!(f, "perp"),
        }
    }
}

/// Best-of-book quote, replaced wholesale on every update
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct BookQuote {
    pub best_bid: f64,
    pub best_ask: f64,
    /// Unix ms when this quote was observed
    pub observed_at: u64,
}

impl BookQuote {
    pub fn new(best_bid: f64, best_ask: f64, observed_at: u64) -> Self {
        Self {
            best_bid,
            best_ask,
            observed_at,
        }
    }

    /// A liquid quote has both sides positive and uncrossed
    pub fn is_liquid(&self) -> bool {
        self.best_bid > 0.0 && self.best_ask > 0.0 && self.best_bid < self.best_ask
    }

    /// Both sides present, crossing not considered. Crossed books are caught
    /// by their own readiness gate, not treated as missing.
    pub fn has_two_sides(&self) -> bool {
        self.best_bid > 0.0 && self.best_ask > 0.0
    }

    /// Spot-book spread in basis points relative to the bid
    pub fn spread_bps(&self) -> Option<f64> {
        if self.best_bid <= 0.0 || self.best_ask <= 0.0 {
            return None;
        }
        Some((self.best_ask - self.best_bid) / self.best_bid * 10_000.0)
    }
}

/// How many updates of each kind have been observed for an asset
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpdateCounts {
    pub spot: u64,
    pub perp: u64,
    pub mark: u64,
}

/// Latest market state for one tracked asset
#[derive(Debug, Clone, Default)]
pub struct AssetMarketState {
    pub spot: BookQuote,
    pub perp: BookQuote,
    pub mark_price: f64,
    pub mark_observed_at: u64,
    pub funding_rate: f64,
    /// Synthetic mid derived from context payloads; substitutes for the spot
    /// quote only while no real spot book is liquid.
    pub spot_proxy: f64,
    pub spot_proxy_observed_at: u64,
    pub counts: UpdateCounts,
}

impl AssetMarketState {
    /// Spot quote used for evaluation: the real book when it has both
    /// sides, else a synthetic quote at the proxy price.
    pub fn effective_spot(&self) -> Option<(BookQuote, bool)> {
        if self.spot.has_two_sides() {
            return Some((self.spot, false));
        }
        if self.spot_proxy > 0.0 {
            return Some((
                BookQuote::new(self.spot_proxy, self.spot_proxy, self.spot_proxy_observed_at),
                true,
            ));
        }
        None
    }
}

/// Store of per-asset market state with per-asset locking
#[derive(Debug, Default)]
pub struct MarketStateStore {
    assets: RwLock<HashMap<String, Arc<RwLock<AssetMarketState>>>>,
}

impl MarketStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create the state slot for an asset if missing
    pub async fn ensure(&self, asset: &str) {
        let mut assets = self.assets.write().await;
        assets
            .entry(asset.to_string())
            .or_insert_with(|| Arc::new(RwLock::new(AssetMarketState::default())));
    }

    /// Drop an asset's state entirely
    pub async fn remove(&self, asset: &str) {
        let mut assets = self.assets.write().await;
        assets.remove(asset);
    }

    /// Currently tracked assets, sorted for stable iteration
    pub async fn tracked(&self) -> Vec<String> {
        let assets = self.assets.read().await;
        let mut keys: Vec<String> = assets.keys().cloned().collect();
        keys.sort();
        keys
    }

    async fn entry(&self, asset: &str) -> Arc<RwLock<AssetMarketState>> {
        {
            let assets = self.assets.read().await;
            if let Some(slot) = assets.get(asset) {
                return Arc::clone(slot);
            }
        }
        let mut assets = self.assets.write().await;
        Arc::clone(
            assets
                .entry(asset.to_string())
                .or_insert_with(|| Arc::new(RwLock::new(AssetMarketState::default()))),
        )
    }

    /// Apply a book update (last write wins per (asset, kind))
    pub async fn apply_book(&self, asset: &str, kind: MarketKind, quote: BookQuote) {
        let slot = self.entry(asset).await;
        let mut state = slot.write().await;
        match kind {
            MarketKind::Spot => {
                state.spot = quote;
                state.counts.spot += 1;
            }
            MarketKind::Perp => {
                state.perp = quote;
                state.counts.perp += 1;
            }
        }
    }

    /// Apply a mark/context update
    pub async fn apply_context(
        &self,
        asset: &str,
        mark: Option<f64>,
        spot_proxy: Option<f64>,
        funding: Option<f64>,
        observed_at: u64,
    ) {
        let slot = self.entry(asset).await;
        let mut state = slot.write().await;
        if let Some(mark) = mark {
            if mark > 0.0 {
                state.mark_price = mark;
                state.mark_observed_at = observed_at;
                state.counts.mark += 1;
            }
        }
        if let Some(proxy) = spot_proxy {
            if proxy > 0.0 {
                state.spot_proxy = proxy;
                state.spot_proxy_observed_at = observed_at;
            }
        }
        if let Some(funding) = funding {
            state.funding_rate = funding;
        }
    }

    /// Cloned snapshot of one asset's state; None if untracked
    pub async fn snapshot(&self, asset: &str) -> Option<AssetMarketState> {
        let slot = {
            let assets = self.assets.read().await;
            assets.get(asset).map(Arc::clone)?
        };
        let state = slot.read().await;
        Some(state.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_book_quote_liquidity() {
        assert!(BookQuote::new(100.0, 101.0, 0).is_liquid());
        assert!(!BookQuote::new(0.0, 101.0, 0).is_liquid(), "no bid");
        assert!(!BookQuote::new(100.0, 0.0, 0).is_liquid(), "no ask");
        assert!(!BookQuote::new(101.0, 100.0, 0).is_liquid(), "crossed");
        assert!(!BookQuote::new(100.0, 100.0, 0).is_liquid(), "locked");
    }

    #[test]
    fn test_spread_bps() {
        let quote = BookQuote::new(100.0, 101.0, 0);
        assert!((quote.spread_bps().unwrap() - 100.0).abs() < 1e-9);
        assert!(BookQuote::new(0.0, 101.0, 0).spread_bps().is_none());
    }

    #[tokio::test]
    async fn test_apply_book_and_counts() {
        let store = MarketStateStore::new();
        store.ensure("BTC").await;

        store
            .apply_book("BTC", MarketKind::Spot, BookQuote::new(100.0, 101.0, 1))
            .await;
        store
            .apply_book("BTC", MarketKind::Spot, BookQuote::new(100.5, 101.5, 2))
            .await;
        store
            .apply_book("BTC", MarketKind::Perp, BookQuote::new(99.0, 102.0, 2))
            .await;

        let state = store.snapshot("BTC").await.unwrap();
        assert_eq!(state.spot.best_bid, 100.5, "last write wins");
        assert_eq!(state.counts.spot, 2);
        assert_eq!(state.counts.perp, 1);
        assert_eq!(state.counts.mark, 0);
    }

    #[tokio::test]
    async fn test_apply_context_ignores_non_positive_mark() {
        let store = MarketStateStore::new();
        store
            .apply_context("BTC", Some(0.0), None, None, 1)
            .await;
        let state = store.snapshot("BTC").await.unwrap();
        assert_eq!(state.mark_price, 0.0);
        assert_eq!(state.counts.mark, 0);

        store
            .apply_context("BTC", Some(96500.0), Some(96499.5), Some(0.0001), 2)
            .await;
        let state = store.snapshot("BTC").await.unwrap();
        assert_eq!(state.mark_price, 96500.0);
        assert_eq!(state.spot_proxy, 96499.5);
        assert_eq!(state.funding_rate, 0.0001);
        assert_eq!(state.counts.mark, 1);
    }

    #[tokio::test]
    async fn test_effective_spot_prefers_real_book() {
        let store = MarketStateStore::new();
        store
            .apply_context("BTC", Some(96500.0), Some(96499.5), None, 1)
            .await;
        let state = store.snapshot("BTC").await.unwrap();
        let (quote, proxied) = state.effective_spot().unwrap();
        assert!(proxied);
        assert_eq!(quote.best_bid, 96499.5);
        assert_eq!(quote.best_ask, 96499.5);

        store
            .apply_book("BTC", MarketKind::Spot, BookQuote::new(96490.0, 96495.0, 2))
            .await;
        let state = store.snapshot("BTC").await.unwrap();
        let (quote, proxied) = state.effective_spot().unwrap();
        assert!(!proxied);
        assert_eq!(quote.best_bid, 96490.0);
    }

    #[tokio::test]
    async fn test_remove_and_tracked() {
        let store = MarketStateStore::new();
        store.ensure("ETH").await;
        store.ensure("BTC").await;
        assert_eq!(store.tracked().await, vec!["BTC", "ETH"]);

        store.remove("ETH").await;
        assert_eq!(store.tracked().await, vec!["BTC"]);
        assert!(store.snapshot("ETH").await.is_none());
    }
}
