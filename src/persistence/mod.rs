//! Narrow persistence sink interface
//!
//! The core never depends on a specific storage engine: any durable store
//! satisfying `insert_opportunity`, `insert_validation_batch`, and
//! `upsert_maker_probe` is sufficient. All writes are batched and funneled
//! through the validation recorder / opportunity call sites.

mod rest;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use rest::RestSink;

// =============================================================================
// Errors
// =============================================================================

/// Errors surfaced by a persistence sink. Never fatal to ingestion: callers
/// log and retain buffered rows for the next flush attempt.
#[derive(Debug, Error)]
pub enum SinkError {
    #[error("Sink unavailable: {0}")]
    Unavailable(String),

    #[error("Sink rejected rows: {0}")]
    Rejected(String),

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),
}

pub type SinkResult<T> = std::result::Result<T, SinkError>;

// =============================================================================
// Row types
// =============================================================================

/// A persisted qualifying opportunity (PASS decisions only)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpportunityRow {
    pub run_id: String,
    pub timestamp: DateTime<Utc>,
    pub asset: String,
    pub direction: String,
    pub spot_price: f64,
    pub perp_price: f64,
    pub mark_price: f64,
    pub notional: f64,
    pub spread_gross: f64,
    pub edge_bps: f64,
    pub fee_estimated: f64,
    pub slippage_estimated: f64,
    pub funding_estimated: f64,
    pub pnl_net_estimated: f64,
}

/// Raw quote/age/flag state at a sample timestamp
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionSnapshotRow {
    pub run_id: String,
    pub timestamp: DateTime<Utc>,
    pub asset: String,
    pub spot_bid: f64,
    pub spot_ask: f64,
    pub perp_bid: f64,
    pub perp_ask: f64,
    pub mark_price: f64,
    pub spot_age_ms: f64,
    pub perp_age_ms: f64,
    pub spot_incomplete: bool,
    pub perp_incomplete: bool,
    pub stale: bool,
    pub crossed: bool,
    pub out_of_sync: bool,
}

/// Gate outcome paired with a snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionOutcomeRow {
    pub run_id: String,
    pub timestamp: DateTime<Utc>,
    pub asset: String,
    /// "WOULD_TRADE" or "SKIP"
    pub outcome: String,
    pub reason: Option<String>,
    pub edge_bps: f64,
    pub effective_threshold_bps: f64,
    pub pnl_net_est: f64,
}

/// Two-phase maker-fill diagnostic row. Inserted open with the next-side
/// fields absent and a sentinel delta, then updated once a qualifying later
/// observation arrives.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MakerProbeRow {
    pub run_id: String,
    pub asset: String,
    pub direction: String,
    pub quote_bid: f64,
    pub quote_ask: f64,
    pub next_bid: Option<f64>,
    pub next_ask: Option<f64>,
    /// Milliseconds between the paired observations; -1 while open
    pub delta_ms: i64,
    pub opened_at: DateTime<Utc>,
    /// Resting-order fill estimate; None while open
    pub filled: Option<bool>,
}

// =============================================================================
// Sink trait
// =============================================================================

/// Narrow persistence interface satisfied by any durable store
#[async_trait]
pub trait PersistenceSink: Send + Sync {
    async fn insert_opportunity(&self, row: OpportunityRow) -> SinkResult<()>;

    async fn insert_validation_batch(
        &self,
        snapshots: &[DecisionSnapshotRow],
        outcomes: &[DecisionOutcomeRow],
    ) -> SinkResult<()>;

    async fn upsert_maker_probe(&self, row: MakerProbeRow) -> SinkResult<()>;
}

// =============================================================================
// In-memory sink (tests and disabled-persistence runs)
// =============================================================================

/// Sink that retains every row in memory; used by tests and as the default
/// when no external sink is configured.
#[derive(Debug, Default)]
pub struct MemorySink {
    inner: std::sync::Mutex<MemorySinkInner>,
}

#[derive(Debug, Default)]
struct MemorySinkInner {
    opportunities: Vec<OpportunityRow>,
    snapshots: Vec<DecisionSnapshotRow>,
    outcomes: Vec<DecisionOutcomeRow>,
    probes: Vec<MakerProbeRow>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn opportunities(&self) -> Vec<OpportunityRow> {
        self.inner.lock().expect("sink lock poisoned").opportunities.clone()
    }

    pub fn snapshots(&self) -> Vec<DecisionSnapshotRow> {
        self.inner.lock().expect("sink lock poisoned").snapshots.clone()
    }

    pub fn outcomes(&self) -> Vec<DecisionOutcomeRow> {
        self.inner.lock().expect("sink lock poisoned").outcomes.clone()
    }

    pub fn probes(&self) -> Vec<MakerProbeRow> {
        self.inner.lock().expect("sink lock poisoned").probes.clone()
    }
}

#[async_trait]
impl PersistenceSink for MemorySink {
    async fn insert_opportunity(&self, row: OpportunityRow) -> SinkResult<()> {
        self.inner
            .lock()
            .expect("sink lock poisoned")
            .opportunities
            .push(row);
        Ok(())
    }

    async fn insert_validation_batch(
        &self,
        snapshots: &[DecisionSnapshotRow],
        outcomes: &[DecisionOutcomeRow],
    ) -> SinkResult<()> {
        let mut inner = self.inner.lock().expect("sink lock poisoned");
        inner.snapshots.extend_from_slice(snapshots);
        inner.outcomes.extend_from_slice(outcomes);
        Ok(())
    }

    async fn upsert_maker_probe(&self, row: MakerProbeRow) -> SinkResult<()> {
        let mut inner = self.inner.lock().expect("sink lock poisoned");
        // Upsert: an open probe is replaced by its completed form
        if let Some(existing) = inner
            .probes
            .iter_mut()
            .find(|p| p.asset == row.asset && p.opened_at == row.opened_at)
        {
            *existing = row;
        } else {
            inner.probes.push(row);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opportunity(asset: &str) -> OpportunityRow {
        OpportunityRow {
            run_id: "run-1".to_string(),
            timestamp: Utc::now(),
            asset: asset.to_string(),
            direction: "spot_long".to_string(),
            spot_price: 100.0,
            perp_price: 101.0,
            mark_price: 100.5,
            notional: 100.0,
            spread_gross: 0.01,
            edge_bps: 100.0,
            fee_estimated: 0.15,
            slippage_estimated: 0.0,
            funding_estimated: 0.0,
            pnl_net_estimated: 0.85,
        }
    }

    #[tokio::test]
    async fn test_memory_sink_stores_rows() {
        let sink = MemorySink::new();
        sink.insert_opportunity(opportunity("BTC")).await.unwrap();
        sink.insert_opportunity(opportunity("ETH")).await.unwrap();
        assert_eq!(sink.opportunities().len(), 2);
    }

    #[tokio::test]
    async fn test_memory_sink_validation_batch() {
        let sink = MemorySink::new();
        let snapshot = DecisionSnapshotRow {
            run_id: "run-1".to_string(),
            timestamp: Utc::now(),
            asset: "BTC".to_string(),
            spot_bid: 100.0,
            spot_ask: 101.0,
            perp_bid: 100.5,
            perp_ask: 101.5,
            mark_price: 100.7,
            spot_age_ms: 10.0,
            perp_age_ms: 12.0,
            spot_incomplete: false,
            perp_incomplete: false,
            stale: false,
            crossed: false,
            out_of_sync: false,
        };
        let outcome = DecisionOutcomeRow {
            run_id: "run-1".to_string(),
            timestamp: snapshot.timestamp,
            asset: "BTC".to_string(),
            outcome: "SKIP".to_string(),
            reason: Some("SKIP_NO_MARK".to_string()),
            edge_bps: 0.0,
            effective_threshold_bps: 0.0,
            pnl_net_est: 0.0,
        };
        sink.insert_validation_batch(&[snapshot], &[outcome])
            .await
            .unwrap();
        assert_eq!(sink.snapshots().len(), 1);
        assert_eq!(sink.outcomes().len(), 1);
    }

    #[tokio::test]
    async fn test_memory_sink_probe_upsert() {
        let sink = MemorySink::new();
        let opened_at = Utc::now();
        let open = MakerProbeRow {
            run_id: "run-1".to_string(),
            asset: "BTC".to_string(),
            direction: "spot_long".to_string(),
            quote_bid: 100.0,
            quote_ask: 101.0,
            next_bid: None,
            next_ask: None,
            delta_ms: -1,
            opened_at,
            filled: None,
        };
        sink.upsert_maker_probe(open.clone()).await.unwrap();

        let completed = MakerProbeRow {
            next_bid: Some(100.5),
            next_ask: Some(101.5),
            delta_ms: 250,
            filled: Some(true),
            ..open
        };
        sink.upsert_maker_probe(completed).await.unwrap();

        let probes = sink.probes();
        assert_eq!(probes.len(), 1, "open probe replaced, not duplicated");
        assert_eq!(probes[0].delta_ms, 250);
        assert_eq!(probes[0].filled, Some(true));
    }
}
