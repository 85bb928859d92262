//! Validation recorder
//!
//! Periodically snapshots every tracked asset's health and gate outcome into
//! DecisionSnapshot/DecisionOutcome pairs, buffers them, and flushes in
//! batches through the persistence sink. A sink failure keeps the buffered
//! rows for the next flush attempt; a shutdown forces a final flush so no
//! sampled rows are lost on a clean stop.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::broadcast;

use crate::config::ValidationSettings;
use crate::core::engine::EngineCore;
use crate::persistence::{DecisionOutcomeRow, DecisionSnapshotRow};

#[derive(Debug, Default)]
struct Buffer {
    snapshots: Vec<DecisionSnapshotRow>,
    outcomes: Vec<DecisionOutcomeRow>,
}

#[derive(Debug, Default)]
struct Stats {
    would_trade: u64,
    skip: u64,
    reasons: HashMap<&'static str, u64>,
}

/// Periodic sampler writing the validation trace
pub struct ValidationRecorder {
    core: Arc<EngineCore>,
    cfg: ValidationSettings,
    buffer: tokio::sync::Mutex<Buffer>,
    stats: std::sync::Mutex<Stats>,
}

impl ValidationRecorder {
    pub fn new(core: Arc<EngineCore>, cfg: ValidationSettings) -> Self {
        Self {
            core,
            cfg,
            buffer: tokio::sync::Mutex::new(Buffer::default()),
            stats: std::sync::Mutex::new(Stats::default()),
        }
    }

    /// Sampling loop; exits (after a forced flush) on shutdown
    pub async fn run(self: Arc<Self>, mut shutdown_rx: broadcast::Receiver<()>) {
        let mut sample =
            tokio::time::interval(Duration::from_millis(self.cfg.sample_interval_ms.max(1)));
        let mut stats =
            tokio::time::interval(Duration::from_secs(self.cfg.stats_log_interval_sec.max(1)));
        sample.tick().await;
        stats.tick().await;

        tracing::info!("validation recorder started");
        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => break,
                _ = sample.tick() => self.sample_all().await,
                _ = stats.tick() => self.log_stats(),
            }
        }
        self.flush().await;
        tracing::info!("validation recorder stopped");
    }

    async fn sample_all(&self) {
        for asset in self.core.store().tracked().await {
            self.sample(&asset).await;
        }
    }

    async fn sample(&self, asset: &str) {
        let Some((evaluation, state, health)) = self.core.evaluate_asset(asset).await else {
            return;
        };
        let now = Utc::now();
        let run_id = self.core.run_id().to_string();

        let snapshot = DecisionSnapshotRow {
            run_id: run_id.clone(),
            timestamp: now,
            asset: asset.to_string(),
            spot_bid: state.spot.best_bid,
            spot_ask: state.spot.best_ask,
            perp_bid: state.perp.best_bid,
            perp_ask: state.perp.best_ask,
            mark_price: state.mark_price,
            spot_age_ms: health.spot_age_ms,
            perp_age_ms: health.perp_age_ms,
            spot_incomplete: health.spot_incomplete,
            perp_incomplete: health.perp_incomplete,
            stale: health.stale,
            crossed: health.crossed,
            out_of_sync: health.out_of_sync,
        };

        let (outcome, reason) = evaluation.outcome();
        let (edge_bps, threshold_bps, pnl) = evaluation
            .decision
            .as_ref()
            .map(|d| (d.edge_bps, d.effective_threshold_bps, d.pnl_net_est))
            .unwrap_or((0.0, 0.0, 0.0));
        let outcome_row = DecisionOutcomeRow {
            run_id,
            timestamp: now,
            asset: asset.to_string(),
            outcome: outcome.to_string(),
            reason: reason.map(|r| r.as_str().to_string()),
            edge_bps,
            effective_threshold_bps: threshold_bps,
            pnl_net_est: pnl,
        };

        {
            let mut stats = self.stats.lock().expect("stats lock poisoned");
            if outcome == "WOULD_TRADE" {
                stats.would_trade += 1;
            } else {
                stats.skip += 1;
                if let Some(reason) = reason {
                    *stats.reasons.entry(reason.as_str()).or_insert(0) += 1;
                }
            }
        }

        let should_flush = {
            let mut buffer = self.buffer.lock().await;
            buffer.snapshots.push(snapshot);
            buffer.outcomes.push(outcome_row);
            buffer.snapshots.len() >= self.cfg.flush_every_n
        };
        if should_flush {
            self.flush().await;
        }
    }

    /// Write the buffered rows through the sink. On failure the rows are
    /// retained for the next attempt.
    pub async fn flush(&self) {
        let mut buffer = self.buffer.lock().await;
        if buffer.snapshots.is_empty() && buffer.outcomes.is_empty() {
            return;
        }
        let snapshots = std::mem::take(&mut buffer.snapshots);
        let outcomes = std::mem::take(&mut buffer.outcomes);
        drop(buffer);

        match self
            .core
            .sink()
            .insert_validation_batch(&snapshots, &outcomes)
            .await
        {
            Ok(()) => {
                tracing::debug!(rows = snapshots.len(), "validation batch flushed");
            }
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    rows = snapshots.len(),
                    "validation flush failed, retaining rows"
                );
                let mut buffer = self.buffer.lock().await;
                let mut retained = snapshots;
                retained.append(&mut buffer.snapshots);
                buffer.snapshots = retained;
                let mut retained = outcomes;
                retained.append(&mut buffer.outcomes);
                buffer.outcomes = retained;
            }
        }
    }

    /// Periodic summary: top-3 skip reasons plus would-trade vs skip counts
    fn log_stats(&self) {
        let stats = self.stats.lock().expect("stats lock poisoned");
        let mut reasons: Vec<(&str, u64)> =
            stats.reasons.iter().map(|(k, v)| (*k, *v)).collect();
        reasons.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(b.0)));
        reasons.truncate(3);
        tracing::info!(
            would_trade = stats.would_trade,
            skip = stats.skip,
            top_reasons = ?reasons,
            "validation stats"
        );
    }
}
