//! Paper trading engine
//!
//! Consumes the typed feed events, maintains the market state store and feed
//! health tracker, evaluates the cross-market edge on every update, persists
//! qualifying opportunities, and runs the periodic heartbeat / feed-health /
//! validation loops. Evaluation is synchronous pure computation and runs
//! inline on the event that triggered it; it never gates message ingestion.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use crate::adapters::hyperliquid::manager::FeedCounters;
use crate::config::Settings;
use crate::core::channels::FeedEvent;
use crate::core::decision::{self, EdgeDecision, Evaluation};
use crate::core::feed_health::{FeedHealthSnapshot, FeedHealthTracker};
use crate::core::probe::MakerProbeTracker;
use crate::core::state::{current_time_ms, AssetMarketState, BookQuote, MarketStateStore};
use crate::core::validation::ValidationRecorder;
use crate::persistence::{OpportunityRow, PersistenceSink};

/// How long `shutdown()` waits for a loop before giving up on it
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

// =============================================================================
// Decision trace throttling
// =============================================================================

#[derive(Debug, Clone, Default)]
struct TraceState {
    last_ready: Option<bool>,
    last_reason: Option<&'static str>,
    last_logged_ms: u64,
}

// =============================================================================
// Engine core (shared with the background loops)
// =============================================================================

/// Shared evaluation state: everything the event loop and the background
/// loops need, behind one Arc.
pub struct EngineCore {
    settings: Settings,
    store: Arc<MarketStateStore>,
    health: Arc<FeedHealthTracker>,
    sink: Arc<dyn PersistenceSink>,
    counters: Option<Arc<FeedCounters>>,
    run_id: String,
    trace: Mutex<HashMap<String, TraceState>>,
    probes: MakerProbeTracker,
}

impl EngineCore {
    pub fn new(
        settings: Settings,
        store: Arc<MarketStateStore>,
        health: Arc<FeedHealthTracker>,
        sink: Arc<dyn PersistenceSink>,
        counters: Option<Arc<FeedCounters>>,
    ) -> Self {
        let run_id = uuid::Uuid::new_v4().to_string();
        let probes = MakerProbeTracker::new(&run_id, settings.strategy.maker_probe_max_age_ms);
        Self {
            settings,
            store,
            health,
            sink,
            counters,
            run_id,
            trace: Mutex::new(HashMap::new()),
            probes,
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn store(&self) -> &Arc<MarketStateStore> {
        &self.store
    }

    pub fn sink(&self) -> &Arc<dyn PersistenceSink> {
        &self.sink
    }

    /// Apply one feed event and evaluate the touched asset
    pub async fn apply_event(&self, event: FeedEvent) {
        match event {
            FeedEvent::Book {
                asset,
                kind,
                best_bid,
                best_ask,
                observed_at,
                had_bids,
                had_asks,
            } => {
                self.store
                    .apply_book(&asset, kind, BookQuote::new(best_bid, best_ask, observed_at))
                    .await;
                self.health.on_book_update(
                    &asset, kind, best_bid, best_ask, observed_at, had_bids, had_asks,
                );
                self.evaluate_and_record(&asset).await;
            }
            FeedEvent::Context {
                asset,
                mark,
                spot_proxy,
                funding,
                observed_at,
            } => {
                self.store
                    .apply_context(&asset, mark, spot_proxy, funding, observed_at)
                    .await;
                self.evaluate_and_record(&asset).await;
            }
        }
    }

    /// On-demand evaluation of one asset over the cached state
    pub async fn evaluate_asset(
        &self,
        asset: &str,
    ) -> Option<(Evaluation, AssetMarketState, FeedHealthSnapshot)> {
        let state = self.store.snapshot(asset).await?;
        let snapshot = self.health.snapshot(asset);
        let evaluation = decision::evaluate(
            &self.settings.trading,
            self.settings.feed_health.stale_ms,
            asset,
            &state,
            &snapshot,
            current_time_ms(),
        );
        Some((evaluation, state, snapshot))
    }

    async fn evaluate_and_record(&self, asset: &str) {
        let Some((evaluation, state, _snapshot)) = self.evaluate_asset(asset).await else {
            return;
        };

        self.trace_decision(&evaluation);

        if self.settings.strategy.maker_probe_enabled && evaluation.gates.ready {
            if let Some((spot, _)) = state.effective_spot() {
                if let Some(decision) = &evaluation.decision {
                    let rows = self.probes.observe(
                        asset,
                        decision.direction,
                        spot.best_bid,
                        spot.best_ask,
                        current_time_ms(),
                    );
                    for row in rows {
                        if let Err(e) = self.sink.upsert_maker_probe(row).await {
                            tracing::warn!(asset = %asset, error = %e, "maker probe write failed");
                        }
                    }
                }
            }
        }

        if evaluation.is_pass() {
            if let Some(decision) = &evaluation.decision {
                let row = self.opportunity_row(decision);
                if let Err(e) = self.sink.insert_opportunity(row).await {
                    tracing::warn!(asset = %asset, error = %e, "opportunity write failed");
                }
            }
        }
    }

    fn opportunity_row(&self, decision: &EdgeDecision) -> OpportunityRow {
        OpportunityRow {
            run_id: self.run_id.clone(),
            timestamp: Utc::now(),
            asset: decision.asset.clone(),
            direction: decision.direction.as_str().to_string(),
            spot_price: decision.spot_price,
            perp_price: decision.perp_price,
            mark_price: decision.mark_price,
            notional: decision.notional,
            spread_gross: decision.spread_gross,
            edge_bps: decision.edge_bps,
            fee_estimated: decision.fee_spot + decision.fee_perp,
            slippage_estimated: decision.slippage_cost,
            funding_estimated: decision.funding_cost,
            pnl_net_estimated: decision.pnl_net_est,
        }
    }

    /// Rate-limited structured decision trace: logs on readiness transition,
    /// reason change, or the minimum interval, never per tick.
    fn trace_decision(&self, evaluation: &Evaluation) {
        let now = current_time_ms();
        let (_, reason) = evaluation.outcome();
        let reason_str = reason.map(|r| r.as_str());
        let ready = evaluation.gates.ready;

        let (transition, interval_elapsed) = {
            let mut traces = self.trace.lock().expect("trace lock poisoned");
            let entry = traces.entry(evaluation.asset.clone()).or_default();
            let transition =
                entry.last_ready != Some(ready) || entry.last_reason != reason_str;
            let interval_elapsed = now.saturating_sub(entry.last_logged_ms)
                >= self.settings.strategy.trace_every_seconds * 1_000;
            if transition || interval_elapsed {
                entry.last_ready = Some(ready);
                entry.last_reason = reason_str;
                entry.last_logged_ms = now;
            }
            (transition, interval_elapsed)
        };

        if !transition && !interval_elapsed {
            return;
        }

        let (edge_bps, threshold_bps, pnl) = evaluation
            .decision
            .as_ref()
            .map(|d| (d.edge_bps, d.effective_threshold_bps, d.pnl_net_est))
            .unwrap_or((0.0, 0.0, 0.0));

        if transition {
            tracing::info!(
                asset = %evaluation.asset,
                ready = ready,
                reason = reason_str.unwrap_or("none"),
                edge_bps = edge_bps,
                effective_threshold_bps = threshold_bps,
                pnl_net_est = pnl,
                used_spot_proxy = evaluation.gates.used_spot_proxy,
                "decision state changed"
            );
        } else if self.settings.strategy.would_trade {
            tracing::info!(
                asset = %evaluation.asset,
                ready = ready,
                reason = reason_str.unwrap_or("none"),
                edge_bps = edge_bps,
                effective_threshold_bps = threshold_bps,
                pnl_net_est = pnl,
                "decision trace"
            );
        } else {
            tracing::debug!(
                asset = %evaluation.asset,
                ready = ready,
                reason = reason_str.unwrap_or("none"),
                edge_bps = edge_bps,
                "decision trace"
            );
        }
    }

    /// Drop per-asset engine state when an asset is untracked
    pub async fn remove_asset(&self, asset: &str) {
        self.store.remove(asset).await;
        self.health.remove_asset(asset);
        self.probes.remove_asset(asset);
        self.trace.lock().expect("trace lock poisoned").remove(asset);
    }

    async fn log_heartbeat(&self) {
        for asset in self.store.tracked().await {
            let Some(state) = self.store.snapshot(&asset).await else {
                continue;
            };
            tracing::info!(
                asset = %asset,
                spot_seen = state.counts.spot,
                perp_seen = state.counts.perp,
                mark_seen = state.counts.mark,
                spot_ok = state.spot.is_liquid(),
                perp_ok = state.perp.is_liquid(),
                mark_ok = state.mark_price > 0.0,
                "heartbeat"
            );
        }
    }

    async fn log_feed_health(&self) {
        for asset in self.store.tracked().await {
            let snap = self.health.snapshot(&asset);
            tracing::info!(
                asset = %asset,
                spot_age_ms = snap.spot_age_ms,
                perp_age_ms = snap.perp_age_ms,
                stale = snap.stale,
                crossed = snap.crossed,
                out_of_sync = snap.out_of_sync,
                ws_msgs_total = snap.ws_msgs_total,
                duplicates = snap.duplicate_events,
                heartbeat_only = snap.heartbeat_only,
                incomplete = snap.book_incomplete,
                "feed health"
            );
        }
        if let Some(counters) = &self.counters {
            let snap = counters.snapshot();
            tracing::info!(
                context_connects = snap.context,
                book_connects = ?snap.books,
                subscribes = snap.subscribes,
                idle_timeouts = snap.idle_timeouts,
                "connection counters"
            );
        }
    }
}

// =============================================================================
// Engine task orchestration
// =============================================================================

/// Owner of the engine event loop and its background loops
pub struct PaperEngine {
    core: Arc<EngineCore>,
    shutdown_tx: broadcast::Sender<()>,
    tasks: Vec<JoinHandle<()>>,
    recorder: Option<Arc<ValidationRecorder>>,
}

impl PaperEngine {
    pub fn new(core: Arc<EngineCore>) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            core,
            shutdown_tx,
            tasks: Vec::new(),
            recorder: None,
        }
    }

    pub fn core(&self) -> Arc<EngineCore> {
        Arc::clone(&self.core)
    }

    /// Spawn the event loop and the periodic background loops
    pub fn start(&mut self, mut events: mpsc::Receiver<FeedEvent>) {
        let core = Arc::clone(&self.core);
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        self.tasks.push(tokio::spawn(async move {
            tracing::info!("engine event loop started");
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    event = events.recv() => match event {
                        Some(event) => core.apply_event(event).await,
                        None => {
                            tracing::info!("feed event channel closed");
                            break;
                        }
                    }
                }
            }
            tracing::info!("engine event loop stopped");
        }));

        let core = Arc::clone(&self.core);
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let heartbeat_interval =
            Duration::from_secs(self.core.settings.strategy.heartbeat_interval_sec.max(1));
        self.tasks.push(tokio::spawn(async move {
            let mut interval = tokio::time::interval(heartbeat_interval);
            interval.tick().await; // skip the immediate tick
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    _ = interval.tick() => core.log_heartbeat().await,
                }
            }
        }));

        let core = Arc::clone(&self.core);
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let health_interval =
            Duration::from_secs(self.core.settings.feed_health.log_interval_sec.max(1));
        self.tasks.push(tokio::spawn(async move {
            let mut interval = tokio::time::interval(health_interval);
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    _ = interval.tick() => core.log_feed_health().await,
                }
            }
        }));

        if self.core.settings.validation.enabled {
            let recorder = Arc::new(ValidationRecorder::new(
                Arc::clone(&self.core),
                self.core.settings.validation.clone(),
            ));
            self.recorder = Some(Arc::clone(&recorder));
            let shutdown_rx = self.shutdown_tx.subscribe();
            self.tasks.push(tokio::spawn(async move {
                recorder.run(shutdown_rx).await;
            }));
            tracing::info!(
                sample_interval_ms = self.core.settings.validation.sample_interval_ms,
                stats_log_interval_sec = self.core.settings.validation.stats_log_interval_sec,
                flush_every_n = self.core.settings.validation.flush_every_n,
                "validation recorder enabled"
            );
        } else {
            tracing::info!("validation recorder disabled");
        }
    }

    /// Cancel every loop and flush the validation recorder before returning
    pub async fn shutdown(&mut self) {
        let _ = self.shutdown_tx.send(());
        for task in self.tasks.drain(..) {
            if tokio::time::timeout(SHUTDOWN_GRACE, task).await.is_err() {
                tracing::warn!("engine task did not stop in time");
            }
        }
        // The recorder flushes on loop exit; a second flush here is a no-op
        // unless the loop was aborted mid-batch.
        if let Some(recorder) = self.recorder.take() {
            recorder.flush().await;
        }
        tracing::info!("engine stopped");
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::state::MarketKind;
    use crate::persistence::MemorySink;

    fn test_settings() -> Settings {
        let mut settings = Settings::default();
        settings.trading.min_position_size = 100.0;
        settings.trading.min_edge_threshold = 1.0;
        settings
    }

    fn core_with_sink(settings: Settings) -> (Arc<EngineCore>, Arc<MemorySink>) {
        let store = Arc::new(MarketStateStore::new());
        let health = Arc::new(FeedHealthTracker::new(settings.feed_health.clone()));
        let sink = Arc::new(MemorySink::new());
        let core = Arc::new(EngineCore::new(
            settings,
            store,
            health,
            Arc::clone(&sink) as Arc<dyn PersistenceSink>,
            None,
        ));
        (core, sink)
    }

    fn book_event(asset: &str, kind: MarketKind, bid: f64, ask: f64) -> FeedEvent {
        FeedEvent::Book {
            asset: asset.to_string(),
            kind,
            best_bid: bid,
            best_ask: ask,
            observed_at: current_time_ms(),
            had_bids: bid > 0.0,
            had_asks: ask > 0.0,
        }
    }

    fn context_event(asset: &str, mark: f64) -> FeedEvent {
        FeedEvent::Context {
            asset: asset.to_string(),
            mark: Some(mark),
            spot_proxy: None,
            funding: None,
            observed_at: current_time_ms(),
        }
    }

    #[tokio::test]
    async fn test_pass_scenario_persists_opportunity() {
        let (core, sink) = core_with_sink(test_settings());

        core.apply_event(book_event("BTC", MarketKind::Spot, 50_000.0, 50_010.0))
            .await;
        core.apply_event(book_event("BTC", MarketKind::Perp, 50_100.0, 50_120.0))
            .await;
        core.apply_event(context_event("BTC", 50_050.0)).await;

        let opportunities = sink.opportunities();
        assert!(!opportunities.is_empty(), "PASS decision should persist");
        let row = &opportunities[0];
        assert_eq!(row.asset, "BTC");
        assert_eq!(row.direction, "spot_long");
        assert!(row.pnl_net_estimated > 0.0);
        // Round-trip: stored spread reproduces from stored prices
        let recomputed = (row.perp_price - row.spot_price) / row.spot_price;
        assert!(((recomputed - row.spread_gross) / row.spread_gross).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_negative_spread_not_persisted() {
        let (core, sink) = core_with_sink(test_settings());

        core.apply_event(book_event("BTC", MarketKind::Spot, 50_000.0, 50_010.0))
            .await;
        core.apply_event(book_event("BTC", MarketKind::Perp, 50_000.0, 50_120.0))
            .await;
        core.apply_event(context_event("BTC", 50_050.0)).await;

        assert!(sink.opportunities().is_empty(), "PNL_NONPOS never persists");
    }

    #[tokio::test]
    async fn test_evaluate_asset_reports_gate_reason() {
        let (core, _sink) = core_with_sink(test_settings());
        core.apply_event(book_event("BTC", MarketKind::Spot, 50_000.0, 50_010.0))
            .await;
        core.apply_event(book_event("BTC", MarketKind::Perp, 50_100.0, 50_120.0))
            .await;

        let (evaluation, _, _) = core.evaluate_asset("BTC").await.unwrap();
        let (outcome, reason) = evaluation.outcome();
        assert_eq!(outcome, "SKIP");
        assert_eq!(reason.map(|r| r.as_str()), Some("SKIP_NO_MARK"));
    }

    #[tokio::test]
    async fn test_maker_probe_rows_written_when_enabled() {
        let mut settings = test_settings();
        settings.strategy.maker_probe_enabled = true;
        let (core, sink) = core_with_sink(settings);

        core.apply_event(book_event("BTC", MarketKind::Spot, 50_000.0, 50_010.0))
            .await;
        core.apply_event(book_event("BTC", MarketKind::Perp, 50_100.0, 50_120.0))
            .await;
        core.apply_event(context_event("BTC", 50_050.0)).await;
        // Second evaluation completes the first probe
        core.apply_event(book_event("BTC", MarketKind::Spot, 50_001.0, 50_011.0))
            .await;

        let probes = sink.probes();
        assert!(!probes.is_empty());
        assert!(probes.iter().any(|p| p.delta_ms >= 0), "one probe completed");
    }

    #[tokio::test]
    async fn test_remove_asset_clears_state() {
        let (core, _sink) = core_with_sink(test_settings());
        core.apply_event(book_event("BTC", MarketKind::Spot, 100.0, 101.0))
            .await;
        core.remove_asset("BTC").await;
        assert!(core.evaluate_asset("BTC").await.is_none());
    }

    #[tokio::test]
    async fn test_engine_start_shutdown() {
        let (core, sink) = core_with_sink(test_settings());
        let mut engine = PaperEngine::new(core);
        let (tx, rx) = mpsc::channel(16);
        engine.start(rx);

        tx.send(book_event("BTC", MarketKind::Spot, 50_000.0, 50_010.0))
            .await
            .unwrap();
        tx.send(book_event("BTC", MarketKind::Perp, 50_100.0, 50_120.0))
            .await
            .unwrap();
        tx.send(context_event("BTC", 50_050.0)).await.unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        engine.shutdown().await;

        assert!(!sink.opportunities().is_empty());
    }
}
