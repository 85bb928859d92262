//! Feed connection manager
//!
//! Owns one long-lived market-context connection plus one independent book
//! connection per tracked asset. Tracking an asset while running spawns its
//! connection and resubscribes the context channel without disturbing other
//! assets; untracking cancels only that asset's loop. `close()` cancels
//! every loop and watchdog before returning.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::adapters::errors::ExchangeResult;
use crate::config::{FeedSettings, Settings};
use crate::core::channels::{ChannelBundle, FeedEvent};
use crate::core::feed_health::FeedHealthTracker;

use super::config::VenueEndpoints;
use super::connection::{BookConnection, ContextConnection, CtxCommand};
use super::resolve::{build_index_table, SpotCoinResolution};
use super::rest::InfoClient;

/// How long `close()` waits for a loop to exit before aborting it
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

// =============================================================================
// Operational counters
// =============================================================================

/// Connection-lifecycle counters exposed for operational visibility
#[derive(Debug, Default)]
pub struct FeedCounters {
    ctx_connects: AtomicU64,
    subscribes: AtomicU64,
    idle_timeouts: AtomicU64,
    book_connects: Mutex<HashMap<String, u64>>,
}

/// Point-in-time view of the connection counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconnectSnapshot {
    pub context: u64,
    pub books: HashMap<String, u64>,
    pub subscribes: u64,
    pub idle_timeouts: u64,
}

impl FeedCounters {
    pub fn record_ctx_connect(&self) {
        self.ctx_connects.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_book_connect(&self, asset: &str) {
        let mut books = self.book_connects.lock().expect("counters lock poisoned");
        *books.entry(asset.to_string()).or_insert(0) += 1;
    }

    pub fn record_subscribe(&self) {
        self.subscribes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_idle_timeout(&self) {
        self.idle_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ReconnectSnapshot {
        let books = self
            .book_connects
            .lock()
            .expect("counters lock poisoned")
            .clone();
        ReconnectSnapshot {
            context: self.ctx_connects.load(Ordering::Relaxed),
            books,
            subscribes: self.subscribes.load(Ordering::Relaxed),
            idle_timeouts: self.idle_timeouts.load(Ordering::Relaxed),
        }
    }
}

// =============================================================================
// Manager
// =============================================================================

struct BookHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

struct CtxHandle {
    cmd_tx: mpsc::Sender<CtxCommand>,
    task: JoinHandle<()>,
}

/// Owner of all feed connections for one venue pair
pub struct FeedManager {
    endpoints: VenueEndpoints,
    feed: FeedSettings,
    quote_asset: String,
    health: Arc<FeedHealthTracker>,
    counters: Arc<FeedCounters>,
    event_tx: mpsc::Sender<FeedEvent>,
    events_rx: Option<mpsc::Receiver<FeedEvent>>,
    cancel: CancellationToken,
    info: InfoClient,
    index_table: HashMap<String, String>,
    tracked: HashSet<String>,
    books: HashMap<String, BookHandle>,
    ctx: Option<CtxHandle>,
    started: bool,
}

impl FeedManager {
    pub fn new(settings: &Settings, health: Arc<FeedHealthTracker>) -> Self {
        let endpoints = VenueEndpoints::from_settings(settings);
        let info = InfoClient::new(&endpoints);
        let bundle = ChannelBundle::new(settings.feed.channel_capacity);
        Self {
            endpoints,
            feed: settings.feed.clone(),
            quote_asset: settings.trading.quote_asset.clone(),
            health,
            counters: Arc::new(FeedCounters::default()),
            event_tx: bundle.feed_tx,
            events_rx: Some(bundle.feed_rx),
            cancel: CancellationToken::new(),
            info,
            index_table: HashMap::new(),
            tracked: HashSet::new(),
            books: HashMap::new(),
            ctx: None,
            started: false,
        }
    }

    /// Take the typed event receiver consumed by the engine. Can be taken
    /// exactly once.
    pub fn events(&mut self) -> Option<mpsc::Receiver<FeedEvent>> {
        self.events_rx.take()
    }

    /// REST info client (shared with the auto asset selector)
    pub fn info_client(&self) -> InfoClient {
        self.info.clone()
    }

    /// Counter snapshot: reconnects per connection kind with a per-asset
    /// books breakdown
    pub fn reconnect_counts(&self) -> ReconnectSnapshot {
        self.counters.snapshot()
    }

    /// Shared counter handle for the engine's periodic metrics log
    pub fn counters(&self) -> Arc<FeedCounters> {
        Arc::clone(&self.counters)
    }

    pub fn tracked(&self) -> Vec<String> {
        let mut assets: Vec<String> = self.tracked.iter().cloned().collect();
        assets.sort();
        assets
    }

    /// Open the market-context connection and one book connection per
    /// tracked asset.
    pub async fn start(&mut self) -> ExchangeResult<()> {
        if self.started {
            return Ok(());
        }
        self.started = true;

        // Spot index table for coin resolution; canonical-only on failure
        match self.info.fetch_spot_meta().await {
            Ok(meta) => {
                self.index_table = build_index_table(&meta);
                tracing::info!(entries = self.index_table.len(), "spot index table loaded");
            }
            Err(e) => {
                tracing::warn!(error = %e, "spot meta unavailable, using canonical coin ids only");
            }
        }

        let (cmd_tx, cmd_rx) = mpsc::channel(64);
        let ctx = ContextConnection {
            assets: self.tracked.clone(),
            endpoints: self.endpoints.clone(),
            feed: self.feed.clone(),
            cmd_rx,
            event_tx: self.event_tx.clone(),
            health: Arc::clone(&self.health),
            counters: Arc::clone(&self.counters),
            cancel: self.cancel.child_token(),
        };
        let task = tokio::spawn(ctx.run());
        self.ctx = Some(CtxHandle { cmd_tx, task });

        for asset in self.tracked.iter().cloned().collect::<Vec<_>>() {
            self.spawn_book(&asset);
        }

        tracing::info!(assets = self.books.len(), "feed manager started");
        Ok(())
    }

    /// Add assets to the tracked set. While running, spawns connections and
    /// resubscribes the context channel transparently.
    pub async fn track(&mut self, assets: &[String]) {
        for asset in assets {
            let asset = asset.to_uppercase();
            if !self.tracked.insert(asset.clone()) {
                continue;
            }
            if self.started {
                self.spawn_book(&asset);
                if let Some(ctx) = &self.ctx {
                    let _ = ctx.cmd_tx.send(CtxCommand::Track(asset.clone())).await;
                }
            }
            tracing::info!(asset = %asset, "asset tracked");
        }
    }

    /// Remove one asset: cancels its book connection and stops context
    /// forwarding for it. Other assets are untouched.
    pub async fn untrack(&mut self, asset: &str) {
        let asset = asset.to_uppercase();
        if !self.tracked.remove(&asset) {
            return;
        }
        if let Some(handle) = self.books.remove(&asset) {
            handle.cancel.cancel();
            if tokio::time::timeout(SHUTDOWN_GRACE, handle.task).await.is_err() {
                tracing::warn!(asset = %asset, "book connection did not exit in time");
            }
        }
        if let Some(ctx) = &self.ctx {
            let _ = ctx.cmd_tx.send(CtxCommand::Untrack(asset.clone())).await;
        }
        self.health.remove_asset(&asset);
        tracing::info!(asset = %asset, "asset untracked");
    }

    fn spawn_book(&mut self, asset: &str) {
        let resolution = SpotCoinResolution::new(asset, &self.quote_asset, &self.index_table);
        tracing::info!(
            asset = %asset,
            primary = %resolution.primary_coin(),
            fallback = %resolution.fallback_coin(),
            "spawning book connection"
        );
        let cancel = self.cancel.child_token();
        let conn = BookConnection {
            asset: asset.to_string(),
            perp_coin: asset.to_string(),
            resolution,
            endpoints: self.endpoints.clone(),
            feed: self.feed.clone(),
            event_tx: self.event_tx.clone(),
            health: Arc::clone(&self.health),
            counters: Arc::clone(&self.counters),
            info: self.info.clone(),
            cancel: cancel.clone(),
        };
        let task = tokio::spawn(conn.run());
        self.books.insert(asset.to_string(), BookHandle { cancel, task });
    }

    /// Cooperatively cancel every connection loop and watchdog, close the
    /// sockets, and drop the outbound client.
    pub async fn close(&mut self) -> ExchangeResult<()> {
        self.cancel.cancel();

        for (asset, handle) in self.books.drain() {
            if tokio::time::timeout(SHUTDOWN_GRACE, handle.task).await.is_err() {
                tracing::warn!(asset = %asset, "book connection did not exit in time, detaching");
            }
        }
        if let Some(ctx) = self.ctx.take() {
            drop(ctx.cmd_tx);
            if tokio::time::timeout(SHUTDOWN_GRACE, ctx.task).await.is_err() {
                tracing::warn!("context connection did not exit in time, detaching");
            }
        }

        self.started = false;
        tracing::info!("feed manager closed");
        Ok(())
    }
}

impl Drop for FeedManager {
    fn drop(&mut self) {
        // Tasks observe the token even if close() was never awaited
        self.cancel.cancel();
    }
}

// =============================================================================
// Tests
// =============================================================================
