//! Supervised WebSocket connection loops
//!
//! Each connection runs an independent state machine:
//! Connecting → Subscribing → Streaming → (on error) Backoff → Connecting,
//! terminating only on cancellation. Book connections additionally run an
//! idle watchdog: a silent stream is force-closed to trigger a clean
//! reconnect instead of waiting on a half-open socket.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::time::{sleep, sleep_until, timeout, Instant};
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

use crate::adapters::shared::websocket::TlsWebSocketStream;
use crate::adapters::shared::{connect_tls, BackoffConfig, BackoffPolicy};
use crate::config::FeedSettings;
use crate::core::channels::FeedEvent;
use crate::core::feed_health::FeedHealthTracker;
use crate::core::state::MarketKind;

use super::config::VenueEndpoints;
use super::manager::FeedCounters;
use super::resolve::{ResolvedVia, SpotCoinResolution};
use super::rest::InfoClient;
use super::wire::{self, VenueMessage};

type WsWriter = SplitSink<TlsWebSocketStream, Message>;
type WsReader = SplitStream<TlsWebSocketStream>;

fn current_time_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Why a streaming phase ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StreamExit {
    /// Stop signal; leave the supervision loop
    Cancelled,
    /// Transport error or server close; back off then reconnect
    Disconnected,
    /// Watchdog fired; reconnect immediately without extra delay
    IdleTimeout,
    /// Event consumer dropped; nothing left to feed
    ConsumerGone,
}

/// Tracks which subscriptions were already sent on the current connection
/// lifetime so resubscribing is idempotent.
#[derive(Debug, Default)]
pub(crate) struct SubscriptionLedger {
    sent: HashSet<String>,
}

impl SubscriptionLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true exactly once per coin per connection lifetime
    pub fn should_send(&mut self, coin: &str) -> bool {
        self.sent.insert(coin.to_string())
    }
}

async fn send_subscribe(
    writer: &mut WsWriter,
    ledger: &mut SubscriptionLedger,
    counters: &FeedCounters,
    sub_type: &str,
    coin: Option<&str>,
) -> Result<bool, ()> {
    let key = match coin {
        Some(c) => format!("{}:{}", sub_type, c),
        None => sub_type.to_string(),
    };
    if !ledger.should_send(&key) {
        return Ok(false);
    }
    let frame = wire::subscribe_frame(sub_type, coin);
    tracing::info!(subscription = %frame, "sending subscribe");
    writer
        .send(Message::Text(frame))
        .await
        .map_err(|_| ())?;
    counters.record_subscribe();
    Ok(true)
}

// =============================================================================
// Book connection (one per tracked asset)
// =============================================================================

/// Supervised per-asset order-book connection
pub(crate) struct BookConnection {
    pub asset: String,
    pub perp_coin: String,
    pub resolution: SpotCoinResolution,
    pub endpoints: VenueEndpoints,
    pub feed: FeedSettings,
    pub event_tx: mpsc::Sender<FeedEvent>,
    pub health: Arc<FeedHealthTracker>,
    pub counters: Arc<FeedCounters>,
    pub info: InfoClient,
    pub cancel: CancellationToken,
}

impl BookConnection {
    pub async fn run(mut self) {
        tracing::info!(asset = %self.asset, "book connection loop started");
        self.bootstrap_snapshots().await;

        let mut backoff = BackoffPolicy::new(BackoffConfig {
            base_ms: self.feed.backoff_base_ms,
            cap_ms: self.feed.backoff_cap_ms,
        });

        loop {
            if self.cancel.is_cancelled() {
                break;
            }

            // Connecting
            let connect = tokio::select! {
                _ = self.cancel.cancelled() => break,
                r = connect_tls(&self.endpoints.websocket_url) => r,
            };
            let ws = match connect {
                Ok(ws) => ws,
                Err(e) => {
                    let delay = backoff.next_delay();
                    tracing::warn!(
                        asset = %self.asset,
                        error = %e,
                        delay_ms = delay.as_millis() as u64,
                        "book connection failed, backing off"
                    );
                    tokio::select! {
                        _ = self.cancel.cancelled() => break,
                        _ = sleep(delay) => {}
                    }
                    continue;
                }
            };
            self.counters.record_book_connect(&self.asset);

            match self.stream(ws, &mut backoff).await {
                StreamExit::Cancelled | StreamExit::ConsumerGone => break,
                StreamExit::IdleTimeout => continue,
                StreamExit::Disconnected => {
                    let delay = backoff.next_delay();
                    tracing::warn!(
                        asset = %self.asset,
                        delay_ms = delay.as_millis() as u64,
                        "book stream ended, backing off before reconnect"
                    );
                    tokio::select! {
                        _ = self.cancel.cancelled() => break,
                        _ = sleep(delay) => {}
                    }
                }
            }
        }
        tracing::info!(asset = %self.asset, "book connection loop stopped");
    }

    /// Seed best bid/ask from the REST snapshot endpoint before the stream
    /// confirms. Best effort; failures only log.
    async fn bootstrap_snapshots(&self) {
        let coins = [
            (self.perp_coin.clone(), MarketKind::Perp),
            (self.resolution.primary_coin().to_string(), MarketKind::Spot),
        ];
        for (coin, kind) in coins {
            match self.info.fetch_book_snapshot(&coin).await {
                Ok(snapshot) => {
                    if let Some(book) = wire::parse_book(&snapshot) {
                        let observed_at = book.time_ms.unwrap_or_else(current_time_ms);
                        let event = FeedEvent::Book {
                            asset: self.asset.clone(),
                            kind,
                            best_bid: book.best_bid.unwrap_or(0.0),
                            best_ask: book.best_ask.unwrap_or(0.0),
                            observed_at,
                            had_bids: book.had_bids,
                            had_asks: book.had_asks,
                        };
                        let _ = self.event_tx.send(event).await;
                        tracing::debug!(asset = %self.asset, coin = %coin, kind = %kind, "bootstrap snapshot applied");
                    }
                }
                Err(e) => {
                    tracing::debug!(asset = %self.asset, coin = %coin, error = %e, "bootstrap snapshot failed");
                }
            }
        }
    }

    /// Subscribing + Streaming phases for one connection lifetime
    async fn stream(&mut self, ws: TlsWebSocketStream, backoff: &mut BackoffPolicy) -> StreamExit {
        let (mut writer, mut reader) = ws.split();
        let mut ledger = SubscriptionLedger::new();

        self.resolution.reset_for_reconnect();
        let perp_coin = self.perp_coin.clone();
        if send_subscribe(&mut writer, &mut ledger, &self.counters, "l2Book", Some(&perp_coin))
            .await
            .is_err()
        {
            return StreamExit::Disconnected;
        }
        for coin in self
            .resolution
            .active_coins()
            .iter()
            .map(|c| c.to_string())
            .collect::<Vec<_>>()
        {
            if send_subscribe(&mut writer, &mut ledger, &self.counters, "l2Book", Some(&coin))
                .await
                .is_err()
            {
                return StreamExit::Disconnected;
            }
        }

        let idle = Duration::from_millis(self.feed.idle_timeout_ms);
        let resolve_deadline =
            Instant::now() + Duration::from_millis(self.feed.resolve_timeout_ms);
        let mut first_message_seen = false;

        enum Wake {
            Cancelled,
            ResolveDeadline,
            Idle,
            Closed,
            SocketError(tokio_tungstenite::tungstenite::Error),
            Frame(Message),
        }

        loop {
            // Arms only produce a wake value; the handling below is free to
            // mutate connection state once the select borrows are released.
            let wake = tokio::select! {
                _ = self.cancel.cancelled() => Wake::Cancelled,
                _ = sleep_until(resolve_deadline), if self.resolution.fallback_pending() => {
                    Wake::ResolveDeadline
                }
                next = timeout(idle, reader.next()) => match next {
                    Err(_elapsed) => Wake::Idle,
                    Ok(None) => Wake::Closed,
                    Ok(Some(Err(e))) => Wake::SocketError(e),
                    Ok(Some(Ok(message))) => Wake::Frame(message),
                }
            };

            match wake {
                Wake::Cancelled => {
                    let _ = writer.close().await;
                    return StreamExit::Cancelled;
                }
                Wake::ResolveDeadline => {
                    self.resolution.on_deadline();
                    let fallback = self.resolution.fallback_coin().to_string();
                    tracing::info!(
                        asset = %self.asset,
                        fallback = %fallback,
                        "primary spot coin silent, subscribing fallback"
                    );
                    if send_subscribe(&mut writer, &mut ledger, &self.counters, "l2Book", Some(&fallback))
                        .await
                        .is_err()
                    {
                        return StreamExit::Disconnected;
                    }
                }
                Wake::Idle => {
                    self.counters.record_idle_timeout();
                    tracing::warn!(
                        asset = %self.asset,
                        idle_ms = self.feed.idle_timeout_ms,
                        "no book message within idle window, forcing reconnect"
                    );
                    let _ = writer.close().await;
                    return StreamExit::IdleTimeout;
                }
                Wake::Closed => {
                    tracing::info!(asset = %self.asset, "book socket closed by server");
                    return StreamExit::Disconnected;
                }
                Wake::SocketError(e) => {
                    tracing::error!(asset = %self.asset, error = %e, "book socket error");
                    return StreamExit::Disconnected;
                }
                Wake::Frame(message) => {
                    if !first_message_seen {
                        first_message_seen = true;
                        backoff.reset();
                        tracing::info!(asset = %self.asset, "first data received on book socket");
                    }
                    if !self.handle_frame(message).await {
                        return StreamExit::ConsumerGone;
                    }
                }
            }
        }
    }

    /// Dispatch one inbound frame; false when the event consumer is gone
    async fn handle_frame(&mut self, message: Message) -> bool {
        let text = match message {
            Message::Text(text) => text,
            Message::Binary(data) => match String::from_utf8(data) {
                Ok(text) => text,
                Err(_) => {
                    tracing::debug!(asset = %self.asset, "non-UTF-8 binary frame dropped");
                    return true;
                }
            },
            Message::Close(_) | Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => {
                return true;
            }
        };

        let envelopes = wire::parse_envelopes(&text);
        if envelopes.is_empty() {
            tracing::warn!(asset = %self.asset, frame = %text, "unparseable frame dropped");
            return true;
        }

        for envelope in envelopes {
            if self.health.register_message(&envelope) {
                continue;
            }
            match wire::classify(&envelope) {
                VenueMessage::Error(detail) => {
                    tracing::error!(asset = %self.asset, detail = %detail, "venue error envelope");
                }
                VenueMessage::Ack { coin } => {
                    tracing::debug!(asset = %self.asset, coin = ?coin, "subscription acknowledged");
                }
                VenueMessage::Book(book) => {
                    let kind = if book.coin == self.perp_coin {
                        MarketKind::Perp
                    } else if self.resolution.owns_coin(&book.coin) {
                        if let Some(via) = self.resolution.on_book_received(&book.coin) {
                            tracing::info!(
                                asset = %self.asset,
                                coin = %book.coin,
                                via = match via {
                                    ResolvedVia::Primary => "primary",
                                    ResolvedVia::Fallback => "fallback",
                                },
                                "spot subscription resolved"
                            );
                        }
                        MarketKind::Spot
                    } else {
                        tracing::debug!(asset = %self.asset, coin = %book.coin, "book for unknown coin");
                        continue;
                    };
                    let event = FeedEvent::Book {
                        asset: self.asset.clone(),
                        kind,
                        best_bid: book.best_bid.unwrap_or(0.0),
                        best_ask: book.best_ask.unwrap_or(0.0),
                        observed_at: book.time_ms.unwrap_or_else(current_time_ms),
                        had_bids: book.had_bids,
                        had_asks: book.had_asks,
                    };
                    if self.event_tx.send(event).await.is_err() {
                        return false;
                    }
                }
                VenueMessage::Context(ctx) => {
                    if ctx.coin == self.asset {
                        let event = FeedEvent::Context {
                            asset: self.asset.clone(),
                            mark: ctx.mark,
                            spot_proxy: ctx.spot_proxy,
                            funding: ctx.funding,
                            observed_at: ctx.time_ms.unwrap_or_else(current_time_ms),
                        };
                        if self.event_tx.send(event).await.is_err() {
                            return false;
                        }
                    }
                }
                VenueMessage::Mids(mids) => {
                    for (coin, mid) in mids {
                        if coin != self.asset {
                            continue;
                        }
                        let event = FeedEvent::Context {
                            asset: coin,
                            mark: Some(mid),
                            spot_proxy: Some(mid),
                            funding: None,
                            observed_at: current_time_ms(),
                        };
                        if self.event_tx.send(event).await.is_err() {
                            return false;
                        }
                    }
                }
                VenueMessage::Unclassified => {
                    self.health.register_heartbeat(&envelope);
                }
            }
        }
        true
    }
}

// =============================================================================
// Market-context connection (shared across assets)
// =============================================================================

/// Runtime subscription-set mutation for the context connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum CtxCommand {
    Track(String),
    Untrack(String),
}

/// Supervised shared mark/context connection
pub(crate) struct ContextConnection {
    pub assets: HashSet<String>,
    pub endpoints: VenueEndpoints,
    pub feed: FeedSettings,
    pub cmd_rx: mpsc::Receiver<CtxCommand>,
    pub event_tx: mpsc::Sender<FeedEvent>,
    pub health: Arc<FeedHealthTracker>,
    pub counters: Arc<FeedCounters>,
    pub cancel: CancellationToken,
}

impl ContextConnection {
    pub async fn run(mut self) {
        tracing::info!(assets = self.assets.len(), "context connection loop started");

        let mut backoff = BackoffPolicy::new(BackoffConfig {
            base_ms: self.feed.backoff_base_ms,
            cap_ms: self.feed.backoff_cap_ms,
        });

        loop {
            if self.cancel.is_cancelled() {
                break;
            }

            let connect = tokio::select! {
                _ = self.cancel.cancelled() => break,
                r = connect_tls(&self.endpoints.websocket_url) => r,
            };
            let ws = match connect {
                Ok(ws) => ws,
                Err(e) => {
                    let delay = backoff.next_delay();
                    tracing::warn!(
                        error = %e,
                        delay_ms = delay.as_millis() as u64,
                        "context connection failed, backing off"
                    );
                    tokio::select! {
                        _ = self.cancel.cancelled() => break,
                        _ = sleep(delay) => {}
                    }
                    continue;
                }
            };
            self.counters.record_ctx_connect();

            match self.stream(ws, &mut backoff).await {
                StreamExit::Cancelled | StreamExit::ConsumerGone => break,
                StreamExit::IdleTimeout | StreamExit::Disconnected => {
                    let delay = backoff.next_delay();
                    tokio::select! {
                        _ = self.cancel.cancelled() => break,
                        _ = sleep(delay) => {}
                    }
                }
            }
        }
        tracing::info!("context connection loop stopped");
    }

    async fn stream(&mut self, ws: TlsWebSocketStream, backoff: &mut BackoffPolicy) -> StreamExit {
        let (mut writer, mut reader) = ws.split();
        let mut ledger = SubscriptionLedger::new();

        if send_subscribe(&mut writer, &mut ledger, &self.counters, "allMids", None)
            .await
            .is_err()
        {
            return StreamExit::Disconnected;
        }
        for asset in self.assets.iter().cloned().collect::<Vec<_>>() {
            if send_subscribe(&mut writer, &mut ledger, &self.counters, "markContext", Some(&asset))
                .await
                .is_err()
            {
                return StreamExit::Disconnected;
            }
        }

        let mut first_message_seen = false;

        enum Wake {
            Cancelled,
            Cmd(Option<CtxCommand>),
            Closed,
            SocketError(tokio_tungstenite::tungstenite::Error),
            Frame(Message),
        }

        loop {
            let wake = tokio::select! {
                _ = self.cancel.cancelled() => Wake::Cancelled,
                cmd = self.cmd_rx.recv() => Wake::Cmd(cmd),
                next = reader.next() => match next {
                    None => Wake::Closed,
                    Some(Err(e)) => Wake::SocketError(e),
                    Some(Ok(message)) => Wake::Frame(message),
                }
            };

            match wake {
                Wake::Cancelled => {
                    let _ = writer.close().await;
                    return StreamExit::Cancelled;
                }
                Wake::Cmd(Some(CtxCommand::Track(asset))) => {
                    self.assets.insert(asset.clone());
                    if send_subscribe(&mut writer, &mut ledger, &self.counters, "markContext", Some(&asset))
                        .await
                        .is_err()
                    {
                        return StreamExit::Disconnected;
                    }
                }
                Wake::Cmd(Some(CtxCommand::Untrack(asset))) => {
                    self.assets.remove(&asset);
                }
                Wake::Cmd(None) => {
                    let _ = writer.close().await;
                    return StreamExit::Cancelled;
                }
                Wake::Closed => {
                    tracing::info!("context socket closed by server");
                    return StreamExit::Disconnected;
                }
                Wake::SocketError(e) => {
                    tracing::error!(error = %e, "context socket error");
                    return StreamExit::Disconnected;
                }
                Wake::Frame(message) => {
                    if !first_message_seen {
                        first_message_seen = true;
                        backoff.reset();
                        tracing::info!("first data received on context socket");
                    }
                    if !self.handle_frame(message).await {
                        return StreamExit::ConsumerGone;
                    }
                }
            }
        }
    }

    async fn handle_frame(&mut self, message: Message) -> bool {
        let text = match message {
            Message::Text(text) => text,
            Message::Binary(data) => match String::from_utf8(data) {
                Ok(text) => text,
                Err(_) => return true,
            },
            _ => return true,
        };

        let envelopes = wire::parse_envelopes(&text);
        if envelopes.is_empty() {
            tracing::warn!(frame = %text, "unparseable context frame dropped");
            return true;
        }

        for envelope in envelopes {
            if self.health.register_message(&envelope) {
                continue;
            }
            match wire::classify(&envelope) {
                VenueMessage::Error(detail) => {
                    tracing::error!(detail = %detail, "venue error envelope on context socket");
                }
                VenueMessage::Ack { coin } => {
                    tracing::debug!(coin = ?coin, "context subscription acknowledged");
                }
                VenueMessage::Context(ctx) => {
                    if !self.assets.contains(&ctx.coin) {
                        continue;
                    }
                    let event = FeedEvent::Context {
                        asset: ctx.coin,
                        mark: ctx.mark,
                        spot_proxy: ctx.spot_proxy,
                        funding: ctx.funding,
                        observed_at: ctx.time_ms.unwrap_or_else(current_time_ms),
                    };
                    if self.event_tx.send(event).await.is_err() {
                        return false;
                    }
                }
                VenueMessage::Mids(mids) => {
                    for (coin, mid) in mids {
                        if !self.assets.contains(&coin) {
                            continue;
                        }
                        let event = FeedEvent::Context {
                            asset: coin,
                            mark: Some(mid),
                            spot_proxy: Some(mid),
                            funding: None,
                            observed_at: current_time_ms(),
                        };
                        if self.event_tx.send(event).await.is_err() {
                            return false;
                        }
                    }
                }
                VenueMessage::Book(book) => {
                    // Books are not subscribed here; routing them would need
                    // the per-asset kind map, so they only count as traffic.
                    tracing::debug!(coin = %book.coin, "book frame on context socket ignored");
                }
                VenueMessage::Unclassified => {
                    self.health.register_heartbeat(&envelope);
                }
            }
        }
        true
    }
}

// =============================================================================
// Tests
// =============================================================================
