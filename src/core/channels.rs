//! Typed feed events and inter-task channels
//!
//! The connection loops publish normalized updates over a bounded mpsc
//! channel; the engine is the single consumer. A broadcast channel carries
//! the shutdown signal from main to every task.

use tokio::sync::{broadcast, mpsc};

use crate::core::state::MarketKind;

/// Default channel capacity for bounded channels
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1_024;

/// Normalized update emitted by the feed connection loops
#[derive(Debug, Clone, PartialEq)]
pub enum FeedEvent {
    /// Best-of-book update for one (asset, market-kind) pair
    Book {
        asset: String,
        kind: MarketKind,
        best_bid: f64,
        best_ask: f64,
        observed_at: u64,
        had_bids: bool,
        had_asks: bool,
    },
    /// Mark/context update (mark price, funding, spot proxy)
    Context {
        asset: String,
        mark: Option<f64>,
        spot_proxy: Option<f64>,
        funding: Option<f64>,
        observed_at: u64,
    },
}

impl FeedEvent {
    pub fn asset(&self) -> &str {
        match self {
            FeedEvent::Book { asset, .. } => asset,
            FeedEvent::Context { asset, .. } => asset,
        }
    }
}

/// Bundle of all inter-task communication channels
#[derive(Debug)]
pub struct ChannelBundle {
    /// Feed connections -> engine: normalized updates
    pub feed_tx: mpsc::Sender<FeedEvent>,
    pub feed_rx: mpsc::Receiver<FeedEvent>,

    /// Shutdown broadcast: main -> all tasks
    pub shutdown_tx: broadcast::Sender<()>,
}

impl ChannelBundle {
    pub fn new(capacity: usize) -> Self {
        let (feed_tx, feed_rx) = mpsc::channel(capacity);
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            feed_tx,
            feed_rx,
            shutdown_tx,
        }
    }

    pub fn subscribe_shutdown(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }
}

impl Default for ChannelBundle {
    fn default() -> Self {
        Self::new(DEFAULT_CHANNEL_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_bundle_creation() {
        let bundle = ChannelBundle::new(50);
        assert!(!bundle.feed_tx.is_closed());
    }

    #[tokio::test]
    async fn test_shutdown_signal() {
        let bundle = ChannelBundle::default();
        let mut rx = bundle.subscribe_shutdown();

        assert!(bundle.shutdown_tx.send(()).is_ok());
        assert!(rx.recv().await.is_ok());
    }

    #[tokio::test]
    async fn test_feed_event_send_receive() {
        let bundle = ChannelBundle::new(10);
        let mut rx = bundle.feed_rx;
        let tx = bundle.feed_tx;

        let event = FeedEvent::Book {
            asset: "BTC".to_string(),
            kind: MarketKind::Perp,
            best_bid: 96500.0,
            best_ask: 96501.0,
            observed_at: 1700000000000,
            had_bids: true,
            had_asks: true,
        };

        tx.send(event.clone()).await.unwrap();

        let received = rx.recv().await.unwrap();
        assert_eq!(received, event);
        assert_eq!(received.asset(), "BTC");
    }
}
