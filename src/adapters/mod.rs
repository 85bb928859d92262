//! Venue-facing adapter layer
//!
//! This module provides the streaming connection manager, wire-format
//! classification, and REST bootstrap for the traded venue.

pub mod errors;
pub mod hyperliquid;
pub mod shared;

// Re-export commonly used types for convenience
pub use errors::{ExchangeError, ExchangeResult};
pub use hyperliquid::{FeedManager, InfoClient, ReconnectSnapshot, VenueEndpoints};
