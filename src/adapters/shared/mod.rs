//! Shared helpers for the venue adapter
//!
//! This module provides common utilities for WebSocket connection management
//! and reconnection backoff.

pub mod backoff;
pub mod websocket;

pub use backoff::{BackoffConfig, BackoffPolicy};
pub use websocket::connect_tls;
