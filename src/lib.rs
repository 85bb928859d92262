//! Spot/perp paper-trading feed and decision core
//!
//! Streams order-book and mark/funding data for a spot+perp venue pair,
//! tracks per-asset market state and feed health, and evaluates a
//! cross-market paper edge on every update. No real orders are ever sent;
//! qualifying opportunities and a validation trace go to a narrow
//! persistence sink.

pub mod adapters;
pub mod config;
pub mod core;
pub mod error;
pub mod persistence;

pub use error::AppError;
