//! Core module - market state, feed health, decision engine, validation
//!
//! # Module Architecture
//!
//! This module uses **explicit re-exports** instead of glob exports
//! (`pub use module::*`) to provide better API visibility and prevent
//! accidental public API changes.

pub mod channels;
pub mod decision;
pub mod engine;
pub mod feed_health;
pub mod probe;
pub mod selector;
pub mod state;
pub mod validation;

// Explicit re-exports for channels module
pub use channels::{ChannelBundle, FeedEvent, DEFAULT_CHANNEL_CAPACITY};

// Explicit re-exports for state module
pub use state::{
    current_time_ms, AssetMarketState, BookQuote, MarketKind, MarketStateStore, UpdateCounts,
};

// Explicit re-exports for feed health module
pub use feed_health::{AssetHealth, BookHealth, FeedHealthSnapshot, FeedHealthTracker};

// Explicit re-exports for decision module
pub use decision::{
    compute_edge, evaluate, evaluate_gates, normalize_rate, Direction, EdgeDecision, Evaluation,
    GateReport, SkipReason, Verdict,
};

// Explicit re-exports for engine module
pub use engine::{EngineCore, PaperEngine};

// Explicit re-exports for validation module
pub use validation::ValidationRecorder;

// Explicit re-exports for probe module
pub use probe::{MakerProbeTracker, PROBE_OPEN_DELTA_MS};

// Explicit re-exports for selector module
pub use selector::{
    preflight_assets, select_auto_assets, select_auto_assets_from_meta, warmup_assets,
    AutoAssetCandidate,
};
