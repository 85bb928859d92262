//! Configuration types for the spot/perp paper engine
//!
//! All behavioral knobs (thresholds, intervals, fee modes, backoff caps) are
//! supplied through one `Settings` tree loaded from YAML at startup. No other
//! module reads files or the environment directly.

use serde::{Deserialize, Serialize};

use crate::error::AppError;

// ============================================================================
// Enums
// ============================================================================

/// Fee schedule applied to a trade leg
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FeeMode {
    Maker,
    Taker,
}

impl std::fmt::Display for FeeMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FeeMode::Maker => write!(f, "maker"),
            FeeMode::Taker => write!(f, "taker"),
        }
    }
}

// ============================================================================
// Configuration Structs
// ============================================================================

/// Venue endpoint configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiSettings {
    pub rest_base: String,
    #[serde(default = "default_info_path")]
    pub info_path: String,
    pub websocket_url: String,
    #[serde(default)]
    pub testnet_rest_base: String,
    #[serde(default)]
    pub testnet_websocket_url: String,
}

fn default_info_path() -> String {
    "/info".to_string()
}

impl Default for ApiSettings {
    fn default() -> Self {
        Self {
            rest_base: "https://api.hyperliquid.xyz".to_string(),
            info_path: default_info_path(),
            websocket_url: "wss://api.hyperliquid.xyz/ws".to_string(),
            testnet_rest_base: "https://api.hyperliquid-testnet.xyz".to_string(),
            testnet_websocket_url: "wss://api.hyperliquid-testnet.xyz/ws".to_string(),
        }
    }
}

/// Trading economics: sizing, fees, slippage, edge thresholds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradingSettings {
    #[serde(default = "default_quote_asset")]
    pub quote_asset: String,
    #[serde(default = "default_min_position_size")]
    pub min_position_size: f64,
    #[serde(default = "default_max_position_size")]
    pub max_position_size: f64,
    /// Minimum acceptable edge. Values >= 1 are basis points, (0,1) a raw rate.
    #[serde(default)]
    pub min_edge_threshold: f64,
    /// Base slippage estimate. Same bps-or-rate normalization.
    #[serde(default)]
    pub slippage_rate: f64,
    /// Extra slippage safety buffer on top of the base rate.
    #[serde(default)]
    pub safety_slippage_buffer: f64,
    #[serde(default = "default_fee_mode")]
    pub spot_fee_mode: FeeMode,
    #[serde(default = "default_fee_mode")]
    pub perp_fee_mode: FeeMode,
    #[serde(default)]
    pub maker_fee_spot: f64,
    #[serde(default)]
    pub maker_fee_perp: f64,
    #[serde(default = "default_taker_fee_spot")]
    pub taker_fee_spot: f64,
    #[serde(default = "default_taker_fee_perp")]
    pub taker_fee_perp: f64,
    /// Reject evaluation when the real spot book spread exceeds this (bps).
    #[serde(default = "default_max_spot_spread_bps")]
    pub max_spot_spread_bps: f64,
    /// Assets tracked when the auto selector is disabled.
    #[serde(default)]
    pub universe_assets: Vec<String>,
}

fn default_quote_asset() -> String {
    "USDC".to_string()
}
fn default_min_position_size() -> f64 {
    1.0
}
fn default_max_position_size() -> f64 {
    10.0
}
fn default_fee_mode() -> FeeMode {
    FeeMode::Taker
}
fn default_taker_fee_spot() -> f64 {
    0.001
}
fn default_taker_fee_perp() -> f64 {
    0.0005
}
fn default_max_spot_spread_bps() -> f64 {
    100.0
}

impl Default for TradingSettings {
    fn default() -> Self {
        Self {
            quote_asset: default_quote_asset(),
            min_position_size: default_min_position_size(),
            max_position_size: default_max_position_size(),
            min_edge_threshold: 0.0,
            slippage_rate: 0.0,
            safety_slippage_buffer: 0.0,
            spot_fee_mode: default_fee_mode(),
            perp_fee_mode: default_fee_mode(),
            maker_fee_spot: 0.0,
            maker_fee_perp: 0.0,
            taker_fee_spot: default_taker_fee_spot(),
            taker_fee_perp: default_taker_fee_perp(),
            max_spot_spread_bps: default_max_spot_spread_bps(),
            universe_assets: Vec::new(),
        }
    }
}

impl TradingSettings {
    /// Fee rate for the spot leg under the configured mode
    pub fn spot_fee_rate(&self) -> f64 {
        match self.spot_fee_mode {
            FeeMode::Maker => self.maker_fee_spot,
            FeeMode::Taker => self.taker_fee_spot,
        }
    }

    /// Fee rate for the perp leg under the configured mode
    pub fn perp_fee_rate(&self) -> f64 {
        match self.perp_fee_mode {
            FeeMode::Maker => self.maker_fee_perp,
            FeeMode::Taker => self.taker_fee_perp,
        }
    }

    pub fn validate(&self) -> Result<(), AppError> {
        if self.min_position_size <= 0.0 || !self.min_position_size.is_finite() {
            return Err(AppError::Config(format!(
                "min_position_size must be a positive finite number (got {})",
                self.min_position_size
            )));
        }
        if self.max_spot_spread_bps <= 0.0 || !self.max_spot_spread_bps.is_finite() {
            return Err(AppError::Config(format!(
                "max_spot_spread_bps must be a positive finite number (got {})",
                self.max_spot_spread_bps
            )));
        }
        for (name, v) in [
            ("min_edge_threshold", self.min_edge_threshold),
            ("slippage_rate", self.slippage_rate),
            ("safety_slippage_buffer", self.safety_slippage_buffer),
            ("maker_fee_spot", self.maker_fee_spot),
            ("maker_fee_perp", self.maker_fee_perp),
            ("taker_fee_spot", self.taker_fee_spot),
            ("taker_fee_perp", self.taker_fee_perp),
        ] {
            if v < 0.0 || !v.is_finite() {
                return Err(AppError::Config(format!(
                    "{} must be a non-negative finite number (got {})",
                    name, v
                )));
            }
        }
        Ok(())
    }
}

/// Connection supervision knobs for the feed manager
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedSettings {
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_backoff_cap_ms")]
    pub backoff_cap_ms: u64,
    /// Book connection idle watchdog: force a reconnect after this silence.
    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,
    /// Wait on the primary spot coin id before trying the fallback.
    #[serde(default = "default_resolve_timeout_ms")]
    pub resolve_timeout_ms: u64,
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

fn default_backoff_base_ms() -> u64 {
    1_000
}
fn default_backoff_cap_ms() -> u64 {
    30_000
}
fn default_idle_timeout_ms() -> u64 {
    20_000
}
fn default_resolve_timeout_ms() -> u64 {
    3_000
}
fn default_channel_capacity() -> usize {
    1_024
}

impl Default for FeedSettings {
    fn default() -> Self {
        Self {
            backoff_base_ms: default_backoff_base_ms(),
            backoff_cap_ms: default_backoff_cap_ms(),
            idle_timeout_ms: default_idle_timeout_ms(),
            resolve_timeout_ms: default_resolve_timeout_ms(),
            channel_capacity: default_channel_capacity(),
        }
    }
}

/// Feed health thresholds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedHealthSettings {
    #[serde(default = "default_stale_ms")]
    pub stale_ms: u64,
    #[serde(default = "default_out_of_sync_ms")]
    pub out_of_sync_ms: u64,
    #[serde(default = "default_dedup_ttl_ms")]
    pub dedup_ttl_ms: u64,
    #[serde(default = "default_health_log_interval_sec")]
    pub log_interval_sec: u64,
}

fn default_stale_ms() -> u64 {
    1_500
}
fn default_out_of_sync_ms() -> u64 {
    1_000
}
fn default_dedup_ttl_ms() -> u64 {
    2_000
}
fn default_health_log_interval_sec() -> u64 {
    30
}

impl Default for FeedHealthSettings {
    fn default() -> Self {
        Self {
            stale_ms: default_stale_ms(),
            out_of_sync_ms: default_out_of_sync_ms(),
            dedup_ttl_ms: default_dedup_ttl_ms(),
            log_interval_sec: default_health_log_interval_sec(),
        }
    }
}

/// Engine tracing and diagnostics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategySettings {
    #[serde(default)]
    pub would_trade: bool,
    /// Minimum seconds between decision trace logs per asset.
    #[serde(default = "default_trace_every_seconds")]
    pub trace_every_seconds: u64,
    #[serde(default = "default_heartbeat_interval_sec")]
    pub heartbeat_interval_sec: u64,
    #[serde(default)]
    pub maker_probe_enabled: bool,
    /// A probe left open longer than this is discarded, not completed.
    #[serde(default = "default_maker_probe_max_age_ms")]
    pub maker_probe_max_age_ms: u64,
}

fn default_trace_every_seconds() -> u64 {
    10
}
fn default_heartbeat_interval_sec() -> u64 {
    10
}
fn default_maker_probe_max_age_ms() -> u64 {
    5_000
}

impl Default for StrategySettings {
    fn default() -> Self {
        Self {
            would_trade: false,
            trace_every_seconds: default_trace_every_seconds(),
            heartbeat_interval_sec: default_heartbeat_interval_sec(),
            maker_probe_enabled: false,
            maker_probe_max_age_ms: default_maker_probe_max_age_ms(),
        }
    }
}

/// Validation recorder sampling configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationSettings {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_sample_interval_ms")]
    pub sample_interval_ms: u64,
    #[serde(default = "default_stats_log_interval_sec")]
    pub stats_log_interval_sec: u64,
    #[serde(default = "default_flush_every_n")]
    pub flush_every_n: usize,
}

fn default_sample_interval_ms() -> u64 {
    250
}
fn default_stats_log_interval_sec() -> u64 {
    5
}
fn default_flush_every_n() -> usize {
    50
}

impl Default for ValidationSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            sample_interval_ms: default_sample_interval_ms(),
            stats_log_interval_sec: default_stats_log_interval_sec(),
            flush_every_n: default_flush_every_n(),
        }
    }
}

/// Auto asset selector configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelectorSettings {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_selector_limit")]
    pub limit: usize,
    #[serde(default = "default_major_asset")]
    pub major_asset: String,
    #[serde(default = "default_preflight_timeout_ms")]
    pub preflight_timeout_ms: u64,
    #[serde(default = "default_preflight_poll_ms")]
    pub preflight_poll_ms: u64,
    #[serde(default = "default_warmup_timeout_ms")]
    pub warmup_timeout_ms: u64,
    #[serde(default = "default_warmup_max_failures")]
    pub warmup_max_failures: u32,
}

fn default_selector_limit() -> usize {
    15
}
fn default_major_asset() -> String {
    "ETH".to_string()
}
fn default_preflight_timeout_ms() -> u64 {
    6_000
}
fn default_preflight_poll_ms() -> u64 {
    250
}
fn default_warmup_timeout_ms() -> u64 {
    3_000
}
fn default_warmup_max_failures() -> u32 {
    3
}

impl Default for SelectorSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            limit: default_selector_limit(),
            major_asset: default_major_asset(),
            preflight_timeout_ms: default_preflight_timeout_ms(),
            preflight_poll_ms: default_preflight_poll_ms(),
            warmup_timeout_ms: default_warmup_timeout_ms(),
            warmup_max_failures: default_warmup_max_failures(),
        }
    }
}

/// Persistence sink endpoint (external collaborator, REST-backed)
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PersistenceSettings {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub base_url: String,
    #[serde(default)]
    pub api_key: String,
}

/// Root settings tree
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default = "default_network")]
    pub network: String,
    #[serde(default)]
    pub api: ApiSettings,
    #[serde(default)]
    pub trading: TradingSettings,
    #[serde(default)]
    pub feed: FeedSettings,
    #[serde(default)]
    pub feed_health: FeedHealthSettings,
    #[serde(default)]
    pub strategy: StrategySettings,
    #[serde(default)]
    pub validation: ValidationSettings,
    #[serde(default)]
    pub selector: SelectorSettings,
    #[serde(default)]
    pub persistence: PersistenceSettings,
}

fn default_network() -> String {
    "mainnet".to_string()
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            network: default_network(),
            api: ApiSettings::default(),
            trading: TradingSettings::default(),
            feed: FeedSettings::default(),
            feed_health: FeedHealthSettings::default(),
            strategy: StrategySettings::default(),
            validation: ValidationSettings::default(),
            selector: SelectorSettings::default(),
            persistence: PersistenceSettings::default(),
        }
    }
}

impl Settings {
    /// REST base for the configured network
    pub fn rest_base(&self) -> &str {
        if self.network == "mainnet" || self.api.testnet_rest_base.is_empty() {
            &self.api.rest_base
        } else {
            &self.api.testnet_rest_base
        }
    }

    /// WebSocket url for the configured network
    pub fn websocket_url(&self) -> &str {
        if self.network == "mainnet" || self.api.testnet_websocket_url.is_empty() {
            &self.api.websocket_url
        } else {
            &self.api.testnet_websocket_url
        }
    }

    pub fn validate(&self) -> Result<(), AppError> {
        if self.network != "mainnet" && self.network != "testnet" {
            return Err(AppError::Config(format!(
                "network must be 'mainnet' or 'testnet' (got '{}')",
                self.network
            )));
        }
        if self.api.websocket_url.trim().is_empty() {
            return Err(AppError::Config("api.websocket_url cannot be empty".to_string()));
        }
        if self.api.rest_base.trim().is_empty() {
            return Err(AppError::Config("api.rest_base cannot be empty".to_string()));
        }
        if self.feed.backoff_cap_ms < self.feed.backoff_base_ms {
            return Err(AppError::Config(format!(
                "feed.backoff_cap_ms ({}) must be >= feed.backoff_base_ms ({})",
                self.feed.backoff_cap_ms, self.feed.backoff_base_ms
            )));
        }
        if self.validation.flush_every_n == 0 {
            return Err(AppError::Config(
                "validation.flush_every_n must be at least 1".to_string(),
            ));
        }
        if self.persistence.enabled && self.persistence.base_url.trim().is_empty() {
            return Err(AppError::Config(
                "persistence.base_url is required when persistence is enabled".to_string(),
            ));
        }
        self.trading.validate()?;
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let settings = Settings::default();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.network, "mainnet");
        assert_eq!(settings.feed_health.stale_ms, 1_500);
        assert_eq!(settings.feed_health.out_of_sync_ms, 1_000);
        assert_eq!(settings.feed_health.dedup_ttl_ms, 2_000);
        assert_eq!(settings.validation.sample_interval_ms, 250);
        assert_eq!(settings.validation.flush_every_n, 50);
        assert_eq!(settings.validation.stats_log_interval_sec, 5);
        assert_eq!(settings.feed.backoff_cap_ms, 30_000);
        assert_eq!(settings.feed.idle_timeout_ms, 20_000);
        assert_eq!(settings.feed.resolve_timeout_ms, 3_000);
        assert_eq!(settings.selector.preflight_timeout_ms, 6_000);
        assert_eq!(settings.selector.warmup_max_failures, 3);
    }

    #[test]
    fn test_fee_rate_selection_by_mode() {
        let mut trading = TradingSettings::default();
        trading.maker_fee_spot = 0.0002;
        trading.taker_fee_spot = 0.001;
        trading.spot_fee_mode = FeeMode::Maker;
        assert_eq!(trading.spot_fee_rate(), 0.0002);
        trading.spot_fee_mode = FeeMode::Taker;
        assert_eq!(trading.spot_fee_rate(), 0.001);
        assert_eq!(trading.perp_fee_rate(), 0.0005);
    }

    #[test]
    fn test_invalid_network_fails() {
        let mut settings = Settings::default();
        settings.network = "devnet".to_string();
        let result = settings.validate();
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("network"));
    }

    #[test]
    fn test_negative_fee_fails() {
        let mut settings = Settings::default();
        settings.trading.taker_fee_spot = -0.001;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_nan_threshold_fails() {
        let mut settings = Settings::default();
        settings.trading.min_edge_threshold = f64::NAN;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_backoff_cap_below_base_fails() {
        let mut settings = Settings::default();
        settings.feed.backoff_base_ms = 5_000;
        settings.feed.backoff_cap_ms = 1_000;
        let result = settings.validate();
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("backoff_cap_ms"));
    }

    #[test]
    fn test_persistence_enabled_requires_url() {
        let mut settings = Settings::default();
        settings.persistence.enabled = true;
        assert!(settings.validate().is_err());
        settings.persistence.base_url = "https://sink.example.com".to_string();
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_testnet_endpoint_selection() {
        let mut settings = Settings::default();
        settings.network = "testnet".to_string();
        assert!(settings.websocket_url().contains("testnet"));
        settings.network = "mainnet".to_string();
        assert!(!settings.websocket_url().contains("testnet"));
    }

    #[test]
    fn test_fee_mode_serde() {
        let mode: FeeMode = serde_yaml::from_str("\"maker\"").unwrap();
        assert_eq!(mode, FeeMode::Maker);
        assert_eq!(mode.to_string(), "maker");
    }
}
