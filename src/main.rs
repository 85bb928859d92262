//! Paper engine entry point
//!
//! Wires the feed manager, market state store, feed health tracker, decision
//! engine, and persistence sink together:
//! 1. Loads configuration and initializes logging
//! 2. Resolves the tracked asset set (auto selector or configured universe)
//! 3. Starts the streaming connections and the engine loops
//! 4. Runs preflight/warmup gating on the tracked assets
//! 5. Shuts everything down cleanly on Ctrl+C

use std::path::Path;
use std::sync::Arc;

use tokio::signal;
use tracing::{error, info, warn};

use spotperp_bot::adapters::hyperliquid::FeedManager;
use spotperp_bot::config;
use spotperp_bot::core::{
    preflight_assets, select_auto_assets, warmup_assets, EngineCore, FeedHealthTracker,
    MarketStateStore, PaperEngine,
};
use spotperp_bot::persistence::{PersistenceSink, RestSink};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    config::init_logging();

    let config_path =
        std::env::var("CONFIG_PATH").unwrap_or_else(|_| "config.yaml".to_string());
    let settings = match config::load_config(Path::new(&config_path)) {
        Ok(settings) => settings,
        Err(e) => {
            // A missing file falls back to defaults so the engine can run
            // against the public venue endpoints out of the box.
            warn!(path = %config_path, error = %e, "configuration not loaded, using defaults");
            config::Settings::default()
        }
    };
    info!(
        network = %settings.network,
        validation_enabled = settings.validation.enabled,
        selector_enabled = settings.selector.enabled,
        "starting spot/perp paper engine"
    );

    let store = Arc::new(MarketStateStore::new());
    let health = Arc::new(FeedHealthTracker::new(settings.feed_health.clone()));
    let sink: Arc<dyn PersistenceSink> = Arc::new(RestSink::new(&settings.persistence));

    let mut manager = FeedManager::new(&settings, Arc::clone(&health));
    let Some(events) = manager.events() else {
        error!("feed event channel unavailable");
        std::process::exit(1);
    };

    // Resolve the tracked asset universe
    let assets: Vec<String> = if settings.selector.enabled {
        match select_auto_assets(&manager.info_client(), &settings.selector).await {
            Ok(assets) if !assets.is_empty() => assets,
            Ok(_) | Err(_) => {
                warn!("auto selection unavailable, falling back to configured universe");
                configured_universe(&settings)
            }
        }
    } else {
        configured_universe(&settings)
    };
    info!(assets = %assets.join(","), "tracking assets");

    for asset in &assets {
        store.ensure(asset).await;
    }
    manager.track(&assets).await;

    let core = Arc::new(EngineCore::new(
        settings.clone(),
        Arc::clone(&store),
        Arc::clone(&health),
        sink,
        Some(manager.counters()),
    ));
    info!(run_id = %core.run_id(), "engine run id assigned");
    let mut engine = PaperEngine::new(Arc::clone(&core));
    engine.start(events);

    manager.start().await?;

    // Preflight: drop assets whose spot book never validates, then warm up
    let (kept, dropped) = preflight_assets(&store, &settings.selector, &assets).await;
    for asset in &dropped {
        manager.untrack(asset).await;
        core.remove_asset(asset).await;
    }
    let (kept, dropped) = warmup_assets(
        &store,
        &settings.selector,
        settings.trading.max_spot_spread_bps,
        &kept,
    )
    .await;
    for asset in &dropped {
        manager.untrack(asset).await;
        core.remove_asset(asset).await;
    }
    if kept.is_empty() {
        warn!("no assets survived preflight/warmup; engine idles until reconfigured");
    } else {
        info!(assets = %kept.join(","), "steady-state streaming");
    }

    match signal::ctrl_c().await {
        Ok(()) => info!("shutdown signal received"),
        Err(e) => error!(error = %e, "failed to listen for shutdown signal"),
    }

    engine.shutdown().await;
    manager.close().await?;
    info!("clean exit");
    Ok(())
}

fn configured_universe(settings: &config::Settings) -> Vec<String> {
    let universe: Vec<String> = settings
        .trading
        .universe_assets
        .iter()
        .map(|a| a.trim().to_uppercase())
        .filter(|a| !a.is_empty())
        .collect();
    if universe.is_empty() {
        vec!["BTC".to_string()]
    } else {
        universe
    }
}
