//! Auto asset selection and warmup gating
//!
//! Given venue metadata for both markets, intersects the base symbols,
//! ranks candidates by (spread proxy descending, 24h volume ascending) when
//! a spread proxy is derivable, else by volume alone, and always keeps one
//! configured major asset. After tracking starts, a bounded preflight phase
//! waits for each asset's spot book to become valid and a warmup phase drops
//! assets whose books repeatedly fail the sanity checks.

use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

use serde_json::Value;

use crate::adapters::hyperliquid::wire::parse_float;
use crate::adapters::InfoClient;
use crate::config::SelectorSettings;
use crate::core::state::MarketStateStore;
use crate::error::{AppError, Result};

// =============================================================================
// Metadata parsing
// =============================================================================

/// One ranked selection candidate
#[derive(Debug, Clone, PartialEq)]
pub struct AutoAssetCandidate {
    pub symbol: String,
    pub spread: Option<f64>,
    pub volume_24h: Option<f64>,
}

/// Merge a metadata envelope that may be a dict or a list of dicts
fn extract_meta_payload(raw: &Value) -> Value {
    match raw {
        Value::Object(_) => raw.clone(),
        Value::Array(items) => {
            let mut merged = serde_json::Map::new();
            for item in items {
                let Some(obj) = item.as_object() else { continue };
                for key in ["universe", "tokens", "spotMeta", "assetCtxs"] {
                    if let Some(val) = obj.get(key) {
                        merged.entry(key.to_string()).or_insert_with(|| val.clone());
                    }
                }
            }
            Value::Object(merged)
        }
        _ => Value::Object(serde_json::Map::new()),
    }
}

fn spot_universe_and_tokens(spot_meta: &Value) -> (Vec<Value>, Vec<Value>) {
    let mut universe = spot_meta
        .get("universe")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    let mut tokens = spot_meta
        .get("tokens")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    if let Some(inner) = spot_meta.get("spotMeta").and_then(Value::as_object) {
        if let Some(inner_tokens) = inner.get("tokens").and_then(Value::as_array) {
            tokens.extend(inner_tokens.iter().cloned());
        }
        if let Some(inner_universe) = inner.get("universe").and_then(Value::as_array) {
            if !inner_universe.is_empty() {
                universe = inner_universe.clone();
            }
        }
    }
    (universe, tokens)
}

fn spot_base_symbols(spot_meta: &Value) -> BTreeSet<String> {
    let mut bases = BTreeSet::new();
    let (universe, tokens) = spot_universe_and_tokens(spot_meta);

    let mut token_names: HashMap<u64, String> = HashMap::new();
    for token in &tokens {
        let (Some(index), Some(name)) = (
            token.get("index").and_then(Value::as_u64),
            token.get("name").and_then(Value::as_str),
        ) else {
            continue;
        };
        token_names.insert(index, name.to_uppercase());
    }

    for entry in &universe {
        let Some(obj) = entry.as_object() else { continue };
        let base = if !token_names.is_empty() {
            match obj.get("tokens").and_then(Value::as_array) {
                Some(pair) if pair.len() == 2 => pair[0]
                    .as_u64()
                    .and_then(|idx| token_names.get(&idx).cloned()),
                _ => fallback_base(obj),
            }
        } else {
            fallback_base(obj)
        };
        if let Some(base) = base {
            bases.insert(base.to_uppercase());
        }
    }
    bases
}

fn fallback_base(obj: &serde_json::Map<String, Value>) -> Option<String> {
    for key in ["base", "coin", "name", "symbol"] {
        if let Some(v) = obj.get(key).and_then(Value::as_str) {
            if !v.is_empty() {
                return Some(v.to_string());
            }
        }
    }
    None
}

fn perp_base_symbols(perp_meta: &Value) -> BTreeSet<String> {
    let mut bases = BTreeSet::new();
    let Some(universe) = perp_meta.get("universe").and_then(Value::as_array) else {
        return bases;
    };
    for entry in universe {
        let Some(obj) = entry.as_object() else { continue };
        for key in ["name", "symbol", "coin", "base"] {
            if let Some(v) = obj.get(key).and_then(Value::as_str) {
                if !v.is_empty() {
                    bases.insert(v.to_uppercase());
                    break;
                }
            }
        }
    }
    bases
}

fn asset_contexts(spot_meta: &Value) -> HashMap<String, Value> {
    let mut contexts = HashMap::new();
    let Some(ctxs) = spot_meta.get("assetCtxs").and_then(Value::as_array) else {
        return contexts;
    };
    for ctx in ctxs {
        let Some(obj) = ctx.as_object() else { continue };
        for key in ["coin", "base", "name"] {
            if let Some(coin) = obj.get(key).and_then(Value::as_str) {
                if !coin.is_empty() {
                    contexts.insert(coin.to_uppercase(), ctx.clone());
                    break;
                }
            }
        }
    }
    contexts
}

fn ctx_float(ctx: &Value, keys: &[&str]) -> Option<f64> {
    for key in keys {
        if let Some(v) = ctx.get(*key).and_then(|v| parse_float(v)) {
            return Some(v);
        }
    }
    None
}

fn spread_proxy(ctx: &Value) -> Option<f64> {
    let bid = ctx_float(ctx, &["bidPx", "bestBid", "bid"])?;
    let ask = ctx_float(ctx, &["askPx", "bestAsk", "ask"])?;
    if bid <= 0.0 || ask <= 0.0 {
        return None;
    }
    let mid = ctx_float(ctx, &["midPx", "markPx"])
        .filter(|m| *m > 0.0)
        .unwrap_or((bid + ask) / 2.0);
    if mid <= 0.0 {
        return None;
    }
    Some((ask - bid) / mid)
}

fn volume_proxy(ctx: &Value) -> Option<f64> {
    ctx_float(ctx, &["dayNtlVlm", "volume24h", "volume", "dayNotionalVolume"])
}

// =============================================================================
// Selection
// =============================================================================

/// Rank candidates from raw spot/perp metadata. Returns the selection and a
/// reason string describing the ranking applied.
pub fn select_auto_assets_from_meta(
    spot_meta_raw: &Value,
    perp_meta_raw: &Value,
    limit: usize,
    major_asset: &str,
) -> (Vec<String>, String) {
    let spot_meta = extract_meta_payload(spot_meta_raw);
    let perp_meta = extract_meta_payload(perp_meta_raw);

    let spot_bases = spot_base_symbols(&spot_meta);
    let perp_bases = perp_base_symbols(&perp_meta);
    let candidates: Vec<String> = spot_bases.intersection(&perp_bases).cloned().collect();

    let ctxs = asset_contexts(&spot_meta);
    let mut ranked: Vec<AutoAssetCandidate> = candidates
        .iter()
        .map(|symbol| {
            let ctx = ctxs.get(symbol);
            AutoAssetCandidate {
                symbol: symbol.clone(),
                spread: ctx.and_then(spread_proxy),
                volume_24h: ctx.and_then(volume_proxy),
            }
        })
        .collect();

    let has_spread = ranked.iter().any(|c| c.spread.is_some());
    let mut reason = if has_spread {
        "spread_desc_volume_asc".to_string()
    } else {
        "volume_asc".to_string()
    };

    // (spread missing last, spread descending, volume ascending)
    ranked.sort_by(|a, b| {
        let a_key = (
            a.spread.is_none(),
            -a.spread.unwrap_or(0.0),
            a.volume_24h.unwrap_or(f64::INFINITY),
        );
        let b_key = (
            b.spread.is_none(),
            -b.spread.unwrap_or(0.0),
            b.volume_24h.unwrap_or(f64::INFINITY),
        );
        a_key
            .partial_cmp(&b_key)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let limit = limit.max(1);
    let mut selected: Vec<String> = ranked.iter().take(limit).map(|c| c.symbol.clone()).collect();

    let major = major_asset.to_uppercase();
    if candidates.contains(&major) && !selected.contains(&major) {
        if selected.len() >= limit {
            selected.truncate(limit.saturating_sub(1));
        }
        selected.push(major.clone());
        reason = format!("{};major={}", reason, major);
    }

    (selected, reason)
}

/// Fetch metadata and run the selection
pub async fn select_auto_assets(
    info: &InfoClient,
    cfg: &SelectorSettings,
) -> Result<Vec<String>> {
    let spot_meta = info
        .fetch_spot_meta_and_asset_ctxs()
        .await
        .map_err(AppError::Exchange)?;
    let perp_meta = info.fetch_perp_meta().await.map_err(AppError::Exchange)?;
    let (selected, reason) =
        select_auto_assets_from_meta(&spot_meta, &perp_meta, cfg.limit, &cfg.major_asset);
    tracing::info!(selected = %selected.join(","), reason = %reason, "auto assets selected");
    Ok(selected)
}

// =============================================================================
// Preflight & warmup
// =============================================================================

/// Wait (bounded) for each asset's spot book to become valid. Returns
/// (kept, dropped); dropped assets never reach the decision engine.
pub async fn preflight_assets(
    store: &MarketStateStore,
    cfg: &SelectorSettings,
    assets: &[String],
) -> (Vec<String>, Vec<String>) {
    let deadline = tokio::time::Instant::now()
        + Duration::from_millis(cfg.preflight_timeout_ms);
    let poll = Duration::from_millis(cfg.preflight_poll_ms.max(1));

    let mut pending: BTreeSet<String> = assets.iter().cloned().collect();
    let mut kept = Vec::new();

    while !pending.is_empty() && tokio::time::Instant::now() < deadline {
        let mut validated = Vec::new();
        for asset in &pending {
            if let Some(state) = store.snapshot(asset).await {
                if state.spot.is_liquid() {
                    validated.push(asset.clone());
                }
            }
        }
        for asset in validated {
            pending.remove(&asset);
            kept.push(asset);
        }
        if pending.is_empty() {
            break;
        }
        tokio::time::sleep(poll).await;
    }

    let dropped: Vec<String> = pending.into_iter().collect();
    for asset in &dropped {
        tracing::warn!(asset = %asset, timeout_ms = cfg.preflight_timeout_ms, "spot book never validated, dropping asset");
    }
    kept.sort();
    (kept, dropped)
}

/// Observe each surviving asset for a bounded window and drop those whose
/// spot spread repeatedly exceeds the sanity cap or whose books repeatedly
/// lack a side (failure count at or above the threshold).
pub async fn warmup_assets(
    store: &MarketStateStore,
    cfg: &SelectorSettings,
    max_spot_spread_bps: f64,
    assets: &[String],
) -> (Vec<String>, Vec<String>) {
    let deadline = tokio::time::Instant::now() + Duration::from_millis(cfg.warmup_timeout_ms);
    let poll = Duration::from_millis(cfg.preflight_poll_ms.max(1));

    let mut failures: HashMap<String, u32> = HashMap::new();
    while tokio::time::Instant::now() < deadline {
        for asset in assets {
            let Some(state) = store.snapshot(asset).await else {
                continue;
            };
            let failed = if state.spot.best_bid <= 0.0 || state.spot.best_ask <= 0.0 {
                true
            } else {
                state
                    .spot
                    .spread_bps()
                    .map(|bps| bps > max_spot_spread_bps)
                    .unwrap_or(true)
            };
            if failed {
                *failures.entry(asset.clone()).or_insert(0) += 1;
            }
        }
        tokio::time::sleep(poll).await;
    }

    let mut kept = Vec::new();
    let mut dropped = Vec::new();
    for asset in assets {
        let count = failures.get(asset).copied().unwrap_or(0);
        if count >= cfg.warmup_max_failures {
            tracing::warn!(asset = %asset, failures = count, "warmup sanity failures, dropping asset");
            dropped.push(asset.clone());
        } else {
            kept.push(asset.clone());
        }
    }
    (kept, dropped)
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_select_prefers_high_spread_then_low_volume() {
        let spot_meta = json!({
            "universe": [
                {"tokens": [1, 2]},
                {"tokens": [3, 2]},
                {"tokens": [4, 2]}
            ],
            "tokens": [
                {"index": 1, "name": "AAA"},
                {"index": 3, "name": "BBB"},
                {"index": 4, "name": "CCC"},
                {"index": 2, "name": "USD"}
            ],
            "assetCtxs": [
                {"coin": "AAA", "bidPx": "99", "askPx": "101", "dayNtlVlm": "500"},
                {"coin": "BBB", "bidPx": "98", "askPx": "102", "dayNtlVlm": "100"},
                {"coin": "CCC", "bidPx": "99.5", "askPx": "100.5", "dayNtlVlm": "50"}
            ]
        });
        let perp_meta = json!({"universe": [{"name": "AAA"}, {"name": "BBB"}, {"name": "CCC"}]});

        let (selected, reason) =
            select_auto_assets_from_meta(&spot_meta, &perp_meta, 2, "ETH");

        assert_eq!(selected, vec!["BBB", "AAA"]);
        assert_eq!(reason, "spread_desc_volume_asc");
    }

    #[test]
    fn test_select_filters_to_intersection_and_adds_major() {
        let spot_meta = json!({
            "universe": [{"name": "AAA"}, {"name": "ETH"}, {"name": "SPOTONLY"}],
            "assetCtxs": [
                {"coin": "AAA", "dayNtlVlm": "500"},
                {"coin": "ETH", "dayNtlVlm": "2000"},
                {"coin": "SPOTONLY", "dayNtlVlm": "10"}
            ]
        });
        let perp_meta = json!({"universe": [{"name": "AAA"}, {"name": "ETH"}, {"name": "PERPONLY"}]});

        let (selected, reason) =
            select_auto_assets_from_meta(&spot_meta, &perp_meta, 1, "ETH");

        assert_eq!(selected, vec!["ETH"]);
        assert!(reason.contains("major=ETH"));
    }

    #[test]
    fn test_select_falls_back_to_volume_without_spread() {
        let spot_meta = json!({
            "universe": [{"name": "AAA"}, {"name": "BBB"}],
            "assetCtxs": [
                {"coin": "AAA", "dayNtlVlm": "1000"},
                {"coin": "BBB", "dayNtlVlm": "10"}
            ]
        });
        let perp_meta = json!({"universe": [{"name": "AAA"}, {"name": "BBB"}]});

        let (selected, reason) =
            select_auto_assets_from_meta(&spot_meta, &perp_meta, 1, "ETH");

        assert_eq!(selected, vec!["BBB"], "lowest volume first");
        assert_eq!(reason, "volume_asc");
    }

    #[test]
    fn test_list_envelope_is_merged() {
        let spot_meta = json!([
            {"universe": [{"name": "AAA"}]},
            {"assetCtxs": [{"coin": "AAA", "dayNtlVlm": "5"}]}
        ]);
        let perp_meta = json!({"universe": [{"name": "AAA"}]});
        let (selected, _) = select_auto_assets_from_meta(&spot_meta, &perp_meta, 5, "ETH");
        assert_eq!(selected, vec!["AAA"]);
    }

    #[tokio::test]
    async fn test_preflight_drops_never_liquid_asset() {
        let store = MarketStateStore::new();
        store.ensure("BTC").await;
        store.ensure("ETH").await;
        store
            .apply_book(
                "ETH",
                crate::core::state::MarketKind::Spot,
                crate::core::state::BookQuote::new(100.0, 101.0, 1),
            )
            .await;

        let cfg = SelectorSettings {
            preflight_timeout_ms: 200,
            preflight_poll_ms: 20,
            ..SelectorSettings::default()
        };
        let assets = vec!["BTC".to_string(), "ETH".to_string()];
        let (kept, dropped) = preflight_assets(&store, &cfg, &assets).await;
        assert_eq!(kept, vec!["ETH"]);
        assert_eq!(dropped, vec!["BTC"]);
    }

    #[tokio::test]
    async fn test_preflight_keeps_asset_that_validates_late() {
        use std::sync::Arc;
        let store = Arc::new(MarketStateStore::new());
        store.ensure("BTC").await;

        let writer = Arc::clone(&store);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(60)).await;
            writer
                .apply_book(
                    "BTC",
                    crate::core::state::MarketKind::Spot,
                    crate::core::state::BookQuote::new(100.0, 101.0, 1),
                )
                .await;
        });

        let cfg = SelectorSettings {
            preflight_timeout_ms: 500,
            preflight_poll_ms: 20,
            ..SelectorSettings::default()
        };
        let assets = vec!["BTC".to_string()];
        let (kept, dropped) = preflight_assets(&store, &cfg, &assets).await;
        assert_eq!(kept, vec!["BTC"]);
        assert!(dropped.is_empty());
    }

    #[tokio::test]
    async fn test_warmup_drops_wide_spread_asset() {
        let store = MarketStateStore::new();
        // 200 bps spread against a 100 bps cap
        store
            .apply_book(
                "BTC",
                crate::core::state::MarketKind::Spot,
                crate::core::state::BookQuote::new(100.0, 102.0, 1),
            )
            .await;
        store
            .apply_book(
                "ETH",
                crate::core::state::MarketKind::Spot,
                crate::core::state::BookQuote::new(100.0, 100.5, 1),
            )
            .await;

        let cfg = SelectorSettings {
            warmup_timeout_ms: 200,
            preflight_poll_ms: 20,
            warmup_max_failures: 3,
            ..SelectorSettings::default()
        };
        let assets = vec!["BTC".to_string(), "ETH".to_string()];
        let (kept, dropped) = warmup_assets(&store, &cfg, 100.0, &assets).await;
        assert_eq!(kept, vec!["ETH"]);
        assert_eq!(dropped, vec!["BTC"]);
    }
}
