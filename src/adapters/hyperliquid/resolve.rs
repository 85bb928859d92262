//! Two-phase spot coin resolution
//!
//! Spot books subscribe under either a short internal index form (`@{n}`,
//! derived from the spot metadata token table) or the canonical
//! `"BASE/QUOTE"` pair string. The primary candidate is tried first; if no
//! book message arrives for the asset within a bounded wait, the fallback is
//! subscribed as well. A small fixed set of bases always use the canonical
//! string and skip resolution entirely.
//!
//! Modeled as an explicit state machine rather than ad hoc flags:
//! `Resolving → Confirmed(Primary | Fallback) | Unresolved`.

use std::collections::HashMap;

use serde_json::Value;

/// Bases that always subscribe under the canonical pair string
const CANONICAL_ONLY_BASES: &[&str] = &["PURR", "HYPE"];

/// Which subscription path ended up delivering data
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolvedVia {
    Primary,
    Fallback,
}

/// Resolution progress for one asset's spot subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolutionState {
    /// Primary sent, fallback not yet needed
    Resolving,
    /// A book message arrived for one of the candidates
    Confirmed(ResolvedVia),
    /// Fallback sent too, still no data
    Unresolved,
}

/// Spot coin resolution state machine for one asset
#[derive(Debug, Clone)]
pub struct SpotCoinResolution {
    asset: String,
    primary: String,
    fallback: String,
    state: ResolutionState,
}

impl SpotCoinResolution {
    /// Build the resolution for an asset given the index table derived from
    /// spot metadata. Without an index entry the canonical string is both
    /// primary and fallback (nothing to fall back to).
    pub fn new(asset: &str, quote_asset: &str, index_table: &HashMap<String, String>) -> Self {
        let canonical = format!("{}/{}", asset, quote_asset);
        let bypass = CANONICAL_ONLY_BASES.contains(&asset);
        let primary = if bypass {
            canonical.clone()
        } else {
            index_table.get(asset).cloned().unwrap_or_else(|| canonical.clone())
        };
        Self {
            asset: asset.to_string(),
            primary,
            fallback: canonical,
            state: ResolutionState::Resolving,
        }
    }

    pub fn asset(&self) -> &str {
        &self.asset
    }

    pub fn state(&self) -> ResolutionState {
        self.state
    }

    /// Coin id to subscribe first
    pub fn primary_coin(&self) -> &str {
        &self.primary
    }

    /// Canonical fallback coin id
    pub fn fallback_coin(&self) -> &str {
        &self.fallback
    }

    /// Coins this resolution currently listens on
    pub fn active_coins(&self) -> Vec<&str> {
        match self.state {
            ResolutionState::Resolving => vec![self.primary.as_str()],
            ResolutionState::Confirmed(ResolvedVia::Primary) => vec![self.primary.as_str()],
            ResolutionState::Confirmed(ResolvedVia::Fallback) => vec![self.fallback.as_str()],
            ResolutionState::Unresolved => vec![self.primary.as_str(), self.fallback.as_str()],
        }
    }

    /// Whether a fallback subscribe is still worth sending
    pub fn fallback_pending(&self) -> bool {
        self.state == ResolutionState::Resolving && self.primary != self.fallback
    }

    /// The deadline expired with no data on the primary: move to Unresolved
    /// (caller sends the fallback subscribe). No-op once confirmed.
    pub fn on_deadline(&mut self) {
        if self.state == ResolutionState::Resolving {
            self.state = ResolutionState::Unresolved;
        }
    }

    /// A book message arrived for `coin`. Returns `Some(via)` the first time
    /// one of this resolution's candidates is confirmed.
    pub fn on_book_received(&mut self, coin: &str) -> Option<ResolvedVia> {
        if matches!(self.state, ResolutionState::Confirmed(_)) {
            return None;
        }
        let via = if coin == self.primary {
            ResolvedVia::Primary
        } else if coin == self.fallback {
            ResolvedVia::Fallback
        } else {
            return None;
        };
        self.state = ResolutionState::Confirmed(via);
        Some(via)
    }

    /// Does `coin` belong to this asset's spot subscription?
    pub fn owns_coin(&self, coin: &str) -> bool {
        coin == self.primary || coin == self.fallback
    }

    /// Restart resolution for a fresh connection lifetime. A confirmed
    /// resolution is kept (the confirmed coin is simply resubscribed).
    pub fn reset_for_reconnect(&mut self) {
        if !matches!(self.state, ResolutionState::Confirmed(_)) {
            self.state = ResolutionState::Resolving;
        }
    }
}

/// Build the base-symbol → `@{index}` table from spot metadata.
///
/// Universe entries name their base token by index into the token table; the
/// subscription id is the entry's `name` when it is already an index form,
/// otherwise `@{index}`.
pub fn build_index_table(spot_meta: &Value) -> HashMap<String, String> {
    let mut table = HashMap::new();

    let tokens = spot_meta.get("tokens").and_then(Value::as_array);
    let universe = spot_meta.get("universe").and_then(Value::as_array);
    let (Some(tokens), Some(universe)) = (tokens, universe) else {
        return table;
    };

    let mut token_names: HashMap<u64, String> = HashMap::new();
    for token in tokens {
        let (Some(index), Some(name)) = (
            token.get("index").and_then(Value::as_u64),
            token.get("name").and_then(Value::as_str),
        ) else {
            continue;
        };
        token_names.insert(index, name.to_uppercase());
    }

    for entry in universe {
        let Some(pair) = entry.get("tokens").and_then(Value::as_array) else {
            continue;
        };
        if pair.len() != 2 {
            continue;
        }
        let Some(base_idx) = pair[0].as_u64() else {
            continue;
        };
        let Some(base) = token_names.get(&base_idx) else {
            continue;
        };
        let coin = match entry.get("name").and_then(Value::as_str) {
            Some(name) if name.starts_with('@') => name.to_string(),
            _ => match entry.get("index").and_then(Value::as_u64) {
                Some(idx) => format!("@{}", idx),
                None => continue,
            },
        };
        table.entry(base.clone()).or_insert(coin);
    }

    table
}
