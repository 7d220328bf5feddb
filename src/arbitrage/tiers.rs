//! Static liquidity classification of known protocols.

use crate::models::LiquidityTier;
use std::collections::HashMap;

/// Built-in classification. Protocols not listed are treated as low liquidity.
const KNOWN_TIERS: &[(&str, LiquidityTier)] = &[
    ("tinyman", LiquidityTier::High),
    ("pact", LiquidityTier::Medium),
    ("folks", LiquidityTier::Medium),
    ("humble", LiquidityTier::Low),
];

#[derive(Debug, Clone)]
pub struct TierTable {
    tiers: HashMap<String, LiquidityTier>,
}

impl Default for TierTable {
    fn default() -> Self {
        Self {
            tiers: KNOWN_TIERS
                .iter()
                .map(|(name, tier)| (name.to_string(), *tier))
                .collect(),
        }
    }
}

impl TierTable {
    pub fn set(&mut self, protocol: &str, tier: LiquidityTier) {
        self.tiers.insert(protocol.to_ascii_lowercase(), tier);
    }

    pub fn tier_of(&self, protocol: &str) -> LiquidityTier {
        self.tiers
            .get(&protocol.to_ascii_lowercase())
            .copied()
            .unwrap_or(LiquidityTier::Low)
    }
}

/// Base confidence granted to an opportunity whose weaker leg has `tier`.
pub fn tier_confidence(tier: LiquidityTier) -> f64 {
    match tier {
        LiquidityTier::High => 0.9,
        LiquidityTier::Medium => 0.75,
        LiquidityTier::Low => 0.5,
    }
}
