use super::tiers::TierTable;
use crate::config::AppConfig;

/// Configuration for opportunity detection
#[derive(Debug, Clone)]
pub struct DetectorConfig {
    /// Fractional differential below which a candidate is discarded.
    pub min_profit_threshold: f64,
    pub tiers: TierTable,
}

impl DetectorConfig {
    pub fn new(min_profit_threshold: f64) -> Self {
        Self {
            min_profit_threshold,
            tiers: TierTable::default(),
        }
    }

    pub fn from_app_config(cfg: &AppConfig) -> Self {
        let mut tiers = TierTable::default();
        for p in &cfg.protocols {
            if let Some(tier) = p.tier {
                tiers.set(&p.name, tier);
            }
        }
        Self {
            min_profit_threshold: cfg.min_profit_threshold,
            tiers,
        }
    }
}
