use super::tiers::tier_confidence;
use super::types::DetectorConfig;
use crate::models::{AssetPair, MarketSnapshot, Opportunity, RiskLevel};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use tracing::{debug, warn};

/// Differentials above this are more likely stale or broken data than real spreads.
pub const SUSPICIOUS_SPREAD: f64 = 0.5;

/// Detect cross-protocol opportunities in one complete batch of snapshots.
///
/// Pure with respect to its input: the same batch always yields the same
/// opportunities (apart from `detected_at`). Results are ranked by
/// `profit_potential * confidence_score`, higher liquidity first on ties.
pub fn detect(snapshots: &[MarketSnapshot], config: &DetectorConfig) -> Vec<Opportunity> {
    let detected_at = Utc::now();

    // Latest usable quote per (pair, protocol).
    let mut by_pair: BTreeMap<&AssetPair, BTreeMap<&str, &MarketSnapshot>> = BTreeMap::new();
    for snap in snapshots {
        if !(snap.price.is_finite() && snap.price > 0.0) {
            warn!(
                protocol = %snap.protocol,
                pair = %snap.asset_pair,
                price = snap.price,
                "[DETECT] dropping snapshot with unusable price"
            );
            continue;
        }
        let quotes = by_pair.entry(&snap.asset_pair).or_default();
        match quotes.get(snap.protocol.as_str()) {
            Some(prev) if prev.observed_at > snap.observed_at => {}
            _ => {
                quotes.insert(snap.protocol.as_str(), snap);
            }
        }
    }

    let mut opportunities: Vec<Opportunity> = by_pair
        .into_iter()
        .filter_map(|(pair, quotes)| evaluate_pair(pair, &quotes, config, detected_at))
        .collect();

    opportunities.sort_by(|a, b| {
        b.rank_score()
            .total_cmp(&a.rank_score())
            .then_with(|| b.liquidity.cmp(&a.liquidity))
            .then_with(|| a.id.cmp(&b.id))
    });
    opportunities
}

/// Buy on the cheapest protocol, sell on the dearest one.
fn evaluate_pair(
    pair: &AssetPair,
    quotes: &BTreeMap<&str, &MarketSnapshot>,
    config: &DetectorConfig,
    detected_at: DateTime<Utc>,
) -> Option<Opportunity> {
    // Arbitrage needs two independent markets.
    if quotes.len() < 2 {
        return None;
    }
    let buy = quotes.values().min_by(|a, b| a.price.total_cmp(&b.price))?;
    let sell = quotes.values().max_by(|a, b| a.price.total_cmp(&b.price))?;
    if buy.protocol == sell.protocol || sell.price <= buy.price {
        return None;
    }

    let profit_potential = (sell.price - buy.price) / buy.price;
    if profit_potential < config.min_profit_threshold {
        debug!(
            pair = %pair,
            profit_potential,
            threshold = config.min_profit_threshold,
            "[DETECT] below threshold"
        );
        return None;
    }

    let liquidity = config
        .tiers
        .tier_of(&buy.protocol)
        .min(config.tiers.tier_of(&sell.protocol));
    let mut confidence = tier_confidence(liquidity);
    if profit_potential > SUSPICIOUS_SPREAD {
        confidence *= 0.5;
    }

    Some(Opportunity {
        id: format!(
            "{pair}:{}->{}@{}",
            buy.protocol,
            sell.protocol,
            detected_at.timestamp_millis()
        ),
        asset_pair: pair.clone(),
        buy_protocol: buy.protocol.clone(),
        sell_protocol: sell.protocol.clone(),
        buy_price: buy.price,
        sell_price: sell.price,
        profit_potential,
        risk_level: RiskLevel::from(liquidity),
        liquidity,
        confidence_score: confidence.clamp(0.0, 1.0),
        detected_at,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::LiquidityTier;
    use chrono::Duration;

    fn snap(protocol: &str, pair: &str, price: f64) -> MarketSnapshot {
        MarketSnapshot {
            protocol: protocol.into(),
            asset_pair: AssetPair::parse(pair).expect("pair"),
            price,
            reserves: None,
            observed_at: Utc::now(),
        }
    }

    fn cfg() -> DetectorConfig {
        DetectorConfig::new(0.03)
    }

    #[test]
    fn tinyman_pact_scenario() {
        let opps = detect(
            &[snap("tinyman", "ALGO/USDC", 0.99), snap("pact", "ALGO/USDC", 1.03)],
            &cfg(),
        );
        assert_eq!(opps.len(), 1);
        let opp = &opps[0];
        assert!((opp.profit_potential - 0.04).abs() < 0.001, "{}", opp.profit_potential);
        assert_eq!(opp.buy_protocol, "tinyman");
        assert_eq!(opp.sell_protocol, "pact");
        let mut protocols = opp.protocols().to_vec();
        protocols.sort();
        assert_eq!(protocols, vec!["pact", "tinyman"]);
        assert_eq!(opp.liquidity, LiquidityTier::Medium);
        assert_eq!(opp.risk_level, RiskLevel::Medium);
    }

    #[test]
    fn single_protocol_pair_yields_nothing() {
        let opps = detect(
            &[
                snap("tinyman", "ALGO/USDC", 0.90),
                snap("tinyman", "ALGO/USDC", 1.20),
                snap("pact", "ALGO/USDT", 1.50),
            ],
            &cfg(),
        );
        assert!(opps.is_empty());
    }

    #[test]
    fn below_threshold_never_appears() {
        let batch = [
            snap("tinyman", "ALGO/USDC", 1.00),
            snap("pact", "ALGO/USDC", 1.02),
            snap("tinyman", "ALGO/USDT", 1.00),
            snap("pact", "ALGO/USDT", 1.10),
        ];
        for threshold in [0.0, 0.01, 0.02, 0.05, 0.1, 0.2] {
            let opps = detect(&batch, &DetectorConfig::new(threshold));
            assert!(opps.iter().all(|o| o.profit_potential >= threshold));
        }
        let opps = detect(&batch, &cfg());
        assert_eq!(opps.len(), 1);
        assert_eq!(opps[0].asset_pair, AssetPair::new("ALGO", "USDT"));
    }

    #[test]
    fn picks_widest_spread_among_many_protocols() {
        let opps = detect(
            &[
                snap("tinyman", "ALGO/USDC", 1.00),
                snap("pact", "ALGO/USDC", 1.05),
                snap("folks", "ALGO/USDC", 0.95),
            ],
            &cfg(),
        );
        assert_eq!(opps.len(), 1);
        assert_eq!(opps[0].buy_protocol, "folks");
        assert_eq!(opps[0].sell_protocol, "pact");
    }

    #[test]
    fn ranks_by_score_then_liquidity() {
        let mut table = cfg();
        table.tiers.set("deep", LiquidityTier::High);
        table.tiers.set("deep2", LiquidityTier::High);
        let opps = detect(
            &[
                // 10% on low liquidity: 0.10 * 0.5 = 0.05
                snap("humble", "A/B", 1.00),
                snap("other", "A/B", 1.10),
                // 8% on high liquidity: 0.08 * 0.9 = 0.072
                snap("deep", "C/D", 1.00),
                snap("deep2", "C/D", 1.08),
            ],
            &table,
        );
        assert_eq!(opps.len(), 2);
        assert_eq!(opps[0].asset_pair, AssetPair::new("C", "D"));
        assert!(opps[0].rank_score() > opps[1].rank_score());
    }

    #[test]
    fn equal_scores_prefer_deeper_liquidity() {
        let mut table = cfg();
        table.tiers.set("m1", LiquidityTier::Medium);
        table.tiers.set("m2", LiquidityTier::Medium);
        // 0.1875 * 0.5 == 0.125 * 0.75, exact in binary
        let opps = detect(
            &[
                snap("l1", "A/B", 1.0),
                snap("l2", "A/B", 1.1875),
                snap("m1", "C/D", 1.0),
                snap("m2", "C/D", 1.125),
            ],
            &table,
        );
        assert_eq!(opps.len(), 2);
        assert_eq!(opps[0].rank_score(), opps[1].rank_score());
        assert_eq!(opps[0].liquidity, LiquidityTier::Medium);
        assert_eq!(opps[1].liquidity, LiquidityTier::Low);
    }

    #[test]
    fn drops_bad_prices_and_keeps_latest_quote() {
        let mut stale = snap("pact", "ALGO/USDC", 2.00);
        stale.observed_at = Utc::now() - Duration::seconds(60);
        let opps = detect(
            &[
                snap("tinyman", "ALGO/USDC", f64::NAN),
                snap("folks", "ALGO/USDC", 1.00),
                snap("pact", "ALGO/USDC", 1.04),
                stale,
            ],
            &cfg(),
        );
        assert_eq!(opps.len(), 1);
        assert_eq!(opps[0].buy_protocol, "folks");
        assert!((opps[0].sell_price - 1.04).abs() < 1e-12);
    }

    #[test]
    fn confidence_is_clamped_and_penalized_for_wild_spreads() {
        let mut table = cfg();
        table.tiers.set("x", LiquidityTier::High);
        table.tiers.set("y", LiquidityTier::High);
        let opps = detect(&[snap("x", "A/B", 1.0), snap("y", "A/B", 3.0)], &table);
        assert_eq!(opps.len(), 1);
        let c = opps[0].confidence_score;
        assert!((0.0..=1.0).contains(&c));
        assert!((c - 0.45).abs() < 1e-9);
    }
}
