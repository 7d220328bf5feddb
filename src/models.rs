//! Shared data structures used throughout the application.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Ordered asset pair, e.g. ALGO/USDC. Symbols are upper-cased on construction.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AssetPair {
    pub asset_a: String,
    pub asset_b: String,
}

impl AssetPair {
    pub fn new(asset_a: &str, asset_b: &str) -> Self {
        Self {
            asset_a: asset_a.trim().to_uppercase(),
            asset_b: asset_b.trim().to_uppercase(),
        }
    }

    /// Parse `"ALGO/USDC"`.
    pub fn parse(raw: &str) -> Option<Self> {
        let (a, b) = raw.split_once('/')?;
        if a.trim().is_empty() || b.trim().is_empty() {
            return None;
        }
        Some(Self::new(a, b))
    }
}

impl fmt::Display for AssetPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.asset_a, self.asset_b)
    }
}

/// Market state observed on one protocol for one pair during one scan cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketSnapshot {
    pub protocol: String,
    pub asset_pair: AssetPair,
    /// Units of `asset_b` per one `asset_a`.
    pub price: f64,
    /// Pool reserves `(asset_a, asset_b)` when the source reports them.
    pub reserves: Option<(f64, f64)>,
    pub observed_at: DateTime<Utc>,
}

/// Static liquidity classification of a protocol. Ordered low to high.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LiquidityTier {
    Low,
    Medium,
    High,
}

impl LiquidityTier {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "low" => Some(Self::Low),
            "medium" => Some(Self::Medium),
            "high" => Some(Self::High),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

impl From<LiquidityTier> for RiskLevel {
    fn from(tier: LiquidityTier) -> Self {
        match tier {
            LiquidityTier::High => RiskLevel::Low,
            LiquidityTier::Medium => RiskLevel::Medium,
            LiquidityTier::Low => RiskLevel::High,
        }
    }
}

/// Cross-protocol price differential on one pair: buy where it is cheap, sell where it is dear.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Opportunity {
    /// Stable reference used by execution results, `pair:buy->sell@millis`.
    pub id: String,
    pub asset_pair: AssetPair,
    pub buy_protocol: String,
    pub sell_protocol: String,
    pub buy_price: f64,
    pub sell_price: f64,
    /// Fractional, 0.03 means 3%.
    pub profit_potential: f64,
    pub risk_level: RiskLevel,
    pub liquidity: LiquidityTier,
    /// Always within `[0, 1]`.
    pub confidence_score: f64,
    pub detected_at: DateTime<Utc>,
}

impl Opportunity {
    pub fn protocols(&self) -> [&str; 2] {
        [self.buy_protocol.as_str(), self.sell_protocol.as_str()]
    }

    pub fn rank_score(&self) -> f64 {
        self.profit_potential * self.confidence_score
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Submitted,
    Confirmed,
    Failed,
    TimedOut,
}

impl ExecutionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ExecutionStatus::Confirmed | ExecutionStatus::Failed | ExecutionStatus::TimedOut
        )
    }
}

/// Audit record of one execution attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub opportunity_ref: String,
    pub status: ExecutionStatus,
    pub tx_reference: Option<String>,
    pub error: Option<String>,
    /// Pre-submission delivery attempts made for this execution.
    pub delivery_attempts: u32,
    pub attempted_at: DateTime<Utc>,
    pub resolved_at: DateTime<Utc>,
}

/// One persisted valuation update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortfolioSnapshot {
    pub sequence: u64,
    pub observed_nav_usd: f64,
    pub previous_nav_usd: f64,
    /// Funding attributed to this update.
    pub funding_delta_usd: f64,
    /// Cumulative external deposits since tracking began.
    pub external_funding_usd: f64,
    /// Trading profit attributed to this update.
    pub profit_delta_usd: f64,
    /// Cumulative trading profit since tracking began.
    pub realized_trading_profit_usd: f64,
    pub trading_roi: f64,
    pub safety_stop: bool,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SupervisorState {
    Starting,
    Running,
    Stalled,
    Crashed,
    Restarting,
    Stopped,
    Halted,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthRecord {
    pub state: SupervisorState,
    pub process_alive: bool,
    pub last_progress_at: DateTime<Utc>,
    pub restart_count: u64,
    pub last_error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl HealthRecord {
    pub fn starting(now: DateTime<Utc>) -> Self {
        Self {
            state: SupervisorState::Starting,
            process_alive: false,
            last_progress_at: now,
            restart_count: 0,
            last_error: None,
            updated_at: now,
        }
    }
}
