//! Configuration loader and application settings.

use crate::errors::{AppError, Result};
use crate::models::{AssetPair, LiquidityTier};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use url::Url;

/// One protocol data source.
#[derive(Debug, Clone, PartialEq)]
pub struct ProtocolEndpoint {
    pub name: String,
    pub base_url: Url,
    /// Overrides the built-in liquidity classification.
    pub tier: Option<LiquidityTier>,
    pub enabled: bool,
}

/// Consolidated application configuration.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub scan_interval_seconds: u64,
    /// Fractional, 0.03 means 3%.
    pub min_profit_threshold: f64,
    pub execution_timeout_seconds: u64,
    pub max_concurrent_executions: usize,
    pub liveness_timeout_seconds: u64,
    pub max_retry_attempts: u32,
    pub retry_backoff_base_seconds: f64,

    pub fetch_timeout_seconds: u64,
    pub max_connections_per_host: usize,
    pub max_connections_total: usize,
    pub pool_idle_timeout_seconds: u64,

    pub health_check_interval_seconds: u64,
    pub restart_cooldown_seconds: u64,
    pub max_restarts_per_window: usize,
    pub restart_window_seconds: u64,

    pub protocols: Vec<ProtocolEndpoint>,
    pub pairs: Vec<AssetPair>,

    /// Signer/broadcaster collaborator. Execution is disabled without it.
    pub broadcaster_url: Option<Url>,
    /// Portfolio valuation endpoint. NAV tracking is disabled without it.
    pub nav_url: Option<Url>,

    pub trade_size_usd: f64,
    pub max_trade_usd: f64,
    pub max_slippage: f64,
    pub max_opportunities_per_cycle: usize,
    pub safety_stop_nav_usd: Option<f64>,

    pub data_dir: PathBuf,
    pub archive_opportunities: bool,
    pub log_level: String,
    pub log_json: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            scan_interval_seconds: 30,
            min_profit_threshold: 0.03,
            execution_timeout_seconds: 30,
            max_concurrent_executions: 1,
            liveness_timeout_seconds: 300,
            max_retry_attempts: 3,
            retry_backoff_base_seconds: 1.0,
            fetch_timeout_seconds: 10,
            max_connections_per_host: 4,
            max_connections_total: 16,
            pool_idle_timeout_seconds: 90,
            health_check_interval_seconds: 10,
            restart_cooldown_seconds: 5,
            max_restarts_per_window: 5,
            restart_window_seconds: 600,
            protocols: Vec::new(),
            pairs: Vec::new(),
            broadcaster_url: None,
            nav_url: None,
            trade_size_usd: 25.0,
            max_trade_usd: 100.0,
            max_slippage: 0.01,
            max_opportunities_per_cycle: 3,
            safety_stop_nav_usd: None,
            data_dir: PathBuf::from("./data"),
            archive_opportunities: false,
            log_level: "info".to_string(),
            log_json: false,
        }
    }
}

impl AppConfig {
    /// Load configuration from `.env` and the process environment.
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build configuration from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let d = Self::default();
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let disabled: Vec<String> = get("DISABLED_PROTOCOLS")
            .map(|raw| {
                raw.split(',')
                    .map(|s| s.trim().to_ascii_lowercase())
                    .filter(|s| !s.is_empty())
                    .collect()
            })
            .unwrap_or_default();
        let protocols = parse_protocols(
            &get("PROTOCOLS").ok_or_else(|| missing("PROTOCOLS"))?,
            &disabled,
        )?;
        let pairs = parse_pairs(&get("PAIRS").ok_or_else(|| missing("PAIRS"))?)?;

        let cfg = Self {
            scan_interval_seconds: parse_or(
                &get,
                "SCAN_INTERVAL_SECONDS",
                d.scan_interval_seconds,
            )?,
            min_profit_threshold: parse_or(&get, "MIN_PROFIT_THRESHOLD", d.min_profit_threshold)?,
            execution_timeout_seconds: parse_or(
                &get,
                "EXECUTION_TIMEOUT_SECONDS",
                d.execution_timeout_seconds,
            )?,
            max_concurrent_executions: parse_or(
                &get,
                "MAX_CONCURRENT_EXECUTIONS",
                d.max_concurrent_executions,
            )?,
            liveness_timeout_seconds: parse_or(
                &get,
                "LIVENESS_TIMEOUT_SECONDS",
                d.liveness_timeout_seconds,
            )?,
            max_retry_attempts: parse_or(&get, "MAX_RETRY_ATTEMPTS", d.max_retry_attempts)?,
            retry_backoff_base_seconds: parse_or(
                &get,
                "RETRY_BACKOFF_BASE_SECONDS",
                d.retry_backoff_base_seconds,
            )?,
            fetch_timeout_seconds: parse_or(
                &get,
                "FETCH_TIMEOUT_SECONDS",
                d.fetch_timeout_seconds,
            )?,
            max_connections_per_host: parse_or(
                &get,
                "MAX_CONNECTIONS_PER_HOST",
                d.max_connections_per_host,
            )?,
            max_connections_total: parse_or(
                &get,
                "MAX_CONNECTIONS_TOTAL",
                d.max_connections_total,
            )?,
            pool_idle_timeout_seconds: parse_or(
                &get,
                "POOL_IDLE_TIMEOUT_SECONDS",
                d.pool_idle_timeout_seconds,
            )?,
            health_check_interval_seconds: parse_or(
                &get,
                "HEALTH_CHECK_INTERVAL_SECONDS",
                d.health_check_interval_seconds,
            )?,
            restart_cooldown_seconds: parse_or(
                &get,
                "RESTART_COOLDOWN_SECONDS",
                d.restart_cooldown_seconds,
            )?,
            max_restarts_per_window: parse_or(
                &get,
                "MAX_RESTARTS_PER_WINDOW",
                d.max_restarts_per_window,
            )?,
            restart_window_seconds: parse_or(
                &get,
                "RESTART_WINDOW_SECONDS",
                d.restart_window_seconds,
            )?,
            protocols,
            pairs,
            broadcaster_url: get("BROADCASTER_URL").map(|u| parse_base_url(&u)).transpose()?,
            nav_url: get("NAV_URL").map(|u| Url::parse(&u)).transpose()?,
            trade_size_usd: parse_or(&get, "TRADE_SIZE_USD", d.trade_size_usd)?,
            max_trade_usd: parse_or(&get, "MAX_TRADE_USD", d.max_trade_usd)?,
            max_slippage: parse_or(&get, "MAX_SLIPPAGE", d.max_slippage)?,
            max_opportunities_per_cycle: parse_or(
                &get,
                "MAX_OPPORTUNITIES_PER_CYCLE",
                d.max_opportunities_per_cycle,
            )?,
            safety_stop_nav_usd: get("SAFETY_STOP_NAV_USD")
                .map(|v| parse_value::<f64>("SAFETY_STOP_NAV_USD", &v))
                .transpose()?,
            data_dir: get("DATA_DIR").map(PathBuf::from).unwrap_or(d.data_dir),
            archive_opportunities: get("ARCHIVE_OPPORTUNITIES")
                .map(|v| parse_flag(&v))
                .unwrap_or(d.archive_opportunities),
            log_level: get("LOG_LEVEL").unwrap_or(d.log_level),
            log_json: get("LOG_JSON").map(|v| parse_flag(&v)).unwrap_or(d.log_json),
        };
        cfg.validate()?;
        Ok(cfg)
    }

    /// Reject values that would make the pipeline meaningless or unbounded.
    pub fn validate(&self) -> Result<()> {
        let checks: [(bool, &str); 14] = [
            (self.scan_interval_seconds > 0, "SCAN_INTERVAL_SECONDS must be > 0"),
            (
                self.min_profit_threshold.is_finite() && self.min_profit_threshold >= 0.0,
                "MIN_PROFIT_THRESHOLD must be a non-negative fraction",
            ),
            (self.execution_timeout_seconds > 0, "EXECUTION_TIMEOUT_SECONDS must be > 0"),
            (self.max_concurrent_executions > 0, "MAX_CONCURRENT_EXECUTIONS must be > 0"),
            (self.liveness_timeout_seconds > 0, "LIVENESS_TIMEOUT_SECONDS must be > 0"),
            (self.max_retry_attempts > 0, "MAX_RETRY_ATTEMPTS must be > 0"),
            (
                self.retry_backoff_base_seconds.is_finite()
                    && self.retry_backoff_base_seconds >= 0.0,
                "RETRY_BACKOFF_BASE_SECONDS must be >= 0",
            ),
            (
                self.max_connections_per_host > 0
                    && self.max_connections_total >= self.max_connections_per_host,
                "connection limits must be > 0 and total >= per-host",
            ),
            (self.max_restarts_per_window > 0, "MAX_RESTARTS_PER_WINDOW must be > 0"),
            (
                self.trade_size_usd.is_finite() && self.trade_size_usd > 0.0,
                "TRADE_SIZE_USD must be > 0",
            ),
            (
                self.max_trade_usd.is_finite() && self.max_trade_usd > 0.0,
                "MAX_TRADE_USD must be > 0",
            ),
            (
                self.safety_stop_nav_usd
                    .is_none_or(|floor| floor.is_finite() && floor >= 0.0),
                "SAFETY_STOP_NAV_USD must be >= 0",
            ),
            (
                self.max_slippage.is_finite() && (0.0..1.0).contains(&self.max_slippage),
                "MAX_SLIPPAGE must be within [0, 1)",
            ),
            (!self.pairs.is_empty(), "PAIRS must name at least one pair"),
        ];
        for (ok, msg) in checks {
            if !ok {
                return Err(AppError::Config(msg.to_string()));
            }
        }
        // The heartbeat only moves once a whole cycle is done.
        let cycle = self.worst_case_cycle();
        if self.liveness_timeout() <= cycle {
            return Err(AppError::Config(format!(
                "LIVENESS_TIMEOUT_SECONDS must exceed one worst-case cycle ({}s)",
                cycle.as_secs()
            )));
        }
        if self.protocols.iter().filter(|p| p.enabled).count() < 2 {
            return Err(AppError::Config(
                "at least two enabled PROTOCOLS are required for cross-protocol arbitrage".into(),
            ));
        }
        Ok(())
    }

    pub fn enabled_protocols(&self) -> impl Iterator<Item = &ProtocolEndpoint> {
        self.protocols.iter().filter(|p| p.enabled)
    }

    pub fn scan_interval(&self) -> Duration {
        Duration::from_secs(self.scan_interval_seconds)
    }

    pub fn execution_timeout(&self) -> Duration {
        Duration::from_secs(self.execution_timeout_seconds)
    }

    pub fn liveness_timeout(&self) -> Duration {
        Duration::from_secs(self.liveness_timeout_seconds)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_seconds)
    }

    /// Interval wait, fetch and NAV reads, plus submit and confirm.
    pub fn worst_case_cycle(&self) -> Duration {
        self.scan_interval() + self.execution_timeout() * 2 + self.fetch_timeout() * 2
    }
}

fn missing(key: &str) -> AppError {
    AppError::Config(format!("{key} is not set"))
}

fn parse_value<T: FromStr>(key: &str, raw: &str) -> Result<T> {
    raw.trim()
        .parse::<T>()
        .map_err(|_| AppError::Config(format!("{key}={raw:?} is not a valid value")))
}

fn parse_or<T, G>(get: &G, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        Some(raw) => parse_value(key, &raw),
        None => Ok(default),
    }
}

fn parse_flag(raw: &str) -> bool {
    matches!(
        raw.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

/// `tinyman=https://a.example;high,pact=https://b.example`
fn parse_protocols(raw: &str, disabled: &[String]) -> Result<Vec<ProtocolEndpoint>> {
    let mut out: Vec<ProtocolEndpoint> = Vec::new();
    for entry in raw.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let (name, rest) = entry
            .split_once('=')
            .ok_or_else(|| AppError::Config(format!("PROTOCOLS entry {entry:?} needs name=url")))?;
        let name = name.trim().to_ascii_lowercase();
        let (url, tier) = match rest.split_once(';') {
            Some((url, tier)) => {
                let tier = LiquidityTier::parse(tier).ok_or_else(|| {
                    AppError::Config(format!("unknown liquidity tier {tier:?} for {name}"))
                })?;
                (url, Some(tier))
            }
            None => (rest, None),
        };
        if out.iter().any(|p| p.name == name) {
            return Err(AppError::Config(format!("protocol {name} listed twice")));
        }
        out.push(ProtocolEndpoint {
            enabled: !disabled.contains(&name),
            base_url: parse_base_url(url)?,
            tier,
            name,
        });
    }
    Ok(out)
}

/// Base URLs are joined with relative paths, so they must end with `/`.
fn parse_base_url(raw: &str) -> Result<Url> {
    let mut url = Url::parse(raw.trim())?;
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    Ok(url)
}

fn parse_pairs(raw: &str) -> Result<Vec<AssetPair>> {
    raw.split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(|p| {
            AssetPair::parse(p).ok_or_else(|| AppError::Config(format!("invalid pair {p:?}")))
        })
        .collect()
}
