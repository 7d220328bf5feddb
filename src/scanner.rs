//! The scan loop: fetch, detect, execute, value, repeat.

use crate::adapter::ProtocolSource;
use crate::arbitrage::{DetectorConfig, detect};
use crate::config::AppConfig;
use crate::errors::{AppError, FetchError, Result, StoreError};
use crate::execution::ExecutionTrigger;
use crate::health::Heartbeat;
use crate::models::{AssetPair, ExecutionResult, MarketSnapshot, Opportunity, PortfolioSnapshot};
use crate::pool::{RetryPolicy, retry_async};
use crate::store::JsonlLog;
use crate::tracker::{NavSource, NavTracker};
use crate::utils::{secs_f64, wait_for_shutdown};
use anyhow::Context;
use futures::future::join_all;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::time::{MissedTickBehavior, interval, timeout};
use tracing::{debug, error, info, warn};

pub const ARCHIVE_FILE: &str = "opportunities.jsonl";

#[derive(Debug, Clone)]
pub struct ScanConfig {
    pub scan_interval: Duration,
    /// Bound on one (protocol, pair) fetch, retries included.
    pub fetch_timeout: Duration,
    pub max_opportunities_per_cycle: usize,
    pub protocols: Vec<String>,
    pub pairs: Vec<AssetPair>,
    pub detector: DetectorConfig,
    /// Retries for persisting a valuation before the cycle fails.
    pub store_retry: RetryPolicy,
}

impl ScanConfig {
    pub fn from_app_config(cfg: &AppConfig) -> Self {
        Self {
            scan_interval: cfg.scan_interval(),
            fetch_timeout: cfg.fetch_timeout(),
            max_opportunities_per_cycle: cfg.max_opportunities_per_cycle,
            protocols: cfg.enabled_protocols().map(|p| p.name.clone()).collect(),
            pairs: cfg.pairs.clone(),
            detector: DetectorConfig::from_app_config(cfg),
            store_retry: RetryPolicy::new(
                cfg.max_retry_attempts,
                secs_f64(cfg.retry_backoff_base_seconds),
            ),
        }
    }
}

/// What one cycle saw and did.
#[derive(Debug, Clone, Default)]
pub struct CycleReport {
    pub snapshots: usize,
    pub fetch_failures: usize,
    pub opportunities: Vec<Opportunity>,
    pub executions: Vec<ExecutionResult>,
    /// Executions this cycle whose journal write failed.
    pub journal_failures: u64,
    pub portfolio: Option<PortfolioSnapshot>,
}

struct NavWiring {
    source: Arc<dyn NavSource>,
    tracker: Arc<NavTracker>,
}

pub struct ScanLoop {
    source: Arc<dyn ProtocolSource>,
    config: ScanConfig,
    trigger: Option<Arc<ExecutionTrigger>>,
    nav: Option<NavWiring>,
    archive: Option<JsonlLog>,
}

impl ScanLoop {
    pub fn new(source: Arc<dyn ProtocolSource>, config: ScanConfig) -> Self {
        Self {
            source,
            config,
            trigger: None,
            nav: None,
            archive: None,
        }
    }

    /// Without a trigger opportunities are only detected and logged.
    pub fn with_execution(mut self, trigger: Arc<ExecutionTrigger>) -> Self {
        self.trigger = Some(trigger);
        self
    }

    pub fn with_nav(mut self, source: Arc<dyn NavSource>, tracker: Arc<NavTracker>) -> Self {
        self.nav = Some(NavWiring { source, tracker });
        self
    }

    pub fn with_archive(mut self, path: impl Into<PathBuf>) -> Self {
        self.archive = Some(JsonlLog::new(path));
        self
    }

    /// Run cycles on the configured interval until `shutdown` is set.
    ///
    /// Shutdown is only honoured between cycles, so executions started by a
    /// cycle always reach a terminal state. A failed cycle ends the loop with
    /// an error for the supervisor to handle.
    pub async fn run(
        &self,
        heartbeat: Heartbeat,
        mut shutdown: watch::Receiver<bool>,
    ) -> anyhow::Result<()> {
        let mut ticker = interval(self.config.scan_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut cycles: u64 = 0;
        info!(
            protocols = ?self.config.protocols,
            pairs = self.config.pairs.len(),
            interval_secs = self.config.scan_interval.as_secs_f64(),
            execution = self.trigger.is_some(),
            nav = self.nav.is_some(),
            "[SCAN] loop started"
        );

        loop {
            tokio::select! {
                biased;
                _ = wait_for_shutdown(&mut shutdown) => {
                    info!(cycles, "[SCAN] stop requested, leaving between cycles");
                    return Ok(());
                }
                _ = ticker.tick() => {}
            }
            cycles += 1;

            let report = self
                .run_cycle()
                .await
                .with_context(|| format!("scan cycle {cycles} failed"))?;
            heartbeat.beat();

            if report.opportunities.is_empty() {
                if cycles % 5 == 0 {
                    info!(
                        cycles,
                        snapshots = report.snapshots,
                        fetch_failures = report.fetch_failures,
                        "[HEARTBEAT] no opps above threshold"
                    );
                }
            } else {
                let opps: Vec<String> = report
                    .opportunities
                    .iter()
                    .map(|o| {
                        format!(
                            "{} {}->{} {:.2}% conf {:.2}",
                            o.asset_pair,
                            o.buy_protocol,
                            o.sell_protocol,
                            o.profit_potential * 100.0,
                            o.confidence_score
                        )
                    })
                    .collect();
                info!(
                    cycles,
                    opps = ?opps,
                    executed = report.executions.len(),
                    "[OPP] opportunities found"
                );
            }
        }
    }

    pub async fn run_cycle(&self) -> Result<CycleReport> {
        let started = Instant::now();
        let (snapshots, fetch_failures) = self.fetch_all().await;
        let opportunities = detect(&snapshots, &self.config.detector);

        if let Some(archive) = &self.archive {
            if let Err(e) = archive.append_all(&opportunities).await {
                warn!(error = %e, "[SCAN] opportunity archive write failed");
            }
        }

        let journal_failed_before = self.journal_failures();
        let executions = self.execute_top(&opportunities).await;
        let journal_failures = self.journal_failures() - journal_failed_before;
        let portfolio = self.observe_nav().await?;

        debug!(
            snapshots = snapshots.len(),
            fetch_failures,
            opportunities = opportunities.len(),
            executions = executions.len(),
            journal_failures,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "[SCAN] cycle complete"
        );
        Ok(CycleReport {
            snapshots: snapshots.len(),
            fetch_failures,
            opportunities,
            executions,
            journal_failures,
            portfolio,
        })
    }

    fn journal_failures(&self) -> u64 {
        self.trigger.as_ref().map_or(0, |t| t.journal_failures())
    }

    /// Fetch every (protocol, pair) at once. Failures mean no data this cycle.
    async fn fetch_all(&self) -> (Vec<MarketSnapshot>, usize) {
        let jobs = self.config.protocols.iter().flat_map(|protocol| {
            self.config
                .pairs
                .iter()
                .map(move |pair| self.fetch_one(protocol, pair))
        });
        let mut snapshots = Vec::new();
        let mut failures = 0;
        for result in join_all(jobs).await {
            match result {
                Ok(snap) => snapshots.push(snap),
                Err(e) => {
                    failures += 1;
                    warn!(error = %e, "[SCAN] no data this cycle");
                }
            }
        }
        (snapshots, failures)
    }

    async fn fetch_one(
        &self,
        protocol: &str,
        pair: &AssetPair,
    ) -> std::result::Result<MarketSnapshot, FetchError> {
        match timeout(self.config.fetch_timeout, self.source.fetch(protocol, pair)).await {
            Ok(res) => res,
            Err(_) => Err(FetchError::Unreachable {
                protocol: protocol.to_string(),
                reason: format!(
                    "{pair}: no answer within {}ms",
                    self.config.fetch_timeout.as_millis()
                ),
            }),
        }
    }

    async fn execute_top(&self, opportunities: &[Opportunity]) -> Vec<ExecutionResult> {
        let Some(trigger) = &self.trigger else {
            return Vec::new();
        };
        if opportunities.is_empty() {
            return Vec::new();
        }
        if let Some(nav) = &self.nav {
            if nav.tracker.safety_stop_active().await {
                warn!(
                    skipped = opportunities.len(),
                    "[SCAN] safety stop active, not executing"
                );
                return Vec::new();
            }
        }
        let selected: Vec<Opportunity> = opportunities
            .iter()
            .take(self.config.max_opportunities_per_cycle)
            .cloned()
            .collect();
        trigger.execute_all(selected).await
    }

    /// Unavailable valuations skip this cycle; persistence failures do not.
    async fn observe_nav(&self) -> Result<Option<PortfolioSnapshot>> {
        let Some(nav) = &self.nav else {
            return Ok(None);
        };
        let observation = match nav.source.observe().await {
            Ok(obs) => obs,
            Err(e) => {
                warn!(error = %e, "[NAV] valuation unavailable this cycle");
                return Ok(None);
            }
        };

        let updated = retry_async(
            &self.config.store_retry,
            |e: &StoreError| !matches!(e, StoreError::InvalidValuation(_)),
            |_| nav.tracker.observe(observation),
        )
        .await;
        match updated {
            Ok(snapshot) => Ok(Some(snapshot)),
            Err(StoreError::InvalidValuation(reason)) => {
                warn!(reason = %reason, "[NAV] valuation rejected");
                Ok(None)
            }
            Err(e) => {
                error!(error = %e, "[NAV] state could not be persisted");
                Err(AppError::Store(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::BroadcastError;
    use crate::execution::{Broadcaster, ExecutionConfig, ExecutionRequest};
    use crate::models::ExecutionStatus;
    use crate::tracker::NavObservation;
    use async_trait::async_trait;
    use chrono::Utc;
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct FakeSource {
        prices: HashMap<(String, String), f64>,
        hang: Vec<String>,
    }

    impl FakeSource {
        fn quote(mut self, protocol: &str, pair: &str, price: f64) -> Self {
            self.prices.insert((protocol.into(), pair.into()), price);
            self
        }
    }

    #[async_trait]
    impl ProtocolSource for FakeSource {
        async fn fetch(
            &self,
            protocol: &str,
            pair: &AssetPair,
        ) -> std::result::Result<MarketSnapshot, FetchError> {
            if self.hang.iter().any(|p| p == protocol) {
                std::future::pending::<()>().await;
            }
            let price = self
                .prices
                .get(&(protocol.to_string(), pair.to_string()))
                .copied()
                .ok_or_else(|| FetchError::Unreachable {
                    protocol: protocol.into(),
                    reason: "no pool".into(),
                })?;
            Ok(MarketSnapshot {
                protocol: protocol.into(),
                asset_pair: pair.clone(),
                price,
                reserves: None,
                observed_at: Utc::now(),
            })
        }
    }

    #[derive(Default)]
    struct CountingBroadcaster {
        submits: AtomicUsize,
    }

    #[async_trait]
    impl Broadcaster for CountingBroadcaster {
        async fn submit(
            &self,
            request: &ExecutionRequest,
        ) -> std::result::Result<String, BroadcastError> {
            let n = self.submits.fetch_add(1, Ordering::SeqCst);
            Ok(format!("TX{n}-{}", request.buy_protocol))
        }

        async fn confirm(&self, _tx: &str) -> std::result::Result<(), BroadcastError> {
            Ok(())
        }
    }

    struct FakeNav {
        navs: Mutex<Vec<f64>>,
    }

    impl FakeNav {
        fn new(navs: &[f64]) -> Self {
            Self {
                navs: Mutex::new(navs.iter().rev().copied().collect()),
            }
        }
    }

    #[async_trait]
    impl NavSource for FakeNav {
        async fn observe(&self) -> std::result::Result<NavObservation, FetchError> {
            let nav_usd = self.navs.lock().pop().ok_or(FetchError::Unreachable {
                protocol: "nav".into(),
                reason: "exhausted".into(),
            })?;
            Ok(NavObservation {
                nav_usd,
                deposits_usd: None,
            })
        }
    }

    fn scan_config(protocols: &[&str], pairs: &[&str]) -> ScanConfig {
        ScanConfig {
            scan_interval: Duration::from_millis(20),
            fetch_timeout: Duration::from_millis(100),
            max_opportunities_per_cycle: 2,
            protocols: protocols.iter().map(|p| p.to_string()).collect(),
            pairs: pairs
                .iter()
                .map(|p| AssetPair::parse(p).expect("pair"))
                .collect(),
            detector: DetectorConfig::new(0.03),
            store_retry: RetryPolicy::new(2, Duration::from_millis(5)),
        }
    }

    fn trigger(b: &Arc<CountingBroadcaster>) -> Arc<ExecutionTrigger> {
        Arc::new(ExecutionTrigger::new(
            b.clone(),
            ExecutionConfig {
                timeout: Duration::from_millis(200),
                max_concurrent: 2,
                trade_size_usd: 25.0,
                max_trade_usd: 100.0,
                max_slippage: 0.01,
                retry: RetryPolicy::new(2, Duration::from_millis(5)),
            },
        ))
    }

    #[tokio::test]
    async fn cycle_detects_executes_and_values() {
        let dir = tempfile::tempdir().expect("tempdir");
        let source = FakeSource {
            hang: vec!["folks".into()],
            ..FakeSource::default()
        }
        .quote("tinyman", "ALGO/USDC", 0.99)
        .quote("pact", "ALGO/USDC", 1.03);
        let broadcaster = Arc::new(CountingBroadcaster::default());
        let tracker = Arc::new(NavTracker::open(dir.path(), None).await.expect("tracker"));

        let scan = ScanLoop::new(
            Arc::new(source),
            scan_config(&["tinyman", "pact", "folks"], &["ALGO/USDC"]),
        )
        .with_execution(trigger(&broadcaster))
        .with_nav(Arc::new(FakeNav::new(&[1000.0, 1001.0])), tracker.clone())
        .with_archive(dir.path().join(ARCHIVE_FILE));

        let started = Instant::now();
        let report = scan.run_cycle().await.expect("cycle");
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(report.snapshots, 2);
        assert_eq!(report.fetch_failures, 1);
        assert_eq!(report.opportunities.len(), 1);
        assert_eq!(report.executions.len(), 1);
        assert_eq!(report.executions[0].status, ExecutionStatus::Confirmed);
        assert_eq!(report.portfolio.as_ref().map(|p| p.sequence), Some(1));

        let report = scan.run_cycle().await.expect("cycle");
        let portfolio = report.portfolio.expect("portfolio");
        assert!((portfolio.realized_trading_profit_usd - 1.0).abs() < 1e-9);

        let archived: Vec<Opportunity> = JsonlLog::new(dir.path().join(ARCHIVE_FILE))
            .read_all()
            .await
            .expect("archive");
        assert_eq!(archived.len(), 2);
    }

    #[tokio::test]
    async fn executes_only_the_top_n() {
        let source = FakeSource::default()
            .quote("tinyman", "A/B", 1.00)
            .quote("pact", "A/B", 1.10)
            .quote("tinyman", "C/D", 1.00)
            .quote("pact", "C/D", 1.08)
            .quote("tinyman", "E/F", 1.00)
            .quote("pact", "E/F", 1.05);
        let broadcaster = Arc::new(CountingBroadcaster::default());
        let scan = ScanLoop::new(
            Arc::new(source),
            scan_config(&["tinyman", "pact"], &["A/B", "C/D", "E/F"]),
        )
        .with_execution(trigger(&broadcaster));

        let report = scan.run_cycle().await.expect("cycle");
        assert_eq!(report.opportunities.len(), 3);
        assert_eq!(report.executions.len(), 2);
        let mut executed: Vec<&str> = report
            .executions
            .iter()
            .map(|e| e.opportunity_ref.as_str())
            .collect();
        executed.sort_unstable();
        let mut expected: Vec<&str> = report.opportunities[..2]
            .iter()
            .map(|o| o.id.as_str())
            .collect();
        expected.sort_unstable();
        assert_eq!(executed, expected);
    }

    #[tokio::test]
    async fn safety_stop_halts_executions_but_not_scanning() {
        let dir = tempfile::tempdir().expect("tempdir");
        let tracker = Arc::new(
            NavTracker::open(dir.path(), Some(900.0))
                .await
                .expect("tracker"),
        );
        tracker.update(850.0).await.expect("seed below floor");

        let source = FakeSource::default()
            .quote("tinyman", "ALGO/USDC", 0.99)
            .quote("pact", "ALGO/USDC", 1.03);
        let broadcaster = Arc::new(CountingBroadcaster::default());
        let scan = ScanLoop::new(
            Arc::new(source),
            scan_config(&["tinyman", "pact"], &["ALGO/USDC"]),
        )
        .with_execution(trigger(&broadcaster))
        .with_nav(Arc::new(FakeNav::new(&[860.0])), tracker);

        let report = scan.run_cycle().await.expect("cycle");
        assert_eq!(report.opportunities.len(), 1);
        assert!(report.executions.is_empty());
        assert_eq!(broadcaster.submits.load(Ordering::SeqCst), 0);
        assert!(report.portfolio.expect("portfolio").safety_stop);
    }

    #[tokio::test]
    async fn unpersistable_valuation_fails_the_cycle() {
        let dir = tempfile::tempdir().expect("tempdir");
        let tracker = Arc::new(NavTracker::open(dir.path(), None).await.expect("tracker"));
        std::fs::create_dir(dir.path().join("nav_state.json.tmp")).expect("blocker");

        let scan = ScanLoop::new(
            Arc::new(FakeSource::default()),
            scan_config(&["tinyman", "pact"], &["ALGO/USDC"]),
        )
        .with_nav(Arc::new(FakeNav::new(&[1000.0, 1000.0])), tracker.clone());

        let err = scan.run_cycle().await.expect_err("must escalate");
        assert!(matches!(err, AppError::Store(StoreError::Write { .. })));
        assert_eq!(tracker.state().await.sequence, 0);
    }

    #[tokio::test]
    async fn run_beats_and_stops_between_cycles() {
        let source = FakeSource::default()
            .quote("tinyman", "ALGO/USDC", 1.0)
            .quote("pact", "ALGO/USDC", 1.0);
        let scan = ScanLoop::new(
            Arc::new(source),
            scan_config(&["tinyman", "pact"], &["ALGO/USDC"]),
        );
        let heartbeat = Heartbeat::new();
        let (stop_tx, stop_rx) = watch::channel(false);

        let observer = heartbeat.clone();
        let driver = async move {
            tokio::time::sleep(Duration::from_millis(120)).await;
            assert!(observer.idle() < Duration::from_millis(100));
            stop_tx.send(true).expect("stop");
        };
        let (result, ()) = tokio::join!(scan.run(heartbeat, stop_rx), driver);
        result.expect("clean exit");
    }
}
