use anyhow::Result;
use arbitrage_pipeline::{
    adapter::HttpProtocolAdapter,
    config::AppConfig,
    execution::{ExecutionConfig, ExecutionTrigger, HttpBroadcaster, JOURNAL_FILE},
    health::{Heartbeat, Supervisor, SupervisorConfig},
    pool::{ConnectionPool, PoolConfig},
    scanner::{ARCHIVE_FILE, ScanConfig, ScanLoop},
    tracker::{HttpNavSource, NavTracker},
    utils,
};
use std::sync::Arc;
use tokio::sync::watch;

#[tokio::main]
async fn main() -> Result<()> {
    let config = AppConfig::load()?;
    utils::init_logging(&config.log_level, config.log_json);

    let protocols: Vec<&str> = config.enabled_protocols().map(|p| p.name.as_str()).collect();
    let pairs: Vec<String> = config.pairs.iter().map(|p| p.to_string()).collect();
    tracing::info!(
        ?protocols,
        ?pairs,
        min_profit_threshold = config.min_profit_threshold,
        scan_interval_secs = config.scan_interval_seconds,
        data_dir = %config.data_dir.display(),
        "[INIT] arbitrage-pipeline starting"
    );

    // Shared outbound HTTP pool
    let pool = Arc::new(ConnectionPool::new(PoolConfig::from_app_config(&config))?);
    let adapter = Arc::new(HttpProtocolAdapter::new(
        pool.clone(),
        config.enabled_protocols(),
    ));
    let mut scan = ScanLoop::new(adapter, ScanConfig::from_app_config(&config));

    if config.archive_opportunities {
        scan = scan.with_archive(config.data_dir.join(ARCHIVE_FILE));
    }

    match &config.broadcaster_url {
        Some(url) => {
            let broadcaster = Arc::new(HttpBroadcaster::new(pool.clone(), url.clone()));
            let trigger =
                ExecutionTrigger::new(broadcaster, ExecutionConfig::from_app_config(&config))
                    .with_journal(config.data_dir.join(JOURNAL_FILE));
            scan = scan.with_execution(Arc::new(trigger));
            tracing::info!(
                broadcaster = %url,
                trade_size_usd = config.trade_size_usd,
                max_concurrent = config.max_concurrent_executions,
                "[INIT] execution enabled"
            );
        }
        None => tracing::warn!("[INIT] BROADCASTER_URL not set, opportunities are only logged"),
    }

    match &config.nav_url {
        Some(url) => {
            let tracker =
                Arc::new(NavTracker::open(&config.data_dir, config.safety_stop_nav_usd).await?);
            let source = Arc::new(HttpNavSource::new(pool.clone(), url.clone()));
            scan = scan.with_nav(source, tracker);
            tracing::info!(nav = %url, "[INIT] NAV tracking enabled");
        }
        None => tracing::warn!("[INIT] NAV_URL not set, NAV tracking disabled"),
    }

    let scan = Arc::new(scan);

    // Ctrl-C flips the shutdown flag; the scan loop finishes its cycle first.
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                tracing::info!("[SHUTDOWN] interrupt received, finishing current cycle");
                let _ = shutdown_tx.send(true);
            }
            Err(e) => {
                tracing::warn!(error = %e, "[SHUTDOWN] cannot listen for interrupts");
                // Keep the sender alive so the pipeline keeps running.
                std::future::pending::<()>().await;
            }
        }
    });

    let supervisor = Supervisor::new(SupervisorConfig::from_app_config(&config));
    let factory = move |heartbeat: Heartbeat, stop: watch::Receiver<bool>| {
        let scan = scan.clone();
        async move { scan.run(heartbeat, stop).await }
    };

    match supervisor.run(factory, shutdown_rx).await {
        Ok(record) => {
            tracing::info!(
                restart_count = record.restart_count,
                "[SHUTDOWN] stopped cleanly"
            );
            Ok(())
        }
        Err(e) => {
            tracing::error!(error = %e, "[FATAL] supervisor halted");
            Err(e.into())
        }
    }
}
