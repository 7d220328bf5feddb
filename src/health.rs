//! Supervision of the scan loop.
//!
//! The supervisor launches the loop as a task, watches it on its own timer and
//! relaunches it when it stalls (no heartbeat within the liveness timeout) or
//! crashes (returns an error, panics or exits on its own). Restarts are paced
//! by a cooldown and capped per window; exceeding the cap halts supervision.
//!
//! ```text
//! starting -> running -> stalled -> restarting -> running
//!                     \-> crashed -> restarting -> running
//!             running -> stopped            (shutdown)
//!             restarting -> halted          (restart cap exceeded)
//! ```

use crate::config::AppConfig;
use crate::errors::SupervisorError;
use crate::models::{HealthRecord, SupervisorState};
use crate::store::write_json_atomic;
use crate::utils::wait_for_shutdown;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval, sleep, timeout};
use tracing::{debug, error, info, warn};

pub const STATUS_FILE: &str = "health.json";

#[derive(Debug, Clone, Copy)]
struct Progress {
    at: Instant,
    wall: DateTime<Utc>,
}

impl Progress {
    fn now() -> Self {
        Self {
            at: Instant::now(),
            wall: Utc::now(),
        }
    }
}

/// Progress signal handed to the supervised loop.
#[derive(Debug, Clone)]
pub struct Heartbeat {
    last: Arc<Mutex<Progress>>,
}

impl Default for Heartbeat {
    fn default() -> Self {
        Self {
            last: Arc::new(Mutex::new(Progress::now())),
        }
    }
}

impl Heartbeat {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn beat(&self) {
        *self.last.lock() = Progress::now();
    }

    pub fn last_progress_at(&self) -> DateTime<Utc> {
        self.last.lock().wall
    }

    pub fn idle(&self) -> Duration {
        self.last.lock().at.elapsed()
    }
}

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub check_interval: Duration,
    pub liveness_timeout: Duration,
    pub restart_cooldown: Duration,
    pub max_restarts_per_window: usize,
    pub restart_window: Duration,
    /// Bound on collecting a finished or aborted task.
    pub join_timeout: Duration,
    /// How long a stopping loop may take to finish its cycle.
    pub shutdown_grace: Duration,
    /// Emit a status line every this many checks.
    pub status_every: u64,
    pub status_path: Option<PathBuf>,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(10),
            liveness_timeout: Duration::from_secs(300),
            restart_cooldown: Duration::from_secs(5),
            max_restarts_per_window: 5,
            restart_window: Duration::from_secs(600),
            join_timeout: Duration::from_secs(5),
            shutdown_grace: Duration::from_secs(60),
            status_every: 6,
            status_path: None,
        }
    }
}

impl SupervisorConfig {
    pub fn from_app_config(cfg: &AppConfig) -> Self {
        // A stopping loop finishes its cycle, which can include executions.
        let shutdown_grace = cfg.execution_timeout() * 2 + cfg.fetch_timeout() * 2;
        Self {
            check_interval: Duration::from_secs(cfg.health_check_interval_seconds.max(1)),
            liveness_timeout: cfg.liveness_timeout(),
            restart_cooldown: Duration::from_secs(cfg.restart_cooldown_seconds),
            max_restarts_per_window: cfg.max_restarts_per_window,
            restart_window: Duration::from_secs(cfg.restart_window_seconds),
            shutdown_grace,
            status_path: Some(cfg.data_dir.join(STATUS_FILE)),
            ..Self::default()
        }
    }
}

enum Exit {
    Failed(String),
    Shutdown,
}

/// Owns the [`HealthRecord`]; everyone else reads it through [`Supervisor::subscribe`].
pub struct Supervisor {
    config: SupervisorConfig,
    record_tx: watch::Sender<HealthRecord>,
}

impl Supervisor {
    pub fn new(config: SupervisorConfig) -> Self {
        let (record_tx, _) = watch::channel(HealthRecord::starting(Utc::now()));
        Self { config, record_tx }
    }

    pub fn subscribe(&self) -> watch::Receiver<HealthRecord> {
        self.record_tx.subscribe()
    }

    /// Supervise loops produced by `factory` until `shutdown` flips to `true`.
    ///
    /// Failures of the supervised loop never propagate out of here. The only
    /// error is an exhausted restart budget.
    pub async fn run<F, Fut>(
        &self,
        mut factory: F,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<HealthRecord, SupervisorError>
    where
        F: FnMut(Heartbeat, watch::Receiver<bool>) -> Fut,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let mut record = HealthRecord::starting(Utc::now());
        let mut restarts: VecDeque<Instant> = VecDeque::new();
        let mut checks: u64 = 0;

        loop {
            if *shutdown.borrow() {
                record.state = SupervisorState::Stopped;
                record.process_alive = false;
                self.publish(&mut record).await;
                return Ok(record);
            }

            let heartbeat = Heartbeat::new();
            let (stop_tx, stop_rx) = watch::channel(false);
            let mut task: JoinHandle<anyhow::Result<()>> =
                tokio::spawn(factory(heartbeat.clone(), stop_rx));
            record.state = SupervisorState::Running;
            record.process_alive = true;
            record.last_progress_at = heartbeat.last_progress_at();
            self.publish(&mut record).await;
            info!(restart_count = record.restart_count, "[HEALTH] loop launched");

            let exit = self
                .watch(&mut task, &heartbeat, &mut record, &mut shutdown, &mut checks)
                .await;
            let failure = match exit {
                Exit::Shutdown => return Ok(self.stop(task, stop_tx, record).await),
                Exit::Failed(reason) => reason,
            };

            let now = Instant::now();
            restarts.push_back(now);
            while restarts
                .front()
                .is_some_and(|t| now.duration_since(*t) > self.config.restart_window)
            {
                restarts.pop_front();
            }
            if restarts.len() > self.config.max_restarts_per_window {
                record.state = SupervisorState::Halted;
                record.process_alive = false;
                self.publish(&mut record).await;
                error!(
                    restarts = restarts.len(),
                    window_secs = self.config.restart_window.as_secs(),
                    last_error = %failure,
                    "[HEALTH] restart budget exhausted, halting"
                );
                return Err(SupervisorError::RestartBudgetExhausted {
                    restarts: restarts.len(),
                    window_secs: self.config.restart_window.as_secs(),
                    last_error: failure,
                });
            }

            record.restart_count += 1;
            record.state = SupervisorState::Restarting;
            self.publish(&mut record).await;
            warn!(
                restart_count = record.restart_count,
                cooldown_ms = self.config.restart_cooldown.as_millis() as u64,
                reason = %failure,
                "[HEALTH] restarting loop"
            );

            tokio::select! {
                _ = sleep(self.config.restart_cooldown) => {}
                _ = wait_for_shutdown(&mut shutdown) => {
                    record.state = SupervisorState::Stopped;
                    self.publish(&mut record).await;
                    return Ok(record);
                }
            }
        }
    }

    /// Poll the running task until it fails, stalls or shutdown is requested.
    async fn watch(
        &self,
        task: &mut JoinHandle<anyhow::Result<()>>,
        heartbeat: &Heartbeat,
        record: &mut HealthRecord,
        shutdown: &mut watch::Receiver<bool>,
        checks: &mut u64,
    ) -> Exit {
        let mut ticker = interval(self.config.check_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = wait_for_shutdown(shutdown) => return Exit::Shutdown,
            }
            *checks += 1;
            record.last_progress_at = heartbeat.last_progress_at();

            if task.is_finished() {
                let reason = match timeout(self.config.join_timeout, &mut *task).await {
                    Ok(Ok(Ok(()))) => "loop exited without a shutdown request".to_string(),
                    Ok(Ok(Err(e))) => format!("{e:#}"),
                    Ok(Err(e)) if e.is_panic() => format!("loop panicked: {e}"),
                    Ok(Err(e)) => format!("loop task failed: {e}"),
                    Err(_) => "finished loop could not be joined".to_string(),
                };
                record.state = SupervisorState::Crashed;
                record.process_alive = false;
                record.last_error = Some(reason.clone());
                self.publish(record).await;
                error!(error = %reason, "[HEALTH] loop crashed");
                return Exit::Failed(reason);
            }

            let idle = heartbeat.idle();
            if idle > self.config.liveness_timeout {
                let reason = format!("no progress for {}ms", idle.as_millis());
                record.state = SupervisorState::Stalled;
                record.last_error = Some(reason.clone());
                self.publish(record).await;
                warn!(idle_ms = idle.as_millis() as u64, "[HEALTH] loop stalled, aborting");
                task.abort();
                let _ = timeout(self.config.join_timeout, &mut *task).await;
                record.process_alive = false;
                return Exit::Failed(reason);
            }

            self.publish(record).await;
            if *checks % self.config.status_every.max(1) == 0 {
                info!(
                    state = ?record.state,
                    process_alive = record.process_alive,
                    idle_ms = idle.as_millis() as u64,
                    restart_count = record.restart_count,
                    last_error = record.last_error.as_deref().unwrap_or_default(),
                    "[HEALTH] status"
                );
            }
        }
    }

    async fn stop(
        &self,
        mut task: JoinHandle<anyhow::Result<()>>,
        stop_tx: watch::Sender<bool>,
        mut record: HealthRecord,
    ) -> HealthRecord {
        let _ = stop_tx.send(true);
        info!(
            grace_ms = self.config.shutdown_grace.as_millis() as u64,
            "[HEALTH] shutdown requested, waiting for loop"
        );
        match timeout(self.config.shutdown_grace, &mut task).await {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(e))) => {
                warn!(error = %e, "[HEALTH] loop failed while stopping");
                record.last_error = Some(format!("{e:#}"));
            }
            Ok(Err(e)) => warn!(error = %e, "[HEALTH] loop task failed while stopping"),
            Err(_) => {
                warn!("[HEALTH] grace period expired, aborting loop");
                task.abort();
            }
        }
        record.state = SupervisorState::Stopped;
        record.process_alive = false;
        self.publish(&mut record).await;
        info!(restart_count = record.restart_count, "[HEALTH] stopped");
        record
    }

    async fn publish(&self, record: &mut HealthRecord) {
        record.updated_at = Utc::now();
        self.record_tx.send_replace(record.clone());
        if let Some(path) = &self.config.status_path {
            match timeout(self.config.check_interval, write_json_atomic(path, record)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(error = %e, "[HEALTH] status file write failed"),
                Err(_) => warn!("[HEALTH] status file write timed out"),
            }
        }
        debug!(state = ?record.state, "[HEALTH] record published");
    }
}
