use super::broadcaster::{Broadcaster, ExecutionRequest};
use crate::config::AppConfig;
use crate::errors::BroadcastError;
use crate::models::{ExecutionResult, ExecutionStatus, Opportunity};
use crate::pool::{RetryPolicy, retry_async};
use crate::store::JsonlLog;
use crate::utils::secs_f64;
use chrono::Utc;
use futures::StreamExt;
use futures::stream;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

pub const JOURNAL_FILE: &str = "executions.jsonl";

#[derive(Debug, Clone)]
pub struct ExecutionConfig {
    /// Bound on each phase: submission, then confirmation.
    pub timeout: Duration,
    pub max_concurrent: usize,
    pub trade_size_usd: f64,
    pub max_trade_usd: f64,
    pub max_slippage: f64,
    /// Undelivered submissions and journal writes.
    pub retry: RetryPolicy,
}

impl ExecutionConfig {
    pub fn from_app_config(cfg: &AppConfig) -> Self {
        Self {
            timeout: cfg.execution_timeout(),
            max_concurrent: cfg.max_concurrent_executions.max(1),
            trade_size_usd: cfg.trade_size_usd,
            max_trade_usd: cfg.max_trade_usd,
            max_slippage: cfg.max_slippage,
            retry: RetryPolicy::new(
                cfg.max_retry_attempts,
                secs_f64(cfg.retry_backoff_base_seconds),
            ),
        }
    }
}

struct Outcome {
    status: ExecutionStatus,
    tx_reference: Option<String>,
    error: Option<String>,
    delivery_attempts: u32,
}

impl Outcome {
    fn failed(delivery_attempts: u32, tx_reference: Option<String>, error: String) -> Self {
        Self {
            status: ExecutionStatus::Failed,
            tx_reference,
            error: Some(error),
            delivery_attempts,
        }
    }

    fn timed_out(delivery_attempts: u32, tx_reference: Option<String>, error: String) -> Self {
        Self {
            status: ExecutionStatus::TimedOut,
            tx_reference,
            error: Some(error),
            delivery_attempts,
        }
    }
}

/// Drives opportunities through `pending -> submitted -> {confirmed | failed}`.
///
/// An attempt with no answer inside the timeout ends as `timed_out` and is
/// never resubmitted: the broadcaster may have acted on it.
pub struct ExecutionTrigger {
    broadcaster: Arc<dyn Broadcaster>,
    config: ExecutionConfig,
    journal: Option<JsonlLog>,
    journal_failures: AtomicU64,
}

impl ExecutionTrigger {
    pub fn new(broadcaster: Arc<dyn Broadcaster>, config: ExecutionConfig) -> Self {
        Self {
            broadcaster,
            config,
            journal: None,
            journal_failures: AtomicU64::new(0),
        }
    }

    /// Results that could not be journaled since startup.
    pub fn journal_failures(&self) -> u64 {
        self.journal_failures.load(Ordering::Relaxed)
    }

    /// Append every result to the JSON lines file at `path`.
    pub fn with_journal(mut self, path: impl Into<PathBuf>) -> Self {
        self.journal = Some(JsonlLog::new(path));
        self
    }

    pub fn build_request(&self, opp: &Opportunity) -> ExecutionRequest {
        let amount_in = self.config.trade_size_usd / opp.buy_price;
        ExecutionRequest {
            opportunity_ref: opp.id.clone(),
            asset_pair: opp.asset_pair.clone(),
            buy_protocol: opp.buy_protocol.clone(),
            sell_protocol: opp.sell_protocol.clone(),
            amount_in,
            min_amount_out: amount_in * opp.sell_price * (1.0 - self.config.max_slippage),
            max_slippage: self.config.max_slippage,
        }
    }

    fn check_risk_limits(&self, request: &ExecutionRequest) -> Result<(), String> {
        if !(request.amount_in.is_finite() && request.amount_in > 0.0) {
            return Err(format!("unusable trade amount {}", request.amount_in));
        }
        if self.config.trade_size_usd > self.config.max_trade_usd {
            return Err(format!(
                "trade size ${:.2} exceeds position cap ${:.2}",
                self.config.trade_size_usd, self.config.max_trade_usd
            ));
        }
        Ok(())
    }

    /// Run one execution attempt to a terminal state and record it.
    pub async fn execute(&self, opp: &Opportunity) -> ExecutionResult {
        let attempted_at = Utc::now();
        let outcome = self.drive(opp).await;
        let result = ExecutionResult {
            opportunity_ref: opp.id.clone(),
            status: outcome.status,
            tx_reference: outcome.tx_reference,
            error: outcome.error,
            delivery_attempts: outcome.delivery_attempts,
            attempted_at,
            resolved_at: Utc::now(),
        };

        match result.status {
            ExecutionStatus::Confirmed => info!(
                id = %result.opportunity_ref,
                tx = result.tx_reference.as_deref().unwrap_or_default(),
                profit_potential = opp.profit_potential,
                "[EXEC] confirmed"
            ),
            status => warn!(
                id = %result.opportunity_ref,
                ?status,
                tx = result.tx_reference.as_deref().unwrap_or_default(),
                error = result.error.as_deref().unwrap_or_default(),
                "[EXEC] not confirmed"
            ),
        }

        if let Some(journal) = &self.journal {
            let written =
                retry_async(&self.config.retry, |_| true, |_| journal.append(&result)).await;
            if let Err(e) = written {
                self.journal_failures.fetch_add(1, Ordering::Relaxed);
                error!(
                    id = %result.opportunity_ref,
                    status = ?result.status,
                    tx = result.tx_reference.as_deref().unwrap_or_default(),
                    error = %e,
                    "[EXEC] journal write failed"
                );
            }
        }
        result
    }

    /// Execute with at most `max_concurrent` attempts in flight. Every returned
    /// result is terminal.
    pub async fn execute_all(&self, opportunities: Vec<Opportunity>) -> Vec<ExecutionResult> {
        stream::iter(opportunities)
            .map(|opp| async move { self.execute(&opp).await })
            .buffer_unordered(self.config.max_concurrent.max(1))
            .collect()
            .await
    }

    async fn drive(&self, opp: &Opportunity) -> Outcome {
        let request = self.build_request(opp);
        if let Err(reason) = self.check_risk_limits(&request) {
            return Outcome::failed(0, None, reason);
        }
        debug!(id = %opp.id, amount_in = request.amount_in, "[EXEC] pending");

        let mut delivery_attempts = 0;
        let submitted = retry_async(
            &self.config.retry,
            |e: &BroadcastError| matches!(e, BroadcastError::Unreachable(_)),
            |attempt| {
                delivery_attempts = attempt;
                self.submit_once(&request)
            },
        )
        .await;

        let tx = match submitted {
            Ok(tx) => tx,
            Err(BroadcastError::Unreachable(e)) => {
                return Outcome::failed(
                    delivery_attempts,
                    None,
                    format!("broadcaster unreachable after {delivery_attempts} attempts: {e}"),
                );
            }
            Err(BroadcastError::Rejected(e)) => {
                return Outcome::failed(delivery_attempts, None, format!("rejected: {e}"));
            }
            Err(BroadcastError::Ambiguous(e)) => {
                return Outcome::timed_out(delivery_attempts, None, e);
            }
        };
        info!(id = %opp.id, tx = %tx, "[EXEC] submitted");

        match timeout(self.config.timeout, self.broadcaster.confirm(&tx)).await {
            Ok(Ok(())) => Outcome {
                status: ExecutionStatus::Confirmed,
                tx_reference: Some(tx),
                error: None,
                delivery_attempts,
            },
            Ok(Err(BroadcastError::Rejected(e))) => {
                Outcome::failed(delivery_attempts, Some(tx), format!("rejected: {e}"))
            }
            Ok(Err(e)) => Outcome::timed_out(delivery_attempts, Some(tx), e.to_string()),
            Err(_) => Outcome::timed_out(
                delivery_attempts,
                Some(tx),
                format!("no confirmation within {}ms", self.config.timeout.as_millis()),
            ),
        }
    }

    async fn submit_once(&self, request: &ExecutionRequest) -> Result<String, BroadcastError> {
        match timeout(self.config.timeout, self.broadcaster.submit(request)).await {
            Ok(res) => res,
            Err(_) => Err(BroadcastError::Ambiguous(format!(
                "no response within {}ms",
                self.config.timeout.as_millis()
            ))),
        }
    }
}
