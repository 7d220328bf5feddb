//! Boundary to the external signer/broadcaster.
//!
//! Signing and chain submission live outside this crate. The engine hands over
//! a request and learns whether it was accepted (a transaction reference) and
//! later whether it landed.

use crate::errors::{BroadcastError, TransportError};
use crate::models::AssetPair;
use crate::pool::ConnectionPool;
use crate::utils::host_key;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use url::Url;

/// What the broadcaster is asked to do for one opportunity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRequest {
    pub opportunity_ref: String,
    pub asset_pair: AssetPair,
    pub buy_protocol: String,
    pub sell_protocol: String,
    /// Base asset bought on the buy leg.
    pub amount_in: f64,
    /// Least quote asset accepted back from the sell leg.
    pub min_amount_out: f64,
    pub max_slippage: f64,
}

#[async_trait]
pub trait Broadcaster: Send + Sync {
    /// Hand the request over. `Ok` carries the transaction reference.
    async fn submit(&self, request: &ExecutionRequest) -> Result<String, BroadcastError>;

    /// Resolve once the transaction is confirmed, or with `Rejected` once it failed.
    async fn confirm(&self, tx_reference: &str) -> Result<(), BroadcastError>;
}

#[derive(Debug, Deserialize)]
struct SubmitReply {
    #[serde(default)]
    tx_reference: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StatusReply {
    status: String,
    #[serde(default)]
    error: Option<String>,
}

/// `POST {base}/submit` then poll `GET {base}/status/{tx}`.
pub struct HttpBroadcaster {
    pool: Arc<ConnectionPool>,
    base_url: Url,
    host: String,
    poll_interval: Duration,
}

impl HttpBroadcaster {
    pub fn new(pool: Arc<ConnectionPool>, base_url: Url) -> Self {
        let host = host_key(&base_url);
        Self {
            pool,
            base_url,
            host,
            poll_interval: Duration::from_secs(2),
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    fn endpoint(&self, path: &str) -> Result<Url, BroadcastError> {
        self.base_url
            .join(path)
            .map_err(|e| BroadcastError::Unreachable(e.to_string()))
    }
}

/// A submission only counts as undelivered when we know the broadcaster never took it.
fn classify_submit(err: TransportError) -> BroadcastError {
    match err {
        TransportError::Connect(_) | TransportError::PoolExhausted { .. } => {
            BroadcastError::Unreachable(err.to_string())
        }
        TransportError::Status(429) => BroadcastError::Unreachable(err.to_string()),
        TransportError::Status(code) if (400..500).contains(&code) => {
            BroadcastError::Rejected(err.to_string())
        }
        other => BroadcastError::Ambiguous(other.to_string()),
    }
}

#[async_trait]
impl Broadcaster for HttpBroadcaster {
    async fn submit(&self, request: &ExecutionRequest) -> Result<String, BroadcastError> {
        let url = self.endpoint("submit")?;
        let reply: SubmitReply = self
            .pool
            .send_json(&self.host, |c| c.post(url).json(request))
            .await
            .map_err(classify_submit)?;
        match reply {
            SubmitReply {
                tx_reference: Some(tx),
                ..
            } if !tx.is_empty() => Ok(tx),
            SubmitReply { error, .. } => Err(BroadcastError::Rejected(
                error.unwrap_or_else(|| "no transaction reference returned".to_string()),
            )),
        }
    }

    async fn confirm(&self, tx_reference: &str) -> Result<(), BroadcastError> {
        let url = self.endpoint(&format!("status/{tx_reference}"))?;
        loop {
            let reply: Result<StatusReply, _> = self
                .pool
                .send_json(&self.host, |c| c.get(url.clone()))
                .await;
            match reply {
                Ok(r) => match r.status.to_ascii_lowercase().as_str() {
                    "confirmed" => return Ok(()),
                    "failed" | "rejected" => {
                        return Err(BroadcastError::Rejected(
                            r.error.unwrap_or_else(|| "rejected on-chain".to_string()),
                        ));
                    }
                    other => {
                        debug!(tx = tx_reference, status = other, "[EXEC] awaiting confirmation")
                    }
                },
                // Status queries are idempotent; keep asking through transient trouble.
                Err(e) if e.is_transient() => {
                    debug!(tx = tx_reference, error = %e, "[EXEC] status query failed");
                }
                Err(e) => return Err(BroadcastError::Ambiguous(e.to_string())),
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }
}
