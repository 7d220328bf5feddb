//! Shared outbound connection layer.
//!
//! Responsibilities:
//! • Bound in-flight requests per upstream host and globally.
//! • Keep idle HTTP connections alive for reuse between scan cycles.
//! • Apply retry-with-backoff to transient failures only.
//!
//! A slot is held by a [`PooledConnection`] and returned when it is dropped, so
//! errors, timeouts and task cancellation all release it.

pub mod retry;

use crate::config::AppConfig;
use crate::errors::TransportError;
use parking_lot::Mutex;
use reqwest::{Client, RequestBuilder};
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

pub use retry::{RetryPolicy, retry_async};

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub max_per_host: usize,
    pub max_total: usize,
    /// How long an idle keep-alive connection is kept.
    pub idle_timeout: Duration,
    /// Longest wait for a free slot before giving up.
    pub acquire_timeout: Duration,
    /// Upper bound for one request/response exchange.
    pub request_timeout: Duration,
    pub retry: RetryPolicy,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_per_host: 4,
            max_total: 16,
            idle_timeout: Duration::from_secs(90),
            acquire_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(10),
            retry: RetryPolicy::default(),
        }
    }
}

impl PoolConfig {
    pub fn from_app_config(cfg: &AppConfig) -> Self {
        Self {
            max_per_host: cfg.max_connections_per_host,
            max_total: cfg.max_connections_total,
            idle_timeout: Duration::from_secs(cfg.pool_idle_timeout_seconds),
            acquire_timeout: cfg.fetch_timeout(),
            request_timeout: cfg.fetch_timeout(),
            retry: RetryPolicy::new(
                cfg.max_retry_attempts,
                crate::utils::secs_f64(cfg.retry_backoff_base_seconds),
            ),
        }
    }
}

/// Bounded pool of outbound HTTP slots over one keep-alive `reqwest::Client`.
pub struct ConnectionPool {
    client: Client,
    global: Arc<Semaphore>,
    hosts: Mutex<HashMap<String, Arc<Semaphore>>>,
    config: PoolConfig,
}

/// A held pool slot. Dropping it (or calling [`release`](Self::release)) frees the slot.
pub struct PooledConnection {
    client: Client,
    host: String,
    _host_permit: OwnedSemaphorePermit,
    _global_permit: OwnedSemaphorePermit,
}

impl PooledConnection {
    pub fn client(&self) -> &Client {
        &self.client
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn release(self) {
        debug!(host = %self.host, "[POOL] slot released");
    }
}

impl ConnectionPool {
    pub fn new(config: PoolConfig) -> Result<Self, TransportError> {
        let client = Client::builder()
            .user_agent(concat!("arbitrage-pipeline/", env!("CARGO_PKG_VERSION")))
            .pool_idle_timeout(config.idle_timeout)
            .pool_max_idle_per_host(config.max_per_host)
            .tcp_keepalive(Some(Duration::from_secs(60)))
            .connect_timeout(config.request_timeout)
            .build()
            .map_err(|e| TransportError::Request(e.to_string()))?;
        Ok(Self {
            client,
            global: Arc::new(Semaphore::new(config.max_total)),
            hosts: Mutex::new(HashMap::new()),
            config,
        })
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Free global slots.
    pub fn available(&self) -> usize {
        self.global.available_permits()
    }

    /// Free slots for one host.
    pub fn available_for(&self, host: &str) -> usize {
        self.hosts
            .lock()
            .get(host)
            .map(|s| s.available_permits())
            .unwrap_or(self.config.max_per_host)
    }

    fn host_semaphore(&self, host: &str) -> Arc<Semaphore> {
        self.hosts
            .lock()
            .entry(host.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.config.max_per_host)))
            .clone()
    }

    /// Wait for a slot on `host`. Host permit first, then global, in every caller.
    pub async fn acquire(&self, host: &str) -> Result<PooledConnection, TransportError> {
        let host_sem = self.host_semaphore(host);
        let global = self.global.clone();
        let exhausted = || TransportError::PoolExhausted {
            host: host.to_string(),
            waited_ms: self.config.acquire_timeout.as_millis() as u64,
        };
        let permits = tokio::time::timeout(self.config.acquire_timeout, async move {
            let host_permit = host_sem.acquire_owned().await.ok()?;
            let global_permit = global.acquire_owned().await.ok()?;
            Some((host_permit, global_permit))
        })
        .await;
        match permits {
            Ok(Some((host_permit, global_permit))) => Ok(PooledConnection {
                client: self.client.clone(),
                host: host.to_string(),
                _host_permit: host_permit,
                _global_permit: global_permit,
            }),
            _ => Err(exhausted()),
        }
    }

    /// One attempt: acquire, send, classify, decode, release.
    pub async fn send_json<T, B>(&self, host: &str, build: B) -> Result<T, TransportError>
    where
        T: DeserializeOwned,
        B: FnOnce(&Client) -> RequestBuilder,
    {
        let conn = self.acquire(host).await?;
        let request = build(conn.client());
        let result = tokio::time::timeout(self.config.request_timeout, exchange(request))
            .await
            .unwrap_or(Err(TransportError::Timeout));
        conn.release();
        result
    }

    /// [`send_json`](Self::send_json) under the pool's retry policy.
    /// Each attempt takes a fresh slot.
    pub async fn request_json<T, B>(&self, host: &str, build: B) -> Result<T, TransportError>
    where
        T: DeserializeOwned,
        B: Fn(&Client) -> RequestBuilder,
    {
        retry_async(&self.config.retry, TransportError::is_transient, |attempt| {
            let build = &build;
            async move {
                let res = self.send_json(host, build).await;
                if let Err(e) = &res {
                    debug!(host, attempt, error = %e, "[POOL] request failed");
                }
                res
            }
        })
        .await
    }
}

async fn exchange<T: DeserializeOwned>(request: RequestBuilder) -> Result<T, TransportError> {
    let response = request.send().await?;
    let status = response.status();
    if !status.is_success() {
        return Err(TransportError::Status(status.as_u16()));
    }
    let body = response.bytes().await?;
    serde_json::from_slice(&body).map_err(|e| TransportError::Decode(e.to_string()))
}
