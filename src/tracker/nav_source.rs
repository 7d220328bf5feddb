use super::state::NavObservation;
use crate::errors::FetchError;
use crate::pool::ConnectionPool;
use crate::utils::host_key;
use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;
use url::Url;

/// Source label used in fetch errors.
const SOURCE: &str = "nav";

/// Where portfolio valuations come from.
#[async_trait]
pub trait NavSource: Send + Sync {
    async fn observe(&self) -> Result<NavObservation, FetchError>;
}

#[derive(Debug, Deserialize)]
struct NavReply {
    nav_usd: f64,
    #[serde(default)]
    deposits_usd: Option<f64>,
}

/// `GET {nav_url}` returning `{"nav_usd": .., "deposits_usd": ..}`.
pub struct HttpNavSource {
    pool: Arc<ConnectionPool>,
    url: Url,
    host: String,
}

impl HttpNavSource {
    pub fn new(pool: Arc<ConnectionPool>, url: Url) -> Self {
        let host = host_key(&url);
        Self { pool, url, host }
    }
}

#[async_trait]
impl NavSource for HttpNavSource {
    async fn observe(&self) -> Result<NavObservation, FetchError> {
        let reply: NavReply = self
            .pool
            .request_json(&self.host, |c| c.get(self.url.clone()))
            .await
            .map_err(|e| FetchError::from_transport(SOURCE, e))?;

        let malformed = |reason: String| FetchError::MalformedResponse {
            protocol: SOURCE.to_string(),
            reason,
        };
        if !(reply.nav_usd.is_finite() && reply.nav_usd >= 0.0) {
            return Err(malformed(format!("nav_usd={}", reply.nav_usd)));
        }
        if let Some(d) = reply.deposits_usd {
            if !d.is_finite() {
                return Err(malformed(format!("deposits_usd={d}")));
            }
        }
        Ok(NavObservation {
            nav_usd: reply.nav_usd,
            deposits_usd: reply.deposits_usd,
        })
    }
}
