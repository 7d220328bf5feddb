//! Protocol data source adapter.
//!
//! Fetches the current price of one asset pair from one protocol's analytics
//! endpoint. Responses are untrusted: anything that does not describe the
//! requested pair with finite positive numbers becomes
//! [`FetchError::MalformedResponse`], never a panic.

use crate::config::ProtocolEndpoint;
use crate::errors::FetchError;
use crate::models::{AssetPair, MarketSnapshot};
use crate::pool::ConnectionPool;
use crate::utils::host_key;
use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;
use url::Url;

/// A source of market snapshots. Stateless per call.
#[async_trait]
pub trait ProtocolSource: Send + Sync {
    async fn fetch(&self, protocol: &str, pair: &AssetPair) -> Result<MarketSnapshot, FetchError>;
}

/// Wire shape of `GET {base}/pools?asset_a=..&asset_b=..`.
#[derive(Debug, Deserialize)]
pub struct PoolQuote {
    pub asset_a: String,
    pub asset_b: String,
    #[serde(default)]
    pub price: Option<f64>,
    #[serde(default)]
    pub reserve_a: Option<f64>,
    #[serde(default)]
    pub reserve_b: Option<f64>,
}

/// HTTP JSON adapter over the shared connection pool.
pub struct HttpProtocolAdapter {
    pool: Arc<ConnectionPool>,
    endpoints: HashMap<String, Url>,
}

impl HttpProtocolAdapter {
    pub fn new<'a>(
        pool: Arc<ConnectionPool>,
        endpoints: impl IntoIterator<Item = &'a ProtocolEndpoint>,
    ) -> Self {
        Self {
            pool,
            endpoints: endpoints
                .into_iter()
                .map(|p| (p.name.clone(), p.base_url.clone()))
                .collect(),
        }
    }

    fn pools_url(base: &Url, pair: &AssetPair) -> Result<Url, url::ParseError> {
        let mut url = base.join("pools")?;
        url.query_pairs_mut()
            .append_pair("asset_a", &pair.asset_a)
            .append_pair("asset_b", &pair.asset_b);
        Ok(url)
    }
}

#[async_trait]
impl ProtocolSource for HttpProtocolAdapter {
    async fn fetch(&self, protocol: &str, pair: &AssetPair) -> Result<MarketSnapshot, FetchError> {
        let base = self
            .endpoints
            .get(protocol)
            .ok_or_else(|| FetchError::Unreachable {
                protocol: protocol.to_string(),
                reason: "no endpoint configured".to_string(),
            })?;
        let url = Self::pools_url(base, pair).map_err(|e| FetchError::Unreachable {
            protocol: protocol.to_string(),
            reason: e.to_string(),
        })?;
        let host = host_key(&url);

        let quote: PoolQuote = self
            .pool
            .request_json(&host, |client| client.get(url.clone()))
            .await
            .map_err(|e| FetchError::from_transport(protocol, e))?;
        debug!(protocol, pair = %pair, ?quote, "[ADAPTER] quote received");
        validate_quote(protocol, pair, quote)
    }
}

/// Turn an untrusted quote into a snapshot for `pair`.
pub fn validate_quote(
    protocol: &str,
    pair: &AssetPair,
    quote: PoolQuote,
) -> Result<MarketSnapshot, FetchError> {
    let malformed = |reason: String| FetchError::MalformedResponse {
        protocol: protocol.to_string(),
        reason,
    };
    let quoted = AssetPair::new(&quote.asset_a, &quote.asset_b);
    if &quoted != pair {
        return Err(malformed(format!("asked for {pair}, got {quoted}")));
    }

    let positive = |name: &str, v: f64| {
        if v.is_finite() && v > 0.0 {
            Ok(v)
        } else {
            Err(malformed(format!("{name}={v} is not a positive number")))
        }
    };
    let reserves = match (quote.reserve_a, quote.reserve_b) {
        (Some(a), Some(b)) => Some((positive("reserve_a", a)?, positive("reserve_b", b)?)),
        (None, None) => None,
        _ => return Err(malformed("only one reserve reported".to_string())),
    };
    let price = match (quote.price, reserves) {
        (Some(p), _) => positive("price", p)?,
        (None, Some((a, b))) => positive("price", b / a)?,
        (None, None) => return Err(malformed("neither price nor reserves".to_string())),
    };

    Ok(MarketSnapshot {
        protocol: protocol.to_string(),
        asset_pair: pair.clone(),
        price,
        reserves,
        observed_at: Utc::now(),
    })
}
