use thiserror::Error;

pub type Result<T> = std::result::Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("URL parse error: {0}")]
    UrlParse(#[from] url::ParseError),

    #[error("State store error: {0}")]
    Store(#[from] StoreError),
}

/// Failures of a single outbound HTTP exchange made through the connection pool.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("no pool slot for {host} within {waited_ms}ms")]
    PoolExhausted { host: String, waited_ms: u64 },

    #[error("request timed out")]
    Timeout,

    #[error("connection failed: {0}")]
    Connect(String),

    #[error("upstream returned HTTP {0}")]
    Status(u16),

    #[error("response decode failed: {0}")]
    Decode(String),

    #[error("request failed: {0}")]
    Request(String),
}

impl TransportError {
    /// Timeouts, connect failures, 5xx and 429 are worth another attempt.
    /// Every other 4xx and anything that reached the decoder is not.
    pub fn is_transient(&self) -> bool {
        match self {
            TransportError::Timeout | TransportError::Connect(_) => true,
            TransportError::Status(code) => *code == 429 || (500..600).contains(code),
            TransportError::PoolExhausted { .. }
            | TransportError::Decode(_)
            | TransportError::Request(_) => false,
        }
    }
}

impl From<reqwest::Error> for TransportError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            TransportError::Timeout
        } else if e.is_connect() {
            TransportError::Connect(e.to_string())
        } else if let Some(status) = e.status() {
            TransportError::Status(status.as_u16())
        } else if e.is_decode() {
            TransportError::Decode(e.to_string())
        } else {
            TransportError::Request(e.to_string())
        }
    }
}

/// Why a protocol source produced no snapshot this cycle.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum FetchError {
    #[error("{protocol} unreachable: {reason}")]
    Unreachable { protocol: String, reason: String },

    #[error("{protocol} rate limited")]
    RateLimited { protocol: String },

    #[error("{protocol} malformed response: {reason}")]
    MalformedResponse { protocol: String, reason: String },
}

impl FetchError {
    pub fn from_transport(protocol: &str, err: TransportError) -> Self {
        let protocol = protocol.to_string();
        match err {
            TransportError::Status(429) => FetchError::RateLimited { protocol },
            TransportError::Status(code) if (500..600).contains(&code) => {
                FetchError::Unreachable {
                    protocol,
                    reason: format!("HTTP {code}"),
                }
            }
            e @ (TransportError::Timeout
            | TransportError::Connect(_)
            | TransportError::PoolExhausted { .. }
            | TransportError::Request(_)) => FetchError::Unreachable {
                protocol,
                reason: e.to_string(),
            },
            e @ (TransportError::Status(_) | TransportError::Decode(_)) => {
                FetchError::MalformedResponse {
                    protocol,
                    reason: e.to_string(),
                }
            }
        }
    }
}

/// Outcome classes reported by the signer/broadcaster collaborator.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum BroadcastError {
    /// Nothing reached the broadcaster; safe to try again.
    #[error("broadcaster unreachable: {0}")]
    Unreachable(String),

    /// The broadcaster or the chain refused the transaction.
    #[error("rejected: {0}")]
    Rejected(String),

    /// The request may or may not have been acted upon.
    #[error("outcome unknown: {0}")]
    Ambiguous(String),
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to persist {path}: {source}")]
    Write {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("corrupt state in {path}: {reason}")]
    Corrupt { path: String, reason: String },

    #[error("invalid valuation: {0}")]
    InvalidValuation(String),
}

#[derive(Debug, Clone, Error)]
pub enum SupervisorError {
    #[error("{restarts} restarts within {window_secs}s, last error: {last_error}")]
    RestartBudgetExhausted {
        restarts: usize,
        window_secs: u64,
        last_error: String,
    },
}
