//! Miscellaneous helper utilities.

use std::str::FromStr;
use std::time::Duration;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Initialize `tracing` subscriber with env-based filter.
///
/// `RUST_LOG` wins over `level` when set. Noisy HTTP crates are held at `info`
/// unless `level` is already a full directive string.
pub fn init_logging(level: &str, json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let level = level.trim();
        let directives = if level.contains(',') || level.contains('=') {
            level.to_string()
        } else {
            format!("{level},hyper=info,reqwest=info,rustls=info")
        };
        EnvFilter::from_str(&directives).unwrap_or_else(|_| EnvFilter::new("info"))
    });
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(fmt::layer().json().with_target(false).with_current_span(false))
            .init();
    } else {
        registry.with(fmt::layer().with_target(false)).init();
    }
}

/// Seconds as a `Duration`, tolerating fractional values from configuration.
pub fn secs_f64(secs: f64) -> Duration {
    if secs.is_finite() && secs > 0.0 {
        Duration::from_secs_f64(secs)
    } else {
        Duration::ZERO
    }
}

/// Resolves once `shutdown` reads `true` or its sender is gone.
pub async fn wait_for_shutdown(shutdown: &mut tokio::sync::watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

/// Host portion of an endpoint URL, used as the connection pool key.
pub fn host_key(url: &url::Url) -> String {
    match (url.host_str(), url.port()) {
        (Some(host), Some(port)) => format!("{host}:{port}"),
        (Some(host), None) => host.to_string(),
        (None, _) => url.as_str().to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_key_includes_port() {
        let url = url::Url::parse("http://127.0.0.1:8080/pools").expect("url");
        assert_eq!(host_key(&url), "127.0.0.1:8080");
        let url = url::Url::parse("https://api.tinyman.org/v1").expect("url");
        assert_eq!(host_key(&url), "api.tinyman.org");
    }

    #[test]
    fn secs_f64_rejects_garbage() {
        assert_eq!(secs_f64(-1.0), Duration::ZERO);
        assert_eq!(secs_f64(f64::NAN), Duration::ZERO);
        assert_eq!(secs_f64(1.5), Duration::from_millis(1500));
    }
}
