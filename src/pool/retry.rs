use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::debug;

/// Bounded exponential backoff.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts including the first one. Never less than 1.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay: base_delay.saturating_mul(32).max(base_delay),
        }
    }

    /// Delay slept after failed attempt number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// Retry an async operation with exponential backoff while `is_retryable` accepts the error.
///
/// `op` receives the 1-based attempt number.
pub async fn retry_async<F, Fut, T, E, R>(
    policy: &RetryPolicy,
    is_retryable: R,
    mut op: F,
) -> Result<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    R: Fn(&E) -> bool,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match op(attempt).await {
            Ok(v) => return Ok(v),
            Err(e) if attempt < max_attempts && is_retryable(&e) => {
                let delay = policy.delay_for(attempt);
                debug!(attempt, delay_ms = delay.as_millis() as u64, "[RETRY] backing off");
                sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast(attempts: u32) -> RetryPolicy {
        RetryPolicy::new(attempts, Duration::from_millis(1))
    }

    #[test]
    fn delay_doubles_and_caps() {
        let p = RetryPolicy {
            max_attempts: 10,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(500),
        };
        assert_eq!(p.delay_for(1), Duration::from_millis(100));
        assert_eq!(p.delay_for(2), Duration::from_millis(200));
        assert_eq!(p.delay_for(3), Duration::from_millis(400));
        assert_eq!(p.delay_for(4), Duration::from_millis(500));
        assert_eq!(p.delay_for(40), Duration::from_millis(500));
    }

    #[tokio::test]
    async fn retries_until_success() {
        let counter = AtomicU32::new(0);
        let res: Result<u32, ()> = retry_async(&fast(4), |_| true, |_| {
            let current = counter.fetch_add(1, Ordering::Relaxed);
            async move {
                if current < 2 {
                    Err(())
                } else {
                    Ok(7)
                }
            }
        })
        .await;
        assert_eq!(res, Ok(7));
        assert_eq!(counter.load(Ordering::Relaxed), 3);
    }

    #[tokio::test]
    async fn stops_at_attempt_bound() {
        let counter = AtomicU32::new(0);
        let res: Result<(), &str> = retry_async(&fast(3), |_| true, |_| {
            counter.fetch_add(1, Ordering::Relaxed);
            async { Err("down") }
        })
        .await;
        assert_eq!(res, Err("down"));
        assert_eq!(counter.load(Ordering::Relaxed), 3);
    }

    #[tokio::test]
    async fn permanent_errors_are_not_retried() {
        let counter = AtomicU32::new(0);
        let res: Result<(), u16> = retry_async(&fast(5), |code| *code >= 500, |_| {
            counter.fetch_add(1, Ordering::Relaxed);
            async { Err(404) }
        })
        .await;
        assert_eq!(res, Err(404));
        assert_eq!(counter.load(Ordering::Relaxed), 1);
    }
}
