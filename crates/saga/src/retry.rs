//! Bounded retry with exponential backoff for flaky external calls.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use crate::error::SagaError;

/// Retry policy applied to conferencing provider calls.
///
/// The n-th retry waits `initial_delay * 2^(n-1)`. There is no jitter and no
/// delay cap: attempts are few and the base delay is small.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    max_attempts: u32,
    initial_delay: Duration,
}

impl RetryPolicy {
    pub const PROVIDER_MAX_ATTEMPTS: u32 = 3;
    pub const PROVIDER_INITIAL_DELAY: Duration = Duration::from_millis(1000);

    /// Creates a policy. `max_attempts` of zero is treated as one.
    pub fn new(max_attempts: u32, initial_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_delay,
        }
    }

    /// 3 attempts, 1s base delay.
    pub fn provider_default() -> Self {
        Self::new(Self::PROVIDER_MAX_ATTEMPTS, Self::PROVIDER_INITIAL_DELAY)
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn initial_delay(&self) -> Duration {
        self.initial_delay
    }

    /// Delay before the attempt following failed attempt number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.initial_delay.saturating_mul(factor)
    }

    /// Runs `operation` until it succeeds or the attempts are exhausted.
    ///
    /// The last error is returned unchanged.
    pub async fn retry<T, E, F, Fut>(&self, operation: &str, mut f: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        let mut attempt = 1;
        loop {
            match f().await {
                Ok(value) => return Ok(value),
                Err(error) if attempt >= self.max_attempts => {
                    tracing::warn!(
                        operation,
                        attempts = attempt,
                        error = %error,
                        "Giving up after final attempt"
                    );
                    return Err(error);
                }
                Err(error) => {
                    let delay = self.delay_for(attempt);
                    tracing::debug!(
                        operation,
                        attempt,
                        max_attempts = self.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "Attempt failed, retrying"
                    );
                    metrics::counter!("saga_retry_attempts_total", "operation" => operation.to_string())
                        .increment(1);
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::provider_default()
    }
}

/// Bounds one provider call by `timeout`, if set.
pub async fn with_timeout<T, Fut>(
    timeout: Option<Duration>,
    operation: &'static str,
    fut: Fut,
) -> Result<T, SagaError>
where
    Fut: Future<Output = Result<T, SagaError>>,
{
    match timeout {
        Some(limit) => tokio::time::timeout(limit, fut)
            .await
            .map_err(|_| SagaError::ProviderTimeout {
                operation,
                timeout_ms: limit.as_millis(),
            })?,
        None => fut.await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn delays_double() {
        let policy = RetryPolicy::new(4, Duration::from_millis(100));
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(400));
    }

    #[test]
    fn zero_attempts_means_one() {
        assert_eq!(RetryPolicy::new(0, Duration::ZERO).max_attempts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_on_third_attempt_after_backoff() {
        let policy = RetryPolicy::provider_default();
        let calls = Arc::new(AtomicU32::new(0));
        let started = tokio::time::Instant::now();

        let result: Result<&str, String> = policy
            .retry("create_meeting", || {
                let calls = calls.clone();
                async move {
                    if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err("provider unavailable".to_string())
                    } else {
                        Ok("m-1")
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), "m-1");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        // 1s + 2s of backoff
        assert!(started.elapsed() >= Duration::from_millis(3000));
    }

    #[tokio::test(start_paused = true)]
    async fn returns_last_error_when_exhausted() {
        let policy = RetryPolicy::new(3, Duration::from_millis(10));
        let calls = Arc::new(AtomicU32::new(0));

        let result: Result<(), String> = policy
            .retry("cancel_meeting", || {
                let calls = calls.clone();
                async move {
                    let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                    Err(format!("failure {n}"))
                }
            })
            .await;

        assert_eq!(result.unwrap_err(), "failure 3");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_maps_to_provider_timeout() {
        let result: Result<(), SagaError> = with_timeout(
            Some(Duration::from_millis(50)),
            "create_meeting",
            async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            },
        )
        .await;

        assert!(matches!(
            result,
            Err(SagaError::ProviderTimeout {
                operation: "create_meeting",
                timeout_ms: 50
            })
        ));
    }
}
