use std::future::Future;
use std::time::{Duration, Instant};
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::error::{AppError, Result};

/// Retry policy configuration
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of attempts, including the first one
    pub max_attempts: u32,
    /// Base delay between retries (in milliseconds)
    pub base_delay_ms: u64,
    /// Maximum delay between retries (in milliseconds)
    pub max_delay_ms: u64,
    /// Multiplier for exponential backoff
    pub backoff_multiplier: f64,
    /// Whether to add jitter to delays
    pub use_jitter: bool,
    /// Bound on a single attempt; an attempt that overruns counts as a timeout
    pub attempt_timeout: Option<Duration>,
    /// Maximum total time to spend on retries (in milliseconds)
    pub max_total_time_ms: Option<u64>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1000,
            max_delay_ms: 30000,
            backoff_multiplier: 2.0,
            use_jitter: true,
            attempt_timeout: None,
            max_total_time_ms: Some(300000),
        }
    }
}

impl RetryPolicy {
    /// Fixed interval between attempts, no backoff.
    pub fn fixed(max_attempts: u32, interval: Duration) -> Self {
        Self {
            max_attempts,
            base_delay_ms: interval.as_millis() as u64,
            max_delay_ms: interval.as_millis() as u64,
            backoff_multiplier: 1.0,
            use_jitter: false,
            attempt_timeout: None,
            max_total_time_ms: None,
        }
    }

    /// Exponential backoff starting at `base`.
    pub fn exponential(max_attempts: u32, base: Duration, max: Duration) -> Self {
        Self {
            max_attempts,
            base_delay_ms: base.as_millis() as u64,
            max_delay_ms: max.as_millis() as u64,
            ..Default::default()
        }
    }

    pub fn with_attempt_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout = Some(timeout);
        self
    }

    pub fn without_jitter(mut self) -> Self {
        self.use_jitter = false;
        self
    }

    /// Execute an operation with retry logic.
    ///
    /// Only errors for which [`AppError::is_retryable`] holds are retried;
    /// everything else is returned on first sight.
    pub async fn execute<T, F, Fut>(&self, operation_name: &str, mut operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let start_time = Instant::now();
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 1;

        loop {
            debug!(operation = operation_name, attempt, "Executing operation with retry");

            let outcome = match self.attempt_timeout {
                Some(limit) => match tokio::time::timeout(limit, operation()).await {
                    Ok(result) => result,
                    Err(_) => Err(AppError::Timeout(format!(
                        "{} exceeded {:?}",
                        operation_name, limit
                    ))),
                },
                None => operation().await,
            };

            match outcome {
                Ok(result) => {
                    if attempt > 1 {
                        info!(operation = operation_name, attempt, "Operation succeeded after retry");
                    }
                    return Ok(result);
                }
                Err(error) => {
                    if !error.is_retryable() {
                        debug!(
                            operation = operation_name,
                            error_kind = error.kind(),
                            "Error is not retryable"
                        );
                        return Err(error);
                    }

                    if attempt >= max_attempts {
                        warn!(
                            operation = operation_name,
                            attempt,
                            max_attempts,
                            error = %error,
                            "Maximum retry attempts reached"
                        );
                        return Err(error);
                    }

                    if let Some(max_total_time) = self.max_total_time_ms {
                        if start_time.elapsed().as_millis() as u64 > max_total_time {
                            warn!(
                                operation = operation_name,
                                elapsed_ms = start_time.elapsed().as_millis() as u64,
                                max_total_time_ms = max_total_time,
                                "Maximum total retry time exceeded"
                            );
                            return Err(error);
                        }
                    }

                    let delay = self.delay_for(attempt);
                    warn!(
                        operation = operation_name,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "Operation failed, retrying after delay"
                    );

                    sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    /// Delay before the attempt following `attempt`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponential_delay =
            self.base_delay_ms as f64 * self.backoff_multiplier.powi(attempt.saturating_sub(1) as i32);

        let mut delay_ms = (exponential_delay as u64).min(self.max_delay_ms);

        if self.use_jitter {
            // ±5% jitter
            let jitter = (rand::random::<f64>() * 0.1 + 0.95) * delay_ms as f64;
            delay_ms = jitter as u64;
        }

        Duration::from_millis(delay_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_retries_transient_errors_until_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let policy = RetryPolicy::fixed(5, Duration::from_millis(1));

        let counter = calls.clone();
        let result = policy
            .execute("flaky", || {
                let counter = counter.clone();
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(AppError::NetworkError("connection reset".into()))
                    } else {
                        Ok(42)
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_non_retryable_error_returns_immediately() {
        let calls = Arc::new(AtomicU32::new(0));
        let policy = RetryPolicy::fixed(5, Duration::from_millis(1));

        let counter = calls.clone();
        let result: Result<()> = policy
            .execute("integrity", || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(AppError::RestoreIntegrityError("checksum mismatch".into()))
                }
            })
            .await;

        assert!(matches!(result, Err(AppError::RestoreIntegrityError(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_attempts_are_bounded() {
        let calls = Arc::new(AtomicU32::new(0));
        let policy = RetryPolicy::fixed(3, Duration::from_millis(1));

        let counter = calls.clone();
        let result: Result<()> = policy
            .execute("always-down", || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(AppError::Timeout("no answer".into()))
                }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_attempt_timeout_is_enforced() {
        let policy = RetryPolicy::fixed(2, Duration::from_millis(1))
            .with_attempt_timeout(Duration::from_millis(10));

        let result: Result<()> = policy
            .execute("slow", || async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await;

        assert!(matches!(result, Err(AppError::Timeout(_))));
    }

    #[test]
    fn test_exponential_delay_is_capped() {
        let policy = RetryPolicy::exponential(10, Duration::from_millis(100), Duration::from_millis(500))
            .without_jitter();

        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(400));
        assert_eq!(policy.delay_for(4), Duration::from_millis(500));
    }
}
