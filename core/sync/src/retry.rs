//! Exponential backoff for transient failures and contended locks.

use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

use vaultsync_common::{Error, Result};

/// Backoff schedule.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub initial_delay: Duration,
    /// Cap for exponential growth.
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
    /// Spread delays by +/- 25% so contending processes do not retry in step.
    pub jitter: bool,
}

impl RetryConfig {
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            initial_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(5),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }

    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Delay before retry number `attempt` (zero based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.initial_delay.as_millis() as f64
            * self.backoff_multiplier.powi(attempt as i32);
        let capped = base.min(self.max_delay.as_millis() as f64);
        let delay = if self.jitter {
            capped * (0.75 + rand::random::<f64>() * 0.5)
        } else {
            capped
        };
        Duration::from_millis(delay as u64)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(5)
    }
}

/// Runs an operation until it succeeds, fails permanently, or runs out of
/// retries.
#[derive(Debug, Clone, Default)]
pub struct RetryExecutor {
    config: RetryConfig,
}

impl RetryExecutor {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// Retry on transient errors (I/O, SQLite busy or locked).
    pub async fn execute<F, Fut, T>(&self, operation: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.execute_with_condition(operation, Error::is_transient)
            .await
    }

    /// Retry on transient errors and on lock contention.
    pub async fn execute_contended<F, Fut, T>(&self, operation: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.execute_with_condition(operation, |e| e.is_transient() || e.is_lock_contended())
            .await
    }

    /// Retry while `should_retry` accepts the error. The last error is
    /// returned once retries are exhausted.
    pub async fn execute_with_condition<F, Fut, T, C>(
        &self,
        operation: F,
        should_retry: C,
    ) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
        C: Fn(&Error) -> bool,
    {
        let mut attempt = 0;
        loop {
            match operation().await {
                Ok(value) => {
                    if attempt > 0 {
                        debug!("Succeeded after {} retries", attempt);
                    }
                    return Ok(value);
                }
                Err(err) if !should_retry(&err) => return Err(err),
                Err(err) => {
                    if attempt >= self.config.max_retries {
                        warn!("Giving up after {} attempts: {}", attempt + 1, err);
                        return Err(err);
                    }
                    let delay = self.config.delay_for_attempt(attempt);
                    attempt += 1;
                    debug!("Attempt {} failed: {}; retrying in {:?}", attempt, err, delay);
                    sleep(delay).await;
                }
            }
        }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }
}

/// Retry `operation` on transient errors with the default schedule.
pub async fn retry<F, Fut, T>(operation: F) -> Result<T>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    RetryExecutor::default().execute(operation).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fast(max_retries: u32) -> RetryExecutor {
        RetryExecutor::new(
            RetryConfig::new(max_retries)
                .with_initial_delay(Duration::from_millis(1))
                .with_jitter(false),
        )
    }

    #[test]
    fn test_delay_grows_and_caps() {
        let config = RetryConfig::new(10)
            .with_initial_delay(Duration::from_millis(100))
            .with_max_delay(Duration::from_millis(500))
            .with_jitter(false);

        assert_eq!(config.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(config.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(config.delay_for_attempt(2), Duration::from_millis(400));
        assert_eq!(config.delay_for_attempt(6), Duration::from_millis(500));
    }

    #[test]
    fn test_jitter_stays_in_band() {
        let config = RetryConfig::new(1).with_initial_delay(Duration::from_millis(1000));
        for _ in 0..50 {
            let delay = config.delay_for_attempt(0);
            assert!(delay >= Duration::from_millis(750) && delay <= Duration::from_millis(1250));
        }
    }

    #[tokio::test]
    async fn test_transient_error_is_retried() {
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = attempts.clone();

        let result: Result<u32> = fast(3)
            .execute(move || {
                let counter = counter.clone();
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(Error::Io(std::io::Error::other("flaky disk")))
                    } else {
                        Ok(7)
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 7);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_permanent_error_is_not_retried() {
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = attempts.clone();

        let result: Result<()> = fast(3)
            .execute(move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(Error::NotFound("notes/a.md".to_string()))
                }
            })
            .await;

        assert!(matches!(result, Err(Error::NotFound(_))));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_contention_gives_up_after_max_retries() {
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = attempts.clone();

        let result: Result<()> = fast(2)
            .execute_contended(move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(Error::LockContended {
                        path: "job:42".to_string(),
                        holder: "agent-1".to_string(),
                    })
                }
            })
            .await;

        assert!(result.unwrap_err().is_lock_contended());
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_helper() {
        let result: Result<&str> = retry(|| async { Ok("done") }).await;
        assert_eq!(result.unwrap(), "done");
    }
}
