//! Bounded retry with exponential backoff for transient filesystem errors.
//!
//! Only errors for which [`Error::is_retryable`] holds are retried; a wrong
//! key or a failed tag is reported on first sight.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::sleep;
use tracing::{debug, warn};

use casevault_common::{Error, Result};

/// How often, and how patiently, per-file I/O is retried.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Retries after the first attempt. Zero disables retrying.
    pub max_retries: u32,
    /// Delay before the first retry, in milliseconds. Doubles per retry.
    pub base_delay_ms: u64,
    /// Upper bound of a single delay, in milliseconds.
    pub max_delay_ms: u64,
    /// Spread delays by +/- 25% so parallel workers do not retry in step.
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 50,
            max_delay_ms: 1_000,
            jitter: true,
        }
    }
}

impl RetryConfig {
    /// No retries; the first failure is final.
    pub fn disabled() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Delay before retry number `retry` (zero-based).
    pub fn backoff(&self, retry: u32) -> Duration {
        let doubled = self
            .base_delay_ms
            .saturating_mul(1u64.checked_shl(retry).unwrap_or(u64::MAX));
        let capped = doubled.min(self.max_delay_ms);
        if !self.jitter || capped == 0 {
            return Duration::from_millis(capped);
        }
        let spread = 0.75 + rand::random::<f64>() * 0.5;
        Duration::from_millis((capped as f64 * spread) as u64)
    }
}

/// Runs fallible I/O under a [`RetryConfig`]. Cheap to clone.
#[derive(Debug, Clone, Default)]
pub struct RetryExecutor {
    config: RetryConfig,
}

impl RetryExecutor {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Run `operation` until it succeeds, fails permanently, or the retry
    /// budget is spent. The last error is returned.
    pub async fn execute<F, Fut, T>(&self, operation: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut retry = 0;
        loop {
            let err = match operation().await {
                Ok(value) => {
                    if retry > 0 {
                        debug!(retries = retry, "I/O succeeded after retrying");
                    }
                    return Ok(value);
                }
                Err(err) if !err.is_retryable() => return Err(err),
                Err(err) => err,
            };

            if retry >= self.config.max_retries {
                warn!(attempts = retry + 1, "Giving up on I/O: {}", err);
                return Err(err);
            }
            let delay = self.config.backoff(retry);
            retry += 1;
            warn!(attempt = retry, ?delay, "Transient I/O failure: {}", err);
            sleep(delay).await;
        }
    }

    /// Run a blocking job on the blocking pool, with retries.
    ///
    /// Every attempt re-runs the job from scratch, so it must be idempotent:
    /// the vault's jobs only ever write fresh temporaries.
    pub async fn execute_blocking<F, T>(&self, job: F) -> Result<T>
    where
        F: Fn() -> Result<T> + Send + Sync + Clone + 'static,
        T: Send + 'static,
    {
        self.execute(|| {
            let job = job.clone();
            async move {
                tokio::task::spawn_blocking(job)
                    .await
                    .map_err(|e| Error::Vault(format!("Worker task failed: {}", e)))?
            }
        })
        .await
    }
}
