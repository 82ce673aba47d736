//! Retry with exponential backoff for store, queue and ledger calls.
//!
//! Only errors for which [`crate::error::ReplError::is_transient`] holds are retried;
//! everything else surfaces on the first attempt.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::warn;

use crate::error::Result;

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of retries after the first attempt (default: 5).
    pub max_retries: u32,
    /// Initial backoff duration (default: 200ms).
    pub initial_backoff: Duration,
    /// Maximum backoff duration (default: 10 seconds).
    pub max_backoff: Duration,
    /// Multiplier for exponential backoff (default: 2.0).
    pub backoff_multiplier: f64,
    /// Whether to add random jitter to backoff (default: true).
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(10),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryConfig {
    /// Config with `max_retries` and default timing.
    pub fn with_retries(max_retries: u32) -> Self {
        Self {
            max_retries,
            ..Default::default()
        }
    }
}

/// Executor for retry operations.
#[derive(Debug, Clone)]
pub struct RetryExecutor {
    config: RetryConfig,
}

impl RetryExecutor {
    /// Create a new RetryExecutor with the given configuration.
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// The configuration in use.
    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Run `operation`, retrying transient failures with backoff.
    ///
    /// `op` names the operation in log lines. The last error is returned once
    /// retries are exhausted or a permanent error occurs.
    pub async fn execute<F, Fut, T>(&self, op: &str, operation: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match operation().await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    if !e.is_transient() || attempt > self.config.max_retries {
                        return Err(e);
                    }
                    let backoff = self.compute_backoff(attempt - 1);
                    warn!(
                        op = op,
                        attempt = attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %e,
                        "retrying after transient failure"
                    );
                    tokio::time::sleep(backoff).await;
                }
            }
        }
    }

    /// `initial_backoff * multiplier^attempt`, capped at `max_backoff`, plus
    /// up to 50% jitter when enabled.
    pub fn compute_backoff(&self, attempt: u32) -> Duration {
        let base_delay_ms = self.config.initial_backoff.as_millis() as f64;
        let max_delay_ms = self.config.max_backoff.as_millis() as f64;

        let computed = base_delay_ms * self.config.backoff_multiplier.powi(attempt as i32);
        let capped = computed.min(max_delay_ms) as u64;

        if self.config.jitter && capped > 1 {
            let jitter_ms = rand::thread_rng().gen_range(0..=capped / 2);
            Duration::from_millis(capped.saturating_add(jitter_ms))
        } else {
            Duration::from_millis(capped)
        }
    }
}

impl Default for RetryExecutor {
    fn default() -> Self {
        Self::new(RetryConfig::default())
    }
}
