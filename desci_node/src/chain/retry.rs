use std::future::Future;
use std::time::Duration;

use crate::config::{ChainConfig, RetryConfig};
use crate::error::{Result, SyncError};
use crate::metrics;

/// Bounded retry with exponential backoff for RPC calls.
///
/// Each attempt runs under `attempt_timeout`; an elapsed timeout counts as
/// a transient failure. Non-transient errors are returned immediately.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub attempt_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default(), &ChainConfig::default())
    }
}

impl RetryPolicy {
    pub fn from_config(retry: &RetryConfig, chain: &ChainConfig) -> Self {
        Self {
            max_attempts: retry.max_attempts.max(1),
            initial_backoff: Duration::from_millis(retry.initial_backoff_ms),
            max_backoff: Duration::from_millis(retry.max_backoff_ms),
            attempt_timeout: chain.rpc_timeout(),
        }
    }

    /// Delay after the `attempt`-th failure (1-based), doubling up to `max_backoff`
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(20);
        self.initial_backoff
            .saturating_mul(1u32 << shift)
            .min(self.max_backoff)
    }

    pub async fn run<T, F, Fut>(&self, label: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut last_error = String::new();
        for attempt in 1..=self.max_attempts {
            let err = match tokio::time::timeout(self.attempt_timeout, op()).await {
                Ok(Ok(value)) => return Ok(value),
                Ok(Err(err)) if err.is_transient() => err,
                Ok(Err(err)) => return Err(err),
                Err(_) => SyncError::TransientRpc(format!(
                    "{label} timed out after {:?}",
                    self.attempt_timeout
                )),
            };

            last_error = err.to_string();
            metrics::RPC_RETRIES.with_label_values(&[label]).inc();

            if attempt < self.max_attempts {
                let delay = self.backoff_for(attempt);
                log::warn!(
                    "{} failed (attempt {}/{}): {}; retrying in {:?}",
                    label,
                    attempt,
                    self.max_attempts,
                    last_error,
                    delay
                );
                tokio::time::sleep(delay).await;
            }
        }

        Err(SyncError::RetryExhausted {
            attempts: self.max_attempts,
            last_error,
        })
    }
}
