use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::ProxyError;

/// Errors that can tell a retry loop whether trying again may help
pub trait Retryable {
    fn retryable(&self) -> bool;
}

impl Retryable for ProxyError {
    fn retryable(&self) -> bool {
        ProxyError::retryable(self)
    }
}

/// Retry policy with exponential backoff for collaborator calls.
///
/// The delay doubles on every retry, capped at `max_backoff`. Only errors
/// reported as retryable by [`Retryable::retryable`] are retried; the rest
/// fail immediately.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of retries before giving up
    pub max_retries: u32,
    /// Initial backoff duration
    pub initial_backoff: Duration,
    /// Maximum backoff duration
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff: Duration::from_secs(2),
            max_backoff: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, initial_backoff: Duration, max_backoff: Duration) -> Self {
        Self {
            max_retries,
            initial_backoff,
            max_backoff,
        }
    }

    /// Execute `operation`, retrying transient failures with backoff.
    pub async fn execute<F, Fut, T, E>(&self, mut operation: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Retryable + std::fmt::Display,
    {
        let mut backoff = self.initial_backoff;
        let mut attempt = 0u32;

        loop {
            match operation().await {
                Ok(value) => return Ok(value),
                Err(err) if err.retryable() && attempt < self.max_retries => {
                    attempt += 1;
                    warn!(
                        attempt,
                        max_retries = self.max_retries,
                        delay_ms = backoff.as_millis() as u64,
                        error = %err,
                        "Transient collaborator failure, retrying"
                    );
                    sleep(backoff).await;
                    backoff = (backoff * 2).min(self.max_backoff);
                }
                Err(err) => {
                    debug!(attempt, error = %err, "Collaborator call failed permanently");
                    return Err(err);
                }
            }
        }
    }
}
