//! Item-level retry with exponential backoff.

use crate::error::{PersistenceError, StorageError};
use mir_core::Result;
use rootcause::Report;
use std::future::Future;
use std::time::Duration;

/// How many times a durable write is attempted, and how long to wait between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one. Treated as at least 1.
    pub max_attempts: u32,
    /// Delay after the first failure; doubles with each further failure.
    pub base_delay: Duration,
    /// Upper bound for a single delay.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// A policy that tries once and never waits.
    #[must_use]
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    /// Delay to wait after the given failed attempt (0-based).
    #[must_use]
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let factor = 2_u32.saturating_pow(attempt);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// Runs `call` until it succeeds or the attempts run out.
    ///
    /// `operation` and `key` identify the write in logs and in the
    /// `RetryExhausted` error, which carries the last storage failure.
    pub async fn run<T, F, Fut>(
        &self,
        operation: &'static str,
        key: &str,
        mut call: F,
    ) -> Result<T, PersistenceError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StorageError>>,
    {
        let attempts = self.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            match call().await {
                Ok(value) => {
                    if attempt > 0 {
                        tracing::info!(
                            operation,
                            key,
                            attempt = attempt + 1,
                            "storage write recovered after retries"
                        );
                    }
                    return Ok(value);
                }
                Err(e) if attempt + 1 < attempts => {
                    let delay = self.backoff_delay(attempt);
                    tracing::warn!(
                        operation,
                        key,
                        attempt = attempt + 1,
                        max_attempts = attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "storage write failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    return Err(exhausted(e, operation, key, attempts));
                }
            }
        }
    }
}

fn exhausted(
    last: Report<StorageError>,
    operation: &'static str,
    key: &str,
    attempts: u32,
) -> Report<PersistenceError> {
    last.context(PersistenceError::RetryExhausted {
        operation,
        key: key.to_string(),
        attempts,
    })
}
