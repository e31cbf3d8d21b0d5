//! Exponential backoff with jitter for transient API failures
//!
//! Used for transient garden API failures during bootstrap and registration.
//! Retries stop early when the error says it is not retryable or when the
//! caller's cancellation token fires.
//!
//! # Example
//!
//! ```ignore
//! use seedlet_common::retry::{retry_with_backoff, RetryConfig};
//!
//! let seed = retry_with_backoff(
//!     &RetryConfig::with_max_attempts(5),
//!     &cancel,
//!     "get_seed",
//!     || async { client.get_seed("aws-eu1").await },
//! ).await?;
//! ```

use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

use crate::Error;

/// Backoff settings for operations that may fail transiently.
#[derive(Clone, Debug)]
pub struct RetryConfig {
    /// Maximum number of attempts (0 = infinite)
    pub max_attempts: u32,
    /// Wait before the second attempt
    pub initial_delay: Duration,
    /// Upper bound for any single wait
    pub max_delay: Duration,
    /// Growth factor between waits
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 0,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Give up after `attempts` tries
    pub fn with_max_attempts(attempts: u32) -> Self {
        Self {
            max_attempts: attempts,
            ..Default::default()
        }
    }

    /// Create a config that retries forever
    pub fn infinite() -> Self {
        Self::default()
    }

    /// Next delay after `current`, capped at `max_delay`
    pub fn next_delay(&self, current: Duration) -> Duration {
        Duration::from_secs_f64(
            (current.as_secs_f64() * self.backoff_multiplier).min(self.max_delay.as_secs_f64()),
        )
    }
}

/// Scale a delay by a random factor in 0.5..1.5
pub fn jittered(delay: Duration) -> Duration {
    let jitter = rand::thread_rng().gen_range(0.5..1.5);
    Duration::from_secs_f64(delay.as_secs_f64() * jitter)
}

/// Run `operation` until it succeeds or retrying is pointless
///
/// Retries until success, until `max_attempts` is exhausted, until the error
/// reports itself as non-retryable, or until `cancel` fires. A cancelled
/// wait returns [`Error::Cancelled`].
pub async fn retry_with_backoff<F, Fut, T>(
    config: &RetryConfig,
    cancel: &CancellationToken,
    operation_name: &str,
    mut operation: F,
) -> Result<T, Error>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, Error>>,
{
    let mut attempt = 0u32;
    let mut delay = config.initial_delay;

    loop {
        attempt += 1;

        let err = match operation().await {
            Ok(result) => return Ok(result),
            Err(e) => e,
        };

        if !err.is_retryable() {
            return Err(err);
        }
        if config.max_attempts > 0 && attempt >= config.max_attempts {
            error!(
                operation = %operation_name,
                attempt = attempt,
                error = %err,
                "Giving up after the last attempt"
            );
            return Err(err);
        }

        let wait = jittered(delay);
        warn!(
            operation = %operation_name,
            attempt = attempt,
            error = %err,
            delay_ms = wait.as_millis(),
            "Operation failed, retrying"
        );

        tokio::select! {
            _ = cancel.cancelled() => return Err(Error::cancelled(operation_name)),
            _ = tokio::time::sleep(wait) => {}
        }

        delay = config.next_delay(delay);
    }
}
