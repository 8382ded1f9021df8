//! Retry logic with exponential backoff
//!
//! This module provides configurable retry logic for transient failures.
//! It implements exponential backoff with optional jitter to prevent thundering herd,
//! and stops waiting as soon as the run's cancellation token fires.
//!
//! # Example
//!
//! ```no_run
//! use inspector_engine::retry::retry_with_backoff;
//! use inspector_engine::config::RetryConfig;
//! use inspector_engine::TaskFailure;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> Result<(), TaskFailure> {
//! let config = RetryConfig::default();
//! let cancel = CancellationToken::new();
//! let bytes = retry_with_backoff(&config, &cancel, || async {
//!     // Fetch a media blob here
//!     Ok::<_, TaskFailure>(vec![0u8; 16])
//! })
//! .await?;
//! # Ok(())
//! # }
//! ```

use crate::config::RetryConfig;
use crate::error::{Error, TaskFailure, is_transient_io};
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Trait for errors that can be classified as retryable or not
///
/// Transient failures (network timeouts, flood waits, connection reset) should return `true`.
/// Permanent failures (permission denied, invalid payload) should return `false`.
pub trait IsRetryable {
    /// Returns true if the error is transient and the operation should be retried
    fn is_retryable(&self) -> bool;
}

impl IsRetryable for TaskFailure {
    fn is_retryable(&self) -> bool {
        self.retryable()
    }
}

impl IsRetryable for Error {
    fn is_retryable(&self) -> bool {
        // Whole-run errors are contract violations or shutdown, never transient
        false
    }
}

impl IsRetryable for std::io::Error {
    fn is_retryable(&self) -> bool {
        is_transient_io(self.kind())
    }
}

/// Execute an async operation with exponential backoff retry logic
///
/// The operation is tried once, then retried up to `config.max_attempts` more times
/// while it keeps failing with a retryable error. Non-retryable errors are returned
/// immediately. If `cancel` fires during a backoff sleep, a cancelled
/// [`TaskFailure`] (converted into `E`) is returned without another attempt.
///
/// # Returns
///
/// Returns the successful result or the last error after all retry attempts are exhausted.
pub async fn retry_with_backoff<F, Fut, T, E>(
    config: &RetryConfig,
    cancel: &CancellationToken,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: IsRetryable + std::fmt::Display + From<TaskFailure>,
{
    let mut retries = 0;
    let mut delay = config.initial_delay;

    loop {
        let error = match operation().await {
            Ok(result) => {
                if retries > 0 {
                    tracing::info!(attempts = retries + 1, "Operation succeeded after retry");
                }
                return Ok(result);
            }
            Err(e) => e,
        };

        if !error.is_retryable() {
            tracing::error!(error = %error, "Operation failed with non-retryable error");
            return Err(error);
        }
        if retries >= config.max_attempts {
            tracing::error!(
                error = %error,
                attempts = retries + 1,
                "Operation failed after all retry attempts exhausted"
            );
            return Err(error);
        }

        retries += 1;
        let wait = if config.jitter { add_jitter(delay) } else { delay };
        tracing::warn!(
            error = %error,
            attempt = retries,
            max_attempts = config.max_attempts,
            delay_ms = wait.as_millis(),
            "Operation failed, retrying"
        );

        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                tracing::debug!(attempt = retries, "Retry abandoned: run cancelled");
                return Err(E::from(TaskFailure::cancelled()));
            }
            _ = tokio::time::sleep(wait) => {}
        }

        delay = next_delay(delay, config);
    }
}

/// The backoff delay following `delay`, capped at `max_delay`
fn next_delay(delay: Duration, config: &RetryConfig) -> Duration {
    Duration::try_from_secs_f64(delay.as_secs_f64() * config.backoff_multiplier)
        .unwrap_or(config.max_delay)
        .min(config.max_delay)
}

/// Add random jitter to a delay to prevent thundering herd
///
/// Jitter is uniformly distributed between 0% and 100% of the delay,
/// so the actual delay will be between `delay` and `2 * delay`. The result
/// saturates at [`Duration::MAX`].
fn add_jitter(delay: Duration) -> Duration {
    let jitter_factor: f64 = rand::thread_rng().gen_range(0.0..=1.0);
    Duration::try_from_secs_f64(delay.as_secs_f64() * (1.0 + jitter_factor))
        .unwrap_or(Duration::MAX)
}
