//! Minimum spacing between outbound calls
//!
//! The RateLimiter holds the timestamp of the last permitted call behind a tokio
//! mutex. The mutex is held while a caller sleeps out the remaining delay, so
//! only one caller proceeds at a time and waiters are released in the order
//! they arrived (tokio's mutex is fair).

use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::TaskFailure;

/// Enforces a minimum delay between consecutive permitted calls
///
/// # Examples
///
/// ```
/// use inspector_engine::rate_limiter::RateLimiter;
/// use std::time::Duration;
///
/// # async fn example() {
/// let limiter = RateLimiter::new(Duration::from_millis(500));
///
/// // Before each call to the external API
/// limiter.await_turn().await;
/// // ... fetch a message page ...
/// # }
/// ```
#[derive(Debug)]
pub struct RateLimiter {
    delay: Duration,
    /// Last permitted call (None until the first call)
    last_permitted: Mutex<Option<Instant>>,
}

impl RateLimiter {
    /// Create a limiter that spaces calls at least `delay` apart (zero = unthrottled)
    #[must_use]
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            last_permitted: Mutex::new(None),
        }
    }

    /// Create a limiter allowing at most `calls_per_second` calls per second
    ///
    /// A non-positive or non-finite rate disables throttling.
    #[must_use]
    pub fn per_second(calls_per_second: f64) -> Self {
        let delay = if calls_per_second.is_finite() && calls_per_second > 0.0 {
            Duration::try_from_secs_f64(1.0 / calls_per_second).unwrap_or(Duration::MAX)
        } else {
            Duration::ZERO
        };
        Self::new(delay)
    }

    /// Configured minimum spacing
    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Wait until this caller may make its call
    pub async fn await_turn(&self) {
        if self.delay.is_zero() {
            return;
        }

        let mut last = self.last_permitted.lock().await;
        let wait = self.remaining(*last);
        if !wait.is_zero() {
            tracing::trace!(wait_ms = wait.as_millis(), "Rate limit: waiting for turn");
            tokio::time::sleep(wait).await;
        }
        *last = Some(Instant::now());
    }

    /// Time left until `delay` has passed since `previous`
    fn remaining(&self, previous: Option<Instant>) -> Duration {
        previous.map_or(Duration::ZERO, |at| self.delay.saturating_sub(at.elapsed()))
    }

    /// Wait for a turn unless `cancel` fires first
    ///
    /// A cancelled waiter leaves the limiter's timestamp untouched.
    ///
    /// # Errors
    ///
    /// Returns a cancelled [`TaskFailure`] if the token fires before the turn arrives.
    pub async fn await_turn_cancellable(
        &self,
        cancel: &CancellationToken,
    ) -> Result<(), TaskFailure> {
        if cancel.is_cancelled() {
            return Err(TaskFailure::cancelled());
        }
        if self.delay.is_zero() {
            return Ok(());
        }

        let mut last = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(TaskFailure::cancelled()),
            guard = self.last_permitted.lock() => guard,
        };
        let wait = self.remaining(*last);
        if !wait.is_zero() {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(TaskFailure::cancelled()),
                _ = tokio::time::sleep(wait) => {}
            }
        }
        *last = Some(Instant::now());
        Ok(())
    }
}
