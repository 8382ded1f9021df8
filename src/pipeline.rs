//! Rate-limited, cached external calls
//!
//! [`ThrottledCache`] composes a shared [`RateLimiter`] with a shared [`TtlCache`]:
//! a lookup is served from the cache when a live entry exists, and only a miss
//! waits for a rate-limit turn before issuing the external call. Concurrent
//! misses on one key share a single call.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::cache::TtlCache;
use crate::error::TaskFailure;
use crate::rate_limiter::RateLimiter;

/// Cache in front of a throttled external operation
#[derive(Debug)]
pub struct ThrottledCache<V> {
    rate_limiter: Arc<RateLimiter>,
    cache: Arc<TtlCache<String, V>>,
    ttl: Duration,
}

impl<V> Clone for ThrottledCache<V> {
    fn clone(&self) -> Self {
        Self {
            rate_limiter: Arc::clone(&self.rate_limiter),
            cache: Arc::clone(&self.cache),
            ttl: self.ttl,
        }
    }
}

impl<V> ThrottledCache<V>
where
    V: Clone + Send + Sync + 'static,
{
    /// Combine a rate limiter and a cache; results live for `ttl`
    pub fn new(
        rate_limiter: Arc<RateLimiter>,
        cache: Arc<TtlCache<String, V>>,
        ttl: Duration,
    ) -> Self {
        Self {
            rate_limiter,
            cache,
            ttl,
        }
    }

    /// The underlying cache
    pub fn cache(&self) -> &Arc<TtlCache<String, V>> {
        &self.cache
    }

    /// The limiter spacing external calls
    pub fn rate_limiter(&self) -> &Arc<RateLimiter> {
        &self.rate_limiter
    }

    /// Lifetime of cached results
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Return the cached value for `key`, or wait for a rate-limit turn and call `external_call`
    ///
    /// # Errors
    ///
    /// Returns the external call's error; nothing is cached in that case. Callers
    /// that shared the failed call all receive a clone of the error.
    ///
    /// # Example
    ///
    /// ```
    /// use inspector_engine::{RateLimiter, TaskFailure, ThrottledCache, TtlCache, cache_key};
    /// use std::sync::Arc;
    /// use std::time::Duration;
    ///
    /// # #[tokio::main(flavor = "current_thread")]
    /// # async fn main() -> inspector_engine::Result<()> {
    /// let groups = ThrottledCache::new(
    ///     Arc::new(RateLimiter::new(Duration::from_millis(10))),
    ///     Arc::new(TtlCache::new()),
    ///     Duration::from_secs(300),
    /// );
    /// let key = cache_key("fetch_group", &("rustaceans",))?;
    /// let title = groups
    ///     .call(key, || async { Ok::<_, TaskFailure>("Rustaceans".to_string()) })
    ///     .await
    ///     .map_err(|e| inspector_engine::Error::Other(e.to_string()))?;
    /// assert_eq!(title, "Rustaceans");
    /// # Ok(())
    /// # }
    /// ```
    pub async fn call<F, Fut, E>(&self, key: String, external_call: F) -> Result<V, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
        E: Clone + Send + Sync + 'static,
    {
        let rate_limiter = &self.rate_limiter;
        self.cache
            .get_or_compute(key, self.ttl, || async move {
                rate_limiter.await_turn().await;
                external_call().await
            })
            .await
    }

    /// [`call`](Self::call), abandoning the rate-limit wait when `cancel` fires
    ///
    /// # Errors
    ///
    /// Returns a cancelled failure if the token fires before the call is issued,
    /// otherwise the external call's error.
    pub async fn call_cancellable<F, Fut, E>(
        &self,
        key: String,
        cancel: &CancellationToken,
        external_call: F,
    ) -> Result<V, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
        E: From<TaskFailure> + Clone + Send + Sync + 'static,
    {
        let rate_limiter = &self.rate_limiter;
        self.cache
            .get_or_compute(key, self.ttl, || async move {
                rate_limiter.await_turn_cancellable(cancel).await?;
                external_call().await
            })
            .await
    }
}
