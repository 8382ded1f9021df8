//! Time-bounded memoization with single-flight computation
//!
//! [`TtlCache`] wraps a `moka` future cache. Every entry carries its own lifetime,
//! read back by a per-entry [`Expiry`] policy, so one cache can hold short-lived
//! message pages next to long-lived group metadata. Concurrent misses on one key
//! are coalesced by `try_get_with`: the first caller runs the computation and the
//! others share its result. Failed computations are never stored.
//!
//! Expired entries are never returned. moka evicts them during its own
//! maintenance, which [`TtlCache::purge_expired`] and the background sweeper
//! started with [`TtlCache::spawn_sweeper`] trigger explicitly.

use moka::Expiry;
use moka::future::Cache;
use moka::notification::RemovalCause;
use serde::Serialize;
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::error::Result;

/// Shortest period the background sweeper runs at
const MIN_SWEEP_INTERVAL: Duration = Duration::from_millis(10);

/// A cached value with the lifetime it was inserted with
#[derive(Clone, Debug)]
struct Stamped<V> {
    value: V,
    ttl: Duration,
}

/// Expires each entry `ttl` after it was (re)inserted
struct PerEntryTtl;

impl<K, V> Expiry<K, Stamped<V>> for PerEntryTtl {
    fn expire_after_create(
        &self,
        _key: &K,
        stamped: &Stamped<V>,
        _created_at: std::time::Instant,
    ) -> Option<Duration> {
        Some(stamped.ttl)
    }

    fn expire_after_update(
        &self,
        _key: &K,
        stamped: &Stamped<V>,
        _updated_at: std::time::Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        Some(stamped.ttl)
    }
}

/// Keyed cache whose entries expire after a per-insert TTL
pub struct TtlCache<K, V> {
    inner: Cache<K, Stamped<V>>,
    /// Entries expired since the last purge
    expired: Arc<AtomicUsize>,
}

impl<K, V> std::fmt::Debug for TtlCache<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TtlCache")
            .field("expired", &self.expired.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl<K, V> Default for TtlCache<K, V>
where
    K: Eq + Hash + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        let expired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&expired);
        let inner = Cache::builder()
            .expire_after(PerEntryTtl)
            .eviction_listener(move |_key: Arc<K>, _value: Stamped<V>, cause: RemovalCause| {
                if cause == RemovalCause::Expired {
                    counter.fetch_add(1, Ordering::Relaxed);
                }
            })
            .build();
        Self { inner, expired }
    }
}

impl<K, V> TtlCache<K, V>
where
    K: Eq + Hash + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Create an empty cache
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the live value for `key`, computing and storing it if absent
    ///
    /// `compute` runs at most once per missing key across concurrent callers. Its
    /// result is stored with `ttl`; its error is returned to every caller waiting
    /// on that computation and nothing is stored, so the next lookup retries.
    ///
    /// # Errors
    ///
    /// Returns whatever `compute` returns when it fails.
    pub async fn get_or_compute<F, Fut, E>(
        &self,
        key: K,
        ttl: Duration,
        compute: F,
    ) -> std::result::Result<V, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<V, E>>,
        E: Clone + Send + Sync + 'static,
    {
        self.inner
            .try_get_with(key, async move {
                compute().await.map(|value| Stamped { value, ttl })
            })
            .await
            .map(|stamped| stamped.value)
            .map_err(Arc::unwrap_or_clone)
    }

    /// The live value for `key`, if any
    pub async fn get(&self, key: &K) -> Option<V> {
        self.inner.get(key).await.map(|stamped| stamped.value)
    }

    /// Drop the entry for `key`; returns whether a value was removed
    pub async fn invalidate(&self, key: &K) -> bool {
        self.inner.remove(key).await.is_some()
    }

    /// Drop every entry
    pub async fn clear(&self) {
        self.inner.invalidate_all();
        self.inner.run_pending_tasks().await;
    }

    /// Number of live entries
    pub fn len(&self) -> usize {
        self.inner.iter().count()
    }

    /// Whether the cache holds no live entries
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run pending maintenance, evicting expired entries
    ///
    /// Returns how many entries expired since the previous purge, including
    /// those moka evicted on its own during reads and writes.
    pub async fn purge_expired(&self) -> usize {
        self.inner.run_pending_tasks().await;
        self.expired.swap(0, Ordering::Relaxed)
    }

    /// Spawn a background task that purges expired entries every `interval`
    ///
    /// The task holds only a weak reference: it stops when `cancel` fires or at
    /// the first tick after the last `Arc` to the cache is dropped. Intervals
    /// shorter than 10ms are raised to 10ms.
    pub fn spawn_sweeper(
        self: &Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let cache = Arc::downgrade(self);
        let period = interval.max(MIN_SWEEP_INTERVAL);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let Some(cache) = cache.upgrade() else {
                            tracing::debug!("Cache dropped, stopping sweeper");
                            break;
                        };
                        let removed = cache.purge_expired().await;
                        if removed > 0 {
                            tracing::debug!(removed, "Cache sweep evicted expired entries");
                        }
                    }
                    _ = cancel.cancelled() => {
                        break;
                    }
                }
            }
        })
    }
}

/// Derive a cache key from an operation name and its arguments
///
/// ```
/// use inspector_engine::cache::cache_key;
///
/// let key = cache_key("get_participants", &("@rustlang", 200))?;
/// assert_eq!(key, r#"get_participants:["@rustlang",200]"#);
/// # Ok::<(), inspector_engine::Error>(())
/// ```
///
/// # Errors
///
/// Returns [`Error::Serialization`](crate::Error::Serialization) if the arguments
/// cannot be serialized.
pub fn cache_key<A: Serialize + ?Sized>(operation: &str, args: &A) -> Result<String> {
    Ok(format!("{operation}:{}", serde_json::to_string(args)?))
}
