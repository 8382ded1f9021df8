//! Bounded worker slots
//!
//! [`ConcurrencyLimiter`] hands out at most `N` [`Permit`]s at a time. A permit is
//! released when it is dropped, so a worker that fails or panics still returns its
//! slot. Waiters are served in FIFO order by the underlying tokio semaphore.

use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

/// Limits how many units of work execute simultaneously
///
/// Cheap to share: wrap in an `Arc` and hand the same instance to every
/// coordinator that should compete for the same slots.
#[derive(Debug)]
pub struct ConcurrencyLimiter {
    semaphore: Arc<Semaphore>,
    capacity: usize,
}

impl ConcurrencyLimiter {
    /// Create a limiter with `capacity` slots
    ///
    /// A capacity of zero would make every acquisition wait forever, so it is
    /// raised to one. [`EngineConfig::validate`](crate::config::EngineConfig::validate)
    /// rejects zero ceilings before they get here.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    /// Wait for a free slot
    pub async fn acquire(&self) -> Permit {
        // The semaphore is never closed, so acquisition can only succeed.
        match Arc::clone(&self.semaphore).acquire_owned().await {
            Ok(permit) => Permit { _inner: permit },
            Err(_) => unreachable!("limiter semaphore is never closed"),
        }
    }

    /// Wait for a free slot unless `cancel` fires first
    ///
    /// Returns `None` when cancelled, so a cancelled run never waits on a slot
    /// that will not free up.
    pub async fn acquire_cancellable(&self, cancel: &CancellationToken) -> Option<Permit> {
        if cancel.is_cancelled() {
            return None;
        }
        tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            permit = self.acquire() => Some(permit),
        }
    }

    /// Take a slot only if one is free right now
    pub fn try_acquire(&self) -> Option<Permit> {
        Arc::clone(&self.semaphore)
            .try_acquire_owned()
            .ok()
            .map(|permit| Permit { _inner: permit })
    }

    /// Total number of slots
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Slots currently free
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Slots currently held
    pub fn in_flight(&self) -> usize {
        self.capacity - self.available()
    }
}

/// One held slot of a [`ConcurrencyLimiter`]; released on drop
#[derive(Debug)]
#[must_use = "the slot is released as soon as the permit is dropped"]
pub struct Permit {
    _inner: OwnedSemaphorePermit,
}
