//! Concurrent media downloads with retry
//!
//! Downloads run in a single coordinator pass so that only the download limiter
//! (not batch boundaries) bounds how many transfers are open at once. Each call is
//! wrapped in [`retry_with_backoff`]: transient failures are retried with
//! exponential backoff, permanent failures are reported immediately, and a
//! transient failure that survives every attempt is reported as permanent.

use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::batch::BatchCoordinator;
use crate::config::RetryConfig;
use crate::error::{Result, TaskFailure};
use crate::limiter::ConcurrencyLimiter;
use crate::progress::ProgressSink;
use crate::retry::retry_with_backoff;
use crate::types::TaskResult;

/// Runs download functions over a list of items under a download-specific ceiling
#[derive(Debug)]
pub struct DownloadCoordinator {
    batch: BatchCoordinator,
    retry: RetryConfig,
}

impl DownloadCoordinator {
    /// Create a coordinator bounded by `limiter` that retries according to `retry`
    pub fn new(
        limiter: Arc<ConcurrencyLimiter>,
        retry: RetryConfig,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            batch: BatchCoordinator::new(limiter, cancel).with_name("download"),
            retry,
        }
    }

    /// Report progress to `sink` (once, when the pass completes)
    #[must_use]
    pub fn with_progress(mut self, sink: Arc<dyn ProgressSink>) -> Self {
        self.batch = self.batch.with_progress(sink);
        self
    }

    /// The limiter bounding concurrent downloads
    pub fn limiter(&self) -> &Arc<ConcurrencyLimiter> {
        self.batch.limiter()
    }

    /// Retry policy applied to each download
    pub fn retry_config(&self) -> &RetryConfig {
        &self.retry
    }

    /// The signal that stops this coordinator's runs
    pub fn cancellation_token(&self) -> &CancellationToken {
        self.batch.cancellation_token()
    }

    /// Download every item, returning one ordered result per item
    ///
    /// # Errors
    ///
    /// Never fails for item-level problems; those are reported in the result vector.
    pub async fn run<'a, T, V, F, Fut>(
        &self,
        items: &'a [T],
        download: F,
    ) -> Result<Vec<TaskResult<V>>>
    where
        F: Fn(&'a T) -> Fut,
        Fut: Future<Output = std::result::Result<V, TaskFailure>>,
    {
        self.run_with_progress(items, download, None).await
    }

    /// [`run`](Self::run), reporting to `sink` instead of the configured sink when given
    pub(crate) async fn run_with_progress<'a, T, V, F, Fut>(
        &self,
        items: &'a [T],
        download: F,
        sink: Option<&dyn ProgressSink>,
    ) -> Result<Vec<TaskResult<V>>>
    where
        F: Fn(&'a T) -> Fut,
        Fut: Future<Output = std::result::Result<V, TaskFailure>>,
    {
        if items.is_empty() {
            return Ok(Vec::new());
        }

        tracing::info!(
            count = items.len(),
            max_concurrent = self.limiter().capacity(),
            "Starting concurrent downloads"
        );

        let download = &download;
        let worker = |item: &'a T| self.download_with_retry(item, download);
        match sink {
            Some(sink) => {
                self.batch
                    .run_with_progress(items, items.len(), worker, sink)
                    .await
            }
            None => self.batch.run(items, items.len(), worker).await,
        }
    }

    async fn download_with_retry<'a, T, V, F, Fut>(
        &self,
        item: &'a T,
        download: &F,
    ) -> std::result::Result<V, TaskFailure>
    where
        F: Fn(&'a T) -> Fut,
        Fut: Future<Output = std::result::Result<V, TaskFailure>>,
    {
        let outcome =
            retry_with_backoff(&self.retry, self.cancellation_token(), || download(item)).await;
        match outcome {
            Err(last) if last.retryable() => {
                Err(TaskFailure::exhausted(self.retry.max_attempts + 1, &last))
            }
            other => other,
        }
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FailureKind;
    use crate::types::RunSummary;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn fast_retry(max_attempts: u32) -> RetryConfig {
        RetryConfig {
            max_attempts,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
            backoff_multiplier: 2.0,
            jitter: false,
        }
    }

    fn coordinator(permits: usize, retry: RetryConfig) -> DownloadCoordinator {
        DownloadCoordinator::new(
            Arc::new(ConcurrencyLimiter::new(permits)),
            retry,
            CancellationToken::new(),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failure_is_retried_until_success() {
        let attempts = Mutex::new(HashMap::<usize, u32>::new());
        let items: Vec<usize> = (0..4).collect();

        let results = coordinator(2, fast_retry(3))
            .run(&items, |id: &usize| {
                let id = *id;
                let attempt = {
                    let mut attempts = attempts.lock().unwrap();
                    let n = attempts.entry(id).or_default();
                    *n += 1;
                    *n
                };
                async move {
                    if id == 1 && attempt < 3 {
                        Err(TaskFailure::transient("connection reset"))
                    } else {
                        Ok(format!("media_{id}.jpg"))
                    }
                }
            })
            .await
            .unwrap();

        assert!(results.iter().all(|r| r.is_success()));
        assert_eq!(results[1].value().unwrap(), "media_1.jpg");
        assert_eq!(attempts.lock().unwrap()[&1], 3);
        assert_eq!(attempts.lock().unwrap()[&0], 1);
    }

    #[tokio::test]
    async fn permanent_failure_is_not_retried() {
        let calls = AtomicUsize::new(0);
        let items = vec!["expired-file-reference"];

        let results = coordinator(1, fast_retry(5))
            .run(&items, |_: &&str| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(TaskFailure::permanent("file reference expired")) }
            })
            .await
            .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let failure = results[0].failure().unwrap();
        assert_eq!(failure.kind, FailureKind::Permanent);
        assert_eq!(failure.reason, "file reference expired");
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_become_permanent() {
        let calls = AtomicUsize::new(0);
        let items = vec![7u32];

        let results = coordinator(1, fast_retry(2))
            .run(&items, |_: &u32| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(TaskFailure::transient("flood wait")) }
            })
            .await
            .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 3, "first try plus two retries");
        let failure = results[0].failure().unwrap();
        assert_eq!(failure.kind, FailureKind::Permanent);
        assert!(failure.reason.contains("3 attempts"), "{}", failure.reason);
        assert!(failure.reason.contains("flood wait"));
    }

    #[tokio::test]
    async fn single_pass_is_bounded_by_the_download_limiter() {
        let current = AtomicUsize::new(0);
        let peak = AtomicUsize::new(0);
        let items: Vec<usize> = (0..40).collect();

        let results = coordinator(5, RetryConfig::none())
            .run(&items, |n: &usize| {
                let n = *n;
                let (current, peak) = (&current, &peak);
                async move {
                    let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(2)).await;
                    current.fetch_sub(1, Ordering::SeqCst);
                    Ok(n)
                }
            })
            .await
            .unwrap();

        assert_eq!(RunSummary::from_results(&results).succeeded, 40);
        let peak = peak.load(Ordering::SeqCst);
        assert!(peak <= 5, "peak concurrency {peak} exceeded 5 permits");
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_interrupts_retry_backoff() {
        let downloads = coordinator(
            2,
            RetryConfig {
                initial_delay: Duration::from_secs(30),
                ..fast_retry(10)
            },
        );
        let cancel = downloads.cancellation_token().clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            cancel.cancel();
        });
        let items = vec![1, 2];

        let results = tokio::time::timeout(
            Duration::from_secs(10),
            downloads.run(&items, |_: &i32| async {
                Err::<(), _>(TaskFailure::transient("timeout"))
            }),
        )
        .await
        .expect("cancelled downloads must not wait out the backoff")
        .unwrap();

        assert!(
            results
                .iter()
                .all(|r| r.failure().is_some_and(TaskFailure::is_cancelled))
        );
    }

    #[tokio::test]
    async fn empty_download_list() {
        let items: Vec<String> = Vec::new();
        let results = coordinator(1, RetryConfig::none())
            .run(&items, |name: &String| {
                let name = name.clone();
                async move { Ok(name) }
            })
            .await
            .unwrap();
        assert!(results.is_empty());
    }
}
