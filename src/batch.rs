//! Batch coordination with bounded dispatch and per-item failure isolation
//!
//! A run splits the caller's items into consecutive batches. Every item of a batch
//! is dispatched concurrently, each one holding a [`Permit`] of the coordinator's
//! [`ConcurrencyLimiter`] while its worker runs. The next batch starts only when
//! every item of the current one has reached a terminal state.
//!
//! Cancellation is observed at every suspension point: before each batch, while
//! waiting for a permit, and while the worker runs. Items that never got a permit
//! end as [`TaskOutcome::Cancelled`]; items aborted mid-flight end as a cancelled
//! [`TaskFailure`].

use futures::FutureExt;
use futures::future::join_all;
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result, TaskFailure};
use crate::limiter::{ConcurrencyLimiter, Permit};
use crate::progress::{NoProgress, ProgressSink};
use crate::types::{RunSummary, TaskOutcome, TaskResult};

/// Drives ordered work items through a bounded worker pool, one batch at a time
pub struct BatchCoordinator {
    name: &'static str,
    limiter: Arc<ConcurrencyLimiter>,
    cancel: CancellationToken,
    progress: Arc<dyn ProgressSink>,
}

impl std::fmt::Debug for BatchCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchCoordinator")
            .field("name", &self.name)
            .field("limiter", &self.limiter)
            .field("cancelled", &self.cancel.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl BatchCoordinator {
    /// Create a coordinator that dispatches through `limiter` and stops on `cancel`
    pub fn new(limiter: Arc<ConcurrencyLimiter>, cancel: CancellationToken) -> Self {
        Self {
            name: "analysis",
            limiter,
            cancel,
            progress: Arc::new(NoProgress),
        }
    }

    /// Report per-batch progress to `sink`
    #[must_use]
    pub fn with_progress(mut self, sink: Arc<dyn ProgressSink>) -> Self {
        self.progress = sink;
        self
    }

    /// Label used in log lines
    #[must_use]
    pub fn with_name(mut self, name: &'static str) -> Self {
        self.name = name;
        self
    }

    /// Label used in log lines
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// The limiter bounding this coordinator's concurrency
    pub fn limiter(&self) -> &Arc<ConcurrencyLimiter> {
        &self.limiter
    }

    /// The signal that stops this coordinator's runs
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Run `worker` over every item, `batch_size` items at a time
    ///
    /// The returned vector has one entry per item and `results[i].index == i`,
    /// regardless of completion order.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if `batch_size` is zero. Item failures never fail
    /// the run; they are reported in the result vector.
    ///
    /// # Example
    ///
    /// ```
    /// use inspector_engine::{BatchCoordinator, ConcurrencyLimiter, TaskFailure};
    /// use std::sync::Arc;
    /// use tokio_util::sync::CancellationToken;
    ///
    /// # #[tokio::main(flavor = "current_thread")]
    /// # async fn main() -> inspector_engine::Result<()> {
    /// let coordinator = BatchCoordinator::new(
    ///     Arc::new(ConcurrencyLimiter::new(4)),
    ///     CancellationToken::new(),
    /// );
    /// let messages = vec!["hello", "", "world"];
    /// let results = coordinator
    ///     .run(&messages, 100, |text: &&str| {
    ///         let text = *text;
    ///         async move {
    ///             if text.is_empty() {
    ///                 Err(TaskFailure::permanent("empty message"))
    ///             } else {
    ///                 Ok(text.len())
    ///             }
    ///         }
    ///     })
    ///     .await?;
    /// assert_eq!(results[0].value(), Some(&5));
    /// assert!(results[1].failure().is_some());
    /// # Ok(())
    /// # }
    /// ```
    pub async fn run<'a, T, V, F, Fut>(
        &self,
        items: &'a [T],
        batch_size: usize,
        worker: F,
    ) -> Result<Vec<TaskResult<V>>>
    where
        F: Fn(&'a T) -> Fut,
        Fut: Future<Output = std::result::Result<V, TaskFailure>>,
    {
        self.run_with_progress(items, batch_size, worker, self.progress.as_ref())
            .await
    }

    /// [`run`](Self::run) with an explicit progress sink instead of the configured one
    pub(crate) async fn run_with_progress<'a, T, V, F, Fut>(
        &self,
        items: &'a [T],
        batch_size: usize,
        worker: F,
        sink: &dyn ProgressSink,
    ) -> Result<Vec<TaskResult<V>>>
    where
        F: Fn(&'a T) -> Fut,
        Fut: Future<Output = std::result::Result<V, TaskFailure>>,
    {
        let mut run = RunState::start(self.name, items.len(), batch_size, sink)?;

        for (batch_index, batch) in items.chunks(batch_size).enumerate() {
            if self.cancel.is_cancelled() {
                break;
            }

            let offset = batch_index * batch_size;
            let dispatched = batch
                .iter()
                .enumerate()
                .map(|(i, item)| self.dispatch(offset + i, item, &worker));
            let batch_results = join_all(dispatched).await;

            run.finish_batch(batch_index, batch_results);
            // Batch boundary: let tokens watched by the caller take effect
            tokio::task::yield_now().await;
        }

        Ok(run.finish(self.cancel.is_cancelled()))
    }

    /// Run a synchronous, CPU-bound `worker` on the blocking thread pool
    ///
    /// Same batching, ordering, progress and cancellation contract as
    /// [`run`](Self::run). Items are moved into the worker. A worker that is
    /// already running when the run is cancelled keeps its permit until it
    /// returns, so the concurrency bound holds even for abandoned work.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if `batch_size` is zero.
    pub async fn run_blocking<T, V, F>(
        &self,
        items: Vec<T>,
        batch_size: usize,
        worker: F,
    ) -> Result<Vec<TaskResult<V>>>
    where
        T: Send + 'static,
        V: Send + 'static,
        F: Fn(T) -> std::result::Result<V, TaskFailure> + Send + Sync + 'static,
    {
        self.run_blocking_with_progress(items, batch_size, worker, self.progress.as_ref())
            .await
    }

    /// [`run_blocking`](Self::run_blocking) with an explicit progress sink
    pub(crate) async fn run_blocking_with_progress<T, V, F>(
        &self,
        items: Vec<T>,
        batch_size: usize,
        worker: F,
        sink: &dyn ProgressSink,
    ) -> Result<Vec<TaskResult<V>>>
    where
        T: Send + 'static,
        V: Send + 'static,
        F: Fn(T) -> std::result::Result<V, TaskFailure> + Send + Sync + 'static,
    {
        let mut run = RunState::start(self.name, items.len(), batch_size, sink)?;
        let worker = Arc::new(worker);
        let mut pending = items.into_iter().enumerate();

        for batch_index in 0.. {
            let batch: Vec<(usize, T)> = pending.by_ref().take(batch_size).collect();
            if batch.is_empty() || self.cancel.is_cancelled() {
                break;
            }

            let dispatched = batch
                .into_iter()
                .map(|(index, item)| self.dispatch_blocking(index, item, Arc::clone(&worker)));
            let batch_results = join_all(dispatched).await;

            run.finish_batch(batch_index, batch_results);
            // Batch boundary: let tokens watched by the caller take effect
            tokio::task::yield_now().await;
        }

        Ok(run.finish(self.cancel.is_cancelled()))
    }

    /// Acquire a permit, run one worker, and classify its outcome
    async fn dispatch<'a, T, V, F, Fut>(
        &self,
        index: usize,
        item: &'a T,
        worker: &F,
    ) -> TaskResult<V>
    where
        F: Fn(&'a T) -> Fut,
        Fut: Future<Output = std::result::Result<V, TaskFailure>>,
    {
        let Some(_permit) = self.limiter.acquire_cancellable(&self.cancel).await else {
            return TaskResult::cancelled(index);
        };

        // Calling the worker inside the guarded future also catches panics raised
        // before its first await point.
        let work = AssertUnwindSafe(async { worker(item).await }).catch_unwind();
        let outcome = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {
                tracing::debug!(
                    coordinator = self.name,
                    index,
                    "In-flight item aborted by cancellation"
                );
                return TaskResult::failed(index, TaskFailure::cancelled());
            }
            outcome = work => outcome,
        };

        match outcome {
            Ok(Ok(value)) => TaskResult::succeeded(index, value),
            Ok(Err(failure)) => {
                tracing::warn!(
                    coordinator = self.name,
                    index,
                    kind = %failure.kind,
                    error = %failure.reason,
                    "Work item failed"
                );
                TaskResult::failed(index, failure)
            }
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                tracing::error!(
                    coordinator = self.name,
                    index,
                    panic = %message,
                    "Worker panicked"
                );
                let failure = TaskFailure::permanent(format!("worker panicked: {message}"));
                TaskResult::failed(index, failure)
            }
        }
    }

    async fn dispatch_blocking<T, V, F>(
        &self,
        index: usize,
        item: T,
        worker: Arc<F>,
    ) -> TaskResult<V>
    where
        T: Send + 'static,
        V: Send + 'static,
        F: Fn(T) -> std::result::Result<V, TaskFailure> + Send + Sync + 'static,
    {
        let Some(permit) = self.limiter.acquire_cancellable(&self.cancel).await else {
            return TaskResult::cancelled(index);
        };

        let handle = tokio::task::spawn_blocking(move || {
            let _permit: Permit = permit;
            worker(item)
        });

        let joined = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {
                tracing::debug!(
                    coordinator = self.name,
                    index,
                    "Blocking item abandoned by cancellation"
                );
                return TaskResult::failed(index, TaskFailure::cancelled());
            }
            joined = handle => joined,
        };

        match joined {
            Ok(Ok(value)) => TaskResult::succeeded(index, value),
            Ok(Err(failure)) => {
                tracing::warn!(
                    coordinator = self.name,
                    index,
                    kind = %failure.kind,
                    error = %failure.reason,
                    "Work item failed"
                );
                TaskResult::failed(index, failure)
            }
            Err(e) => {
                tracing::error!(
                    coordinator = self.name,
                    index,
                    error = %e,
                    "Blocking worker panicked"
                );
                TaskResult::failed(index, TaskFailure::permanent(format!("worker panicked: {e}")))
            }
        }
    }
}

/// Bookkeeping for one run: ordered results, cumulative progress, final logging
struct RunState<'s, V> {
    name: &'static str,
    total: usize,
    completed: usize,
    results: Vec<TaskResult<V>>,
    sink: &'s dyn ProgressSink,
}

impl<'s, V> RunState<'s, V> {
    fn start(
        name: &'static str,
        total: usize,
        batch_size: usize,
        sink: &'s dyn ProgressSink,
    ) -> Result<Self> {
        if batch_size == 0 {
            return Err(Error::config("batch_size", "batch_size must be at least 1"));
        }
        tracing::info!(
            coordinator = name,
            total,
            batch_size,
            batches = total.div_ceil(batch_size),
            "Starting batch run"
        );
        Ok(Self {
            name,
            total,
            completed: 0,
            results: Vec::with_capacity(total),
            sink,
        })
    }

    /// Record a finished batch (results already in item order) and report progress
    fn finish_batch(&mut self, batch_index: usize, batch_results: Vec<TaskResult<V>>) {
        let finished = batch_results.iter().filter(|r| reached_worker_outcome(r)).count();
        self.completed += finished;
        self.results.extend(batch_results);

        tracing::debug!(
            coordinator = self.name,
            batch = batch_index + 1,
            completed = self.completed,
            total = self.total,
            "Batch finished"
        );
        self.sink.on_progress(self.completed, self.total);
    }

    /// Mark undispatched items as cancelled and return the ordered results
    fn finish(mut self, cancelled: bool) -> Vec<TaskResult<V>> {
        let dispatched = self.results.len();
        self.results
            .extend((dispatched..self.total).map(TaskResult::cancelled));

        let summary = RunSummary::from_results(&self.results);
        if cancelled {
            tracing::info!(
                coordinator = self.name,
                completed = self.completed,
                total = self.total,
                cancelled = summary.cancelled,
                "Batch run cancelled"
            );
        } else {
            tracing::info!(
                coordinator = self.name,
                total = summary.total,
                succeeded = summary.succeeded,
                failed = summary.failed(),
                "Batch run finished"
            );
        }
        self.results
    }
}

/// Whether an item ran to a worker outcome (success or non-cancellation failure)
fn reached_worker_outcome<V>(result: &TaskResult<V>) -> bool {
    match &result.outcome {
        TaskOutcome::Succeeded(_) => true,
        TaskOutcome::Failed(failure) => !failure.is_cancelled(),
        TaskOutcome::Cancelled => false,
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
