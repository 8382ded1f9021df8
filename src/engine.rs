//! The engine facade: one configuration, shared limiters, run lifecycle and events

use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::batch::BatchCoordinator;
use crate::cache::TtlCache;
use crate::config::EngineConfig;
use crate::download::DownloadCoordinator;
use crate::error::{Error, Result, TaskFailure};
use crate::limiter::ConcurrencyLimiter;
use crate::pipeline::ThrottledCache;
use crate::progress::{EventProgress, NoProgress, ProgressSink, Tee};
use crate::rate_limiter::RateLimiter;
use crate::types::{Event, RunId, RunSummary, TaskResult};

/// How long [`Engine::shutdown`] waits for in-flight runs to return
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Capacity of the event broadcast channel
const EVENT_CHANNEL_CAPACITY: usize = 1000;

/// Main engine instance (cloneable - all fields are Arc-wrapped)
///
/// Clones share limiters, rate limiter, cancellation signal, event channel and
/// lifecycle state, so a clone handed to another task observes the same shutdown.
#[derive(Clone)]
pub struct Engine {
    /// Configuration (wrapped in Arc for sharing across tasks)
    config: Arc<EngineConfig>,
    /// Bounds analysis workers across every concurrent `run_batch`
    analysis_limiter: Arc<ConcurrencyLimiter>,
    /// Bounds downloads across every concurrent `run_downloads` without a per-call ceiling
    download_limiter: Arc<ConcurrencyLimiter>,
    /// Spaces external calls made through `throttled_cache`
    rate_limiter: Arc<RateLimiter>,
    /// Root cancellation signal for every run issued through this engine
    cancel: CancellationToken,
    /// Event broadcast channel sender (multiple subscribers supported)
    event_tx: broadcast::Sender<Event>,
    /// Optional caller-supplied progress sink, fed alongside the event channel
    progress: Option<Arc<dyn ProgressSink>>,
    /// Flag to indicate whether new runs are accepted (set to false during shutdown)
    accepting_new: Arc<AtomicBool>,
    /// Runs currently executing
    active_runs: Arc<AtomicUsize>,
    /// Next run identifier
    next_run_id: Arc<AtomicU64>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("config", &self.config)
            .field("analysis_limiter", &self.analysis_limiter)
            .field("download_limiter", &self.download_limiter)
            .field("rate_limiter", &self.rate_limiter)
            .field("accepting_new", &self.accepting_new.load(Ordering::SeqCst))
            .field("active_runs", &self.active_runs.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl Engine {
    /// Create an engine from a validated configuration
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the configuration fails [`EngineConfig::validate`].
    ///
    /// # Example
    ///
    /// ```
    /// use inspector_engine::{Engine, EngineConfig, TaskFailure};
    ///
    /// # #[tokio::main(flavor = "current_thread")]
    /// # async fn main() -> inspector_engine::Result<()> {
    /// let engine = Engine::new(EngineConfig::default())?;
    /// let messages: Vec<String> = (0..250).map(|i| format!("message {i}")).collect();
    ///
    /// let results = engine
    ///     .run_batch(
    ///         &messages,
    ///         |text: &String| {
    ///             let words = text.split_whitespace().count();
    ///             async move { Ok::<_, TaskFailure>(words) }
    ///         },
    ///         None,
    ///     )
    ///     .await?;
    /// assert_eq!(results.len(), 250);
    /// # Ok(())
    /// # }
    /// ```
    pub fn new(config: EngineConfig) -> Result<Self> {
        config.validate()?;

        let (event_tx, _rx) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        tracing::info!(
            batch_size = config.batch_size,
            max_concurrent_tasks = config.max_concurrent_tasks,
            max_concurrent_downloads = config.max_concurrent_downloads,
            rate_limit_delay_ms = config.rate_limit_delay.as_millis(),
            cache_ttl_secs = config.cache_ttl.as_secs(),
            "Engine initialized"
        );

        Ok(Self {
            analysis_limiter: Arc::new(ConcurrencyLimiter::new(config.max_concurrent_tasks)),
            download_limiter: Arc::new(ConcurrencyLimiter::new(config.max_concurrent_downloads)),
            rate_limiter: Arc::new(RateLimiter::new(config.rate_limit_delay)),
            config: Arc::new(config),
            cancel: CancellationToken::new(),
            event_tx,
            progress: None,
            accepting_new: Arc::new(AtomicBool::new(true)),
            active_runs: Arc::new(AtomicUsize::new(0)),
            next_run_id: Arc::new(AtomicU64::new(1)),
        })
    }

    /// Feed every run's progress to `sink` in addition to the event channel
    #[must_use]
    pub fn with_progress(mut self, sink: Arc<dyn ProgressSink>) -> Self {
        self.progress = Some(sink);
        self
    }

    /// Run `worker` over `items` in batches through the analysis limiter
    ///
    /// `batch_size` defaults to the configured one. Results come back in input
    /// order, one per item; item failures are data, not errors.
    ///
    /// # Errors
    ///
    /// - [`Error::ShuttingDown`] after [`shutdown`](Self::shutdown)
    /// - [`Error::Config`] if `batch_size` is `Some(0)`
    pub async fn run_batch<'a, T, V, F, Fut>(
        &self,
        items: &'a [T],
        worker: F,
        batch_size: Option<usize>,
    ) -> Result<Vec<TaskResult<V>>>
    where
        F: Fn(&'a T) -> Fut,
        Fut: Future<Output = std::result::Result<V, TaskFailure>>,
    {
        self.batch_run(items, worker, batch_size, None).await
    }

    /// [`run_batch`](Self::run_batch) that also stops when `cancel` fires
    ///
    /// Cancelling `cancel` stops only this run; the engine keeps accepting and
    /// completing later runs.
    ///
    /// # Errors
    ///
    /// Same as [`run_batch`](Self::run_batch).
    pub async fn run_batch_cancellable<'a, T, V, F, Fut>(
        &self,
        items: &'a [T],
        worker: F,
        batch_size: Option<usize>,
        cancel: &CancellationToken,
    ) -> Result<Vec<TaskResult<V>>>
    where
        F: Fn(&'a T) -> Fut,
        Fut: Future<Output = std::result::Result<V, TaskFailure>>,
    {
        self.batch_run(items, worker, batch_size, Some(cancel)).await
    }

    async fn batch_run<'a, T, V, F, Fut>(
        &self,
        items: &'a [T],
        worker: F,
        batch_size: Option<usize>,
        caller: Option<&CancellationToken>,
    ) -> Result<Vec<TaskResult<V>>>
    where
        F: Fn(&'a T) -> Fut,
        Fut: Future<Output = std::result::Result<V, TaskFailure>>,
    {
        self.ensure_accepting()?;
        let batch_size = self.resolve_batch_size(batch_size)?;

        let run = self.begin_run(items.len(), items.len().div_ceil(batch_size));
        let coordinator =
            BatchCoordinator::new(Arc::clone(&self.analysis_limiter), run.cancel.clone());

        let events = EventProgress::new(run.id, self.event_tx.clone());
        let sink = Tee {
            first: &events,
            second: self.user_progress(),
        };
        let work = coordinator.run_with_progress(items, batch_size, worker, &sink);
        let results = linked(&run.cancel, caller, work).await?;

        self.finish_run(run, &results);
        Ok(results)
    }

    /// Run a synchronous, CPU-bound `worker` over `items` on the blocking thread pool
    ///
    /// Same batching, ordering, ceiling and events as [`run_batch`](Self::run_batch);
    /// items are moved into the worker.
    ///
    /// # Errors
    ///
    /// - [`Error::ShuttingDown`] after [`shutdown`](Self::shutdown)
    /// - [`Error::Config`] if `batch_size` is `Some(0)`
    pub async fn run_blocking<T, V, F>(
        &self,
        items: Vec<T>,
        worker: F,
        batch_size: Option<usize>,
    ) -> Result<Vec<TaskResult<V>>>
    where
        T: Send + 'static,
        V: Send + 'static,
        F: Fn(T) -> std::result::Result<V, TaskFailure> + Send + Sync + 'static,
    {
        self.blocking_run(items, worker, batch_size, None).await
    }

    /// [`run_blocking`](Self::run_blocking) that also stops when `cancel` fires
    ///
    /// # Errors
    ///
    /// Same as [`run_blocking`](Self::run_blocking).
    pub async fn run_blocking_cancellable<T, V, F>(
        &self,
        items: Vec<T>,
        worker: F,
        batch_size: Option<usize>,
        cancel: &CancellationToken,
    ) -> Result<Vec<TaskResult<V>>>
    where
        T: Send + 'static,
        V: Send + 'static,
        F: Fn(T) -> std::result::Result<V, TaskFailure> + Send + Sync + 'static,
    {
        self.blocking_run(items, worker, batch_size, Some(cancel)).await
    }

    async fn blocking_run<T, V, F>(
        &self,
        items: Vec<T>,
        worker: F,
        batch_size: Option<usize>,
        caller: Option<&CancellationToken>,
    ) -> Result<Vec<TaskResult<V>>>
    where
        T: Send + 'static,
        V: Send + 'static,
        F: Fn(T) -> std::result::Result<V, TaskFailure> + Send + Sync + 'static,
    {
        self.ensure_accepting()?;
        let batch_size = self.resolve_batch_size(batch_size)?;

        let run = self.begin_run(items.len(), items.len().div_ceil(batch_size));
        let coordinator =
            BatchCoordinator::new(Arc::clone(&self.analysis_limiter), run.cancel.clone())
                .with_name("blocking");

        let events = EventProgress::new(run.id, self.event_tx.clone());
        let sink = Tee {
            first: &events,
            second: self.user_progress(),
        };
        let work = coordinator.run_blocking_with_progress(items, batch_size, worker, &sink);
        let results = linked(&run.cancel, caller, work).await?;

        self.finish_run(run, &results);
        Ok(results)
    }

    /// Download `items` concurrently with retry
    ///
    /// `None` shares the engine's download limiter with every other download run;
    /// `Some(n)` gives this call a dedicated ceiling of `n`.
    ///
    /// # Errors
    ///
    /// - [`Error::ShuttingDown`] after [`shutdown`](Self::shutdown)
    /// - [`Error::Config`] if `max_concurrent` is `Some(0)` or exceeds
    ///   `max_concurrent_tasks`
    pub async fn run_downloads<'a, T, V, F, Fut>(
        &self,
        items: &'a [T],
        download: F,
        max_concurrent: Option<usize>,
    ) -> Result<Vec<TaskResult<V>>>
    where
        F: Fn(&'a T) -> Fut,
        Fut: Future<Output = std::result::Result<V, TaskFailure>>,
    {
        self.download_run(items, download, max_concurrent, None).await
    }

    /// [`run_downloads`](Self::run_downloads) that also stops when `cancel` fires
    ///
    /// Retry backoff sleeps are cut short as well.
    ///
    /// # Errors
    ///
    /// Same as [`run_downloads`](Self::run_downloads).
    pub async fn run_downloads_cancellable<'a, T, V, F, Fut>(
        &self,
        items: &'a [T],
        download: F,
        max_concurrent: Option<usize>,
        cancel: &CancellationToken,
    ) -> Result<Vec<TaskResult<V>>>
    where
        F: Fn(&'a T) -> Fut,
        Fut: Future<Output = std::result::Result<V, TaskFailure>>,
    {
        self.download_run(items, download, max_concurrent, Some(cancel)).await
    }

    async fn download_run<'a, T, V, F, Fut>(
        &self,
        items: &'a [T],
        download: F,
        max_concurrent: Option<usize>,
        caller: Option<&CancellationToken>,
    ) -> Result<Vec<TaskResult<V>>>
    where
        F: Fn(&'a T) -> Fut,
        Fut: Future<Output = std::result::Result<V, TaskFailure>>,
    {
        self.ensure_accepting()?;
        let limiter = match max_concurrent {
            None => Arc::clone(&self.download_limiter),
            Some(0) => {
                return Err(Error::config(
                    "max_concurrent",
                    "max_concurrent must be at least 1",
                ));
            }
            Some(n) if n > self.config.max_concurrent_tasks => {
                return Err(Error::config(
                    "max_concurrent",
                    format!(
                        "max_concurrent ({n}) must not exceed max_concurrent_tasks ({})",
                        self.config.max_concurrent_tasks
                    ),
                ));
            }
            Some(n) => Arc::new(ConcurrencyLimiter::new(n)),
        };

        let batches = usize::from(!items.is_empty());
        let run = self.begin_run(items.len(), batches);
        let coordinator =
            DownloadCoordinator::new(limiter, self.config.retry.clone(), run.cancel.clone());

        let events = EventProgress::new(run.id, self.event_tx.clone());
        let sink = Tee {
            first: &events,
            second: self.user_progress(),
        };
        let work = coordinator.run_with_progress(items, download, Some(&sink));
        let results = linked(&run.cancel, caller, work).await?;

        self.finish_run(run, &results);
        Ok(results)
    }

    /// Create a cache owned by the caller, swept every `cache_ttl` until the engine is cancelled
    ///
    /// Must be called from within a tokio runtime.
    pub fn cache<K, V>(&self) -> Arc<TtlCache<K, V>>
    where
        K: Eq + Hash + Send + Sync + 'static,
        V: Clone + Send + Sync + 'static,
    {
        let cache = Arc::new(TtlCache::new());
        cache.spawn_sweeper(self.config.cache_ttl, self.cancel.clone());
        cache
    }

    /// Create a cache whose misses are spaced by the engine's shared rate limiter
    ///
    /// Entries live for `cache_ttl`. Must be called from within a tokio runtime.
    pub fn throttled_cache<V>(&self) -> ThrottledCache<V>
    where
        V: Clone + Send + Sync + 'static,
    {
        ThrottledCache::new(
            Arc::clone(&self.rate_limiter),
            self.cache(),
            self.config.cache_ttl,
        )
    }

    /// The rate limiter shared by every throttled call issued through this engine
    pub fn rate_limiter(&self) -> Arc<RateLimiter> {
        Arc::clone(&self.rate_limiter)
    }

    /// The root cancellation signal; cancelling it stops every run of this engine
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Subscribe to run events
    ///
    /// Multiple subscribers are supported; a subscriber that falls more than the
    /// channel capacity behind misses the oldest events.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.event_tx.subscribe()
    }

    /// Get the current configuration
    pub fn config(&self) -> Arc<EngineConfig> {
        Arc::clone(&self.config)
    }

    /// Raise the cancellation signal for every run of this engine
    ///
    /// In-flight runs return promptly with the results produced so far. The signal
    /// is engine-wide and permanent: later runs return immediately with every item
    /// cancelled. To stop a single run, pass a token to one of the `*_cancellable`
    /// run methods and cancel that instead.
    pub fn cancel(&self) {
        tracing::info!("Cancelling all runs");
        self.cancel.cancel();
    }

    /// Whether new runs are still accepted
    pub fn is_accepting(&self) -> bool {
        self.accepting_new.load(Ordering::SeqCst)
    }

    /// Gracefully shut down the engine
    ///
    /// 1. Stops accepting new runs (they fail with [`Error::ShuttingDown`])
    /// 2. Cancels in-flight runs
    /// 3. Waits for them to return, up to 30 seconds
    /// 4. Emits [`Event::Shutdown`]
    pub async fn shutdown(&self) {
        tracing::info!("Initiating graceful shutdown");

        self.accepting_new.store(false, Ordering::SeqCst);
        tracing::info!("Stopped accepting new runs");

        self.cancel.cancel();

        match tokio::time::timeout(SHUTDOWN_TIMEOUT, self.wait_for_active_runs()).await {
            Ok(()) => tracing::info!("All active runs completed"),
            Err(_) => tracing::warn!(
                active_runs = self.active_runs.load(Ordering::SeqCst),
                "Timeout waiting for runs to complete, proceeding with shutdown"
            ),
        }

        self.emit_event(Event::Shutdown);
        tracing::info!("Shutdown complete");
    }

    async fn wait_for_active_runs(&self) {
        loop {
            let active = self.active_runs.load(Ordering::SeqCst);
            if active == 0 {
                return;
            }
            tracing::debug!(active, "Waiting for active runs to complete");
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    fn ensure_accepting(&self) -> Result<()> {
        if self.is_accepting() {
            Ok(())
        } else {
            Err(Error::ShuttingDown)
        }
    }

    fn resolve_batch_size(&self, batch_size: Option<usize>) -> Result<usize> {
        match batch_size.unwrap_or(self.config.batch_size) {
            0 => Err(Error::config("batch_size", "batch_size must be at least 1")),
            size => Ok(size),
        }
    }

    fn user_progress(&self) -> &dyn ProgressSink {
        match &self.progress {
            Some(sink) => sink.as_ref(),
            None => &NoProgress,
        }
    }

    /// Allocate a run id, count the run as active and announce it
    fn begin_run(&self, total: usize, batches: usize) -> ActiveRun {
        let id = RunId(self.next_run_id.fetch_add(1, Ordering::SeqCst));
        self.active_runs.fetch_add(1, Ordering::SeqCst);
        tracing::debug!(run = %id, total, batches, "Run started");
        self.emit_event(Event::RunStarted {
            run: id,
            total,
            batches,
        });
        ActiveRun {
            id,
            cancel: self.cancel.child_token(),
            active_runs: Arc::clone(&self.active_runs),
        }
    }

    fn finish_run<V>(&self, run: ActiveRun, results: &[TaskResult<V>]) {
        let summary = RunSummary::from_results(results);
        if run.cancel.is_cancelled() {
            tracing::info!(
                run = %run.id,
                completed = summary.completed(),
                total = summary.total,
                "Run cancelled"
            );
            self.emit_event(Event::RunCancelled {
                run: run.id,
                completed: summary.completed(),
                total: summary.total,
            });
        } else {
            tracing::info!(
                run = %run.id,
                succeeded = summary.succeeded,
                failed = summary.failed(),
                "Run finished"
            );
            self.emit_event(Event::RunFinished {
                run: run.id,
                summary,
            });
        }
    }

    /// Emit an event to all subscribers
    ///
    /// If there are no active subscribers, the event is silently dropped.
    fn emit_event(&self, event: Event) {
        self.event_tx.send(event).ok();
    }
}

/// Marks a run as active until dropped (including when the run future is dropped)
struct ActiveRun {
    id: RunId,
    /// Child of the engine token; cancelled by the engine or by the run's caller
    cancel: CancellationToken,
    active_runs: Arc<AtomicUsize>,
}

impl Drop for ActiveRun {
    fn drop(&mut self) {
        self.active_runs.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Drive `work` to completion, cancelling `run` if the caller's token fires first
async fn linked<F: Future>(
    run: &CancellationToken,
    caller: Option<&CancellationToken>,
    work: F,
) -> F::Output {
    let Some(caller) = caller else {
        return work.await;
    };
    let mut work = std::pin::pin!(work);
    tokio::select! {
        biased;
        output = &mut work => return output,
        _ = caller.cancelled() => run.cancel(),
    }
    work.await
}
