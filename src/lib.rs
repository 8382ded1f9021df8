//! # inspector-engine
//!
//! Bounded concurrent batch-processing engine for the Telegram group inspector.
//!
//! The inspector enumerates groups, fetches message pages and downloads media
//! through a client library it does not control. This crate is the part in the
//! middle: it runs large ordered collections of work items through
//! concurrency-limited workers, spaces outbound calls to respect the service's
//! rate limit, and memoizes expensive lookups for a bounded time.
//!
//! ## Design Philosophy
//!
//! - **Ordered results** - one result per item, in input order, whatever the completion order
//! - **Isolated failures** - a failing or panicking worker never aborts its siblings
//! - **Explicit composition** - limiters, rate limiter and caches are plain values shared via `Arc`, no globals
//! - **Cancellable everywhere** - every wait observes the engine's cancellation signal
//!
//! ## Quick Start
//!
//! ```no_run
//! use inspector_engine::{Engine, EngineConfig, Event, TaskFailure};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let engine = Engine::new(EngineConfig::default())?;
//!
//!     // Subscribe to events
//!     let mut events = engine.subscribe();
//!     tokio::spawn(async move {
//!         while let Ok(event) = events.recv().await {
//!             if let Event::Progress { completed, total, .. } = event {
//!                 println!("analyzed {completed}/{total}");
//!             }
//!         }
//!     });
//!
//!     let messages = vec!["hello".to_string(), "https://t.me/rustlang".to_string()];
//!     let results = engine
//!         .run_batch(
//!             &messages,
//!             |text: &String| {
//!                 let has_link = text.contains("t.me/");
//!                 async move { Ok::<_, TaskFailure>(has_link) }
//!             },
//!             None,
//!         )
//!         .await?;
//!
//!     for result in &results {
//!         println!("{}: {:?}", result.index, result.outcome);
//!     }
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]

/// Batch partitioning and bounded dispatch
pub mod batch;
/// Time-bounded memoization with single-flight computation
pub mod cache;
/// Configuration types
pub mod config;
/// Concurrent downloads with retry
pub mod download;
/// Engine facade and run lifecycle
pub mod engine;
/// Error types
pub mod error;
/// Counting-semaphore concurrency limiter
pub mod limiter;
/// Rate-limited cached calls
pub mod pipeline;
/// Progress reporting
pub mod progress;
/// Minimum spacing between outbound calls
pub mod rate_limiter;
/// Retry logic with exponential backoff
pub mod retry;
/// Core types and events
pub mod types;

// Re-export commonly used types
pub use batch::BatchCoordinator;
pub use cache::{TtlCache, cache_key};
pub use config::{EngineConfig, RetryConfig};
pub use download::DownloadCoordinator;
pub use engine::Engine;
pub use error::{Error, FailureKind, Result, TaskFailure};
pub use limiter::{ConcurrencyLimiter, Permit};
pub use pipeline::ThrottledCache;
pub use progress::{EventProgress, NoProgress, ProgressSink};
pub use rate_limiter::RateLimiter;
pub use retry::{IsRetryable, retry_with_backoff};
pub use types::{Event, Progress, RunId, RunSummary, TaskOutcome, TaskResult, TaskState};

/// Helper function to run the engine with graceful signal handling.
///
/// Waits for a termination signal and then calls the engine's `shutdown()` method,
/// which cancels in-flight runs and rejects new ones.
///
/// Listens for Ctrl+C everywhere and for SIGTERM on Unix. A handler that cannot be
/// registered is logged and never fires.
///
/// # Example
///
/// ```no_run
/// use inspector_engine::{Engine, EngineConfig, run_with_shutdown};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let engine = Engine::new(EngineConfig::default())?;
///
///     // Shut down on Ctrl+C while the runs below proceed
///     tokio::spawn(run_with_shutdown(engine.clone()));
///
///     Ok(())
/// }
/// ```
pub async fn run_with_shutdown(engine: Engine) {
    wait_for_signal().await;
    engine.shutdown().await
}

/// Resolve on Ctrl+C or, on Unix, SIGTERM
async fn wait_for_signal() {
    let interrupt = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "Ctrl+C handler unavailable");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "SIGTERM handler unavailable");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = interrupt => tracing::info!("Received Ctrl+C, shutting down"),
        _ = terminate => tracing::info!("Received SIGTERM, shutting down"),
    }
}
