//! Error types for inspector-engine
//!
//! Two layers of failure exist:
//! - [`Error`] fails a whole run. It is reserved for contract violations
//!   (bad configuration, `batch_size == 0`) and for runs submitted after shutdown.
//! - [`TaskFailure`] is the per-item outcome of a worker. It is surfaced as data in
//!   the result sequence and never aborts siblings or later batches.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias for inspector-engine operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for inspector-engine
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration or call-contract error with context about which setting is invalid
    #[error("configuration error: {message}")]
    Config {
        /// Human-readable error message describing the issue
        message: String,
        /// The configuration key that caused the error (e.g., "batch_size")
        key: Option<String>,
    },

    /// Shutdown in progress - not accepting new runs
    #[error("shutdown in progress: not accepting new runs")]
    ShuttingDown,

    /// Serialization error (config parsing, cache key derivation)
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Other error
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Build a [`Error::Config`] for the given key
    pub fn config(key: &str, message: impl Into<String>) -> Self {
        Error::Config {
            message: message.into(),
            key: Some(key.to_string()),
        }
    }
}

/// Classification of a per-item failure
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Network blip, rate-limited response, timeout. Safe to retry.
    Transient,
    /// Invalid payload, permission denied, exhausted retries. Never retried automatically.
    Permanent,
    /// The run was aborted by its cancellation signal while this item was in flight.
    Cancelled,
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureKind::Transient => write!(f, "transient"),
            FailureKind::Permanent => write!(f, "permanent"),
            FailureKind::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Failure of a single work item
///
/// Workers return this from their future; the coordinators also produce it for
/// panicking workers, exhausted retries and cancellation of in-flight items.
#[derive(Clone, Debug, Error, PartialEq, Eq, Serialize, Deserialize)]
#[error("{kind} failure: {reason}")]
pub struct TaskFailure {
    /// Failure classification
    pub kind: FailureKind,
    /// Human-readable reason
    pub reason: String,
}

impl TaskFailure {
    /// A retryable failure (network blip, rate-limited response)
    pub fn transient(reason: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Transient,
            reason: reason.into(),
        }
    }

    /// A non-retryable failure (invalid payload, permission denied)
    pub fn permanent(reason: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Permanent,
            reason: reason.into(),
        }
    }

    /// An in-flight item aborted by the run's cancellation signal
    pub fn cancelled() -> Self {
        Self {
            kind: FailureKind::Cancelled,
            reason: "run cancelled".to_string(),
        }
    }

    /// Terminal failure after a transient error survived every retry attempt
    pub fn exhausted(attempts: u32, last: &TaskFailure) -> Self {
        Self::permanent(format!(
            "gave up after {attempts} attempts: {}",
            last.reason
        ))
    }

    /// Whether the caller may retry this item
    pub fn retryable(&self) -> bool {
        self.kind == FailureKind::Transient
    }

    /// Whether this failure came from cancellation
    pub fn is_cancelled(&self) -> bool {
        self.kind == FailureKind::Cancelled
    }
}

/// Whether an I/O error kind indicates a transient network condition
pub(crate) fn is_transient_io(kind: std::io::ErrorKind) -> bool {
    use std::io::ErrorKind;
    matches!(
        kind,
        ErrorKind::TimedOut
            | ErrorKind::ConnectionRefused
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::NotConnected
            | ErrorKind::BrokenPipe
            | ErrorKind::Interrupted
            | ErrorKind::WouldBlock
    )
}

impl From<std::io::Error> for TaskFailure {
    fn from(e: std::io::Error) -> Self {
        if is_transient_io(e.kind()) {
            TaskFailure::transient(e.to_string())
        } else {
            TaskFailure::permanent(e.to_string())
        }
    }
}
