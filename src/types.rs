//! Core types for inspector-engine

use serde::{Deserialize, Serialize};

use crate::error::{FailureKind, TaskFailure};

/// Identifier of one coordinator run, used to correlate events and log lines
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(pub u64);

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle of a work item within one run
///
/// `Pending → Dispatched → (Succeeded | Failed)`; items never dispatched
/// because the run was cancelled end in `Cancelled`. There is no transition
/// back to `Pending`.
///
/// Runs only report finished items, so [`TaskResult::state`] is always one of
/// the terminal states. `Pending` and `Dispatched` name the intermediate steps
/// for callers that track items of their own, such as a UI fed by
/// [`Event::Progress`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// Submitted, not yet holding a permit
    Pending,
    /// Holding a permit, worker running
    Dispatched,
    /// Worker returned a value
    Succeeded,
    /// Worker returned or raised a failure
    Failed,
    /// Never dispatched because the run was cancelled
    Cancelled,
}

impl TaskState {
    /// Whether no further transition can happen
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Succeeded | TaskState::Failed | TaskState::Cancelled
        )
    }
}

/// Terminal outcome of one work item
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "status", content = "value")]
pub enum TaskOutcome<V> {
    /// The worker produced a value
    Succeeded(V),
    /// The worker failed (or panicked, or was aborted while in flight)
    Failed(TaskFailure),
    /// The item was never dispatched because the run was cancelled
    Cancelled,
}

/// Outcome of one work item, tagged with the item's position in the input
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TaskResult<V> {
    /// Index of the originating item in the caller's input sequence
    pub index: usize,
    /// What happened to the item
    pub outcome: TaskOutcome<V>,
}

impl<V> TaskResult<V> {
    pub(crate) fn succeeded(index: usize, value: V) -> Self {
        Self {
            index,
            outcome: TaskOutcome::Succeeded(value),
        }
    }

    pub(crate) fn failed(index: usize, failure: TaskFailure) -> Self {
        Self {
            index,
            outcome: TaskOutcome::Failed(failure),
        }
    }

    pub(crate) fn cancelled(index: usize) -> Self {
        Self {
            index,
            outcome: TaskOutcome::Cancelled,
        }
    }

    /// Terminal state of the item
    pub fn state(&self) -> TaskState {
        match self.outcome {
            TaskOutcome::Succeeded(_) => TaskState::Succeeded,
            TaskOutcome::Failed(_) => TaskState::Failed,
            TaskOutcome::Cancelled => TaskState::Cancelled,
        }
    }

    /// Whether the worker produced a value
    pub fn is_success(&self) -> bool {
        matches!(self.outcome, TaskOutcome::Succeeded(_))
    }

    /// The produced value, if any
    pub fn value(&self) -> Option<&V> {
        match &self.outcome {
            TaskOutcome::Succeeded(v) => Some(v),
            _ => None,
        }
    }

    /// The failure, if any
    pub fn failure(&self) -> Option<&TaskFailure> {
        match &self.outcome {
            TaskOutcome::Failed(f) => Some(f),
            _ => None,
        }
    }

    /// Convert into a plain `Result`, mapping undispatched items to a cancelled failure
    pub fn into_result(self) -> Result<V, TaskFailure> {
        match self.outcome {
            TaskOutcome::Succeeded(v) => Ok(v),
            TaskOutcome::Failed(f) => Err(f),
            TaskOutcome::Cancelled => Err(TaskFailure::cancelled()),
        }
    }
}

/// Aggregate counts for a finished run
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    /// Total items submitted
    pub total: usize,
    /// Items whose worker produced a value
    pub succeeded: usize,
    /// Items that failed with a retryable failure
    pub failed_transient: usize,
    /// Items that failed permanently (including panics and exhausted retries)
    pub failed_permanent: usize,
    /// Items aborted in flight or never dispatched because of cancellation
    pub cancelled: usize,
}

impl RunSummary {
    /// Count outcomes of a result sequence
    pub fn from_results<V>(results: &[TaskResult<V>]) -> Self {
        let mut summary = RunSummary {
            total: results.len(),
            ..Default::default()
        };
        for result in results {
            match &result.outcome {
                TaskOutcome::Succeeded(_) => summary.succeeded += 1,
                TaskOutcome::Failed(f) => match f.kind {
                    FailureKind::Transient => summary.failed_transient += 1,
                    FailureKind::Permanent => summary.failed_permanent += 1,
                    FailureKind::Cancelled => summary.cancelled += 1,
                },
                TaskOutcome::Cancelled => summary.cancelled += 1,
            }
        }
        summary
    }

    /// Total failed items, transient and permanent
    pub fn failed(&self) -> usize {
        self.failed_transient + self.failed_permanent
    }

    /// Items that reached `Succeeded` or `Failed`
    pub fn completed(&self) -> usize {
        self.succeeded + self.failed()
    }
}

/// Snapshot of a run's progress
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Progress {
    /// Items finished so far (cumulative, monotonic)
    pub completed: usize,
    /// Items submitted
    pub total: usize,
}

impl Progress {
    /// Completion percentage in `0.0..=100.0` (an empty run is 100%)
    pub fn percent(&self) -> f32 {
        if self.total == 0 {
            100.0
        } else {
            (self.completed as f32 / self.total as f32) * 100.0
        }
    }
}

/// Event emitted by an [`Engine`](crate::Engine) during a run
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// A run was accepted and is about to dispatch its first batch
    RunStarted {
        /// Run identifier
        run: RunId,
        /// Items submitted
        total: usize,
        /// Number of batches the items were split into
        batches: usize,
    },
    /// A batch finished
    Progress {
        /// Run identifier
        run: RunId,
        /// Items finished so far
        completed: usize,
        /// Items submitted
        total: usize,
    },
    /// All batches finished
    RunFinished {
        /// Run identifier
        run: RunId,
        /// Outcome counts
        summary: RunSummary,
    },
    /// The run stopped early on its cancellation signal
    RunCancelled {
        /// Run identifier
        run: RunId,
        /// Items that reached a terminal worker outcome before cancellation
        completed: usize,
        /// Items submitted
        total: usize,
    },
    /// The engine finished shutting down and accepts no further runs
    Shutdown,
}
