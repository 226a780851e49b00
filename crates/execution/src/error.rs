//! Error types for the executor and the task queue.

use conductor_core::TaskId;
use conductor_support::TimeoutError;
use thiserror::Error;

/// Errors raised by the [`BoundedExecutor`](crate::BoundedExecutor) itself.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExecutorError {
    /// Queued work was discarded by `clear()`
    #[error("pool cleared before the work started")]
    PoolCleared,

    /// Concurrency must be at least one
    #[error("concurrency must be at least 1, got {0}")]
    InvalidConcurrency(usize),

    /// The work was dropped without producing a result (panic or runtime shutdown)
    #[error("work was abandoned before it produced a result")]
    Abandoned,
}

/// Errors delivered through a task's handle or raised by queue operations.
#[derive(Debug, Error)]
pub enum TaskError {
    /// A live task already uses this identifier
    #[error("task {0} is already registered")]
    DuplicateTask(TaskId),

    /// The task did not finish within its timeout
    #[error(transparent)]
    Timeout(#[from] TimeoutError),

    /// The work function returned an error
    #[error(transparent)]
    Failed(anyhow::Error),

    /// The task was cancelled
    #[error("task {0} was cancelled")]
    Cancelled(TaskId),

    /// A dependency failed or was cancelled, so the task can never run
    #[error("task {task} cannot run: dependency {dependency} did not complete")]
    DependencyFailed {
        /// The blocked task
        task: TaskId,
        /// The dependency that did not complete
        dependency: TaskId,
    },

    /// The work function panicked
    #[error("task {task} panicked: {message}")]
    Panicked {
        /// The task that panicked
        task: TaskId,
        /// Panic payload, when it was a string
        message: String,
    },

    /// A batch contains a dependency cycle
    #[error("dependency cycle between tasks: {}", format_ids(.0))]
    DependencyCycle(Vec<TaskId>),

    /// The task was dropped before it settled
    #[error("task {0} was dropped before it settled")]
    Abandoned(TaskId),
}

impl TaskError {
    /// Whether this is a cancellation.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, TaskError::Cancelled(_))
    }

    /// Whether this is a timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, TaskError::Timeout(_))
    }
}

fn format_ids(ids: &[TaskId]) -> String {
    ids.iter().map(TaskId::as_str).collect::<Vec<_>>().join(" -> ")
}
