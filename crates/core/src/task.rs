//! Task lifecycle model.

use crate::id::{Priority, TaskId};
use crate::Time;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Task status.
///
/// ```text
/// Waiting ──► Pending ──► Running ──► Completed
///    │           │           ├──────► Failed
///    └───────────┴───────────┴──────► Cancelled
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    /// Blocked on at least one unfinished dependency
    Waiting,
    /// Ready to run, waiting for a free slot
    Pending,
    /// Currently executing
    Running,
    /// Finished successfully
    Completed,
    /// Finished with an error
    Failed,
    /// Cancelled before it could finish
    Cancelled,
}

impl TaskStatus {
    /// Whether the status is final.
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskStatus::Waiting => write!(f, "waiting"),
            TaskStatus::Pending => write!(f, "pending"),
            TaskStatus::Running => write!(f, "running"),
            TaskStatus::Completed => write!(f, "completed"),
            TaskStatus::Failed => write!(f, "failed"),
            TaskStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Read-only view of a registered task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSnapshot {
    /// Task identifier
    pub id: TaskId,
    /// Display name
    pub name: String,
    /// Current status
    pub status: TaskStatus,
    /// Scheduling priority
    pub priority: Priority,
    /// Declared dependencies
    pub dependencies: Vec<TaskId>,
    /// Dependencies still unfinished
    pub pending_dependencies: usize,
    /// Free-form tags
    pub tags: Vec<String>,
    /// Free-form metadata
    pub metadata: HashMap<String, serde_json::Value>,
    /// Enqueue timestamp
    pub created_at: Time,
    /// Start timestamp (None until running)
    pub started_at: Option<Time>,
}

/// Filter for listing tasks.
#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    /// Filter by status
    pub status: Option<TaskStatus>,
    /// Only tasks carrying this tag
    pub tag: Option<String>,
    /// Maximum results to return
    pub limit: Option<usize>,
}

impl TaskFilter {
    /// Match a single snapshot against the filter.
    pub fn matches(&self, task: &TaskSnapshot) -> bool {
        if let Some(status) = self.status {
            if task.status != status {
                return false;
            }
        }

        if let Some(tag) = &self.tag {
            if !task.tags.iter().any(|t| t == tag) {
                return false;
            }
        }

        true
    }
}
