//! Queue lifecycle events.

use crate::id::TaskId;
use crate::task::TaskStatus;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Something that happened to the queue or one of its tasks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum QueueEvent {
    /// A task was registered
    TaskAdded {
        /// Task identifier
        id: TaskId,
        /// Status right after registration (waiting or pending)
        status: TaskStatus,
    },
    /// A task was handed to the executor
    TaskStarted {
        /// Task identifier
        id: TaskId,
    },
    /// A task finished successfully
    TaskCompleted {
        /// Task identifier
        id: TaskId,
        /// Time spent running
        duration: Duration,
    },
    /// A task finished with an error
    TaskFailed {
        /// Task identifier
        id: TaskId,
        /// Rendered error
        error: String,
    },
    /// A task was cancelled
    TaskCancelled {
        /// Task identifier
        id: TaskId,
    },
    /// The last registered task left the queue
    QueueEmpty,
    /// The queue stopped starting new tasks
    QueuePaused,
    /// The queue started new tasks again
    QueueResumed,
}

/// Discriminant of a [`QueueEvent`], used to subscribe to one kind only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// See [`QueueEvent::TaskAdded`]
    TaskAdded,
    /// See [`QueueEvent::TaskStarted`]
    TaskStarted,
    /// See [`QueueEvent::TaskCompleted`]
    TaskCompleted,
    /// See [`QueueEvent::TaskFailed`]
    TaskFailed,
    /// See [`QueueEvent::TaskCancelled`]
    TaskCancelled,
    /// See [`QueueEvent::QueueEmpty`]
    QueueEmpty,
    /// See [`QueueEvent::QueuePaused`]
    QueuePaused,
    /// See [`QueueEvent::QueueResumed`]
    QueueResumed,
}

impl QueueEvent {
    /// Kind of this event.
    pub fn kind(&self) -> EventKind {
        match self {
            QueueEvent::TaskAdded { .. } => EventKind::TaskAdded,
            QueueEvent::TaskStarted { .. } => EventKind::TaskStarted,
            QueueEvent::TaskCompleted { .. } => EventKind::TaskCompleted,
            QueueEvent::TaskFailed { .. } => EventKind::TaskFailed,
            QueueEvent::TaskCancelled { .. } => EventKind::TaskCancelled,
            QueueEvent::QueueEmpty => EventKind::QueueEmpty,
            QueueEvent::QueuePaused => EventKind::QueuePaused,
            QueueEvent::QueueResumed => EventKind::QueueResumed,
        }
    }

    /// Task this event refers to, if any.
    pub fn task_id(&self) -> Option<&TaskId> {
        match self {
            QueueEvent::TaskAdded { id, .. }
            | QueueEvent::TaskStarted { id }
            | QueueEvent::TaskCompleted { id, .. }
            | QueueEvent::TaskFailed { id, .. }
            | QueueEvent::TaskCancelled { id } => Some(id),
            QueueEvent::QueueEmpty | QueueEvent::QueuePaused | QueueEvent::QueueResumed => None,
        }
    }
}
