//! Conductor core data models.
//!
//! This crate defines the plain data shared by the executor, the task queue
//! and their callers: identities, priorities, task status, lifecycle events
//! and metrics snapshots. Nothing here needs a runtime.

#![warn(missing_docs)]

// Core identities
mod id;

// Task lifecycle
mod task;
mod event;

// Counters
mod metrics;

// Re-exports
pub use id::*;

pub use task::{TaskStatus, TaskSnapshot, TaskFilter};
pub use event::{QueueEvent, EventKind};
pub use metrics::{QueueMetrics, QueueStats};

/// Timestamp type
pub type Time = chrono::DateTime<chrono::Utc>;
