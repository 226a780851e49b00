//! Execution layer - bounded executor and the dependency-aware task queue.

#![warn(missing_docs)]

pub mod config;
pub mod dependency;
pub mod error;
pub mod executor;
pub mod queue;
pub mod task;

mod events;
mod ready;

pub use config::{DependencyFailurePolicy, QueueConfig};
pub use dependency::topological_order;
pub use error::{ExecutorError, TaskError};
pub use executor::{BoundedExecutor, ExecutorStats};
pub use queue::{TaskQueue, WeakTaskQueue};
pub use task::{TaskContext, TaskDefinition, TaskHandle, TaskWork};
