//! Queue configuration.

use serde::{Deserialize, Serialize};
use std::num::NonZeroUsize;
use std::time::Duration;

const DEFAULT_CONCURRENCY: NonZeroUsize = NonZeroUsize::MIN.saturating_add(4);

/// What happens to tasks waiting on a dependency that failed or was cancelled.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DependencyFailurePolicy {
    /// Fail every dependent, transitively, with `TaskError::DependencyFailed`
    #[default]
    Cascade,
    /// Leave dependents waiting until they are cancelled
    Stall,
}

/// Configuration for a [`TaskQueue`](crate::TaskQueue).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Max tasks running at once
    pub concurrency: NonZeroUsize,
    /// Timeout applied to tasks that do not set their own (None = unbounded)
    pub default_timeout_ms: Option<u64>,
    /// Handling of dependents whose dependency did not complete
    pub dependency_failure: DependencyFailurePolicy,
    /// Buffer size of the broadcast event channel
    pub event_capacity: usize,
    /// How many failed or cancelled ids `Cascade` remembers for tasks
    /// enqueued later (0 = none)
    pub failure_memory: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
            default_timeout_ms: None,
            dependency_failure: DependencyFailurePolicy::Cascade,
            event_capacity: 256,
            failure_memory: 1024,
        }
    }
}

impl QueueConfig {
    /// Create a config with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set max concurrent tasks.
    pub fn with_concurrency(mut self, concurrency: NonZeroUsize) -> Self {
        self.concurrency = concurrency;
        self
    }

    /// Set the default timeout.
    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    /// Set the dependency failure policy.
    pub fn with_dependency_failure(mut self, policy: DependencyFailurePolicy) -> Self {
        self.dependency_failure = policy;
        self
    }

    /// Set the event channel capacity.
    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }

    /// Set how many failed ids are remembered for late dependents.
    pub fn with_failure_memory(mut self, capacity: usize) -> Self {
        self.failure_memory = capacity;
        self
    }

    /// Default timeout as a duration.
    pub fn default_timeout(&self) -> Option<Duration> {
        self.default_timeout_ms.map(Duration::from_millis)
    }
}
