//! Queue counters and snapshots.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Monotonically accumulated queue counters.
///
/// Counters only ever grow; a snapshot taken later never reports less than
/// one taken earlier.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueueMetrics {
    /// Tasks accepted by `enqueue`
    pub tasks_added: u64,
    /// Tasks that finished successfully
    pub tasks_completed: u64,
    /// Tasks that failed (including timeouts and failed dependencies)
    pub tasks_failed: u64,
    /// Tasks that were cancelled
    pub tasks_cancelled: u64,
    /// Sum of running time over completed tasks
    pub total_processing_time: Duration,
}

impl QueueMetrics {
    /// Record an accepted task
    pub fn record_added(&mut self) {
        self.tasks_added += 1;
    }

    /// Record a successful completion and its running time
    pub fn record_completed(&mut self, duration: Duration) {
        self.tasks_completed += 1;
        self.total_processing_time += duration;
    }

    /// Record a failure
    pub fn record_failed(&mut self) {
        self.tasks_failed += 1;
    }

    /// Record a cancellation
    pub fn record_cancelled(&mut self) {
        self.tasks_cancelled += 1;
    }

    /// Tasks that reached a final status.
    pub fn settled(&self) -> u64 {
        self.tasks_completed + self.tasks_failed + self.tasks_cancelled
    }

    /// Mean running time over completed tasks.
    pub fn average_processing_time(&self) -> Duration {
        match u32::try_from(self.tasks_completed) {
            Ok(0) => Duration::ZERO,
            Ok(n) => self.total_processing_time / n,
            Err(_) => Duration::from_secs_f64(
                self.total_processing_time.as_secs_f64() / self.tasks_completed as f64,
            ),
        }
    }
}

/// Point-in-time view of the queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueStats {
    /// Accumulated counters
    pub metrics: QueueMetrics,
    /// Tasks blocked on dependencies
    pub waiting: usize,
    /// Tasks ready but not started
    pub pending: usize,
    /// Tasks currently running
    pub running: usize,
    /// Whether the queue is paused
    pub paused: bool,
    /// Configured concurrency
    pub concurrency: usize,
}

impl QueueStats {
    /// Average running time of completed tasks.
    pub fn average_processing_time(&self) -> Duration {
        self.metrics.average_processing_time()
    }

    /// Tasks still registered with the queue.
    pub fn live(&self) -> usize {
        self.waiting + self.pending + self.running
    }
}
