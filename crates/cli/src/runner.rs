//! Drives a plan through a task queue and collects the outcome.

use crate::plan::{Plan, PlanIssue};
use anyhow::Result;
use conductor_core::{EventKind, QueueEvent, QueueStats, TaskId, TaskStatus};
use conductor_execution::{TaskError, TaskQueue};
use serde::Serialize;
use serde_json::Value;
use std::num::NonZeroUsize;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{info, warn};

/// Result of one task.
#[derive(Debug, Clone, Serialize)]
pub struct TaskOutcome {
    /// Task identifier
    pub id: TaskId,
    /// Completed, failed or cancelled
    pub status: TaskStatus,
    /// Output on success
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    /// Rendered error on failure
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TaskOutcome {
    fn new(id: TaskId, result: Result<Value, TaskError>) -> Self {
        match result {
            Ok(output) => Self {
                id,
                status: TaskStatus::Completed,
                output: Some(output),
                error: None,
            },
            Err(err) => Self {
                id,
                status: if err.is_cancelled() {
                    TaskStatus::Cancelled
                } else {
                    TaskStatus::Failed
                },
                output: None,
                error: Some(err.to_string()),
            },
        }
    }
}

/// Result of one plan.
#[derive(Debug, Clone, Serialize)]
pub struct PlanReport {
    /// Plan name
    pub plan: String,
    /// Per-task results, in plan order
    pub tasks: Vec<TaskOutcome>,
    /// Final queue statistics
    pub stats: QueueStats,
    /// Wall time in milliseconds
    pub elapsed_ms: u64,
}

impl PlanReport {
    /// Tasks that did not complete.
    pub fn unfinished(&self) -> usize {
        self.tasks
            .iter()
            .filter(|t| t.status != TaskStatus::Completed)
            .count()
    }
}

/// Run every task of `plan` and wait for all of them to settle.
pub async fn execute(plan: &Plan, concurrency: Option<NonZeroUsize>) -> Result<PlanReport> {
    for issue in plan.validate() {
        match issue {
            PlanIssue::DanglingDependency { .. } => warn!("{}: {}", plan.display_name(), issue),
            _ => anyhow::bail!("{}: {}", plan.display_name(), issue),
        }
    }

    let mut config = plan.config.clone();
    if let Some(concurrency) = concurrency {
        config = config.with_concurrency(concurrency);
    }

    let queue = TaskQueue::new(config);
    cancel_when_stalled(&queue);

    let name = plan.display_name().to_string();
    queue.on(EventKind::TaskFailed, move |event| {
        if let QueueEvent::TaskFailed { id, error } = event {
            warn!("[{}] task {} failed: {}", name, id, error);
        }
    });

    info!(
        "Running plan {} ({} tasks, concurrency {})",
        plan.display_name(),
        plan.tasks.len(),
        queue.config().concurrency
    );

    let started = Instant::now();
    let handles = queue.enqueue_all(plan.definitions())?;

    let mut tasks = Vec::with_capacity(handles.len());
    for handle in handles {
        let id = handle.id().clone();
        tasks.push(TaskOutcome::new(id, handle.await));
    }

    let report = PlanReport {
        plan: plan.display_name().to_string(),
        tasks,
        stats: queue.stats(),
        elapsed_ms: started.elapsed().as_millis() as u64,
    };
    info!(
        "Plan {} finished in {}ms ({} unfinished)",
        report.plan,
        report.elapsed_ms,
        report.unfinished()
    );
    Ok(report)
}

/// Cancel waiting tasks once nothing is running or ready, so a plan whose
/// queue stalls on a failed dependency still terminates.
fn cancel_when_stalled(queue: &TaskQueue) {
    let weak = queue.downgrade();
    let check = move |_: &QueueEvent| {
        let Some(queue) = weak.upgrade() else {
            return;
        };
        let stats = queue.stats();
        if stats.running == 0 && stats.pending == 0 && stats.waiting > 0 {
            warn!("{} tasks can never run, cancelling them", stats.waiting);
            queue.clear();
        }
    };

    let check = Arc::new(check);
    for kind in [EventKind::TaskCompleted, EventKind::TaskFailed, EventKind::TaskCancelled] {
        let check = Arc::clone(&check);
        queue.on(kind, move |event| (*check)(event));
    }
}
