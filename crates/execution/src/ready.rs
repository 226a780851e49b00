//! Ready set - tasks eligible to start, in start order.

use conductor_core::{Priority, TaskId};
use std::cmp::Reverse;
use std::collections::BTreeSet;

/// Ordering key: priority (descending), then arrival sequence (ascending).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct ReadyKey {
    priority: Reverse<Priority>,
    seq: u64,
    id: TaskId,
}

/// Priority-ordered collection of tasks ready to run.
///
/// Equal priorities keep arrival order through the explicit sequence number,
/// so the tie-break never depends on sort stability.
#[derive(Debug, Default)]
pub(crate) struct ReadySet {
    entries: BTreeSet<ReadyKey>,
}

impl ReadySet {
    /// Admit a task.
    pub fn insert(&mut self, id: TaskId, priority: Priority, seq: u64) {
        self.entries.insert(ReadyKey {
            priority: Reverse(priority),
            seq,
            id,
        });
    }

    /// Take the task that should start next.
    pub fn pop(&mut self) -> Option<TaskId> {
        self.entries.pop_first().map(|key| key.id)
    }

    /// Remove a task admitted with the given priority and sequence.
    pub fn remove(&mut self, id: &TaskId, priority: Priority, seq: u64) -> bool {
        self.entries.remove(&ReadyKey {
            priority: Reverse(priority),
            seq,
            id: id.clone(),
        })
    }

    /// Task ids in start order.
    #[cfg(test)]
    pub fn ids(&self) -> impl Iterator<Item = &TaskId> {
        self.entries.iter().map(|key| &key.id)
    }

    /// Remove every task, returning ids in start order.
    pub fn take_all(&mut self) -> Vec<TaskId> {
        std::mem::take(&mut self.entries)
            .into_iter()
            .map(|key| key.id)
            .collect()
    }

    /// Number of ready tasks.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no task is ready.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
