//! Dependency tracking for queued tasks.

use conductor_core::TaskId;
use std::collections::{HashMap, VecDeque};

/// Reverse-edge map: dependency -> tasks blocked on it.
///
/// Edges are added when a task registers with unfinished dependencies and
/// removed once the dependency settles or the dependent leaves the queue.
#[derive(Debug, Default)]
pub(crate) struct DependencyGraph {
    dependents: HashMap<TaskId, Vec<TaskId>>,
}

impl DependencyGraph {
    /// Register `task` as blocked on each of `blocking`.
    pub fn register(&mut self, task: &TaskId, blocking: &[TaskId]) {
        for dependency in blocking {
            let entry = self.dependents.entry(dependency.clone()).or_default();
            if !entry.contains(task) {
                entry.push(task.clone());
            }
        }
    }

    /// Remove and return every task blocked on `dependency`.
    pub fn take_dependents(&mut self, dependency: &TaskId) -> Vec<TaskId> {
        self.dependents.remove(dependency).unwrap_or_default()
    }

    /// Tasks currently blocked on `dependency`.
    pub fn dependents_of(&self, dependency: &TaskId) -> &[TaskId] {
        self.dependents.get(dependency).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Drop `task` from the entries of its dependencies.
    pub fn detach(&mut self, task: &TaskId, dependencies: &[TaskId]) {
        for dependency in dependencies {
            if let Some(entry) = self.dependents.get_mut(dependency) {
                entry.retain(|t| t != task);
                if entry.is_empty() {
                    self.dependents.remove(dependency);
                }
            }
        }
    }

    /// Number of dependencies with at least one blocked task.
    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.dependents.len()
    }

    /// Forget every edge.
    pub fn clear(&mut self) {
        self.dependents.clear();
    }
}

/// Ids of tasks that failed or were cancelled, kept so later dependents can
/// fail at once.
///
/// Holds at most `capacity` ids and forgets the oldest first. A capacity of
/// zero remembers nothing.
#[derive(Debug, Default)]
pub(crate) struct FailureMemory {
    capacity: usize,
    stamps: HashMap<TaskId, u64>,
    order: VecDeque<(u64, TaskId)>,
    next: u64,
}

impl FailureMemory {
    /// Create a memory holding up to `capacity` ids.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            ..Self::default()
        }
    }

    /// Remember `id`, evicting the oldest id when full.
    pub fn remember(&mut self, id: TaskId) {
        if self.capacity == 0 {
            return;
        }

        let stamp = self.next;
        self.next += 1;
        self.stamps.insert(id.clone(), stamp);
        self.order.push_back((stamp, id));

        while self.stamps.len() > self.capacity {
            self.evict_oldest();
        }

        // entries superseded by `forget` or a newer stamp
        if self.order.len() > self.capacity.saturating_mul(2) {
            let stamps = &self.stamps;
            self.order.retain(|(stamp, id)| stamps.get(id) == Some(stamp));
        }
    }

    fn evict_oldest(&mut self) {
        while let Some((stamp, id)) = self.order.pop_front() {
            if self.stamps.get(&id) == Some(&stamp) {
                self.stamps.remove(&id);
                return;
            }
        }
    }

    /// Forget `id`.
    pub fn forget(&mut self, id: &TaskId) {
        self.stamps.remove(id);
    }

    /// Whether `id` is remembered.
    pub fn contains(&self, id: &TaskId) -> bool {
        self.stamps.contains_key(id)
    }

    /// Number of remembered ids.
    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.stamps.len()
    }

    /// Forget everything.
    pub fn clear(&mut self) {
        self.stamps.clear();
        self.order.clear();
    }
}

/// Order a batch so every task comes after the in-batch tasks it depends on.
///
/// Dependencies outside the batch are ignored. Tasks that are otherwise
/// unconstrained keep their input order. Returns the ids caught in a cycle
/// if no such order exists.
pub fn topological_order(nodes: &[(TaskId, Vec<TaskId>)]) -> Result<Vec<TaskId>, Vec<TaskId>> {
    let index: HashMap<&TaskId, usize> = nodes
        .iter()
        .enumerate()
        .rev()
        .map(|(i, (id, _))| (id, i))
        .collect();

    let mut in_degree = vec![0usize; nodes.len()];
    let mut reverse: Vec<Vec<usize>> = vec![Vec::new(); nodes.len()];

    for (i, (_, deps)) in nodes.iter().enumerate() {
        for dep in deps {
            if let Some(&d) = index.get(dep) {
                if d != i {
                    in_degree[i] += 1;
                    reverse[d].push(i);
                }
            }
        }
    }

    let mut ready: VecDeque<usize> = (0..nodes.len()).filter(|&i| in_degree[i] == 0).collect();
    let mut sorted = Vec::with_capacity(nodes.len());

    while let Some(i) = ready.pop_front() {
        sorted.push(nodes[i].0.clone());
        for &dependent in &reverse[i] {
            in_degree[dependent] -= 1;
            if in_degree[dependent] == 0 {
                ready.push_back(dependent);
            }
        }
    }

    if sorted.len() == nodes.len() {
        Ok(sorted)
    } else {
        Err(nodes
            .iter()
            .enumerate()
            .filter(|(i, _)| in_degree[*i] > 0)
            .map(|(_, (id, _))| id.clone())
            .collect())
    }
}
