//! Dependency-aware task queue.
//!
//! Tasks register as WAITING (blocked on unfinished dependencies) or PENDING
//! (ready). Ready tasks compete on priority for executor slots; finishing a
//! task promotes its dependents. Scheduling passes are deferred to the next
//! runtime turn so tasks enqueued together are ordered by priority.
//!
//! Events are stamped while the state lock is held and delivered in stamp
//! order, so listeners see transitions in the order the queue made them.

use crate::config::{DependencyFailurePolicy, QueueConfig};
use crate::dependency::{topological_order, DependencyGraph, FailureMemory};
use crate::error::{ExecutorError, TaskError};
use crate::events::{panic_message, EventBus};
use crate::executor::BoundedExecutor;
use crate::ready::ReadySet;
use crate::task::{TaskContext, TaskDefinition, TaskHandle};
use chrono::Utc;
use conductor_core::{
    EventKind, QueueEvent, QueueMetrics, QueueStats, TaskFilter, TaskId, TaskSnapshot, TaskStatus,
    Time,
};
use conductor_support::with_timeout;
use serde_json::Value;
use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::{broadcast, oneshot, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

type Responder = oneshot::Sender<Result<Value, TaskError>>;

/// Runtime record of a registered task.
struct TaskInstance {
    definition: TaskDefinition,
    status: TaskStatus,
    created_at: Time,
    started_at: Option<Time>,
    started: Option<Instant>,
    pending_deps: usize,
    seq: u64,
    cancel: CancellationToken,
    responder: Option<Responder>,
}

impl TaskInstance {
    /// Settle the caller's handle. Later calls are no-ops.
    fn respond(&mut self, result: Result<Value, TaskError>) {
        if let Some(responder) = self.responder.take() {
            let _ = responder.send(result);
        }
    }

    fn snapshot(&self) -> TaskSnapshot {
        TaskSnapshot {
            id: self.definition.id().clone(),
            name: self.definition.name().to_string(),
            status: self.status,
            priority: self.definition.priority(),
            dependencies: self.definition.dependencies().to_vec(),
            pending_dependencies: self.pending_deps,
            tags: self.definition.tags().to_vec(),
            metadata: self.definition.metadata().clone(),
            created_at: self.created_at,
            started_at: self.started_at,
        }
    }
}

#[derive(Default)]
struct QueueState {
    tasks: HashMap<TaskId, TaskInstance>,
    ready: ReadySet,
    graph: DependencyGraph,
    /// Failed or cancelled ids, for failing late dependents under `Cascade`
    failed: FailureMemory,
    metrics: QueueMetrics,
    paused: bool,
    seq: u64,
    running: usize,
    pass_scheduled: bool,
    /// Batches being registered; no task starts while non-zero
    batches: usize,
    /// Stamp of the next event batch
    event_seq: u64,
}

/// Events stamped with their place in delivery order.
struct Sealed {
    ticket: u64,
    events: Vec<QueueEvent>,
}

/// Event batches waiting for the batches stamped before them.
#[derive(Default)]
struct Outbox {
    next: u64,
    parked: BTreeMap<u64, Vec<QueueEvent>>,
    draining: bool,
}

impl QueueState {
    fn next_seq(&mut self) -> u64 {
        let seq = self.seq;
        self.seq += 1;
        seq
    }

    /// Stamp `events`. Must be called with the state lock held.
    fn seal(&mut self, events: Vec<QueueEvent>) -> Option<Sealed> {
        if events.is_empty() {
            return None;
        }
        let ticket = self.event_seq;
        self.event_seq += 1;
        Some(Sealed { ticket, events })
    }

    fn waiting(&self) -> usize {
        self.tasks
            .values()
            .filter(|t| t.status == TaskStatus::Waiting)
            .count()
    }

    /// Count down the dependents of a completed task, readying those with no
    /// dependency left.
    fn promote_dependents(&mut self, id: &TaskId) {
        for dependent in self.graph.take_dependents(id) {
            let Some(task) = self.tasks.get_mut(&dependent) else {
                continue;
            };
            if task.status != TaskStatus::Waiting {
                continue;
            }

            task.pending_deps = task.pending_deps.saturating_sub(1);
            if task.pending_deps == 0 && !task.cancel.is_cancelled() {
                task.status = TaskStatus::Pending;
                self.ready
                    .insert(dependent.clone(), task.definition.priority(), task.seq);
                debug!("Task {} is ready", dependent);
            }
        }
    }

    /// Apply the dependency failure policy to everything blocked on `root`.
    fn fail_dependents(
        &mut self,
        policy: DependencyFailurePolicy,
        root: &TaskId,
        events: &mut Vec<QueueEvent>,
    ) {
        if policy == DependencyFailurePolicy::Stall {
            let stalled = self.graph.dependents_of(root).len();
            if stalled > 0 {
                warn!("{} tasks stay waiting on {}, which did not complete", stalled, root);
            }
            return;
        }

        self.failed.remember(root.clone());
        let mut stack = vec![root.clone()];

        while let Some(failed) = stack.pop() {
            for dependent in self.graph.take_dependents(&failed) {
                let Some(mut task) = self.tasks.remove(&dependent) else {
                    continue;
                };
                self.graph.detach(&dependent, task.definition.dependencies());

                let err = TaskError::DependencyFailed {
                    task: dependent.clone(),
                    dependency: failed.clone(),
                };
                debug!("{}", err);

                self.metrics.record_failed();
                events.push(QueueEvent::TaskFailed {
                    id: dependent.clone(),
                    error: err.to_string(),
                });
                task.respond(Err(err));

                self.failed.remember(dependent.clone());
                stack.push(dependent);
            }
        }
    }

    /// Remove a WAITING or PENDING task from every collection.
    fn remove_unstarted(&mut self, id: &TaskId) -> Option<TaskInstance> {
        let task = self.tasks.remove(id)?;
        match task.status {
            TaskStatus::Pending => {
                self.ready.remove(id, task.definition.priority(), task.seq);
            }
            _ => self.graph.detach(id, task.definition.dependencies()),
        }
        Some(task)
    }
}

/// What a scheduling pass hands to the executor.
struct Ticket {
    definition: TaskDefinition,
    token: CancellationToken,
    timeout: Option<Duration>,
}

struct QueueInner {
    config: QueueConfig,
    state: Mutex<QueueState>,
    executor: BoundedExecutor,
    events: EventBus,
    outbox: Mutex<Outbox>,
    /// Registered task count, for `drain`
    live: watch::Sender<usize>,
}

/// Priority task queue with dependency tracking.
///
/// Must be used from inside a Tokio runtime. Cloning yields another handle to
/// the same queue.
///
/// Tasks registered by one [`enqueue_all`](Self::enqueue_all) call always
/// start in priority order. Separate [`enqueue`](Self::enqueue) calls are
/// only ordered by priority on a current-thread runtime or while the queue is
/// paused; on a multi-threaded runtime a worker may start the first task
/// before the next one is registered.
#[derive(Clone)]
pub struct TaskQueue {
    inner: Arc<QueueInner>,
}

/// A [`TaskQueue`] handle that does not keep the queue alive.
///
/// Listeners that call back into their own queue should hold one of these;
/// a strong handle inside the queue's listener list is a reference cycle.
#[derive(Clone)]
pub struct WeakTaskQueue {
    inner: Weak<QueueInner>,
}

impl WeakTaskQueue {
    /// The queue, if any strong handle to it is still alive.
    pub fn upgrade(&self) -> Option<TaskQueue> {
        self.inner.upgrade().map(|inner| TaskQueue { inner })
    }
}

impl TaskQueue {
    /// Create a queue.
    pub fn new(config: QueueConfig) -> Self {
        let (live, _) = watch::channel(0);
        Self {
            inner: Arc::new(QueueInner {
                executor: BoundedExecutor::new(config.concurrency),
                events: EventBus::new(config.event_capacity),
                state: Mutex::new(QueueState {
                    failed: FailureMemory::new(config.failure_memory),
                    ..QueueState::default()
                }),
                outbox: Mutex::new(Outbox::default()),
                live,
                config,
            }),
        }
    }

    /// Register a task and return a handle to its result.
    ///
    /// Fails with [`TaskError::DuplicateTask`] if a live task already uses the
    /// id. Dependencies that are not registered count as satisfied.
    pub fn enqueue(&self, definition: TaskDefinition) -> Result<TaskHandle, TaskError> {
        let handle = self.register(definition)?;
        self.request_pass();
        Ok(handle)
    }

    fn register(&self, definition: TaskDefinition) -> Result<TaskHandle, TaskError> {
        let id = definition.id().clone();
        let (responder, receiver) = oneshot::channel();
        let mut events = Vec::new();

        let sealed = {
            let mut guard = self.lock();
            let state = &mut *guard;

            if state.tasks.contains_key(&id) {
                return Err(TaskError::DuplicateTask(id));
            }

            state.metrics.record_added();
            state.failed.forget(&id);

            let failed_dependency = match self.inner.config.dependency_failure {
                DependencyFailurePolicy::Cascade => definition
                    .dependencies()
                    .iter()
                    .find(|dep| state.failed.contains(*dep))
                    .cloned(),
                DependencyFailurePolicy::Stall => None,
            };

            if let Some(dependency) = failed_dependency {
                let err = TaskError::DependencyFailed {
                    task: id.clone(),
                    dependency,
                };
                debug!("{}", err);

                state.metrics.record_failed();
                state.failed.remember(id.clone());
                events.push(QueueEvent::TaskAdded {
                    id: id.clone(),
                    status: TaskStatus::Failed,
                });
                events.push(QueueEvent::TaskFailed {
                    id: id.clone(),
                    error: err.to_string(),
                });
                let _ = responder.send(Err(err));
            } else {
                let blocking: Vec<TaskId> = definition
                    .dependencies()
                    .iter()
                    .filter(|dep| state.tasks.contains_key(*dep))
                    .cloned()
                    .collect();

                let seq = state.next_seq();
                let status = if blocking.is_empty() {
                    state.ready.insert(id.clone(), definition.priority(), seq);
                    TaskStatus::Pending
                } else {
                    state.graph.register(&id, &blocking);
                    TaskStatus::Waiting
                };

                debug!(
                    "Registered task {} as {} ({} blocking dependencies)",
                    id,
                    status,
                    blocking.len()
                );

                state.tasks.insert(
                    id.clone(),
                    TaskInstance {
                        definition,
                        status,
                        created_at: Utc::now(),
                        started_at: None,
                        started: None,
                        pending_deps: blocking.len(),
                        seq,
                        cancel: CancellationToken::new(),
                        responder: Some(responder),
                    },
                );
                self.publish_live(state);

                events.push(QueueEvent::TaskAdded {
                    id: id.clone(),
                    status,
                });
            }
            state.seal(events)
        };

        self.dispatch(sealed);
        Ok(TaskHandle::new(id, receiver))
    }

    /// Register a batch, ordering it so dependencies inside the batch are
    /// registered first.
    ///
    /// Handles come back in input order. Nothing is registered if the batch
    /// has a duplicate id or a dependency cycle. No task of the batch starts
    /// before the whole batch is registered.
    pub fn enqueue_all(
        &self,
        definitions: Vec<TaskDefinition>,
    ) -> Result<Vec<TaskHandle>, TaskError> {
        let mut seen = HashSet::new();
        for def in &definitions {
            if !seen.insert(def.id().clone()) {
                return Err(TaskError::DuplicateTask(def.id().clone()));
            }
        }

        {
            let state = self.lock();
            if let Some(def) = definitions.iter().find(|d| state.tasks.contains_key(d.id())) {
                return Err(TaskError::DuplicateTask(def.id().clone()));
            }
        }

        let nodes: Vec<(TaskId, Vec<TaskId>)> = definitions
            .iter()
            .map(|d| (d.id().clone(), d.dependencies().to_vec()))
            .collect();
        let order = topological_order(&nodes).map_err(TaskError::DependencyCycle)?;

        let input_order: Vec<TaskId> = nodes.into_iter().map(|(id, _)| id).collect();
        let mut by_id: HashMap<TaskId, TaskDefinition> = definitions
            .into_iter()
            .map(|d| (d.id().clone(), d))
            .collect();

        self.lock().batches += 1;
        let mut handles: HashMap<TaskId, TaskHandle> = HashMap::with_capacity(order.len());
        let mut registered = Ok(());
        for id in order {
            let Some(def) = by_id.remove(&id) else {
                continue;
            };
            match self.register(def) {
                Ok(handle) => {
                    handles.insert(id, handle);
                }
                Err(err) => {
                    registered = Err(err);
                    break;
                }
            }
        }
        self.lock().batches -= 1;
        self.request_pass();
        registered?;

        Ok(input_order
            .iter()
            .filter_map(|id| handles.remove(id))
            .collect())
    }

    /// Cancel a task.
    ///
    /// A WAITING or PENDING task is removed and its handle settles with
    /// [`TaskError::Cancelled`]; returns `true`. A RUNNING task has its
    /// cancellation token triggered and its handle settled with
    /// [`TaskError::Cancelled`], but its work keeps going until it observes
    /// the token; returns `false`. Unknown ids return `false`.
    pub fn cancel(&self, id: &TaskId) -> bool {
        let policy = self.inner.config.dependency_failure;
        let mut events = Vec::new();

        let (cancelled, sealed) = {
            let mut guard = self.lock();
            let state = &mut *guard;

            let Some(status) = state.tasks.get(id).map(|t| t.status) else {
                return false;
            };

            let cancelled = match status {
                TaskStatus::Running => {
                    if let Some(task) = state.tasks.get_mut(id) {
                        if !task.cancel.is_cancelled() {
                            task.cancel.cancel();
                            task.respond(Err(TaskError::Cancelled(id.clone())));
                            info!("Cancellation requested for running task {}", id);
                        }
                    }
                    false
                }
                TaskStatus::Waiting | TaskStatus::Pending => {
                    if let Some(mut task) = state.remove_unstarted(id) {
                        task.cancel.cancel();
                        task.respond(Err(TaskError::Cancelled(id.clone())));
                        state.metrics.record_cancelled();
                        events.push(QueueEvent::TaskCancelled { id: id.clone() });
                        info!("Task {} cancelled", id);

                        state.fail_dependents(policy, id, &mut events);
                        if state.tasks.is_empty() {
                            events.push(QueueEvent::QueueEmpty);
                        }
                        self.publish_live(state);
                    }
                    true
                }
                _ => false,
            };
            (cancelled, state.seal(events))
        };

        self.dispatch(sealed);
        cancelled
    }

    /// Stop starting tasks. Running tasks continue.
    pub fn pause(&self) {
        let sealed = {
            let mut state = self.lock();
            if state.paused {
                return;
            }
            state.paused = true;
            state.seal(vec![QueueEvent::QueuePaused])
        };
        info!("Queue paused");
        self.dispatch(sealed);
    }

    /// Start tasks again.
    pub fn resume(&self) {
        let sealed = {
            let mut state = self.lock();
            if !state.paused {
                return;
            }
            state.paused = false;
            state.seal(vec![QueueEvent::QueueResumed])
        };
        info!("Queue resumed");
        self.dispatch(sealed);
        self.request_pass();
    }

    /// Whether the queue is paused.
    pub fn is_paused(&self) -> bool {
        self.lock().paused
    }

    /// Change how many tasks may run at once.
    pub fn set_concurrency(&self, concurrency: usize) -> Result<(), ExecutorError> {
        self.inner.executor.set_concurrency(concurrency)?;
        info!("Queue concurrency set to {}", concurrency);
        self.request_pass();
        Ok(())
    }

    /// Snapshot of counters and live task counts.
    pub fn stats(&self) -> QueueStats {
        let concurrency = self.inner.executor.concurrency();
        let state = self.lock();
        QueueStats {
            metrics: state.metrics.clone(),
            waiting: state.waiting(),
            pending: state.ready.len(),
            running: state.running,
            paused: state.paused,
            concurrency,
        }
    }

    /// Snapshot of a registered task. Finished tasks are no longer registered.
    pub fn get_task(&self, id: &TaskId) -> Option<TaskSnapshot> {
        self.lock().tasks.get(id).map(TaskInstance::snapshot)
    }

    /// Registered tasks matching `filter`, highest priority first.
    pub fn list_tasks(&self, filter: &TaskFilter) -> Vec<TaskSnapshot> {
        let state = self.lock();
        let mut tasks: Vec<&TaskInstance> = state.tasks.values().collect();
        tasks.sort_by_key(|t| (Reverse(t.definition.priority()), t.seq));

        let mut results: Vec<TaskSnapshot> = tasks
            .into_iter()
            .map(TaskInstance::snapshot)
            .filter(|snapshot| filter.matches(snapshot))
            .collect();

        if let Some(limit) = filter.limit {
            results.truncate(limit);
        }

        results
    }

    /// Cancel every WAITING and PENDING task. Running tasks are unaffected.
    ///
    /// Returns how many tasks were cancelled.
    pub fn clear(&self) -> usize {
        let mut events = Vec::new();

        let (count, sealed) = {
            let mut guard = self.lock();
            let state = &mut *guard;

            let mut unstarted: Vec<(u64, TaskId)> = state
                .tasks
                .iter()
                .filter(|(_, t)| t.status != TaskStatus::Running)
                .map(|(id, t)| (t.seq, id.clone()))
                .collect();
            unstarted.sort();

            for (_, id) in &unstarted {
                if let Some(mut task) = state.tasks.remove(id) {
                    task.cancel.cancel();
                    task.respond(Err(TaskError::Cancelled(id.clone())));
                    state.metrics.record_cancelled();
                    events.push(QueueEvent::TaskCancelled { id: id.clone() });
                }
            }

            state.ready.take_all();
            state.graph.clear();
            state.failed.clear();

            if !unstarted.is_empty() && state.tasks.is_empty() {
                events.push(QueueEvent::QueueEmpty);
            }
            self.publish_live(state);
            (unstarted.len(), state.seal(events))
        };

        if count > 0 {
            info!("Cleared {} queued tasks", count);
        }
        self.dispatch(sealed);
        count
    }

    /// Wait until no task is registered.
    ///
    /// Never returns while tasks stall on a failed dependency under
    /// [`DependencyFailurePolicy::Stall`].
    pub async fn drain(&self) {
        let mut live = self.inner.live.subscribe();
        let _ = live.wait_for(|n| *n == 0).await;
    }

    /// Receive every event from now on.
    ///
    /// Events arrive in the order the queue made the transitions, across
    /// threads as well.
    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.inner.events.subscribe()
    }

    /// Call `listener` for every event of `kind`.
    ///
    /// Listeners run synchronously, with no queue lock held, on the thread
    /// that caused the event or on one delivering earlier events. Events
    /// caused from inside a listener are delivered after it returns. A
    /// panicking listener is logged and skipped.
    pub fn on<F>(&self, kind: EventKind, listener: F)
    where
        F: Fn(&QueueEvent) + Send + Sync + 'static,
    {
        self.inner.events.on(kind, listener);
    }

    /// Call `listener` for every event.
    pub fn on_any<F>(&self, listener: F)
    where
        F: Fn(&QueueEvent) + Send + Sync + 'static,
    {
        self.inner.events.on_any(listener);
    }

    /// Queue configuration.
    pub fn config(&self) -> &QueueConfig {
        &self.inner.config
    }

    /// A handle that does not keep the queue alive.
    pub fn downgrade(&self) -> WeakTaskQueue {
        WeakTaskQueue {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Ask for a scheduling pass on the next runtime turn.
    fn request_pass(&self) {
        {
            let mut state = self.lock();
            if state.pass_scheduled || state.paused || state.batches > 0 || state.ready.is_empty() {
                return;
            }
            state.pass_scheduled = true;
        }

        let Ok(runtime) = Handle::try_current() else {
            warn!("No Tokio runtime available, ready tasks stay pending");
            self.lock().pass_scheduled = false;
            return;
        };

        let queue = self.clone();
        runtime.spawn(async move {
            tokio::task::yield_now().await;
            queue.run_pass();
        });
    }

    /// Start ready tasks, highest priority first, while slots are free.
    fn run_pass(&self) {
        let limit = self.inner.executor.concurrency();
        let default_timeout = self.inner.config.default_timeout();
        let mut events = Vec::new();
        let mut tickets = Vec::new();

        let sealed = {
            let mut guard = self.lock();
            let state = &mut *guard;
            state.pass_scheduled = false;

            while !state.paused && state.batches == 0 && state.running < limit {
                let Some(id) = state.ready.pop() else {
                    break;
                };
                let Some(task) = state.tasks.get_mut(&id) else {
                    continue;
                };
                if task.cancel.is_cancelled() {
                    continue;
                }

                task.status = TaskStatus::Running;
                task.started_at = Some(Utc::now());
                task.started = Some(Instant::now());
                state.running += 1;

                tickets.push(Ticket {
                    definition: task.definition.clone(),
                    token: task.cancel.clone(),
                    timeout: task.definition.timeout().or(default_timeout),
                });
                debug!("Starting task {} ({} running)", id, state.running);
                events.push(QueueEvent::TaskStarted { id });
            }
            state.seal(events)
        };

        self.dispatch(sealed);
        for ticket in tickets {
            self.submit(ticket);
        }
    }

    fn submit(&self, ticket: Ticket) {
        let queue = self.clone();
        let priority = ticket.definition.priority();

        // the queue observes the outcome through `finish`, not the returned future
        let _ = self.inner.executor.schedule(priority, move || async move {
            let id = ticket.definition.id().clone();
            let outcome = run_task(ticket).await;
            queue.finish(&id, outcome);
            Ok::<(), ExecutorError>(())
        });
    }

    /// Record the outcome of a task that was running.
    fn finish(&self, id: &TaskId, outcome: Result<Value, TaskError>) {
        let policy = self.inner.config.dependency_failure;
        let mut events = Vec::new();

        let sealed = {
            let mut guard = self.lock();
            let state = &mut *guard;

            let Some(mut task) = state.tasks.remove(id) else {
                warn!("Finished task {} is no longer registered", id);
                return;
            };
            state.running = state.running.saturating_sub(1);
            let duration = task.started.map(|s| s.elapsed()).unwrap_or_default();

            if task.cancel.is_cancelled() {
                match &outcome {
                    Ok(_) => warn!("Discarding result of cancelled task {}", id),
                    Err(e) => warn!("Discarding error of cancelled task {}: {}", id, e),
                }
                state.metrics.record_cancelled();
                events.push(QueueEvent::TaskCancelled { id: id.clone() });
                state.fail_dependents(policy, id, &mut events);
            } else {
                match outcome {
                    Ok(value) => {
                        debug!("Task {} completed in {:?}", id, duration);
                        state.metrics.record_completed(duration);
                        task.respond(Ok(value));
                        events.push(QueueEvent::TaskCompleted {
                            id: id.clone(),
                            duration,
                        });
                        state.promote_dependents(id);
                    }
                    Err(err) => {
                        debug!("Task {} failed: {}", id, err);
                        state.metrics.record_failed();
                        events.push(QueueEvent::TaskFailed {
                            id: id.clone(),
                            error: err.to_string(),
                        });
                        task.respond(Err(err));
                        state.fail_dependents(policy, id, &mut events);
                    }
                }
            }

            if state.tasks.is_empty() {
                events.push(QueueEvent::QueueEmpty);
            }
            self.publish_live(state);
            state.seal(events)
        };

        self.dispatch(sealed);
        self.request_pass();
    }

    /// Deliver sealed events in stamp order.
    ///
    /// A batch is parked until every earlier batch is out. Whoever parks the
    /// next batch in line delivers it, and every consecutive parked batch
    /// after it.
    fn dispatch(&self, sealed: Option<Sealed>) {
        let Some(Sealed { ticket, events }) = sealed else {
            return;
        };

        let mut outbox = self.outbox();
        outbox.parked.insert(ticket, events);
        if outbox.draining {
            return;
        }
        outbox.draining = true;

        loop {
            let next = outbox.next;
            let Some(batch) = outbox.parked.remove(&next) else {
                outbox.draining = false;
                return;
            };
            outbox.next += 1;
            drop(outbox);

            for event in batch {
                self.inner.events.emit(event);
            }
            outbox = self.outbox();
        }
    }

    fn outbox(&self) -> MutexGuard<'_, Outbox> {
        self.inner.outbox.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish_live(&self, state: &QueueState) {
        self.inner.live.send_replace(state.tasks.len());
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for TaskQueue {
    fn default() -> Self {
        Self::new(QueueConfig::default())
    }
}

/// Run a task body in its own Tokio task, bounded by `timeout`.
///
/// On timeout the body is detached, not aborted.
async fn run_task(ticket: Ticket) -> Result<Value, TaskError> {
    let Ticket {
        definition,
        token,
        timeout,
    } = ticket;

    let id = definition.id().clone();
    let ctx = TaskContext::new(id.clone(), definition.name(), token);
    let work = definition.work();
    let input = definition.input().clone();
    let body = tokio::spawn(async move { work.run(input, ctx).await });

    let joined = match timeout {
        Some(limit) => with_timeout(definition.name(), limit, body).await?,
        None => body.await,
    };

    match joined {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(err)) => Err(TaskError::Failed(err)),
        Err(join) if join.is_panic() => Err(TaskError::Panicked {
            task: id,
            message: panic_message(join.into_panic().as_ref()),
        }),
        Err(_) => Err(TaskError::Abandoned(id)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::num::NonZeroUsize;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    type Order = Arc<Mutex<Vec<String>>>;

    fn id(s: &str) -> TaskId {
        TaskId::from(s)
    }

    fn queue(concurrency: usize) -> TaskQueue {
        TaskQueue::new(config(concurrency))
    }

    fn config(concurrency: usize) -> QueueConfig {
        QueueConfig::new().with_concurrency(NonZeroUsize::new(concurrency).unwrap())
    }

    fn ok(name: &str) -> TaskDefinition {
        let output = name.to_string();
        TaskDefinition::new(name, move |_, _| {
            let output = output.clone();
            async move { Ok(json!(output)) }
        })
    }

    fn failing(name: &str, message: &'static str) -> TaskDefinition {
        TaskDefinition::new(name, move |_, _| async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            Err(anyhow::anyhow!(message))
        })
    }

    fn sleeping(name: &str, ms: u64) -> TaskDefinition {
        TaskDefinition::new(name, move |_, _| async move {
            tokio::time::sleep(Duration::from_millis(ms)).await;
            Ok(Value::Null)
        })
    }

    /// Records its name on start, then sleeps.
    fn recorded(name: &str, order: &Order, ms: u64) -> TaskDefinition {
        let order = Arc::clone(order);
        let label = name.to_string();
        TaskDefinition::new(name, move |_, _| {
            let order = Arc::clone(&order);
            let label = label.clone();
            async move {
                order.lock().unwrap().push(label.clone());
                tokio::time::sleep(Duration::from_millis(ms)).await;
                Ok(json!(label))
            }
        })
    }

    async fn wait_for(events: &mut broadcast::Receiver<QueueEvent>, kind: EventKind) -> QueueEvent {
        loop {
            let event = events.recv().await.unwrap();
            if event.kind() == kind {
                return event;
            }
        }
    }

    fn explode() -> anyhow::Result<Value> {
        panic!("exploded")
    }

    #[tokio::test(start_paused = true)]
    async fn test_higher_priority_starts_first() {
        let q = queue(1);
        let order: Order = Arc::default();

        let x = q.enqueue(recorded("x", &order, 1).with_priority(1)).unwrap();
        let y = q.enqueue(recorded("y", &order, 1).with_priority(5)).unwrap();

        assert_eq!(x.await.unwrap(), json!("x"));
        assert_eq!(y.await.unwrap(), json!("y"));
        assert_eq!(*order.lock().unwrap(), vec!["y", "x"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_equal_priority_keeps_arrival_order() {
        let q = queue(1);
        let order: Order = Arc::default();

        let handles: Vec<_> = ["c", "a", "b"]
            .iter()
            .map(|name| q.enqueue(recorded(name, &order, 1)).unwrap())
            .collect();
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(*order.lock().unwrap(), vec!["c", "a", "b"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dependent_waits_for_dependency() {
        let q = queue(4);
        let order: Order = Arc::default();

        let a = q.enqueue(recorded("a", &order, 10)).unwrap();
        let b = q
            .enqueue(recorded("b", &order, 1).with_dependency("a").with_priority(9))
            .unwrap();

        let waiting = q.get_task(&id("b")).unwrap();
        assert_eq!(waiting.status, TaskStatus::Waiting);
        assert_eq!(waiting.pending_dependencies, 1);
        assert_eq!(q.stats().waiting, 1);

        a.await.unwrap();
        let promoted = q.get_task(&id("b")).unwrap();
        assert!(matches!(promoted.status, TaskStatus::Pending | TaskStatus::Running));

        b.await.unwrap();
        assert_eq!(*order.lock().unwrap(), vec!["a", "b"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_diamond_dependencies() {
        let q = queue(4);
        let order: Order = Arc::default();

        let handles = vec![
            q.enqueue(recorded("root", &order, 5)).unwrap(),
            q.enqueue(recorded("left", &order, 3).with_dependency("root")).unwrap(),
            q.enqueue(recorded("right", &order, 8).with_dependency("root")).unwrap(),
            q.enqueue(recorded("join", &order, 1).with_dependencies(["left", "right"]))
                .unwrap(),
        ];
        assert_eq!(q.get_task(&id("join")).unwrap().pending_dependencies, 2);

        for handle in handles {
            handle.await.unwrap();
        }

        let order = order.lock().unwrap();
        assert_eq!(order.first().map(String::as_str), Some("root"));
        assert_eq!(order.last().map(String::as_str), Some("join"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_dependency_counts_as_satisfied() {
        let q = queue(1);
        let handle = q.enqueue(ok("late").with_dependency("finished-long-ago")).unwrap();
        assert_eq!(q.get_task(&id("late")).unwrap().status, TaskStatus::Pending);
        assert_eq!(handle.await.unwrap(), json!("late"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_running_never_exceeds_concurrency() {
        let q = queue(2);
        let active = Arc::new(AtomicUsize::new(0));
        let peak_active = Arc::new(AtomicUsize::new(0));
        let peak_running = Arc::new(AtomicUsize::new(0));

        let probe = q.downgrade();
        let peak = Arc::clone(&peak_running);
        q.on(EventKind::TaskStarted, move |_| {
            if let Some(q) = probe.upgrade() {
                peak.fetch_max(q.stats().running, Ordering::SeqCst);
            }
        });

        let handles: Vec<_> = (0..6)
            .map(|i| {
                let active = Arc::clone(&active);
                let peak = Arc::clone(&peak_active);
                let def = TaskDefinition::new(format!("t{}", i), move |_, _| {
                    let active = Arc::clone(&active);
                    let peak = Arc::clone(&peak);
                    async move {
                        let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                        active.fetch_sub(1, Ordering::SeqCst);
                        Ok(Value::Null)
                    }
                });
                q.enqueue(def).unwrap()
            })
            .collect();

        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(peak_active.load(Ordering::SeqCst), 2);
        assert_eq!(peak_running.load(Ordering::SeqCst), 2);
        assert_eq!(q.stats().metrics.tasks_completed, 6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_pending_and_waiting() {
        let q = queue(1);
        q.pause();

        let pending = q.enqueue(ok("pending")).unwrap();
        let blocker = q.enqueue(ok("blocker")).unwrap();
        let waiting = q.enqueue(ok("waiting").with_dependency("blocker")).unwrap();

        assert!(q.cancel(&id("pending")));
        assert!(!q.cancel(&id("pending")));
        assert!(q.cancel(&id("waiting")));
        assert!(!q.cancel(&id("unknown")));

        assert!(pending.await.unwrap_err().is_cancelled());
        assert!(waiting.await.unwrap_err().is_cancelled());
        assert!(q.get_task(&id("pending")).is_none());

        let stats = q.stats();
        assert_eq!(stats.metrics.tasks_cancelled, 2);
        assert_eq!(stats.pending, 1);
        assert_eq!(stats.waiting, 0);

        q.resume();
        assert_eq!(blocker.await.unwrap(), json!("blocker"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_metrics_never_settle_more_than_added() {
        let q = queue(2);
        let violated = Arc::new(AtomicBool::new(false));
        let last_settled = Arc::new(AtomicUsize::new(0));

        let probe = q.clone();
        let flag = Arc::clone(&violated);
        let last = Arc::clone(&last_settled);
        q.on_any(move |_| {
            let metrics = probe.stats().metrics;
            let settled = metrics.settled() as usize;
            if settled > metrics.tasks_added as usize || settled < last.swap(settled, Ordering::SeqCst) {
                flag.store(true, Ordering::SeqCst);
            }
        });

        let good = q.enqueue(sleeping("good", 5)).unwrap();
        let bad = q.enqueue(failing("bad", "nope")).unwrap();
        let doomed = q.enqueue(sleeping("doomed", 5).with_dependency("good")).unwrap();
        assert!(q.cancel(&id("doomed")));

        good.await.unwrap();
        bad.await.unwrap_err();
        doomed.await.unwrap_err();
        q.drain().await;

        assert!(!violated.load(Ordering::SeqCst));
        let metrics = q.stats().metrics;
        assert_eq!(metrics.tasks_added, 3);
        assert_eq!(metrics.settled(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_is_delivered_verbatim() {
        let q = queue(1);
        let err = q.enqueue(failing("broken", "boom")).unwrap().await.unwrap_err();

        assert!(matches!(err, TaskError::Failed(_)));
        assert_eq!(err.to_string(), "boom");
        assert_eq!(q.stats().metrics.tasks_failed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_settles_stuck_task() {
        let q = queue(1);
        let stuck = TaskDefinition::new("stuck", |_, _| async {
            std::future::pending::<()>().await;
            Ok(Value::Null)
        })
        .with_timeout(Duration::from_millis(10));

        let start = Instant::now();
        let err = q.enqueue(stuck).unwrap().await.unwrap_err();
        let elapsed = start.elapsed();

        assert!(err.is_timeout());
        assert_eq!(err.to_string(), "stuck timed out after 10ms");
        assert!(elapsed >= Duration::from_millis(10));
        assert!(elapsed < Duration::from_millis(20));
        assert_eq!(q.stats().metrics.tasks_failed, 1);
        assert_eq!(q.stats().running, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_default_timeout_and_override() {
        let q = TaskQueue::new(config(2).with_default_timeout(Duration::from_millis(10)));

        let slow = q.enqueue(sleeping("slow", 50)).unwrap();
        let patient = q
            .enqueue(sleeping("patient", 50).with_timeout(Duration::from_millis(100)))
            .unwrap();

        assert!(slow.await.unwrap_err().is_timeout());
        assert_eq!(patient.await.unwrap(), Value::Null);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_running_task_settles_handle() {
        let q = queue(1);
        let mut events = q.subscribe();
        let observed = Arc::new(AtomicBool::new(false));

        let flag = Arc::clone(&observed);
        let long = TaskDefinition::new("long", move |_, ctx: TaskContext| {
            let flag = Arc::clone(&flag);
            async move {
                ctx.cancelled().await;
                flag.store(true, Ordering::SeqCst);
                Ok(json!("late"))
            }
        });
        let handle = q.enqueue(long).unwrap();

        wait_for(&mut events, EventKind::TaskStarted).await;
        assert_eq!(q.get_task(&id("long")).unwrap().status, TaskStatus::Running);

        assert!(!q.cancel(&id("long")));
        assert!(handle.await.unwrap_err().is_cancelled());

        q.drain().await;
        assert!(observed.load(Ordering::SeqCst));
        assert_eq!(
            wait_for(&mut events, EventKind::TaskCancelled).await,
            QueueEvent::TaskCancelled { id: id("long") }
        );

        let metrics = q.stats().metrics;
        assert_eq!(metrics.tasks_cancelled, 1);
        assert_eq!(metrics.tasks_completed, 0);
        assert!(!q.cancel(&id("long")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cascade_fails_dependents() {
        let q = queue(2);

        let a = q.enqueue(failing("a", "a broke")).unwrap();
        let b = q.enqueue(ok("b").with_dependency("a")).unwrap();
        let c = q.enqueue(ok("c").with_dependency("b")).unwrap();
        let d = q.enqueue(ok("d")).unwrap();

        assert_eq!(a.await.unwrap_err().to_string(), "a broke");
        assert!(matches!(
            b.await.unwrap_err(),
            TaskError::DependencyFailed { task, dependency }
                if task == id("b") && dependency == id("a")
        ));
        assert!(matches!(
            c.await.unwrap_err(),
            TaskError::DependencyFailed { dependency, .. } if dependency == id("b")
        ));
        assert_eq!(d.await.unwrap(), json!("d"));

        let late = q.enqueue(ok("e").with_dependency("c")).unwrap();
        assert!(matches!(
            late.await.unwrap_err(),
            TaskError::DependencyFailed { dependency, .. } if dependency == id("c")
        ));

        let metrics = q.stats().metrics;
        assert_eq!(metrics.tasks_added, 5);
        assert_eq!(metrics.tasks_failed, 4);
        assert_eq!(metrics.tasks_completed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stall_leaves_dependents_waiting() {
        let q = TaskQueue::new(config(2).with_dependency_failure(DependencyFailurePolicy::Stall));

        let a = q.enqueue(failing("a", "a broke")).unwrap();
        let b = q.enqueue(ok("b").with_dependency("a")).unwrap();

        a.await.unwrap_err();
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(q.get_task(&id("b")).unwrap().status, TaskStatus::Waiting);
        assert_eq!(q.stats().waiting, 1);

        assert!(q.cancel(&id("b")));
        assert!(b.await.unwrap_err().is_cancelled());
        q.drain().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicking_listener_does_not_break_queue() {
        let q = queue(1);
        let empties = Arc::new(AtomicUsize::new(0));

        q.on(EventKind::TaskCompleted, |_| panic!("listener bug"));
        let counter = Arc::clone(&empties);
        q.on(EventKind::QueueEmpty, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        assert_eq!(q.enqueue(ok("first")).unwrap().await.unwrap(), json!("first"));
        assert_eq!(q.enqueue(ok("second")).unwrap().await.unwrap(), json!("second"));
        q.drain().await;

        assert_eq!(q.stats().metrics.tasks_completed, 2);
        assert_eq!(empties.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicking_work_fails_task() {
        let q = queue(1);

        let bad = q.enqueue(TaskDefinition::new("bad", |_, _| async { explode() })).unwrap();
        let next = q.enqueue(ok("next")).unwrap();

        let err = bad.await.unwrap_err();
        assert!(matches!(&err, TaskError::Panicked { message, .. } if message == "exploded"));
        assert_eq!(err.to_string(), "task bad panicked: exploded");
        assert_eq!(next.await.unwrap(), json!("next"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_waits_until_empty() {
        let q = queue(2);
        q.drain().await;

        let mut events = q.subscribe();
        for (name, ms) in [("a", 5), ("b", 10), ("c", 15)] {
            let _ = q.enqueue(sleeping(name, ms)).unwrap();
        }

        q.drain().await;
        let stats = q.stats();
        assert_eq!(stats.live(), 0);
        assert_eq!(stats.metrics.tasks_completed, 3);
        wait_for(&mut events, EventKind::QueueEmpty).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_pause_and_resume() {
        let q = queue(1);
        let mut events = q.subscribe();

        q.pause();
        q.pause();
        assert!(q.is_paused());

        let handle = q.enqueue(ok("held")).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(q.get_task(&id("held")).unwrap().status, TaskStatus::Pending);
        assert!(q.stats().paused);

        q.resume();
        handle.await.unwrap();
        q.drain().await;

        let mut kinds = Vec::new();
        while let Ok(event) = events.try_recv() {
            kinds.push(event.kind());
        }
        assert_eq!(
            kinds,
            vec![
                EventKind::QueuePaused,
                EventKind::TaskAdded,
                EventKind::QueueResumed,
                EventKind::TaskStarted,
                EventKind::TaskCompleted,
                EventKind::QueueEmpty,
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_clear_cancels_unstarted_tasks() {
        let q = queue(1);
        let mut events = q.subscribe();

        let running = q.enqueue(sleeping("running", 20)).unwrap();
        wait_for(&mut events, EventKind::TaskStarted).await;

        let queued = vec![
            q.enqueue(ok("b")).unwrap(),
            q.enqueue(ok("c")).unwrap(),
            q.enqueue(ok("d").with_dependency("running")).unwrap(),
        ];

        assert_eq!(q.clear(), 3);
        for handle in queued {
            assert!(handle.await.unwrap_err().is_cancelled());
        }
        running.await.unwrap();

        let metrics = q.stats().metrics;
        assert_eq!(metrics.tasks_cancelled, 3);
        assert_eq!(metrics.tasks_completed, 1);
        assert_eq!(q.clear(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_list_tasks_order_and_filter() {
        let q = queue(1);
        q.pause();

        let _low = q.enqueue(ok("low").with_priority(0).with_tag("io")).unwrap();
        let _high = q.enqueue(ok("high").with_priority(3).with_tag("llm")).unwrap();
        let _mid = q.enqueue(ok("mid").with_priority(1).with_tag("llm")).unwrap();
        let _waiter = q
            .enqueue(ok("waiter").with_priority(5).with_tag("io").with_dependency("low"))
            .unwrap();

        let ids = |tasks: Vec<TaskSnapshot>| -> Vec<String> {
            tasks.into_iter().map(|t| t.id.to_string()).collect()
        };

        assert_eq!(
            ids(q.list_tasks(&TaskFilter::default())),
            vec!["waiter", "high", "mid", "low"]
        );
        assert_eq!(
            ids(q.list_tasks(&TaskFilter {
                tag: Some("llm".to_string()),
                ..Default::default()
            })),
            vec!["high", "mid"]
        );
        assert_eq!(
            ids(q.list_tasks(&TaskFilter {
                status: Some(TaskStatus::Waiting),
                ..Default::default()
            })),
            vec!["waiter"]
        );
        assert_eq!(
            ids(q.list_tasks(&TaskFilter {
                limit: Some(2),
                ..Default::default()
            })),
            vec!["waiter", "high"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_enqueue_all_orders_batch() {
        let q = queue(1);
        let order: Order = Arc::default();

        let handles = q
            .enqueue_all(vec![
                recorded("report", &order, 1).with_dependencies(["summarize", "search"]),
                recorded("summarize", &order, 1).with_dependency("search"),
                recorded("search", &order, 1),
            ])
            .unwrap();

        assert_eq!(handles[0].id(), &id("report"));
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(*order.lock().unwrap(), vec!["search", "summarize", "report"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_enqueue_all_rejects_bad_batches() {
        let q = queue(1);

        let cycle = q
            .enqueue_all(vec![ok("a").with_dependency("b"), ok("b").with_dependency("a")])
            .unwrap_err();
        assert!(matches!(cycle, TaskError::DependencyCycle(ids) if ids == vec![id("a"), id("b")]));

        let duplicate = q.enqueue_all(vec![ok("x"), ok("x")]).unwrap_err();
        assert!(matches!(duplicate, TaskError::DuplicateTask(dup) if dup == id("x")));

        assert_eq!(q.stats().metrics.tasks_added, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_id_is_rejected() {
        let q = queue(1);
        q.pause();

        let _first = q.enqueue(ok("same")).unwrap();
        let err = q.enqueue(ok("same")).unwrap_err();
        assert!(matches!(err, TaskError::DuplicateTask(dup) if dup == id("same")));
        assert_eq!(q.stats().metrics.tasks_added, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_concurrency_starts_more_tasks() {
        let q = queue(1);
        let mut events = q.subscribe();

        let handles: Vec<_> = (0..3)
            .map(|i| q.enqueue(sleeping(&format!("t{}", i), 10)).unwrap())
            .collect();

        wait_for(&mut events, EventKind::TaskStarted).await;
        assert_eq!(q.stats().running, 1);

        assert_eq!(q.set_concurrency(0), Err(ExecutorError::InvalidConcurrency(0)));
        q.set_concurrency(3).unwrap();
        wait_for(&mut events, EventKind::TaskStarted).await;
        wait_for(&mut events, EventKind::TaskStarted).await;

        let stats = q.stats();
        assert_eq!(stats.running, 3);
        assert_eq!(stats.concurrency, 3);

        for handle in handles {
            handle.await.unwrap();
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_batch_priority_holds_on_multi_thread_runtime() {
        for round in 0..50 {
            let q = queue(1);
            let order: Order = Arc::default();

            let handles = q
                .enqueue_all(vec![
                    recorded("x", &order, 0).with_priority(1),
                    recorded("y", &order, 0).with_priority(5),
                ])
                .unwrap();
            for handle in handles {
                handle.await.unwrap();
            }
            assert_eq!(*order.lock().unwrap(), vec!["y", "x"], "round {}", round);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_paused_enqueues_keep_priority_on_multi_thread_runtime() {
        for round in 0..50 {
            let q = queue(1);
            let order: Order = Arc::default();

            q.pause();
            let x = q.enqueue(recorded("x", &order, 0).with_priority(1)).unwrap();
            let y = q.enqueue(recorded("y", &order, 0).with_priority(5)).unwrap();
            q.resume();

            x.await.unwrap();
            y.await.unwrap();
            assert_eq!(*order.lock().unwrap(), vec!["y", "x"], "round {}", round);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_memory_is_bounded() {
        let q = TaskQueue::new(config(4).with_failure_memory(16));

        for i in 0..100 {
            let _ = q.enqueue(failing(&format!("f{}", i), "nope")).unwrap();
        }
        q.drain().await;
        assert_eq!(q.lock().failed.len(), 16);

        // the oldest failures are forgotten, the newest still fail dependents
        let forgotten = q.enqueue(ok("early").with_dependency("f0")).unwrap();
        assert_eq!(forgotten.await.unwrap(), json!("early"));

        let remembered = q.enqueue(ok("late").with_dependency("f99")).unwrap();
        assert!(matches!(
            remembered.await.unwrap_err(),
            TaskError::DependencyFailed { dependency, .. } if dependency == id("f99")
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_failure_memory_keeps_nothing() {
        let q = TaskQueue::new(config(1).with_failure_memory(0));

        q.enqueue(failing("a", "a broke")).unwrap().await.unwrap_err();
        q.drain().await;
        assert_eq!(q.lock().failed.len(), 0);

        let b = q.enqueue(ok("b").with_dependency("a")).unwrap();
        assert_eq!(b.await.unwrap(), json!("b"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelling_unstarted_task_fails_its_dependents() {
        let q = queue(1);
        q.pause();

        let pending = q.enqueue(ok("pending")).unwrap();
        let after_pending = q.enqueue(ok("after-pending").with_dependency("pending")).unwrap();
        let blocker = q.enqueue(ok("blocker")).unwrap();
        let waiting = q.enqueue(ok("waiting").with_dependency("blocker")).unwrap();
        let after_waiting = q.enqueue(ok("after-waiting").with_dependency("waiting")).unwrap();

        assert!(q.cancel(&id("pending")));
        assert!(q.cancel(&id("waiting")));

        assert!(pending.await.unwrap_err().is_cancelled());
        assert!(waiting.await.unwrap_err().is_cancelled());
        assert!(matches!(
            after_pending.await.unwrap_err(),
            TaskError::DependencyFailed { task, dependency }
                if task == id("after-pending") && dependency == id("pending")
        ));
        assert!(matches!(
            after_waiting.await.unwrap_err(),
            TaskError::DependencyFailed { dependency, .. } if dependency == id("waiting")
        ));

        let late = q.enqueue(ok("late").with_dependency("pending")).unwrap();
        assert!(matches!(
            late.await.unwrap_err(),
            TaskError::DependencyFailed { dependency, .. } if dependency == id("pending")
        ));

        q.resume();
        assert_eq!(blocker.await.unwrap(), json!("blocker"));

        let metrics = q.stats().metrics;
        assert_eq!(metrics.tasks_cancelled, 2);
        assert_eq!(metrics.tasks_failed, 3);
        assert_eq!(metrics.tasks_completed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelling_running_task_fails_dependents_when_work_returns() {
        let q = queue(2);
        let mut events = q.subscribe();

        let long = TaskDefinition::new("long", |_, ctx: TaskContext| async move {
            ctx.cancelled().await;
            tokio::time::sleep(Duration::from_millis(10)).await;
            Ok(json!("late"))
        });
        let handle = q.enqueue(long).unwrap();
        let dependent = q.enqueue(ok("dependent").with_dependency("long")).unwrap();

        wait_for(&mut events, EventKind::TaskStarted).await;
        assert!(!q.cancel(&id("long")));
        assert!(handle.await.unwrap_err().is_cancelled());

        // still waiting while the cancelled work winds down
        assert_eq!(q.get_task(&id("dependent")).unwrap().status, TaskStatus::Waiting);

        assert!(matches!(
            dependent.await.unwrap_err(),
            TaskError::DependencyFailed { task, dependency }
                if task == id("dependent") && dependency == id("long")
        ));

        let late = q.enqueue(ok("late").with_dependency("long")).unwrap();
        assert!(matches!(late.await.unwrap_err(), TaskError::DependencyFailed { .. }));
        assert_eq!(q.stats().metrics.tasks_cancelled, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_clear_forgets_failures() {
        let q = queue(1);

        q.enqueue(failing("a", "a broke")).unwrap().await.unwrap_err();
        q.drain().await;
        assert_eq!(q.clear(), 0);

        let b = q.enqueue(ok("b").with_dependency("a")).unwrap();
        assert_eq!(b.await.unwrap(), json!("b"));
    }

    #[tokio::test]
    async fn test_weak_handle_does_not_keep_queue_alive() {
        let q = queue(1);
        let weak = q.downgrade();
        let listener = q.downgrade();
        q.on_any(move |_| {
            let _ = listener.upgrade().map(|queue| queue.stats());
        });

        assert!(weak.upgrade().is_some());
        drop(q);
        assert!(weak.upgrade().is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_events_follow_transition_order_across_threads() {
        let q = queue(3);
        let log: Arc<Mutex<Vec<QueueEvent>>> = Arc::default();
        let sink = Arc::clone(&log);
        q.on_any(move |event| sink.lock().unwrap().push(event.clone()));

        let producers: Vec<_> = (0..4)
            .map(|p| {
                let q = q.clone();
                tokio::spawn(async move {
                    let mut handles = Vec::new();
                    for i in 0..25 {
                        handles.push(q.enqueue(ok(&format!("p{}-{}", p, i))).unwrap());
                        tokio::task::yield_now().await;
                    }
                    for handle in handles {
                        handle.await.unwrap();
                    }
                })
            })
            .collect();
        for producer in producers {
            producer.await.unwrap();
        }

        // every handle settled, but the last batches may still be in delivery
        loop {
            let done = {
                let log = log.lock().unwrap();
                let completed = log.iter().filter(|e| e.kind() == EventKind::TaskCompleted).count();
                completed == 100 && log.last().map(QueueEvent::kind) == Some(EventKind::QueueEmpty)
            };
            if done {
                break;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        let log = log.lock().unwrap();
        let mut seen: HashMap<TaskId, Vec<EventKind>> = HashMap::new();
        let mut live = 0i64;
        for event in log.iter() {
            match event {
                QueueEvent::TaskAdded { .. } => live += 1,
                QueueEvent::TaskCompleted { .. } => live -= 1,
                QueueEvent::QueueEmpty => assert_eq!(live, 0),
                _ => {}
            }
            if let Some(task) = event.task_id() {
                seen.entry(task.clone()).or_default().push(event.kind());
            }
        }

        assert_eq!(seen.len(), 100);
        for kinds in seen.values() {
            assert_eq!(
                kinds,
                &vec![EventKind::TaskAdded, EventKind::TaskStarted, EventKind::TaskCompleted]
            );
        }
    }

    #[tokio::test]
    async fn test_work_receives_input_and_context() {
        let q = TaskQueue::default();
        let def = TaskDefinition::new("double", |input: Value, ctx: TaskContext| async move {
            let n = input.as_i64().unwrap_or_default();
            Ok(json!({ "task": ctx.id().as_str(), "name": ctx.name(), "value": n * 2 }))
        })
        .with_name("Double it")
        .with_input(json!(21));

        let output = q.enqueue(def).unwrap().await.unwrap();
        assert_eq!(output, json!({ "task": "double", "name": "Double it", "value": 42 }));
    }
}
