//! Task definitions, the work trait, and the handles returned by `enqueue`.

use crate::error::TaskError;
use async_trait::async_trait;
use conductor_core::{Priority, TaskId};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

/// The body of a task.
#[async_trait]
pub trait TaskWork: Send + Sync {
    /// Run the task with its input.
    ///
    /// Long-running work should watch `ctx` for cancellation; the queue never
    /// aborts a running body.
    async fn run(&self, input: Value, ctx: TaskContext) -> anyhow::Result<Value>;
}

/// Adapts a closure to [`TaskWork`].
struct FnWork<F>(F);

#[async_trait]
impl<F, Fut> TaskWork for FnWork<F>
where
    F: Fn(Value, TaskContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
{
    async fn run(&self, input: Value, ctx: TaskContext) -> anyhow::Result<Value> {
        (self.0)(input, ctx).await
    }
}

/// What a running task knows about itself.
#[derive(Debug, Clone)]
pub struct TaskContext {
    id: TaskId,
    name: String,
    token: CancellationToken,
}

impl TaskContext {
    /// Create a context. The queue builds one per run.
    pub fn new(id: TaskId, name: impl Into<String>, token: CancellationToken) -> Self {
        Self {
            id,
            name: name.into(),
            token,
        }
    }

    /// Task identifier.
    pub fn id(&self) -> &TaskId {
        &self.id
    }

    /// Task display name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the task has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once the task is cancelled.
    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }

    /// The underlying cancellation token, for handing to helpers such as retry.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}

/// Caller-supplied description of a unit of work.
#[derive(Clone)]
pub struct TaskDefinition {
    id: TaskId,
    name: String,
    work: Arc<dyn TaskWork>,
    input: Value,
    priority: Priority,
    dependencies: Vec<TaskId>,
    timeout: Option<Duration>,
    tags: Vec<String>,
    metadata: HashMap<String, Value>,
}

impl TaskDefinition {
    /// Create a definition from a closure.
    pub fn new<F, Fut>(id: impl Into<TaskId>, work: F) -> Self
    where
        F: Fn(Value, TaskContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        Self::from_work(id, Arc::new(FnWork(work)))
    }

    /// Create a definition from a shared [`TaskWork`] implementation.
    pub fn from_work(id: impl Into<TaskId>, work: Arc<dyn TaskWork>) -> Self {
        let id = id.into();
        Self {
            name: id.to_string(),
            id,
            work,
            input: Value::Null,
            priority: Priority::default(),
            dependencies: Vec::new(),
            timeout: None,
            tags: Vec::new(),
            metadata: HashMap::new(),
        }
    }

    /// Set the display name (defaults to the id).
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Set the input passed to the work function.
    pub fn with_input(mut self, input: Value) -> Self {
        self.input = input;
        self
    }

    /// Set the priority.
    pub fn with_priority(mut self, priority: impl Into<Priority>) -> Self {
        self.priority = priority.into();
        self
    }

    /// Add a dependency.
    pub fn with_dependency(mut self, dependency: impl Into<TaskId>) -> Self {
        let dependency = dependency.into();
        if !self.dependencies.contains(&dependency) {
            self.dependencies.push(dependency);
        }
        self
    }

    /// Add several dependencies.
    pub fn with_dependencies<I, T>(self, dependencies: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<TaskId>,
    {
        dependencies.into_iter().fold(self, |def, dep| def.with_dependency(dep))
    }

    /// Set a timeout, overriding the queue default.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Add a tag.
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    /// Attach a metadata entry.
    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Task identifier.
    pub fn id(&self) -> &TaskId {
        &self.id
    }

    /// Display name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Priority.
    pub fn priority(&self) -> Priority {
        self.priority
    }

    /// Declared dependencies.
    pub fn dependencies(&self) -> &[TaskId] {
        &self.dependencies
    }

    /// Own timeout, if any.
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Tags.
    pub fn tags(&self) -> &[String] {
        &self.tags
    }

    /// Metadata.
    pub fn metadata(&self) -> &HashMap<String, Value> {
        &self.metadata
    }

    /// Input passed to the work function.
    pub fn input(&self) -> &Value {
        &self.input
    }

    pub(crate) fn work(&self) -> Arc<dyn TaskWork> {
        Arc::clone(&self.work)
    }
}

impl fmt::Debug for TaskDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskDefinition")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("priority", &self.priority)
            .field("dependencies", &self.dependencies)
            .field("timeout", &self.timeout)
            .field("tags", &self.tags)
            .finish_non_exhaustive()
    }
}

/// Resolves with the task's result.
///
/// Dropping the handle does not cancel the task; use
/// [`TaskQueue::cancel`](crate::TaskQueue::cancel) for that.
#[derive(Debug)]
pub struct TaskHandle {
    id: TaskId,
    receiver: oneshot::Receiver<Result<Value, TaskError>>,
}

impl TaskHandle {
    pub(crate) fn new(id: TaskId, receiver: oneshot::Receiver<Result<Value, TaskError>>) -> Self {
        Self { id, receiver }
    }

    /// Identifier of the task behind this handle.
    pub fn id(&self) -> &TaskId {
        &self.id
    }
}

impl Future for TaskHandle {
    type Output = Result<Value, TaskError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match Pin::new(&mut this.receiver).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(_)) => Poll::Ready(Err(TaskError::Abandoned(this.id.clone()))),
            Poll::Pending => Poll::Pending,
        }
    }
}
