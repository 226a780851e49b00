//! Workload plans - JSON files describing simulated tasks.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use conductor_core::{Priority, TaskId};
use conductor_execution::{topological_order, QueueConfig, TaskContext, TaskDefinition, TaskWork};
use conductor_support::{Retry, RetryPolicy};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashSet;
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

/// A named set of tasks plus the queue settings to run them with.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    /// Display name
    #[serde(default)]
    pub name: Option<String>,
    /// Queue settings
    #[serde(default)]
    pub config: QueueConfig,
    /// Tasks to run
    pub tasks: Vec<TaskSpec>,
}

/// One simulated task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSpec {
    /// Task identifier
    pub id: TaskId,
    /// Display name
    #[serde(default)]
    pub name: Option<String>,
    /// Scheduling priority
    #[serde(default)]
    pub priority: Priority,
    /// Tasks that must complete first
    #[serde(default)]
    pub depends_on: Vec<TaskId>,
    /// How long each attempt takes
    #[serde(default)]
    pub duration_ms: u64,
    /// Per-task timeout
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    /// Fail every attempt with this message
    #[serde(default)]
    pub fail: Option<String>,
    /// Fail this many attempts before succeeding
    #[serde(default)]
    pub flaky_failures: u32,
    /// Retry failed attempts with this policy
    #[serde(default)]
    pub retry: Option<RetryPolicy>,
    /// Input handed to the task
    #[serde(default)]
    pub input: Option<Value>,
    /// Output to produce on success
    #[serde(default)]
    pub output: Option<Value>,
    /// Tags
    #[serde(default)]
    pub tags: Vec<String>,
}

/// Problem found by [`Plan::validate`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlanIssue {
    /// Two tasks share an id
    #[error("duplicate task id {0}")]
    DuplicateId(TaskId),

    /// A dependency names no task in the plan; it would count as satisfied
    #[error("task {task} depends on unknown task {dependency}")]
    DanglingDependency {
        /// Task declaring the dependency
        task: TaskId,
        /// Unknown id
        dependency: TaskId,
    },

    /// Tasks that depend on each other
    #[error("dependency cycle between {}", .0.iter().map(TaskId::as_str).collect::<Vec<_>>().join(", "))]
    Cycle(Vec<TaskId>),
}

impl Plan {
    /// Load a plan from a JSON file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read plan {}", path.display()))?;
        let mut plan = Self::parse(&text)
            .with_context(|| format!("Failed to parse plan {}", path.display()))?;

        if plan.name.is_none() {
            plan.name = path.file_stem().map(|s| s.to_string_lossy().into_owned());
        }
        Ok(plan)
    }

    /// Parse a plan from JSON text.
    pub fn parse(text: &str) -> Result<Self> {
        let plan: Plan = serde_json::from_str(text)?;
        if plan.tasks.is_empty() {
            bail!("plan has no tasks");
        }
        Ok(plan)
    }

    /// Display name, or "plan".
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or("plan")
    }

    /// Check for duplicate ids, unknown dependencies and cycles.
    pub fn validate(&self) -> Vec<PlanIssue> {
        let mut issues = Vec::new();

        let mut ids = HashSet::new();
        for task in &self.tasks {
            if !ids.insert(&task.id) {
                issues.push(PlanIssue::DuplicateId(task.id.clone()));
            }
        }

        for task in &self.tasks {
            for dependency in &task.depends_on {
                if !ids.contains(dependency) {
                    issues.push(PlanIssue::DanglingDependency {
                        task: task.id.clone(),
                        dependency: dependency.clone(),
                    });
                }
            }
        }

        let nodes: Vec<(TaskId, Vec<TaskId>)> = self
            .tasks
            .iter()
            .map(|t| (t.id.clone(), t.depends_on.clone()))
            .collect();
        if let Err(cycle) = topological_order(&nodes) {
            issues.push(PlanIssue::Cycle(cycle));
        }

        issues
    }

    /// Build queue definitions for every task.
    pub fn definitions(&self) -> Vec<TaskDefinition> {
        self.tasks.iter().map(TaskSpec::definition).collect()
    }
}

impl TaskSpec {
    fn definition(&self) -> TaskDefinition {
        let mut def = TaskDefinition::from_work(self.id.clone(), Arc::new(SimulatedWork::new(self.clone())))
            .with_priority(self.priority)
            .with_dependencies(self.depends_on.iter().cloned())
            .with_input(self.input.clone().unwrap_or(Value::Null));

        if let Some(name) = &self.name {
            def = def.with_name(name);
        }
        if let Some(ms) = self.timeout_ms {
            def = def.with_timeout(Duration::from_millis(ms));
        }
        for tag in &self.tags {
            def = def.with_tag(tag);
        }
        def
    }
}

/// Sleeps, then succeeds or fails as its [`TaskSpec`] describes.
struct SimulatedWork {
    spec: TaskSpec,
    attempts: AtomicU32,
}

impl SimulatedWork {
    fn new(spec: TaskSpec) -> Self {
        Self {
            spec,
            attempts: AtomicU32::new(0),
        }
    }

    async fn attempt(&self, input: &Value, ctx: &TaskContext) -> Result<Value> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;

        tokio::select! {
            _ = ctx.cancelled() => bail!("cancelled during attempt {}", attempt),
            _ = tokio::time::sleep(Duration::from_millis(self.spec.duration_ms)) => {}
        }

        if let Some(message) = &self.spec.fail {
            bail!("{}", message);
        }
        if attempt <= self.spec.flaky_failures {
            bail!("transient failure on attempt {}", attempt);
        }

        Ok(self
            .spec
            .output
            .clone()
            .unwrap_or_else(|| json!({ "task": ctx.id(), "input": input })))
    }
}

#[async_trait]
impl TaskWork for SimulatedWork {
    async fn run(&self, input: Value, ctx: TaskContext) -> Result<Value> {
        let Some(policy) = &self.spec.retry else {
            return self.attempt(&input, &ctx).await;
        };

        let id = ctx.id().clone();
        let outcome = Retry::new(policy.clone())
            .with_cancellation(ctx.token().clone())
            .on_retry(move |err, attempt, delay| {
                warn!("Task {} attempt {} failed: {}, retrying in {:?}", id, attempt, err, delay)
            })
            .run(|_| self.attempt(&input, &ctx))
            .await?;

        Ok(json!({ "output": outcome.value, "attempts": outcome.attempts }))
    }
}
