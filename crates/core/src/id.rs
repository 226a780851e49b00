//! Task identities and priorities.

use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unique identifier for a task.
///
/// Identifiers are chosen by the caller; [`TaskId::generate`] is available
/// when the caller has no natural key of its own.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    /// Create a TaskId from a caller-chosen key
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a fresh, unique TaskId
    pub fn generate() -> Self {
        Self(format!("task_{}", Ulid::new()))
    }

    /// Borrow the underlying string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TaskId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for TaskId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl AsRef<str> for TaskId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Scheduling priority. Higher values start first.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Priority(pub i32);

impl Priority {
    /// Background work
    pub const LOW: Priority = Priority(0);
    /// Default level
    pub const NORMAL: Priority = Priority(1);
    /// Preferred work
    pub const HIGH: Priority = Priority(2);
    /// Runs ahead of everything else
    pub const CRITICAL: Priority = Priority(3);

    /// Raw ordinal value
    pub fn value(self) -> i32 {
        self.0
    }
}

impl From<i32> for Priority {
    fn from(value: i32) -> Self {
        Self(value)
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}
