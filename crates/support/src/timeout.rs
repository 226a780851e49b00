//! Deadline wrapper.

use std::future::Future;
use std::time::Duration;
use thiserror::Error;

/// Raised when a unit of work does not finish within its bound.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{operation} timed out after {}ms", .timeout.as_millis())]
pub struct TimeoutError {
    /// Name of the operation that timed out
    pub operation: String,
    /// Configured bound
    pub timeout: Duration,
}

impl TimeoutError {
    /// Create a new timeout error.
    pub fn new(operation: impl Into<String>, timeout: Duration) -> Self {
        Self {
            operation: operation.into(),
            timeout,
        }
    }
}

/// Race `work` against a deadline.
///
/// Resolves with the outcome of `work` if it finishes first, otherwise with a
/// [`TimeoutError`]. The losing future is dropped, not driven further. To
/// let work keep running after its deadline, spawn it first and pass the
/// `JoinHandle`: dropping a handle detaches the task instead of aborting it.
pub async fn with_timeout<F>(
    operation: impl Into<String>,
    limit: Duration,
    work: F,
) -> Result<F::Output, TimeoutError>
where
    F: Future,
{
    match tokio::time::timeout(limit, work).await {
        Ok(output) => Ok(output),
        Err(_) => {
            let err = TimeoutError::new(operation, limit);
            tracing::debug!("{}", err);
            Err(err)
        }
    }
}
