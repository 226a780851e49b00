//! Execution-support primitives.
//!
//! Self-contained helpers that wrap a unit of work before (or instead of)
//! handing it to a queue: deadlines, retries with backoff, and bounded
//! fan-out over a batch.

#![warn(missing_docs)]

pub mod timeout;
pub mod retry;
pub mod batch;

pub use timeout::{with_timeout, TimeoutError};
pub use retry::{retry, BackoffStrategy, Retry, RetryError, RetryOutcome, RetryPolicy};
pub use batch::{map_bounded, map_bounded_settled};
