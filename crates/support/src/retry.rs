//! Retry with backoff.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// How the delay between attempts grows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffStrategy {
    /// `initial`
    Constant,
    /// `initial * attempt`
    Linear,
    /// `initial * factor^(attempt - 1)`
    Exponential,
    /// `initial * fib(attempt)`
    Fibonacci,
}

impl Default for BackoffStrategy {
    fn default() -> Self {
        BackoffStrategy::Exponential
    }
}

/// Retry configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts, including the first one
    pub max_attempts: u32,
    /// Base delay in milliseconds, also the lower clamp
    pub initial_delay_ms: u64,
    /// Upper clamp in milliseconds
    pub max_delay_ms: u64,
    /// Growth factor for exponential backoff
    pub factor: f64,
    /// Symmetric jitter as a fraction of the computed delay (0.0 - 1.0)
    pub jitter: f64,
    /// Delay growth strategy
    pub strategy: BackoffStrategy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 1000,
            max_delay_ms: 30_000,
            factor: 2.0,
            jitter: 0.1,
            strategy: BackoffStrategy::Exponential,
        }
    }
}

impl RetryPolicy {
    /// Create a policy with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the number of attempts.
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    /// Set the base delay.
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay_ms = delay.as_millis() as u64;
        self
    }

    /// Set the maximum delay.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay_ms = delay.as_millis() as u64;
        self
    }

    /// Set the exponential growth factor.
    pub fn with_factor(mut self, factor: f64) -> Self {
        self.factor = factor;
        self
    }

    /// Set the jitter fraction.
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Set the backoff strategy.
    pub fn with_strategy(mut self, strategy: BackoffStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Delay after the given failed attempt, without jitter.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.clamp(self.base_delay_ms(attempt))
    }

    /// Delay after the given failed attempt, perturbed by jitter.
    pub fn jittered_delay(&self, attempt: u32) -> Duration {
        let base = self.base_delay_ms(attempt);
        let jitter = self.jitter.clamp(0.0, 1.0);
        if jitter == 0.0 || !base.is_finite() {
            return self.clamp(base);
        }

        let offset = base * jitter * rand::thread_rng().gen_range(-1.0..=1.0);
        self.clamp(base + offset)
    }

    fn base_delay_ms(&self, attempt: u32) -> f64 {
        let initial = self.initial_delay_ms as f64;
        let attempt = attempt.max(1);

        match self.strategy {
            BackoffStrategy::Constant => initial,
            BackoffStrategy::Linear => initial * f64::from(attempt),
            BackoffStrategy::Exponential => {
                initial * self.factor.powi(i32::try_from(attempt - 1).unwrap_or(i32::MAX))
            }
            BackoffStrategy::Fibonacci => initial * fibonacci(attempt) as f64,
        }
    }

    fn clamp(&self, delay_ms: f64) -> Duration {
        let low = self.initial_delay_ms as f64;
        let high = (self.max_delay_ms as f64).max(low);
        if delay_ms.is_nan() {
            return Duration::from_millis(self.initial_delay_ms);
        }
        Duration::from_millis(delay_ms.clamp(low, high).round() as u64)
    }
}

/// fib(1) = fib(2) = 1
fn fibonacci(n: u32) -> u64 {
    let (mut a, mut b) = (0u64, 1u64);
    for _ in 0..n {
        let next = a.saturating_add(b);
        a = b;
        b = next;
    }
    a
}

/// Successful result of a retried operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryOutcome<T> {
    /// Value produced by the successful attempt
    pub value: T,
    /// Attempts made, including the successful one
    pub attempts: u32,
}

/// Error type for retried operations.
#[derive(Debug, Error)]
pub enum RetryError {
    /// Every attempt failed
    #[error("max retries exceeded after {attempts} attempts: {last_error}")]
    Exhausted {
        /// Attempts made
        attempts: u32,
        /// Error from the final attempt
        last_error: anyhow::Error,
    },

    /// The retry predicate refused to retry this error
    #[error("attempt {attempt} failed with a non-retryable error: {last_error}")]
    Rejected {
        /// Attempt that produced the error
        attempt: u32,
        /// The vetoed error
        last_error: anyhow::Error,
    },

    /// Cancellation was requested
    #[error("retry aborted after {attempts} attempts")]
    Aborted {
        /// Attempts started before the abort
        attempts: u32,
    },
}

impl RetryError {
    /// Attempts made before giving up.
    pub fn attempts(&self) -> u32 {
        match self {
            RetryError::Exhausted { attempts, .. } | RetryError::Aborted { attempts } => *attempts,
            RetryError::Rejected { attempt, .. } => *attempt,
        }
    }

    /// Underlying error of the last attempt, if one completed.
    pub fn last_error(&self) -> Option<&anyhow::Error> {
        match self {
            RetryError::Exhausted { last_error, .. } | RetryError::Rejected { last_error, .. } => {
                Some(last_error)
            }
            RetryError::Aborted { .. } => None,
        }
    }
}

type RetryPredicate = Box<dyn Fn(&anyhow::Error) -> bool + Send + Sync>;
type RetryObserver = Box<dyn Fn(&anyhow::Error, u32, Duration) + Send + Sync>;

/// Retry runner.
///
/// ```ignore
/// let outcome = Retry::new(RetryPolicy::new().with_max_attempts(5))
///     .retry_if(|e| !e.to_string().contains("unauthorized"))
///     .on_retry(|e, attempt, delay| tracing::info!("attempt {attempt} failed: {e}, waiting {delay:?}"))
///     .run(|attempt| call_model(attempt))
///     .await?;
/// ```
pub struct Retry {
    policy: RetryPolicy,
    retry_if: Option<RetryPredicate>,
    on_retry: Option<RetryObserver>,
    cancel: Option<CancellationToken>,
}

impl Retry {
    /// Create a runner for the given policy.
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            retry_if: None,
            on_retry: None,
            cancel: None,
        }
    }

    /// Only retry errors accepted by `predicate`.
    pub fn retry_if<P>(mut self, predicate: P) -> Self
    where
        P: Fn(&anyhow::Error) -> bool + Send + Sync + 'static,
    {
        self.retry_if = Some(Box::new(predicate));
        self
    }

    /// Observe each retry with the error, the failed attempt number and the delay.
    pub fn on_retry<O>(mut self, observer: O) -> Self
    where
        O: Fn(&anyhow::Error, u32, Duration) + Send + Sync + 'static,
    {
        self.on_retry = Some(Box::new(observer));
        self
    }

    /// Abort when `token` is cancelled, whether during an attempt or a delay.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// Get the policy.
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run `operation` until it succeeds, is vetoed, is aborted, or runs out of attempts.
    ///
    /// The operation receives the 1-based attempt number.
    pub async fn run<F, Fut, T>(&self, mut operation: F) -> Result<RetryOutcome<T>, RetryError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            if self.is_cancelled() {
                return Err(RetryError::Aborted { attempts: attempt });
            }
            attempt += 1;

            let result = match &self.cancel {
                Some(token) => {
                    tokio::select! {
                        biased;
                        _ = token.cancelled() => return Err(RetryError::Aborted { attempts: attempt }),
                        result = operation(attempt) => result,
                    }
                }
                None => operation(attempt).await,
            };

            let error = match result {
                Ok(value) => return Ok(RetryOutcome { value, attempts: attempt }),
                Err(error) => error,
            };

            if let Some(predicate) = &self.retry_if {
                if !predicate(&error) {
                    debug!("attempt {} failed with non-retryable error: {:#}", attempt, error);
                    return Err(RetryError::Rejected { attempt, last_error: error });
                }
            }

            if attempt >= max_attempts {
                warn!("giving up after {} attempts: {:#}", attempt, error);
                return Err(RetryError::Exhausted { attempts: attempt, last_error: error });
            }

            let delay = self.policy.jittered_delay(attempt);
            if let Some(observer) = &self.on_retry {
                observer(&error, attempt, delay);
            }
            debug!("attempt {} failed, retrying in {:?}: {:#}", attempt, delay, error);

            match &self.cancel {
                Some(token) => {
                    tokio::select! {
                        biased;
                        _ = token.cancelled() => return Err(RetryError::Aborted { attempts: attempt }),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                None => tokio::time::sleep(delay).await,
            }
        }
    }

    fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().map(|t| t.is_cancelled()).unwrap_or(false)
    }
}

/// Retry `operation` under `policy` with no predicate, observer or cancellation.
pub async fn retry<F, Fut, T>(policy: &RetryPolicy, operation: F) -> Result<RetryOutcome<T>, RetryError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = anyhow::Result<T>>,
{
    Retry::new(policy.clone()).run(operation).await
}
