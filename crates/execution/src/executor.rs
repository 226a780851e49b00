//! Bounded executor - caps how much work runs at once.

use crate::error::ExecutorError;
use conductor_core::Priority;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::runtime::Handle;
use tokio::sync::{oneshot, watch};
use tracing::{debug, warn};

/// What to do with a queued item once it leaves the queue.
enum Dispatch {
    Start,
    Reject(ExecutorError),
}

/// Type-erased work item. Returns the future to drive when started.
type Job = Box<dyn FnOnce(Dispatch) -> Option<BoxFuture<'static, ()>> + Send>;

struct QueuedWork {
    priority: Priority,
    seq: u64,
    job: Job,
}

struct PoolState {
    concurrency: usize,
    active: usize,
    paused: bool,
    queue: Vec<QueuedWork>,
    next_seq: u64,
}

impl PoolState {
    fn outstanding(&self) -> usize {
        self.active + self.queue.len()
    }
}

struct Shared {
    state: Mutex<PoolState>,
    /// active + queued, for `drain`
    outstanding: watch::Sender<usize>,
}

/// Executor statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutorStats {
    /// Work items currently running
    pub active: usize,
    /// Work items waiting for a slot
    pub queued: usize,
    /// Configured concurrency
    pub concurrency: usize,
    /// Whether starting new work is paused
    pub paused: bool,
}

/// Runs scheduled work with at most `concurrency` items in flight.
///
/// Each started item runs in its own Tokio task. Waiting items start in
/// descending priority order, ties in scheduling order. Cloning yields
/// another handle to the same pool.
#[derive(Clone)]
pub struct BoundedExecutor {
    shared: Arc<Shared>,
}

impl BoundedExecutor {
    /// Create an executor with the given concurrency.
    pub fn new(concurrency: NonZeroUsize) -> Self {
        let (outstanding, _) = watch::channel(0);
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(PoolState {
                    concurrency: concurrency.get(),
                    active: 0,
                    paused: false,
                    queue: Vec::new(),
                    next_seq: 0,
                }),
                outstanding,
            }),
        }
    }

    /// Schedule `work` at `priority`.
    ///
    /// The item is queued before this returns. The returned future settles
    /// with the work's own result, with [`ExecutorError::PoolCleared`] if the
    /// item is discarded by [`clear`](Self::clear), or with
    /// [`ExecutorError::Abandoned`] if the work panics.
    pub fn schedule<F, Fut, T, E>(
        &self,
        priority: impl Into<Priority>,
        work: F,
    ) -> impl Future<Output = Result<T, E>> + Send + 'static
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: From<ExecutorError> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel::<Result<T, E>>();

        let job: Job = Box::new(move |dispatch| match dispatch {
            Dispatch::Start => Some(Box::pin(async move {
                let result = work().await;
                let _ = tx.send(result);
            })),
            Dispatch::Reject(err) => {
                let _ = tx.send(Err(E::from(err)));
                None
            }
        });

        {
            let mut state = self.lock();
            let seq = state.next_seq;
            state.next_seq += 1;
            state.queue.push(QueuedWork {
                priority: priority.into(),
                seq,
                job,
            });
            self.publish(&state);
        }

        self.fill_slots();

        async move {
            match rx.await {
                Ok(result) => result,
                Err(_) => Err(E::from(ExecutorError::Abandoned)),
            }
        }
    }

    /// Stop starting new work. Running work continues.
    pub fn pause(&self) {
        self.lock().paused = true;
        debug!("executor paused");
    }

    /// Start new work again.
    pub fn resume(&self) {
        self.lock().paused = false;
        debug!("executor resumed");
        self.fill_slots();
    }

    /// Change the concurrency limit.
    pub fn set_concurrency(&self, concurrency: usize) -> Result<(), ExecutorError> {
        if concurrency == 0 {
            return Err(ExecutorError::InvalidConcurrency(concurrency));
        }

        self.lock().concurrency = concurrency;
        debug!("executor concurrency set to {}", concurrency);
        self.fill_slots();
        Ok(())
    }

    /// Reject every item that has not started with [`ExecutorError::PoolCleared`].
    ///
    /// Returns how many items were discarded. Running work is unaffected.
    pub fn clear(&self) -> usize {
        let discarded = {
            let mut state = self.lock();
            let discarded = std::mem::take(&mut state.queue);
            self.publish(&state);
            discarded
        };

        let count = discarded.len();
        for item in discarded {
            let _ = (item.job)(Dispatch::Reject(ExecutorError::PoolCleared));
        }

        if count > 0 {
            debug!("executor cleared {} queued items", count);
        }
        count
    }

    /// Wait until nothing is queued and nothing is running.
    pub async fn drain(&self) {
        let mut outstanding = self.shared.outstanding.subscribe();
        let _ = outstanding.wait_for(|n| *n == 0).await;
    }

    /// Current concurrency limit.
    pub fn concurrency(&self) -> usize {
        self.lock().concurrency
    }

    /// Whether starting new work is paused.
    pub fn is_paused(&self) -> bool {
        self.lock().paused
    }

    /// Get executor statistics.
    pub fn stats(&self) -> ExecutorStats {
        let state = self.lock();
        ExecutorStats {
            active: state.active,
            queued: state.queue.len(),
            concurrency: state.concurrency,
            paused: state.paused,
        }
    }

    /// Start as many queued items as there are free slots.
    fn fill_slots(&self) {
        let Ok(runtime) = Handle::try_current() else {
            warn!("no Tokio runtime available, queued work stays pending");
            return;
        };

        let started = {
            let mut state = self.lock();
            if state.paused || state.active >= state.concurrency || state.queue.is_empty() {
                return;
            }

            state
                .queue
                .sort_by(|a, b| b.priority.cmp(&a.priority).then_with(|| a.seq.cmp(&b.seq)));

            let free = (state.concurrency - state.active).min(state.queue.len());
            state.active += free;
            let started: Vec<QueuedWork> = state.queue.drain(..free).collect();
            debug!(
                "starting {} items ({} active, {} queued)",
                free,
                state.active,
                state.queue.len()
            );
            started
        };

        for item in started {
            let slot = SlotGuard {
                executor: self.clone(),
            };
            if let Some(run) = (item.job)(Dispatch::Start) {
                runtime.spawn(async move {
                    let _slot = slot;
                    run.await;
                });
            }
        }
    }

    fn release_slot(&self) {
        {
            let mut state = self.lock();
            state.active = state.active.saturating_sub(1);
            self.publish(&state);
        }
        self.fill_slots();
    }

    fn publish(&self, state: &PoolState) {
        self.shared.outstanding.send_replace(state.outstanding());
    }

    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.shared.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Frees a slot when the work finishes, fails or panics.
struct SlotGuard {
    executor: BoundedExecutor,
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        self.executor.release_slot();
    }
}
