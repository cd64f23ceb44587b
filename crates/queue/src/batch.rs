//! Batch execution over a [`TaskQueue`].
//!
//! A [`Batch`] treats many queued tasks as one operation. Submissions wait
//! while the queue is full (`max_queue_length` waiting plus running tasks),
//! every task failure is recorded in completion order, and callers pick a
//! completion contract:
//!
//! - [`Batch::fail_fast`] reports the first failure as soon as it happens.
//! - [`Batch::all_settled`] waits for every task and reports all failures
//!   together as [`BatchErrors`].
//!
//! A task that panics fails the batch too: both contracts re-raise its panic.

use std::any::Any;
use std::fmt;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::FutureExt;
use gate_core::BatchConfig;
use tokio::sync::oneshot;
use tracing::{debug, error, warn};

use crate::error::BatchErrors;
use crate::stats::BatchStats;
use crate::task_queue::{EnqueueOptions, TaskQueue};

type PanicPayload = Box<dyn Any + Send>;

enum Outcome<E> {
    Succeeded,
    Failed(E),
    Panicked(PanicPayload),
    /// Never queued, or never admitted.
    Abandoned,
}

struct BatchState<E> {
    errors: Vec<E>,
    panicked: usize,
    /// First panic not yet re-raised to an observer.
    panic: Option<PanicPayload>,
    running: usize,
    fail_fast: Vec<oneshot::Sender<()>>,
    all_settled: Vec<oneshot::Sender<()>>,
}

impl<E> BatchState<E> {
    fn has_failed(&self) -> bool {
        self.panicked > 0 || !self.errors.is_empty()
    }

    fn take_panic(&mut self) -> Option<PanicPayload> {
        if self.panicked == 0 {
            return None;
        }
        Some(
            self.panic
                .take()
                .unwrap_or_else(|| Box::new("a batch task panicked")),
        )
    }
}

struct BatchInner<E> {
    queue: TaskQueue,
    max_queue_length: usize,
    state: Mutex<BatchState<E>>,
}

impl<E: Clone> BatchInner<E> {
    fn state(&self) -> MutexGuard<'_, BatchState<E>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn settle(&self, outcome: Outcome<E>) {
        let mut guard = self.state();
        let state = &mut *guard;

        let failed = match outcome {
            Outcome::Succeeded | Outcome::Abandoned => false,
            Outcome::Failed(error) => {
                state.errors.push(error);
                true
            }
            Outcome::Panicked(payload) => {
                state.panicked += 1;
                if state.panic.is_none() {
                    state.panic = Some(payload);
                }
                true
            }
        };
        if failed {
            for ack in state.fail_fast.drain(..) {
                let _ = ack.send(());
            }
        }

        state.running = state.running.saturating_sub(1);
        debug!(
            running = state.running,
            failed = state.errors.len(),
            panicked = state.panicked,
            "batch task settled"
        );
        if state.running > 0 {
            return;
        }
        for ack in state.fail_fast.drain(..).chain(state.all_settled.drain(..)) {
            let _ = ack.send(());
        }
    }

    /// Read a verdict from the current state, re-raising a recorded task
    /// panic instead. The lock is released before unwinding.
    fn verdict<T>(&self, read: impl FnOnce(&BatchState<E>) -> T) -> T {
        let (payload, verdict) = {
            let mut state = self.state();
            (state.take_panic(), read(&*state))
        };
        if let Some(payload) = payload {
            panic::resume_unwind(payload);
        }
        verdict
    }
}

/// One task's place in the batch, from `add` until it settles.
///
/// Dropped unsettled when the caller abandons `add` before the task was
/// queued; it then settles without an outcome.
struct Ticket<E: Clone> {
    batch: Option<Arc<BatchInner<E>>>,
}

impl<E: Clone> Ticket<E> {
    fn issue(batch: &Arc<BatchInner<E>>) -> Self {
        batch.state().running += 1;
        Self {
            batch: Some(Arc::clone(batch)),
        }
    }

    fn settle(mut self, outcome: Outcome<E>) {
        if let Some(batch) = self.batch.take() {
            batch.settle(outcome);
        }
    }
}

impl<E: Clone> Drop for Ticket<E> {
    fn drop(&mut self) {
        if let Some(batch) = self.batch.take() {
            debug!("batch submission abandoned before it was queued");
            batch.settle(Outcome::Abandoned);
        }
    }
}

/// A group of tasks sharing one [`TaskQueue`] and one failure record.
///
/// Cloning gives another handle to the same batch.
pub struct Batch<E> {
    inner: Arc<BatchInner<E>>,
}

impl<E> Clone for Batch<E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<E> Batch<E>
where
    E: Clone + Send + 'static,
{
    pub fn new(config: &BatchConfig) -> Self {
        Self {
            inner: Arc::new(BatchInner {
                queue: TaskQueue::new(&config.queue()),
                max_queue_length: config.resolved_max_queue_length(),
                state: Mutex::new(BatchState {
                    errors: Vec::new(),
                    panicked: 0,
                    panic: None,
                    running: 0,
                    fail_fast: Vec::new(),
                    all_settled: Vec::new(),
                }),
            }),
        }
    }

    pub fn with_concurrency(concurrency: usize) -> Self {
        Self::new(&BatchConfig::with_concurrency(concurrency))
    }

    /// Submissions wait while the queue holds this many tasks.
    pub fn max_queue_length(&self) -> usize {
        self.inner.max_queue_length
    }

    pub fn queue(&self) -> &TaskQueue {
        &self.inner.queue
    }

    /// Tasks added and not yet settled.
    pub fn running(&self) -> usize {
        self.inner.state().running
    }

    /// Failures recorded so far, in completion order.
    pub fn errors(&self) -> Vec<E> {
        self.inner.state().errors.clone()
    }

    pub fn stats(&self) -> BatchStats {
        let (running, failed, panicked) = {
            let state = self.inner.state();
            (state.running, state.errors.len(), state.panicked)
        };
        BatchStats {
            running,
            failed,
            panicked,
            max_queue_length: self.inner.max_queue_length,
            queue: self.inner.queue.stats(),
        }
    }

    /// Add a task to the batch.
    ///
    /// Counts the task as running at once, then waits until the queue holds
    /// fewer than [`max_queue_length`](Self::max_queue_length) tasks before
    /// submitting it. The bound holds across concurrent producers: a
    /// producer woken after another one refilled the queue waits again.
    /// Returns after submission; the outcome is collected in the background
    /// on the current tokio runtime.
    pub async fn add<F, Fut, T>(&self, task: F, options: EnqueueOptions)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        T: Send + 'static,
    {
        let ticket = Ticket::issue(&self.inner);
        let max = self.inner.max_queue_length;
        let queue = &self.inner.queue;

        let mut task = task;
        let run = loop {
            queue.on_queue_less_than(max).await;
            match queue.run_if_shorter_than(max, task, options) {
                Ok(run) => break run,
                Err(rejected) => {
                    debug!(max_queue_length = max, "queue refilled before submission");
                    task = rejected;
                }
            }
        };

        tokio::spawn(async move {
            let outcome = match AssertUnwindSafe(run).catch_unwind().await {
                Ok(Ok(Ok(_))) => Outcome::Succeeded,
                Ok(Ok(Err(e))) => Outcome::Failed(e),
                Ok(Err(e)) => {
                    error!(error = %e, "batch task was not admitted");
                    Outcome::Abandoned
                }
                Err(payload) => {
                    warn!("batch task panicked");
                    Outcome::Panicked(payload)
                }
            };
            ticket.settle(outcome);
        });
    }

    /// Resolve with the first failure as soon as one is recorded, or with
    /// `Ok(())` once every task finished cleanly.
    ///
    /// # Panics
    ///
    /// Re-raises the panic of a batch task that panicked, like awaiting a
    /// panicked task's `JoinHandle` would report it. Only the first observer
    /// gets the original payload.
    pub async fn fail_fast(&self) -> Result<(), E> {
        let rx = {
            let mut state = self.inner.state();
            if state.has_failed() || state.running == 0 {
                None
            } else {
                let (ack, rx) = oneshot::channel();
                state.fail_fast.push(ack);
                Some(rx)
            }
        };
        if let Some(rx) = rx {
            let _ = rx.await;
        }
        self.inner
            .verdict(|state| state.errors.first().cloned().map_or(Ok(()), Err))
    }

    /// Wait until every task settled, then fail with all recorded failures
    /// if there were any.
    ///
    /// # Panics
    ///
    /// Re-raises a batch task's panic, as [`fail_fast`](Self::fail_fast) does.
    pub async fn all_settled(&self) -> Result<(), BatchErrors<E>> {
        let rx = {
            let mut state = self.inner.state();
            if state.running == 0 {
                None
            } else {
                let (ack, rx) = oneshot::channel();
                state.all_settled.push(ack);
                Some(rx)
            }
        };
        if let Some(rx) = rx {
            let _ = rx.await;
        }
        self.inner.verdict(|state| settled(state.errors.clone()))
    }
}

fn settled<E>(errors: Vec<E>) -> Result<(), BatchErrors<E>> {
    if errors.is_empty() {
        Ok(())
    } else {
        Err(BatchErrors::new(errors))
    }
}

impl<E> fmt::Debug for Batch<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Batch")
            .field("queue", &self.inner.queue)
            .field("max_queue_length", &self.inner.max_queue_length)
            .finish_non_exhaustive()
    }
}
