//! Concurrency-bounded task queue.
//!
//! Wraps one [`AdmissionSemaphore`]. Every task holds a slot while it runs
//! and gives it back when it finishes, fails, panics, or is dropped. After
//! each release the queue wakes idle waiters (no slot held) and
//! queue-length waiters whose threshold is now above the number of waiting
//! plus running tasks.

use std::fmt;
use std::future::Future;
use std::num::NonZeroUsize;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};

use futures::future::FusedFuture;
use gate_core::QueueConfig;
use tokio::sync::oneshot;
use tracing::{debug, error, warn};

use crate::error::QueueError;
use crate::heap::PriorityHeap;
use crate::semaphore::{Acquire, AdmissionSemaphore, Priority, SlotId};
use crate::stats::QueueStats;

/// Per-task submission options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EnqueueOptions {
    /// Higher runs first when tasks are waiting. Default 0.
    pub priority: Priority,
}

impl EnqueueOptions {
    pub fn priority(priority: Priority) -> Self {
        Self { priority }
    }
}

struct ThresholdWaiter {
    threshold: usize,
    ack: oneshot::Sender<()>,
}

struct Signals {
    idle: Vec<oneshot::Sender<()>>,
    /// Smallest threshold on top.
    thresholds: PriorityHeap<ThresholdWaiter>,
}

struct QueueInner {
    semaphore: AdmissionSemaphore,
    // Held while registering waiters and while notifying after a release,
    // so a release can't slip between a check and a registration.
    signals: Mutex<Signals>,
    completed: AtomicU64,
}

impl QueueInner {
    fn signals(&self) -> MutexGuard<'_, Signals> {
        self.signals.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn release(&self, slot: SlotId) {
        let mut signals = self.signals();
        self.semaphore.release(slot);
        self.completed.fetch_add(1, Ordering::Relaxed);
        self.notify(&mut signals);
    }

    fn withdraw(&self, acquire: &mut Acquire) {
        let mut signals = self.signals();
        if let Some(slot) = acquire.cancel() {
            self.semaphore.release(slot);
        }
        self.notify(&mut signals);
    }

    fn notify(&self, signals: &mut Signals) {
        let occupancy = self.semaphore.occupancy();
        if occupancy.is_idle() && !signals.idle.is_empty() {
            debug!(waiters = signals.idle.len(), "queue idle");
            for ack in signals.idle.drain(..) {
                let _ = ack.send(());
            }
        }

        let length = occupancy.outstanding();
        while signals
            .thresholds
            .peek()
            .is_some_and(|waiter| waiter.threshold > length)
        {
            if let Some(waiter) = signals.thresholds.remove_max() {
                let _ = waiter.ack.send(());
            }
        }
    }
}

/// A queue running at most `concurrency` tasks at a time, highest priority first.
///
/// Cloning gives another handle to the same queue.
#[derive(Clone)]
pub struct TaskQueue {
    inner: Arc<QueueInner>,
}

impl TaskQueue {
    /// Create a queue. A concurrency of 0 falls back to the default.
    pub fn new(config: &QueueConfig) -> Self {
        let concurrency =
            NonZeroUsize::new(config.resolved_concurrency()).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: Arc::new(QueueInner {
                semaphore: AdmissionSemaphore::with_permits(concurrency),
                signals: Mutex::new(Signals {
                    idle: Vec::new(),
                    thresholds: PriorityHeap::new(|a: &ThresholdWaiter, b: &ThresholdWaiter| {
                        Some(b.threshold.cmp(&a.threshold))
                    }),
                }),
                completed: AtomicU64::new(0),
            }),
        }
    }

    pub fn with_concurrency(concurrency: usize) -> Self {
        Self::new(&QueueConfig::with_concurrency(concurrency))
    }

    pub fn concurrency(&self) -> usize {
        self.inner.semaphore.permits()
    }

    /// Tasks waiting for a slot plus tasks running.
    pub fn len(&self) -> usize {
        self.inner.semaphore.occupancy().outstanding()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Tasks waiting for a slot.
    pub fn pending(&self) -> usize {
        self.inner.semaphore.queue_length()
    }

    /// Tasks holding a slot.
    pub fn running(&self) -> usize {
        self.inner.semaphore.in_flight()
    }

    /// No slot is held.
    pub fn is_idle(&self) -> bool {
        self.inner.semaphore.is_idle()
    }

    pub fn stats(&self) -> QueueStats {
        let occupancy = self.inner.semaphore.occupancy();
        QueueStats {
            concurrency: occupancy.permits,
            available: occupancy.available,
            running: occupancy.in_flight(),
            pending: occupancy.waiting,
            completed: self.inner.completed.load(Ordering::Relaxed),
        }
    }

    /// Run `task` once a slot is free and return its output.
    ///
    /// The task is queued when this method is called, not when the returned
    /// future is first polled. Its slot is released before the output is
    /// handed back, whatever the output is. Dropping the future before the
    /// task finishes withdraws it or releases its slot.
    pub fn run<F, Fut>(
        &self,
        task: F,
        options: EnqueueOptions,
    ) -> impl Future<Output = Result<Fut::Output, QueueError>>
    where
        F: FnOnce() -> Fut,
        Fut: Future,
    {
        run_admitted(self.admit(options.priority), task)
    }

    /// [`run`](Self::run), but only if fewer than `n` tasks are waiting or
    /// running. The length check and the registration happen under one
    /// lock, so concurrent callers can't overshoot `n`. Hands the task back
    /// when the queue is too long.
    pub(crate) fn run_if_shorter_than<F, Fut>(
        &self,
        n: usize,
        task: F,
        options: EnqueueOptions,
    ) -> Result<impl Future<Output = Result<Fut::Output, QueueError>>, F>
    where
        F: FnOnce() -> Fut,
        Fut: Future,
    {
        let signals = self.inner.signals();
        if self.len() >= n {
            return Err(task);
        }
        let admission = self.admit(options.priority);
        drop(signals);
        Ok(run_admitted(admission, task))
    }

    /// Fire-and-forget [`run`](Self::run) on the current tokio runtime.
    ///
    /// Failures are logged, never returned; a panicking task is contained
    /// by the runtime and its slot is still released.
    pub fn add<F, Fut, T, E>(&self, task: F, options: EnqueueOptions)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: fmt::Display + Send + 'static,
    {
        let run = self.run(task, options);
        tokio::spawn(async move {
            match run.await {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => warn!(error = %e, "queued task failed"),
                Err(e) => error!(error = %e, "queued task was not admitted"),
            }
        });
    }

    /// Resolves once no task holds a slot; immediately if that is already so.
    pub async fn on_idle(&self) {
        let rx = {
            let mut signals = self.inner.signals();
            if self.inner.semaphore.is_idle() {
                return;
            }
            let (ack, rx) = oneshot::channel();
            signals.idle.push(ack);
            rx
        };
        let _ = rx.await;
    }

    /// Resolves once fewer than `n` tasks are waiting or running.
    ///
    /// `n == 0` is treated as already satisfied.
    pub async fn on_queue_less_than(&self, n: usize) {
        if n == 0 {
            return;
        }
        let rx = {
            let mut signals = self.inner.signals();
            let length = self.len();
            if length < n {
                return;
            }
            let (ack, rx) = oneshot::channel();
            if signals
                .thresholds
                .push(ThresholdWaiter { threshold: n, ack })
                .is_err()
            {
                error!(threshold = n, "could not register queue-length waiter");
                return;
            }
            debug!(threshold = n, length, "waiting for queue to shrink");
            rx
        };
        let _ = rx.await;
    }

    fn admit(&self, priority: Priority) -> Admission {
        Admission {
            queue: Arc::clone(&self.inner),
            acquire: self.inner.semaphore.acquire(priority),
        }
    }
}

fn run_admitted<F, Fut>(
    admission: Admission,
    task: F,
) -> impl Future<Output = Result<Fut::Output, QueueError>>
where
    F: FnOnce() -> Fut,
    Fut: Future,
{
    async move {
        let permit = admission.await?;
        let output = task().await;
        drop(permit);
        Ok(output)
    }
}

impl Default for TaskQueue {
    fn default() -> Self {
        Self::new(&QueueConfig::default())
    }
}

impl fmt::Debug for TaskQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskQueue")
            .field("semaphore", &self.inner.semaphore)
            .finish()
    }
}

/// Pending admission of one task.
struct Admission {
    queue: Arc<QueueInner>,
    acquire: Acquire,
}

impl Future for Admission {
    type Output = Result<SlotGuard, QueueError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        Pin::new(&mut this.acquire).poll(cx).map(|granted| {
            granted.map(|slot| SlotGuard {
                queue: Arc::clone(&this.queue),
                slot,
            })
        })
    }
}

impl Drop for Admission {
    fn drop(&mut self) {
        if !self.acquire.is_terminated() {
            self.queue.withdraw(&mut self.acquire);
        }
    }
}

/// Slot held by a running task; released on drop.
struct SlotGuard {
    queue: Arc<QueueInner>,
    slot: SlotId,
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        self.queue.release(self.slot);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;

    #[test]
    fn zero_concurrency_uses_default() {
        let queue = TaskQueue::with_concurrency(0);
        assert_eq!(queue.concurrency(), gate_core::DEFAULT_QUEUE_CONCURRENCY);
        assert_eq!(TaskQueue::default().concurrency(), gate_core::DEFAULT_QUEUE_CONCURRENCY);
    }

    #[test]
    fn run_registers_before_first_poll() {
        let queue = TaskQueue::with_concurrency(1);
        let first = queue.run(|| async { 1 }, EnqueueOptions::default());
        let second = queue.run(|| async { 2 }, EnqueueOptions::default());
        assert_eq!(queue.running(), 1);
        assert_eq!(queue.pending(), 1);
        assert_eq!(queue.len(), 2);

        assert_eq!(first.now_or_never().unwrap().unwrap(), 1);
        assert_eq!(second.now_or_never().unwrap().unwrap(), 2);
        assert!(queue.is_idle());
        assert_eq!(queue.stats().completed, 2);
    }

    #[test]
    fn dropping_unpolled_run_frees_its_place() {
        let queue = TaskQueue::with_concurrency(1);
        let first = queue.run(|| async {}, EnqueueOptions::default());
        let second = queue.run(|| async {}, EnqueueOptions::default());
        drop(second);
        assert_eq!(queue.pending(), 0);
        drop(first);
        assert!(queue.is_idle());
        assert_eq!(queue.stats().completed, 0);
    }

    #[test]
    fn run_if_shorter_than_hands_back_the_task() {
        let queue = TaskQueue::with_concurrency(1);
        let first = queue
            .run_if_shorter_than(1, || async { 1 }, EnqueueOptions::default())
            .ok()
            .unwrap();
        assert_eq!(queue.len(), 1);

        let rejected = queue.run_if_shorter_than(1, || async { 2 }, EnqueueOptions::default());
        let task = match rejected {
            Ok(_) => panic!("queue of length 1 admitted past a bound of 1"),
            Err(task) => task,
        };
        assert_eq!(queue.len(), 1);

        assert_eq!(first.now_or_never().unwrap().unwrap(), 1);
        let second = queue
            .run_if_shorter_than(1, task, EnqueueOptions::default())
            .ok()
            .unwrap();
        assert_eq!(second.now_or_never().unwrap().unwrap(), 2);
        assert!(queue.is_idle());
    }

    #[test]
    fn stats_reflect_occupancy() {
        let queue = TaskQueue::with_concurrency(2);
        let _a = queue.run(|| async {}, EnqueueOptions::default());
        let _b = queue.run(|| async {}, EnqueueOptions::default());
        let _c = queue.run(|| async {}, EnqueueOptions::priority(3));
        let stats = queue.stats();
        assert_eq!(stats.concurrency, 2);
        assert_eq!(stats.available, 0);
        assert_eq!(stats.running, 2);
        assert_eq!(stats.pending, 1);
    }
}
