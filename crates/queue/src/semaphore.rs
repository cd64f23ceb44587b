//! Priority-ordered admission semaphore.
//!
//! A fixed set of slots `0..permits`. When every slot is held, callers queue
//! as waiters in a [`PriorityHeap`] (highest priority first, oldest first
//! within a priority). A released slot is handed straight to the best waiter
//! and never becomes free in between, so a late `acquire` can't overtake a
//! queued one.

use std::future::Future;
use std::num::NonZeroUsize;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};

use futures::future::FusedFuture;
use tokio::sync::oneshot;
use tracing::{debug, error, trace};

use crate::error::QueueError;
use crate::heap::PriorityHeap;

/// Index of a slot, `0..permits`.
pub type SlotId = usize;

/// Admission priority. Higher runs first.
pub type Priority = i64;

struct Waiter {
    priority: Priority,
    sequence: u64,
    ack: oneshot::Sender<SlotId>,
}

fn waiter_order(a: &Waiter, b: &Waiter) -> std::cmp::Ordering {
    a.priority
        .cmp(&b.priority)
        .then_with(|| b.sequence.cmp(&a.sequence))
}

struct SemaphoreState {
    held: Vec<bool>,
    free: Vec<SlotId>,
    waiters: PriorityHeap<Waiter>,
    sequence: u64,
}

impl SemaphoreState {
    fn new(permits: usize) -> Self {
        Self {
            held: vec![false; permits],
            free: (0..permits).collect(),
            waiters: PriorityHeap::new(|a: &Waiter, b: &Waiter| Some(waiter_order(a, b))),
            sequence: 0,
        }
    }

    /// Returns `false` when `slot` was not held.
    fn release(&mut self, slot: SlotId) -> bool {
        if !self.held.get(slot).copied().unwrap_or(false) {
            return false;
        }
        while let Some(waiter) = self.waiters.remove_max() {
            match waiter.ack.send(slot) {
                Ok(()) => {
                    debug!(
                        slot,
                        priority = waiter.priority,
                        sequence = waiter.sequence,
                        "handed slot to waiter"
                    );
                    return true;
                }
                Err(_) => trace!(sequence = waiter.sequence, "skipping withdrawn waiter"),
            }
        }
        self.held[slot] = false;
        self.free.push(slot);
        true
    }

    /// Remove a still-queued waiter. Returns `false` if it was already served.
    fn withdraw(&mut self, sequence: u64) -> bool {
        let before = self.waiters.len();
        self.waiters.retain(|w| w.sequence != sequence);
        self.waiters.len() < before
    }
}

fn lock(state: &Mutex<SemaphoreState>) -> MutexGuard<'_, SemaphoreState> {
    // No caller code runs under this lock, so a poisoned state is still consistent.
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Held/free/waiting counts read under a single lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Occupancy {
    pub permits: usize,
    pub available: usize,
    pub waiting: usize,
}

impl Occupancy {
    pub fn in_flight(&self) -> usize {
        self.permits - self.available
    }

    /// Admissions currently waiting or running.
    pub fn outstanding(&self) -> usize {
        self.waiting + self.in_flight()
    }

    pub fn is_idle(&self) -> bool {
        self.available == self.permits
    }
}

/// Semaphore handing out numbered slots in priority order.
pub struct AdmissionSemaphore {
    permits: usize,
    state: Arc<Mutex<SemaphoreState>>,
}

impl AdmissionSemaphore {
    /// Create a semaphore with `permits` slots. Zero permits is rejected.
    pub fn new(permits: usize) -> Result<Self, QueueError> {
        NonZeroUsize::new(permits)
            .map(Self::with_permits)
            .ok_or(QueueError::InvalidPermits(permits))
    }

    pub fn with_permits(permits: NonZeroUsize) -> Self {
        let permits = permits.get();
        Self {
            permits,
            state: Arc::new(Mutex::new(SemaphoreState::new(permits))),
        }
    }

    pub fn permits(&self) -> usize {
        self.permits
    }

    pub fn available_permits(&self) -> usize {
        lock(&self.state).free.len()
    }

    /// Number of queued waiters.
    pub fn queue_length(&self) -> usize {
        lock(&self.state).waiters.len()
    }

    pub fn in_flight(&self) -> usize {
        self.permits - self.available_permits()
    }

    pub fn is_idle(&self) -> bool {
        self.available_permits() == self.permits
    }

    pub fn occupancy(&self) -> Occupancy {
        let state = lock(&self.state);
        Occupancy {
            permits: self.permits,
            available: state.free.len(),
            waiting: state.waiters.len(),
        }
    }

    /// Request a slot.
    ///
    /// The request is registered immediately: a free slot is taken right
    /// away, otherwise a waiter is queued. The returned future resolves with
    /// the slot. Dropping it withdraws the request, and a slot that was
    /// already granted to it goes back through [`release`](Self::release).
    pub fn acquire(&self, priority: Priority) -> Acquire {
        let mut state = lock(&self.state);
        let stage = match state.free.pop() {
            Some(slot) => {
                state.held[slot] = true;
                Stage::Granted(slot)
            }
            None => {
                let (ack, rx) = oneshot::channel();
                let sequence = state.sequence;
                state.sequence += 1;
                let waiter = Waiter {
                    priority,
                    sequence,
                    ack,
                };
                match state.waiters.push(waiter) {
                    Ok(()) => {
                        debug!(
                            priority,
                            sequence,
                            waiting = state.waiters.len(),
                            "no free slot, admission queued"
                        );
                        Stage::Waiting { sequence, rx }
                    }
                    Err(_) => {
                        error!(priority, sequence, "could not queue admission");
                        Stage::Closed
                    }
                }
            }
        };
        drop(state);

        Acquire {
            state: Arc::clone(&self.state),
            stage,
        }
    }

    /// Return a slot. Out-of-range or already-free slots are ignored.
    pub fn release(&self, slot: SlotId) {
        if !lock(&self.state).release(slot) {
            trace!(slot, "ignoring release of a slot that is not held");
        }
    }
}

impl std::fmt::Debug for AdmissionSemaphore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let occupancy = self.occupancy();
        f.debug_struct("AdmissionSemaphore")
            .field("permits", &occupancy.permits)
            .field("available", &occupancy.available)
            .field("waiting", &occupancy.waiting)
            .finish()
    }
}

enum Stage {
    Granted(SlotId),
    Waiting {
        sequence: u64,
        rx: oneshot::Receiver<SlotId>,
    },
    Closed,
    Done,
}

/// Future returned by [`AdmissionSemaphore::acquire`].
#[must_use = "futures do nothing unless you `.await` or poll them"]
pub struct Acquire {
    state: Arc<Mutex<SemaphoreState>>,
    stage: Stage,
}

impl Acquire {
    /// Withdraw the request.
    ///
    /// Returns a slot that was granted but not yet observed through the
    /// future; the caller then owns it and must release it.
    pub fn cancel(&mut self) -> Option<SlotId> {
        match std::mem::replace(&mut self.stage, Stage::Done) {
            Stage::Granted(slot) => Some(slot),
            Stage::Waiting { sequence, mut rx } => {
                let mut state = lock(&self.state);
                if state.withdraw(sequence) {
                    trace!(sequence, "admission withdrawn");
                    None
                } else {
                    // Hand-off happens under the lock, so the slot is already in the channel.
                    rx.close();
                    rx.try_recv().ok()
                }
            }
            Stage::Closed | Stage::Done => None,
        }
    }
}

impl Future for Acquire {
    type Output = Result<SlotId, QueueError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let polled = match &mut this.stage {
            Stage::Granted(slot) => Poll::Ready(Ok(*slot)),
            Stage::Waiting { rx, .. } => match Pin::new(rx).poll(cx) {
                Poll::Ready(result) => Poll::Ready(result.map_err(|_| QueueError::Closed)),
                Poll::Pending => Poll::Pending,
            },
            Stage::Closed | Stage::Done => Poll::Ready(Err(QueueError::Closed)),
        };
        if polled.is_ready() {
            this.stage = Stage::Done;
        }
        polled
    }
}

impl FusedFuture for Acquire {
    fn is_terminated(&self) -> bool {
        matches!(self.stage, Stage::Done)
    }
}

impl Drop for Acquire {
    fn drop(&mut self) {
        if let Some(slot) = self.cancel() {
            lock(&self.state).release(slot);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;

    fn ready(acquire: &mut Acquire) -> Option<SlotId> {
        acquire.now_or_never().map(|r| r.unwrap())
    }

    #[test]
    fn rejects_zero_permits() {
        let err = AdmissionSemaphore::new(0).unwrap_err();
        assert!(matches!(err, QueueError::InvalidPermits(0)));
    }

    #[test]
    fn free_slots_are_granted_immediately() {
        let sem = AdmissionSemaphore::new(3).unwrap();
        let mut slots: Vec<SlotId> = (0..3)
            .map(|_| sem.acquire(0).now_or_never().unwrap().unwrap())
            .collect();
        slots.sort_unstable();
        assert_eq!(slots, vec![0, 1, 2]);
        assert_eq!(sem.available_permits(), 0);
        assert_eq!(sem.in_flight(), 3);

        let mut blocked = sem.acquire(0);
        assert_eq!(ready(&mut blocked), None);
        assert_eq!(sem.queue_length(), 1);
    }

    #[test]
    fn dispatches_by_priority_then_submission_order() {
        let sem = AdmissionSemaphore::new(3).unwrap();
        let mut running = Vec::new();
        let mut pending = Vec::new();
        for priority in 1..=10 {
            let mut acquire = sem.acquire(priority);
            match ready(&mut acquire) {
                Some(slot) => running.push((priority, slot)),
                None => pending.push((priority, acquire)),
            }
        }
        let first: Vec<Priority> = running.iter().map(|(p, _)| *p).collect();
        assert_eq!(first, vec![1, 2, 3]);
        assert_eq!(sem.queue_length(), 7);

        let mut order = Vec::new();
        let mut slot = running[0].1;
        while !pending.is_empty() {
            sem.release(slot);
            let granted: Vec<usize> = pending
                .iter_mut()
                .enumerate()
                .filter_map(|(i, (_, acquire))| ready(acquire).map(|s| {
                    slot = s;
                    i
                }))
                .collect();
            assert_eq!(granted.len(), 1, "exactly one waiter is served per release");
            let (priority, _) = pending.remove(granted[0]);
            order.push(priority);
        }
        assert_eq!(order, vec![10, 9, 8, 7, 6, 5, 4]);
    }

    #[test]
    fn equal_priorities_are_fifo() {
        let sem = AdmissionSemaphore::new(1).unwrap();
        let slot = sem.acquire(0).now_or_never().unwrap().unwrap();
        let mut a = sem.acquire(5);
        let mut b = sem.acquire(5);
        let mut c = sem.acquire(5);

        sem.release(slot);
        let slot = ready(&mut a).unwrap();
        assert_eq!(ready(&mut b), None);
        sem.release(slot);
        let slot = ready(&mut b).unwrap();
        assert_eq!(ready(&mut c), None);
        sem.release(slot);
        assert!(ready(&mut c).is_some());
    }

    #[test]
    fn double_release_is_harmless() {
        let sem = AdmissionSemaphore::new(2).unwrap();
        let slot = sem.acquire(0).now_or_never().unwrap().unwrap();
        sem.release(slot);
        sem.release(slot);
        sem.release(99);
        assert_eq!(sem.available_permits(), 2);
        assert!(sem.is_idle());
    }

    #[test]
    fn handed_slot_skips_the_free_set() {
        let sem = AdmissionSemaphore::new(1).unwrap();
        let slot = sem.acquire(0).now_or_never().unwrap().unwrap();
        let mut low = sem.acquire(1);

        sem.release(slot);
        assert_eq!(sem.available_permits(), 0);

        // A later, higher-priority request can't steal the handed-over slot.
        let mut late = sem.acquire(100);
        assert_eq!(ready(&mut late), None);
        assert_eq!(ready(&mut low), Some(slot));
        assert_eq!(sem.available_permits() + sem.in_flight(), sem.permits());
    }

    #[test]
    fn dropping_a_waiter_withdraws_it() {
        let sem = AdmissionSemaphore::new(1).unwrap();
        let slot = sem.acquire(0).now_or_never().unwrap().unwrap();
        let waiter = sem.acquire(0);
        assert_eq!(sem.queue_length(), 1);

        drop(waiter);
        assert_eq!(sem.queue_length(), 0);
        sem.release(slot);
        assert!(sem.is_idle());
    }

    #[test]
    fn dropping_a_granted_waiter_returns_the_slot() {
        let sem = AdmissionSemaphore::new(1).unwrap();
        let slot = sem.acquire(0).now_or_never().unwrap().unwrap();
        let waiter = sem.acquire(0);
        let mut next = sem.acquire(0);

        sem.release(slot);
        // `waiter` now owns the slot without having observed it.
        drop(waiter);
        assert_eq!(ready(&mut next), Some(slot));
        sem.release(slot);
        assert!(sem.is_idle());
    }

    #[test]
    fn cancel_hands_back_an_unobserved_slot() {
        let sem = AdmissionSemaphore::new(1).unwrap();
        let mut acquire = sem.acquire(0);
        let slot = acquire.cancel().unwrap();
        assert!(acquire.is_terminated());
        assert_eq!(sem.available_permits(), 0);
        sem.release(slot);
        assert!(sem.is_idle());
    }

    #[tokio::test]
    async fn never_grants_a_slot_twice() {
        let sem = Arc::new(AdmissionSemaphore::new(3).unwrap());
        let holders = Arc::new(Mutex::new(vec![false; 3]));

        let handles: Vec<_> = (0..40)
            .map(|i| {
                let sem = Arc::clone(&sem);
                let holders = Arc::clone(&holders);
                tokio::spawn(async move {
                    let slot = sem.acquire(i % 4).await.unwrap();
                    {
                        let mut h = holders.lock().unwrap();
                        assert!(!h[slot], "slot {slot} granted twice");
                        h[slot] = true;
                    }
                    tokio::task::yield_now().await;
                    holders.lock().unwrap()[slot] = false;
                    sem.release(slot);
                })
            })
            .collect();

        for handle in handles {
            handle.await.unwrap();
        }
        assert!(sem.is_idle());
        assert_eq!(sem.queue_length(), 0);
    }
}
