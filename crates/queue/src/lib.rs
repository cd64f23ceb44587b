//! Concurrency-bounded task execution.
//!
//! - [`PriorityHeap`]: binary max-heap with a fallible comparator.
//! - [`AdmissionSemaphore`]: numbered slots granted highest priority first,
//!   oldest first within a priority.
//! - [`TaskQueue`]: runs tasks under a semaphore with idle and queue-length
//!   notifications.
//! - [`Batch`]: groups queued tasks with fail-fast or all-settled completion.

pub mod batch;
pub mod error;
pub mod heap;
pub mod semaphore;
pub mod stats;
pub mod task_queue;

pub use batch::Batch;
pub use error::{BatchErrors, Incomparable, QueueError};
pub use gate_core::{BatchConfig, QueueConfig, DEFAULT_QUEUE_CONCURRENCY};
pub use heap::PriorityHeap;
pub use semaphore::{Acquire, AdmissionSemaphore, Occupancy, Priority, SlotId};
pub use stats::{BatchStats, QueueStats};
pub use task_queue::{EnqueueOptions, TaskQueue};
