//! Point-in-time snapshots of queue and batch state.

use std::fmt;

use serde::Serialize;

/// Snapshot of a [`TaskQueue`](crate::TaskQueue).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    /// Configured number of slots.
    pub concurrency: usize,
    /// Slots not held by any task.
    pub available: usize,
    /// Tasks holding a slot.
    pub running: usize,
    /// Tasks waiting for a slot.
    pub pending: usize,
    /// Tasks that finished (successfully or not) since the queue was created.
    pub completed: u64,
}

impl fmt::Display for QueueStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "QueueStats {{ running: {}/{}, pending: {}, completed: {} }}",
            self.running, self.concurrency, self.pending, self.completed
        )
    }
}

/// Snapshot of a [`Batch`](crate::Batch).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BatchStats {
    /// Tasks added and not yet settled, including those still waiting to be submitted.
    pub running: usize,
    /// Failures recorded so far.
    pub failed: usize,
    /// Tasks that panicked.
    pub panicked: usize,
    pub max_queue_length: usize,
    pub queue: QueueStats,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_stats_display() {
        let stats = QueueStats {
            concurrency: 4,
            available: 1,
            running: 3,
            pending: 7,
            completed: 12,
        };
        let display = stats.to_string();
        assert!(display.contains("running: 3/4"));
        assert!(display.contains("pending: 7"));
    }

    #[test]
    fn batch_stats_serialize() {
        let stats = BatchStats {
            running: 2,
            failed: 1,
            panicked: 0,
            max_queue_length: 3,
            queue: QueueStats {
                concurrency: 3,
                available: 1,
                running: 2,
                pending: 0,
                completed: 5,
            },
        };
        let json = serde_json::to_value(&stats).unwrap();
        assert_eq!(json["failed"], 1);
        assert_eq!(json["queue"]["completed"], 5);
    }
}
