//! Queue error types.

use std::fmt;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("permits must be a positive integer, got {0}")]
    InvalidPermits(usize),

    #[error("admission channel closed before a slot was granted")]
    Closed,
}

/// Returned by [`PriorityHeap::push`](crate::PriorityHeap::push) when the
/// comparator cannot order the new entry. Carries the rejected entry back.
pub struct Incomparable<T>(pub T);

impl<T> Incomparable<T> {
    pub fn into_inner(self) -> T {
        self.0
    }
}

impl<T> fmt::Debug for Incomparable<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Incomparable(..)")
    }
}

impl<T> fmt::Display for Incomparable<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("comparator could not order heap entries")
    }
}

impl<T> std::error::Error for Incomparable<T> {}

/// Aggregate failure of a [`Batch`](crate::Batch): every task error, in the
/// order the tasks finished.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchErrors<E> {
    errors: Vec<E>,
}

impl<E> BatchErrors<E> {
    pub fn new(errors: Vec<E>) -> Self {
        Self { errors }
    }

    /// Task errors in completion order.
    pub fn errors(&self) -> &[E] {
        &self.errors
    }

    pub fn into_errors(self) -> Vec<E> {
        self.errors
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }
}

impl<E: fmt::Display> fmt::Display for BatchErrors<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "batch failed with {} errors", self.errors.len())?;
        if f.alternate() {
            for (i, e) in self.errors.iter().enumerate() {
                write!(f, "\n  #{i}: {e}")?;
            }
        }
        Ok(())
    }
}

impl<E: fmt::Debug + fmt::Display> std::error::Error for BatchErrors<E> {}
