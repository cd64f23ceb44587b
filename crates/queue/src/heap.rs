//! Binary max-heap ordered by a caller-supplied, fallible comparator.
//!
//! The comparator returns `None` when it cannot order a pair. A failed
//! comparison aborts the operation in progress and never leaves a
//! half-inserted entry behind.

use std::cmp::Ordering;
use std::fmt;

use crate::error::Incomparable;

type CompareFn<T> = Box<dyn Fn(&T, &T) -> Option<Ordering> + Send + Sync>;

/// Dense binary max-heap: the entry the comparator ranks highest is
/// retrieved first.
pub struct PriorityHeap<T> {
    entries: Vec<T>,
    compare: CompareFn<T>,
}

impl<T> PriorityHeap<T> {
    pub fn new<F>(compare: F) -> Self
    where
        F: Fn(&T, &T) -> Option<Ordering> + Send + Sync + 'static,
    {
        Self {
            entries: Vec::new(),
            compare: Box::new(compare),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The highest-ranked entry, without removing it.
    pub fn peek(&self) -> Option<&T> {
        self.entries.first()
    }

    /// Entries in storage order (not priority order).
    pub fn iter(&self) -> std::slice::Iter<'_, T> {
        self.entries.iter()
    }

    /// Insert an entry.
    ///
    /// The final position is located before anything is moved, so a failing
    /// (or panicking) comparator leaves the heap exactly as it was.
    pub fn push(&mut self, entry: T) -> Result<(), Incomparable<T>> {
        let mut target = self.entries.len();
        while target > 0 {
            let parent = (target - 1) / 2;
            match (self.compare)(&self.entries[parent], &entry) {
                Some(Ordering::Less) => target = parent,
                Some(_) => break,
                None => return Err(Incomparable(entry)),
            }
        }

        let mut index = self.entries.len();
        self.entries.push(entry);
        while index > target {
            let parent = (index - 1) / 2;
            self.entries.swap(index, parent);
            index = parent;
        }
        Ok(())
    }

    /// Remove and return the highest-ranked entry.
    pub fn remove_max(&mut self) -> Option<T> {
        if self.entries.len() <= 1 {
            return self.entries.pop();
        }
        let max = self.entries.swap_remove(0);
        self.sift_down(0);
        Some(max)
    }

    /// Keep only the entries matching `keep`, then restore heap order.
    pub fn retain<F>(&mut self, keep: F)
    where
        F: FnMut(&T) -> bool,
    {
        let before = self.entries.len();
        self.entries.retain(keep);
        if self.entries.len() == before {
            return;
        }
        for index in (0..self.entries.len() / 2).rev() {
            self.sift_down(index);
        }
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    fn greater(&self, a: usize, b: usize) -> bool {
        (self.compare)(&self.entries[a], &self.entries[b]) == Some(Ordering::Greater)
    }

    // Stops as soon as no child is strictly greater, including when the
    // comparator cannot decide.
    fn sift_down(&mut self, mut index: usize) {
        let len = self.entries.len();
        loop {
            let left = 2 * index + 1;
            let right = left + 1;
            if left >= len {
                break;
            }

            let mut swap = self.greater(left, index).then_some(left);
            if right < len {
                let pick_right = match swap {
                    None => self.greater(right, index),
                    Some(left) => self.greater(right, left),
                };
                if pick_right {
                    swap = Some(right);
                }
            }

            match swap {
                Some(child) => {
                    self.entries.swap(index, child);
                    index = child;
                }
                None => break,
            }
        }
    }
}

impl<T: Ord + 'static> PriorityHeap<T> {
    /// Heap using the natural ordering of `T`.
    pub fn from_ord() -> Self {
        Self::new(|a: &T, b: &T| Some(a.cmp(b)))
    }
}

impl<T: fmt::Debug> fmt::Debug for PriorityHeap<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PriorityHeap")
            .field("entries", &self.entries)
            .finish_non_exhaustive()
    }
}
