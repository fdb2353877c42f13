//! Deadline-ordered timeout queue
//!
//! Timeouts live in a min-heap keyed by `(deadline, handle)`, so entries with
//! equal deadlines fire in the order they were scheduled. Cancellation removes
//! the callback and leaves the heap entry to be skipped when it surfaces, or
//! dropped when the heap is compacted.

use super::{Callback, TimeoutHandle};
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct TimerEntry {
    deadline: Instant,
    handle: TimeoutHandle,
}

// Rebuild the heap once cancelled entries clearly outnumber live ones
const COMPACT_FACTOR: usize = 2;
const COMPACT_SLACK: usize = 64;

#[derive(Default)]
pub(crate) struct TimerQueue {
    heap: BinaryHeap<Reverse<TimerEntry>>,
    callbacks: HashMap<TimeoutHandle, Callback>,
}

impl TimerQueue {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn schedule(&mut self, deadline: Instant, callback: Callback) -> TimeoutHandle {
        let handle = TimeoutHandle::next();
        self.heap.push(Reverse(TimerEntry { deadline, handle }));
        self.callbacks.insert(handle, callback);
        handle
    }

    pub(crate) fn cancel(&mut self, handle: TimeoutHandle) -> bool {
        let removed = self.callbacks.remove(&handle).is_some();
        if self.heap.len() > COMPACT_FACTOR * self.callbacks.len() + COMPACT_SLACK {
            let callbacks = &self.callbacks;
            self.heap.retain(|Reverse(entry)| callbacks.contains_key(&entry.handle));
        }
        removed
    }

    /// Earliest live deadline
    pub(crate) fn next_deadline(&mut self) -> Option<Instant> {
        self.prune();
        self.heap.peek().map(|Reverse(entry)| entry.deadline)
    }

    /// Remove and return the earliest timeout due at `now`
    pub(crate) fn pop_due(&mut self, now: Instant) -> Option<(TimeoutHandle, Callback)> {
        self.prune();
        match self.heap.peek() {
            Some(Reverse(entry)) if entry.deadline <= now => {
                let handle = entry.handle;
                self.heap.pop();
                self.callbacks.remove(&handle).map(|cb| (handle, cb))
            }
            _ => None,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.callbacks.len()
    }

    // Drop cancelled entries sitting at the top of the heap
    fn prune(&mut self) {
        while let Some(Reverse(entry)) = self.heap.peek() {
            if self.callbacks.contains_key(&entry.handle) {
                break;
            }
            self.heap.pop();
        }
    }
}
