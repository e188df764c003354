//! Dispatch heap: queues ordered by next-available time
//!
//! A min-heap of `(availability_time, queue_id)` with a parallel map of
//! current times. Pushing an updated time for a queue leaves the old heap
//! entry in place; `pop` and `peek` discard entries that no longer match
//! the map (lazy invalidation), which avoids O(log n) deletes on every
//! availability change.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::Mutex;
use std::time::Instant;

struct HeapInner {
    heap: BinaryHeap<Reverse<(Instant, String)>>,
    current: HashMap<String, Instant>,
}

/// Priority queue of queues by earliest availability.
pub struct DispatchHeap {
    inner: Mutex<HeapInner>,
}

impl Default for DispatchHeap {
    fn default() -> Self {
        Self::new()
    }
}

impl DispatchHeap {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(HeapInner {
                heap: BinaryHeap::new(),
                current: HashMap::new(),
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HeapInner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Add or update a queue's availability time.
    pub fn push(&self, queue_id: &str, available_at: Instant) {
        let mut inner = self.lock();
        inner.current.insert(queue_id.to_string(), available_at);
        inner.heap.push(Reverse((available_at, queue_id.to_string())));
    }

    /// Remove and return the queue with the earliest availability,
    /// discarding stale entries along the way.
    pub fn pop(&self) -> Option<(String, Instant)> {
        let mut inner = self.lock();
        while let Some(Reverse((time, queue_id))) = inner.heap.pop() {
            if inner.current.get(&queue_id) == Some(&time) {
                inner.current.remove(&queue_id);
                return Some((queue_id, time));
            }
        }
        None
    }

    /// Look at the earliest queue without removing it.
    pub fn peek(&self) -> Option<(String, Instant)> {
        let mut inner = self.lock();
        while let Some(Reverse((time, queue_id))) = inner.heap.peek().cloned() {
            if inner.current.get(&queue_id) == Some(&time) {
                return Some((queue_id, time));
            }
            inner.heap.pop();
        }
        None
    }

    /// Drop a queue from scheduling. Its heap entries become stale.
    pub fn remove(&self, queue_id: &str) {
        self.lock().current.remove(queue_id);
    }

    /// Number of live (non-stale) entries.
    pub fn len(&self) -> usize {
        self.lock().current.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().current.is_empty()
    }
}
