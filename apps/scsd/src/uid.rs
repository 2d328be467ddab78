//! Smallest-free UID allocation.

use std::cmp::Reverse;
use std::collections::BinaryHeap;

use parking_lot::Mutex;

/// A connected-but-unjoined client holds this UID.
pub const UNJOINED: i32 = 0;

/// Hands out the smallest free UID in `[1, max]`. Freed UIDs become
/// available again immediately.
#[derive(Debug)]
pub struct UidHeap {
    heap: Mutex<BinaryHeap<Reverse<i32>>>,
}

impl UidHeap {
    pub fn new(max: i32) -> Self {
        Self {
            heap: Mutex::new((1..=max).map(Reverse).collect()),
        }
    }

    /// Take the smallest available UID. `None` when all are in use.
    pub fn take(&self) -> Option<i32> {
        self.heap.lock().pop().map(|Reverse(id)| id)
    }

    /// Return a UID to the pool.
    pub fn free(&self, id: i32) {
        self.heap.lock().push(Reverse(id));
    }

    pub fn available(&self) -> usize {
        self.heap.lock().len()
    }
}
