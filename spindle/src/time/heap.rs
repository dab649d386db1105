use crate::time::timer::{NOT_QUEUED, Timer};
use std::sync::Arc;

/// Initial number of slots.
const INITIAL_CAPACITY: usize = 32;

/// The heap grows by a fixed number of slots, never by doubling. It is expected
/// to stay small, so over-allocation costs more than the extra reallocations.
const GROW_BY: usize = 8;

/// An indexed binary min-heap of timers ordered by deadline.
///
/// Slots are 1-indexed: the root is slot 1 and the children of slot `i` are
/// `2i` and `2i + 1`. Slot `i` is stored at `entries[i - 1]`. Every timer
/// records its own slot, which is what makes [`remove`](Self::remove) and
/// [`reschedule`](Self::reschedule) O(log n).
#[derive(Debug)]
pub(crate) struct TimerHeap {
    entries: Vec<Arc<Timer>>,
}

impl TimerHeap {
    pub(crate) fn new() -> Self {
        Self {
            entries: Vec::with_capacity(INITIAL_CAPACITY),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The timer with the earliest deadline.
    pub(crate) fn peek(&self) -> Option<&Arc<Timer>> {
        self.entries.first()
    }

    pub(crate) fn add(&mut self, timer: Arc<Timer>) {
        debug_assert!(!timer.is_queued(), "timer is already queued");

        if self.entries.len() == self.entries.capacity() {
            self.entries.reserve_exact(GROW_BY);
        }

        self.entries.push(timer);
        let slot = self.entries.len();
        self.at(slot).set_index(slot);
        self.sift_up(slot);
    }

    /// Removes and returns the timer with the earliest deadline.
    pub(crate) fn poll_min(&mut self) -> Option<Arc<Timer>> {
        self.remove(1)
    }

    /// Removes the timer at `slot`. The last timer takes its place and is then
    /// moved to restore heap order.
    pub(crate) fn remove(&mut self, slot: usize) -> Option<Arc<Timer>> {
        if slot == NOT_QUEUED || slot > self.len() {
            return None;
        }

        let last = self.len();
        self.swap(slot, last);

        let timer = self.entries.pop()?;
        timer.set_index(NOT_QUEUED);

        if slot <= self.len() {
            self.reschedule(slot);
        }

        Some(timer)
    }

    /// Restores heap order after the deadline of the timer at `slot` changed.
    pub(crate) fn reschedule(&mut self, slot: usize) {
        debug_assert!(slot != NOT_QUEUED && slot <= self.len());

        let slot = self.sift_up(slot);
        self.sift_down(slot);
    }

    /// Drops every queued timer, marking each one as no longer queued.
    pub(crate) fn clear(&mut self) -> Vec<Arc<Timer>> {
        let drained = self.entries.drain(..).collect::<Vec<_>>();
        for timer in &drained {
            timer.set_index(NOT_QUEUED);
        }
        drained
    }

    fn at(&self, slot: usize) -> &Arc<Timer> {
        &self.entries[slot - 1]
    }

    fn less(&self, a: usize, b: usize) -> bool {
        self.at(a).deadline() < self.at(b).deadline()
    }

    fn swap(&mut self, a: usize, b: usize) {
        if a == b {
            return;
        }

        self.entries.swap(a - 1, b - 1);
        self.at(a).set_index(a);
        self.at(b).set_index(b);
    }

    fn sift_up(&mut self, mut slot: usize) -> usize {
        while slot > 1 {
            let parent = slot / 2;
            if !self.less(slot, parent) {
                break;
            }

            self.swap(slot, parent);
            slot = parent;
        }

        slot
    }

    fn sift_down(&mut self, mut slot: usize) {
        let len = self.len();

        loop {
            let left = slot * 2;
            if left > len {
                break;
            }

            let right = left + 1;
            let child = if right <= len && self.less(right, left) {
                right
            } else {
                left
            };

            if !self.less(child, slot) {
                break;
            }

            self.swap(slot, child);
            slot = child;
        }
    }
}

#[cfg(test)]
impl TimerHeap {
    pub(crate) fn capacity(&self) -> usize {
        self.entries.capacity()
    }

    /// Panics if heap order or any recorded slot is wrong.
    pub(crate) fn assert_invariants(&self) {
        for slot in 1..=self.len() {
            assert_eq!(self.at(slot).index(), slot, "stale index at slot {slot}");

            if slot > 1 {
                assert!(
                    self.at(slot / 2).deadline() <= self.at(slot).deadline(),
                    "heap order violated at slot {slot}"
                );
            }
        }
    }
}
