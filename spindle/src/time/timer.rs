use crate::task::{Listener, PauseReason};
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// Heap index of a timer that is not queued. Heap slots start at 1.
pub(crate) const NOT_QUEUED: usize = 0;

/// A reusable timeout registration.
///
/// A timer carries its fire time, the listener to release when it fires, and
/// its current position in the [`TimerHeap`](super::heap::TimerHeap). The heap
/// maintains the position so cancelling or rescheduling never searches.
///
/// One timer is created per timed wait and re-armed every time that wait
/// pauses again, so a wait never has more than one entry in the heap.
pub struct Timer {
    index: AtomicUsize,
    deadline: AtomicU64,
    listener: Mutex<Option<Arc<Listener>>>,
}

impl Timer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            index: AtomicUsize::new(NOT_QUEUED),
            deadline: AtomicU64::new(0),
            listener: Mutex::new(None),
        })
    }

    /// Absolute fire time, in [`clock`](super::clock) nanoseconds.
    pub fn deadline(&self) -> u64 {
        self.deadline.load(Ordering::Acquire)
    }

    /// Returns `true` while the timer sits in a timer heap.
    pub fn is_queued(&self) -> bool {
        self.index() != NOT_QUEUED
    }

    pub(crate) fn set_deadline(&self, deadline: u64) {
        self.deadline.store(deadline, Ordering::Release);
    }

    pub(crate) fn index(&self) -> usize {
        self.index.load(Ordering::Acquire)
    }

    pub(crate) fn set_index(&self, index: usize) {
        self.index.store(index, Ordering::Release);
    }

    pub(crate) fn arm(&self, listener: Arc<Listener>) {
        *self.listener.lock() = Some(listener);
    }

    pub(crate) fn take_listener(&self) -> Option<Arc<Listener>> {
        self.listener.lock().take()
    }
}

impl PauseReason for Timer {
    fn is_valid(&self, listener: &Arc<Listener>) -> bool {
        self.is_queued()
            && self
                .listener
                .lock()
                .as_ref()
                .is_some_and(|armed| Arc::ptr_eq(armed, listener))
    }
}

impl fmt::Debug for Timer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Timer")
            .field("index", &self.index())
            .field("deadline", &self.deadline())
            .finish()
    }
}
