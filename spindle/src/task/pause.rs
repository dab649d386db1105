//! The pause/resume protocol shared by every waitable resource.
//!
//! A task that cannot make progress creates a [`Listener`] around its waker
//! and registers it with the resource it waits on (a mailbox side, a timer, or
//! both at once). The resource delivers at most one [`Event`] to it. Delivery
//! flips a one-shot flag before waking, so two resources racing to wake the
//! same wait produce exactly one wakeup.
//!
//! While paused, the task remembers a [`PauseReason`] next to the listener.
//! The worker consults it right after the step returns: if the reason no
//! longer holds, the wakeup may already have been missed and the task is
//! resumed immediately.
use crate::context;
use crate::task::Id;
use std::fmt;
use std::ptr;
use std::sync::Arc;
use std::sync::atomic::{AtomicPtr, AtomicU8, Ordering};
use std::task::Waker;

/// What a resource reports when it releases a waiting task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Event {
    /// The mailbox the listener waits on now holds at least one message.
    MessageAvailable = 1,

    /// The mailbox the listener waits on now has at least one free slot.
    SpaceAvailable = 2,

    /// The timer the listener was armed with expired.
    TimedOut = 3,
}

const NOT_DELIVERED: u8 = 0;

/// The wait ended without an event, late deliveries are dropped.
const RETIRED: u8 = u8::MAX;

impl Event {
    fn from_u8(val: u8) -> Option<Event> {
        match val {
            1 => Some(Event::MessageAvailable),
            2 => Some(Event::SpaceAvailable),
            3 => Some(Event::TimedOut),
            _ => None,
        }
    }
}

/// A one-shot wakeup registration for a single wait.
///
/// Listeners are cheap and created fresh for every wait. Once an event has been
/// delivered the listener is spent: further deliveries are ignored.
pub struct Listener {
    id: Option<Id>,
    waker: Waker,
    event: AtomicU8,
}

impl Listener {
    /// Creates a listener that wakes `waker`. The listener is tagged with the
    /// ID of the current task, if any.
    pub fn new(waker: Waker) -> Arc<Self> {
        Arc::new(Self {
            id: context::current_task_id(),
            waker,
            event: AtomicU8::new(NOT_DELIVERED),
        })
    }

    /// The task this listener belongs to, if it was created inside a task.
    pub fn id(&self) -> Option<Id> {
        self.id
    }

    /// Delivers `event` and wakes the waiting task. Returns `false` if another
    /// event already won the race.
    pub fn deliver(&self, event: Event) -> bool {
        let won = self
            .event
            .compare_exchange(
                NOT_DELIVERED,
                event as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok();

        if won {
            tracing::trace!(task.id = ?self.id, ?event, "delivering wakeup");
            self.waker.wake_by_ref();
        }

        won
    }

    /// Marks the listener spent without waking anyone. Returns `false` if an
    /// event was delivered first.
    ///
    /// A finished wait retires its listener so that a resource still holding
    /// it, such as a timer already popped by the timer thread, cannot wake the
    /// task for a wait that is over.
    pub(crate) fn retire(&self) -> bool {
        self.event
            .compare_exchange(NOT_DELIVERED, RETIRED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// The event that released this listener, if any.
    pub fn delivered(&self) -> Option<Event> {
        Event::from_u8(self.event.load(Ordering::Acquire))
    }

    pub fn is_delivered(&self) -> bool {
        self.delivered().is_some()
    }

    /// `true` once the listener can no longer wake its task.
    pub(crate) fn is_spent(&self) -> bool {
        self.event.load(Ordering::Acquire) != NOT_DELIVERED
    }

    pub(crate) fn will_wake(&self, waker: &Waker) -> bool {
        self.waker.will_wake(waker)
    }
}

impl fmt::Debug for Listener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Listener")
            .field("id", &self.id)
            .field("delivered", &self.delivered())
            .finish()
    }
}

/// A resource a task can pause on.
///
/// Implemented by every waitable resource: the two sides of a mailbox and
/// timers.
pub trait PauseReason: Send + Sync {
    /// Returns `true` while `listener` still has a reason to stay paused on
    /// this resource. A `false` answer means the condition was satisfied, or
    /// the listener is no longer registered here.
    fn is_valid(&self, listener: &Arc<Listener>) -> bool;
}

/// The reason a task is currently paused, recorded by the future that paused.
#[derive(Clone)]
pub(crate) struct Pause {
    reason: Arc<dyn PauseReason>,
    listener: Arc<Listener>,
}

impl Pause {
    pub(crate) fn new(reason: Arc<dyn PauseReason>, listener: Arc<Listener>) -> Self {
        Self { reason, listener }
    }

    pub(crate) fn is_valid(&self) -> bool {
        !self.listener.is_delivered() && self.reason.is_valid(&self.listener)
    }
}

impl fmt::Debug for Pause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pause")
            .field("listener", &self.listener)
            .finish_non_exhaustive()
    }
}

/// An atomic slot holding at most one registered listener.
///
/// The slot owns one strong reference to the listener it holds. Every mutation
/// is a single atomic swap or compare-and-swap, so a producer and a consumer can
/// race on the same slot and exactly one of them walks away with the listener.
pub(crate) struct ListenerCell(AtomicPtr<Listener>);

impl ListenerCell {
    pub(crate) const fn new() -> Self {
        Self(AtomicPtr::new(ptr::null_mut()))
    }

    /// Registers `listener`, returning whatever was registered before.
    pub(crate) fn set(&self, listener: Arc<Listener>) -> Option<Arc<Listener>> {
        let new = Arc::into_raw(listener).cast_mut();
        let old = self.0.swap(new, Ordering::AcqRel);

        // Safety: every non-null pointer stored in the cell came from `Arc::into_raw`.
        unsafe { Self::from_raw(old) }
    }

    /// Clears the slot, handing the registered listener to the caller.
    pub(crate) fn take(&self) -> Option<Arc<Listener>> {
        let old = self.0.swap(ptr::null_mut(), Ordering::AcqRel);

        // Safety: see `set`.
        unsafe { Self::from_raw(old) }
    }

    /// Clears the slot only if it still holds `expected`.
    pub(crate) fn remove(&self, expected: &Arc<Listener>) -> bool {
        let expected = Arc::as_ptr(expected).cast_mut();

        match self.0.compare_exchange(
            expected,
            ptr::null_mut(),
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(old) => {
                // Safety: see `set`. The cell's reference is released here.
                drop(unsafe { Self::from_raw(old) });
                true
            }
            Err(_) => false,
        }
    }

    /// Returns `true` if `listener` is the one currently registered. The caller
    /// holds a strong reference, so the address cannot be reused meanwhile.
    pub(crate) fn is(&self, listener: &Arc<Listener>) -> bool {
        ptr::eq(self.0.load(Ordering::Acquire), Arc::as_ptr(listener))
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.0.load(Ordering::Acquire).is_null()
    }

    unsafe fn from_raw(ptr: *mut Listener) -> Option<Arc<Listener>> {
        if ptr.is_null() {
            None
        } else {
            Some(unsafe { Arc::from_raw(ptr) })
        }
    }
}

impl Drop for ListenerCell {
    fn drop(&mut self) {
        drop(self.take());
    }
}

impl fmt::Debug for ListenerCell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ListenerCell")
            .field(&!self.is_empty())
            .finish()
    }
}
