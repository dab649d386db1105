use crate::context;
use std::sync::atomic::{AtomicU64, Ordering};
use std::{fmt, num::NonZeroU64};

/// An opaque ID that uniquely identifies a task relative to all other tasks
/// spawned by this process.
///
/// # Notes
///
/// - Task IDs are handed out from a single process-wide counter, so two
///   schedulers never produce the same ID.
/// - The ID of the currently running task can be obtained from inside the task
///   via [`task::id()`](crate::task::id()) and [`task::try_id()`](crate::task::try_id()),
///   and from outside the task via [`JoinHandle::id()`](crate::task::JoinHandle::id()).
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, PartialOrd, Ord)]
pub struct Id(pub(crate) NonZeroU64);

/// Returns the [`Id`] of the currently running task.
///
/// # Panics
///
/// This function panics if called from outside a task. The future driven by
/// `block_on` is not a task, so the method panics there as well. For a version
/// of this function that doesn't panic, see [`task::try_id()`](crate::task::try_id()).
#[track_caller]
pub fn id() -> Id {
    context::current_task_id().expect("Can't get a task id when not inside a task")
}

/// Returns the [`Id`] of the currently running task, or `None` if called outside
/// of a task.
pub fn try_id() -> Option<Id> {
    context::current_task_id()
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl Id {
    pub(crate) fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);

        let id = COUNTER.fetch_add(1, Ordering::Relaxed);

        // Even at a billion spawns per second this takes centuries to wrap.
        let Some(id) = NonZeroU64::new(id) else {
            Self::exhausted();
        };

        Self(id)
    }

    #[cold]
    fn exhausted() -> ! {
        panic!("failed to generate unique task ID: bitspace exhausted")
    }

    pub fn as_u64(&self) -> u64 {
        self.0.get()
    }
}
