use bitflags::bitflags;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(crate) struct Snapshot: usize {
        /// The task sits in a run queue.
        const SCHEDULED = 1;

        /// A worker is polling the task.
        const RUNNING = 1 << 1;

        /// The task was woken while running and must be queued again once the
        /// current step returns.
        const NOTIFIED = 1 << 2;

        /// Terminal: the future was dropped and will never be polled again.
        const COMPLETE = 1 << 3;

        /// Set along with `COMPLETE` when the task panicked.
        const FAILED = 1 << 4;

        /// Set along with `COMPLETE` when the task was cancelled.
        const CANCELLED = 1 << 5;
    }
}

/// The observable lifecycle of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Lifecycle {
    /// Queued and waiting for a worker.
    Runnable,

    /// Being polled by a worker.
    Running,

    /// Waiting for a wakeup from a mailbox or timer.
    Paused,

    /// Finished normally.
    Done,

    /// Panicked during a step.
    Failed,

    /// Dropped before completion, usually by scheduler shutdown.
    Cancelled,
}

impl fmt::Display for Lifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Result of [`State::transition_to_idle`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TransitionToIdle {
    /// Nobody woke the task during the step, it is now paused.
    Ok,

    /// The task was woken during the step and is scheduled again. The caller
    /// owns putting it back into a run queue.
    OkNotified,
}

/// The task state word. All transitions are single compare-and-swap loops, so
/// a task can be in at most one run queue and polled by at most one worker.
pub(crate) struct State(AtomicUsize);

impl State {
    /// New tasks start scheduled: spawning queues them right away.
    pub(crate) fn new() -> State {
        State(AtomicUsize::new(Snapshot::SCHEDULED.bits()))
    }

    pub(crate) fn load(&self) -> Snapshot {
        Snapshot::from_bits_retain(self.0.load(Ordering::Acquire))
    }

    fn fetch_update_action<F, T>(&self, mut f: F) -> T
    where
        F: FnMut(Snapshot) -> (T, Option<Snapshot>),
    {
        let mut curr = self.load();

        loop {
            let (output, next) = f(curr);
            let Some(next) = next else {
                return output;
            };

            match self.0.compare_exchange_weak(
                curr.bits(),
                next.bits(),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return output,
                Err(actual) => curr = Snapshot::from_bits_retain(actual),
            }
        }
    }

    /// Called by a wakeup. Returns `true` if the caller must queue the task.
    pub(crate) fn transition_to_notified(&self) -> bool {
        self.fetch_update_action(|curr| {
            if curr.contains(Snapshot::COMPLETE) || curr.contains(Snapshot::SCHEDULED) {
                (false, None)
            } else if curr.contains(Snapshot::RUNNING) {
                (false, Some(curr | Snapshot::NOTIFIED))
            } else {
                (true, Some(curr | Snapshot::SCHEDULED))
            }
        })
    }

    /// Called by a worker that popped the task. Returns `false` if the task
    /// must not be polled.
    pub(crate) fn transition_to_running(&self) -> bool {
        self.fetch_update_action(|curr| {
            if curr.contains(Snapshot::COMPLETE) || !curr.contains(Snapshot::SCHEDULED) {
                return (false, None);
            }

            debug_assert!(!curr.contains(Snapshot::RUNNING), "task polled concurrently");

            let mut next = curr;
            next.remove(Snapshot::SCHEDULED | Snapshot::NOTIFIED);
            next.insert(Snapshot::RUNNING);
            (true, Some(next))
        })
    }

    /// Called by a worker after a step returned `Pending`.
    pub(crate) fn transition_to_idle(&self) -> TransitionToIdle {
        self.fetch_update_action(|curr| {
            debug_assert!(curr.contains(Snapshot::RUNNING));

            let mut next = curr;
            next.remove(Snapshot::RUNNING);

            if next.contains(Snapshot::NOTIFIED) {
                next.remove(Snapshot::NOTIFIED);
                next.insert(Snapshot::SCHEDULED);
                (TransitionToIdle::OkNotified, Some(next))
            } else {
                (TransitionToIdle::Ok, Some(next))
            }
        })
    }

    /// Called by a worker after a step returned `Ready`.
    pub(crate) fn transition_to_complete(&self, failed: bool) {
        self.fetch_update_action(|curr| {
            let mut next = curr;
            next.remove(Snapshot::RUNNING | Snapshot::SCHEDULED | Snapshot::NOTIFIED);
            next.insert(Snapshot::COMPLETE);
            next.set(Snapshot::FAILED, failed);
            ((), Some(next))
        });
    }

    /// Returns `false` if the task already completed.
    pub(crate) fn transition_to_cancelled(&self) -> bool {
        self.fetch_update_action(|curr| {
            if curr.contains(Snapshot::COMPLETE) {
                return (false, None);
            }

            let mut next = curr;
            next.remove(Snapshot::RUNNING | Snapshot::SCHEDULED | Snapshot::NOTIFIED);
            next.insert(Snapshot::COMPLETE | Snapshot::CANCELLED);
            (true, Some(next))
        })
    }

    pub(crate) fn lifecycle(&self) -> Lifecycle {
        let snapshot = self.load();

        if snapshot.contains(Snapshot::COMPLETE) {
            if snapshot.contains(Snapshot::FAILED) {
                Lifecycle::Failed
            } else if snapshot.contains(Snapshot::CANCELLED) {
                Lifecycle::Cancelled
            } else {
                Lifecycle::Done
            }
        } else if snapshot.contains(Snapshot::RUNNING) {
            Lifecycle::Running
        } else if snapshot.contains(Snapshot::SCHEDULED) {
            Lifecycle::Runnable
        } else {
            Lifecycle::Paused
        }
    }
}

impl fmt::Debug for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("State").field(&self.load()).finish()
    }
}
