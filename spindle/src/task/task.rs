use crate::context;
use crate::runtime::{Schedule, SpawnOpts};
use crate::task::join::{CompleteOnDrop, JoinState};
use crate::task::pause::Pause;
use crate::task::state::{Lifecycle, State, TransitionToIdle};
use crate::task::{Id, JoinError, JoinHandle};
use futures::FutureExt;
use parking_lot::Mutex;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, Wake, Waker};

type BoxFuture = Pin<Box<dyn Future<Output = Outcome> + Send + 'static>>;

/// What the type-erased task future reports when it finishes.
#[derive(Debug)]
pub(crate) enum Outcome {
    Completed,
    Failed(JoinError),
}

/// Result of running one step of a task.
#[derive(Debug)]
pub(crate) enum Step {
    /// The task finished, its output went to the join handle.
    Done,

    /// The task panicked. The error also went to the join handle.
    Failed(JoinError),

    /// The task is waiting for a wakeup.
    Paused,

    /// The task was woken during the step and is scheduled again; the caller
    /// must put it back into a run queue.
    Notified,

    /// The task was not in a runnable state, nothing was polled.
    Skipped,
}

/// A unit of schedulable work.
///
/// The task owns its type-erased future. One step is one poll: `Pending` means
/// paused, `Ready` means done, and a panic caught during the poll means failed.
/// The state word guarantees a task is queued at most once and never polled by
/// two workers at the same time.
pub(crate) struct Task {
    id: Id,
    name: Option<String>,
    affinity: Option<usize>,
    state: State,
    future: Mutex<Option<BoxFuture>>,
    pause: Mutex<Option<Pause>>,
    scheduler: Arc<dyn Schedule>,
}

/// Builds a task and its join handle. The task starts scheduled, the caller
/// must hand it to a run queue.
pub(crate) fn new_task<F>(
    future: F,
    opts: SpawnOpts,
    scheduler: Arc<dyn Schedule>,
) -> (Arc<Task>, JoinHandle<F::Output>)
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    let id = Id::next();
    let join = Arc::new(JoinState::new());

    // Created outside the async block so that dropping a never-polled task
    // still resolves the join handle.
    let guard = CompleteOnDrop::new(id, Arc::clone(&join));

    let future = async move {
        match AssertUnwindSafe(future).catch_unwind().await {
            Ok(output) => {
                guard.complete(Ok(output));
                Outcome::Completed
            }
            Err(payload) => {
                let err = JoinError::failed(id, payload);
                guard.complete(Err(err.clone()));
                Outcome::Failed(err)
            }
        }
    };

    let task = Arc::new(Task {
        id,
        name: opts.name,
        affinity: opts.affinity,
        state: State::new(),
        future: Mutex::new(Some(Box::pin(future))),
        pause: Mutex::new(None),
        scheduler,
    });

    let handle = JoinHandle::new(id, Some(Arc::clone(&task)), join);
    (task, handle)
}

impl Task {
    pub(crate) fn id(&self) -> Id {
        self.id
    }

    pub(crate) fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// The worker this task is pinned to, if any.
    pub(crate) fn affinity(&self) -> Option<usize> {
        self.affinity
    }

    pub(crate) fn lifecycle(&self) -> Lifecycle {
        self.state.lifecycle()
    }

    /// Runs one step of the task on the current thread.
    pub(crate) fn run(self: &Arc<Self>) -> Step {
        if !self.state.transition_to_running() {
            return Step::Skipped;
        }

        self.pause.lock().take();

        let waker = Waker::from(Arc::clone(self));
        let mut cx = Context::from_waker(&waker);
        let _guard = context::enter_task(Arc::clone(self));

        let mut slot = self.future.lock();
        let Some(future) = slot.as_mut() else {
            // Cancelled concurrently.
            return Step::Skipped;
        };

        match future.as_mut().poll(&mut cx) {
            Poll::Ready(outcome) => {
                let failed = matches!(outcome, Outcome::Failed(_));

                slot.take();
                drop(slot);

                self.state.transition_to_complete(failed);
                self.scheduler.release(self);

                match outcome {
                    Outcome::Completed => Step::Done,
                    Outcome::Failed(err) => Step::Failed(err),
                }
            }
            Poll::Pending => {
                drop(slot);

                match self.state.transition_to_idle() {
                    TransitionToIdle::Ok => Step::Paused,
                    TransitionToIdle::OkNotified => Step::Notified,
                }
            }
        }
    }

    /// Puts a paused task back into a run queue. Wakeups for a task that is
    /// already queued, running or finished are absorbed by the state word.
    pub(crate) fn resume(self: &Arc<Self>) {
        if self.state.transition_to_notified() {
            self.scheduler.schedule(Arc::clone(self));
        }
    }

    /// Drops the future without polling it again. The join handle resolves
    /// with [`JoinError::Cancelled`].
    pub(crate) fn cancel(&self) -> bool {
        if !self.state.transition_to_cancelled() {
            return false;
        }

        self.pause.lock().take();
        let future = self.future.lock().take();
        drop(future);

        true
    }

    /// Records why the running task is about to pause.
    pub(crate) fn set_pause(&self, pause: Pause) {
        *self.pause.lock() = Some(pause);
    }

    /// The reason the task is paused. Only meaningful while paused.
    pub(crate) fn pause_reason(&self) -> Option<Pause> {
        if self.lifecycle() == Lifecycle::Paused {
            self.pause.lock().clone()
        } else {
            None
        }
    }
}

impl Wake for Task {
    fn wake(self: Arc<Self>) {
        self.resume();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        self.resume();
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("affinity", &self.affinity)
            .field("state", &self.state)
            .finish()
    }
}
