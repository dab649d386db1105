use crate::task::state::Lifecycle;
use crate::task::{Id, JoinError, Task};
use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};

/// An owned permission to join on a task (await its termination).
///
/// This can be thought of as the equivalent of [`std::thread::JoinHandle`]
/// for a spindle task rather than a thread. The task associated with this
/// `JoinHandle` is queued as soon as it is spawned, even if you never await
/// the handle.
///
/// A `JoinHandle` *detaches* the associated task when it is dropped: the task
/// keeps running and its output is lost.
///
/// The handle can be awaited from another task, or joined from a plain thread
/// with [`JoinHandle::join`].
///
/// Note that `handle.await` doesn't give you the return type directly. It is
/// wrapped in a `Result` because panics in the spawned task are caught by the
/// worker. The `?` operator has to be double chained to extract the returned
/// value:
///
/// ```no_run
/// # #[spindle::main(worker_threads = 1)]
/// # async fn main() -> anyhow::Result<()> {
/// let join_handle = spindle::spawn(async { Ok::<_, std::io::Error>(5 + 3) });
/// let result = join_handle.await??;
/// assert_eq!(result, 8);
/// # Ok(())
/// # }
/// ```
pub struct JoinHandle<T> {
    id: Id,
    task: Option<Arc<Task>>,
    state: Arc<JoinState<T>>,
}

impl<T> JoinHandle<T> {
    pub(crate) fn new(id: Id, task: Option<Arc<Task>>, state: Arc<JoinState<T>>) -> Self {
        Self { id, task, state }
    }

    /// A handle for a task the scheduler refused. It resolves right away.
    pub(crate) fn rejected(id: Id, err: JoinError) -> Self {
        let state = Arc::new(JoinState::new());
        state.complete(Err(err));
        Self::new(id, None, state)
    }

    /// Returns a [task ID] that uniquely identifies this task.
    ///
    /// [task ID]: crate::task::Id
    pub fn id(&self) -> Id {
        self.id
    }

    /// Returns `true` once the task produced its output, failed or was
    /// cancelled.
    pub fn is_finished(&self) -> bool {
        self.state.is_finished()
    }

    /// Current lifecycle of the task.
    pub fn lifecycle(&self) -> Lifecycle {
        match &self.task {
            Some(task) => task.lifecycle(),
            None => Lifecycle::Cancelled,
        }
    }

    /// Blocks the current thread until the task terminates.
    ///
    /// Meant for plain threads. Calling it from inside a task blocks the
    /// worker thread.
    pub fn join(self) -> Result<T, JoinError> {
        self.state.wait()
    }
}

impl<T> Future for JoinHandle<T> {
    type Output = Result<T, JoinError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.state.poll_output(cx)
    }
}

impl<T> fmt::Debug for JoinHandle<T> {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.debug_struct("JoinHandle")
            .field("id", &self.id)
            .field("finished", &self.is_finished())
            .finish()
    }
}

/// The rendezvous between a task and its [`JoinHandle`].
pub(crate) struct JoinState<T> {
    slot: Mutex<Slot<T>>,
    cond: Condvar,
}

struct Slot<T> {
    output: Option<Result<T, JoinError>>,
    waker: Option<Waker>,
    finished: bool,
}

impl<T> JoinState<T> {
    pub(crate) fn new() -> Self {
        Self {
            slot: Mutex::new(Slot {
                output: None,
                waker: None,
                finished: false,
            }),
            cond: Condvar::new(),
        }
    }

    /// Stores the output. Only the first call has any effect.
    pub(crate) fn complete(&self, output: Result<T, JoinError>) -> bool {
        let waker = {
            let mut slot = self.slot.lock();
            if slot.finished {
                return false;
            }

            slot.finished = true;
            slot.output = Some(output);
            slot.waker.take()
        };

        self.cond.notify_all();
        if let Some(waker) = waker {
            waker.wake();
        }

        true
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.slot.lock().finished
    }

    fn poll_output(&self, cx: &mut Context<'_>) -> Poll<Result<T, JoinError>> {
        let mut slot = self.slot.lock();

        if let Some(output) = slot.output.take() {
            return Poll::Ready(output);
        }

        assert!(!slot.finished, "JoinHandle polled after completion");

        match &mut slot.waker {
            Some(waker) if waker.will_wake(cx.waker()) => {}
            waker => *waker = Some(cx.waker().clone()),
        }

        Poll::Pending
    }

    fn wait(&self) -> Result<T, JoinError> {
        let mut slot = self.slot.lock();

        loop {
            if let Some(output) = slot.output.take() {
                return output;
            }
            self.cond.wait(&mut slot);
        }
    }
}

/// Resolves the join state with [`JoinError::Cancelled`] if the task future is
/// dropped before it completes.
pub(crate) struct CompleteOnDrop<T> {
    id: Id,
    state: Option<Arc<JoinState<T>>>,
}

impl<T> CompleteOnDrop<T> {
    pub(crate) fn new(id: Id, state: Arc<JoinState<T>>) -> Self {
        Self {
            id,
            state: Some(state),
        }
    }

    pub(crate) fn complete(mut self, output: Result<T, JoinError>) {
        if let Some(state) = self.state.take() {
            state.complete(output);
        }
    }
}

impl<T> Drop for CompleteOnDrop<T> {
    fn drop(&mut self) {
        if let Some(state) = self.state.take() {
            state.complete(Err(JoinError::Cancelled(self.id)));
        }
    }
}
