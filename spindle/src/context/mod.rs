//! Thread-local runtime context.
//!
//! Every worker thread, and every thread inside `Scheduler::block_on`, carries
//! a handle to its scheduler. While a worker polls a task, the task itself is
//! recorded as well so that futures can find the current task ID, the timer
//! service, and record why they pause.
use crate::runtime::{Scheduler, Shared};
use crate::task::{Id, Listener, Pause, PauseReason, Task};
use crate::time::TimerService;
use std::cell::RefCell;
use std::sync::Arc;

struct Context {
    scheduler: Option<Scheduler>,

    /// Index of the worker running on this thread, if it is a worker thread.
    worker: Option<usize>,

    /// Task being polled on this thread.
    task: Option<Arc<Task>>,
}

impl Context {
    const fn new() -> Self {
        Self {
            scheduler: None,
            worker: None,
            task: None,
        }
    }
}

thread_local! {
    static CONTEXT: RefCell<Context> = const { RefCell::new(Context::new()) };
}

/// Restores the previous scheduler context when dropped.
pub(crate) struct SchedulerGuard {
    prev_scheduler: Option<Scheduler>,
    prev_worker: Option<usize>,
}

/// Enters `scheduler` on the current thread. `worker` is set on worker threads
/// only.
pub(crate) fn enter_scheduler(scheduler: Scheduler, worker: Option<usize>) -> SchedulerGuard {
    CONTEXT.with_borrow_mut(|ctx| SchedulerGuard {
        prev_scheduler: ctx.scheduler.replace(scheduler),
        prev_worker: std::mem::replace(&mut ctx.worker, worker),
    })
}

impl Drop for SchedulerGuard {
    fn drop(&mut self) {
        let prev_scheduler = self.prev_scheduler.take();
        let prev_worker = self.prev_worker.take();

        // The previous scheduler is dropped outside the borrow.
        let _dropped = CONTEXT.with_borrow_mut(|ctx| {
            ctx.worker = prev_worker;
            std::mem::replace(&mut ctx.scheduler, prev_scheduler)
        });
    }
}

/// Marks `task` as the one being polled until the guard is dropped.
pub(crate) struct TaskGuard {
    prev: Option<Arc<Task>>,
}

pub(crate) fn enter_task(task: Arc<Task>) -> TaskGuard {
    TaskGuard {
        prev: CONTEXT.with_borrow_mut(|ctx| ctx.task.replace(task)),
    }
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        let prev = self.prev.take();
        let _dropped = CONTEXT.with_borrow_mut(|ctx| std::mem::replace(&mut ctx.task, prev));
    }
}

/// The scheduler driving the current thread, if any.
pub(crate) fn scheduler() -> Option<Scheduler> {
    CONTEXT.with_borrow(|ctx| ctx.scheduler.clone())
}

/// Index of the current worker when it belongs to `shared`.
pub(crate) fn current_worker_of(shared: &Shared) -> Option<usize> {
    CONTEXT.with_borrow(|ctx| match &ctx.scheduler {
        Some(s) if s.is(shared) => ctx.worker,
        _ => None,
    })
}

/// Returns `true` if the current thread is a worker thread of any scheduler.
pub(crate) fn is_worker_thread() -> bool {
    CONTEXT.with_borrow(|ctx| ctx.worker.is_some())
}

pub(crate) fn current_task_id() -> Option<Id> {
    CONTEXT
        .try_with(|ctx| ctx.try_borrow().ok()?.task.as_ref().map(|t| t.id()))
        .ok()
        .flatten()
}

pub(crate) fn timer_service() -> Option<Arc<TimerService>> {
    CONTEXT.with_borrow(|ctx| ctx.scheduler.as_ref().map(|s| s.timer_service()))
}

/// Records why the current task is about to pause. A no-op outside a task,
/// for example in the future driven by `block_on`.
pub(crate) fn pause_on(reason: Arc<dyn PauseReason>, listener: &Arc<Listener>) {
    let task = CONTEXT.with_borrow(|ctx| ctx.task.clone());

    if let Some(task) = task {
        task.set_pause(Pause::new(reason, Arc::clone(listener)));
    }
}
