//! Provides functions and types for spawning new tasks onto a scheduler.
//!
//! Tasks can be spawned using the simple [`spawn()`] function for default
//! behavior, or configured using the [`SpawnBuilder`] for more control.
//!
//! Both use the scheduler driving the current thread: a worker thread, or a
//! thread inside [`Scheduler::block_on`]. Anywhere else they fall back to the
//! [default scheduler](crate::runtime::default).
use crate::context;
use crate::runtime::{Scheduler, SpawnError, default};
use crate::task::{Id, JoinError, JoinHandle};

/// Spawns a new task with default options.
///
/// This is a convenience function for [`spawn_builder()`].
///
/// If no scheduler can take the task, the returned handle resolves right away
/// to [`JoinError::Rejected`].
pub fn spawn<F>(future: F) -> JoinHandle<F::Output>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    spawn_builder().spawn(future)
}

/// Creates a new [`SpawnBuilder`] for configuring and spawning a task.
///
/// # Example
///
/// ```no_run
/// # #[spindle::main(worker_threads = 2)]
/// # async fn main() {
/// spindle::spawn_builder()
///     .affinity(1)
///     .name("pinned")
///     .spawn(async {
///         // ...
///     });
/// # }
/// ```
pub fn spawn_builder() -> SpawnBuilder {
    SpawnBuilder::default()
}

/// Per-task options.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SpawnOpts {
    /// Worker whose run queue the task always goes to.
    pub affinity: Option<usize>,

    /// Name carried by the task, shown in logs.
    pub name: Option<String>,
}

/// A builder for configuring and spawning a new task.
///
/// Created by calling [`spawn_builder()`] or [`Scheduler::spawn_builder`].
#[derive(Debug, Default)]
pub struct SpawnBuilder {
    scheduler: Option<Scheduler>,
    opts: SpawnOpts,
}

impl SpawnBuilder {
    pub(crate) fn on(scheduler: Scheduler) -> Self {
        Self {
            scheduler: Some(scheduler),
            opts: SpawnOpts::default(),
        }
    }

    /// Pins the task to worker `index`. Every run of the task, including the
    /// ones after a pause, happens on that worker.
    pub fn affinity(mut self, index: usize) -> Self {
        self.opts.affinity = Some(index);
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.opts.name = Some(name.into());
        self
    }

    /// Spawns the task, failing if the scheduler refuses it.
    pub fn try_spawn<F>(self, future: F) -> Result<JoinHandle<F::Output>, SpawnError>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let scheduler = match self.scheduler {
            Some(scheduler) => scheduler,
            None => resolve_scheduler()?,
        };

        scheduler.try_spawn_with(future, self.opts)
    }

    /// Spawns the task. A refused task gets a handle that resolves right away
    /// to [`JoinError::Rejected`].
    pub fn spawn<F>(self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.try_spawn(future).unwrap_or_else(|reason| {
            let id = Id::next();
            tracing::debug!(task.id = %id, "task rejected: {reason}");
            JoinHandle::rejected(id, JoinError::Rejected { id, reason })
        })
    }
}

fn resolve_scheduler() -> Result<Scheduler, SpawnError> {
    match context::scheduler() {
        Some(scheduler) => Ok(scheduler),
        None => default::get().map_err(|e| SpawnError::NoScheduler(format!("{e:#}"))),
    }
}
