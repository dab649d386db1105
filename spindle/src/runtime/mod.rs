use crate::task::Task;
use std::sync::Arc;

// Public API
pub mod runtime;
pub use runtime::{Builder, Dispatch, WORKER_THREADS_ENV};

mod scheduler;
pub use scheduler::Scheduler;

pub mod default;

mod spawn;
pub use spawn::{SpawnBuilder, SpawnOpts, spawn, spawn_builder};

mod error;
pub use error::SpawnError;

// Exports
pub(crate) use runtime::RuntimeConfig;
pub(crate) use scheduler::Shared;

mod pool;

mod registry;
pub(crate) use registry::OwnedTasks;

mod ticker;
use ticker::{Ticker, TickerData, TickerEvents};

mod worker;

#[cfg(test)]
mod tests;

/// Scheduler trait
pub(crate) trait Schedule: Send + Sync + 'static {
    /// Queue a task that became runnable. The task is already in the
    /// scheduled state, the scheduler must not drop it silently unless it is
    /// shutting down.
    fn schedule(&self, task: Arc<Task>);

    /// The task has completed and is ready to be released.
    fn release(&self, task: &Task);
}
