use thiserror::Error;

/// Why the scheduler refused a task.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SpawnError {
    #[error("scheduler is shut down")]
    Shutdown,

    #[error("worker index {index} out of range, scheduler has {num_workers} workers")]
    InvalidAffinity { index: usize, num_workers: usize },

    #[error("no scheduler available: {0}")]
    NoScheduler(String),
}
