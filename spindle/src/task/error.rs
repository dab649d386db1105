use crate::runtime::SpawnError;
use crate::task::Id;
use std::any::Any;
use thiserror::Error;

/// Why a task did not produce its output.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum JoinError {
    /// The task was dropped before completing, for example because the
    /// scheduler shut down while it was paused.
    #[error("task {0} was cancelled")]
    Cancelled(Id),

    /// The task panicked. The panic was caught by the worker and never reached
    /// other tasks.
    #[error("task {id} failed: {message}")]
    Failed { id: Id, message: String },

    /// The scheduler refused the task, it never ran.
    #[error("task {id} was rejected: {reason}")]
    Rejected { id: Id, reason: SpawnError },
}

impl JoinError {
    pub(crate) fn failed(id: Id, payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&'static str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "task panicked with a non-string payload".to_string()
        };

        JoinError::Failed { id, message }
    }

    pub fn id(&self) -> Id {
        match self {
            JoinError::Cancelled(id) => *id,
            JoinError::Failed { id, .. } => *id,
            JoinError::Rejected { id, .. } => *id,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, JoinError::Cancelled(_))
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, JoinError::Failed { .. })
    }

    pub fn is_rejected(&self) -> bool {
        matches!(self, JoinError::Rejected { .. })
    }
}
