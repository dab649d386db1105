use thiserror::Error;

/// Errors raised when building a [`Mailbox`](super::Mailbox).
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum MailboxError {
    #[error("mailbox capacity must be greater than zero")]
    InvalidCapacity,

    #[error("mailbox capacity {0} cannot be rounded to a power of two")]
    CapacityOverflow(usize),
}
