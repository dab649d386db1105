use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TimeError {
    #[error("cannot sleep for a zero duration")]
    SleepZeroDuration,

    #[error("timer service is shut down")]
    ServiceShutdown,

    #[error("timed waits require a running scheduler on this thread")]
    NoScheduler,
}
