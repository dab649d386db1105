use crate::runtime::{Builder, Scheduler};
use anyhow::Result;
use pin_project::pin_project;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

pub(crate) mod mocks;
pub(crate) use mocks::{DummyScheduler, WakerData, fn_waker, mock_task, mock_waker};

pub(crate) fn init_scheduler(worker_threads: usize) -> Result<Scheduler> {
    Builder::new().worker_threads(worker_threads).try_build()
}

/// Spins until `cond` holds, giving up after `limit`.
pub(crate) fn wait_until(mut cond: impl FnMut() -> bool, limit: Duration) -> bool {
    let start = Instant::now();
    while !cond() {
        if start.elapsed() > limit {
            return false;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    true
}

/// Counts how many times the wrapped future was polled. Every poll after the
/// first follows a pause.
#[pin_project]
pub(crate) struct CountPolls<F> {
    #[pin]
    inner: F,
    polls: Arc<AtomicUsize>,
}

impl<F: Future> CountPolls<F> {
    pub(crate) fn new(inner: F) -> (Self, Arc<AtomicUsize>) {
        let polls = Arc::new(AtomicUsize::new(0));
        (
            Self {
                inner,
                polls: Arc::clone(&polls),
            },
            polls,
        )
    }
}

impl<F: Future> Future for CountPolls<F> {
    type Output = F::Output;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        this.polls.fetch_add(1, Ordering::Relaxed);
        this.inner.poll(cx)
    }
}
