use std::pin::Pin;
use std::task::{Context, Poll};

/// Yields execution back to the scheduler.
///
/// The task wakes itself before pausing, so it goes to the back of its run
/// queue and runs again once the tasks queued ahead of it had their turn.
pub fn yield_now() -> YieldNow {
    YieldNow::new()
}

#[derive(Debug, Clone, Copy)]
#[must_use = "futures do nothing unless you `.await` or poll them"]
pub struct YieldNow {
    awaiting_first_poll: bool,
}

impl YieldNow {
    pub fn new() -> Self {
        Self {
            awaiting_first_poll: true,
        }
    }
}

impl Default for YieldNow {
    fn default() -> Self {
        Self::new()
    }
}

impl Future for YieldNow {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        // Only yield on first poll. Next time the task runs we return.
        if self.awaiting_first_poll {
            self.awaiting_first_poll = false;
            cx.waker().wake_by_ref();
            Poll::Pending
        } else {
            Poll::Ready(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::mock_waker;
    use std::pin::pin;

    #[test]
    fn test_yield_now_wakes_itself_once() {
        let (waker, data) = mock_waker();
        let mut cx = Context::from_waker(&waker);
        let mut fut = pin!(yield_now());

        assert!(fut.as_mut().poll(&mut cx).is_pending());
        assert_eq!(data.get_count(), 1);

        assert!(fut.as_mut().poll(&mut cx).is_ready());
        assert_eq!(data.get_count(), 1);
    }
}
