use crate::context;
use crate::task::{Listener, PauseReason};
use crate::time::clock;
use crate::time::error::TimeError;
use crate::time::service::TimerService;
use crate::time::timer::Timer;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

/// Pauses the current task for at least `duration`.
///
/// Fails if `duration` is zero, see [`Sleep::try_new`].
pub fn sleep(duration: Duration) -> Result<Sleep, TimeError> {
    Sleep::try_new(duration)
}

/// Future returned by [`sleep`].
///
/// The task pauses on a [`Timer`] submitted to the scheduler's timer service
/// and is resumed when the timer fires. Dropping the future cancels the timer.
#[derive(Debug)]
#[must_use = "futures do nothing unless you `.await` or poll them"]
pub struct Sleep {
    deadline: u64,
    timer: Arc<Timer>,
    listener: Option<Arc<Listener>>,
    timers: Option<Arc<TimerService>>,
}

impl Sleep {
    pub fn try_new(duration: Duration) -> Result<Self, TimeError> {
        if duration.is_zero() {
            return Err(TimeError::SleepZeroDuration);
        }

        Ok(Self {
            deadline: clock::deadline_after(duration),
            timer: Timer::new(),
            listener: None,
            timers: None,
        })
    }

    /// Absolute deadline, in [`clock`] nanoseconds.
    pub fn deadline(&self) -> u64 {
        self.deadline
    }
}

impl Future for Sleep {
    type Output = Result<(), TimeError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();

        if clock::now() >= this.deadline {
            this.cancel();
            return Poll::Ready(Ok(()));
        }

        // Spurious wakeup, the timer still holds our listener.
        if let Some(listener) = &this.listener
            && listener.will_wake(cx.waker())
            && this.timer.is_valid(listener)
        {
            context::pause_on(this.timer.clone(), listener);
            return Poll::Pending;
        }

        let timers = match this.timers.take().or_else(context::timer_service) {
            Some(timers) => this.timers.insert(timers),
            None => return Poll::Ready(Err(TimeError::NoScheduler)),
        };

        let listener = Listener::new(cx.waker().clone());
        if let Err(e) = timers.submit(&this.timer, this.deadline, Arc::clone(&listener)) {
            return Poll::Ready(Err(e));
        }

        context::pause_on(this.timer.clone(), &listener);
        this.listener = Some(listener);

        Poll::Pending
    }
}

impl Sleep {
    fn cancel(&mut self) {
        if let Some(timers) = &self.timers
            && self.timer.is_queued()
        {
            timers.cancel(&self.timer);
        }
        if let Some(listener) = self.listener.take() {
            listener.retire();
        }
    }
}

impl Drop for Sleep {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate as spindle;
    use anyhow::{Context, Result};
    use rstest::rstest;
    use std::time::Instant;

    #[rstest]
    #[case::one_ms(Duration::from_millis(1))]
    #[case::ten_ms(Duration::from_millis(10))]
    #[case::thirty_ms(Duration::from_millis(30))]
    #[spindle::test(worker_threads = 1)]
    async fn test_sleep_duration_is_accurate(#[case] duration: Duration) -> Result<()> {
        let start = Instant::now();
        sleep(duration).context("cant create sleep")?.await?;
        let elapsed = start.elapsed();

        // Never shorter than requested.
        assert!(
            elapsed >= duration,
            "Sleep was shorter than expected. Elapsed: {:?}, Expected: >= {:?}",
            elapsed,
            duration
        );

        // Generous margin for loaded machines.
        let upper_bound = duration + Duration::from_millis(200);
        assert!(
            elapsed < upper_bound,
            "Sleep was much longer than expected. Elapsed: {:?}, Expected: < {:?}",
            elapsed,
            upper_bound
        );

        Ok(())
    }

    #[spindle::test(worker_threads = 1)]
    async fn test_sleep_inside_spawned_task() -> Result<()> {
        let handle = spindle::spawn(async {
            let start = Instant::now();
            sleep(Duration::from_millis(15))?.await?;
            Ok::<_, TimeError>(start.elapsed())
        });

        let elapsed = handle.await??;
        assert!(elapsed >= Duration::from_millis(15));
        Ok(())
    }

    #[test]
    fn test_sleep_with_zero_duration_errors() {
        assert!(matches!(
            Sleep::try_new(Duration::ZERO),
            Err(TimeError::SleepZeroDuration)
        ));
    }

    #[test]
    fn test_sleep_outside_scheduler_errors() {
        let res = futures::executor::block_on(async { sleep(Duration::from_millis(1))?.await });
        assert!(matches!(res, Err(TimeError::NoScheduler)));
    }

    #[spindle::test(worker_threads = 1)]
    async fn test_dropped_sleep_cancels_timer() -> Result<()> {
        let timers = context::timer_service().context("no timer service")?;
        let mut fut = Box::pin(sleep(Duration::from_secs(60))?);

        // Poll once to arm the timer.
        assert!(futures::poll!(fut.as_mut()).is_pending());
        assert_eq!(timers.len(), 1);

        drop(fut);
        assert!(timers.is_empty());
        Ok(())
    }
}
