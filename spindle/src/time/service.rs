use crate::task::{Event, Listener};
use crate::time::clock;
use crate::time::error::TimeError;
use crate::time::heap::TimerHeap;
use crate::time::timer::Timer;
use anyhow::{Result, anyhow};
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

const TIMER_THREAD_NAME: &str = "spindle-timer";

/// Fires timers from a dedicated thread.
///
/// The service owns one [`TimerHeap`] behind a single lock. Submissions and
/// cancellations may come from any thread; the service thread sleeps until the
/// earliest deadline, or indefinitely while the heap is empty, and releases the
/// listener of every timer whose deadline has passed.
pub struct TimerService {
    inner: Arc<Inner>,
    handle: Mutex<Option<thread::JoinHandle<()>>>,
}

struct Inner {
    heap: Mutex<TimerHeap>,
    cond: Condvar,
    shutdown: AtomicBool,

    /// Timers popped from the heap whose listeners are being released.
    firing: AtomicUsize,
}

impl TimerService {
    pub(crate) fn start() -> Result<Self> {
        clock::init();

        let inner = Arc::new(Inner {
            heap: Mutex::new(TimerHeap::new()),
            cond: Condvar::new(),
            shutdown: AtomicBool::new(false),
            firing: AtomicUsize::new(0),
        });

        let handle = {
            let inner = Arc::clone(&inner);
            thread::Builder::new()
                .name(TIMER_THREAD_NAME.to_string())
                .spawn(move || inner.run())?
        };

        Ok(Self {
            inner,
            handle: Mutex::new(Some(handle)),
        })
    }

    /// Arms `timer` to release `listener` at `deadline`. A timer that is already
    /// queued is moved to its new position instead of being queued twice.
    pub fn submit(
        &self,
        timer: &Arc<Timer>,
        deadline: u64,
        listener: Arc<Listener>,
    ) -> Result<(), TimeError> {
        let mut heap = self.inner.heap.lock();

        if self.inner.shutdown.load(Ordering::Acquire) {
            return Err(TimeError::ServiceShutdown);
        }

        timer.arm(listener);
        timer.set_deadline(deadline);

        if timer.is_queued() {
            heap.reschedule(timer.index());
        } else {
            heap.add(Arc::clone(timer));
        }

        // Only a new earliest deadline shortens the service's current sleep.
        if timer.index() == 1 {
            self.inner.cond.notify_one();
        }

        Ok(())
    }

    /// Arms `timer` to fire `after` from now.
    pub fn submit_after(
        &self,
        timer: &Arc<Timer>,
        after: Duration,
        listener: Arc<Listener>,
    ) -> Result<(), TimeError> {
        self.submit(timer, clock::deadline_after(after), listener)
    }

    /// Disarms `timer`. Returns `true` if it was still queued.
    ///
    /// Once this returns, the timer will not release its listener. A timer the
    /// service already popped may still be delivering, but that delivery goes
    /// through the listener's one-shot flag.
    pub fn cancel(&self, timer: &Arc<Timer>) -> bool {
        let mut heap = self.inner.heap.lock();

        timer.take_listener();

        if !timer.is_queued() {
            return false;
        }

        let removed = heap.remove(timer.index());
        debug_assert!(removed.as_ref().is_none_or(|t| Arc::ptr_eq(t, timer)));
        removed.is_some()
    }

    /// Number of queued timers, counting the expired ones still being
    /// released.
    pub fn len(&self) -> usize {
        self.inner.heap.lock().len() + self.inner.firing.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_shutdown(&self) -> bool {
        self.inner.shutdown.load(Ordering::Acquire)
    }

    /// Stops the service thread. Timers still queued are dropped without
    /// firing.
    pub(crate) fn shutdown(&self) -> Result<()> {
        {
            let _heap = self.inner.heap.lock();
            if self.inner.shutdown.swap(true, Ordering::AcqRel) {
                return Ok(());
            }
            self.inner.cond.notify_all();
        }

        let Some(handle) = self.handle.lock().take() else {
            return Ok(());
        };

        if handle.thread().id() == thread::current().id() {
            return Ok(());
        }

        handle
            .join()
            .map_err(|_| anyhow!("{} thread panicked", TIMER_THREAD_NAME))
    }
}

impl Inner {
    fn run(&self) {
        tracing::debug!("timer service started");

        let mut heap = self.heap.lock();
        let mut fired = Vec::new();

        while !self.shutdown.load(Ordering::Acquire) {
            let now = clock::now();
            self.pop_expired(&mut heap, now, &mut fired);

            if !fired.is_empty() {
                self.firing.store(fired.len(), Ordering::Release);

                // Wake tasks without holding the heap lock, a woken task may
                // submit a new timer right away.
                MutexGuard::unlocked(&mut heap, || {
                    for listener in fired.drain(..) {
                        listener.deliver(Event::TimedOut);
                        self.firing.fetch_sub(1, Ordering::AcqRel);
                    }
                });
                continue;
            }

            match heap.peek().map(|t| t.deadline()) {
                None => self.cond.wait(&mut heap),
                Some(deadline) => {
                    let delay = Duration::from_nanos(deadline.saturating_sub(now));
                    self.cond.wait_for(&mut heap, delay);
                }
            }
        }

        let dropped = heap.clear();
        for timer in &dropped {
            timer.take_listener();
        }

        tracing::debug!(dropped = dropped.len(), "timer service stopped");
    }

    fn pop_expired(&self, heap: &mut TimerHeap, now: u64, fired: &mut Vec<Arc<Listener>>) {
        while heap.peek().is_some_and(|t| t.deadline() <= now) {
            let Some(timer) = heap.poll_min() else {
                break;
            };

            if let Some(listener) = timer.take_listener() {
                fired.push(listener);
            }
        }
    }
}

impl Drop for TimerService {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            tracing::warn!("error during timer service shutdown: {e:?}");
        }
    }
}

impl fmt::Debug for TimerService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimerService")
            .field("len", &self.len())
            .field("shutdown", &self.is_shutdown())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::PauseReason;
    use crate::test_utils::mock_waker;
    use static_assertions::assert_impl_all;
    use std::time::Instant;

    assert_impl_all!(TimerService: Send, Sync);

    fn wait_until(mut cond: impl FnMut() -> bool, limit: Duration) -> bool {
        let start = Instant::now();
        while !cond() {
            if start.elapsed() > limit {
                return false;
            }
            thread::sleep(Duration::from_millis(1));
        }
        true
    }

    #[test]
    fn test_timer_fires_after_deadline() -> Result<()> {
        let service = TimerService::start()?;
        let (waker, data) = mock_waker();
        let listener = Listener::new(waker);
        let timer = Timer::new();

        let start = Instant::now();
        service.submit_after(&timer, Duration::from_millis(20), Arc::clone(&listener))?;
        assert!(timer.is_valid(&listener));

        assert!(wait_until(|| listener.is_delivered(), Duration::from_secs(2)));
        assert!(start.elapsed() >= Duration::from_millis(20));
        assert_eq!(listener.delivered(), Some(Event::TimedOut));
        assert_eq!(data.get_count(), 1);
        assert!(!timer.is_queued());
        assert!(!timer.is_valid(&listener));
        assert!(service.is_empty());

        service.shutdown()
    }

    #[test]
    fn test_fires_in_deadline_order() -> Result<()> {
        let service = TimerService::start()?;
        let order = Arc::new(Mutex::new(Vec::new()));

        let listeners = [40u64, 10, 30, 20]
            .into_iter()
            .map(|ms| {
                let order = Arc::clone(&order);
                let waker = crate::test_utils::fn_waker(move || order.lock().push(ms));
                let listener = Listener::new(waker);
                let timer = Timer::new();
                service
                    .submit_after(&timer, Duration::from_millis(ms), Arc::clone(&listener))
                    .map(|_| (timer, listener))
            })
            .collect::<Result<Vec<_>, _>>()?;

        assert!(wait_until(
            || listeners.iter().all(|(_, l)| l.is_delivered()),
            Duration::from_secs(2)
        ));
        assert_eq!(*order.lock(), vec![10, 20, 30, 40]);

        service.shutdown()
    }

    #[test]
    fn test_cancelled_timer_never_fires() -> Result<()> {
        let service = TimerService::start()?;
        let (waker, data) = mock_waker();
        let listener = Listener::new(waker);
        let timer = Timer::new();

        service.submit_after(&timer, Duration::from_millis(10), Arc::clone(&listener))?;
        assert!(service.cancel(&timer));
        assert!(!service.cancel(&timer));

        thread::sleep(Duration::from_millis(30));
        assert!(!listener.is_delivered());
        assert_eq!(data.get_count(), 0);

        service.shutdown()
    }

    #[test]
    fn test_resubmit_reuses_slot() -> Result<()> {
        let service = TimerService::start()?;
        let (waker, _) = mock_waker();
        let timer = Timer::new();

        service.submit_after(&timer, Duration::from_secs(60), Listener::new(waker.clone()))?;
        service.submit_after(&timer, Duration::from_secs(30), Listener::new(waker))?;
        assert_eq!(service.len(), 1);

        // An earlier timer submitted later wakes the service early.
        let (waker, _) = mock_waker();
        let early = Listener::new(waker);
        service.submit_after(&Timer::new(), Duration::from_millis(5), Arc::clone(&early))?;
        assert!(wait_until(|| early.is_delivered(), Duration::from_secs(2)));
        assert_eq!(service.len(), 1);

        service.shutdown()
    }

    #[test]
    fn test_submit_after_shutdown_fails() -> Result<()> {
        let service = TimerService::start()?;
        let (waker, _) = mock_waker();
        let timer = Timer::new();

        service.submit_after(&timer, Duration::from_secs(60), Listener::new(waker.clone()))?;
        service.shutdown()?;
        service.shutdown()?;

        assert!(service.is_shutdown());
        assert!(service.is_empty());
        assert!(!timer.is_queued());
        assert!(matches!(
            service.submit_after(&timer, Duration::from_millis(1), Listener::new(waker)),
            Err(TimeError::ServiceShutdown)
        ));

        Ok(())
    }
}
