use super::{Inner, Mailbox};
use crate::context;
use crate::task::{Listener, ListenerCell, PauseReason};
use crate::time::{Timer, TimerService, clock};
use pin_project::{pin_project, pinned_drop};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};
use std::time::Duration;

/// Bookkeeping for one wait on one side of a mailbox.
///
/// The same listener is registered on the mailbox side and, for timed waits,
/// armed on the wait's timer. Whichever fires first wins the listener's
/// one-shot flag. Finishing the wait removes the listener from the mailbox and
/// cancels the timer, so nothing outlives the wait.
#[derive(Debug)]
struct Wait {
    listener: Option<Arc<Listener>>,
    deadline: Option<u64>,
    timer: Option<Arc<Timer>>,
    timers: Option<Arc<TimerService>>,
}

impl Wait {
    fn new(timeout: Option<Duration>) -> Self {
        Self {
            listener: None,
            deadline: timeout.map(clock::deadline_after),
            timer: None,
            timers: None,
        }
    }

    fn is_expired(&self) -> bool {
        self.deadline.is_some_and(|deadline| clock::now() >= deadline)
    }

    /// Returns the current listener when this poll is a spurious wakeup: the
    /// listener is still registered, nothing was delivered, and the waker did
    /// not change.
    fn spurious<T: Send>(&self, inner: &Inner<T>, waker: &Waker) -> Option<&Arc<Listener>> {
        self.listener.as_ref().filter(|listener| {
            !listener.is_spent() && listener.will_wake(waker) && inner.is_valid(listener)
        })
    }

    /// Arms the timer with `listener`. Returns `false` if the wait must end
    /// as timed out because no timer service can take the timer.
    fn arm(&mut self, listener: &Arc<Listener>) -> bool {
        let Some(deadline) = self.deadline else {
            return true;
        };

        let timers = match self.timers.take().or_else(context::timer_service) {
            Some(timers) => self.timers.insert(timers),
            None => {
                tracing::warn!("timed mailbox wait outside of a scheduler, timing out");
                return false;
            }
        };

        let timer = self.timer.get_or_insert_with(Timer::new);
        match timers.submit(timer, deadline, Arc::clone(listener)) {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!("cannot arm mailbox timeout, timing out: {e}");
                false
            }
        }
    }

    fn finish(&mut self, cell: &ListenerCell) {
        if let Some(listener) = self.listener.take() {
            listener.retire();
            cell.remove(&listener);
        }

        if let (Some(timer), Some(timers)) = (&self.timer, &self.timers)
            && timer.is_queued()
        {
            timers.cancel(timer);
        }
    }
}

/// Future returned by [`Mailbox::put_timeout`].
///
/// Resolves to `Ok(())` once the message is in the mailbox, or hands the
/// message back with `Err` when the timeout expires first.
#[pin_project(PinnedDrop)]
#[must_use = "futures do nothing unless you `.await` or poll them"]
pub struct Put<'a, T: Send + 'static> {
    mailbox: &'a Mailbox<T>,
    msg: Option<T>,
    wait: Wait,
}

impl<'a, T: Send + 'static> Put<'a, T> {
    pub(super) fn new(mailbox: &'a Mailbox<T>, msg: T, timeout: Option<Duration>) -> Self {
        Self {
            mailbox,
            msg: Some(msg),
            wait: Wait::new(timeout),
        }
    }
}

impl<T: Send + 'static> Future for Put<'_, T> {
    type Output = Result<(), T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        let inner = &this.mailbox.inner;

        if let Some(listener) = this.wait.spurious(inner, cx.waker()) {
            context::pause_on(Arc::clone(inner) as Arc<dyn PauseReason>, listener);
            return Poll::Pending;
        }

        let Some(msg) = this.msg.take() else {
            panic!("`Put` polled after completion");
        };

        // A slot that freed up wins over an expired deadline.
        let msg = match inner.try_put(msg) {
            Ok(()) => {
                this.wait.finish(&inner.source);
                return Poll::Ready(Ok(()));
            }
            Err(msg) => msg,
        };

        if this.wait.is_expired() {
            this.wait.finish(&inner.source);
            return Poll::Ready(Err(msg));
        }

        let listener = Listener::new(cx.waker().clone());
        let msg = match inner.try_put_with(msg, &listener) {
            Ok(()) => {
                this.wait.finish(&inner.source);
                return Poll::Ready(Ok(()));
            }
            Err(msg) => msg,
        };

        this.wait.listener = Some(Arc::clone(&listener));
        if !this.wait.arm(&listener) {
            this.wait.finish(&inner.source);
            return Poll::Ready(Err(msg));
        }

        tracing::trace!(mailbox = inner.id, "producer pausing on full mailbox");
        *this.msg = Some(msg);
        context::pause_on(Arc::clone(inner) as Arc<dyn PauseReason>, &listener);
        Poll::Pending
    }
}

#[pinned_drop]
impl<T: Send + 'static> PinnedDrop for Put<'_, T> {
    fn drop(self: Pin<&mut Self>) {
        let this = self.project();
        this.wait.finish(&this.mailbox.inner.source);
    }
}

/// Future returned by [`Mailbox::get_timeout`].
///
/// Resolves to the oldest message, or to `None` when the timeout expires
/// first.
#[derive(Debug)]
#[must_use = "futures do nothing unless you `.await` or poll them"]
pub struct Get<'a, T: Send + 'static> {
    mailbox: &'a Mailbox<T>,
    wait: Wait,
    done: bool,
}

impl<'a, T: Send + 'static> Get<'a, T> {
    pub(super) fn new(mailbox: &'a Mailbox<T>, timeout: Option<Duration>) -> Self {
        Self {
            mailbox,
            wait: Wait::new(timeout),
            done: false,
        }
    }

    fn complete(&mut self, msg: Option<T>) -> Poll<Option<T>> {
        self.wait.finish(&self.mailbox.inner.sink);
        self.done = true;
        Poll::Ready(msg)
    }
}

impl<T: Send + 'static> Future for Get<'_, T> {
    type Output = Option<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        assert!(!this.done, "`Get` polled after completion");

        let inner = Arc::clone(&this.mailbox.inner);

        if let Some(listener) = this.wait.spurious(&inner, cx.waker()) {
            context::pause_on(inner.clone(), listener);
            return Poll::Pending;
        }

        // A message that arrived wins over an expired deadline.
        if let Some(msg) = inner.try_get() {
            return this.complete(Some(msg));
        }

        if this.wait.is_expired() {
            return this.complete(None);
        }

        let listener = Listener::new(cx.waker().clone());
        if let Some(msg) = inner.try_get_with(&listener) {
            return this.complete(Some(msg));
        }

        this.wait.listener = Some(Arc::clone(&listener));
        if !this.wait.arm(&listener) {
            return this.complete(None);
        }

        tracing::trace!(mailbox = inner.id, "consumer pausing on empty mailbox");
        context::pause_on(inner, &listener);
        Poll::Pending
    }
}

impl<T: Send + 'static> Drop for Get<'_, T> {
    fn drop(&mut self) {
        self.wait.finish(&self.mailbox.inner.sink);
    }
}
