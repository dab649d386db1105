#[cfg(test)]
use anyhow::{Result, anyhow};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Wake, Waker};
use std::thread::{self, Thread};
use std::time::{Duration, Instant};

#[cfg(test)]
const MAX_PTHREAD_NAME_LEN: usize = 16;

/// Reads back the OS-level name of the current thread, as `top -H` and
/// debuggers show it. Linux caps it at 15 bytes plus the null terminator.
#[cfg(all(test, target_os = "linux"))]
pub(crate) fn get_current_thread_name() -> Result<String> {
    let mut buf: [libc::c_char; MAX_PTHREAD_NAME_LEN] = [0; MAX_PTHREAD_NAME_LEN];

    let ret = unsafe {
        libc::pthread_getname_np(libc::pthread_self(), buf.as_mut_ptr(), MAX_PTHREAD_NAME_LEN)
    };

    if ret != 0 {
        return Err(anyhow!("pthread_getname_np failed with error code: {}", ret));
    }

    let c_str = unsafe { std::ffi::CStr::from_ptr(buf.as_ptr()) };
    c_str
        .to_str()
        .map(|s| s.to_string())
        .map_err(|e| anyhow!("failed to convert thread name from CStr: {}", e))
}

#[cfg(all(test, not(target_os = "linux")))]
pub(crate) fn get_current_thread_name() -> Result<String> {
    thread::current()
        .name()
        .map(str::to_string)
        .ok_or_else(|| anyhow!("current thread is unnamed"))
}

/// Wakes a plain OS thread.
///
/// Used to drive a future from a thread that is not a worker, and by the
/// blocking mailbox variants. A wakeup that arrives before the thread parks is
/// remembered, so the next park returns immediately.
pub(crate) struct ThreadNotify {
    thread: Thread,
    notified: AtomicBool,
}

impl ThreadNotify {
    pub(crate) fn current() -> Arc<Self> {
        Arc::new(Self {
            thread: thread::current(),
            notified: AtomicBool::new(false),
        })
    }

    pub(crate) fn waker(self: &Arc<Self>) -> Waker {
        Waker::from(Arc::clone(self))
    }

    /// Parks until notified. Spurious unparks are absorbed.
    pub(crate) fn park(&self) {
        while !self.notified.swap(false, Ordering::Acquire) {
            thread::park();
        }
    }

    /// Parks until notified or until `deadline`. Returns `false` on timeout.
    pub(crate) fn park_until(&self, deadline: Instant) -> bool {
        loop {
            if self.notified.swap(false, Ordering::Acquire) {
                return true;
            }

            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            thread::park_timeout(deadline - now);
        }
    }

    pub(crate) fn park_timeout(&self, timeout: Duration) -> bool {
        self.park_until(Instant::now() + timeout)
    }
}

impl Wake for ThreadNotify {
    fn wake(self: Arc<Self>) {
        self.wake_by_ref();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        if !self.notified.swap(true, Ordering::Release) {
            self.thread.unpark();
        }
    }
}
