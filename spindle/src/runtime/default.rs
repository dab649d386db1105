//! Process-wide default scheduler.
//!
//! [`spawn`](crate::spawn) and [`spawn_builder`](crate::spawn_builder) fall
//! back to this scheduler when the calling thread is not driven by one. It is
//! built lazily with [`Builder::new`] settings on first use, and rebuilt if the
//! previous one was shut down.
use crate::runtime::{Builder, Scheduler};
use anyhow::Result;
use parking_lot::Mutex;

static DEFAULT: Mutex<Option<Scheduler>> = Mutex::new(None);

/// Returns the default scheduler, starting it if needed.
pub fn get() -> Result<Scheduler> {
    let mut slot = DEFAULT.lock();

    match slot.as_ref() {
        Some(scheduler) if !scheduler.is_shutdown() => Ok(scheduler.clone()),
        _ => {
            let scheduler = Builder::new().try_build()?;
            tracing::debug!("default scheduler started");
            Ok(slot.insert(scheduler).clone())
        }
    }
}

/// Installs `scheduler` as the default. Returns the previous default, which
/// keeps running until it is shut down.
pub fn set(scheduler: Scheduler) -> Option<Scheduler> {
    DEFAULT.lock().replace(scheduler)
}

/// Shuts the default scheduler down, if there is one. The next call to
/// [`get`] builds a new one.
pub fn shutdown() -> Result<()> {
    // Shutdown joins threads, not under the lock.
    let scheduler = DEFAULT.lock().take();

    match scheduler {
        Some(scheduler) => scheduler.shutdown(),
        None => Ok(()),
    }
}
