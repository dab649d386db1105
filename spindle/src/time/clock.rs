//! Monotonic time expressed as nanoseconds since a process-wide epoch.
//!
//! Deadlines are stored in atomics, so they are kept as plain `u64` rather than
//! `Instant`.
use std::sync::LazyLock;
use std::time::{Duration, Instant};

static EPOCH: LazyLock<Instant> = LazyLock::new(Instant::now);

/// Nanoseconds elapsed since the epoch.
pub fn now() -> u64 {
    since_epoch(Instant::now())
}

/// Converts an instant to nanoseconds since the epoch. Instants taken before
/// the epoch saturate to zero.
pub fn since_epoch(at: Instant) -> u64 {
    saturating_nanos(at.saturating_duration_since(*EPOCH))
}

/// The deadline `after` from now.
pub fn deadline_after(after: Duration) -> u64 {
    now().saturating_add(saturating_nanos(after))
}

/// Time left until `deadline`, or `None` if it already passed.
pub fn until(deadline: u64) -> Option<Duration> {
    deadline
        .checked_sub(now())
        .filter(|nanos| *nanos > 0)
        .map(Duration::from_nanos)
}

fn saturating_nanos(d: Duration) -> u64 {
    u64::try_from(d.as_nanos()).unwrap_or(u64::MAX)
}

/// Forces the epoch to be initialized.
pub(crate) fn init() {
    LazyLock::force(&EPOCH);
}
