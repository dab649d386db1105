//! Timers, sleeping and cooperative yielding.
pub mod clock;

mod error;
pub use error::TimeError;

pub(crate) mod heap;

mod service;
pub use service::TimerService;

mod sleep;
pub use sleep::{Sleep, sleep};

mod timer;
pub use timer::Timer;

mod yield_now;
pub use yield_now::{YieldNow, yield_now};
