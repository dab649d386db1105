//! A cooperative fiber scheduler.
//!
//! Tasks are futures run by a fixed pool of worker threads. A task runs until
//! it pauses on a resource, a [`Mailbox`](mailbox::Mailbox) or a timer, and the
//! resource puts it back into a run queue when it can make progress again.

#[doc(inline)]
pub use spindle_macros::main;

#[doc(inline)]
pub use spindle_macros::test;

mod context;

pub mod mailbox;

pub mod runtime;
pub use runtime::{Scheduler, spawn, spawn_builder};

pub mod task;

pub mod time;

mod utils;

#[cfg(test)]
mod test_utils;
