//! Tasks, their identity and the pause/resume protocol.
mod error;
pub use self::error::JoinError;

pub mod id;
pub use self::id::{Id, id, try_id};

mod join;
pub use self::join::JoinHandle;

mod pause;
pub(crate) use self::pause::{ListenerCell, Pause};
pub use self::pause::{Event, Listener, PauseReason};

mod state;
pub use self::state::Lifecycle;

pub(crate) mod task;
pub(crate) use self::task::{Step, Task, new_task};
