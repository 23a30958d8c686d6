//! Domain model (task keys, lifecycle states, control signals).

pub mod key;
pub mod state;

pub use self::key::{DEFAULT_CHANNEL_PREFIX, STATE_KEY_PREFIX, TaskKey, state_key};
pub use self::state::{InterruptSignal, TaskState, UnknownSignal};
