//! Task keys: one exclusive execution slot per (user, session).

use std::fmt;

use serde::{Deserialize, Serialize};

/// Prefix under which both backends persist a key's state record.
pub const STATE_KEY_PREFIX: &str = "state:";

/// Default prefix for a key's signal channel.
pub const DEFAULT_CHANNEL_PREFIX: &str = "chan:";

/// Identifier of one logical execution slot.
///
/// Derived deterministically as `"{user_id}:{session_id}"`, so every process
/// sharing a backend agrees on it without coordination.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskKey(String);

impl TaskKey {
    pub fn new(user_id: &str, session_id: &str) -> Self {
        Self(format!("{user_id}:{session_id}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Name of the pub/sub channel stop signals for this key travel on.
    pub fn channel(&self, prefix: &str) -> String {
        format!("{prefix}{}", self.0)
    }
}

impl fmt::Display for TaskKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for TaskKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Storage key for the state record of `key`.
pub fn state_key(key: &str) -> String {
    format!("{STATE_KEY_PREFIX}{key}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_joins_user_and_session() {
        let key = TaskKey::new("alice", "s-1");
        assert_eq!(key.as_str(), "alice:s-1");
        assert_eq!(key.to_string(), "alice:s-1");
    }

    #[test]
    fn channel_and_state_names_are_prefixed() {
        let key = TaskKey::new("alice", "s-1");
        assert_eq!(key.channel(DEFAULT_CHANNEL_PREFIX), "chan:alice:s-1");
        assert_eq!(state_key(key.as_str()), "state:alice:s-1");
    }

    #[test]
    fn distinct_sessions_get_distinct_keys() {
        assert_ne!(TaskKey::new("alice", "s-1"), TaskKey::new("alice", "s-2"));
        assert_ne!(TaskKey::new("alice", "s-1"), TaskKey::new("bob", "s-1"));
    }
}
