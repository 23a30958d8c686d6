//! Task lifecycle states and control signals.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::BackendError;

/// Lifecycle of one execution slot.
///
/// State transitions (driven by the coordinator):
/// - (absent) -> Running            (CAS gate)
/// - Running -> Finished            (producer exhausted)
/// - Running -> Stopped             (cancelled by a stop signal or abandonment)
/// - Running -> Error               (producer failed; sticky against finalization)
///
/// `Idle` is never written by the coordinator; it exists for callers that want
/// an explicit "nothing running" marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskState {
    Idle,
    Running,
    Stopped,
    Finished,
    Error,
}

impl TaskState {
    /// Wire name, as persisted by the shared backend.
    pub fn as_str(self) -> &'static str {
        match self {
            TaskState::Idle => "IDLE",
            TaskState::Running => "RUNNING",
            TaskState::Stopped => "STOPPED",
            TaskState::Finished => "FINISHED",
            TaskState::Error => "ERROR",
        }
    }

    /// Is this one of the states a run ends in?
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskState::Stopped | TaskState::Finished | TaskState::Error
        )
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskState {
    type Err = BackendError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "IDLE" => Ok(TaskState::Idle),
            "RUNNING" => Ok(TaskState::Running),
            "STOPPED" => Ok(TaskState::Stopped),
            "FINISHED" => Ok(TaskState::Finished),
            "ERROR" => Ok(TaskState::Error),
            other => Err(BackendError::InvalidState(other.to_string())),
        }
    }
}

/// Out-of-band control messages carried on a task's signal channel.
///
/// Only `Stop` is acted upon; `Pause` and `Resume` are reserved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InterruptSignal {
    Stop,
    Pause,
    Resume,
}

impl InterruptSignal {
    pub fn as_str(self) -> &'static str {
        match self {
            InterruptSignal::Stop => "STOP",
            InterruptSignal::Pause => "PAUSE",
            InterruptSignal::Resume => "RESUME",
        }
    }
}

impl fmt::Display for InterruptSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returned when a channel message is not a known signal name.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown interrupt signal: {0:?}")]
pub struct UnknownSignal(pub String);

impl FromStr for InterruptSignal {
    type Err = UnknownSignal;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "STOP" => Ok(InterruptSignal::Stop),
            "PAUSE" => Ok(InterruptSignal::Pause),
            "RESUME" => Ok(InterruptSignal::Resume),
            other => Err(UnknownSignal(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::idle(TaskState::Idle, "IDLE")]
    #[case::running(TaskState::Running, "RUNNING")]
    #[case::stopped(TaskState::Stopped, "STOPPED")]
    #[case::finished(TaskState::Finished, "FINISHED")]
    #[case::error(TaskState::Error, "ERROR")]
    fn task_state_uses_upper_case_wire_names(#[case] state: TaskState, #[case] wire: &str) {
        assert_eq!(state.to_string(), wire);
        assert_eq!(wire.parse::<TaskState>().unwrap(), state);
    }

    #[test]
    fn unknown_state_is_rejected() {
        let err = "running".parse::<TaskState>().unwrap_err();
        assert!(matches!(err, BackendError::InvalidState(v) if v == "running"));
    }

    #[test]
    fn only_end_states_are_terminal() {
        assert!(!TaskState::Idle.is_terminal());
        assert!(!TaskState::Running.is_terminal());
        assert!(TaskState::Stopped.is_terminal());
        assert!(TaskState::Finished.is_terminal());
        assert!(TaskState::Error.is_terminal());
    }

    #[test]
    fn signals_parse_from_their_names() {
        assert_eq!("STOP".parse::<InterruptSignal>(), Ok(InterruptSignal::Stop));
        assert_eq!("PAUSE".parse::<InterruptSignal>(), Ok(InterruptSignal::Pause));
        assert_eq!(
            "RESUME".parse::<InterruptSignal>(),
            Ok(InterruptSignal::Resume)
        );
        assert!("stop".parse::<InterruptSignal>().is_err());
    }
}
