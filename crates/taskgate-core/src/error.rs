use thiserror::Error;

use crate::domain::TaskKey;

/// Error type producers may return; anything convertible into it works.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Failures raised by a `StateStore` or `SignalChannel` backend.
///
/// These are never masked by the coordinator: if the backend cannot answer,
/// the at-most-one-run guarantee cannot be upheld either.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("failed to connect to backend: {0}")]
    Connect(String),

    #[error("backend command failed: {0}")]
    Command(String),

    #[error("unknown task state value: {0:?}")]
    InvalidState(String),

    #[error("backend is closed")]
    Closed,
}

impl BackendError {
    pub(crate) fn command(err: impl std::fmt::Display) -> Self {
        BackendError::Command(err.to_string())
    }
}

#[derive(Debug, Error)]
pub enum InterruptError {
    /// The CAS gate refused the run: another execution owns the slot.
    #[error("task {0} is already in RUNNING state")]
    AlreadyRunning(TaskKey),

    #[error("producer failed: {0}")]
    Producer(#[source] BoxError),

    #[error("producer for task {0} panicked")]
    ProducerPanicked(TaskKey),

    #[error(transparent)]
    Backend(#[from] BackendError),
}

impl InterruptError {
    pub fn is_contention(&self) -> bool {
        matches!(self, InterruptError::AlreadyRunning(_))
    }
}
