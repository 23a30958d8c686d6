//! The consumer side of a run.

use std::pin::Pin;
use std::task::{Context, Poll};

use futures::Stream;
use tokio::sync::mpsc;

use crate::domain::TaskKey;
use crate::error::InterruptError;

/// Items produced by one run, in production order.
///
/// - `Ok(item)` for every item the producer emitted before it ended.
/// - At most one `Err(..)`, after which the stream ends.
/// - The stream ends only once the run's final state has been persisted.
///
/// Dropping the stream early cancels the producer; the final state then
/// becomes `STOPPED` (unless the producer had already failed).
pub struct TaskStream<T> {
    key: TaskKey,
    rx: mpsc::UnboundedReceiver<Result<T, InterruptError>>,
}

impl<T> TaskStream<T> {
    pub(crate) fn new(key: TaskKey, rx: mpsc::UnboundedReceiver<Result<T, InterruptError>>) -> Self {
        Self { key, rx }
    }

    pub fn key(&self) -> &TaskKey {
        &self.key
    }
}

// no field is structurally pinned
impl<T> Unpin for TaskStream<T> {}

impl<T> Stream for TaskStream<T> {
    type Item = Result<T, InterruptError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().rx.poll_recv(cx)
    }
}

impl<T> std::fmt::Debug for TaskStream<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskStream").field("key", &self.key).finish()
    }
}
