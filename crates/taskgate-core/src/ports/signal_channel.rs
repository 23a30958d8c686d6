//! SignalChannel port - 名前付き pub/sub
//!
//! 購読中のリスナーにだけ届く（リプレイなし）。
//! クローズ時は番兵フレームで全購読者を起こす。

use std::pin::Pin;
use std::task::{Context, Poll};

use async_trait::async_trait;
use futures::Stream;
use tokio::sync::mpsc;

use crate::error::BackendError;

/// Named publish/subscribe transport for control messages.
#[async_trait]
pub trait SignalChannel: Send + Sync {
    /// Fan `message` out to every listener currently subscribed to `channel`.
    /// Publishing to a channel nobody listens on is a silent no-op.
    async fn publish(&self, channel: &str, message: &str) -> Result<(), BackendError>;

    /// Start listening on `channel`. Returns once the subscription is live,
    /// so anything published afterwards is delivered.
    async fn subscribe(&self, channel: &str) -> Result<Subscription, BackendError>;

    /// Release the transport and wake every open subscription.
    async fn close(&self) -> Result<(), BackendError>;
}

/// What a backend pushes into a subscription's queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalFrame {
    Message(String),
    /// Closing sentinel: the transport is going away.
    Closed,
}

type DropHook = Box<dyn FnOnce() + Send + 'static>;

/// A live subscription, consumed as a `Stream` of message payloads.
///
/// The stream ends on the closing sentinel or when the backend drops its
/// sender. Dropping the subscription runs the backend's cleanup hook
/// (deregistration / unsubscribe) no matter how the consumer stopped.
pub struct Subscription {
    channel: String,
    rx: mpsc::UnboundedReceiver<SignalFrame>,
    done: bool,
    on_drop: Option<DropHook>,
}

impl Subscription {
    pub fn new(channel: impl Into<String>, rx: mpsc::UnboundedReceiver<SignalFrame>) -> Self {
        Self {
            channel: channel.into(),
            rx,
            done: false,
            on_drop: None,
        }
    }

    /// Register cleanup to run when the subscription is dropped.
    pub fn with_drop_hook(mut self, hook: impl FnOnce() + Send + 'static) -> Self {
        self.on_drop = Some(Box::new(hook));
        self
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }
}

impl Stream for Subscription {
    type Item = String;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<String>> {
        let this = self.get_mut();
        if this.done {
            return Poll::Ready(None);
        }
        match this.rx.poll_recv(cx) {
            Poll::Ready(Some(SignalFrame::Message(message))) => Poll::Ready(Some(message)),
            Poll::Ready(Some(SignalFrame::Closed)) | Poll::Ready(None) => {
                this.done = true;
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(hook) = self.on_drop.take() {
            hook();
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("channel", &self.channel)
            .field("done", &self.done)
            .finish()
    }
}
