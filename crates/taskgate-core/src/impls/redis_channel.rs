//! Redis pub/sub signal channel.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use fred::clients::Client;
use fred::interfaces::{ClientLike, EventInterface, PubsubInterface};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::BackendError;
use crate::impls::redis_connect;
use crate::ports::{SignalChannel, SignalFrame, Subscription};

/// `SignalChannel` over Redis PUBLISH/SUBSCRIBE.
///
/// Publishing goes through the shared client. Every subscription gets its own
/// connection (a subscribed connection cannot issue regular commands), driven
/// by a forwarding task that unsubscribes and disconnects when the
/// subscription is dropped or the channel is closed.
pub struct RedisSignalChannel {
    client: Client,
    shutdown: CancellationToken,
    closed: AtomicBool,
}

impl RedisSignalChannel {
    pub async fn connect(url: &str) -> Result<Self, BackendError> {
        let client = redis_connect(url).await?;
        Ok(Self::from_client(client))
    }

    pub fn from_client(client: Client) -> Self {
        Self {
            client,
            shutdown: CancellationToken::new(),
            closed: AtomicBool::new(false),
        }
    }

    fn ensure_open(&self) -> Result<(), BackendError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(BackendError::Closed);
        }
        Ok(())
    }
}

#[async_trait]
impl SignalChannel for RedisSignalChannel {
    async fn publish(&self, channel: &str, message: &str) -> Result<(), BackendError> {
        self.ensure_open()?;
        let receivers: i64 = self
            .client
            .publish(channel, message)
            .await
            .map_err(BackendError::command)?;
        debug!(channel, receivers, "publishing signal");
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription, BackendError> {
        self.ensure_open()?;
        let subscriber = self.client.clone_new();
        subscriber
            .init()
            .await
            .map_err(|e| BackendError::Connect(e.to_string()))?;

        // grab the receiver before SUBSCRIBE so nothing slips past
        let messages = subscriber.message_rx();
        if let Err(err) = subscriber.subscribe(channel).await {
            let _ = subscriber.quit().await;
            return Err(BackendError::command(err));
        }
        debug!(channel, "subscribed");

        let (tx, rx) = mpsc::unbounded_channel();
        let detach = self.shutdown.child_token();
        tokio::spawn(forward(
            subscriber,
            channel.to_string(),
            messages,
            tx,
            detach.clone(),
        ));

        Ok(Subscription::new(channel, rx).with_drop_hook(move || detach.cancel()))
    }

    async fn close(&self) -> Result<(), BackendError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.shutdown.cancel();
        self.client.quit().await.map_err(BackendError::command)
    }
}

/// Pump data frames for `channel` from the subscriber connection into `tx`.
///
/// Only payload messages for this exact channel are forwarded; anything else
/// the connection reports is dropped.
async fn forward(
    subscriber: Client,
    channel: String,
    mut messages: tokio::sync::broadcast::Receiver<fred::types::Message>,
    tx: mpsc::UnboundedSender<SignalFrame>,
    detach: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = detach.cancelled() => {
                let _ = tx.send(SignalFrame::Closed);
                break;
            }
            _ = tx.closed() => break,
            received = messages.recv() => match received {
                Ok(message) => {
                    if &*message.channel != channel.as_str() {
                        continue;
                    }
                    let Some(payload) = message.value.as_string() else {
                        continue;
                    };
                    if tx.send(SignalFrame::Message(payload)).is_err() {
                        break;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(channel = %channel, skipped, "subscriber lagged, messages dropped");
                }
                Err(RecvError::Closed) => {
                    let _ = tx.send(SignalFrame::Closed);
                    break;
                }
            },
        }
    }

    if let Err(err) = subscriber.unsubscribe(channel.as_str()).await {
        debug!(channel = %channel, error = %err, "unsubscribe failed");
    }
    if let Err(err) = subscriber.quit().await {
        debug!(channel = %channel, error = %err, "subscriber quit failed");
    }
    debug!(channel = %channel, "unsubscribed");
}
