//! In-process signal channel: per-subscriber unbounded queues.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, Weak};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::BackendError;
use crate::ports::{SignalChannel, SignalFrame, Subscription};

type Senders = HashMap<u64, mpsc::UnboundedSender<SignalFrame>>;

#[derive(Default)]
struct Registry {
    next_id: u64,
    channels: HashMap<String, Senders>,
}

/// `SignalChannel` for single-process deployments.
///
/// Design:
/// - Each subscription owns its own unbounded queue, so a slow listener never
///   holds up `publish` or its siblings.
/// - `publish` snapshots the channel's senders before sending.
/// - A subscription deregisters itself when dropped; an emptied channel entry
///   is removed with it.
#[derive(Default)]
pub struct LocalSignalChannel {
    registry: Arc<Mutex<Registry>>,
}

impl LocalSignalChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live subscriptions on `channel`.
    pub fn subscriber_count(&self, channel: &str) -> usize {
        let registry = self.registry.lock().unwrap_or_else(PoisonError::into_inner);
        registry.channels.get(channel).map_or(0, HashMap::len)
    }

    fn unregister(registry: &Weak<Mutex<Registry>>, channel: &str, id: u64) {
        let Some(registry) = registry.upgrade() else {
            return;
        };
        let mut registry = registry.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(senders) = registry.channels.get_mut(channel) {
            senders.remove(&id);
            if senders.is_empty() {
                registry.channels.remove(channel);
            }
        }
    }
}

#[async_trait]
impl SignalChannel for LocalSignalChannel {
    async fn publish(&self, channel: &str, message: &str) -> Result<(), BackendError> {
        let senders: Vec<_> = {
            let registry = self.registry.lock().unwrap_or_else(PoisonError::into_inner);
            match registry.channels.get(channel) {
                Some(senders) => senders.values().cloned().collect(),
                None => Vec::new(),
            }
        };

        debug!(channel, receivers = senders.len(), "publishing signal");
        for sender in senders {
            // a receiver dropped after the snapshot just misses the message
            let _ = sender.send(SignalFrame::Message(message.to_string()));
        }
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription, BackendError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = {
            let mut registry = self.registry.lock().unwrap_or_else(PoisonError::into_inner);
            let id = registry.next_id;
            registry.next_id += 1;
            registry
                .channels
                .entry(channel.to_string())
                .or_default()
                .insert(id, tx);
            id
        };
        debug!(channel, id, "subscribed");

        let registry = Arc::downgrade(&self.registry);
        let name = channel.to_string();
        Ok(Subscription::new(channel, rx).with_drop_hook(move || {
            Self::unregister(&registry, &name, id);
            debug!(channel = %name, id, "unsubscribed");
        }))
    }

    async fn close(&self) -> Result<(), BackendError> {
        let channels = {
            let mut registry = self.registry.lock().unwrap_or_else(PoisonError::into_inner);
            std::mem::take(&mut registry.channels)
        };
        for sender in channels.into_values().flat_map(HashMap::into_values) {
            let _ = sender.send(SignalFrame::Closed);
        }
        Ok(())
    }
}
