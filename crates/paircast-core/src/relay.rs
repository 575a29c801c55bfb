//! Relay transport abstraction.
//!
//! The engine never talks to a network directly; it publishes and
//! subscribes through [`Relay`]. An implementation represents one client
//! connection to a shared relay, so publishes are not echoed back to the
//! publisher and unsubscribing releases only the caller's subscriptions.
//! [`MemoryRelay`] is an in-process hub for tests and demos; real backends
//! bridge to a relay server.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{mpsc, RwLock};
use tracing::debug;

use paircast_proto::types::Topic;

use crate::errors::RelayError;

/// A payload delivered on a subscribed topic.
#[derive(Debug, Clone)]
pub struct RelayMessage {
    pub topic: Topic,
    pub payload: Bytes,
}

/// One client connection to a publish/subscribe relay.
#[async_trait]
pub trait Relay: Send + Sync {
    /// Deliver a payload to every other subscriber of `topic`.
    async fn publish(&self, topic: &Topic, payload: Bytes) -> Result<(), RelayError>;

    /// Open a subscription; messages arrive on the returned receiver.
    /// A topic can have any number of subscribers across clients.
    async fn subscribe(&self, topic: &Topic) -> Result<mpsc::Receiver<RelayMessage>, RelayError>;

    /// Release this client's subscriptions for `topic`. Other clients
    /// keep theirs.
    async fn unsubscribe(&self, topic: &Topic) -> Result<(), RelayError>;
}

// ============================================================================
// In-memory relay hub
// ============================================================================

const CHANNEL_CAPACITY: usize = 64;

/// In-process relay hub. Each participant takes a [`MemoryRelayClient`]
/// via [`MemoryRelay::client`]; messages fan out to every subscribed
/// client except the publisher.
#[derive(Default)]
pub struct MemoryRelay {
    next_client: AtomicU64,
    subscribers: RwLock<HashMap<Topic, Vec<Subscription>>>,
}

struct Subscription {
    client_id: u64,
    sender: mpsc::Sender<RelayMessage>,
}

impl MemoryRelay {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn new_shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Open a new client connection to this hub.
    pub fn client(self: &Arc<Self>) -> MemoryRelayClient {
        MemoryRelayClient {
            hub: Arc::clone(self),
            client_id: self.next_client.fetch_add(1, Ordering::Relaxed),
        }
    }

    /// Live subscription channels for a topic, across all clients.
    pub async fn subscriber_count(&self, topic: &Topic) -> usize {
        self.subscribers
            .read()
            .await
            .get(topic)
            .map(|subs| subs.iter().filter(|s| !s.sender.is_closed()).count())
            .unwrap_or(0)
    }
}

/// A single client's handle onto a [`MemoryRelay`].
pub struct MemoryRelayClient {
    hub: Arc<MemoryRelay>,
    client_id: u64,
}

#[async_trait]
impl Relay for MemoryRelayClient {
    async fn publish(&self, topic: &Topic, payload: Bytes) -> Result<(), RelayError> {
        let senders: Vec<mpsc::Sender<RelayMessage>> = {
            let subscribers = self.hub.subscribers.read().await;
            subscribers
                .get(topic)
                .map(|subs| {
                    subs.iter()
                        .filter(|s| s.client_id != self.client_id)
                        .map(|s| s.sender.clone())
                        .collect()
                })
                .unwrap_or_default()
        };

        if senders.is_empty() {
            debug!(%topic, "publish with no other subscribers");
            return Ok(());
        }

        let message = RelayMessage {
            topic: topic.clone(),
            payload,
        };
        for tx in senders {
            // A dropped receiver is not an error for the publisher.
            let _ = tx.send(message.clone()).await;
        }
        Ok(())
    }

    async fn subscribe(&self, topic: &Topic) -> Result<mpsc::Receiver<RelayMessage>, RelayError> {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        self.hub
            .subscribers
            .write()
            .await
            .entry(topic.clone())
            .or_default()
            .push(Subscription {
                client_id: self.client_id,
                sender: tx,
            });
        Ok(rx)
    }

    async fn unsubscribe(&self, topic: &Topic) -> Result<(), RelayError> {
        let mut subscribers = self.hub.subscribers.write().await;
        if let Some(subs) = subscribers.get_mut(topic) {
            subs.retain(|s| s.client_id != self.client_id && !s.sender.is_closed());
            if subs.is_empty() {
                subscribers.remove(topic);
            }
        }
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================
