//! Message-bus seam.
//!
//! The bridge only needs two things from a broker connection: publish a payload on a
//! topic, and deliver inbound traffic as [`LinkEvent`]s on a channel. [`MemoryBus`] is an
//! in-process hub used for loopback runs and tests. The broker links live in
//! [`crate::mqtt`] and [`crate::link`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc};
use tracing::warn;

use crate::error::{BridgeError, Result};

/// One message received on a subscribed topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: String,
}

impl InboundMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
        }
    }
}

/// Connection lifecycle and traffic, in arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    Connected,
    Message(InboundMessage),
    Disconnected(String),
}

/// Outbound half of a broker connection.
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Publishes `payload` on `topic`.
    async fn publish(&self, topic: &str, payload: &str) -> Result<()>;

    /// Whether the link to the broker is currently up.
    fn is_connected(&self) -> bool;
}

const HUB_CAPACITY: usize = 1024;

/// In-process broker with exact-topic subscriptions.
#[derive(Debug, Clone)]
pub struct MemoryBus {
    hub: broadcast::Sender<InboundMessage>,
    connected: Arc<AtomicBool>,
}

impl Default for MemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBus {
    pub fn new() -> Self {
        let (hub, _) = broadcast::channel(HUB_CAPACITY);
        Self {
            hub,
            connected: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Simulates the broker going away or coming back.
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    /// Every message published on the hub, regardless of topic.
    pub fn tap(&self) -> broadcast::Receiver<InboundMessage> {
        self.hub.subscribe()
    }

    /// Delivers messages on `topics` to the returned channel, preceded by `Connected`.
    pub fn subscribe(&self, topics: Vec<String>) -> mpsc::UnboundedReceiver<LinkEvent> {
        let mut rx = self.hub.subscribe();
        let (tx, out) = mpsc::unbounded_channel();
        let _ = tx.send(LinkEvent::Connected);
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(msg) => {
                        if topics.iter().any(|t| *t == msg.topic)
                            && tx.send(LinkEvent::Message(msg)).is_err()
                        {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "memory bus subscriber lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        let _ = tx.send(LinkEvent::Disconnected("hub closed".to_string()));
                        break;
                    }
                }
            }
        });
        out
    }
}

#[async_trait]
impl MessageBus for MemoryBus {
    async fn publish(&self, topic: &str, payload: &str) -> Result<()> {
        if !self.is_connected() {
            return Err(BridgeError::ConnectivityLost("memory bus offline".to_string()));
        }
        // No subscribers is not an error for a broker.
        let _ = self.hub.send(InboundMessage::new(topic, payload));
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}
