//! The message bus contract.
//!
//! A service only needs three things from the bus: publishing a payload on a
//! subject, subscribing to a subject pattern (optionally load balanced in a
//! queue group), and receiving the inbound messages of a subscription together
//! with their reply subject.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::TransportResult;

// =============================================================================
// InboundMessage
// =============================================================================

/// A message delivered by the bus.
#[derive(Clone, PartialEq, Eq)]
pub struct InboundMessage {
    /// The subject the message was published on.
    pub subject: String,
    /// Subject to publish the reply on, if the sender expects one.
    pub reply: Option<String>,
    /// Raw payload.
    pub payload: Vec<u8>,
}

impl InboundMessage {
    /// Creates a message.
    pub fn new(subject: impl Into<String>, reply: Option<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            subject: subject.into(),
            reply,
            payload: payload.into(),
        }
    }
}

impl fmt::Debug for InboundMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InboundMessage")
            .field("subject", &self.subject)
            .field("reply", &self.reply)
            .field("payload_len", &self.payload.len())
            .finish()
    }
}

// =============================================================================
// Subscription
// =============================================================================

/// A stream of messages matching a subscribed subject pattern.
///
/// Dropping the subscription unsubscribes.
#[derive(Debug)]
pub struct Subscription {
    subject: String,
    rx: mpsc::Receiver<InboundMessage>,
}

impl Subscription {
    /// Wraps a receiver fed by the bus.
    pub fn new(subject: impl Into<String>, rx: mpsc::Receiver<InboundMessage>) -> Self {
        Self {
            subject: subject.into(),
            rx,
        }
    }

    /// The subscribed subject pattern.
    pub fn subject(&self) -> &str {
        &self.subject
    }

    /// Waits for the next message. Returns `None` once the bus closed the subscription.
    pub async fn next(&mut self) -> Option<InboundMessage> {
        self.rx.recv().await
    }
}

// =============================================================================
// Connection
// =============================================================================

/// A connection to a publish/subscribe message bus.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Publishes `payload` on `subject`.
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> TransportResult<()>;

    /// Subscribes to `subject`, which may contain `*` and `>` wildcards.
    ///
    /// Subscriptions sharing a `queue_group` receive each message only once
    /// between them.
    async fn subscribe(&self, subject: &str, queue_group: Option<&str>) -> TransportResult<Subscription>;

    /// Flushes buffered outbound messages.
    async fn flush(&self) -> TransportResult<()> {
        Ok(())
    }

    /// Returns whether the connection is currently usable.
    fn is_connected(&self) -> bool {
        true
    }
}

/// Shared, type-erased connection.
pub type BoxedConnection = Arc<dyn Connection>;
