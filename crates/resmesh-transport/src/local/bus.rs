//! The local bus implementation.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use resmesh_core::{
    Connection, InboundMessage, ResponseFrame, Subscription, TransportError, TransportResult,
    frame, validate_subject_pattern,
};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use super::subject::subject_matches;

/// Default buffer size of each subscription.
pub const DEFAULT_CAPACITY: usize = 1024;

/// Prefix of generated reply subjects.
pub const INBOX_PREFIX: &str = "_INBOX";

struct Subscriber {
    sid: u64,
    pattern: String,
    queue_group: Option<String>,
    tx: mpsc::Sender<InboundMessage>,
}

struct BusInner {
    subscribers: RwLock<Vec<Subscriber>>,
    /// Round-robin position per (pattern, queue group).
    cursors: Mutex<HashMap<(String, String), usize>>,
    next_sid: AtomicU64,
    next_inbox: AtomicU64,
    capacity: usize,
    closed: AtomicBool,
}

/// A message bus inside the current process.
///
/// Subjects follow NATS rules: tokens separated by `.`, `*` matches one token
/// and a trailing `>` matches the rest. Subscribers sharing a queue group on
/// the same pattern receive each message in turn. A subscriber whose buffer is
/// full loses the message.
///
/// Clones share the same bus.
///
/// # Example
///
/// ```rust,ignore
/// use resmesh_transport::LocalBus;
///
/// let bus = LocalBus::new();
/// service.serve(Arc::new(bus.clone())).await?;
///
/// let reply = bus
///     .request("get.library.book.1", Vec::new(), Duration::from_secs(3))
///     .await?;
/// ```
#[derive(Clone)]
pub struct LocalBus {
    inner: Arc<BusInner>,
}

impl LocalBus {
    /// Creates a bus with the default subscription buffer size.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Creates a bus whose subscriptions buffer up to `capacity` messages.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Arc::new(BusInner {
                subscribers: RwLock::new(Vec::new()),
                cursors: Mutex::new(HashMap::new()),
                next_sid: AtomicU64::new(1),
                next_inbox: AtomicU64::new(1),
                capacity: capacity.max(1),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Returns a fresh reply subject.
    pub fn new_inbox(&self) -> String {
        let n = self.inner.next_inbox.fetch_add(1, Ordering::Relaxed);
        format!("{INBOX_PREFIX}.{n}")
    }

    /// Publishes a message carrying a reply subject.
    pub fn publish_with_reply(
        &self,
        subject: &str,
        reply: Option<String>,
        payload: Vec<u8>,
    ) -> TransportResult<()> {
        self.deliver(subject, reply, payload)
    }

    /// Sends a request and waits for its terminal reply.
    ///
    /// A timeout frame received meanwhile replaces the remaining wait with the
    /// duration it announces.
    pub async fn request(
        &self,
        subject: &str,
        payload: Vec<u8>,
        timeout: Duration,
    ) -> TransportResult<Vec<u8>> {
        let inbox = self.new_inbox();
        let (sid, mut sub) = self.add_subscriber(&inbox, None)?;
        let result = self.await_reply(subject, &inbox, payload, timeout, &mut sub).await;
        self.remove_subscriber(sid);
        result
    }

    async fn await_reply(
        &self,
        subject: &str,
        inbox: &str,
        payload: Vec<u8>,
        timeout: Duration,
        sub: &mut Subscription,
    ) -> TransportResult<Vec<u8>> {
        self.deliver(subject, Some(inbox.to_string()), payload)?;

        let mut deadline = Instant::now() + timeout;
        loop {
            let msg = match tokio::time::timeout_at(deadline, sub.next()).await {
                Ok(Some(msg)) => msg,
                Ok(None) => return Err(TransportError::Closed),
                Err(_) => {
                    debug!(subject = %subject, "Request timed out");
                    return Err(TransportError::RequestTimeout {
                        subject: subject.to_string(),
                    });
                }
            };

            if msg.payload.starts_with(frame::TIMEOUT_PREFIX)
                && let Ok(ResponseFrame::Timeout(extension)) = ResponseFrame::decode(&msg.payload)
            {
                trace!(
                    subject = %subject,
                    extension_ms = extension.as_millis() as u64,
                    "Request timeout extended"
                );
                deadline = Instant::now() + extension;
                continue;
            }
            return Ok(msg.payload);
        }
    }

    /// Number of live subscriptions.
    pub fn subscriber_count(&self) -> usize {
        self.inner
            .subscribers
            .read()
            .iter()
            .filter(|s| !s.tx.is_closed())
            .count()
    }

    /// Closes the bus. Every subscription ends and further use fails.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.subscribers.write().clear();
        debug!("Local bus closed");
    }

    /// Returns `true` once [`close`](Self::close) was called.
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    fn add_subscriber(
        &self,
        pattern: &str,
        queue_group: Option<&str>,
    ) -> TransportResult<(u64, Subscription)> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        validate_subject_pattern(pattern).map_err(|reason| TransportError::SubscribeFailed {
            subject: pattern.to_string(),
            reason,
        })?;

        let sid = self.inner.next_sid.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.inner.capacity);
        self.inner.subscribers.write().push(Subscriber {
            sid,
            pattern: pattern.to_string(),
            queue_group: queue_group.map(str::to_string),
            tx,
        });
        trace!(sid, subject = %pattern, queue_group = ?queue_group, "Subscriber added");
        Ok((sid, Subscription::new(pattern, rx)))
    }

    fn remove_subscriber(&self, sid: u64) {
        self.inner.subscribers.write().retain(|s| s.sid != sid);
    }

    fn deliver(&self, subject: &str, reply: Option<String>, payload: Vec<u8>) -> TransportResult<()> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        if subject.is_empty()
            || subject.contains(['*', '>', ' '])
            || subject.split('.').any(str::is_empty)
        {
            return Err(TransportError::InvalidSubject(subject.to_string()));
        }

        let targets: Vec<(u64, mpsc::Sender<InboundMessage>)> = {
            let subscribers = self.inner.subscribers.read();
            let mut selected: Vec<&Subscriber> = Vec::new();
            let mut groups: HashMap<(&str, &str), Vec<&Subscriber>> = HashMap::new();
            for sub in subscribers
                .iter()
                .filter(|s| !s.tx.is_closed() && subject_matches(&s.pattern, subject))
            {
                match &sub.queue_group {
                    Some(group) => groups
                        .entry((sub.pattern.as_str(), group.as_str()))
                        .or_default()
                        .push(sub),
                    None => selected.push(sub),
                }
            }

            let mut cursors = self.inner.cursors.lock();
            for ((pattern, group), members) in groups {
                let cursor = cursors
                    .entry((pattern.to_string(), group.to_string()))
                    .or_insert(0);
                selected.push(members[*cursor % members.len()]);
                *cursor = cursor.wrapping_add(1);
            }
            selected.into_iter().map(|s| (s.sid, s.tx.clone())).collect()
        };

        if targets.is_empty() {
            trace!(subject = %subject, "No subscribers");
            return Ok(());
        }

        let mut dead = Vec::new();
        for (sid, tx) in targets {
            let msg = InboundMessage::new(subject, reply.clone(), payload.clone());
            match tx.try_send(msg) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    warn!(sid, subject = %subject, "Slow consumer, message dropped");
                }
                Err(TrySendError::Closed(_)) => dead.push(sid),
            }
        }
        if !dead.is_empty() {
            self.inner.subscribers.write().retain(|s| !dead.contains(&s.sid));
        }
        Ok(())
    }
}

impl Default for LocalBus {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for LocalBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalBus")
            .field("subscribers", &self.subscriber_count())
            .field("capacity", &self.inner.capacity)
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[async_trait]
impl Connection for LocalBus {
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> TransportResult<()> {
        self.deliver(subject, None, payload)
    }

    async fn subscribe(&self, subject: &str, queue_group: Option<&str>) -> TransportResult<Subscription> {
        let (_, sub) = self.add_subscriber(subject, queue_group)?;
        debug!(subject = %subject, queue_group = ?queue_group, "Subscribed");
        Ok(sub)
    }

    fn is_connected(&self) -> bool {
        !self.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_err, assert_ok};

    async fn next_within(sub: &mut Subscription, ms: u64) -> Option<InboundMessage> {
        tokio::time::timeout(Duration::from_millis(ms), sub.next())
            .await
            .ok()
            .flatten()
    }

    #[tokio::test]
    async fn test_fan_out_to_matching_subscribers() {
        let bus = LocalBus::new();
        let mut all = bus.subscribe("event.>", None).await.unwrap();
        let mut books = bus.subscribe("event.*.change", None).await.unwrap();
        let mut other = bus.subscribe("get.>", None).await.unwrap();

        assert_ok!(bus.publish("event.book.change", b"{}".to_vec()).await);

        assert_eq!(next_within(&mut all, 50).await.unwrap().subject, "event.book.change");
        assert_eq!(next_within(&mut books, 50).await.unwrap().payload, b"{}");
        assert!(next_within(&mut other, 20).await.is_none());
    }

    #[tokio::test]
    async fn test_queue_group_round_robin() {
        let bus = LocalBus::new();
        let mut a = bus.subscribe("get.library.>", Some("workers")).await.unwrap();
        let mut b = bus.subscribe("get.library.>", Some("workers")).await.unwrap();

        for i in 0..4 {
            bus.publish(&format!("get.library.book.{i}"), Vec::new())
                .await
                .unwrap();
        }

        let mut got_a = 0;
        while next_within(&mut a, 20).await.is_some() {
            got_a += 1;
        }
        let mut got_b = 0;
        while next_within(&mut b, 20).await.is_some() {
            got_b += 1;
        }
        assert_eq!((got_a, got_b), (2, 2));
    }

    #[tokio::test]
    async fn test_request_reply() {
        let bus = LocalBus::new();
        let mut sub = bus.subscribe("call.library.>", None).await.unwrap();
        let responder = bus.clone();
        tokio::spawn(async move {
            let msg = sub.next().await.unwrap();
            let reply = msg.reply.unwrap();
            responder
                .publish(&reply, br#"{"result":1}"#.to_vec())
                .await
                .unwrap();
        });

        let reply = bus
            .request("call.library.book.1.set", Vec::new(), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(reply, br#"{"result":1}"#);
    }

    #[tokio::test]
    async fn test_timeout_frame_extends_wait() {
        let bus = LocalBus::new();
        let mut sub = bus.subscribe("call.library.>", None).await.unwrap();
        let responder = bus.clone();
        tokio::spawn(async move {
            let msg = sub.next().await.unwrap();
            let reply = msg.reply.unwrap();
            responder
                .publish(&reply, frame::timeout(Duration::from_millis(500)))
                .await
                .unwrap();
            tokio::time::sleep(Duration::from_millis(100)).await;
            responder
                .publish(&reply, frame::EMPTY_SUCCESS.to_vec())
                .await
                .unwrap();
        });

        let reply = bus
            .request("call.library.book.1.slow", Vec::new(), Duration::from_millis(50))
            .await
            .unwrap();
        assert_eq!(reply, frame::EMPTY_SUCCESS);
    }

    #[tokio::test]
    async fn test_request_without_responder_times_out() {
        let bus = LocalBus::new();
        let result = bus
            .request("get.library.book.1", Vec::new(), Duration::from_millis(20))
            .await;
        assert!(matches!(result, Err(TransportError::RequestTimeout { .. })));
    }

    #[tokio::test]
    async fn test_slow_consumer_drops_messages() {
        let bus = LocalBus::with_capacity(1);
        let mut sub = bus.subscribe("event.>", None).await.unwrap();

        for _ in 0..3 {
            assert_ok!(bus.publish("event.book.change", Vec::new()).await);
        }
        assert!(next_within(&mut sub, 20).await.is_some());
        assert!(next_within(&mut sub, 20).await.is_none());
    }

    #[tokio::test]
    async fn test_dropped_subscription_is_pruned() {
        let bus = LocalBus::new();
        let sub = bus.subscribe("event.>", None).await.unwrap();
        drop(sub);

        assert_ok!(bus.publish("event.book.change", Vec::new()).await);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_invalid_subjects() {
        let bus = LocalBus::new();
        assert!(matches!(
            bus.publish("event.*", Vec::new()).await,
            Err(TransportError::InvalidSubject(_))
        ));
        assert!(matches!(
            bus.subscribe("event..x", None).await,
            Err(TransportError::SubscribeFailed { .. })
        ));
    }

    #[tokio::test]
    async fn test_close_ends_subscriptions() {
        let bus = LocalBus::new();
        let mut sub = bus.subscribe("event.>", None).await.unwrap();

        bus.close();
        assert!(sub.next().await.is_none());
        assert!(!bus.is_connected());
        assert_err!(bus.publish("event.book.change", Vec::new()).await);
        assert!(matches!(
            bus.subscribe("event.>", None).await,
            Err(TransportError::Closed)
        ));
    }
}
