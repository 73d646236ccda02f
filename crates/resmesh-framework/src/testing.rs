//! In-memory connection and log capture for unit tests.

use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use resmesh_core::{
    Connection, InboundMessage, ResponseFrame, Subscription, TransportError, TransportResult,
};
use tokio::sync::mpsc;
use tracing::subscriber::DefaultGuard;
use tracing_subscriber::fmt::MakeWriter;

/// Records published messages and lets tests inject inbound ones.
#[derive(Default)]
pub(crate) struct MockConnection {
    published: Mutex<Vec<(String, Vec<u8>)>>,
    subscribers: Mutex<Vec<(String, mpsc::Sender<InboundMessage>)>>,
}

impl MockConnection {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn published(&self) -> Vec<(String, Vec<u8>)> {
        self.published.lock().clone()
    }

    pub(crate) fn published_on(&self, subject: &str) -> Vec<Vec<u8>> {
        self.published
            .lock()
            .iter()
            .filter(|(s, _)| s == subject)
            .map(|(_, payload)| payload.clone())
            .collect()
    }

    /// Decoded response frames published on a reply subject.
    pub(crate) fn replies(&self, reply: &str) -> Vec<ResponseFrame> {
        self.published_on(reply)
            .iter()
            .map(|payload| ResponseFrame::decode(payload).expect("valid response frame"))
            .collect()
    }

    pub(crate) fn subscriptions(&self) -> Vec<String> {
        self.subscribers
            .lock()
            .iter()
            .map(|(subject, _)| subject.clone())
            .collect()
    }

    /// Delivers `msg` to the first subscription matching its subject.
    pub(crate) async fn inject(&self, msg: InboundMessage) {
        let sender = self
            .subscribers
            .lock()
            .iter()
            .find(|(pattern, _)| matches(pattern, &msg.subject))
            .map(|(_, tx)| tx.clone())
            .expect("a matching subscription");
        sender.send(msg).await.expect("subscription alive");
    }
}

fn matches(pattern: &str, subject: &str) -> bool {
    let mut subject = subject.split('.');
    for token in pattern.split('.') {
        if token == ">" {
            return subject.next().is_some();
        }
        match subject.next() {
            Some(s) if token == "*" || token == s => {}
            _ => return false,
        }
    }
    subject.next().is_none()
}

#[async_trait]
impl Connection for MockConnection {
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> TransportResult<()> {
        self.published.lock().push((subject.to_string(), payload));
        Ok(())
    }

    async fn subscribe(&self, subject: &str, _queue_group: Option<&str>) -> TransportResult<Subscription> {
        if subject.is_empty() {
            return Err(TransportError::InvalidSubject(subject.to_string()));
        }
        let (tx, rx) = mpsc::channel(64);
        self.subscribers.lock().push((subject.to_string(), tx));
        Ok(Subscription::new(subject, rx))
    }
}

/// Collects formatted log output of the current thread.
#[derive(Clone, Default)]
pub(crate) struct LogCapture {
    buf: Arc<Mutex<Vec<u8>>>,
}

impl LogCapture {
    /// Routes this thread's events into the capture until the guard drops.
    pub(crate) fn install(&self) -> DefaultGuard {
        let subscriber = tracing_subscriber::fmt()
            .with_writer(self.clone())
            .with_ansi(false)
            .finish();
        tracing::subscriber::set_default(subscriber)
    }

    pub(crate) fn contents(&self) -> String {
        String::from_utf8_lossy(&self.buf.lock()).into_owned()
    }
}

impl io::Write for LogCapture {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buf.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for LogCapture {
    type Writer = LogCapture;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}
