use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use futures_util::StreamExt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

const SUBSCRIPTION_BUFFER: usize = 256;

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("failed to connect to {url}: {reason}")]
    ConnectFailed { url: String, reason: String },

    #[error("publish to {subject} failed: {reason}")]
    Publish { subject: String, reason: String },

    #[error("subscribe to {subject} failed: {reason}")]
    Subscribe { subject: String, reason: String },

    #[error("broker connection is closed")]
    Closed,
}

/// Inbound payloads for one subject. Yields `None` once the broker
/// connection is gone for good.
pub struct Subscription {
    rx: mpsc::Receiver<Bytes>,
}

impl Subscription {
    pub fn new(rx: mpsc::Receiver<Bytes>) -> Self {
        Self { rx }
    }

    pub async fn next(&mut self) -> Option<Bytes> {
        self.rx.recv().await
    }
}

/// Publish/subscribe transport the chat daemon runs on.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Server URL, for status output.
    fn url(&self) -> &str;

    fn is_connected(&self) -> bool;

    async fn publish(&self, subject: &str, payload: Bytes) -> Result<(), BrokerError>;

    async fn subscribe(&self, subject: &str) -> Result<Subscription, BrokerError>;

    /// Flush pending publishes and drop the connection. Open subscriptions end.
    async fn close(&self);
}

// ---------------------------------------------------------------------------
// NATS
// ---------------------------------------------------------------------------

/// Connection settings for [`NatsBroker`].
#[derive(Debug, Clone)]
pub struct NatsOptions {
    pub connect_timeout: Duration,
    /// Reconnect attempts after an established connection drops. Once spent,
    /// subscriptions end.
    pub max_reconnects: usize,
}

impl Default for NatsOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            max_reconnects: 10,
        }
    }
}

pub struct NatsBroker {
    url: String,
    client: Mutex<Option<async_nats::Client>>,
    connected: Arc<AtomicBool>,
    relays: Mutex<Vec<JoinHandle<()>>>,
}

impl NatsBroker {
    pub async fn connect(url: &str, options: &NatsOptions) -> Result<Self, BrokerError> {
        let connected = Arc::new(AtomicBool::new(false));
        let flag = connected.clone();
        let server = url.to_string();

        let client = async_nats::ConnectOptions::new()
            .connection_timeout(options.connect_timeout)
            .max_reconnects(options.max_reconnects)
            .event_callback(move |event| {
                let flag = flag.clone();
                let server = server.clone();
                async move {
                    match event {
                        async_nats::Event::Connected => {
                            flag.store(true, Ordering::SeqCst);
                            tracing::info!(url = %server, "broker connected");
                        }
                        async_nats::Event::Disconnected => {
                            flag.store(false, Ordering::SeqCst);
                            tracing::warn!(url = %server, "broker disconnected");
                        }
                        async_nats::Event::ClientError(e) => {
                            tracing::warn!(url = %server, err = %e, "broker client error");
                        }
                        other => tracing::debug!(url = %server, event = %other, "broker event"),
                    }
                }
            })
            .connect(url)
            .await
            .map_err(|e| BrokerError::ConnectFailed {
                url: url.to_string(),
                reason: e.to_string(),
            })?;
        connected.store(true, Ordering::SeqCst);
        tracing::info!(url, "connected to NATS");

        Ok(Self {
            url: url.to_string(),
            client: Mutex::new(Some(client)),
            connected,
            relays: Mutex::new(Vec::new()),
        })
    }

    fn client(&self) -> Result<async_nats::Client, BrokerError> {
        self.client
            .lock()
            .map_err(|_| BrokerError::Closed)?
            .clone()
            .ok_or(BrokerError::Closed)
    }
}

#[async_trait]
impl Broker for NatsBroker {
    fn url(&self) -> &str {
        &self.url
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn publish(&self, subject: &str, payload: Bytes) -> Result<(), BrokerError> {
        self.client()?
            .publish(subject.to_string(), payload)
            .await
            .map_err(|e| BrokerError::Publish {
                subject: subject.to_string(),
                reason: e.to_string(),
            })
    }

    async fn subscribe(&self, subject: &str) -> Result<Subscription, BrokerError> {
        let mut subscriber = self
            .client()?
            .subscribe(subject.to_string())
            .await
            .map_err(|e| BrokerError::Subscribe {
                subject: subject.to_string(),
                reason: e.to_string(),
            })?;

        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        let subject = subject.to_string();
        let relay = tokio::spawn(async move {
            while let Some(message) = subscriber.next().await {
                if tx.send(message.payload).await.is_err() {
                    break;
                }
            }
            tracing::debug!(subject = %subject, "NATS subscription ended");
        });
        if let Ok(mut relays) = self.relays.lock() {
            relays.push(relay);
        }
        Ok(Subscription::new(rx))
    }

    async fn close(&self) {
        let client = self.client.lock().ok().and_then(|mut c| c.take());
        if let Ok(mut relays) = self.relays.lock() {
            for relay in relays.drain(..) {
                relay.abort();
            }
        }
        if let Some(client) = client {
            if let Err(e) = client.flush().await {
                tracing::debug!(err = %e, "flush on close failed");
            }
            drop(client);
        }
        self.connected.store(false, Ordering::SeqCst);
        tracing::info!(url = %self.url, "broker connection closed");
    }
}

// ---------------------------------------------------------------------------
// In-process
// ---------------------------------------------------------------------------

/// An in-process broker shared by every [`MemoryBroker`] connected to it.
#[derive(Clone, Default)]
pub struct MemoryHub {
    subjects: Arc<DashMap<String, Vec<(u64, mpsc::Sender<Bytes>)>>>,
    next_id: Arc<AtomicU64>,
}

impl MemoryHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connect(&self) -> MemoryBroker {
        MemoryBroker {
            hub: self.clone(),
            id: self.next_id.fetch_add(1, Ordering::SeqCst),
            connected: AtomicBool::new(true),
        }
    }

    /// Deliver raw bytes to every subscriber of `subject`, bypassing any
    /// connection. Lets tests inject arbitrary payloads.
    pub async fn inject(&self, subject: &str, payload: Bytes) {
        let targets: Vec<_> = self
            .subjects
            .get(subject)
            .map(|subs| subs.iter().map(|(_, tx)| tx.clone()).collect())
            .unwrap_or_default();
        for tx in targets {
            let _ = tx.send(payload.clone()).await;
        }
    }

    fn remove_connection(&self, id: u64) {
        for mut subs in self.subjects.iter_mut() {
            subs.retain(|(owner, _)| *owner != id);
        }
    }
}

pub struct MemoryBroker {
    hub: MemoryHub,
    id: u64,
    connected: AtomicBool,
}

#[async_trait]
impl Broker for MemoryBroker {
    fn url(&self) -> &str {
        "memory://"
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn publish(&self, subject: &str, payload: Bytes) -> Result<(), BrokerError> {
        if !self.is_connected() {
            return Err(BrokerError::Closed);
        }
        self.hub.inject(subject, payload).await;
        Ok(())
    }

    async fn subscribe(&self, subject: &str) -> Result<Subscription, BrokerError> {
        if !self.is_connected() {
            return Err(BrokerError::Closed);
        }
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        self.hub
            .subjects
            .entry(subject.to_string())
            .or_default()
            .push((self.id, tx));
        Ok(Subscription::new(rx))
    }

    async fn close(&self) {
        self.connected.store(false, Ordering::SeqCst);
        self.hub.remove_connection(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_publish_reaches_subscribers_in_order() {
        let hub = MemoryHub::new();
        let a = hub.connect();
        let b = hub.connect();

        let mut sub = b.subscribe("natschat.chat.b").await.unwrap();
        for i in 0..5u8 {
            a.publish("natschat.chat.b", Bytes::from(vec![i])).await.unwrap();
        }
        for i in 0..5u8 {
            assert_eq!(sub.next().await.unwrap(), Bytes::from(vec![i]));
        }
    }

    #[tokio::test]
    async fn memory_subjects_are_isolated() {
        let hub = MemoryHub::new();
        let a = hub.connect();
        let mut sub = a.subscribe("x").await.unwrap();

        a.publish("y", Bytes::from_static(b"nope")).await.unwrap();
        a.publish("x", Bytes::from_static(b"yes")).await.unwrap();
        assert_eq!(sub.next().await.unwrap(), Bytes::from_static(b"yes"));
    }

    #[tokio::test]
    async fn memory_close_ends_subscriptions() {
        let hub = MemoryHub::new();
        let a = hub.connect();
        let mut sub = a.subscribe("x").await.unwrap();

        a.close().await;
        assert!(!a.is_connected());
        assert!(sub.next().await.is_none());
        assert!(matches!(
            a.publish("x", Bytes::new()).await,
            Err(BrokerError::Closed)
        ));
    }

    #[tokio::test]
    async fn nats_connect_to_closed_port_fails() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let options = NatsOptions {
            connect_timeout: Duration::from_millis(500),
            max_reconnects: 0,
        };
        let result = NatsBroker::connect(&format!("nats://127.0.0.1:{port}"), &options).await;
        assert!(matches!(result, Err(BrokerError::ConnectFailed { .. })));
    }
}
