//! In-process broker
//!
//! Keeps connections and topic subscriptions in memory and fans published
//! payloads out to subscribers. Also lets callers refuse connections, drop
//! every connection, or push a broker error, which makes it the broker
//! double for lifecycle tests.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use uuid::Uuid;

use super::{Connection, Delivery, Transport, TransportEvent};
use crate::error::TransportError;

type ConnectionId = String;

/// Configuration for the in-process broker
#[derive(Debug, Clone)]
pub struct MemoryBrokerConfig {
    /// Maximum number of concurrent connections
    pub max_connections: usize,
}

impl Default for MemoryBrokerConfig {
    fn default() -> Self {
        Self {
            max_connections: 1000,
        }
    }
}

/// In-process pub/sub broker
#[derive(Clone)]
pub struct MemoryBroker {
    inner: Arc<BrokerInner>,
}

struct BrokerInner {
    /// ConnectionId -> event sender
    connections: RwLock<HashMap<ConnectionId, mpsc::UnboundedSender<TransportEvent>>>,
    /// Topic -> (ConnectionId, subscription id) pairs
    subscriptions: RwLock<HashMap<String, Vec<(ConnectionId, String)>>>,
    accepting: AtomicBool,
    /// Bumped on every subscription change
    revision: watch::Sender<u64>,
    config: MemoryBrokerConfig,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new(MemoryBrokerConfig::default())
    }
}

impl MemoryBroker {
    pub fn new(config: MemoryBrokerConfig) -> Self {
        let (revision, _) = watch::channel(0);
        Self {
            inner: Arc::new(BrokerInner {
                connections: RwLock::new(HashMap::new()),
                subscriptions: RwLock::new(HashMap::new()),
                accepting: AtomicBool::new(true),
                revision,
                config,
            }),
        }
    }

    /// Deliver `payload` to every subscriber of `topic`
    ///
    /// Returns the number of deliveries made.
    pub fn publish(&self, topic: &str, payload: &str) -> usize {
        let subs = self.inner.subscriptions.read();
        let connections = self.inner.connections.read();

        let mut sent = 0;
        for (connection_id, subscription) in subs.get(topic).into_iter().flatten() {
            let Some(sender) = connections.get(connection_id) else {
                continue;
            };
            let delivery = Delivery {
                subscription: subscription.clone(),
                topic: topic.to_string(),
                payload: payload.to_string(),
            };
            if sender.send(TransportEvent::Message(delivery)).is_ok() {
                sent += 1;
            }
        }

        tracing::trace!(topic = %topic, subscribers = sent, "Published message");
        sent
    }

    /// Push a broker error to every open connection
    pub fn report_error(&self, detail: &str) {
        for sender in self.inner.connections.read().values() {
            let _ = sender.send(TransportEvent::Error(TransportError::Broker(detail.to_string())));
        }
    }

    /// Drop every connection, as a network outage would
    pub fn disconnect_all(&self) {
        let dropped: Vec<_> = self.inner.connections.write().drain().collect();
        self.inner.subscriptions.write().clear();
        self.bump();
        tracing::info!(connections = dropped.len(), "Dropped all connections");
    }

    /// Refuse (false) or accept (true) new connections
    pub fn set_accepting(&self, accepting: bool) {
        self.inner.accepting.store(accepting, Ordering::SeqCst);
    }

    pub fn connection_count(&self) -> usize {
        self.inner.connections.read().len()
    }

    /// Number of subscriptions on `topic` across all connections
    pub fn subscription_count(&self, topic: &str) -> usize {
        self.inner
            .subscriptions
            .read()
            .get(topic)
            .map(Vec::len)
            .unwrap_or(0)
    }

    /// Wait until `topic` has exactly `count` subscriptions
    pub async fn until_subscribed(&self, topic: &str, count: usize) {
        let mut revision = self.inner.revision.subscribe();
        while self.subscription_count(topic) != count {
            if revision.changed().await.is_err() {
                return;
            }
        }
    }

    fn bump(&self) {
        self.inner.revision.send_modify(|r| *r += 1);
    }
}

impl BrokerInner {
    fn register(&self) -> Result<(ConnectionId, mpsc::UnboundedReceiver<TransportEvent>), TransportError> {
        if !self.accepting.load(Ordering::SeqCst) {
            return Err(TransportError::ConnectFailed("broker is not accepting connections".to_string()));
        }

        let mut connections = self.connections.write();
        if connections.len() >= self.config.max_connections {
            return Err(TransportError::Rejected(format!(
                "too many connections (limit: {})",
                self.config.max_connections
            )));
        }

        let id = Uuid::new_v4().to_string();
        let (tx, rx) = mpsc::unbounded_channel();
        connections.insert(id.clone(), tx);

        tracing::debug!(connection_id = %id, "Memory connection opened");
        Ok((id, rx))
    }

    fn unregister(&self, id: &str) -> bool {
        let removed = self.connections.write().remove(id).is_some();

        let mut subs = self.subscriptions.write();
        subs.retain(|_, subscribers| {
            subscribers.retain(|(connection_id, _)| connection_id != id);
            !subscribers.is_empty()
        });

        removed
    }

    fn is_valid_topic(topic: &str) -> bool {
        !topic.is_empty() && !topic.chars().any(char::is_whitespace)
    }
}

#[async_trait]
impl Transport for MemoryBroker {
    async fn connect(&self) -> Result<Box<dyn Connection>, TransportError> {
        let (id, events) = self.inner.register()?;
        Ok(Box::new(MemoryConnection {
            id,
            broker: self.clone(),
            events,
        }))
    }
}

/// Client side of an in-process connection
struct MemoryConnection {
    id: ConnectionId,
    broker: MemoryBroker,
    events: mpsc::UnboundedReceiver<TransportEvent>,
}

#[async_trait]
impl Connection for MemoryConnection {
    async fn subscribe(&mut self, id: &str, topic: &str) -> Result<(), TransportError> {
        if !BrokerInner::is_valid_topic(topic) {
            return Err(TransportError::Rejected(format!("invalid topic {topic:?}")));
        }
        if !self.broker.inner.connections.read().contains_key(&self.id) {
            return Err(TransportError::Closed);
        }

        {
            let mut subs = self.broker.inner.subscriptions.write();
            let subscribers = subs.entry(topic.to_string()).or_default();
            if !subscribers.iter().any(|(c, s)| *c == self.id && s == id) {
                subscribers.push((self.id.clone(), id.to_string()));
            }
        }
        self.broker.bump();

        tracing::debug!(connection_id = %self.id, topic = %topic, subscription = %id, "Subscribed");
        Ok(())
    }

    async fn unsubscribe(&mut self, id: &str) -> Result<(), TransportError> {
        {
            let mut subs = self.broker.inner.subscriptions.write();
            subs.retain(|_, subscribers| {
                subscribers.retain(|(c, s)| !(*c == self.id && s == id));
                !subscribers.is_empty()
            });
        }
        self.broker.bump();

        tracing::debug!(connection_id = %self.id, subscription = %id, "Unsubscribed");
        Ok(())
    }

    async fn next_event(&mut self) -> Option<TransportEvent> {
        self.events.recv().await
    }

    async fn close(&mut self) {
        if self.broker.inner.unregister(&self.id) {
            self.broker.bump();
            tracing::debug!(connection_id = %self.id, "Memory connection closed");
        }
    }
}

impl Drop for MemoryConnection {
    fn drop(&mut self) {
        if self.broker.inner.unregister(&self.id) {
            self.broker.bump();
        }
    }
}
