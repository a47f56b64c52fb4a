//! Broker connectivity
//!
//! The pub/sub client is consumed through the [`Transport`] and
//! [`Connection`] traits. On top of them, [`ConnectionManager`] owns one
//! connection's lifecycle: connect, automatic reconnect, teardown, and
//! routing of deliveries to subscription handlers.
//!
//! ## Implementations
//!
//! - [`MemoryBroker`]: in-process broker, used by tests and demos
//! - [`StompTransport`]: STOMP 1.2 over WebSocket

use async_trait::async_trait;

use crate::error::TransportError;

mod connection;
pub mod frame;
mod memory;
mod stomp;

pub use connection::{
    ConnectionHooks, ConnectionManager, ConnectionState, MessageHandler, ReconnectPolicy,
    SubscriptionHandle,
};
pub use memory::{MemoryBroker, MemoryBrokerConfig};
pub use stomp::{StompConfig, StompTransport};

/// A message delivered on a subscription
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Client-chosen subscription id the message arrived on
    pub subscription: String,
    /// Topic the message was published to
    pub topic: String,
    /// Raw payload text
    pub payload: String,
}

/// Inbound event on a live connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Message(Delivery),
    /// Broker-reported failure; the connection may or may not survive it
    Error(TransportError),
}

/// Factory for broker connections
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Make one connection attempt
    async fn connect(&self) -> Result<Box<dyn Connection>, TransportError>;
}

/// One live broker connection
#[async_trait]
pub trait Connection: Send {
    /// Join `topic`; deliveries will carry `id`
    async fn subscribe(&mut self, id: &str, topic: &str) -> Result<(), TransportError>;

    /// Leave the subscription with `id`
    async fn unsubscribe(&mut self, id: &str) -> Result<(), TransportError>;

    /// Wait for the next event. `None` means the connection is gone.
    ///
    /// Must be cancel-safe: it is raced against outgoing commands.
    async fn next_event(&mut self) -> Option<TransportEvent>;

    /// Close the connection gracefully
    async fn close(&mut self);
}
