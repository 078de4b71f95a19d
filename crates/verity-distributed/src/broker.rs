//! Broker abstraction
//!
//! The master and its workers share no memory; every interaction is a
//! message on a broker destination. These traits describe the small subset
//! of a JMS-style broker the protocol relies on. Implement them for a real
//! broker client, or use [`InMemoryBroker`](crate::InMemoryBroker) to run
//! everything in one process.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// A place messages are sent to or received from
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Destination {
    /// Durable named point-to-point queue, created on first use
    Queue(String),
    /// Named publish/subscribe topic
    Topic(String),
    /// Per-subscriber queue receiving copies of a topic's messages
    Subscription(u64),
    /// Queue that lives until deleted, used for replies
    Temporary(u64),
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Destination::Queue(name) => write!(f, "queue://{}", name),
            Destination::Topic(name) => write!(f, "topic://{}", name),
            Destination::Subscription(id) => write!(f, "subscription://{}", id),
            Destination::Temporary(id) => write!(f, "temp-queue://{}", id),
        }
    }
}

/// Header properties carried next to a message body
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageProperties {
    /// Sending worker
    pub worker_id: Option<String>,
    /// Set on a worker's terminal message
    pub last_message: bool,
    /// Checksum of the run configuration the body carries or acknowledges
    pub config_checksum: Option<u32>,
}

/// A broker message
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub correlation_id: Option<String>,
    /// Where replies should go
    pub reply_to: Option<Destination>,
    pub properties: MessageProperties,
    pub body: Vec<u8>,
}

impl Message {
    /// Create a message with a raw body
    pub fn new(body: Vec<u8>) -> Self {
        Self {
            body,
            ..Self::default()
        }
    }

    /// Create a message with a bincode-encoded body
    pub fn encode<T: Serialize>(value: &T) -> crate::Result<Self> {
        Ok(Self::new(bincode::serialize(value)?))
    }

    /// Decode the body
    pub fn decode<T: serde::de::DeserializeOwned>(&self) -> crate::Result<T> {
        Ok(bincode::deserialize(&self.body)?)
    }

    pub fn with_reply_to(mut self, destination: Destination) -> Self {
        self.reply_to = Some(destination);
        self
    }

    pub fn with_worker(mut self, worker: impl Into<String>) -> Self {
        self.properties.worker_id = Some(worker.into());
        self
    }

    pub fn with_checksum(mut self, checksum: u32) -> Self {
        self.properties.config_checksum = Some(checksum);
        self
    }

    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    /// Mark as the sender's terminal message
    pub fn last(mut self) -> Self {
        self.properties.last_message = true;
        self
    }
}

/// Message broker client
///
/// Implementations must be usable from several threads at once.
pub trait Broker: Send + Sync {
    /// Error type for this broker
    type Error: std::error::Error + Send + Sync + 'static;

    /// Send a message; sending to a topic delivers a copy to every current
    /// subscriber
    fn send(&self, destination: &Destination, message: Message) -> Result<(), Self::Error>;

    /// Subscribe to a topic, returning the subscriber's queue
    ///
    /// Only messages published after subscribing are delivered.
    fn subscribe(&self, topic: &str) -> Result<Destination, Self::Error>;

    /// Receive one message, blocking up to `timeout`
    ///
    /// Returns `Ok(None)` on timeout.
    fn receive(
        &self,
        from: &Destination,
        timeout: Duration,
    ) -> Result<Option<Message>, Self::Error>;

    /// Receive from whichever destination has a message first
    ///
    /// Destinations are polled in the order given.
    fn receive_any(
        &self,
        from: &[Destination],
        timeout: Duration,
    ) -> Result<Option<(Destination, Message)>, Self::Error>;

    /// Create a temporary queue
    fn create_temporary_queue(&self) -> Result<Destination, Self::Error>;

    /// Delete a destination and drop its pending messages
    fn delete(&self, destination: &Destination) -> Result<(), Self::Error>;

    /// Shut the broker down; blocked receivers wake with an error
    fn close(&self) -> Result<(), Self::Error>;
}
