//! Transport traits between the gateway connections and a concrete broker.

use crate::compression::CompressionKind;
use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::broadcast;

/// Capacity of the instrumentation event channel of a transport.
pub const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Instrumentation event emitted by a transport's underlying client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerEvent {
    /// The client (re)established its broker connection.
    Connected,
    /// The client lost its broker connection.
    Disconnected,
    /// The client gave up and will not reconnect on its own.
    Closed,
    /// Error reported by the client or the server.
    Error(String),
    /// Any other informational event.
    Notice(String),
}

/// A single message delivered by the broker.
#[derive(Debug, Clone)]
pub struct BrokerMessage {
    /// Position of the message within its topic.
    pub offset: u64,
    /// Raw (possibly compressed) payload.
    pub payload: Bytes,
    /// Compression applied by the producer.
    pub encoding: CompressionKind,
}

impl BrokerMessage {
    /// Payload with the producer's compression removed.
    pub fn decoded_payload(&self) -> std::result::Result<Bytes, crate::CompressionError> {
        self.encoding.decompress(&self.payload)
    }
}

/// Messages delivered together for one topic in one consumption cycle.
#[derive(Debug, Clone)]
pub struct Batch {
    pub topic: String,
    pub messages: Vec<BrokerMessage>,
}

impl Batch {
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

/// A record handed to the broker by a producer.
#[derive(Debug, Clone)]
pub struct OutgoingRecord {
    /// Payload, already compressed with `encoding`.
    pub payload: Bytes,
    pub encoding: CompressionKind,
}

/// Connection lifecycle shared by consumers and producers.
#[async_trait]
pub trait BrokerTransport: Send + Sync + 'static {
    /// Open a connection to the broker.
    async fn connect(&self) -> Result<()>;

    /// Close the current connection, if any.
    async fn disconnect(&self) -> Result<()>;

    /// Subscribe to the client's instrumentation events.
    fn events(&self) -> broadcast::Receiver<BrokerEvent>;
}

/// Consuming side of a broker connection.
#[async_trait]
pub trait ConsumerTransport: BrokerTransport {
    /// Subscribe to a topic. Subscribing twice to the same topic is harmless.
    async fn subscribe(&self, topic: &str) -> Result<()>;

    /// Wait for the next round of deliveries, at most one batch per topic.
    /// An empty result means nothing arrived within the broker's wait window.
    async fn poll(&self) -> Result<Vec<Batch>>;

    /// Acknowledge a delivered message so it is not redelivered.
    async fn commit(&self, topic: &str, offset: u64) -> Result<()>;
}

/// Producing side of a broker connection.
#[async_trait]
pub trait ProducerTransport: BrokerTransport {
    /// Publish records to a topic, in order.
    async fn publish(&self, topic: &str, records: Vec<OutgoingRecord>) -> Result<()>;
}
