//! Broker transports for the messaging gateway.
//!
//! The gateway's consumer and producer are written against the traits in
//! [`transport`]. Two implementations are provided:
//!
//! - [`nats`]: NATS JetStream (durable pull consumers, acked publishes)
//! - [`memory`]: an in-process loopback broker with fault injection

pub mod compression;
pub mod memory;
pub mod nats;
pub mod transport;

pub use compression::{CompressionError, CompressionKind};
pub use memory::{InMemoryBroker, InMemoryConsumer, InMemoryProducer};
pub use nats::{BrokerSettings, NatsClient, NatsConsumerTransport, NatsProducerTransport, StreamConfig};
pub use transport::{
    Batch, BrokerEvent, BrokerMessage, BrokerTransport, ConsumerTransport, OutgoingRecord,
    ProducerTransport,
};
