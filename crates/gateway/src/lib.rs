//! Messaging gateway between a message broker and WebSocket clients.
//!
//! This service:
//! - Consumes batches from configured broker topics and dispatches them to
//!   per-topic callbacks, reconnecting on failure
//! - Publishes messages to configured topics without ever failing the caller
//! - Tracks each broker connection's status, transition history and uptime
//! - Fans system events out to WebSocket sockets by event type, replaying
//!   the latest hot event to new subscribers
//!
//! ## Architecture
//!
//! ```text
//! Broker topics (system.event, ...)
//!         ↓
//! BrokerConsumer (commit, parse, callback per topic)
//!         ↓
//! SubscriptionHub (DashMap interest sets, hot-event cache)
//!         ↓
//! WebSocket clients
//!
//! POST /publish/{topic} → BrokerProducer → Broker
//! ```

pub mod config;
pub mod connection;
pub mod consumer;
pub mod error;
pub mod hub;
pub mod producer;
pub mod protocol;
pub mod ws_server;

#[cfg(test)]
mod test_support;

pub use config::GatewayConfig;
pub use connection::{ConnectionState, ConnectionStatus, HistoryValue, StatusHistoryEntry};
pub use consumer::{BrokerConsumer, ConsumerCallback, ConsumerConfig};
pub use error::{GatewayError, Result};
pub use hub::{event_forwarder, ClientId, ClientState, SubscriptionHub};
pub use producer::{BrokerProducer, ProducerConfig, ProducerMessage};
pub use protocol::{SystemEvent, SystemEventType};
pub use ws_server::{create_router, AppState};
