//! Broker producer: fire-and-forget publishing to configured topics.
//!
//! `send` never fails from the caller's point of view. Rejected requests are
//! logged; publish outcomes only show up in the connection status and history.

use crate::connection::{
    format_time, initialize_and_connect, spawn_event_listener, BrokerConnection, BrokerRunner,
    ConnectionStatus, HistoryValue, Role, StatusHistoryEntry, DEFAULT_RETRY_DELAY,
};
use crate::error::Result;
use async_trait::async_trait;
use broker_client::{BrokerEvent, CompressionKind, OutgoingRecord, ProducerTransport};
use chrono::{DateTime, Utc};
use metrics::counter;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

/// A message to publish.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProducerMessage {
    pub value: String,
}

impl ProducerMessage {
    pub fn new(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
        }
    }
}

/// Producer settings.
#[derive(Debug, Clone)]
pub struct ProducerConfig {
    /// The only topics `send` accepts.
    pub topics: Vec<String>,
    /// Delay between failed connect attempts.
    pub retry_delay: Duration,
}

impl ProducerConfig {
    pub fn new(topics: Vec<String>) -> Self {
        Self {
            topics,
            retry_delay: DEFAULT_RETRY_DELAY,
        }
    }

    pub fn with_retry_delay(mut self, retry_delay: Duration) -> Self {
        self.retry_delay = retry_delay;
        self
    }
}

pub struct BrokerProducer {
    connection: BrokerConnection,
    transport: Arc<dyn ProducerTransport>,
}

impl BrokerProducer {
    pub fn new(transport: Arc<dyn ProducerTransport>, config: ProducerConfig) -> Arc<Self> {
        info!("Configured broker producer topics {}", config.topics.join(", "));
        Arc::new(Self {
            connection: BrokerConnection::new(Role::Producer, config.topics, config.retry_delay),
            transport,
        })
    }

    /// Start the producer. Only the first call from `NotInitialized` has an effect.
    pub async fn start(self: &Arc<Self>) {
        if self.connection.status() == ConnectionStatus::NotInitialized {
            info!("Starting and initializing broker producer");
            self.connection.transition(
                ConnectionStatus::Connecting,
                "producer.connecting",
                ConnectionStatus::Connecting,
            );
            initialize_and_connect(self.clone()).await;
        } else {
            warn!("Broker producer has already been started");
        }
    }

    /// Cancel any pending reconnect, mark `Stopped` and disconnect (best effort).
    pub async fn stop(&self) {
        info!("Stopping broker producer");
        self.connection.begin_stop();
        self.disconnect_quietly().await;
    }

    /// Publish `messages` to `topic`, compressed with `compression` (gzip by default).
    ///
    /// Always returns `Ok(())`: empty requests and topics outside the
    /// configured set are dropped without contacting the broker, and publish
    /// failures only show up in the status and history.
    pub async fn send(
        &self,
        topic: &str,
        messages: Vec<ProducerMessage>,
        compression: Option<CompressionKind>,
    ) -> Result<()> {
        if messages.is_empty() {
            error!("Failed to send message(s) to topic {}: no messages given", topic);
            return Ok(());
        }

        if !self.connection.has_topic(topic) {
            error!(
                "Failed to send message(s); topic {} is not configured for the producer",
                topic
            );
            return Ok(());
        }

        let count = messages.len();
        let compression = compression.unwrap_or_default();
        let result = match encode_messages(&messages, compression) {
            Ok(records) => self.transport.publish(topic, records).await.map_err(Into::into),
            Err(e) => Err(e),
        };

        match result {
            Ok(()) => {
                let info = format!(
                    "Last produced {} message(s) at {}",
                    count,
                    format_time(Utc::now())
                );
                debug!("{} on topic {}", info, topic);
                counter!("gateway_broker_messages_produced_total", "topic" => topic.to_string())
                    .increment(count as u64);
                self.connection.transition_if_active(
                    ConnectionStatus::Connected,
                    "producer.sent",
                    HistoryValue::info(info),
                );
            }
            Err(e) => {
                let info = format!(
                    "For topic {} failed to produce {} message(s) at {} {}",
                    topic,
                    count,
                    format_time(Utc::now()),
                    e
                );
                counter!("gateway_broker_publish_errors_total", "topic" => topic.to_string())
                    .increment(1);
                self.connection.transition_if_active(
                    ConnectionStatus::Error,
                    "producer.error",
                    HistoryValue::error(&info),
                );
                error!("{}", info);
            }
        }
        Ok(())
    }

    pub fn status(&self) -> ConnectionStatus {
        self.connection.status()
    }

    pub fn status_history(&self) -> Vec<StatusHistoryEntry> {
        self.connection.status_history()
    }

    pub fn status_history_as_object(&self) -> Map<String, Value> {
        self.connection.status_history_as_object()
    }

    pub fn up_time(&self) -> Option<DateTime<Utc>> {
        self.connection.up_time()
    }

    pub fn up_time_seconds(&self) -> f64 {
        self.connection.up_time_seconds()
    }

    pub fn connected(&self) -> bool {
        self.connection.connected()
    }

    pub fn topics(&self) -> &[String] {
        self.connection.topics()
    }
}

fn encode_messages(
    messages: &[ProducerMessage],
    compression: CompressionKind,
) -> Result<Vec<OutgoingRecord>> {
    messages
        .iter()
        .map(|message| {
            Ok(OutgoingRecord {
                payload: compression.compress(message.value.as_bytes())?,
                encoding: compression,
            })
        })
        .collect()
}

#[async_trait]
impl BrokerRunner for BrokerProducer {
    fn connection(&self) -> &BrokerConnection {
        &self.connection
    }

    fn events(&self) -> broadcast::Receiver<BrokerEvent> {
        self.transport.events()
    }

    async fn run(&self) -> anyhow::Result<()> {
        debug!("Attempting to connect producer");
        self.transport.connect().await?;
        Ok(())
    }

    fn start_cycle(self: Arc<Self>, events: broadcast::Receiver<BrokerEvent>) {
        let listener = spawn_event_listener(self.clone(), events);
        self.connection.replace_cycle_tasks(vec![listener]);
    }

    async fn disconnect_quietly(&self) {
        if let Err(e) = self.transport.disconnect().await {
            error!("Failed to disconnect broker producer: {:#}", e);
        }
    }
}
