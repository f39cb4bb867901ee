//! NATS JetStream transports.
//!
//! Topics map to NATS subjects captured by a single JetStream stream.
//! Each consumed topic gets its own durable pull consumer, and the JetStream
//! stream sequence plays the role of the offset.

use crate::compression::{CompressionKind, ENCODING_HEADER};
use crate::transport::{
    Batch, BrokerEvent, BrokerMessage, BrokerTransport, ConsumerTransport, OutgoingRecord,
    ProducerTransport, EVENT_CHANNEL_CAPACITY,
};
use anyhow::{anyhow, Result};
use async_nats::jetstream::{self, consumer::PullConsumer, stream::Stream};
use async_nats::{Client, Event, HeaderMap};
use async_trait::async_trait;
use dashmap::DashMap;
use futures::future::join_all;
use futures::StreamExt;
use std::future::Future;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex, RwLock};
use tracing::{debug, info, warn};

/// Default retention period for streams (5 minutes).
pub const DEFAULT_RETENTION_SECS: u64 = 300;

/// Default max messages per stream.
pub const DEFAULT_MAX_MESSAGES: i64 = 1_000_000;

/// Default max bytes per stream (1GB).
pub const DEFAULT_MAX_BYTES: i64 = 1_073_741_824;

/// Connection settings shared by the consumer and producer transports.
#[derive(Debug, Clone)]
pub struct BrokerSettings {
    /// Server URL (e.g. `nats://localhost:4222`).
    pub url: String,
    /// Client name reported to the server.
    pub client_id: String,
    /// Prefix of the durable consumer names.
    pub group_id: String,
    /// Timeout of a single connection attempt.
    pub connection_timeout: Duration,
    /// Longest time a poll waits for messages on one topic.
    pub max_wait: Duration,
    /// Largest batch requested per topic and poll.
    pub max_batch_size: usize,
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            url: "nats://localhost:4222".to_string(),
            client_id: "gateway".to_string(),
            group_id: "gateway-group".to_string(),
            connection_timeout: Duration::from_millis(1000),
            max_wait: Duration::from_millis(500),
            max_batch_size: 100,
        }
    }
}

/// Configuration for creating a stream.
#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// Stream name.
    pub name: String,
    /// Subject patterns to capture.
    pub subjects: Vec<String>,
    /// Retention period in seconds.
    pub max_age_secs: u64,
    /// Maximum number of messages.
    pub max_messages: i64,
    /// Maximum bytes.
    pub max_bytes: i64,
}

impl StreamConfig {
    /// Stream `name` capturing the given topics with default limits.
    pub fn for_topics(name: &str, topics: &[String]) -> Self {
        Self {
            name: name.to_string(),
            subjects: topics.to_vec(),
            max_age_secs: DEFAULT_RETENTION_SECS,
            max_messages: DEFAULT_MAX_MESSAGES,
            max_bytes: DEFAULT_MAX_BYTES,
        }
    }

    /// Set retention period in seconds.
    pub fn with_retention(mut self, secs: u64) -> Self {
        self.max_age_secs = secs;
        self
    }
}

impl From<Event> for BrokerEvent {
    fn from(event: Event) -> Self {
        match event {
            Event::Connected => BrokerEvent::Connected,
            Event::Disconnected => BrokerEvent::Disconnected,
            Event::Closed => BrokerEvent::Closed,
            Event::ServerError(e) => BrokerEvent::Error(format!("server error: {}", e)),
            Event::ClientError(e) => BrokerEvent::Error(format!("client error: {}", e)),
            other => BrokerEvent::Notice(other.to_string()),
        }
    }
}

/// Wrapper around the NATS client with JetStream context.
#[derive(Clone)]
pub struct NatsClient {
    client: Client,
    jetstream: jetstream::Context,
}

impl NatsClient {
    /// Connect to a NATS server, forwarding client events to `events`.
    pub async fn connect(
        settings: &BrokerSettings,
        events: broadcast::Sender<BrokerEvent>,
    ) -> Result<Self> {
        info!("Connecting to NATS at {}", settings.url);
        let client = async_nats::ConnectOptions::new()
            .name(settings.client_id.as_str())
            .connection_timeout(settings.connection_timeout)
            .event_callback(move |event| {
                let events = events.clone();
                async move {
                    // No receivers simply means nobody is listening yet.
                    let _ = events.send(BrokerEvent::from(event));
                }
            })
            .connect(settings.url.as_str())
            .await?;
        let jetstream = jetstream::new(client.clone());

        Ok(Self { client, jetstream })
    }

    /// Create or get a stream with the given configuration.
    pub async fn ensure_stream_with_config(&self, config: &StreamConfig) -> Result<Stream> {
        info!(
            "Ensuring stream '{}' exists (subjects: {:?}, retention: {}s)",
            config.name, config.subjects, config.max_age_secs
        );

        let stream = self
            .jetstream
            .get_or_create_stream(jetstream::stream::Config {
                name: config.name.clone(),
                subjects: config.subjects.clone(),
                retention: jetstream::stream::RetentionPolicy::Limits,
                max_messages: config.max_messages,
                max_bytes: config.max_bytes,
                max_age: Duration::from_secs(config.max_age_secs),
                storage: jetstream::stream::StorageType::File,
                ..Default::default()
            })
            .await?;

        info!("Stream '{}' ready", config.name);
        Ok(stream)
    }

    /// Create or reuse a durable pull consumer for one subject.
    pub async fn durable_consumer(
        &self,
        stream: &str,
        durable_name: &str,
        subject: &str,
    ) -> Result<PullConsumer> {
        let stream = self.jetstream.get_stream(stream).await?;
        let consumer = stream
            .get_or_create_consumer(
                durable_name,
                jetstream::consumer::pull::Config {
                    durable_name: Some(durable_name.to_string()),
                    filter_subject: subject.to_string(),
                    deliver_policy: jetstream::consumer::DeliverPolicy::New,
                    ack_policy: jetstream::consumer::AckPolicy::Explicit,
                    ..Default::default()
                },
            )
            .await?;
        Ok(consumer)
    }

    /// Publish a message to JetStream (with acknowledgment).
    pub async fn publish(
        &self,
        subject: impl Into<String>,
        headers: HeaderMap,
        payload: bytes::Bytes,
    ) -> Result<()> {
        self.jetstream
            .publish_with_headers(subject.into(), headers, payload)
            .await?
            .await?;
        Ok(())
    }

    /// Flush pending writes before the client is dropped.
    pub async fn flush(&self) -> Result<()> {
        self.client.flush().await?;
        Ok(())
    }
}

/// Durable consumer names may not contain subject tokens or whitespace.
fn durable_name(group_id: &str, topic: &str) -> String {
    format!("{}-{}", group_id, topic)
        .chars()
        .map(|c| match c {
            '.' | '*' | '>' | ' ' | '\t' => '_',
            c => c,
        })
        .collect()
}

async fn close_client(slot: &RwLock<Option<NatsClient>>) -> Result<()> {
    if let Some(client) = slot.write().await.take() {
        client.flush().await?;
        debug!("NATS client closed");
    }
    Ok(())
}

/// JetStream consumer transport.
pub struct NatsConsumerTransport {
    settings: BrokerSettings,
    stream: StreamConfig,
    events: broadcast::Sender<BrokerEvent>,
    client: RwLock<Option<NatsClient>>,
    consumers: Mutex<Vec<(String, PullConsumer)>>,
    /// Delivered but not yet acknowledged messages, keyed by (topic, stream sequence).
    in_flight: DashMap<(String, u64), jetstream::Message>,
}

impl NatsConsumerTransport {
    pub fn new(settings: BrokerSettings, stream: StreamConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            settings,
            stream,
            events,
            client: RwLock::new(None),
            consumers: Mutex::new(Vec::new()),
            in_flight: DashMap::new(),
        }
    }

    async fn current_client(&self) -> Result<NatsClient> {
        self.client
            .read()
            .await
            .clone()
            .ok_or_else(|| anyhow!("NATS consumer is not connected"))
    }

    /// One pull request for `topic`, waiting at most `max_wait`.
    async fn fetch_batch(&self, topic: String, consumer: PullConsumer) -> Result<Batch> {
        let mut delivered = consumer
            .batch()
            .max_messages(self.settings.max_batch_size)
            .expires(self.settings.max_wait)
            .messages()
            .await?;

        let mut messages = Vec::new();
        while let Some(message) = delivered.next().await {
            let message = message.map_err(|e| anyhow!(e))?;
            let offset = message.info().map_err(|e| anyhow!(e))?.stream_sequence;
            let encoding = message
                .headers
                .as_ref()
                .and_then(|headers| headers.get(ENCODING_HEADER))
                .map(|value| CompressionKind::from_header(value.as_str()))
                .unwrap_or(CompressionKind::None);

            messages.push(BrokerMessage {
                offset,
                payload: message.payload.clone(),
                encoding,
            });
            self.in_flight.insert((topic.clone(), offset), message);
        }

        Ok(Batch { topic, messages })
    }
}

/// Run one fetch per subscribed topic concurrently, so an idle topic's
/// `max_wait` never delays delivery on the others. Empty batches are dropped.
async fn fetch_all<T, F, Fut>(targets: Vec<T>, fetch: F) -> Result<Vec<Batch>>
where
    F: Fn(T) -> Fut,
    Fut: Future<Output = Result<Batch>>,
{
    let batches = join_all(targets.into_iter().map(fetch))
        .await
        .into_iter()
        .collect::<Result<Vec<_>>>()?;
    Ok(batches.into_iter().filter(|batch| !batch.is_empty()).collect())
}

#[async_trait]
impl BrokerTransport for NatsConsumerTransport {
    async fn connect(&self) -> Result<()> {
        let client = NatsClient::connect(&self.settings, self.events.clone()).await?;
        client.ensure_stream_with_config(&self.stream).await?;
        *self.client.write().await = Some(client);
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.consumers.lock().await.clear();
        self.in_flight.clear();
        close_client(&self.client).await
    }

    fn events(&self) -> broadcast::Receiver<BrokerEvent> {
        self.events.subscribe()
    }
}

#[async_trait]
impl ConsumerTransport for NatsConsumerTransport {
    async fn subscribe(&self, topic: &str) -> Result<()> {
        let client = self.current_client().await?;
        let name = durable_name(&self.settings.group_id, topic);
        let consumer = client
            .durable_consumer(&self.stream.name, &name, topic)
            .await?;

        let mut consumers = self.consumers.lock().await;
        consumers.retain(|(t, _)| t != topic);
        consumers.push((topic.to_string(), consumer));
        info!("Subscribed to topic '{}' (durable '{}')", topic, name);
        Ok(())
    }

    async fn poll(&self) -> Result<Vec<Batch>> {
        let consumers = self.consumers.lock().await.clone();
        fetch_all(consumers, |(topic, consumer)| self.fetch_batch(topic, consumer)).await
    }

    async fn commit(&self, topic: &str, offset: u64) -> Result<()> {
        match self.in_flight.remove(&(topic.to_string(), offset)) {
            Some((_, message)) => message.ack().await.map_err(|e| anyhow!(e)),
            None => {
                warn!("No in-flight message at offset {} for topic {}", offset, topic);
                Ok(())
            }
        }
    }
}

/// JetStream producer transport.
pub struct NatsProducerTransport {
    settings: BrokerSettings,
    stream: StreamConfig,
    events: broadcast::Sender<BrokerEvent>,
    client: RwLock<Option<NatsClient>>,
}

impl NatsProducerTransport {
    /// `stream` must capture every topic the producer publishes to; it is
    /// created on connect if the consumer has not done so yet.
    pub fn new(settings: BrokerSettings, stream: StreamConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            settings,
            stream,
            events,
            client: RwLock::new(None),
        }
    }
}

#[async_trait]
impl BrokerTransport for NatsProducerTransport {
    async fn connect(&self) -> Result<()> {
        let client = NatsClient::connect(&self.settings, self.events.clone()).await?;
        client.ensure_stream_with_config(&self.stream).await?;
        *self.client.write().await = Some(client);
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        close_client(&self.client).await
    }

    fn events(&self) -> broadcast::Receiver<BrokerEvent> {
        self.events.subscribe()
    }
}

#[async_trait]
impl ProducerTransport for NatsProducerTransport {
    async fn publish(&self, topic: &str, records: Vec<OutgoingRecord>) -> Result<()> {
        let client = self
            .client
            .read()
            .await
            .clone()
            .ok_or_else(|| anyhow!("NATS producer is not connected"))?;

        for record in records {
            let mut headers = HeaderMap::new();
            headers.insert(ENCODING_HEADER, record.encoding.as_str());
            client.publish(topic, headers, record.payload).await?;
        }
        Ok(())
    }
}
