//! Broker consumer: keeps a fixed topic set subscribed and dispatches every
//! delivered batch to the callback registered for its topic.
//!
//! Connect cycle: stale disconnect (best effort) → connect → subscribe to each
//! topic in declared order. The first failing subscription aborts the attempt;
//! the retry re-runs the whole sequence, so earlier topics are subscribed again.

use crate::connection::{
    format_time, initialize_and_connect, schedule_reconnect, spawn_event_listener,
    BrokerConnection, BrokerRunner, ConnectionStatus, HistoryValue, Role, StatusHistoryEntry,
    DEFAULT_RETRY_DELAY,
};
use crate::error::{GatewayError, Result};
use async_trait::async_trait;
use broker_client::{Batch, BrokerEvent, BrokerMessage, ConsumerTransport};
use chrono::{DateTime, Utc};
use metrics::counter;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

/// Callback invoked with a topic and the parsed messages of one batch.
pub type ConsumerCallback = Arc<dyn Fn(&str, &[Value]) -> anyhow::Result<()> + Send + Sync>;

/// Consumer settings.
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    /// Topics to keep subscribed, in subscription order.
    pub topics: Vec<String>,
    /// Delay between failed connect attempts.
    pub retry_delay: Duration,
}

impl ConsumerConfig {
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

/// Long-lived consumer owning one subscription set and its callback registry.
pub struct BrokerConsumer {
    connection: BrokerConnection,
    transport: Arc<dyn ConsumerTransport>,
    callbacks: RwLock<HashMap<String, ConsumerCallback>>,
}

impl BrokerConsumer {
    pub fn new(transport: Arc<dyn ConsumerTransport>, config: ConsumerConfig) -> Arc<Self> {
        info!("Configured broker consumer topics {}", config.topics.join(", "));
        Arc::new(Self {
            connection: BrokerConnection::new(Role::Consumer, config.topics, config.retry_delay),
            transport,
            callbacks: RwLock::new(HashMap::new()),
        })
    }

    /// Register the callback for a topic, replacing any previous one.
    ///
    /// A blank topic is rejected. A topic outside the configured set is
    /// registered anyway, with a warning.
    pub fn register_callback_for_topic(&self, topic: &str, callback: ConsumerCallback) {
        if topic.trim().is_empty() {
            error!("Invalid topic, failed to register consumer callback for topic");
            return;
        }

        if !self.connection.has_topic(topic) {
            warn!(
                "Registering consumer callback for topic that has not been configured with the consumer: {}",
                topic
            );
        }

        let mut callbacks = self
            .callbacks
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if callbacks.contains_key(topic) {
            warn!("Overwriting an existing registered consumer callback for topic: {}", topic);
        }
        info!("Registering consumer callback for topic: {}", topic);
        callbacks.insert(topic.to_string(), callback);
    }

    pub fn register_callback_for_topics(&self, topics: &[String], callback: ConsumerCallback) {
        for topic in topics {
            self.register_callback_for_topic(topic, callback.clone());
        }
    }

    pub fn unregister_callback_for_topic(&self, topic: &str) {
        let removed = self
            .callbacks
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(topic);
        if removed.is_some() {
            info!("Un-registering consumer callback for topic: {}", topic);
        }
    }

    pub fn has_callback_for_topic(&self, topic: &str) -> bool {
        self.callback_for(topic).is_some()
    }

    fn callback_for(&self, topic: &str) -> Option<ConsumerCallback> {
        self.callbacks
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(topic)
            .cloned()
    }

    /// Start consuming. Only the first call from `NotInitialized` has an effect.
    ///
    /// Returns after the first connect attempt; failed attempts keep retrying
    /// in the background until `stop()`.
    pub async fn start(self: &Arc<Self>) {
        if self.connection.status() == ConnectionStatus::NotInitialized {
            info!("Starting and initializing broker consumer");
            self.connection.transition(
                ConnectionStatus::Connecting,
                "consumer.connecting",
                ConnectionStatus::Connecting,
            );
            initialize_and_connect(self.clone()).await;
        } else {
            warn!("Broker consumer has already been started");
        }
    }

    /// Cancel any pending reconnect, mark `Stopped` and disconnect (best effort).
    pub async fn stop(&self) {
        info!("Stopping broker consumer");
        self.connection.begin_stop();
        self.disconnect_quietly().await;
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

    /// One connect-and-subscribe attempt.
    async fn connect_and_subscribe(&self) -> anyhow::Result<()> {
        // A previous attempt may have connected before a subscription failed.
        if let Err(e) = self.transport.disconnect().await {
            warn!("Unexpected error while attempting to disconnect consumer: {:#}", e);
        }

        self.transport.connect().await.map_err(|e| {
            error!("Unexpected error occurred while attempting to connect consumer: {:#}", e);
            e
        })?;

        for topic in self.connection.topics() {
            if let Err(e) = self.transport.subscribe(topic).await {
                error!("Failed to subscribe to topic {}: {:#}", topic, e);
                return Err(e.context(format!("failed to subscribe to topic {}", topic)));
            }
        }
        Ok(())
    }

    /// Receive batches until the transport fails or the task is aborted.
    async fn consume(self: Arc<Self>) {
        loop {
            match self.transport.poll().await {
                Ok(batches) => {
                    for batch in batches {
                        self.handle_batch(batch).await;
                    }
                }
                Err(e) => {
                    let reconnecting = self.connection.transition_if_active(
                        ConnectionStatus::Reconnecting,
                        "consumer.error",
                        HistoryValue::error(format!("{:#}", e)),
                    );
                    if reconnecting {
                        warn!("Broker consumer lost its subscription, reconnecting: {:#}", e);
                        schedule_reconnect(self.clone());
                    }
                    return;
                }
            }
        }
    }

    /// Commit every message, then parse the batch and hand it to the topic's callback.
    ///
    /// Offsets are committed before dispatch so a failing handler never causes
    /// redelivery. Parse and callback failures mark the consumer `Error` and
    /// the batch is dropped.
    pub(crate) async fn handle_batch(&self, batch: Batch) {
        if batch.is_empty() {
            return;
        }

        let topic = batch.topic.as_str();
        let mut parsed = Vec::with_capacity(batch.messages.len());
        let mut failure: Option<GatewayError> = None;

        for message in &batch.messages {
            if let Err(e) = self.transport.commit(topic, message.offset).await {
                warn!("Failed to commit offset {} for topic {}: {:#}", message.offset, topic, e);
            }
            if failure.is_some() {
                continue;
            }
            match decode_message(message) {
                Ok(value) => parsed.push(value),
                Err(e) => failure = Some(e),
            }
        }

        let result = match failure {
            Some(e) => Err(e),
            None => {
                self.connection.record_history(
                    "consumer.received",
                    HistoryValue::info(format!(
                        "Last consumed {} message(s) at {}",
                        parsed.len(),
                        format_time(Utc::now())
                    )),
                );
                counter!("gateway_broker_messages_consumed_total", "topic" => topic.to_string())
                    .increment(parsed.len() as u64);
                self.dispatch(topic, &parsed)
            }
        };

        if let Err(e) = result {
            let info = format!(
                "For topic {} failed to consume {} message(s) at {} {}",
                topic,
                batch.messages.len(),
                format_time(Utc::now()),
                e
            );
            counter!("gateway_broker_batch_errors_total", "topic" => topic.to_string())
                .increment(1);
            self.connection.transition_if_active(
                ConnectionStatus::Error,
                "consumer.error",
                HistoryValue::error(&info),
            );
            error!("Failed to consume broker message(s): {}", info);
        }
    }

    fn dispatch(&self, topic: &str, messages: &[Value]) -> Result<()> {
        let Some(callback) = self.callback_for(topic) else {
            warn!("No consumer callback configured for topic: {}", topic);
            return Ok(());
        };

        match catch_unwind(AssertUnwindSafe(|| callback(topic, messages))) {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(GatewayError::Callback {
                topic: topic.to_string(),
                message: format!("{:#}", e),
            }),
            Err(panic) => Err(GatewayError::Callback {
                topic: topic.to_string(),
                message: panic_message(panic.as_ref()),
            }),
        }
    }
}

fn decode_message(message: &BrokerMessage) -> Result<Value> {
    let payload = message.decoded_payload()?;
    Ok(serde_json::from_slice(&payload)?)
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        format!("callback panicked: {}", message)
    } else if let Some(message) = panic.downcast_ref::<String>() {
        format!("callback panicked: {}", message)
    } else {
        "callback panicked".to_string()
    }
}

#[async_trait]
impl BrokerRunner for BrokerConsumer {
    fn connection(&self) -> &BrokerConnection {
        &self.connection
    }

    fn events(&self) -> broadcast::Receiver<BrokerEvent> {
        self.transport.events()
    }

    async fn run(&self) -> anyhow::Result<()> {
        debug!("Attempting to connect and subscribe consumer");
        self.connect_and_subscribe().await?;
        info!(
            "Successfully connected and subscribed topics ({}) to consumer",
            self.connection.topics().join(",")
        );
        Ok(())
    }

    fn start_cycle(self: Arc<Self>, events: broadcast::Receiver<BrokerEvent>) {
        let listener = spawn_event_listener(self.clone(), events);
        let consumer = tokio::spawn(self.clone().consume());
        self.connection.replace_cycle_tasks(vec![listener, consumer]);
    }

    async fn disconnect_quietly(&self) {
        if let Err(e) = self.transport.disconnect().await {
            error!("Failed to disconnect broker consumer: {:#}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::wait_until;
    use broker_client::InMemoryBroker;
    use std::sync::Mutex;

    const RETRY: Duration = Duration::from_millis(10);

    fn topics(names: &[&str]) -> Vec<String> {
        names.iter().map(|t| t.to_string()).collect()
    }

    fn consumer_on(broker: &InMemoryBroker, names: &[&str]) -> Arc<BrokerConsumer> {
        BrokerConsumer::new(
            Arc::new(broker.consumer()),
            ConsumerConfig::new(topics(names)).with_retry_delay(RETRY),
        )
    }

    fn recording_callback() -> (ConsumerCallback, Arc<Mutex<Vec<(String, Vec<Value>)>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let callback: ConsumerCallback =
            Arc::new(move |topic: &str, messages: &[Value]| -> anyhow::Result<()> {
                sink.lock().unwrap().push((topic.to_string(), messages.to_vec()));
                Ok(())
            });
        (callback, seen)
    }

    #[tokio::test]
    async fn test_flaky_topic_is_resubscribed_from_scratch() {
        let broker = InMemoryBroker::new();
        broker.fail_next_subscribes("t2", 1);
        let consumer = consumer_on(&broker, &["t1", "t2", "t3", "t4"]);

        consumer.start().await;
        assert_eq!(consumer.status(), ConnectionStatus::Reconnecting);

        wait_until(|| consumer.connected()).await;
        assert_eq!(
            broker.subscribe_calls(),
            vec!["t1", "t2", "t1", "t2", "t3", "t4"]
        );
        assert!(consumer.up_time().is_some());

        let ids: Vec<String> = consumer.status_history().into_iter().map(|e| e.id).collect();
        assert_eq!(ids[0], "consumer.connected");
        assert_eq!(ids[1], "consumer.started");
        assert!(ids.contains(&"consumer.error".to_string()));
        consumer.stop().await;
    }

    #[tokio::test]
    async fn test_connect_failures_are_retried() {
        let broker = InMemoryBroker::new();
        broker.fail_next_connects(2);
        let consumer = consumer_on(&broker, &["t1"]);

        consumer.start().await;
        wait_until(|| consumer.connected()).await;
        assert_eq!(broker.connect_calls(), 3);
        consumer.stop().await;
    }

    #[tokio::test]
    async fn test_second_start_is_a_noop() {
        let broker = InMemoryBroker::new();
        let consumer = consumer_on(&broker, &["t1"]);

        consumer.start().await;
        assert!(consumer.connected());
        consumer.start().await;
        assert_eq!(broker.connect_calls(), 1);
        assert_eq!(broker.subscribe_calls(), vec!["t1"]);
        consumer.stop().await;
    }

    #[tokio::test]
    async fn test_stop_cancels_pending_reconnect() {
        let broker = InMemoryBroker::new();
        broker.fail_next_connects(usize::MAX);
        let consumer = consumer_on(&broker, &["t1"]);

        consumer.start().await;
        assert_eq!(consumer.status(), ConnectionStatus::Reconnecting);
        assert!(consumer.connection.has_pending_reconnect());
        consumer.stop().await;

        assert!(!consumer.connection.has_pending_reconnect());
        assert_eq!(consumer.status(), ConnectionStatus::Stopped);
        let calls = broker.connect_calls();
        tokio::time::sleep(RETRY * 5).await;
        assert_eq!(broker.connect_calls(), calls);
        assert_eq!(consumer.status(), ConnectionStatus::Stopped);
        assert_eq!(consumer.status_history()[0].id, "consumer.stopped");
    }

    #[tokio::test]
    async fn test_poll_failure_reconnects_and_resumes() {
        let broker = InMemoryBroker::new();
        let consumer = BrokerConsumer::new(
            Arc::new(broker.consumer()),
            ConsumerConfig::new(topics(&["t1"])).with_retry_delay(Duration::from_millis(200)),
        );
        let (callback, seen) = recording_callback();
        consumer.register_callback_for_topic("t1", callback);
        consumer.start().await;
        assert!(consumer.connected());

        broker.fail_next_polls(1);
        wait_until(|| consumer.status() == ConnectionStatus::Reconnecting).await;
        assert!(consumer.connection.has_pending_reconnect());
        let newest = &consumer.status_history()[0];
        assert_eq!(newest.id, "consumer.error");
        assert!(newest.value.is_error());

        wait_until(|| consumer.connected()).await;
        assert_eq!(broker.connect_calls(), 2);
        assert_eq!(broker.subscribe_calls(), vec!["t1", "t1"]);

        broker.push_raw("t1", r#"{"n":1}"#);
        wait_until(|| seen.lock().unwrap().len() == 1).await;
        consumer.stop().await;
    }

    #[tokio::test]
    async fn test_commit_failure_does_not_abort_batch() {
        let broker = InMemoryBroker::new();
        let consumer = consumer_on(&broker, &["t1"]);
        let (callback, seen) = recording_callback();
        consumer.register_callback_for_topic("t1", callback);

        broker.fail_next_commits(1);
        consumer
            .handle_batch(Batch {
                topic: "t1".to_string(),
                messages: vec![
                    BrokerMessage {
                        offset: 1,
                        payload: r#"{"n":1}"#.into(),
                        encoding: broker_client::CompressionKind::None,
                    },
                    BrokerMessage {
                        offset: 2,
                        payload: r#"{"n":2}"#.into(),
                        encoding: broker_client::CompressionKind::None,
                    },
                ],
            })
            .await;

        assert_eq!(broker.commits(), vec![("t1".to_string(), 2)]);
        let seen = seen.lock().unwrap().clone();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].1.len(), 2);
        assert_eq!(consumer.status_history()[0].id, "consumer.received");
    }

    #[tokio::test]
    async fn test_stop_during_connect_discards_attempt() {
        let broker = InMemoryBroker::new();
        broker.delay_connects(Duration::from_millis(100));
        let transport = Arc::new(broker.consumer());
        let consumer = BrokerConsumer::new(
            transport.clone(),
            ConsumerConfig::new(topics(&["t1"])).with_retry_delay(RETRY),
        );
        let (callback, seen) = recording_callback();
        consumer.register_callback_for_topic("t1", callback);

        let starting = tokio::spawn({
            let consumer = consumer.clone();
            async move { consumer.start().await }
        });
        wait_until(|| broker.connect_calls() == 1).await;
        consumer.stop().await;
        starting.await.unwrap();

        assert_eq!(consumer.status(), ConnectionStatus::Stopped);
        assert_eq!(consumer.status_history()[0].id, "consumer.stopped");
        assert!(!transport.is_connected());
        assert!(!consumer.connection.has_pending_reconnect());

        broker.push_raw("t1", "{}");
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(seen.lock().unwrap().is_empty());
        assert_eq!(broker.queued("t1").len(), 1);
    }

    #[tokio::test]
    async fn test_batches_are_dispatched_to_topic_callback() {
        let broker = InMemoryBroker::new();
        let consumer = consumer_on(&broker, &["t1", "t2"]);
        let (callback, seen) = recording_callback();
        consumer.register_callback_for_topic("t1", callback);
        consumer.start().await;

        broker.push_raw("t1", r#"{"type":"event","n":1}"#);
        broker.push_raw("t1", r#"{"type":"event","n":2}"#);
        broker.push_raw("t2", r#"{"type":"ignored"}"#);

        wait_until(|| broker.commits().len() == 3).await;
        wait_until(|| !seen.lock().unwrap().is_empty()).await;

        let seen = seen.lock().unwrap().clone();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].0, "t1");
        assert_eq!(seen[0].1.len(), 2);
        assert_eq!(seen[0].1[1]["n"], 2);
        assert!(consumer.connected());
        consumer.stop().await;
    }

    #[tokio::test]
    async fn test_offsets_committed_before_callback_runs() {
        let broker = InMemoryBroker::new();
        let consumer = consumer_on(&broker, &["t1"]);
        let observed = Arc::new(Mutex::new(None));
        let commit_log = broker.clone();
        let sink = observed.clone();
        consumer.register_callback_for_topic(
            "t1",
            Arc::new(move |_topic: &str, _messages: &[Value]| -> anyhow::Result<()> {
                *sink.lock().unwrap() = Some(commit_log.commits().len());
                Ok(())
            }),
        );
        consumer.start().await;

        broker.push_raw("t1", "{}");
        broker.push_raw("t1", "{}");
        wait_until(|| observed.lock().unwrap().is_some()).await;
        assert_eq!(*observed.lock().unwrap(), Some(2));
        consumer.stop().await;
    }

    #[tokio::test]
    async fn test_malformed_batch_sets_error_and_consumption_continues() {
        let broker = InMemoryBroker::with_max_batch_size(2);
        let consumer = consumer_on(&broker, &["t1"]);
        let (callback, seen) = recording_callback();
        consumer.register_callback_for_topic("t1", callback);
        consumer.start().await;

        broker.push_raw("t1", "not json");
        broker.push_raw("t1", "{}");
        wait_until(|| consumer.status() == ConnectionStatus::Error).await;
        // Both messages of the failed batch are committed anyway.
        wait_until(|| broker.commits().len() == 2).await;
        assert!(seen.lock().unwrap().is_empty());
        let newest = &consumer.status_history()[0];
        assert_eq!(newest.id, "consumer.error");
        assert!(newest.value.to_string().contains("failed to consume 2 message(s)"));

        broker.push_raw("t1", r#"{"ok":true}"#);
        wait_until(|| seen.lock().unwrap().len() == 1).await;
        consumer.stop().await;
    }

    #[tokio::test]
    async fn test_failing_and_panicking_callbacks_are_contained() {
        let broker = InMemoryBroker::new();
        let consumer = consumer_on(&broker, &["t1", "t2"]);
        consumer.register_callback_for_topic(
            "t1",
            Arc::new(|_: &str, _: &[Value]| -> anyhow::Result<()> {
                Err(anyhow::anyhow!("handler failed"))
            }),
        );
        consumer.register_callback_for_topic(
            "t2",
            Arc::new(|_: &str, _: &[Value]| -> anyhow::Result<()> {
                panic!("handler panicked")
            }),
        );
        consumer.start().await;

        broker.push_raw("t1", "{}");
        wait_until(|| consumer.status() == ConnectionStatus::Error).await;
        assert!(consumer.status_history()[0].value.to_string().contains("handler failed"));

        broker.push_raw("t2", "{}");
        wait_until(|| {
            consumer.status_history()[0]
                .value
                .to_string()
                .contains("handler panicked")
        })
        .await;
        assert_eq!(broker.commits().len(), 2);
        consumer.stop().await;
    }

    #[tokio::test]
    async fn test_empty_batch_has_no_side_effects() {
        let broker = InMemoryBroker::new();
        let consumer = consumer_on(&broker, &["t1"]);
        let before = consumer.status_history();

        consumer
            .handle_batch(Batch {
                topic: "t1".to_string(),
                messages: Vec::new(),
            })
            .await;

        assert_eq!(consumer.status_history(), before);
        assert!(broker.commits().is_empty());
    }

    #[tokio::test]
    async fn test_gzip_payloads_are_decoded() {
        let broker = InMemoryBroker::new();
        let consumer = consumer_on(&broker, &["t1"]);
        let (callback, seen) = recording_callback();
        consumer.register_callback_for_topic("t1", callback);

        let payload = broker_client::CompressionKind::Gzip
            .compress(br#"{"type":"event"}"#)
            .unwrap();
        consumer
            .handle_batch(Batch {
                topic: "t1".to_string(),
                messages: vec![BrokerMessage {
                    offset: 7,
                    payload,
                    encoding: broker_client::CompressionKind::Gzip,
                }],
            })
            .await;

        assert_eq!(seen.lock().unwrap()[0].1[0]["type"], "event");
        assert_eq!(broker.commits(), vec![("t1".to_string(), 7)]);
    }

    #[test]
    fn test_callback_registration_rules() {
        let broker = InMemoryBroker::new();
        let consumer = consumer_on(&broker, &["t1"]);
        let (callback, _) = recording_callback();

        consumer.register_callback_for_topic("  ", callback.clone());
        assert!(!consumer.has_callback_for_topic("  "));

        // Unconfigured topics are registered with a warning.
        consumer.register_callback_for_topic("other", callback.clone());
        assert!(consumer.has_callback_for_topic("other"));

        consumer.register_callback_for_topics(&topics(&["t1", "t1"]), callback);
        assert!(consumer.has_callback_for_topic("t1"));

        consumer.unregister_callback_for_topic("t1");
        consumer.unregister_callback_for_topic("t1");
        assert!(!consumer.has_callback_for_topic("t1"));
    }
}
