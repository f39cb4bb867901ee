//! In-process loopback broker.
//!
//! Every consumer and producer created from one [`InMemoryBroker`] shares its
//! topic queues. Faults can be injected per operation, which makes the broker
//! useful for local runs without a NATS server and for exercising reconnect
//! behaviour in tests.

use crate::compression::CompressionKind;
use crate::transport::{
    Batch, BrokerEvent, BrokerMessage, BrokerTransport, ConsumerTransport, OutgoingRecord,
    ProducerTransport, EVENT_CHANNEL_CAPACITY,
};
use anyhow::{bail, Result};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{broadcast, Notify};
use tracing::debug;

/// How long an idle poll waits for a publish before returning empty.
const IDLE_POLL_WAIT: Duration = Duration::from_millis(20);

fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Default)]
struct Faults {
    connect: usize,
    connect_delay: Duration,
    publish: usize,
    poll: usize,
    commit: usize,
    subscribe: HashMap<String, usize>,
}

impl Faults {
    fn take(counter: &mut usize) -> bool {
        if *counter > 0 {
            *counter -= 1;
            return true;
        }
        false
    }
}

struct Inner {
    queues: Mutex<HashMap<String, VecDeque<BrokerMessage>>>,
    next_offset: AtomicU64,
    faults: Mutex<Faults>,
    subscribe_calls: Mutex<Vec<String>>,
    commits: Mutex<Vec<(String, u64)>>,
    connect_calls: AtomicUsize,
    published: AtomicUsize,
    max_batch_size: usize,
    notify: Notify,
    events: broadcast::Sender<BrokerEvent>,
}

/// Shared in-memory broker. Cloning yields another handle to the same broker.
#[derive(Clone)]
pub struct InMemoryBroker {
    inner: Arc<Inner>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::with_max_batch_size(100)
    }

    pub fn with_max_batch_size(max_batch_size: usize) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                queues: Mutex::new(HashMap::new()),
                next_offset: AtomicU64::new(0),
                faults: Mutex::new(Faults::default()),
                subscribe_calls: Mutex::new(Vec::new()),
                commits: Mutex::new(Vec::new()),
                connect_calls: AtomicUsize::new(0),
                published: AtomicUsize::new(0),
                max_batch_size: max_batch_size.max(1),
                notify: Notify::new(),
                events,
            }),
        }
    }

    /// A new consumer handle with its own subscription set.
    pub fn consumer(&self) -> InMemoryConsumer {
        InMemoryConsumer {
            broker: self.clone(),
            connected: AtomicBool::new(false),
            subscriptions: Mutex::new(Vec::new()),
        }
    }

    /// A new producer handle.
    pub fn producer(&self) -> InMemoryProducer {
        InMemoryProducer {
            broker: self.clone(),
            connected: AtomicBool::new(false),
        }
    }

    /// Enqueue an uncompressed payload on a topic.
    pub fn push_raw(&self, topic: &str, payload: impl Into<Bytes>) {
        self.enqueue(topic, payload.into(), CompressionKind::None);
    }

    /// Emit an instrumentation event to every handle of this broker.
    pub fn emit(&self, event: BrokerEvent) {
        let _ = self.inner.events.send(event);
    }

    /// Make the next `count` connect attempts fail.
    pub fn fail_next_connects(&self, count: usize) {
        locked(&self.inner.faults).connect = count;
    }

    /// Make the next `count` subscribe attempts on `topic` fail.
    pub fn fail_next_subscribes(&self, topic: &str, count: usize) {
        locked(&self.inner.faults)
            .subscribe
            .insert(topic.to_string(), count);
    }

    /// Make the next `count` publish calls fail.
    pub fn fail_next_publishes(&self, count: usize) {
        locked(&self.inner.faults).publish = count;
    }

    /// Make the next `count` consumer polls fail.
    pub fn fail_next_polls(&self, count: usize) {
        locked(&self.inner.faults).poll = count;
    }

    /// Make the next `count` commits fail.
    pub fn fail_next_commits(&self, count: usize) {
        locked(&self.inner.faults).commit = count;
    }

    /// Stall every connect attempt for `delay` before it resolves.
    pub fn delay_connects(&self, delay: Duration) {
        locked(&self.inner.faults).connect_delay = delay;
    }

    /// Topics passed to `subscribe`, in call order, failed attempts included.
    pub fn subscribe_calls(&self) -> Vec<String> {
        locked(&self.inner.subscribe_calls).clone()
    }

    /// Committed (topic, offset) pairs, in commit order.
    pub fn commits(&self) -> Vec<(String, u64)> {
        locked(&self.inner.commits).clone()
    }

    pub fn connect_calls(&self) -> usize {
        self.inner.connect_calls.load(Ordering::SeqCst)
    }

    /// Number of records accepted by `publish`.
    pub fn published_count(&self) -> usize {
        self.inner.published.load(Ordering::SeqCst)
    }

    /// Records currently waiting on a topic.
    pub fn queued(&self, topic: &str) -> Vec<BrokerMessage> {
        locked(&self.inner.queues)
            .get(topic)
            .map(|queue| queue.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn enqueue(&self, topic: &str, payload: Bytes, encoding: CompressionKind) {
        let offset = self.inner.next_offset.fetch_add(1, Ordering::SeqCst);
        locked(&self.inner.queues)
            .entry(topic.to_string())
            .or_default()
            .push_back(BrokerMessage {
                offset,
                payload,
                encoding,
            });
        self.inner.notify.notify_waiters();
    }

    async fn take_connect_fault(&self) -> bool {
        self.inner.connect_calls.fetch_add(1, Ordering::SeqCst);
        let delay = locked(&self.inner.faults).connect_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        Faults::take(&mut locked(&self.inner.faults).connect)
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

/// Consumer handle on an [`InMemoryBroker`].
pub struct InMemoryConsumer {
    broker: InMemoryBroker,
    connected: AtomicBool,
    subscriptions: Mutex<Vec<String>>,
}

impl InMemoryConsumer {
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn drain(&self) -> Vec<Batch> {
        let topics = locked(&self.subscriptions).clone();
        let mut queues = locked(&self.broker.inner.queues);
        topics
            .into_iter()
            .filter_map(|topic| {
                let queue = queues.get_mut(&topic)?;
                let take = queue.len().min(self.broker.inner.max_batch_size);
                if take == 0 {
                    return None;
                }
                let messages = queue.drain(..take).collect();
                Some(Batch { topic, messages })
            })
            .collect()
    }
}

#[async_trait]
impl BrokerTransport for InMemoryConsumer {
    async fn connect(&self) -> Result<()> {
        if self.broker.take_connect_fault().await {
            bail!("in-memory broker refused the connection");
        }
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.connected.store(false, Ordering::SeqCst);
        locked(&self.subscriptions).clear();
        Ok(())
    }

    fn events(&self) -> broadcast::Receiver<BrokerEvent> {
        self.broker.inner.events.subscribe()
    }
}

#[async_trait]
impl ConsumerTransport for InMemoryConsumer {
    async fn subscribe(&self, topic: &str) -> Result<()> {
        locked(&self.broker.inner.subscribe_calls).push(topic.to_string());
        if !self.connected.load(Ordering::SeqCst) {
            bail!("cannot subscribe to {}: not connected", topic);
        }
        {
            let mut faults = locked(&self.broker.inner.faults);
            if let Some(remaining) = faults.subscribe.get_mut(topic) {
                if *remaining > 0 {
                    *remaining -= 1;
                    bail!("in-memory broker rejected subscription to {}", topic);
                }
            }
        }
        let mut subscriptions = locked(&self.subscriptions);
        if !subscriptions.iter().any(|t| t == topic) {
            subscriptions.push(topic.to_string());
        }
        debug!("In-memory consumer subscribed to {}", topic);
        Ok(())
    }

    async fn poll(&self) -> Result<Vec<Batch>> {
        if !self.connected.load(Ordering::SeqCst) {
            bail!("cannot poll: not connected");
        }
        if Faults::take(&mut locked(&self.broker.inner.faults).poll) {
            bail!("in-memory broker dropped the consumer poll");
        }
        let notified = self.broker.inner.notify.notified();
        let batches = self.drain();
        if !batches.is_empty() {
            return Ok(batches);
        }
        let _ = tokio::time::timeout(IDLE_POLL_WAIT, notified).await;
        Ok(self.drain())
    }

    async fn commit(&self, topic: &str, offset: u64) -> Result<()> {
        if Faults::take(&mut locked(&self.broker.inner.faults).commit) {
            bail!("in-memory broker rejected commit of {} at {}", topic, offset);
        }
        locked(&self.broker.inner.commits).push((topic.to_string(), offset));
        Ok(())
    }
}

/// Producer handle on an [`InMemoryBroker`].
pub struct InMemoryProducer {
    broker: InMemoryBroker,
    connected: AtomicBool,
}

#[async_trait]
impl BrokerTransport for InMemoryProducer {
    async fn connect(&self) -> Result<()> {
        if self.broker.take_connect_fault().await {
            bail!("in-memory broker refused the connection");
        }
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn events(&self) -> broadcast::Receiver<BrokerEvent> {
        self.broker.inner.events.subscribe()
    }
}

#[async_trait]
impl ProducerTransport for InMemoryProducer {
    async fn publish(&self, topic: &str, records: Vec<OutgoingRecord>) -> Result<()> {
        if !self.connected.load(Ordering::SeqCst) {
            bail!("cannot publish to {}: not connected", topic);
        }
        {
            let mut faults = locked(&self.broker.inner.faults);
            if Faults::take(&mut faults.publish) {
                bail!("in-memory broker rejected publish to {}", topic);
            }
        }
        let count = records.len();
        for record in records {
            self.broker.enqueue(topic, record.payload, record.encoding);
        }
        self.broker.inner.published.fetch_add(count, Ordering::SeqCst);
        Ok(())
    }
}
