//! Broker connection state shared by the consumer and the producer.
//!
//! A [`BrokerConnection`] tracks the lifecycle status, a bounded history of
//! status transitions and uptime, and owns the reconnect timer and the
//! background tasks of the current connect cycle.

use broker_client::BrokerEvent;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Number of history entries kept per connection.
pub const HISTORY_CAPACITY: usize = 20;

/// Delay before a failed connect attempt is retried.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(5000);

fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Timestamp format used in history messages.
pub fn format_time(time: DateTime<Utc>) -> String {
    time.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string()
}

/// Lifecycle status of a broker connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionStatus {
    NotInitialized,
    Connecting,
    Reconnecting,
    Started,
    Connected,
    Stopped,
    Disconnected,
    Error,
    Crashed,
}

impl ConnectionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionStatus::NotInitialized => "NOT_INITIALIZED",
            ConnectionStatus::Connecting => "CONNECTING",
            ConnectionStatus::Reconnecting => "RECONNECTING",
            ConnectionStatus::Started => "STARTED",
            ConnectionStatus::Connected => "CONNECTED",
            ConnectionStatus::Stopped => "STOPPED",
            ConnectionStatus::Disconnected => "DISCONNECTED",
            ConnectionStatus::Error => "ERROR",
            ConnectionStatus::Crashed => "CRASHED",
        }
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Value of a history entry: a status, an informational message or an error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "value", rename_all = "lowercase")]
pub enum HistoryValue {
    Info(String),
    Error(String),
}

impl HistoryValue {
    pub fn info(value: impl fmt::Display) -> Self {
        HistoryValue::Info(value.to_string())
    }

    pub fn error(value: impl fmt::Display) -> Self {
        HistoryValue::Error(value.to_string())
    }

    pub fn is_error(&self) -> bool {
        matches!(self, HistoryValue::Error(_))
    }
}

impl From<ConnectionStatus> for HistoryValue {
    fn from(status: ConnectionStatus) -> Self {
        HistoryValue::Info(status.to_string())
    }
}

impl fmt::Display for HistoryValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HistoryValue::Info(value) => f.write_str(value),
            HistoryValue::Error(value) => write!(f, "Error: {}", value),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusHistoryEntry {
    pub id: String,
    pub value: HistoryValue,
    pub timestamp: DateTime<Utc>,
}

/// Status, history and uptime of one connection.
///
/// `connected_since` is set exactly while the status is `Connected`.
#[derive(Debug, Clone)]
pub struct ConnectionState {
    status: ConnectionStatus,
    history: VecDeque<StatusHistoryEntry>,
    connected_since: Option<DateTime<Utc>>,
}

impl ConnectionState {
    pub fn new() -> Self {
        let mut state = Self {
            status: ConnectionStatus::NotInitialized,
            history: VecDeque::with_capacity(HISTORY_CAPACITY + 1),
            connected_since: None,
        };
        state.record_history("not.initialized", ConnectionStatus::NotInitialized);
        state
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status
    }

    pub fn update_status(&mut self, status: ConnectionStatus) {
        if status == ConnectionStatus::Connected {
            if self.status != ConnectionStatus::Connected || self.connected_since.is_none() {
                self.connected_since = Some(Utc::now());
            }
        } else {
            self.connected_since = None;
        }
        self.status = status;
    }

    pub fn record_history(&mut self, id: impl Into<String>, value: impl Into<HistoryValue>) {
        self.history.push_back(StatusHistoryEntry {
            id: id.into(),
            value: value.into(),
            timestamp: Utc::now(),
        });
        while self.history.len() > HISTORY_CAPACITY {
            self.history.pop_front();
        }
    }

    /// History entries, newest first.
    pub fn history(&self) -> Vec<StatusHistoryEntry> {
        self.history.iter().rev().cloned().collect()
    }

    /// History flattened for health-check JSON: `{"0": "<id> <value>", ...}`, newest first.
    pub fn history_as_object(&self) -> Map<String, Value> {
        self.history
            .iter()
            .rev()
            .enumerate()
            .map(|(index, entry)| {
                (
                    index.to_string(),
                    Value::String(format!("{} {}", entry.id, entry.value)),
                )
            })
            .collect()
    }

    pub fn up_time(&self) -> Option<DateTime<Utc>> {
        self.connected_since
    }

    pub fn up_time_seconds(&self) -> f64 {
        match (self.status, self.connected_since) {
            (ConnectionStatus::Connected, Some(since)) => {
                (Utc::now() - since).num_milliseconds().max(0) as f64 / 1000.0
            }
            _ => 0.0,
        }
    }

    pub fn connected(&self) -> bool {
        self.status == ConnectionStatus::Connected
    }
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self::new()
    }
}

/// Which side of the broker a connection serves. Used as history id prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Consumer,
    Producer,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Consumer => "consumer",
            Role::Producer => "producer",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status tracker plus the timers and tasks of one broker connection.
pub struct BrokerConnection {
    role: Role,
    topics: Vec<String>,
    topic_set: HashSet<String>,
    retry_delay: Duration,
    state: Mutex<ConnectionState>,
    reconnect_timer: Mutex<Option<JoinHandle<()>>>,
    cycle_tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl BrokerConnection {
    /// Topics keep their declared order; duplicates are dropped.
    pub fn new(role: Role, topics: Vec<String>, retry_delay: Duration) -> Self {
        let mut topic_set = HashSet::with_capacity(topics.len());
        let topics: Vec<String> = topics
            .into_iter()
            .filter(|topic| topic_set.insert(topic.clone()))
            .collect();

        Self {
            role,
            topics,
            topic_set,
            retry_delay,
            state: Mutex::new(ConnectionState::new()),
            reconnect_timer: Mutex::new(None),
            cycle_tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn topics(&self) -> &[String] {
        &self.topics
    }

    pub fn has_topic(&self, topic: &str) -> bool {
        self.topic_set.contains(topic)
    }

    pub fn retry_delay(&self) -> Duration {
        self.retry_delay
    }

    pub fn status(&self) -> ConnectionStatus {
        locked(&self.state).status()
    }

    pub fn update_status(&self, status: ConnectionStatus) {
        locked(&self.state).update_status(status);
    }

    pub fn record_history(&self, id: impl Into<String>, value: impl Into<HistoryValue>) {
        locked(&self.state).record_history(id, value);
    }

    /// Update the status and record the transition under a single lock.
    pub fn transition(
        &self,
        status: ConnectionStatus,
        id: impl Into<String>,
        value: impl Into<HistoryValue>,
    ) {
        let mut state = locked(&self.state);
        state.update_status(status);
        state.record_history(id, value);
    }

    /// Like [`transition`](Self::transition), but refused once the connection is `Stopped`.
    pub fn transition_if_active(
        &self,
        status: ConnectionStatus,
        id: impl Into<String>,
        value: impl Into<HistoryValue>,
    ) -> bool {
        let mut state = locked(&self.state);
        if state.status() == ConnectionStatus::Stopped {
            return false;
        }
        state.update_status(status);
        state.record_history(id, value);
        true
    }

    pub fn status_history(&self) -> Vec<StatusHistoryEntry> {
        locked(&self.state).history()
    }

    pub fn status_history_as_object(&self) -> Map<String, Value> {
        locked(&self.state).history_as_object()
    }

    pub fn up_time(&self) -> Option<DateTime<Utc>> {
        locked(&self.state).up_time()
    }

    pub fn up_time_seconds(&self) -> f64 {
        locked(&self.state).up_time_seconds()
    }

    pub fn connected(&self) -> bool {
        locked(&self.state).connected()
    }

    /// Install a new reconnect timer, aborting any pending one.
    pub fn set_reconnect_timer(&self, timer: JoinHandle<()>) {
        if let Some(previous) = locked(&self.reconnect_timer).replace(timer) {
            previous.abort();
        }
    }

    pub fn cancel_reconnect(&self) {
        if let Some(timer) = locked(&self.reconnect_timer).take() {
            timer.abort();
        }
    }

    pub fn has_pending_reconnect(&self) -> bool {
        locked(&self.reconnect_timer)
            .as_ref()
            .is_some_and(|timer| !timer.is_finished())
    }

    /// Replace the background tasks of the connect cycle, aborting the old ones.
    /// Tasks handed over after `stop()` are aborted immediately.
    pub fn replace_cycle_tasks(&self, tasks: Vec<JoinHandle<()>>) {
        let stopped = self.status() == ConnectionStatus::Stopped;
        let previous = {
            let mut current = locked(&self.cycle_tasks);
            if stopped {
                std::mem::take(&mut *current).into_iter().chain(tasks).collect()
            } else {
                std::mem::replace(&mut *current, tasks)
            }
        };
        for task in previous {
            task.abort();
        }
    }

    pub fn abort_cycle_tasks(&self) {
        self.replace_cycle_tasks(Vec::new());
    }

    /// First half of `stop()`: cancel the timer and the cycle, then mark `Stopped`.
    pub fn begin_stop(&self) {
        self.cancel_reconnect();
        self.abort_cycle_tasks();
        self.transition(
            ConnectionStatus::Stopped,
            format!("{}.stopped", self.role),
            ConnectionStatus::Stopped,
        );
    }

    /// Map a transport instrumentation event onto status and history.
    pub fn apply_event(&self, event: BrokerEvent) {
        let role = self.role;
        let now = format_time(Utc::now());
        let mut state = locked(&self.state);
        if state.status() == ConnectionStatus::Stopped {
            return;
        }

        match event {
            BrokerEvent::Connected => {
                let info = format!("{} {} connected", now, role);
                state.update_status(ConnectionStatus::Connected);
                state.record_history(format!("{}.connect", role), HistoryValue::info(&info));
                info!("{}", info);
            }
            BrokerEvent::Disconnected => {
                let info = format!("{} {} disconnected", now, role);
                state.update_status(ConnectionStatus::Disconnected);
                state.record_history(format!("{}.disconnect", role), HistoryValue::info(&info));
                warn!("{}", info);
            }
            BrokerEvent::Closed => {
                let info = format!("{} {} crashed: connection closed", now, role);
                state.update_status(ConnectionStatus::Crashed);
                state.record_history(format!("{}.crash", role), HistoryValue::error(&info));
                error!("{}", info);
            }
            BrokerEvent::Error(message) => {
                let info = format!("{} {} broker error: {}", now, role, message);
                state.record_history(format!("{}.broker.error", role), HistoryValue::error(&info));
                warn!("{}", info);
            }
            BrokerEvent::Notice(message) => {
                let info = format!("{} {}", now, message);
                state.record_history(format!("{}.notice", role), HistoryValue::info(&info));
                debug!("{} {}", role, info);
            }
        }
    }
}

/// A connection that can run one connect attempt.
#[async_trait::async_trait]
pub trait BrokerRunner: Send + Sync + 'static {
    fn connection(&self) -> &BrokerConnection;

    /// Instrumentation events of the underlying transport.
    fn events(&self) -> broadcast::Receiver<BrokerEvent>;

    /// One connect attempt. `Ok` means the connection is ready for use.
    async fn run(&self) -> anyhow::Result<()>;

    /// Spawn the background tasks of a successful connect cycle.
    fn start_cycle(self: Arc<Self>, events: broadcast::Receiver<BrokerEvent>);

    /// Best-effort transport disconnect; errors are logged, never returned.
    async fn disconnect_quietly(&self);
}

/// Run connect attempts until one succeeds, retrying on a timer.
///
/// Boxed because the retry timer re-enters this function from a spawned task.
pub fn initialize_and_connect<R: BrokerRunner>(runner: Arc<R>) -> BoxFuture<'static, ()> {
    Box::pin(async move {
        let role = runner.connection().role();
        if runner.connection().status() == ConnectionStatus::Started {
            info!("Broker {} is already initialized and connected", role);
            return;
        }

        // Subscribe before connecting so no event of this cycle is missed.
        let events = runner.events();
        let result = runner.run().await;
        let connection = runner.connection();

        match result {
            Ok(()) => {
                connection.cancel_reconnect();
                let started = connection.transition_if_active(
                    ConnectionStatus::Started,
                    format!("{}.started", role),
                    ConnectionStatus::Started,
                ) && connection.transition_if_active(
                    ConnectionStatus::Connected,
                    format!("{}.connected", role),
                    ConnectionStatus::Connected,
                );
                if !started {
                    debug!("Broker {} was stopped during a connect attempt", role);
                    runner.disconnect_quietly().await;
                    return;
                }
                info!("Broker {} started and connected", role);
                runner.clone().start_cycle(events);
            }
            Err(e) => {
                if connection.status() == ConnectionStatus::Stopped {
                    debug!("Broker {} was stopped during a failed connect attempt", role);
                    return;
                }
                warn!(
                    "Connection to broker for {} failed, retrying in {:?}: {:#}",
                    role,
                    connection.retry_delay(),
                    e
                );
                if connection.transition_if_active(
                    ConnectionStatus::Reconnecting,
                    format!("{}.error", role),
                    HistoryValue::error(format!("{:#}", e)),
                ) {
                    schedule_reconnect(runner.clone());
                }
            }
        }
    })
}

/// Arm the reconnect timer of `runner`'s connection.
pub fn schedule_reconnect<R: BrokerRunner>(runner: Arc<R>) {
    let delay = runner.connection().retry_delay();
    let next = runner.clone();
    let timer = tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        initialize_and_connect(next).await;
    });
    runner.connection().set_reconnect_timer(timer);
}

/// Forward transport events to the connection's status until the channel closes.
pub fn spawn_event_listener<R: BrokerRunner>(
    runner: Arc<R>,
    mut events: broadcast::Receiver<BrokerEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => runner.connection().apply_event(event),
                Err(RecvError::Lagged(skipped)) => {
                    warn!(
                        "Broker {} event listener skipped {} events",
                        runner.connection().role(),
                        skipped
                    );
                }
                Err(RecvError::Closed) => break,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL_STATUSES: [ConnectionStatus; 9] = [
        ConnectionStatus::NotInitialized,
        ConnectionStatus::Connecting,
        ConnectionStatus::Reconnecting,
        ConnectionStatus::Started,
        ConnectionStatus::Connected,
        ConnectionStatus::Stopped,
        ConnectionStatus::Disconnected,
        ConnectionStatus::Error,
        ConnectionStatus::Crashed,
    ];

    #[test]
    fn test_new_state_is_not_initialized() {
        let state = ConnectionState::new();
        assert_eq!(state.status(), ConnectionStatus::NotInitialized);
        assert!(!state.connected());
        assert_eq!(state.history().len(), 1);
        assert_eq!(state.history()[0].id, "not.initialized");
    }

    #[test]
    fn test_connected_since_tracks_connected_status() {
        let mut state = ConnectionState::new();
        // Every ordered pair of statuses, including repeats.
        for from in ALL_STATUSES {
            for to in ALL_STATUSES {
                state.update_status(from);
                assert_eq!(state.up_time().is_some(), from == ConnectionStatus::Connected);
                state.update_status(to);
                assert_eq!(state.up_time().is_some(), to == ConnectionStatus::Connected);
            }
        }
    }

    #[test]
    fn test_repeated_connected_keeps_original_uptime() {
        let mut state = ConnectionState::new();
        state.update_status(ConnectionStatus::Connected);
        let since = state.up_time();
        std::thread::sleep(Duration::from_millis(5));
        state.update_status(ConnectionStatus::Connected);
        assert_eq!(state.up_time(), since);
    }

    #[test]
    fn test_uptime_seconds_is_zero_unless_connected() {
        let mut state = ConnectionState::new();
        assert_eq!(state.up_time_seconds(), 0.0);
        state.update_status(ConnectionStatus::Connected);
        std::thread::sleep(Duration::from_millis(20));
        assert!(state.up_time_seconds() > 0.0);
        state.update_status(ConnectionStatus::Error);
        assert_eq!(state.up_time_seconds(), 0.0);
    }

    #[test]
    fn test_history_is_capped_and_evicts_oldest() {
        let mut state = ConnectionState::new();
        for i in 1..=21 {
            state.record_history(format!("entry.{}", i), HistoryValue::info(i));
        }

        let history = state.history();
        assert_eq!(history.len(), HISTORY_CAPACITY);
        assert!(history.iter().all(|e| e.id != "not.initialized"));
        assert!(history.iter().all(|e| e.id != "entry.1"));
        // Newest first, consecutive.
        let ids: Vec<String> = history.iter().map(|e| e.id.clone()).collect();
        let expected: Vec<String> = (2..=21).rev().map(|i| format!("entry.{}", i)).collect();
        assert_eq!(ids, expected);
    }

    #[test]
    fn test_history_as_object_is_newest_first() {
        let mut state = ConnectionState::new();
        state.record_history("consumer.error", HistoryValue::error("boom"));

        let object = state.history_as_object();
        assert_eq!(object.len(), 2);
        assert_eq!(object["0"], "consumer.error Error: boom");
        assert_eq!(object["1"], "not.initialized NOT_INITIALIZED");
    }

    #[test]
    fn test_status_serializes_screaming_snake_case() {
        let json = serde_json::to_string(&ConnectionStatus::NotInitialized).unwrap();
        assert_eq!(json, "\"NOT_INITIALIZED\"");
        assert_eq!(ConnectionStatus::Reconnecting.to_string(), "RECONNECTING");
    }

    #[test]
    fn test_topics_are_deduplicated_in_order() {
        let topics = vec!["b".to_string(), "a".to_string(), "b".to_string()];
        let connection = BrokerConnection::new(Role::Consumer, topics, DEFAULT_RETRY_DELAY);
        assert_eq!(connection.topics(), ["b", "a"]);
        assert!(connection.has_topic("a"));
        assert!(!connection.has_topic("c"));
    }

    #[test]
    fn test_events_are_ignored_after_stop() {
        let connection = BrokerConnection::new(Role::Producer, vec![], DEFAULT_RETRY_DELAY);
        connection.apply_event(BrokerEvent::Connected);
        assert!(connection.connected());

        connection.apply_event(BrokerEvent::Closed);
        assert_eq!(connection.status(), ConnectionStatus::Crashed);

        connection.transition(ConnectionStatus::Stopped, "producer.stopped", ConnectionStatus::Stopped);
        connection.apply_event(BrokerEvent::Connected);
        assert_eq!(connection.status(), ConnectionStatus::Stopped);
    }

    #[test]
    fn test_broker_error_event_keeps_status() {
        let connection = BrokerConnection::new(Role::Consumer, vec![], DEFAULT_RETRY_DELAY);
        connection.apply_event(BrokerEvent::Connected);
        connection.apply_event(BrokerEvent::Error("slow consumer".to_string()));
        assert!(connection.connected());
        let newest = &connection.status_history()[0];
        assert_eq!(newest.id, "consumer.broker.error");
        assert!(newest.value.is_error());
    }
}
