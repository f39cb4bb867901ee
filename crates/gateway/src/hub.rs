//! Subscription hub: per-socket interest sets and event fan-out.
//!
//! Uses DashMap for the client and interest maps so the accept, close,
//! subscribe and broadcast paths can run on different tasks.
//! Frames are handed to each socket's bounded outbound channel with
//! `try_send`, so one slow socket never holds up delivery to the others.

use crate::consumer::ConsumerCallback;
use crate::error::{GatewayError, Result};
use crate::protocol::{parse_subscription, SystemEvent};
use axum::extract::ws::Message;
use chrono::Utc;
use dashmap::DashMap;
use metrics::{counter, gauge};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, RwLock};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Unique client identifier.
pub type ClientId = Uuid;

/// Default buffer size for client message channels.
/// Sized for ~1 second of high-frequency updates at 1000 msgs/sec.
pub const CLIENT_CHANNEL_BUFFER_SIZE: usize = 1000;

/// Default hot-cache event type.
pub const DEFAULT_HOT_EVENT_TYPE: &str = "soh-message";

/// State for a single connected socket.
pub struct ClientState {
    /// Unique client identifier.
    pub id: ClientId,
    /// Channel to the socket's writer task.
    pub tx: mpsc::Sender<Message>,
    /// Timestamp when client connected.
    pub connected_at: i64,
    /// Timestamp of last ping received.
    pub last_ping: AtomicI64,
}

impl ClientState {
    pub fn new(tx: mpsc::Sender<Message>) -> Self {
        let now = Utc::now().timestamp_millis();
        Self {
            id: Uuid::new_v4(),
            tx,
            connected_at: now,
            last_ping: AtomicI64::new(now),
        }
    }

    /// Queue an event for this socket without waiting.
    pub fn send(&self, event: &SystemEvent) -> Result<()> {
        let json = serde_json::to_string(event)?;
        self.send_text(json)
    }

    /// Queue an already serialized frame. Fails if the buffer is full or the socket gone.
    pub fn send_text(&self, json: String) -> Result<()> {
        self.tx.try_send(Message::Text(json.into()))?;
        Ok(())
    }

    /// Update the last ping timestamp.
    pub fn update_ping(&self) {
        self.last_ping
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    /// Get the last ping timestamp.
    pub fn last_ping_time(&self) -> i64 {
        self.last_ping.load(Ordering::Relaxed)
    }
}

/// Tracks live sockets, their interest sets and the hot-event cache.
pub struct SubscriptionHub {
    /// Client ID → Client State.
    clients: DashMap<ClientId, Arc<ClientState>>,
    /// Client ID → interest set. Present once the socket has subscribed.
    subscriptions: DashMap<ClientId, HashSet<String>>,
    /// Event type cached for replay to new subscribers.
    hot_event_type: String,
    /// Latest event of `hot_event_type`.
    cached_event: RwLock<Option<SystemEvent>>,
}

impl SubscriptionHub {
    pub fn new(hot_event_type: impl Into<String>) -> Self {
        Self {
            clients: DashMap::new(),
            subscriptions: DashMap::new(),
            hot_event_type: hot_event_type.into(),
            cached_event: RwLock::new(None),
        }
    }

    /// Track an accepted socket and greet it.
    pub fn register(&self, client: Arc<ClientState>) -> ClientId {
        let id = client.id;
        self.clients.insert(id, client.clone());

        if let Err(e) = client.send(&SystemEvent::gateway_connected()) {
            warn!("Failed to greet client {}: {}", id, e);
        }

        counter!("gateway_connections_total").increment(1);
        gauge!("gateway_active_connections").set(self.client_count() as f64);
        info!("Client {} registered", id);
        id
    }

    /// Forget a closed socket and its interest set.
    pub fn unregister(&self, client_id: &ClientId) {
        self.subscriptions.remove(client_id);
        if let Some((_, client)) = self.clients.remove(client_id) {
            counter!("gateway_disconnections_total").increment(1);
            gauge!("gateway_active_connections").set(self.client_count() as f64);
            let now = Utc::now().timestamp_millis();
            info!(
                "Client {} unregistered after {} ms (last ping {} ms ago)",
                client_id,
                now - client.connected_at,
                now - client.last_ping_time()
            );
        }
    }

    /// Get a client by ID.
    pub fn get(&self, client_id: &ClientId) -> Option<Arc<ClientState>> {
        self.clients.get(client_id).map(|r| r.clone())
    }

    /// Apply a subscription frame from a socket.
    ///
    /// A valid frame replaces the socket's interest set and replays the cached
    /// hot event if the new set includes it. An invalid frame leaves the
    /// existing set untouched.
    pub fn handle_subscription_message(
        &self,
        client_id: &ClientId,
        message: Option<&str>,
    ) -> Result<()> {
        let client = self
            .get(client_id)
            .ok_or_else(|| GatewayError::InvalidSubscription(format!("unknown client {}", client_id)))?;

        let interests = parse_subscription(message).ok_or_else(|| {
            GatewayError::InvalidSubscription(format!(
                "ignoring malformed subscription from {}: {:?}",
                client_id, message
            ))
        })?;

        let wants_hot = interests.contains(&self.hot_event_type);
        debug!("Client {} subscribed to {:?}", client_id, interests);
        counter!("gateway_subscriptions_total").increment(1);

        // Held until the replay is queued so a concurrent hot publish lands
        // either entirely before or entirely after it.
        let cached = self
            .cached_event
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        self.subscriptions.insert(*client_id, interests);

        if wants_hot {
            if let Some(event) = cached.as_ref() {
                if let Err(e) = client.send(event) {
                    debug!("Failed to replay cached event to {}: {}", client_id, e);
                }
            }
        }
        Ok(())
    }

    /// Cache (if hot) and broadcast an event to every interested socket.
    /// Returns the number of sockets the frame was queued for.
    pub fn publish(&self, event: &SystemEvent) -> usize {
        if event.event_type != self.hot_event_type {
            return self.broadcast(event);
        }

        let mut cached = self
            .cached_event
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *cached = Some(event.clone());
        self.broadcast(event)
    }

    fn broadcast(&self, event: &SystemEvent) -> usize {
        let recipients: Vec<ClientId> = self
            .subscriptions
            .iter()
            .filter(|entry| entry.value().contains(&event.event_type))
            .map(|entry| *entry.key())
            .collect();
        if recipients.is_empty() {
            return 0;
        }

        // Pre-serialize the message once
        let json = match serde_json::to_string(event) {
            Ok(j) => j,
            Err(e) => {
                warn!("Failed to serialize broadcast event: {}", e);
                return 0;
            }
        };

        let mut delivered = 0;
        for id in recipients {
            let Some(client) = self.get(&id) else {
                continue;
            };
            match client.send_text(json.clone()) {
                Ok(()) => delivered += 1,
                Err(e) => debug!("Failed to send to client {}: {}", id, e),
            }
        }

        counter!("gateway_events_broadcast_total").increment(1);
        delivered
    }

    /// The cached hot event, if any.
    pub fn cached_event(&self) -> Option<SystemEvent> {
        self.cached_event
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Interest set of a socket, if it has subscribed.
    pub fn interests(&self, client_id: &ClientId) -> Option<HashSet<String>> {
        self.subscriptions.get(client_id).map(|s| s.clone())
    }

    /// Get the total number of connected clients.
    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    /// Number of sockets that have subscribed.
    pub fn subscription_count(&self) -> usize {
        self.subscriptions.len()
    }
}

impl Default for SubscriptionHub {
    fn default() -> Self {
        Self::new(DEFAULT_HOT_EVENT_TYPE)
    }
}

/// Consumer callback that hands every message parsing as a [`SystemEvent`] to `hub`.
///
/// Messages that are not events are logged and skipped; the batch still succeeds.
pub fn event_forwarder(hub: Arc<SubscriptionHub>) -> ConsumerCallback {
    Arc::new(move |topic: &str, messages: &[Value]| -> anyhow::Result<()> {
        for message in messages {
            match serde_json::from_value::<SystemEvent>(message.clone()) {
                Ok(event) => {
                    hub.publish(&event);
                }
                Err(e) => warn!("Dropping non-event message on {}: {}", topic, e),
            }
        }
        Ok(())
    })
}
