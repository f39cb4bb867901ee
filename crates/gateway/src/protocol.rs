//! WebSocket protocol message types.
//!
//! Client → server: a JSON array of `{ "eventType": "<type>" }` replacing the
//! socket's interest set.
//! Server → client: JSON-serialized [`SystemEvent`] envelopes.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;

/// Type of the greeting sent to every socket right after the handshake.
pub const GATEWAY_CONNECTED_EVENT_TYPE: &str = "gateway-connected";

/// `specversion` stamped on events produced by the gateway itself.
pub const SYSTEM_EVENT_SPEC_VERSION: &str = "0.2";

/// Source stamped on events produced by the gateway itself.
pub const GATEWAY_EVENT_SOURCE: &str = "gateway";

/// Event envelope delivered from the broker to WebSocket subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemEvent {
    pub id: String,
    pub specversion: String,
    pub source: String,
    /// Dimension used for subscription matching.
    #[serde(rename = "type")]
    pub event_type: String,
    /// Opaque payload, forwarded verbatim.
    #[serde(default)]
    pub data: Value,
}

impl SystemEvent {
    /// An event originating from the gateway.
    pub fn new(event_type: impl Into<String>, data: Value) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            specversion: SYSTEM_EVENT_SPEC_VERSION.to_string(),
            source: GATEWAY_EVENT_SOURCE.to_string(),
            event_type: event_type.into(),
            data,
        }
    }

    /// Greeting sent on socket accept.
    pub fn gateway_connected() -> Self {
        Self::new(GATEWAY_CONNECTED_EVENT_TYPE, Value::Bool(true))
    }
}

/// One element of a client subscription frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemEventType {
    #[serde(rename = "eventType")]
    pub event_type: String,
}

/// True iff `value` is an object with an `eventType` key, whatever its value.
pub fn is_system_event_type(value: &Value) -> bool {
    value.get("eventType").is_some()
}

/// Parse a client subscription frame into the new interest set.
///
/// Returns `None` for a missing frame, invalid JSON, a non-array, or any
/// element failing [`is_system_event_type`]; the frame is then ignored as a whole.
/// Elements whose `eventType` is not a string can never match an event and
/// are left out of the set.
pub fn parse_subscription(message: Option<&str>) -> Option<HashSet<String>> {
    let elements: Vec<Value> = serde_json::from_str(message?).ok()?;
    if !elements.iter().all(is_system_event_type) {
        return None;
    }
    Some(
        elements
            .into_iter()
            .filter_map(|element| serde_json::from_value::<SystemEventType>(element).ok())
            .map(|t| t.event_type)
            .collect(),
    )
}
