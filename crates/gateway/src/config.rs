//! Gateway configuration read from the environment.

use crate::error::{GatewayError, Result};
use crate::hub::DEFAULT_HOT_EVENT_TYPE;
use broker_client::{BrokerSettings, StreamConfig};
use std::env;
use std::str::FromStr;
use std::time::Duration;

/// URL scheme selecting the in-process loopback broker.
pub const MEMORY_BROKER_SCHEME: &str = "memory://";

#[derive(Debug, Clone, PartialEq)]
pub struct GatewayConfig {
    pub broker_url: String,
    pub client_id: String,
    pub group_id: String,
    pub stream_name: String,
    pub consumer_topics: Vec<String>,
    pub producer_topics: Vec<String>,
    pub connection_timeout: Duration,
    pub max_wait: Duration,
    pub max_batch_size: usize,
    pub retry_delay: Duration,
    pub hot_event_type: String,
    pub http_port: u16,
    pub metrics_port: u16,
}

impl GatewayConfig {
    /// Read the configuration from the process environment (and `.env`, if present).
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build the configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let string = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());
        let millis = |key: &str, default: u64| -> Result<Duration> {
            parse_or(&lookup, key, default).map(Duration::from_millis)
        };

        Ok(Self {
            broker_url: string("BROKER_URL", "nats://localhost:4222"),
            client_id: string("BROKER_CLIENT_ID", "gateway"),
            group_id: string("BROKER_GROUP_ID", "gateway-group"),
            stream_name: string("BROKER_STREAM", "GATEWAY_EVENTS"),
            consumer_topics: split_topics(&string("CONSUMER_TOPICS", "system.event")),
            producer_topics: split_topics(&string("PRODUCER_TOPICS", "system.event,client.log")),
            connection_timeout: millis("BROKER_CONNECTION_TIMEOUT_MS", 1000)?,
            max_wait: millis("BROKER_MAX_WAIT_MS", 500)?,
            max_batch_size: parse_or(&lookup, "BROKER_MAX_BATCH_SIZE", 100)?,
            retry_delay: millis("BROKER_RETRY_DELAY_MS", 5000)?,
            hot_event_type: string("HOT_EVENT_TYPE", DEFAULT_HOT_EVENT_TYPE),
            http_port: parse_or(&lookup, "HTTP_PORT", 8082)?,
            metrics_port: parse_or(&lookup, "METRICS_PORT", 9093)?,
        })
    }

    /// True when `BROKER_URL` selects the loopback broker.
    pub fn uses_memory_broker(&self) -> bool {
        self.broker_url.starts_with(MEMORY_BROKER_SCHEME)
    }

    /// Every topic the gateway touches, consumer topics first, without duplicates.
    pub fn all_topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = Vec::new();
        for topic in self.consumer_topics.iter().chain(&self.producer_topics) {
            if !topics.contains(topic) {
                topics.push(topic.clone());
            }
        }
        topics
    }

    /// Stream shared by both transports; it captures producer-only topics too.
    pub fn stream_config(&self) -> StreamConfig {
        StreamConfig::for_topics(&self.stream_name, &self.all_topics())
    }

    pub fn broker_settings(&self) -> BrokerSettings {
        BrokerSettings {
            url: self.broker_url.clone(),
            client_id: self.client_id.clone(),
            group_id: self.group_id.clone(),
            connection_timeout: self.connection_timeout,
            max_wait: self.max_wait,
            max_batch_size: self.max_batch_size,
        }
    }
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| GatewayError::Config(format!("{} must be a number, got {:?}: {}", key, raw, e))),
        None => Ok(default),
    }
}

fn split_topics(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|topic| !topic.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = GatewayConfig::from_lookup(lookup_from(&[])).unwrap();
        assert_eq!(config.broker_url, "nats://localhost:4222");
        assert_eq!(config.consumer_topics, vec!["system.event"]);
        assert_eq!(config.producer_topics, vec!["system.event", "client.log"]);
        assert_eq!(config.retry_delay, Duration::from_millis(5000));
        assert_eq!(config.max_batch_size, 100);
        assert_eq!(config.hot_event_type, "soh-message");
        assert_eq!(config.http_port, 8082);
        assert!(!config.uses_memory_broker());
    }

    #[test]
    fn test_overrides_and_topic_lists() {
        let config = GatewayConfig::from_lookup(lookup_from(&[
            ("BROKER_URL", "memory://"),
            ("CONSUMER_TOPICS", " a, b ,,a "),
            ("PRODUCER_TOPICS", "b,c"),
            ("BROKER_RETRY_DELAY_MS", "250"),
        ]))
        .unwrap();

        assert!(config.uses_memory_broker());
        assert_eq!(config.consumer_topics, vec!["a", "b", "a"]);
        assert_eq!(config.all_topics(), vec!["a", "b", "c"]);
        assert_eq!(config.retry_delay, Duration::from_millis(250));
        assert_eq!(config.broker_settings().group_id, "gateway-group");
    }

    #[test]
    fn test_stream_captures_producer_only_topics() {
        let config = GatewayConfig::from_lookup(lookup_from(&[("BROKER_STREAM", "EVENTS")])).unwrap();
        let stream = config.stream_config();
        assert_eq!(stream.name, "EVENTS");
        assert_eq!(stream.subjects, vec!["system.event", "client.log"]);
    }

    #[test]
    fn test_invalid_number_is_a_config_error() {
        let err = GatewayConfig::from_lookup(lookup_from(&[("HTTP_PORT", "eighty")])).unwrap_err();
        assert!(matches!(err, GatewayError::Config(ref message) if message.contains("HTTP_PORT")));
    }
}
