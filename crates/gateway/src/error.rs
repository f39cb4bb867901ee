//! Gateway error types.

use thiserror::Error;

/// Gateway error type.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Broker transport error.
    #[error("Broker error: {0}")]
    Broker(#[from] anyhow::Error),

    /// Payload compression error.
    #[error("Compression error: {0}")]
    Compression(#[from] broker_client::CompressionError),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Malformed subscription message.
    #[error("Invalid subscription: {0}")]
    InvalidSubscription(String),

    /// Topic callback failed while handling a batch.
    #[error("Callback error for topic {topic}: {message}")]
    Callback { topic: String, message: String },

    /// Invalid configuration value.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Channel send error.
    #[error("Channel send error")]
    ChannelSend,
}

impl From<tokio::sync::mpsc::error::TrySendError<axum::extract::ws::Message>> for GatewayError {
    fn from(_: tokio::sync::mpsc::error::TrySendError<axum::extract::ws::Message>) -> Self {
        GatewayError::ChannelSend
    }
}

/// Result type for gateway operations.
pub type Result<T> = std::result::Result<T, GatewayError>;
