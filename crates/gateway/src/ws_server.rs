//! WebSocket and HTTP surface using Axum.

use crate::consumer::BrokerConsumer;
use crate::error::{GatewayError, Result};
use crate::hub::{ClientState, SubscriptionHub, CLIENT_CHANNEL_BUFFER_SIZE};
use crate::producer::{BrokerProducer, ProducerMessage};
use axum::{
    extract::{
        ws::{Message, WebSocket},
        Path, State, WebSocketUpgrade,
    },
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use broker_client::CompressionKind;
use chrono::{DateTime, Utc};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::interval;
use tower_http::cors::CorsLayer;
use tracing::{debug, info, warn};

/// Shared application state.
pub struct AppState {
    pub hub: Arc<SubscriptionHub>,
    pub consumer: Arc<BrokerConsumer>,
    pub producer: Arc<BrokerProducer>,
}

/// Body of `POST /publish/{topic}`.
#[derive(Debug, Deserialize)]
pub struct PublishRequest {
    pub messages: Vec<ProducerMessage>,
    #[serde(default)]
    pub compression: Option<CompressionKind>,
}

/// Create the HTTP router.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .route("/publish/{topic}", post(publish_handler))
        .with_state(state)
        .layer(CorsLayer::permissive())
}

fn connection_health(
    status: &str,
    connected: bool,
    up_time: Option<DateTime<Utc>>,
    up_time_seconds: f64,
    history: Map<String, Value>,
) -> Value {
    json!({
        "status": status,
        "connected": connected,
        "upTime": up_time.map(|t| t.to_rfc3339()),
        "upTimeSeconds": up_time_seconds,
        "history": history,
    })
}

/// Health check handler.
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let consumer = &state.consumer;
    let producer = &state.producer;
    Json(json!({
        "consumer": connection_health(
            consumer.status().as_str(),
            consumer.connected(),
            consumer.up_time(),
            consumer.up_time_seconds(),
            consumer.status_history_as_object(),
        ),
        "producer": connection_health(
            producer.status().as_str(),
            producer.connected(),
            producer.up_time(),
            producer.up_time_seconds(),
            producer.status_history_as_object(),
        ),
        "clients": state.hub.client_count(),
        "subscriptions": state.hub.subscription_count(),
    }))
}

/// Hand messages to the producer. The response never reflects the broker outcome.
async fn publish_handler(
    State(state): State<Arc<AppState>>,
    Path(topic): Path<String>,
    Json(request): Json<PublishRequest>,
) -> impl IntoResponse {
    debug!("Publishing {} message(s) to {}", request.messages.len(), topic);
    if let Err(e) = state
        .producer
        .send(&topic, request.messages, request.compression)
        .await
    {
        warn!("Producer rejected messages for {}: {}", topic, e);
    }
    StatusCode::ACCEPTED
}

/// WebSocket upgrade handler.
async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

/// Handle a WebSocket connection.
async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let (mut ws_tx, mut ws_rx) = socket.split();

    // Bounded so a stalled socket cannot grow without limit
    let (tx, mut rx) = mpsc::channel::<Message>(CLIENT_CHANNEL_BUFFER_SIZE);

    let client = Arc::new(ClientState::new(tx));

    // Writer must be draining before the greeting is queued
    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if ws_tx.send(msg).await.is_err() {
                break;
            }
        }
    });

    let client_id = state.hub.register(client.clone());

    let mut ping_interval = interval(Duration::from_secs(30));
    ping_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    // The first tick completes immediately
    ping_interval.tick().await;

    loop {
        tokio::select! {
            biased;

            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(msg)) => {
                        if let Err(e) = handle_message(&state, &client, msg) {
                            warn!("Error handling message from {}: {}", client_id, e);
                        }
                    }
                    Some(Err(e)) => {
                        warn!("WebSocket error for {}: {:?}", client_id, e);
                        break;
                    }
                }
            }

            _ = ping_interval.tick() => {
                if client.tx.try_send(Message::Ping(Vec::new().into())).is_err() {
                    debug!("Ping to {} not queued", client_id);
                }
            }
        }
    }

    state.hub.unregister(&client_id);
    send_task.abort();

    info!("Client {} disconnected", client_id);
}

/// Handle a single WebSocket frame.
fn handle_message(state: &Arc<AppState>, client: &Arc<ClientState>, msg: Message) -> Result<()> {
    match msg {
        Message::Text(text) => state
            .hub
            .handle_subscription_message(&client.id, Some(text.as_str())),
        Message::Binary(data) => {
            let text = std::str::from_utf8(&data).map_err(|e| {
                GatewayError::InvalidSubscription(format!("binary frame is not UTF-8: {}", e))
            })?;
            state.hub.handle_subscription_message(&client.id, Some(text))
        }
        Message::Ping(data) => {
            client.update_ping();
            client.tx.try_send(Message::Pong(data))?;
            Ok(())
        }
        Message::Pong(_) => {
            client.update_ping();
            Ok(())
        }
        Message::Close(_) => Ok(()),
    }
}
