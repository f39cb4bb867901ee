//! Gateway service entry point.
//!
//! Bridges broker topics and WebSocket clients.

use anyhow::Result;
use broker_client::{
    ConsumerTransport, InMemoryBroker, NatsConsumerTransport, NatsProducerTransport,
    ProducerTransport,
};
use gateway::{
    create_router, event_forwarder, AppState, BrokerConsumer, BrokerProducer, ConsumerConfig,
    GatewayConfig, ProducerConfig, SubscriptionHub,
};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let config = GatewayConfig::from_env()?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Starting Gateway service");
    info!("Configuration:");
    info!("  BROKER_URL: {}", config.broker_url);
    info!("  CONSUMER_TOPICS: {}", config.consumer_topics.join(","));
    info!("  PRODUCER_TOPICS: {}", config.producer_topics.join(","));
    info!("  HOT_EVENT_TYPE: {}", config.hot_event_type);
    info!("  HTTP_PORT: {}", config.http_port);
    info!("  METRICS_PORT: {}", config.metrics_port);

    PrometheusBuilder::new()
        .with_http_listener(([0, 0, 0, 0], config.metrics_port))
        .install()?;
    info!("Prometheus metrics server started on port {}", config.metrics_port);

    let (consumer_transport, producer_transport) = build_transports(&config);

    let hub = Arc::new(SubscriptionHub::new(config.hot_event_type.clone()));
    let consumer = BrokerConsumer::new(
        consumer_transport,
        ConsumerConfig::new(config.consumer_topics.clone()).with_retry_delay(config.retry_delay),
    );
    let producer = BrokerProducer::new(
        producer_transport,
        ProducerConfig::new(config.producer_topics.clone()).with_retry_delay(config.retry_delay),
    );

    consumer.register_callback_for_topics(&config.consumer_topics, event_forwarder(hub.clone()));

    consumer.start().await;
    producer.start().await;

    let state = Arc::new(AppState {
        hub,
        consumer: consumer.clone(),
        producer: producer.clone(),
    });
    let app = create_router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.http_port));
    let listener = TcpListener::bind(addr).await?;
    info!("Gateway listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Shutting down broker connections...");
    consumer.stop().await;
    producer.stop().await;

    info!("Gateway stopped");
    Ok(())
}

fn build_transports(
    config: &GatewayConfig,
) -> (Arc<dyn ConsumerTransport>, Arc<dyn ProducerTransport>) {
    if config.uses_memory_broker() {
        info!("Using in-memory loopback broker");
        let broker = InMemoryBroker::with_max_batch_size(config.max_batch_size);
        return (Arc::new(broker.consumer()), Arc::new(broker.producer()));
    }

    let settings = config.broker_settings();
    let stream = config.stream_config();
    (
        Arc::new(NatsConsumerTransport::new(settings.clone(), stream.clone())),
        Arc::new(NatsProducerTransport::new(settings, stream)),
    )
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C"),
        _ = terminate => info!("Received terminate signal"),
    }
}
