//! Chat Delivery Gateway - Entry Point
//!
//! Loads configuration, wires the delivery core and accepts connections.

use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use chat_gateway::{AppError, Broker, Gateway, GatewayConfig, InMemoryStore, MemoryBroker, Stores};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging with environment filter
    // Use RUST_LOG env var to control log level
    // e.g., RUST_LOG=debug or RUST_LOG=chat_gateway=trace
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("chat_gateway=info")),
        )
        .init();

    let config = GatewayConfig::load();

    let store = match &config.seed_file {
        Some(path) => InMemoryStore::from_seed_file(path)?,
        None => InMemoryStore::new(),
    };
    let stores = Stores::shared(Arc::new(store));
    let broker = connect_broker(&config).await?;
    info!("Using {} broker", broker.name());

    let gateway = Gateway::start(&config, stores, broker).await?;

    // Start TCP listener
    let listener = TcpListener::bind(&config.addr).await?;
    info!("Chat gateway listening on {}", config.addr);

    gateway.serve(listener).await;
    Ok(())
}

#[cfg(feature = "redis")]
async fn connect_broker(config: &GatewayConfig) -> Result<Arc<dyn Broker>, AppError> {
    match &config.broker_url {
        Some(url) => Ok(Arc::new(chat_gateway::RedisBroker::connect(url).await?)),
        None => {
            warn!("BROKER_URL not set, fan-out limited to this process");
            Ok(Arc::new(MemoryBroker::new()))
        }
    }
}

#[cfg(not(feature = "redis"))]
async fn connect_broker(config: &GatewayConfig) -> Result<Arc<dyn Broker>, AppError> {
    if config.broker_url.is_some() {
        warn!("BROKER_URL ignored: built without the `redis` feature");
    }
    Ok(Arc::new(MemoryBroker::new()))
}
