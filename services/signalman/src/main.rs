// signalman: Tenant-isolated real-time event fan-out hub.
//
// Ingests platform events from the topic bus, classifies them to channels,
// and multicasts to subscribed WebSocket sessions with tenant isolation.

use signalman::consumer::{self, ConsumerConfig, HubEventHandler};
use signalman::dlq::{DlqAdapter, KafkaDlqPublisher};
use signalman::hub::Hub;
use signalman::session::{router, ServiceTokenVerifier, SessionState};
use std::sync::Arc;
use tracing::{error, info};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "signalman starting");

    let cfg = match signalman::config::load_config() {
        Ok(cfg) => {
            info!(bind = %cfg.bind, brokers = %cfg.kafka.brokers, "config loaded");
            cfg
        }
        Err(e) => {
            eprintln!("FATAL: failed to load config: {}", e);
            std::process::exit(1);
        }
    };

    let hub = Hub::start();

    // Consumer glue with dead-lettering.
    let publisher = match KafkaDlqPublisher::new(&cfg.kafka.brokers, cfg.kafka.dlq_topic.clone()) {
        Ok(p) => p,
        Err(e) => {
            eprintln!("FATAL: cannot create DLQ producer: {}", e);
            std::process::exit(1);
        }
    };
    let handler = DlqAdapter::new(
        HubEventHandler::new(hub.clone()),
        publisher,
        format!("signalman/{}", cfg.kafka.group_id),
    );
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let consumer_cfg = ConsumerConfig {
        brokers: cfg.kafka.brokers.clone(),
        group_id: cfg.kafka.group_id.clone(),
        topics: cfg.kafka.topics.clone(),
    };
    let consumer_task = tokio::spawn(async move {
        if let Err(e) = consumer::run_consumer(consumer_cfg, handler, shutdown_rx).await {
            error!(error = %e, "consumer exited");
        }
    });

    // Client WebSocket surface.
    let state = SessionState {
        hub,
        verifier: Arc::new(ServiceTokenVerifier::new(cfg.service_token.clone())),
    };
    let listener = match tokio::net::TcpListener::bind(&cfg.bind).await {
        Ok(l) => l,
        Err(e) => {
            eprintln!("FATAL: cannot bind on {}: {}", cfg.bind, e);
            std::process::exit(1);
        }
    };
    info!(bind = %cfg.bind, "hub listening");
    let server = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, router(state)).await {
            error!(error = %e, "hub server exited");
        }
    });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("shutdown signal received"),
        _ = consumer_task => error!("consumer task ended"),
        _ = server => error!("server task ended"),
    }
    let _ = shutdown_tx.send(true);
}
