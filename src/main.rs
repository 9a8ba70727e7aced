use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::mpsc;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use fanout_gateway::app;
use fanout_gateway::auth::{JwtValidator, TokenValidator};
use fanout_gateway::config::GatewayConfig;
use fanout_gateway::distributed::pubsub::{InMemoryBus, InMemoryPubSub, NatsPubSub, PubSubBackend};
use fanout_gateway::drain::{DrainManager, DrainOptions};
use fanout_gateway::metrics::MetricsRecorder;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let log_level = std::env::var("RUST_LOG").unwrap_or_else(|_| {
        #[cfg(debug_assertions)]
        {
            "debug".to_string()
        }
        #[cfg(not(debug_assertions))]
        {
            "warn".to_string()
        }
    });

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(&log_level))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("starting fan-out gateway");

    let config = GatewayConfig::from_env();
    info!(
        port = config.server_port,
        distributed = config.nats_url.is_some(),
        metrics_enabled = config.enable_metrics,
        "configuration loaded"
    );

    let metrics_recorder = MetricsRecorder::new();
    let metrics_handle = metrics_recorder.handle().clone();

    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
    let backend: Arc<dyn PubSubBackend> = match &config.nats_url {
        Some(url) => Arc::new(NatsPubSub::connect(url, inbound_tx).await?),
        None => {
            warn!("NATS_URL not set, running single-instance with an in-memory pub/sub backend");
            Arc::new(InMemoryPubSub::new(InMemoryBus::new(), inbound_tx))
        }
    };

    let jwt_secret = std::env::var("JWT_SECRET")
        .expect("JWT_SECRET must be set: the gateway cannot validate Identify/Resume credentials without it");
    let validator: Arc<dyn TokenValidator> = Arc::new(JwtValidator::new(&jwt_secret));

    let server_port = config.server_port;
    let app::App { router, drain, .. } = app::build(config, validator, backend, inbound_rx, metrics_handle);
    let router = router.layer(TraceLayer::new_for_http());

    let addr = SocketAddr::from(([0, 0, 0, 0], server_port));
    info!(%addr, "gateway listening");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal(drain))
        .await?;

    Ok(())
}

/// Waits for SIGINT/ctrl-c, then runs the drain protocol to completion
/// before letting `axum::serve` finish — clients get a RECONNECT and a
/// grace period instead of their sockets dropping mid-request.
async fn shutdown_signal(drain: Arc<DrainManager>) {
    tokio::signal::ctrl_c()
        .await
        .expect("failed to install ctrl-c handler");
    info!("shutdown signal received, draining connections");
    drain.start_drain(DrainOptions::default()).await;
    drain.wait_closed().await;
}
