//! Assembles the axum application from its constituent services as
//! process-wide singletons with explicit initialization at startup,
//! factored out of `main` so integration tests can spin up the exact same
//! router against a local port instead of reimplementing the wiring.

use std::sync::Arc;

use axum::{extract::FromRef, routing::get, Router};
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::sync::mpsc;

use crate::actor::ActorContext;
use crate::auth::TokenValidator;
use crate::config::GatewayConfig;
use crate::distributed::pubsub::{InMemoryBus, InMemoryPubSub, PubSubBackend};
use crate::distributed::DistributedHub;
use crate::drain::DrainManager;
use crate::health;
use crate::hub::LocalHub;
use crate::metrics::{self};
use crate::session::SessionStore;
use crate::ws;

#[derive(Clone, FromRef)]
pub struct AppState {
    pub actor_ctx: Arc<ActorContext>,
    pub drain: Arc<DrainManager>,
    pub metrics_handle: PrometheusHandle,
}

/// The assembled router plus the handles a caller needs beyond serving
/// HTTP: the hub, to publish domain events onto, and the drain manager, to
/// trigger graceful shutdown.
pub struct App {
    pub router: Router,
    pub hub: Arc<DistributedHub>,
    pub drain: Arc<DrainManager>,
}

/// Build the full application on top of a caller-supplied `PubSubBackend`.
/// `main` uses this directly with a `NatsPubSub` or `InMemoryPubSub`
/// depending on `config.nats_url`.
pub fn build(
    config: GatewayConfig,
    validator: Arc<dyn TokenValidator>,
    backend: Arc<dyn PubSubBackend>,
    inbound_rx: mpsc::UnboundedReceiver<(String, Vec<u8>)>,
    metrics_handle: PrometheusHandle,
) -> App {
    let local_hub = Arc::new(LocalHub::new());
    let hub = DistributedHub::new(local_hub.clone(), backend);
    hub.spawn_inbound_pump(inbound_rx);

    let drain = Arc::new(DrainManager::with_timeouts(config.grace_period, config.drain_timeout));
    drain.attach_hub(local_hub);

    let sessions = SessionStore::new(config.session_timeout);
    let actor_ctx = Arc::new(ActorContext {
        hub: hub.clone(),
        sessions,
        validator,
        config: config.clone(),
    });

    let app_state = AppState {
        actor_ctx,
        drain: drain.clone(),
        metrics_handle,
    };

    let metrics_router = if config.enable_metrics {
        Router::new().route("/metrics", get(metrics::metrics_handler))
    } else {
        Router::new()
    };

    let router = Router::new()
        .route("/health", get(health::health))
        .route("/health/live", get(health::liveness))
        .route("/health/ready", get(health::readiness))
        .route("/ws", get(ws::upgrade))
        .merge(metrics_router)
        .with_state(app_state);

    App { router, hub, drain }
}

/// Convenience wrapper for single-instance deployments and tests: backs the
/// distributed hub with an in-memory pub/sub instead of a real fabric.
pub fn build_in_memory(
    config: GatewayConfig,
    validator: Arc<dyn TokenValidator>,
    metrics_handle: PrometheusHandle,
) -> App {
    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
    let backend: Arc<dyn PubSubBackend> = Arc::new(InMemoryPubSub::new(InMemoryBus::new(), inbound_tx));
    build(config, validator, backend, inbound_rx, metrics_handle)
}
