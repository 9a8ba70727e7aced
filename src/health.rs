//! Liveness/readiness probes. Readiness reports unhealthy once the drain
//! manager transitions out of `healthy`.

use axum::{extract::State, http::StatusCode, Json};
use serde::Serialize;
use std::sync::Arc;

use crate::drain::{DrainManager, DrainState};

#[derive(Debug, Serialize)]
pub struct ReadinessResponse {
    ready: bool,
    drain_state: &'static str,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    status: &'static str,
    drain_state: &'static str,
    version: &'static str,
}

pub async fn liveness() -> (StatusCode, &'static str) {
    (StatusCode::OK, "OK")
}

/// Readiness probe: reports unhealthy once draining has started, so the
/// load balancer stops routing new connections here.
pub async fn readiness(
    State(drain): State<Arc<DrainManager>>,
) -> (StatusCode, Json<ReadinessResponse>) {
    let state = drain.state();
    let ready = state == DrainState::Healthy;
    let status = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        status,
        Json(ReadinessResponse {
            ready,
            drain_state: state.as_str(),
        }),
    )
}

pub async fn health(State(drain): State<Arc<DrainManager>>) -> (StatusCode, Json<HealthResponse>) {
    let state = drain.state();
    let healthy = state != DrainState::Closed;
    let status = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        status,
        Json(HealthResponse {
            status: if healthy { "healthy" } else { "unhealthy" },
            drain_state: state.as_str(),
            version: env!("CARGO_PKG_VERSION"),
        }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn liveness_always_ok() {
        let (status, body) = liveness().await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "OK");
    }

    #[tokio::test]
    async fn readiness_reflects_drain_state() {
        let drain = Arc::new(DrainManager::new());
        let (status, Json(resp)) = readiness(State(drain.clone())).await;
        assert_eq!(status, StatusCode::OK);
        assert!(resp.ready);

        drain.start_drain(Default::default()).await;
        let (status, Json(resp)) = readiness(State(drain)).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert!(!resp.ready);
    }
}
