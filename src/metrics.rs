//! Prometheus metrics recorder, installed once at startup so drops and
//! backpressure stay observable via metrics.

use axum::{http::StatusCode, response::IntoResponse};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

pub struct MetricsRecorder {
    handle: PrometheusHandle,
}

impl MetricsRecorder {
    pub fn new() -> Self {
        let handle = PrometheusBuilder::new()
            .install_recorder()
            .expect("failed to install Prometheus recorder");

        metrics::describe_counter!(
            "gateway_fanout_delivered_total",
            "Events successfully enqueued on a connection's send queue"
        );
        metrics::describe_counter!(
            "gateway_fanout_dropped_total",
            "Events dropped because a connection's send queue was full"
        );
        metrics::describe_gauge!(
            "gateway_connections_active",
            "Number of currently registered connections"
        );
        metrics::describe_gauge!(
            "gateway_upstream_subscriptions_active",
            "Number of topics with an active upstream pub/sub subscription"
        );
        metrics::describe_counter!(
            "gateway_drain_force_closed_total",
            "Connections force-closed at the end of a drain"
        );

        Self { handle }
    }

    pub fn handle(&self) -> &PrometheusHandle {
        &self.handle
    }
}

impl Default for MetricsRecorder {
    fn default() -> Self {
        Self::new()
    }
}

pub async fn metrics_handler(handle: axum::extract::State<PrometheusHandle>) -> impl IntoResponse {
    (StatusCode::OK, handle.render())
}
