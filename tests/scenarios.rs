//! End-to-end scenario tests that cross the hub/connection/drain module
//! boundary and so don't fit naturally inside any one module's
//! `#[cfg(test)]` block — state-machine tests stay in-module, but anything
//! that needs a real socket gets a standalone integration file.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use fanout_gateway::app::{self, App};
use fanout_gateway::auth::{Claims, JwtValidator, TokenValidator};
use fanout_gateway::config::GatewayConfig;
use futures::{SinkExt, StreamExt};
use jsonwebtoken::{encode, EncodingKey, Header};
use metrics_exporter_prometheus::PrometheusBuilder;
use serde_json::{json, Value};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message as WsMessage;

const SECRET: &str = "integration-test-secret";

fn sign(sub: &str) -> String {
    let claims = Claims {
        sub: sub.to_string(),
        session: None,
        token_type: "access".to_string(),
        exp: chrono::Utc::now().timestamp() + 3600,
    };
    encode(&Header::new(jsonwebtoken::Algorithm::HS256), &claims, &EncodingKey::from_secret(SECRET.as_bytes())).unwrap()
}

async fn spawn_server(config: GatewayConfig) -> (SocketAddr, App) {
    let validator: Arc<dyn TokenValidator> = Arc::new(JwtValidator::new(SECRET));
    // Build a handle without installing it as the process-global recorder —
    // each test in this file would otherwise race to install a second one.
    let recorder = PrometheusBuilder::new().build_recorder();
    let metrics_handle = recorder.handle();
    let app = app::build_in_memory(config, validator, metrics_handle);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let router = app.router.clone();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    (addr, app)
}

async fn recv_json(
    stream: &mut tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>,
) -> Value {
    loop {
        match tokio::time::timeout(Duration::from_secs(2), stream.next())
            .await
            .expect("timed out waiting for a frame")
            .expect("stream ended")
            .unwrap()
        {
            WsMessage::Text(text) => return serde_json::from_str(&text).unwrap(),
            WsMessage::Ping(_) | WsMessage::Pong(_) => continue,
            other => panic!("unexpected frame: {other:?}"),
        }
    }
}

#[tokio::test]
async fn immediate_post_identify_dispatch() {
    let (addr, app) = spawn_server(GatewayConfig::default()).await;
    let url = format!("ws://{addr}/ws");
    let (mut ws, _) = connect_async(&url).await.unwrap();

    let hello = recv_json(&mut ws).await;
    assert_eq!(hello["op"], 10);

    ws.send(WsMessage::Text(
        json!({"op": 2, "d": {"token": sign("user-1")}}).to_string().into(),
    ))
    .await
    .unwrap();
    let ready = recv_json(&mut ws).await;
    assert_eq!(ready["t"], "READY");
    assert_eq!(ready["s"], 1);
    assert_eq!(ready["d"]["v"], 10);
    assert_eq!(ready["d"]["user"]["id"], "user-1");

    ws.send(WsMessage::Text(
        json!({"op": 0, "t": "SUBSCRIBE", "d": {"channel_id": "chan-k"}}).to_string().into(),
    ))
    .await
    .unwrap();

    // Give the reader task a moment to apply the subscription before we
    // publish, since the subscribe frame and the publish race otherwise.
    tokio::time::sleep(Duration::from_millis(50)).await;

    app.hub
        .send_to_channel("chan-k", json!({"t": "MESSAGE_CREATE", "d": {"id": "m1"}}))
        .await;

    let dispatch = recv_json(&mut ws).await;
    assert_eq!(dispatch["op"], 0);
    assert_eq!(dispatch["t"], "MESSAGE_CREATE");
    assert_eq!(dispatch["d"]["id"], "m1");
}

#[tokio::test]
async fn drain_broadcasts_reconnect_and_closes_clients() {
    let config = GatewayConfig {
        grace_period: Duration::from_millis(50),
        drain_timeout: Duration::from_secs(5),
        ..GatewayConfig::default()
    };
    let (addr, app) = spawn_server(config).await;
    let url = format!("ws://{addr}/ws");

    let (mut ws, _) = connect_async(&url).await.unwrap();
    let _hello = recv_json(&mut ws).await;
    ws.send(WsMessage::Text(
        json!({"op": 2, "d": {"token": sign("user-1")}}).to_string().into(),
    ))
    .await
    .unwrap();
    let _ready = recv_json(&mut ws).await;

    app.drain.start_drain(Default::default()).await;

    let reconnect = recv_json(&mut ws).await;
    assert_eq!(reconnect["op"], 7);

    // The client closes promptly on its own; the drain manager should reach
    // `closed` well within the grace period's slack.
    let _ = ws.close(None).await;
    tokio::time::timeout(Duration::from_secs(2), app.drain.wait_closed())
        .await
        .expect("drain did not complete in time");
}
