//! WebSocket upgrade entry point: upgrade, then spawn the connection actor.

use std::sync::Arc;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::response::Response;

use crate::actor::{self, ActorContext, ConnectParams};

pub async fn upgrade(
    ws: WebSocketUpgrade,
    Query(mut params): Query<ConnectParams>,
    headers: HeaderMap,
    State(ctx): State<Arc<ActorContext>>,
) -> Response {
    if params.token.is_none() {
        params.token = bearer_token(&headers);
    }
    ws.on_upgrade(move |socket| async move {
        actor::run(socket, ctx, params).await;
    })
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get(axum::http::header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::to_string)
}
