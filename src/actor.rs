//! Connection Actor: owns one WebSocket for its whole lifetime — handshake,
//! then three concurrent loops (write, heartbeat, read) raced the same way
//! `handle_socket` races its send/recv/heartbeat tasks with `tokio::select!`
//! and aborts whichever didn't finish first.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

use crate::auth::TokenValidator;
use crate::config::GatewayConfig;
use crate::distributed::DistributedHub;
use crate::error::GatewayError;
use crate::hub::{ClientType, Connection};
use crate::session::{Session, SessionStore};
use crate::wire::{
    CloseCode, Envelope, HeartbeatData, IdentifyData, Opcode, QueuedFrame, ResumeData,
    SubscribePayload,
};

/// Credential and connect-time hints lifted from the WS upgrade request's
/// query string (or the `Authorization` header, for `token`), ahead of any
/// frame arriving on the socket.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConnectParams {
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub client_type: Option<String>,
    #[serde(default)]
    pub resume: Option<String>,
}

/// Everything a connection actor needs, shared across every connection it
/// ever serves.
pub struct ActorContext {
    pub hub: Arc<DistributedHub>,
    pub sessions: SessionStore,
    pub validator: Arc<dyn TokenValidator>,
    pub config: GatewayConfig,
}

type WsSink = Arc<Mutex<SplitSink<WebSocket, Message>>>;

/// Drive one WebSocket end-to-end. Never panics on a misbehaving client —
/// protocol violations close the socket, they don't bring down the task
/// pool.
pub async fn run(socket: WebSocket, ctx: Arc<ActorContext>, params: ConnectParams) {
    let (sink, mut stream) = socket.split();
    let sink: WsSink = Arc::new(Mutex::new(sink));

    if send_frame(&sink, Envelope::hello(ctx.config.heartbeat_interval.as_millis() as u64))
        .await
        .is_err()
    {
        return;
    }

    let handshake = match params.token.clone() {
        Some(token) => handshake_from_params(&sink, &ctx, &params, token).await,
        None => await_handshake(&mut stream, &sink, &ctx).await,
    };
    let Handshake { connection, session, outbound_rx, resumed } = match handshake {
        Some(h) => h,
        None => return,
    };

    ctx.hub.local().register(connection.clone());
    info!(connection_id = connection.id, user_id = %connection.user_id, resumed, "connection ready");

    let ready = if resumed {
        replay_envelope(&session, connection.sequence()).await
    } else {
        Envelope::dispatch_str(connection.sequence(), "READY", serde_json::json!({
            "v": 10,
            "session_id": session.session_id,
            "resume_key": session.resume_key,
            "user": { "id": connection.user_id },
        }))
    };
    if send_frame(&sink, ready).await.is_err() {
        ctx.hub.unregister(&connection).await;
        return;
    }

    let mut write_task = {
        let sink = sink.clone();
        let connection = connection.clone();
        let session = session.clone();
        let write_wait = ctx.config.write_wait;
        tokio::spawn(async move { writer_loop(sink, outbound_rx, connection, session, write_wait).await })
    };

    let mut heartbeat_task = {
        let sink = sink.clone();
        let connection = connection.clone();
        let pong_wait = ctx.config.pong_wait;
        tokio::spawn(async move { heartbeat_loop(sink, connection, pong_wait).await })
    };

    let mut read_task = {
        let connection = connection.clone();
        let hub = ctx.hub.clone();
        tokio::spawn(async move { reader_loop(stream, connection, hub).await })
    };

    tokio::select! {
        _ = &mut write_task => {
            heartbeat_task.abort();
            read_task.abort();
        }
        _ = &mut heartbeat_task => {
            write_task.abort();
            read_task.abort();
        }
        _ = &mut read_task => {
            write_task.abort();
            heartbeat_task.abort();
        }
    }

    ctx.hub.unregister(&connection).await;
    info!(connection_id = connection.id, "connection closed");
}

struct Handshake {
    connection: Arc<Connection>,
    session: Arc<Session>,
    outbound_rx: mpsc::Receiver<serde_json::Value>,
    resumed: bool,
}

/// Wait for the client's first frame — must be Identify or Resume — within
/// `pong_wait`. Anything else, or silence, is a protocol violation that
/// closes the socket before a `Connection` ever exists.
async fn await_handshake(
    stream: &mut SplitStream<WebSocket>,
    sink: &WsSink,
    ctx: &Arc<ActorContext>,
) -> Option<Handshake> {
    let first = tokio::time::timeout(ctx.config.pong_wait, stream.next()).await;
    let envelope = match first {
        Ok(Some(Ok(Message::Text(text)))) => serde_json::from_str::<Envelope>(&text).ok(),
        Ok(Some(Ok(Message::Close(_)))) | Ok(None) => None,
        _ => None,
    };

    let Some(envelope) = envelope else {
        close_with(sink, CloseCode::InvalidSession).await;
        return None;
    };

    match envelope.op {
        Opcode::Identify => handle_identify(envelope, sink, ctx).await,
        Opcode::Resume => handle_resume(envelope, sink, ctx).await,
        _ => {
            close_with(sink, CloseCode::InvalidSession).await;
            None
        }
    }
}

/// Credential extraction from the WS upgrade's query string/header, ahead
/// of waiting on a frame at all. Synthesizes the same Identify/Resume
/// payload shape the opcode-driven path parses, so both entry points share
/// one handshake implementation.
async fn handshake_from_params(
    sink: &WsSink,
    ctx: &Arc<ActorContext>,
    params: &ConnectParams,
    token: String,
) -> Option<Handshake> {
    if let Some(resume_key) = params.resume.clone() {
        let envelope = Envelope {
            op: Opcode::Resume,
            t: None,
            s: None,
            d: Some(serde_json::json!({ "token": token, "resume_key": resume_key })),
        };
        handle_resume(envelope, sink, ctx).await
    } else {
        let envelope = Envelope {
            op: Opcode::Identify,
            t: None,
            s: None,
            d: Some(serde_json::json!({ "token": token, "client_type": params.client_type })),
        };
        handle_identify(envelope, sink, ctx).await
    }
}

async fn handle_identify(envelope: Envelope, sink: &WsSink, ctx: &Arc<ActorContext>) -> Option<Handshake> {
    let data: IdentifyData = match envelope.d.and_then(|d| serde_json::from_value(d).ok()) {
        Some(d) => d,
        None => {
            close_with(sink, CloseCode::AuthenticationFailed).await;
            return None;
        }
    };

    let claims = match ctx.validator.validate(&data.token) {
        Ok(c) => c,
        Err(e) => {
            warn!(error = %e, "identify failed token validation");
            close_with(sink, CloseCode::AuthenticationFailed).await;
            return None;
        }
    };

    let client_type = data.client_type.as_deref().map(ClientType::parse).unwrap_or(ClientType::Web);
    let session = Arc::new(Session::new(claims.sub.clone(), ctx.config.resume_buffer_size));
    ctx.sessions.insert(session.clone());

    let (connection, outbound_rx) = Connection::new(
        claims.sub,
        session.session_id.clone(),
        client_type,
        ctx.config.send_queue_capacity,
    );
    connection.next_sequence(); // the Identify frame itself counts as frame #1

    Some(Handshake { connection, session, outbound_rx, resumed: false })
}

async fn handle_resume(envelope: Envelope, sink: &WsSink, ctx: &Arc<ActorContext>) -> Option<Handshake> {
    let data: ResumeData = match envelope.d.and_then(|d| serde_json::from_value(d).ok()) {
        Some(d) => d,
        None => {
            close_with(sink, CloseCode::InvalidSession).await;
            return None;
        }
    };

    if ctx.validator.validate(&data.token).is_err() {
        close_with(sink, CloseCode::AuthenticationFailed).await;
        return None;
    }

    let session = match ctx.sessions.try_resume(&data.resume_key) {
        Ok(session) => session,
        Err(err) => {
            let code = err.close_code().unwrap_or(CloseCode::InvalidSession);
            let _ = send_frame(sink, Envelope::invalid_session(false)).await;
            close_with(sink, code).await;
            return None;
        }
    };
    session.touch_heartbeat();

    let (connection, outbound_rx) = Connection::new(
        session.user_id.clone(),
        session.session_id.clone(),
        ClientType::Web,
        ctx.config.send_queue_capacity,
    );
    connection.next_sequence(); // the Resume frame itself counts as frame #1

    Some(Handshake { connection, session, outbound_rx, resumed: true })
}

async fn replay_envelope(session: &Session, seq: i64) -> Envelope {
    let frames = session.buffered_frames().await;
    Envelope::dispatch_str(seq, "RESUMED", serde_json::json!({ "replayed": frames }))
}

/// Writes frames in delivery order, stamping outbound dispatch events with
/// the connection's current sequence value and recording each write for
/// resume replay. Also honors `QueuedFrame::Close`, writing the real
/// transport close frame for a forced disconnect (the reader/heartbeat
/// loops can't do this themselves since they don't own the sink).
async fn writer_loop(
    sink: WsSink,
    mut outbound_rx: mpsc::Receiver<serde_json::Value>,
    connection: Arc<Connection>,
    session: Arc<Session>,
    write_wait: Duration,
) {
    while let Some(raw) = outbound_rx.recv().await {
        let Some(frame) = QueuedFrame::from_json(raw) else {
            warn!(connection_id = connection.id, "dropping malformed queued frame");
            continue;
        };
        let envelope = match frame {
            QueuedFrame::Control(envelope) => envelope,
            QueuedFrame::Event(event) => {
                let seq = connection.sequence();
                Envelope::dispatch_str(seq, &event.t, event.d)
            }
            QueuedFrame::Close(signal) => {
                let frame = CloseFrame { code: signal.code, reason: signal.reason.into() };
                let _ = sink.lock().await.send(Message::Close(Some(frame))).await;
                break;
            }
        };
        let json = envelope.to_json();
        session.record_outbound(json.clone()).await;

        let send = send_frame(&sink, envelope);
        if tokio::time::timeout(write_wait, send).await.is_err() {
            warn!(connection_id = connection.id, "write deadline exceeded, closing");
            break;
        }
    }
}

/// Sends transport-level WS pings to keep intermediaries alive, and closes
/// the connection if the client hasn't sent anything (heartbeat or
/// otherwise) within `pong_wait`.
async fn heartbeat_loop(sink: WsSink, connection: Arc<Connection>, pong_wait: Duration) {
    let ping_interval = pong_wait.mul_f64(0.9);
    let mut ticker = tokio::time::interval(ping_interval);
    ticker.tick().await; // first tick fires immediately; skip it

    loop {
        ticker.tick().await;
        if connection.last_heartbeat().elapsed() > pong_wait {
            warn!(connection_id = connection.id, "heartbeat timeout, closing");
            close_with(&sink, CloseCode::SessionTimedOut).await;
            return;
        }
        let mut guard = sink.lock().await;
        if guard.send(Message::Ping(Vec::new().into())).await.is_err() {
            return;
        }
    }
}

/// Reads client frames and dispatches heartbeats and subscribe/unsubscribe
/// commands. Protocol violations are logged and the loop continues — only
/// a transport error or Close frame ends it.
async fn reader_loop(
    mut stream: SplitStream<WebSocket>,
    connection: Arc<Connection>,
    hub: Arc<DistributedHub>,
) {
    while let Some(msg) = stream.next().await {
        let msg = match msg {
            Ok(m) => m,
            Err(_) => break,
        };
        match msg {
            Message::Close(_) => break,
            Message::Text(text) => {
                let Ok(envelope) = serde_json::from_str::<Envelope>(&text) else {
                    debug!(connection_id = connection.id, "ignoring frame that isn't a valid envelope");
                    continue;
                };
                connection.next_sequence();
                handle_inbound(envelope, &connection, &hub).await;
            }
            _ => {}
        }
    }
}

/// `Ready`-state opcode handling: `HEARTBEAT` always accepted;
/// `DISPATCH` subtypes `SUBSCRIBE`/`UNSUBSCRIBE` mutate topic membership;
/// `PRESENCE_UPDATE`/`VOICE_STATE_UPDATE`/`REQUEST_GUILD_MEMBERS` are
/// pass-through to collaborators the gateway core doesn't own, so they're
/// only acknowledged by touching the heartbeat here. Anything else gets an
/// error event while the connection stays open.
async fn handle_inbound(
    envelope: Envelope,
    connection: &Arc<Connection>,
    hub: &Arc<DistributedHub>,
) {
    connection.touch_heartbeat();
    match envelope.op {
        Opcode::Heartbeat => {
            let _: HeartbeatData = envelope.d.and_then(|d| serde_json::from_value(d).ok()).unwrap_or_default();
            let _ = connection.send_queue.try_send(Envelope::heartbeat_ack().to_json());
        }
        Opcode::Dispatch => match envelope.t.as_deref() {
            Some("SUBSCRIBE") => handle_subscribe(envelope.d, connection, hub, true).await,
            Some("UNSUBSCRIBE") => handle_subscribe(envelope.d, connection, hub, false).await,
            other => {
                debug!(connection_id = connection.id, t = ?other, "unknown dispatch subtype");
                let _ = connection.send_queue.try_send(Envelope::error("unknown dispatch subtype").to_json());
            }
        },
        Opcode::PresenceUpdate | Opcode::VoiceStateUpdate | Opcode::RequestGuildMembers => {
            debug!(connection_id = connection.id, op = ?envelope.op, "pass-through opcode received, no local collaborator wired");
        }
        other => {
            debug!(connection_id = connection.id, op = ?other, "unexpected opcode for Ready state");
            let _ = connection.send_queue.try_send(Envelope::error("unexpected opcode").to_json());
        }
    }
}

async fn handle_subscribe(
    payload: Option<serde_json::Value>,
    connection: &Arc<Connection>,
    hub: &Arc<DistributedHub>,
    subscribe: bool,
) {
    let Some(data) = payload.and_then(|d| serde_json::from_value::<SubscribePayload>(d).ok()) else {
        debug!(connection_id = connection.id, "dropping subscribe/unsubscribe with invalid payload");
        return;
    };

    match (data.channel_id, data.server_id) {
        (Some(channel_id), _) if subscribe => hub.subscribe_channel(connection, &channel_id).await,
        (Some(channel_id), _) => hub.unsubscribe_channel(connection, &channel_id).await,
        (None, Some(server_id)) if subscribe => hub.subscribe_server(connection, &server_id).await,
        (None, Some(server_id)) => hub.unsubscribe_server(connection, &server_id).await,
        (None, None) => {
            debug!(connection_id = connection.id, "subscribe/unsubscribe with neither channel_id nor server_id, ignored");
        }
    }
}

async fn send_frame(sink: &WsSink, envelope: Envelope) -> Result<(), GatewayError> {
    let text = serde_json::to_string(&envelope).map_err(|e| GatewayError::Protocol(e.to_string()))?;
    sink.lock()
        .await
        .send(Message::Text(text.into()))
        .await
        .map_err(|e| GatewayError::Transport(e.to_string()))
}

async fn close_with(sink: &WsSink, code: CloseCode) {
    let frame = CloseFrame {
        code: code.code(),
        reason: code.reason().into(),
    };
    let _ = sink.lock().await.send(Message::Close(Some(frame))).await;
}

