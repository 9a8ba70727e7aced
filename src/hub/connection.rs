//! Connection: one live wire to a client.

use std::collections::HashSet;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::error::GatewayError;

/// Process-unique identity for a live connection.
pub type ConnectionId = u64;

fn next_connection_id() -> ConnectionId {
    static NEXT: AtomicU64 = AtomicU64::new(1);
    NEXT.fetch_add(1, Ordering::Relaxed)
}

/// Client platform, carried through from the `client_type` connection
/// parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientType {
    Web,
    Desktop,
    Mobile,
}

impl ClientType {
    pub fn parse(s: &str) -> Self {
        match s {
            "desktop" => Self::Desktop,
            "mobile" => Self::Mobile,
            _ => Self::Web,
        }
    }
}

/// A bounded, non-blocking outbound frame queue.
///
/// `try_send` never blocks: a full queue drops the frame for that one
/// connection rather than stalling fan-out to everyone else.
pub struct SendQueue {
    tx: Mutex<Option<mpsc::Sender<Value>>>,
}

impl SendQueue {
    fn new(capacity: usize) -> (Self, mpsc::Receiver<Value>) {
        let (tx, rx) = mpsc::channel(capacity);
        (
            Self {
                tx: Mutex::new(Some(tx)),
            },
            rx,
        )
    }

    /// Non-blocking enqueue. Returns `Ok(())` on success,
    /// `Err(GatewayError::Backpressure)` if the queue is full or already
    /// closed — callers treat both as a silent per-recipient drop.
    pub fn try_send(&self, frame: Value) -> Result<(), GatewayError> {
        let guard = self.tx.lock();
        match guard.as_ref() {
            Some(tx) => tx.try_send(frame).map_err(|_| GatewayError::Backpressure),
            None => Err(GatewayError::Backpressure),
        }
    }

    /// Idempotent close: drops the sender half so the writer task's
    /// `recv()` loop observes end-of-stream. Safe to call concurrently
    /// with `try_send` — after this, all sends fail harmlessly.
    pub fn close(&self) {
        self.tx.lock().take();
    }

    pub fn is_closed(&self) -> bool {
        self.tx.lock().is_none()
    }
}

/// One live wire to a client, and everything the hub needs to route
/// events to it and unwind its subscriptions on disconnect.
pub struct Connection {
    pub id: ConnectionId,
    pub user_id: String,
    pub session_id: String,
    pub client_type: ClientType,
    pub send_queue: SendQueue,
    /// Monotone counter of inbound frames received from this client —
    /// only ever increases.
    sequence: AtomicI64,
    last_heartbeat: Mutex<Instant>,
    channel_set: RwLock<HashSet<String>>,
    server_set: RwLock<HashSet<String>>,
}

impl Connection {
    /// Construct a new connection and the receiver half of its send queue.
    /// The receiver is handed to the writer task; the `Connection` itself
    /// is shared between the hub's subscription tables and the reader/
    /// writer tasks via `Arc`.
    pub fn new(
        user_id: String,
        session_id: String,
        client_type: ClientType,
        send_queue_capacity: usize,
    ) -> (Arc<Self>, mpsc::Receiver<Value>) {
        let (send_queue, rx) = SendQueue::new(send_queue_capacity);
        let conn = Arc::new(Self {
            id: next_connection_id(),
            user_id,
            session_id,
            client_type,
            send_queue,
            sequence: AtomicI64::new(0),
            last_heartbeat: Mutex::new(Instant::now()),
            channel_set: RwLock::new(HashSet::new()),
            server_set: RwLock::new(HashSet::new()),
        });
        (conn, rx)
    }

    /// Every inbound frame increments the sequence.
    pub fn next_sequence(&self) -> i64 {
        self.sequence.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn sequence(&self) -> i64 {
        self.sequence.load(Ordering::SeqCst)
    }

    pub fn touch_heartbeat(&self) {
        *self.last_heartbeat.lock() = Instant::now();
    }

    pub fn last_heartbeat(&self) -> Instant {
        *self.last_heartbeat.lock()
    }

    pub(crate) fn insert_channel(&self, id: &str) -> bool {
        self.channel_set.write().insert(id.to_string())
    }

    pub(crate) fn remove_channel(&self, id: &str) -> bool {
        self.channel_set.write().remove(id)
    }

    pub(crate) fn channels(&self) -> Vec<String> {
        self.channel_set.read().iter().cloned().collect()
    }

    pub(crate) fn insert_server(&self, id: &str) -> bool {
        self.server_set.write().insert(id.to_string())
    }

    pub(crate) fn remove_server(&self, id: &str) -> bool {
        self.server_set.write().remove(id)
    }

    pub(crate) fn servers(&self) -> Vec<String> {
        self.server_set.read().iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequence_strictly_increases() {
        let (conn, _rx) = Connection::new("u1".into(), "s1".into(), ClientType::Web, 8);
        assert_eq!(conn.next_sequence(), 1);
        assert_eq!(conn.next_sequence(), 2);
        assert_eq!(conn.next_sequence(), 3);
    }

    #[test]
    fn send_queue_drops_silently_when_full() {
        let (conn, _rx) = Connection::new("u1".into(), "s1".into(), ClientType::Web, 1);
        assert!(conn.send_queue.try_send(serde_json::json!(1)).is_ok());
        // Queue capacity 1, already holding one frame: next try_send fails.
        assert!(conn.send_queue.try_send(serde_json::json!(2)).is_err());
    }

    #[test]
    fn send_queue_close_is_idempotent() {
        let (conn, _rx) = Connection::new("u1".into(), "s1".into(), ClientType::Web, 4);
        conn.send_queue.close();
        conn.send_queue.close();
        assert!(conn.send_queue.is_closed());
        assert!(conn.send_queue.try_send(serde_json::json!(1)).is_err());
    }

    #[test]
    fn connection_ids_are_unique() {
        let (a, _) = Connection::new("u1".into(), "s1".into(), ClientType::Web, 4);
        let (b, _) = Connection::new("u1".into(), "s2".into(), ClientType::Web, 4);
        assert_ne!(a.id, b.id);
    }
}
