//! Drain manager: orchestrates graceful shutdown.
//!
//! The state machine is monotone — `Healthy -> Draining -> Closed`, never
//! backward — and `start_drain` is idempotent under concurrent callers: the
//! first caller runs the drain protocol, everyone else observes the same
//! outcome. The public entry point returns as soon as the state has flipped
//! to `Draining`; the grace period, straggler poll, and force-close deadline
//! run in a spawned background task, mirroring the delayed-cleanup task
//! `UpstreamManager::unsubscribe` spawns after a subscription's refcount
//! hits zero.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::error::GatewayError;
use crate::hub::LocalHub;
use crate::wire::{CloseCode, CloseSignal, Envelope, QueuedFrame};

const POLL_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DrainState {
    Healthy = 0,
    Draining = 1,
    Closed = 2,
}

impl DrainState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Draining => "draining",
            Self::Closed => "closed",
        }
    }

    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Healthy,
            1 => Self::Draining,
            _ => Self::Closed,
        }
    }
}

/// Parameters for one drain run. `close_code` controls what the 1001/1012
/// reconnect frame tells clients to expect.
#[derive(Debug, Clone)]
pub struct DrainOptions {
    pub reason: String,
    pub close_code: CloseCode,
}

impl Default for DrainOptions {
    fn default() -> Self {
        Self {
            reason: "server shutting down for maintenance".to_string(),
            close_code: CloseCode::GoingAway,
        }
    }
}

pub struct DrainManager {
    state: AtomicU8,
    started: AtomicBool,
    closed: Notify,
    hub: Mutex<Option<Arc<LocalHub>>>,
    grace_period: Duration,
    drain_timeout: Duration,
}

impl DrainManager {
    pub fn new() -> Self {
        Self::with_timeouts(Duration::from_secs(30), Duration::from_secs(60))
    }

    pub fn with_timeouts(grace_period: Duration, drain_timeout: Duration) -> Self {
        Self {
            state: AtomicU8::new(DrainState::Healthy as u8),
            started: AtomicBool::new(false),
            closed: Notify::new(),
            hub: Mutex::new(None),
            grace_period,
            drain_timeout,
        }
    }

    /// Wire in the hub once at startup, so the background drain task can
    /// broadcast RECONNECT and poll for stragglers. Not required for
    /// readiness/liveness reporting alone.
    pub fn attach_hub(&self, hub: Arc<LocalHub>) {
        *self.hub.lock() = Some(hub);
    }

    pub fn state(&self) -> DrainState {
        DrainState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// Begin draining. Returns once the state has flipped to `Draining`;
    /// the rest of the protocol runs in the background. Calling this more
    /// than once (e.g. a double SIGTERM) is a no-op after the first call.
    pub async fn start_drain(self: &Arc<Self>, options: DrainOptions) {
        if self.started.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst).is_err() {
            return;
        }
        self.state.store(DrainState::Draining as u8, Ordering::SeqCst);
        info!(reason = %options.reason, "drain started");

        let this = self.clone();
        tokio::spawn(async move {
            this.run_drain(options).await;
        });
    }

    async fn run_drain(self: Arc<Self>, options: DrainOptions) {
        let hub = self.hub.lock().clone();

        if let Some(hub) = &hub {
            let reconnect = Envelope::reconnect(&options.reason);
            let connections = hub.snapshot_connections();
            for conn in &connections {
                if conn.send_queue.try_send(reconnect.to_json()).is_err() {
                    let err = GatewayError::Overcapacity;
                    warn!(connection_id = conn.id, error = %err, "dropped reconnect broadcast during drain");
                }
            }
            info!(count = connections.len(), "broadcast reconnect to connected clients");
        }

        tokio::time::sleep(self.grace_period).await;

        let deadline = Instant::now() + self.drain_timeout.saturating_sub(self.grace_period);
        if let Some(hub) = &hub {
            loop {
                if hub.connection_count() == 0 {
                    break;
                }
                if Instant::now() >= deadline {
                    let stragglers = hub.snapshot_connections();
                    warn!(count = stragglers.len(), "force-closing stragglers at drain deadline");
                    let close_signal = QueuedFrame::Close(CloseSignal::new(options.close_code)).to_json();
                    for conn in &stragglers {
                        // Enqueue before unregistering: `unregister` closes the
                        // queue's sender, but frames already buffered are still
                        // drained by the writer loop first, so it gets a chance
                        // to write the real transport close frame.
                        let _ = conn.send_queue.try_send(close_signal.clone());
                        hub.unregister(conn);
                    }
                    metrics::counter!("gateway_drain_force_closed_total", stragglers.len() as u64);
                    break;
                }
                tokio::time::sleep(POLL_INTERVAL).await;
            }
        }

        self.state.store(DrainState::Closed as u8, Ordering::SeqCst);
        self.closed.notify_waiters();
        info!(close_code = options.close_code.code(), "drain complete");
    }

    /// Block until the drain has fully completed. Resolves immediately if
    /// already closed.
    pub async fn wait_closed(&self) {
        if self.state() == DrainState::Closed {
            return;
        }
        self.closed.notified().await;
    }
}

impl Default for DrainManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::{ClientType, Connection};

    #[tokio::test]
    async fn start_drain_transitions_quickly_without_waiting_full_grace_period() {
        let drain = Arc::new(DrainManager::with_timeouts(
            Duration::from_secs(600),
            Duration::from_secs(600),
        ));
        let start = Instant::now();
        drain.start_drain(DrainOptions::default()).await;
        assert!(start.elapsed() < Duration::from_millis(100));
        assert_eq!(drain.state(), DrainState::Draining);
    }

    #[tokio::test]
    async fn start_drain_is_idempotent() {
        let drain = Arc::new(DrainManager::with_timeouts(
            Duration::from_millis(10),
            Duration::from_millis(20),
        ));
        drain.start_drain(DrainOptions::default()).await;
        drain.start_drain(DrainOptions::default()).await;
        drain.wait_closed().await;
        assert_eq!(drain.state(), DrainState::Closed);
    }

    #[tokio::test]
    async fn drain_closes_once_all_connections_leave() {
        let hub = Arc::new(LocalHub::new());
        let drain = Arc::new(DrainManager::with_timeouts(
            Duration::from_millis(10),
            Duration::from_secs(5),
        ));
        drain.attach_hub(hub.clone());

        let (conn, _rx) = Connection::new("u1".into(), "s1".into(), ClientType::Web, 8);
        hub.register(conn.clone());

        drain.start_drain(DrainOptions::default()).await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(drain.state(), DrainState::Draining);

        hub.unregister(&conn);
        drain.wait_closed().await;
        assert_eq!(drain.state(), DrainState::Closed);
    }

    #[tokio::test]
    async fn drain_force_closes_stragglers_at_deadline() {
        let hub = Arc::new(LocalHub::new());
        let drain = Arc::new(DrainManager::with_timeouts(
            Duration::from_millis(5),
            Duration::from_millis(40),
        ));
        drain.attach_hub(hub.clone());

        let (conn, _rx) = Connection::new("u1".into(), "s1".into(), ClientType::Web, 8);
        hub.register(conn.clone());

        drain.start_drain(DrainOptions::default()).await;
        drain.wait_closed().await;

        assert_eq!(drain.state(), DrainState::Closed);
        assert_eq!(hub.connection_count(), 0);
        assert!(conn.send_queue.is_closed());
    }
}
