//! Session: resumption state decoupled from a single Connection.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::RwLock;
use ulid::Ulid;

use crate::error::GatewayError;

/// A bounded, sliding ring of the last N outbound frames sent on a session,
/// used to replay missed events on resume.
struct ResumeBuffer {
    capacity: usize,
    frames: VecDeque<Value>,
}

impl ResumeBuffer {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            frames: VecDeque::with_capacity(capacity),
        }
    }

    fn push(&mut self, frame: Value) {
        if self.frames.len() == self.capacity {
            self.frames.pop_front();
        }
        self.frames.push_back(frame);
    }

    fn snapshot(&self) -> Vec<Value> {
        self.frames.iter().cloned().collect()
    }
}

/// Resumption state for a user's connection. Outlives a single transport;
/// a later connection can present `resume_key` to replay buffered frames
/// and continue the session instead of starting fresh.
pub struct Session {
    pub session_id: String,
    pub user_id: String,
    pub resume_key: String,
    pub created_at: Instant,
    last_heartbeat: Mutex<Instant>,
    resume_buffer: RwLock<ResumeBuffer>,
}

impl Session {
    pub fn new(user_id: String, resume_buffer_size: usize) -> Self {
        let now = Instant::now();
        Self {
            session_id: Ulid::new().to_string(),
            user_id,
            resume_key: Ulid::new().to_string(),
            created_at: now,
            last_heartbeat: Mutex::new(now),
            resume_buffer: RwLock::new(ResumeBuffer::new(resume_buffer_size)),
        }
    }

    pub fn touch_heartbeat(&self) {
        *self.last_heartbeat.lock() = Instant::now();
    }

    pub fn last_heartbeat(&self) -> Instant {
        *self.last_heartbeat.lock()
    }

    /// Whether this session has exceeded `session_timeout` since its last
    /// heartbeat — past this point a resume must fail with `4009`.
    pub fn is_expired(&self, session_timeout: Duration) -> bool {
        self.last_heartbeat().elapsed() > session_timeout
    }

    /// Append a frame the writer task just sent, for future resume replay.
    /// Only the writer task calls this.
    pub async fn record_outbound(&self, frame: Value) {
        self.resume_buffer.write().await.push(frame);
    }

    /// Snapshot the buffered frames in original send order, for resume replay.
    pub async fn buffered_frames(&self) -> Vec<Value> {
        self.resume_buffer.read().await.snapshot()
    }
}

/// Registry of live sessions, keyed by resume key, used by resume handling
/// in the connection actor. Expired sessions are reaped lazily on lookup.
#[derive(Clone)]
pub struct SessionStore {
    sessions: Arc<dashmap::DashMap<String, Arc<Session>>>,
    session_timeout: Duration,
}

impl SessionStore {
    pub fn new(session_timeout: Duration) -> Self {
        Self {
            sessions: Arc::new(dashmap::DashMap::new()),
            session_timeout,
        }
    }

    pub fn insert(&self, session: Arc<Session>) {
        self.sessions
            .insert(session.resume_key.clone(), session);
    }

    pub fn remove(&self, resume_key: &str) {
        self.sessions.remove(resume_key);
    }

    /// Look up a session by resume key.
    ///
    /// Returns `Ok(session)` if present and not expired,
    /// `Err(SessionUnknown { expired: true })` if present but expired
    /// (caller should close with `4009`), `Err(SessionUnknown { expired:
    /// false })` if absent entirely (caller should close with `4006`).
    pub fn try_resume(&self, resume_key: &str) -> Result<Arc<Session>, GatewayError> {
        match self.sessions.get(resume_key) {
            Some(entry) => {
                let session = entry.value().clone();
                if session.is_expired(self.session_timeout) {
                    drop(entry);
                    self.sessions.remove(resume_key);
                    Err(GatewayError::SessionUnknown { expired: true })
                } else {
                    Ok(session)
                }
            }
            None => Err(GatewayError::SessionUnknown { expired: false }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn resume_buffer_evicts_oldest_on_overflow() {
        let session = Session::new("u1".into(), 3);
        for i in 0..5 {
            session.record_outbound(serde_json::json!({ "i": i })).await;
        }
        let frames = session.buffered_frames().await;
        assert_eq!(frames.len(), 3);
        assert_eq!(frames[0]["i"], 2);
        assert_eq!(frames[2]["i"], 4);
    }

    #[test]
    fn session_expires_after_timeout() {
        let session = Session::new("u1".into(), 10);
        assert!(!session.is_expired(Duration::from_secs(60)));
        assert!(session.is_expired(Duration::from_secs(0)));
    }

    #[test]
    fn store_distinguishes_absent_from_expired() {
        let store = SessionStore::new(Duration::from_secs(0));
        let session = Arc::new(Session::new("u1".into(), 10));
        let key = session.resume_key.clone();
        store.insert(session);

        assert!(matches!(
            store.try_resume("nonexistent"),
            Err(GatewayError::SessionUnknown { expired: false })
        ));

        std::thread::sleep(Duration::from_millis(5));
        assert!(matches!(
            store.try_resume(&key),
            Err(GatewayError::SessionUnknown { expired: true })
        ));
    }
}
