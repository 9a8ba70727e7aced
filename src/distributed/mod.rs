//! Distributed Hub: ref-counted bridge from local subscriptions to the
//! pub/sub fabric, built on top of the Local Hub.
//!
//! Uses the same subscribe/unsubscribe refcounting pattern as an upstream
//! subscription manager, but unified into a single `{subject -> count}` map
//! instead of one keyed struct per remote resource, since here the subject
//! namespace already distinguishes channel/server/user topics.

pub mod pubsub;

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::warn;

use crate::hub::{Connection, FanoutStats, LocalHub};
use pubsub::PubSubBackend;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum TopicKind {
    Channel,
    Server,
    User,
}

impl TopicKind {
    fn prefix(self) -> &'static str {
        match self {
            Self::Channel => "channel",
            Self::Server => "server",
            Self::User => "user",
        }
    }

    fn parse(prefix: &str) -> Option<Self> {
        match prefix {
            "channel" => Some(Self::Channel),
            "server" => Some(Self::Server),
            "user" => Some(Self::User),
            _ => None,
        }
    }
}

fn subject(kind: TopicKind, id: &str) -> String {
    format!("gateway.{}.{}", kind.prefix(), id)
}

fn parse_subject(subject: &str) -> Option<(TopicKind, String)> {
    let mut parts = subject.splitn(3, '.');
    if parts.next()? != "gateway" {
        return None;
    }
    let kind = TopicKind::parse(parts.next()?)?;
    let id = parts.next()?.to_string();
    Some((kind, id))
}

pub struct DistributedHub {
    local: Arc<LocalHub>,
    backend: Arc<dyn PubSubBackend>,
    refcounts: Mutex<HashMap<String, usize>>,
}

impl DistributedHub {
    pub fn new(local: Arc<LocalHub>, backend: Arc<dyn PubSubBackend>) -> Arc<Self> {
        Arc::new(Self {
            local,
            backend,
            refcounts: Mutex::new(HashMap::new()),
        })
    }

    pub fn local(&self) -> &Arc<LocalHub> {
        &self.local
    }

    pub async fn subscribe_channel(&self, conn: &Connection, channel_id: &str) {
        self.local.subscribe_channel(conn, channel_id);
        self.ref_up(TopicKind::Channel, channel_id).await;
    }

    pub async fn unsubscribe_channel(&self, conn: &Connection, channel_id: &str) {
        self.local.unsubscribe_channel(conn, channel_id);
        self.ref_down(TopicKind::Channel, channel_id).await;
    }

    pub async fn subscribe_server(&self, conn: &Connection, server_id: &str) {
        self.local.subscribe_server(conn, server_id);
        self.ref_up(TopicKind::Server, server_id).await;
    }

    pub async fn unsubscribe_server(&self, conn: &Connection, server_id: &str) {
        self.local.unsubscribe_server(conn, server_id);
        self.ref_down(TopicKind::Server, server_id).await;
    }

    /// Unregister a connection from the local hub and release its share of
    /// every distributed subscription it held — behaves like unsubscribing
    /// from everything first.
    pub async fn unregister(&self, conn: &Connection) {
        let channels = conn.channels();
        let servers = conn.servers();
        self.local.unregister(conn);
        for channel_id in channels {
            self.ref_down(TopicKind::Channel, &channel_id).await;
        }
        for server_id in servers {
            self.ref_down(TopicKind::Server, &server_id).await;
        }
    }

    pub async fn send_to_channel(&self, channel_id: &str, event: Value) -> FanoutStats {
        let stats = self.local.send_to_channel(channel_id, event.clone());
        self.publish_upstream(TopicKind::Channel, channel_id, &event).await;
        stats
    }

    pub async fn send_to_server(&self, server_id: &str, event: Value) -> FanoutStats {
        let stats = self.local.send_to_server(server_id, event.clone());
        self.publish_upstream(TopicKind::Server, server_id, &event).await;
        stats
    }

    pub async fn send_to_user(&self, user_id: &str, event: Value) -> FanoutStats {
        let stats = self.local.send_to_user(user_id, event.clone());
        self.publish_upstream(TopicKind::User, user_id, &event).await;
        stats
    }

    /// 0 -> 1 transition triggers an upstream subscribe.
    async fn ref_up(&self, kind: TopicKind, id: &str) {
        let subject = subject(kind, id);
        let first = {
            let mut counts = self.refcounts.lock();
            let entry = counts.entry(subject.clone()).or_insert(0);
            *entry += 1;
            *entry == 1
        };
        if first {
            if let Err(e) = self.backend.subscribe(&subject).await {
                warn!(subject, error = %e, "upstream subscribe failed");
            } else {
                metrics::gauge!("gateway_upstream_subscriptions_active", self.refcounts.lock().len() as f64);
            }
        }
    }

    /// 1 -> 0 transition triggers an upstream unsubscribe and drops the
    /// entry.
    async fn ref_down(&self, kind: TopicKind, id: &str) {
        let subject = subject(kind, id);
        let last = {
            let mut counts = self.refcounts.lock();
            match counts.get_mut(&subject) {
                Some(c) if *c > 1 => {
                    *c -= 1;
                    false
                }
                Some(_) => {
                    counts.remove(&subject);
                    true
                }
                None => false,
            }
        };
        if last {
            if let Err(e) = self.backend.unsubscribe(&subject).await {
                warn!(subject, error = %e, "upstream unsubscribe failed");
            }
            metrics::gauge!("gateway_upstream_subscriptions_active", self.refcounts.lock().len() as f64);
        }
    }

    /// Publish a locally-originated event upstream. A failure here is
    /// logged, not rolled back — the local fan-out already happened and
    /// must not be undone because the fabric hiccuped.
    async fn publish_upstream(&self, kind: TopicKind, id: &str, event: &Value) {
        let subject = subject(kind, id);
        let payload = match serde_json::to_vec(event) {
            Ok(p) => p,
            Err(e) => {
                warn!(subject, error = %e, "failed to encode event for upstream publish");
                return;
            }
        };
        if let Err(e) = self.backend.publish(&subject, payload).await {
            warn!(subject, error = %e, "upstream publish failed; local delivery already completed");
        }
    }

    /// Route a message that arrived from the fabric to local subscribers
    /// only. Never re-published — every instance re-publishing what it
    /// receives would echo forever.
    fn handle_inbound(&self, subject: &str, payload: &[u8]) {
        let Some((kind, id)) = parse_subject(subject) else {
            warn!(subject, "dropping inbound message with unrecognized subject");
            return;
        };
        let event: Value = match serde_json::from_slice(payload) {
            Ok(v) => v,
            Err(e) => {
                warn!(subject, error = %e, "dropping malformed inbound upstream payload");
                return;
            }
        };
        match kind {
            TopicKind::Channel => {
                self.local.send_to_channel(&id, event);
            }
            TopicKind::Server => {
                self.local.send_to_server(&id, event);
            }
            TopicKind::User => {
                self.local.send_to_user(&id, event);
            }
        }
    }

    pub fn upstream_subscription_count(&self) -> usize {
        self.refcounts.lock().len()
    }

    /// Spawn the task that drains inbound fabric messages into local
    /// fan-out. `inbound_rx` is the receiving half paired with whatever
    /// channel the concrete `PubSubBackend` was constructed with.
    pub fn spawn_inbound_pump(
        self: &Arc<Self>,
        mut inbound_rx: mpsc::UnboundedReceiver<(String, Vec<u8>)>,
    ) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            while let Some((subject, payload)) = inbound_rx.recv().await {
                this.handle_inbound(&subject, &payload);
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::ClientType;
    use pubsub::InMemoryBus;
    use pubsub::InMemoryPubSub;

    fn new_distributed_hub() -> (Arc<DistributedHub>, mpsc::UnboundedReceiver<(String, Vec<u8>)>) {
        let bus = InMemoryBus::new();
        let (tx, rx) = mpsc::unbounded_channel();
        let backend = Arc::new(InMemoryPubSub::new(bus, tx));
        let local = Arc::new(LocalHub::new());
        (DistributedHub::new(local, backend), rx)
    }

    #[tokio::test]
    async fn ref_count_collapses_to_single_upstream_subscribe() {
        let (hub, _rx) = new_distributed_hub();
        let (c1, _rx1) = Connection::new("u1".into(), "s1".into(), ClientType::Web, 8);
        let (c2, _rx2) = Connection::new("u2".into(), "s2".into(), ClientType::Web, 8);
        hub.local().register(c1.clone());
        hub.local().register(c2.clone());

        hub.subscribe_channel(&c1, "chan-a").await;
        hub.subscribe_channel(&c2, "chan-a").await;
        assert_eq!(hub.upstream_subscription_count(), 1);

        hub.unsubscribe_channel(&c1, "chan-a").await;
        assert_eq!(hub.upstream_subscription_count(), 1);

        hub.unsubscribe_channel(&c2, "chan-a").await;
        assert_eq!(hub.upstream_subscription_count(), 0);
    }

    #[tokio::test]
    async fn delivers_across_two_distributed_hub_instances() {
        let bus = InMemoryBus::new();
        let (tx_a, rx_a) = mpsc::unbounded_channel();
        let (tx_b, rx_b) = mpsc::unbounded_channel();
        let backend_a = Arc::new(InMemoryPubSub::new(bus.clone(), tx_a));
        let backend_b = Arc::new(InMemoryPubSub::new(bus, tx_b));

        let hub_a = DistributedHub::new(Arc::new(LocalHub::new()), backend_a);
        let hub_b = DistributedHub::new(Arc::new(LocalHub::new()), backend_b);
        hub_a.spawn_inbound_pump(rx_a);
        hub_b.spawn_inbound_pump(rx_b);

        let (conn_b, mut rx_conn_b) = Connection::new("u1".into(), "s1".into(), ClientType::Web, 8);
        hub_b.local().register(conn_b.clone());
        hub_b.subscribe_channel(&conn_b, "chan-a").await;

        // hub_a has no local subscriber, but publishing must still reach
        // hub_b's subscriber over the shared fabric.
        hub_a.send_to_channel("chan-a", serde_json::json!({"e": 1})).await;

        tokio::time::timeout(std::time::Duration::from_millis(200), rx_conn_b.recv())
            .await
            .expect("message should arrive via the fabric")
            .unwrap();
    }

    #[tokio::test]
    async fn unregister_releases_every_subscription_the_connection_held() {
        let (hub, _rx) = new_distributed_hub();
        let (conn, _rx1) = Connection::new("u1".into(), "s1".into(), ClientType::Web, 8);
        hub.local().register(conn.clone());
        hub.subscribe_channel(&conn, "chan-a").await;
        hub.subscribe_server(&conn, "srv-a").await;

        hub.unregister(&conn).await;

        assert_eq!(hub.upstream_subscription_count(), 0);
        assert_eq!(hub.local().connection_count(), 0);
    }
}
