//! Local Hub: in-process registry of connections and subscriptions with
//! non-blocking fan-out.
//!
//! Three sharded tables (channel, server, user) plus the user-to-connections
//! map are each guarded by their own lock, acquired in a fixed order
//! (`users -> channels -> servers`) whenever more than one is needed at
//! once, to avoid deadlock. Fan-out only ever takes read locks and never
//! awaits while holding one.

pub mod connection;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;
use serde_json::Value;
use tracing::{debug, trace, warn};

pub use connection::{ClientType, Connection, ConnectionId, SendQueue};

/// Which subscription table an event targets.
#[derive(Debug, Clone)]
pub enum Target {
    Channel(String),
    Server(String),
    User(String),
}

/// Outcome of one fan-out call, for tests and metrics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FanoutStats {
    pub delivered: usize,
    pub dropped: usize,
}

type SubTable = RwLock<HashMap<String, HashSet<ConnectionId>>>;

fn empty_table() -> SubTable {
    RwLock::new(HashMap::new())
}

/// The single authority for subscription state: all reads/writes go
/// through it.
pub struct LocalHub {
    connections: DashMap<ConnectionId, Arc<Connection>>,
    users: SubTable,
    channels: SubTable,
    servers: SubTable,
}

impl LocalHub {
    pub fn new() -> Self {
        Self {
            connections: DashMap::new(),
            users: empty_table(),
            channels: empty_table(),
            servers: empty_table(),
        }
    }

    /// Add to the user map; no-op if already registered.
    pub fn register(&self, conn: Arc<Connection>) {
        if self.connections.contains_key(&conn.id) {
            return;
        }
        self.users
            .write()
            .entry(conn.user_id.clone())
            .or_default()
            .insert(conn.id);
        self.connections.insert(conn.id, conn.clone());
        metrics::gauge!("gateway_connections_active", self.connections.len() as f64);
        debug!(connection_id = conn.id, user_id = %conn.user_id, "registered connection");
    }

    /// Remove from the user map and every subscription table; close the
    /// send queue. Idempotent.
    pub fn unregister(&self, conn: &Connection) {
        let Some((_, removed)) = self.connections.remove(&conn.id) else {
            return;
        };
        remove_from_table(&self.users, &removed.user_id, removed.id);
        for channel_id in removed.channels() {
            remove_from_table(&self.channels, &channel_id, removed.id);
        }
        for server_id in removed.servers() {
            remove_from_table(&self.servers, &server_id, removed.id);
        }
        removed.send_queue.close();
        metrics::gauge!("gateway_connections_active", self.connections.len() as f64);
        debug!(connection_id = removed.id, "unregistered connection");
    }

    pub fn subscribe_channel(&self, conn: &Connection, channel_id: &str) {
        if conn.insert_channel(channel_id) {
            insert_into_table(&self.channels, channel_id, conn.id);
        }
    }

    pub fn unsubscribe_channel(&self, conn: &Connection, channel_id: &str) {
        if conn.remove_channel(channel_id) {
            remove_from_table(&self.channels, channel_id, conn.id);
        }
    }

    pub fn subscribe_server(&self, conn: &Connection, server_id: &str) {
        if conn.insert_server(server_id) {
            insert_into_table(&self.servers, server_id, conn.id);
        }
    }

    pub fn unsubscribe_server(&self, conn: &Connection, server_id: &str) {
        if conn.remove_server(server_id) {
            remove_from_table(&self.servers, server_id, conn.id);
        }
    }

    pub fn send_to_channel(&self, channel_id: &str, event: Value) -> FanoutStats {
        self.fanout(&self.channels, channel_id, event)
    }

    pub fn send_to_server(&self, server_id: &str, event: Value) -> FanoutStats {
        self.fanout(&self.servers, server_id, event)
    }

    pub fn send_to_user(&self, user_id: &str, event: Value) -> FanoutStats {
        self.fanout(&self.users, user_id, event)
    }

    pub fn send_to(&self, target: &Target, event: Value) -> FanoutStats {
        match target {
            Target::Channel(id) => self.send_to_channel(id, event),
            Target::Server(id) => self.send_to_server(id, event),
            Target::User(id) => self.send_to_user(id, event),
        }
    }

    /// Snapshot the target set under a shared lock, then non-blockingly
    /// push the already-encoded event to each connection's send queue. A
    /// full queue is a per-recipient drop, never a block.
    fn fanout(&self, table: &SubTable, topic_id: &str, event: Value) -> FanoutStats {
        let targets: Vec<ConnectionId> = {
            let table = table.read();
            match table.get(topic_id) {
                Some(set) => set.iter().copied().collect(),
                None => return FanoutStats::default(),
            }
        };

        let mut stats = FanoutStats::default();
        for id in targets {
            let Some(conn) = self.connections.get(&id) else {
                // Connection was unregistered concurrently; the handle in
                // the table is stale and harmlessly ignored.
                continue;
            };
            match conn.send_queue.try_send(event.clone()) {
                Ok(()) => stats.delivered += 1,
                Err(err) => {
                    stats.dropped += 1;
                    metrics::counter!("gateway_fanout_dropped_total", 1);
                    trace!(connection_id = id, topic = topic_id, error = %err, "dropped event");
                }
            }
        }
        if stats.delivered > 0 {
            metrics::counter!("gateway_fanout_delivered_total", stats.delivered as u64);
        }
        stats
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn user_count(&self) -> usize {
        self.users.read().len()
    }

    pub fn channel_subscription_count(&self) -> usize {
        self.channels.read().len()
    }

    pub fn server_subscription_count(&self) -> usize {
        self.servers.read().len()
    }

    /// Snapshot of every live connection, for the drain manager.
    pub fn snapshot_connections(&self) -> Vec<Arc<Connection>> {
        self.connections.iter().map(|e| e.value().clone()).collect()
    }
}

impl Default for LocalHub {
    fn default() -> Self {
        Self::new()
    }
}

fn insert_into_table(table: &SubTable, key: &str, id: ConnectionId) {
    table.write().entry(key.to_string()).or_default().insert(id);
}

/// Remove `id` from `key`'s set, deleting the entry entirely once empty so
/// iteration over the table stays cheap.
fn remove_from_table(table: &SubTable, key: &str, id: ConnectionId) {
    let mut table = table.write();
    if let Some(set) = table.get_mut(key) {
        set.remove(&id);
        if set.is_empty() {
            table.remove(key);
        }
    } else {
        warn!(key, connection_id = id, "remove from table with no matching key");
    }
}
