//! Pub/sub fabric abstraction bridging the local hub to other gateway
//! instances.
//!
//! `PubSubBackend` is marked with `#[async_trait]` so it stays object-safe
//! and `DistributedHub` can hold it behind an `Arc<dyn _>`.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::StreamExt;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::error::{GatewayError, GatewayResult};

#[async_trait]
pub trait PubSubBackend: Send + Sync {
    async fn subscribe(&self, subject: &str) -> GatewayResult<()>;
    async fn unsubscribe(&self, subject: &str) -> GatewayResult<()>;
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> GatewayResult<()>;
}

/// In-process pub/sub, for tests and single-instance deployments that don't
/// need a real fabric. Multiple `InMemoryPubSub`s sharing a clone of the
/// same `InMemoryBus` behave like separate gateway instances talking over a
/// real broker — get-or-create a broadcast channel per topic, exactly the
/// way `SseState::get_channel` multiplexes local subscribers.
#[derive(Clone, Default)]
pub struct InMemoryBus {
    channels: Arc<DashMap<String, broadcast::Sender<Vec<u8>>>>,
}

impl InMemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn get_or_create(&self, subject: &str) -> broadcast::Sender<Vec<u8>> {
        self.channels
            .entry(subject.to_string())
            .or_insert_with(|| broadcast::channel(256).0)
            .clone()
    }
}

pub struct InMemoryPubSub {
    bus: InMemoryBus,
    inbound_tx: mpsc::UnboundedSender<(String, Vec<u8>)>,
    subscriptions: DashMap<String, CancellationToken>,
}

impl InMemoryPubSub {
    pub fn new(bus: InMemoryBus, inbound_tx: mpsc::UnboundedSender<(String, Vec<u8>)>) -> Self {
        Self {
            bus,
            inbound_tx,
            subscriptions: DashMap::new(),
        }
    }
}

#[async_trait]
impl PubSubBackend for InMemoryPubSub {
    async fn subscribe(&self, subject: &str) -> GatewayResult<()> {
        if self.subscriptions.contains_key(subject) {
            return Ok(());
        }
        let mut rx = self.bus.get_or_create(subject).subscribe();
        let cancel = CancellationToken::new();
        let child = cancel.clone();
        let inbound_tx = self.inbound_tx.clone();
        let subject_owned = subject.to_string();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = child.cancelled() => break,
                    msg = rx.recv() => match msg {
                        Ok(payload) => {
                            if inbound_tx.send((subject_owned.clone(), payload)).is_err() {
                                break;
                            }
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                        Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    },
                }
            }
        });
        self.subscriptions.insert(subject.to_string(), cancel);
        Ok(())
    }

    async fn unsubscribe(&self, subject: &str) -> GatewayResult<()> {
        if let Some((_, cancel)) = self.subscriptions.remove(subject) {
            cancel.cancel();
        }
        Ok(())
    }

    async fn publish(&self, subject: &str, payload: Vec<u8>) -> GatewayResult<()> {
        // No listeners on this process is fine; `send` erroring just means
        // nobody local happens to be subscribed to the bus right now.
        let _ = self.bus.get_or_create(subject).send(payload);
        Ok(())
    }
}

/// NATS-backed fabric for real multi-instance deployments. The
/// subscribe/unsubscribe bookkeeping mirrors `UpstreamManager`: a
/// cancellation token per live subscription, torn down by cancelling
/// instead of awaiting the reader task directly.
pub struct NatsPubSub {
    client: async_nats::Client,
    inbound_tx: mpsc::UnboundedSender<(String, Vec<u8>)>,
    subscriptions: DashMap<String, CancellationToken>,
}

impl NatsPubSub {
    pub async fn connect(
        url: &str,
        inbound_tx: mpsc::UnboundedSender<(String, Vec<u8>)>,
    ) -> GatewayResult<Self> {
        let client = async_nats::connect(url)
            .await
            .map_err(|e| GatewayError::Upstream(e.to_string()))?;
        Ok(Self {
            client,
            inbound_tx,
            subscriptions: DashMap::new(),
        })
    }
}

#[async_trait]
impl PubSubBackend for NatsPubSub {
    async fn subscribe(&self, subject: &str) -> GatewayResult<()> {
        if self.subscriptions.contains_key(subject) {
            return Ok(());
        }
        let mut sub = self
            .client
            .subscribe(subject.to_string())
            .await
            .map_err(|e| GatewayError::Upstream(e.to_string()))?;

        let cancel = CancellationToken::new();
        let child = cancel.clone();
        let inbound_tx = self.inbound_tx.clone();
        let subject_owned = subject.to_string();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = child.cancelled() => break,
                    msg = sub.next() => match msg {
                        Some(m) => {
                            if inbound_tx.send((subject_owned.clone(), m.payload.to_vec())).is_err() {
                                break;
                            }
                        }
                        None => break,
                    },
                }
            }
        });
        self.subscriptions.insert(subject.to_string(), cancel);
        Ok(())
    }

    async fn unsubscribe(&self, subject: &str) -> GatewayResult<()> {
        if let Some((_, cancel)) = self.subscriptions.remove(subject) {
            cancel.cancel();
        } else {
            warn!(subject, "unsubscribe called for unknown subject");
        }
        Ok(())
    }

    async fn publish(&self, subject: &str, payload: Vec<u8>) -> GatewayResult<()> {
        self.client
            .publish(subject.to_string(), payload.into())
            .await
            .map_err(|e| GatewayError::Upstream(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn in_memory_bus_delivers_across_two_backends() {
        let bus = InMemoryBus::new();
        let (tx_a, mut rx_a) = mpsc::unbounded_channel();
        let (tx_b, _rx_b) = mpsc::unbounded_channel();
        let instance_a = InMemoryPubSub::new(bus.clone(), tx_a);
        let instance_b = InMemoryPubSub::new(bus, tx_b);

        instance_a.subscribe("gateway.channel.c1").await.unwrap();
        instance_b.publish("gateway.channel.c1", b"hello".to_vec()).await.unwrap();

        let (subject, payload) = rx_a.recv().await.unwrap();
        assert_eq!(subject, "gateway.channel.c1");
        assert_eq!(payload, b"hello");
    }

    #[tokio::test]
    async fn unsubscribe_stops_delivery() {
        let bus = InMemoryBus::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let instance = InMemoryPubSub::new(bus.clone(), tx);
        instance.subscribe("gateway.channel.c1").await.unwrap();
        instance.unsubscribe("gateway.channel.c1").await.unwrap();

        // Give the reader task a moment to observe cancellation.
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        bus.get_or_create("gateway.channel.c1").send(b"late".to_vec()).ok();
        assert!(rx.try_recv().is_err());
    }
}
