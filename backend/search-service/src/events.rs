//! Refresh notifications.
//!
//! Ingestion publishes a [`RefreshEvent`] when a source store changes;
//! interested parties subscribe instead of being pushed into directly.
//! In production the bus rides Redis pub/sub so every service instance
//! sees every event; the local bus covers tests and single-node runs.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::error::StoreError;
use crate::models::SourceType;

const BUS_CAPACITY: usize = 256;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefreshEvent {
    pub source: SourceType,
    pub occurred_at: DateTime<Utc>,
}

impl RefreshEvent {
    pub fn now(source: SourceType) -> Self {
        Self {
            source,
            occurred_at: Utc::now(),
        }
    }
}

#[async_trait]
pub trait RefreshBus: Send + Sync {
    async fn publish(&self, event: RefreshEvent) -> Result<(), StoreError>;

    /// New subscribers see only events published after they subscribe.
    fn subscribe(&self) -> broadcast::Receiver<RefreshEvent>;
}

/// Process-local bus. Events never leave this instance.
pub struct LocalBus {
    tx: broadcast::Sender<RefreshEvent>,
}

impl LocalBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(BUS_CAPACITY);
        Self { tx }
    }
}

impl Default for LocalBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RefreshBus for LocalBus {
    async fn publish(&self, event: RefreshEvent) -> Result<(), StoreError> {
        // Send fails only when nobody is subscribed, which is fine.
        let _ = self.tx.send(event);
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<RefreshEvent> {
        self.tx.subscribe()
    }
}

/// Redis-backed bus. Publishes to a pub/sub channel and bridges inbound
/// messages into a process-local broadcast channel, so local subscribers
/// also see events published by other instances.
pub struct RedisBus {
    conn: redis::aio::ConnectionManager,
    channel: String,
    tx: broadcast::Sender<RefreshEvent>,
}

impl RedisBus {
    pub async fn connect(client: redis::Client, channel: String) -> Result<Self, StoreError> {
        let conn = redis::aio::ConnectionManager::new(client.clone()).await?;
        let (tx, _) = broadcast::channel(BUS_CAPACITY);

        let mut pubsub = client.get_async_pubsub().await?;
        pubsub.subscribe(&channel).await?;
        info!("subscribed to refresh channel {channel}");

        let bridge_tx = tx.clone();
        let bridge_channel = channel.clone();
        tokio::spawn(async move {
            let mut stream = pubsub.on_message();
            while let Some(msg) = stream.next().await {
                let payload: String = match msg.get_payload() {
                    Ok(payload) => payload,
                    Err(err) => {
                        warn!("unreadable refresh payload: {err}");
                        continue;
                    }
                };
                match serde_json::from_str::<RefreshEvent>(&payload) {
                    Ok(event) => {
                        let _ = bridge_tx.send(event);
                    }
                    Err(err) => warn!("malformed refresh event on {bridge_channel}: {err}"),
                }
            }
            warn!("refresh subscription on {bridge_channel} closed");
        });

        Ok(Self { conn, channel, tx })
    }
}

#[async_trait]
impl RefreshBus for RedisBus {
    async fn publish(&self, event: RefreshEvent) -> Result<(), StoreError> {
        let payload = serde_json::to_string(&event)
            .map_err(|err| StoreError::Unavailable(err.to_string()))?;
        let mut conn = self.conn.clone();
        let _: i64 = conn.publish(&self.channel, payload).await?;
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<RefreshEvent> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_local_bus_delivers_to_subscriber() {
        let bus = LocalBus::new();
        let mut rx = bus.subscribe();

        bus.publish(RefreshEvent::now(SourceType::Repo)).await.unwrap();

        let event = rx.recv().await.unwrap();
        assert_eq!(event.source, SourceType::Repo);
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_ok() {
        let bus = LocalBus::new();
        assert!(bus.publish(RefreshEvent::now(SourceType::Trend)).await.is_ok());
    }

    #[tokio::test]
    async fn test_late_subscriber_misses_earlier_events() {
        let bus = LocalBus::new();
        bus.publish(RefreshEvent::now(SourceType::Trend)).await.unwrap();

        let mut rx = bus.subscribe();
        bus.publish(RefreshEvent::now(SourceType::KnowledgeEntry))
            .await
            .unwrap();

        let event = rx.recv().await.unwrap();
        assert_eq!(event.source, SourceType::KnowledgeEntry);
        assert!(rx.try_recv().is_err());
    }
}
