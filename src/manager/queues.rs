//! Queue-level inspection and deletion.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::info;

use crate::error::{BrokerError, ValidationError};
use crate::heartbeat::{HeartbeatRecord, HeartbeatRegistry};
use crate::keys::{InstanceKind, KeySchema, QueueRef};
use crate::message::{now_millis, Message};
use crate::store::{Store, Transaction};

/// Message counts of one queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueMetrics {
    pub acknowledged: u64,
    pub dead_lettered: u64,
    pub pending: u64,
    pub pending_with_priority: u64,
}

/// An online consumer of a queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConsumerInfo {
    pub id: String,
    pub heartbeat: HeartbeatRecord,
}

pub struct QueueManager {
    store: Arc<dyn Store>,
    keys: KeySchema,
    registry: HeartbeatRegistry,
}

impl QueueManager {
    pub fn new(store: Arc<dyn Store>, keys: KeySchema, freshness: Duration) -> Self {
        let registry = HeartbeatRegistry::new(store.clone(), keys.clone(), freshness);
        Self {
            store,
            keys,
            registry,
        }
    }

    pub fn registry(&self) -> &HeartbeatRegistry {
        &self.registry
    }

    /// Every known queue, sorted.
    pub async fn list_queues(&self) -> Result<Vec<QueueRef>, BrokerError> {
        let mut queues: Vec<QueueRef> = self
            .store
            .smembers(&self.keys.queues())
            .await?
            .iter()
            .filter_map(|entry| QueueRef::parse(entry).ok())
            .collect();
        queues.sort();
        Ok(queues)
    }

    pub async fn queue_metrics(&self, queue: &QueueRef) -> Result<QueueMetrics, BrokerError> {
        Ok(QueueMetrics {
            acknowledged: self.store.llen(&self.keys.acknowledged(queue)).await?,
            dead_lettered: self.store.llen(&self.keys.dead_letter(queue)).await?,
            pending: self.store.llen(&self.keys.pending(queue)).await?,
            pending_with_priority: self.store.zcard(&self.keys.pending_priority(queue)).await?,
        })
    }

    /// Registered consumers of `queue` whose heartbeat is fresh.
    pub async fn queue_consumers(&self, queue: &QueueRef) -> Result<Vec<ConsumerInfo>, BrokerError> {
        let now = now_millis();
        let freshness = self.registry.freshness();
        let mut consumers = Vec::new();
        for id in self.store.smembers(&self.keys.consumers(queue)).await? {
            if let Some(heartbeat) = self.registry.record(InstanceKind::Consumer, &id).await? {
                if heartbeat.is_fresh(now, freshness) {
                    consumers.push(ConsumerInfo { id, heartbeat });
                }
            }
        }
        consumers.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(consumers)
    }

    /// Removes every structure of `queue`, including its scheduled messages.
    ///
    /// # Errors
    ///
    /// Refuses while a consumer of the queue is online.
    pub async fn delete_queue(&self, queue: &QueueRef) -> Result<(), BrokerError> {
        if !self.queue_consumers(queue).await?.is_empty() {
            return Err(ValidationError::QueueHasConsumers(queue.to_string()).into());
        }

        let mut tx = Transaction::new();
        tx.del(self.keys.pending(queue))
            .del(self.keys.pending_priority(queue))
            .del(self.keys.acknowledged(queue))
            .del(self.keys.dead_letter(queue))
            .del(self.keys.consumers(queue))
            .srem(self.keys.queues(), queue.to_string());

        let processing_queues = self.keys.processing_queues();
        for key in self.store.smembers(&processing_queues).await? {
            let owned = self
                .keys
                .parse_processing_key(&key)
                .is_some_and(|(q, _)| &q == queue);
            if owned {
                tx.del(key.as_str()).srem(processing_queues.as_str(), key);
            }
        }

        let scheduled = self.keys.scheduled();
        for payload in self.store.zrange(&scheduled, 0, -1).await? {
            let owned = Message::from_json(&payload).is_ok_and(|m| m.queue() == Some(queue));
            if owned {
                tx.zrem(scheduled.as_str(), payload);
            }
        }

        self.store.exec(tx).await?;
        info!(queue = %queue, "Queue deleted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heartbeat::ResourceUsage;
    use crate::keys::instance_key;
    use crate::store::MemoryStore;

    fn manager(store: Arc<MemoryStore>) -> QueueManager {
        QueueManager::new(store, KeySchema::default(), Duration::from_secs(10))
    }

    async fn beat(store: &MemoryStore, id: &str, timestamp: i64) {
        let record = HeartbeatRecord {
            timestamp,
            usage: ResourceUsage::current(),
        };
        store
            .hset(
                &KeySchema::default().heartbeat_index(),
                &instance_key(InstanceKind::Consumer, id),
                &serde_json::to_string(&record).unwrap(),
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_list_queues_and_metrics() {
        let store = Arc::new(MemoryStore::new());
        let keys = KeySchema::default();
        let queue = QueueRef::parse("ns1:b").unwrap();
        store.sadd(&keys.queues(), "ns1:b").await.unwrap();
        store.sadd(&keys.queues(), "ns1:a").await.unwrap();
        store.lpush(&keys.pending(&queue), "x").await.unwrap();
        store.lpush(&keys.dead_letter(&queue), "y").await.unwrap();
        store.zadd(&keys.pending_priority(&queue), 1.0, "z").await.unwrap();

        let manager = manager(store);
        let queues = manager.list_queues().await.unwrap();
        assert_eq!(
            queues.iter().map(|q| q.to_string()).collect::<Vec<_>>(),
            vec!["ns1:a", "ns1:b"]
        );
        let metrics = manager.queue_metrics(&queue).await.unwrap();
        assert_eq!(
            metrics,
            QueueMetrics {
                acknowledged: 0,
                dead_lettered: 1,
                pending: 1,
                pending_with_priority: 1,
            }
        );
    }

    #[tokio::test]
    async fn test_delete_queue_refused_while_consumed() {
        let store = Arc::new(MemoryStore::new());
        let keys = KeySchema::default();
        let queue = QueueRef::parse("ns1:q").unwrap();
        store.sadd(&keys.queues(), "ns1:q").await.unwrap();
        store.sadd(&keys.consumers(&queue), "c1").await.unwrap();
        beat(&store, "c1", now_millis()).await;

        let manager = manager(store.clone());
        assert_eq!(manager.queue_consumers(&queue).await.unwrap().len(), 1);
        assert!(manager.delete_queue(&queue).await.is_err());

        beat(&store, "c1", now_millis() - 60_000).await;
        assert!(manager.queue_consumers(&queue).await.unwrap().is_empty());

        let processing = keys.processing(&queue, "c1");
        store.lpush(&processing, "stuck").await.unwrap();
        store.sadd(&keys.processing_queues(), &processing).await.unwrap();
        let mut scheduled = Message::new().with_queue(queue.clone());
        scheduled.reset();
        store
            .zadd(&keys.scheduled(), 5.0, &scheduled.to_json().unwrap())
            .await
            .unwrap();

        manager.delete_queue(&queue).await.unwrap();
        assert!(manager.list_queues().await.unwrap().is_empty());
        assert_eq!(store.llen(&processing).await.unwrap(), 0);
        assert_eq!(store.zcard(&keys.scheduled()).await.unwrap(), 0);
        assert!(store.smembers(&keys.processing_queues()).await.unwrap().is_empty());
    }
}
