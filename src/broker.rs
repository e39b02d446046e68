//! Queue operations shared by producers and consumers.
//!
//! # Queue Structure
//!
//! Each queue owns:
//!
//! - `pending`: plain list, pushed at the head and consumed from the tail
//! - `pending_priority`: sorted set scored by priority, lowest first
//! - `processing:{consumer}`: one list per consumer holding the message in flight
//! - `acknowledged`: optional log of handled messages
//! - `dead_letter`: log of messages that exhausted their retries
//!
//! # Reliability
//!
//! Fetching atomically moves a message from pending to the consumer's
//! processing list. Acknowledging and every GC decision remove it from there
//! with a guarded transaction, so a message lives in exactly one structure
//! at a time and a crashed consumer's message is still found by the sweep.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::config::BrokerConfig;
use crate::error::{BrokerError, MessageError};
use crate::events::{BrokerEvent, EventBus, UnacknowledgedCause};
use crate::gc::{CollectOutcome, MessageCollector};
use crate::keys::{KeySchema, QueueRef};
use crate::message::{now_millis, Message};
use crate::metrics::MessageRate;
use crate::scheduler::Scheduler;
use crate::store::{Store, Transaction};

/// Queues the write that makes `message` ready for delivery.
///
/// Prioritized messages go to the priority set, the rest to the head of
/// the plain list.
pub(crate) fn enqueue_op(
    tx: &mut Transaction,
    keys: &KeySchema,
    message: &Message,
) -> Result<(), MessageError> {
    let queue = message.required_queue()?;
    let payload = message.to_json()?;
    match message.priority() {
        Some(priority) => tx.zadd(keys.pending_priority(queue), priority.score(), payload),
        None => tx.lpush(keys.pending(queue), payload),
    };
    Ok(())
}

/// A message fetched into a processing list.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub message: Message,
    /// Exact stored form, used to remove the entry again.
    pub payload: String,
    pub processing_key: String,
}

/// Store-level queue operations of one participant.
pub struct Broker {
    store: Arc<dyn Store>,
    keys: KeySchema,
    config: BrokerConfig,
    events: EventBus,
    rate: Arc<MessageRate>,
    scheduler: Arc<Scheduler>,
    collector: Arc<MessageCollector>,
}

impl Broker {
    pub fn new(
        store: Arc<dyn Store>,
        keys: KeySchema,
        config: BrokerConfig,
        events: EventBus,
        rate: Arc<MessageRate>,
    ) -> Self {
        let scheduler = Arc::new(Scheduler::new(
            store.clone(),
            keys.clone(),
            config.metrics_enabled,
        ));
        let collector = Arc::new(MessageCollector::new(
            store.clone(),
            keys.clone(),
            config.message,
            scheduler.clone(),
            events.clone(),
            rate.clone(),
            config.metrics_enabled,
        ));
        Self {
            store,
            keys,
            config,
            events,
            rate,
            scheduler,
            collector,
        }
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn keys(&self) -> &KeySchema {
        &self.keys
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    pub fn scheduler(&self) -> Arc<Scheduler> {
        self.scheduler.clone()
    }

    pub fn collector(&self) -> Arc<MessageCollector> {
        self.collector.clone()
    }

    /// Adds `queue` to the global queue index.
    pub async fn register_queue(&self, queue: &QueueRef) -> Result<(), BrokerError> {
        self.store
            .sadd(&self.keys.queues(), &queue.to_string())
            .await?;
        Ok(())
    }

    /// Stores a produced message, scheduled or ready.
    ///
    /// `message` must carry metadata and a queue. Returns true when it went
    /// to the scheduled set.
    pub async fn produce(&self, message: &mut Message) -> Result<bool, BrokerError> {
        let queue = message.required_queue()?.clone();
        let now = now_millis();
        let mut tx = Transaction::new();
        tx.sadd(self.keys.queues(), queue.to_string());

        let scheduled = message.is_schedulable() && self.scheduler.schedule(message, &mut tx, now)?;
        if !scheduled {
            message.mark_published(now)?;
            enqueue_op(&mut tx, &self.keys, message)?;
        }
        self.store.exec(tx).await?;

        debug!(
            message_id = %message.required_id()?,
            queue = %queue,
            scheduled = scheduled,
            "Message stored"
        );
        Ok(scheduled)
    }

    /// Moves the next message of `queue` into `processing_key`.
    ///
    /// Undecodable entries are dead-lettered verbatim and fetching goes on.
    pub async fn fetch(
        &self,
        queue: &QueueRef,
        processing_key: &str,
        use_priority: bool,
    ) -> Result<Option<Delivery>, BrokerError> {
        loop {
            let payload = if use_priority {
                self.store
                    .pop_min_to_list(&self.keys.pending_priority(queue), processing_key)
                    .await?
            } else {
                self.store
                    .move_tail_to_head(&self.keys.pending(queue), processing_key)
                    .await?
            };
            let Some(payload) = payload else {
                return Ok(None);
            };

            match Message::from_json(&payload) {
                Ok(message) => {
                    return Ok(Some(Delivery {
                        message,
                        payload,
                        processing_key: processing_key.to_string(),
                    }))
                }
                Err(e) => {
                    warn!(queue = %queue, error = %e, "Fetched malformed payload");
                    self.collector
                        .dead_letter_raw(queue, &payload, processing_key)
                        .await?;
                }
            }
        }
    }

    /// Removes a handled message from its processing list.
    ///
    /// Returns false when the entry was already gone.
    pub async fn acknowledge(&self, delivery: &Delivery) -> Result<bool, BrokerError> {
        let id = delivery.message.required_id()?;
        let queue = delivery.message.required_queue()?;
        let mut tx = Transaction::guarded_list(&delivery.processing_key, &delivery.payload);
        if self.config.store_messages {
            tx.lpush(self.keys.acknowledged(queue), &delivery.payload);
        }

        let applied = self.store.exec(tx).await?;
        if applied {
            self.events.emit(BrokerEvent::MessageAcknowledged {
                id,
                queue: queue.clone(),
            });
            self.rate.increment_acknowledged_slot(queue);
            debug!(message_id = %id, queue = %queue, "Message acknowledged");
        } else {
            warn!(message_id = %id, queue = %queue, "Acknowledged message was no longer in flight");
        }
        Ok(applied)
    }

    /// Hands a failed delivery to the collector.
    pub async fn unacknowledge(
        &self,
        delivery: &Delivery,
        cause: UnacknowledgedCause,
    ) -> Result<CollectOutcome, BrokerError> {
        self.collector
            .collect_message(
                delivery.message.clone(),
                &delivery.payload,
                &delivery.processing_key,
                cause,
            )
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Priority;
    use crate::store::MemoryStore;

    fn broker(store: Arc<MemoryStore>, store_messages: bool) -> Broker {
        let config = BrokerConfig::default()
            .with_store_messages(store_messages)
            .with_metrics(false);
        Broker::new(
            store,
            KeySchema::default(),
            config,
            EventBus::new(),
            Arc::new(MessageRate::new(false)),
        )
    }

    fn produced(body: i64) -> Message {
        let mut message = Message::new()
            .with_body(body)
            .with_queue(QueueRef::parse("ns1:q").unwrap());
        message.reset();
        message
    }

    #[tokio::test]
    async fn test_fifo_fetch_and_acknowledge() {
        let store = Arc::new(MemoryStore::new());
        let broker = broker(store.clone(), true);
        let queue = QueueRef::parse("ns1:q").unwrap();
        let processing = broker.keys().processing(&queue, "c1");

        for body in [1, 2] {
            let scheduled = broker.produce(&mut produced(body)).await.unwrap();
            assert!(!scheduled);
        }
        assert_eq!(
            store.smembers(&broker.keys().queues()).await.unwrap(),
            vec!["ns1:q".to_string()]
        );

        let first = broker.fetch(&queue, &processing, false).await.unwrap().unwrap();
        assert_eq!(first.message.body(), &serde_json::json!(1));
        assert!(first.message.metadata().unwrap().published_at.is_some());
        assert_eq!(store.llen(&processing).await.unwrap(), 1);

        assert!(broker.acknowledge(&first).await.unwrap());
        assert!(!broker.acknowledge(&first).await.unwrap());
        assert_eq!(store.llen(&processing).await.unwrap(), 0);
        assert_eq!(store.llen(&broker.keys().acknowledged(&queue)).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_acknowledged_log_is_optional() {
        let store = Arc::new(MemoryStore::new());
        let broker = broker(store.clone(), false);
        let queue = QueueRef::parse("ns1:q").unwrap();
        let processing = broker.keys().processing(&queue, "c1");

        broker.produce(&mut produced(1)).await.unwrap();
        let delivery = broker.fetch(&queue, &processing, false).await.unwrap().unwrap();
        broker.acknowledge(&delivery).await.unwrap();
        assert_eq!(store.llen(&broker.keys().acknowledged(&queue)).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_priority_fetch_order() {
        let store = Arc::new(MemoryStore::new());
        let broker = broker(store.clone(), false);
        let queue = QueueRef::parse("ns1:q").unwrap();
        let processing = broker.keys().processing(&queue, "c1");

        let mut low = produced(1).with_priority(Priority::Low);
        let mut high = produced(2).with_priority(Priority::Highest);
        broker.produce(&mut low).await.unwrap();
        broker.produce(&mut high).await.unwrap();

        // Prioritized messages are invisible to the plain fetch.
        assert!(broker.fetch(&queue, &processing, false).await.unwrap().is_none());
        let first = broker.fetch(&queue, &processing, true).await.unwrap().unwrap();
        assert_eq!(first.message.priority(), Some(Priority::Highest));
    }

    #[tokio::test]
    async fn test_schedulable_message_goes_to_scheduled_set() {
        let store = Arc::new(MemoryStore::new());
        let broker = broker(store.clone(), false);
        let queue = QueueRef::parse("ns1:q").unwrap();

        let mut message = produced(1).with_scheduled_delay(10_000);
        assert!(broker.produce(&mut message).await.unwrap());
        assert_eq!(store.zcard(&broker.keys().scheduled()).await.unwrap(), 1);
        assert_eq!(store.llen(&broker.keys().pending(&queue)).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_malformed_pending_entry_is_dead_lettered() {
        let store = Arc::new(MemoryStore::new());
        let broker = broker(store.clone(), false);
        let queue = QueueRef::parse("ns1:q").unwrap();
        let processing = broker.keys().processing(&queue, "c1");

        // Pushed first, so it sits at the tail and is fetched first.
        store.lpush(&broker.keys().pending(&queue), "{broken").await.unwrap();
        broker.produce(&mut produced(7)).await.unwrap();

        let delivery = broker.fetch(&queue, &processing, false).await.unwrap().unwrap();
        assert_eq!(delivery.message.body(), &serde_json::json!(7));
        let delivery = broker.fetch(&queue, &processing, false).await.unwrap();
        assert!(delivery.is_none());
        assert_eq!(
            store.lrange(&broker.keys().dead_letter(&queue), 0, -1).await.unwrap(),
            vec!["{broken".to_string()]
        );
    }
}
