//! Consumer and GC behaviour when the store misbehaves or other
//! participants write in between reads and writes.
//!
//! Run with: cargo test --test store_faults

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc};

use redis_mq::broker::Broker;
use redis_mq::events::EventBus;
use redis_mq::gc::GcSweeper;
use redis_mq::heartbeat::{HeartbeatRecord, HeartbeatRegistry, ResourceUsage};
use redis_mq::keys::{instance_key, InstanceKind};
use redis_mq::message::now_millis;
use redis_mq::metrics::MessageRate;
use redis_mq::store::{Guard, Store, StoreConnector, Transaction};
use redis_mq::{
    BrokerConfig, BrokerEvent, Consumer, HandlerError, KeySchema, MemoryStore, Message,
    MessageDefaults, Producer, QueueRef, StoreError, UnacknowledgedCause,
};

const WAIT: Duration = Duration::from_secs(5);

fn fast_config() -> BrokerConfig {
    BrokerConfig::default()
        .with_metrics(false)
        .with_store_messages(true)
        .with_poll_interval(Duration::from_millis(10))
        .with_scheduler_interval(Duration::from_millis(20))
        .with_gc_interval(Duration::from_millis(20))
        .with_heartbeat_interval(Duration::from_millis(50))
        .with_heartbeat_freshness(Duration::from_millis(500))
        .with_shutdown_timeout(Duration::from_millis(300))
        .with_message_defaults(MessageDefaults {
            retry_delay: Some(0),
            ..MessageDefaults::default()
        })
}

fn orders() -> QueueRef {
    QueueRef::parse("shop:orders").unwrap()
}

/// A write landing right after a read, as if another participant ran in between.
enum Interleave {
    PushAfterRange { key: String, value: String },
    SetAfterHashRead { key: String, field: String, value: String },
}

#[derive(Default)]
struct Faults {
    /// Guarded writes on processing lists left to fail.
    settle_failures: AtomicUsize,
    /// Fetch moves left to report failure after moving.
    fetch_failures: AtomicUsize,
    interleaved: Mutex<Vec<Interleave>>,
}

impl Faults {
    fn take_one(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn take_push(&self, key: &str) -> Option<String> {
        let mut pending = self.interleaved.lock().unwrap();
        let index = pending.iter().position(
            |i| matches!(i, Interleave::PushAfterRange { key: k, .. } if k == key),
        )?;
        match pending.remove(index) {
            Interleave::PushAfterRange { value, .. } => Some(value),
            Interleave::SetAfterHashRead { .. } => None,
        }
    }

    fn take_hash_write(&self, key: &str) -> Option<(String, String)> {
        let mut pending = self.interleaved.lock().unwrap();
        let index = pending.iter().position(
            |i| matches!(i, Interleave::SetAfterHashRead { key: k, .. } if k == key),
        )?;
        match pending.remove(index) {
            Interleave::SetAfterHashRead { field, value, .. } => Some((field, value)),
            Interleave::PushAfterRange { .. } => None,
        }
    }
}

fn injected() -> StoreError {
    StoreError::ConnectionFailed("injected failure".to_string())
}

/// Delegates to a shared in-memory keyspace and injects [`Faults`].
struct FaultyStore {
    inner: Arc<dyn Store>,
    faults: Arc<Faults>,
}

#[async_trait]
impl Store for FaultyStore {
    async fn lpush(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.inner.lpush(key, value).await
    }

    async fn llen(&self, key: &str) -> Result<u64, StoreError> {
        self.inner.llen(key).await
    }

    async fn lrange(&self, key: &str, start: i64, stop: i64) -> Result<Vec<String>, StoreError> {
        let entries = self.inner.lrange(key, start, stop).await?;
        if let Some(value) = self.faults.take_push(key) {
            self.inner.lpush(key, &value).await?;
        }
        Ok(entries)
    }

    async fn lindex(&self, key: &str, index: i64) -> Result<Option<String>, StoreError> {
        self.inner.lindex(key, index).await
    }

    async fn move_tail_to_head(&self, src: &str, dst: &str) -> Result<Option<String>, StoreError> {
        let moved = self.inner.move_tail_to_head(src, dst).await?;
        if moved.is_some() && Faults::take_one(&self.faults.fetch_failures) {
            return Err(injected());
        }
        Ok(moved)
    }

    async fn pop_min_to_list(&self, zset: &str, list: &str) -> Result<Option<String>, StoreError> {
        self.inner.pop_min_to_list(zset, list).await
    }

    async fn zadd(&self, key: &str, score: f64, member: &str) -> Result<(), StoreError> {
        self.inner.zadd(key, score, member).await
    }

    async fn zrem(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        self.inner.zrem(key, member).await
    }

    async fn zcard(&self, key: &str) -> Result<u64, StoreError> {
        self.inner.zcard(key).await
    }

    async fn zrange(&self, key: &str, start: i64, stop: i64) -> Result<Vec<String>, StoreError> {
        self.inner.zrange(key, start, stop).await
    }

    async fn zrange_by_score(
        &self,
        key: &str,
        min: f64,
        max: f64,
    ) -> Result<Vec<(String, f64)>, StoreError> {
        self.inner.zrange_by_score(key, min, max).await
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<(), StoreError> {
        self.inner.hset(key, field, value).await
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>, StoreError> {
        self.inner.hget(key, field).await
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>, StoreError> {
        let records = self.inner.hgetall(key).await?;
        if let Some((field, value)) = self.faults.take_hash_write(key) {
            self.inner.hset(key, &field, &value).await?;
        }
        Ok(records)
    }

    async fn hdel(&self, key: &str, fields: &[String]) -> Result<u64, StoreError> {
        self.inner.hdel(key, fields).await
    }

    async fn sadd(&self, key: &str, member: &str) -> Result<(), StoreError> {
        self.inner.sadd(key, member).await
    }

    async fn srem(&self, key: &str, member: &str) -> Result<(), StoreError> {
        self.inner.srem(key, member).await
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>, StoreError> {
        self.inner.smembers(key).await
    }

    async fn del(&self, key: &str) -> Result<(), StoreError> {
        self.inner.del(key).await
    }

    async fn exec(&self, tx: Transaction) -> Result<bool, StoreError> {
        let settles = matches!(
            tx.guard(),
            Some(Guard::ListRemove { key, .. }) if key.contains(":processing:")
        );
        if settles && Faults::take_one(&self.faults.settle_failures) {
            return Err(injected());
        }
        self.inner.exec(tx).await
    }

    async fn quit(&self) -> Result<(), StoreError> {
        self.inner.quit().await
    }
}

struct FaultyConnector {
    server: MemoryStore,
    faults: Arc<Faults>,
}

#[async_trait]
impl StoreConnector for FaultyConnector {
    async fn connect(&self) -> Result<Arc<dyn Store>, StoreError> {
        Ok(Arc::new(FaultyStore {
            inner: self.server.connect().await?,
            faults: self.faults.clone(),
        }))
    }
}

async fn wait_for<F>(events: &mut broadcast::Receiver<BrokerEvent>, matches: F) -> BrokerEvent
where
    F: Fn(&BrokerEvent) -> bool,
{
    tokio::time::timeout(WAIT, async {
        loop {
            match events.recv().await {
                Ok(event) if matches(&event) => return event,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("event bus closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

/// Consumer on `faults` that forwards every handled message to the returned channel.
async fn faulty_consumer(
    memory: &Arc<MemoryStore>,
    faults: Arc<Faults>,
) -> (Consumer, mpsc::UnboundedReceiver<Message>) {
    let connector = Arc::new(FaultyConnector {
        server: memory.as_ref().clone(),
        faults,
    });
    let (tx, rx) = mpsc::unbounded_channel();
    let consumer = Consumer::new(fast_config(), connector).unwrap();
    consumer
        .consume("shop:orders", false, move |message: Message| {
            let tx = tx.clone();
            async move {
                tx.send(message).map_err(|e| HandlerError::new(e.to_string()))?;
                Ok::<(), HandlerError>(())
            }
        })
        .await
        .unwrap();
    (consumer, rx)
}

#[tokio::test]
async fn test_acknowledge_is_retried_after_store_failure() {
    let memory = Arc::new(MemoryStore::new());
    let keys = KeySchema::default();
    let faults = Arc::new(Faults::default());
    faults.settle_failures.store(2, Ordering::SeqCst);

    let producer = Producer::new(fast_config(), memory.clone()).unwrap();
    producer.run().await.unwrap();
    let (consumer, mut rx) = faulty_consumer(&memory, faults.clone()).await;
    let mut events = consumer.subscribe();
    consumer.run().await.unwrap();

    let first = producer
        .produce_to("shop:orders", Message::new().with_body(1))
        .await
        .unwrap();
    let acked = wait_for(&mut events, |e| matches!(e, BrokerEvent::MessageAcknowledged { .. })).await;
    assert_eq!(
        acked,
        BrokerEvent::MessageAcknowledged {
            id: first.id().unwrap(),
            queue: orders()
        }
    );
    assert_eq!(faults.settle_failures.load(Ordering::SeqCst), 0);

    // The loop keeps serving the queue afterwards.
    let second = producer
        .produce_to("shop:orders", Message::new().with_body(2))
        .await
        .unwrap();
    let acked = wait_for(&mut events, |e| matches!(e, BrokerEvent::MessageAcknowledged { .. })).await;
    assert_eq!(
        acked,
        BrokerEvent::MessageAcknowledged {
            id: second.id().unwrap(),
            queue: orders()
        }
    );

    // Each message reached the handler exactly once.
    let handled: Vec<_> = [rx.recv().await.unwrap(), rx.recv().await.unwrap()]
        .iter()
        .map(|m| m.id())
        .collect();
    assert_eq!(handled, vec![first.id(), second.id()]);
    assert!(rx.try_recv().is_err());

    let queue = orders();
    assert!(consumer.is_running());
    assert_eq!(memory.llen(&keys.processing(&queue, consumer.id())).await.unwrap(), 0);
    assert_eq!(memory.llen(&keys.acknowledged(&queue)).await.unwrap(), 2);

    consumer.shutdown().await.unwrap();
    producer.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_message_moved_by_failed_fetch_is_reclaimed() {
    let memory = Arc::new(MemoryStore::new());
    let keys = KeySchema::default();
    let faults = Arc::new(Faults::default());
    faults.fetch_failures.store(1, Ordering::SeqCst);

    let producer = Producer::new(fast_config(), memory.clone()).unwrap();
    producer.run().await.unwrap();
    let sent = producer
        .produce_to("shop:orders", Message::new().with_body("stranded"))
        .await
        .unwrap();

    let (consumer, mut rx) = faulty_consumer(&memory, faults.clone()).await;
    let mut events = consumer.subscribe();
    consumer.run().await.unwrap();

    let recovered = wait_for(&mut events, |e| {
        matches!(e, BrokerEvent::MessageUnacknowledged { .. })
    })
    .await;
    assert_eq!(
        recovered,
        BrokerEvent::MessageUnacknowledged {
            id: sent.id().unwrap(),
            queue: orders(),
            cause: UnacknowledgedCause::Recovery,
        }
    );

    let received = tokio::time::timeout(WAIT, rx.recv()).await.unwrap().unwrap();
    assert_eq!(received.id(), sent.id());
    assert_eq!(received.attempts(), 1);
    wait_for(&mut events, |e| matches!(e, BrokerEvent::MessageAcknowledged { .. })).await;

    let queue = orders();
    assert_eq!(memory.llen(&keys.processing(&queue, consumer.id())).await.unwrap(), 0);
    assert_eq!(memory.llen(&keys.pending(&queue)).await.unwrap(), 0);
    assert_eq!(memory.llen(&keys.acknowledged(&queue)).await.unwrap(), 1);

    consumer.shutdown().await.unwrap();
    producer.shutdown().await.unwrap();
}

fn stale_record() -> String {
    serde_json::to_string(&HeartbeatRecord {
        timestamp: now_millis() - 60_000,
        usage: ResourceUsage::current(),
    })
    .unwrap()
}

fn fresh_record() -> String {
    serde_json::to_string(&HeartbeatRecord {
        timestamp: now_millis(),
        usage: ResourceUsage::current(),
    })
    .unwrap()
}

fn sweeper_on(store: Arc<dyn Store>, keys: &KeySchema) -> GcSweeper {
    let config = fast_config();
    let registry = HeartbeatRegistry::new(store.clone(), keys.clone(), config.heartbeat_freshness);
    let broker = Broker::new(
        store.clone(),
        keys.clone(),
        config,
        EventBus::new(),
        Arc::new(MessageRate::new(false)),
    );
    GcSweeper::new(store, keys.clone(), registry, broker.collector())
}

#[tokio::test]
async fn test_sweep_keeps_list_fetched_into_after_drain() {
    let memory = MemoryStore::new();
    let keys = KeySchema::default();
    let queue = orders();
    let processing = keys.processing(&queue, "slow");

    let mut stale = Message::new().with_queue(queue.clone());
    stale.reset();
    memory.lpush(&processing, &stale.to_json().unwrap()).await.unwrap();
    memory.sadd(&keys.processing_queues(), &processing).await.unwrap();
    memory.sadd(&keys.consumers(&queue), "slow").await.unwrap();
    memory
        .hset(
            &keys.heartbeat_index(),
            &instance_key(InstanceKind::Consumer, "slow"),
            &stale_record(),
        )
        .await
        .unwrap();

    // The consumer fetches a new message right after the sweep reads its list.
    let mut fetched = Message::new().with_queue(queue.clone());
    fetched.reset();
    let faults = Arc::new(Faults::default());
    faults.interleaved.lock().unwrap().push(Interleave::PushAfterRange {
        key: processing.clone(),
        value: fetched.to_json().unwrap(),
    });
    let store: Arc<dyn Store> = Arc::new(FaultyStore {
        inner: memory.connect().await.unwrap(),
        faults,
    });

    let report = sweeper_on(store, &keys).sweep(now_millis()).await.unwrap();
    assert_eq!(report.collected, 1);
    assert_eq!(report.released_lists, 0);

    let left = memory.lrange(&processing, 0, -1).await.unwrap();
    assert_eq!(left, vec![fetched.to_json().unwrap()]);
    assert_eq!(memory.smembers(&keys.processing_queues()).await.unwrap(), vec![processing]);
    assert_eq!(memory.smembers(&keys.consumers(&queue)).await.unwrap(), vec!["slow"]);
}

#[tokio::test]
async fn test_sweep_keeps_heartbeat_refreshed_after_read() {
    let memory = MemoryStore::new();
    let keys = KeySchema::default();
    let index = keys.heartbeat_index();
    let late = instance_key(InstanceKind::Consumer, "late");
    let gone = instance_key(InstanceKind::Consumer, "gone");
    memory.hset(&index, &late, &stale_record()).await.unwrap();
    memory.hset(&index, &gone, &stale_record()).await.unwrap();

    let refreshed = fresh_record();
    let faults = Arc::new(Faults::default());
    faults.interleaved.lock().unwrap().push(Interleave::SetAfterHashRead {
        key: index.clone(),
        field: late.clone(),
        value: refreshed.clone(),
    });
    let store: Arc<dyn Store> = Arc::new(FaultyStore {
        inner: memory.connect().await.unwrap(),
        faults,
    });

    let report = sweeper_on(store, &keys).sweep(now_millis()).await.unwrap();
    assert_eq!(report.removed_heartbeats, 1);
    assert_eq!(memory.hget(&index, &late).await.unwrap(), Some(refreshed));
    assert!(memory.hget(&index, &gone).await.unwrap().is_none());
}
