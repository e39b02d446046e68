//! Integration tests against a real Redis server.
//!
//! Run with: REDIS_URL=redis://localhost:6379 cargo test --test redis_integration -- --ignored

use std::time::Duration;

use tokio::sync::mpsc;
use uuid::Uuid;

use redis_mq::store::{Store, StoreConnector, Transaction};
use redis_mq::{
    BrokerConfig, Consumer, HandlerError, KeySchema, Message, MessageDefaults, Producer,
    QueueManager, RedisConnector,
};

fn redis_url() -> String {
    std::env::var("REDIS_URL").expect("REDIS_URL environment variable must be set for integration tests")
}

/// Config with a key prefix no other test run shares.
fn isolated_config() -> BrokerConfig {
    let prefix = format!("rmqtest-{}", Uuid::new_v4().simple());
    BrokerConfig::default()
        .with_redis_url(redis_url())
        .with_key_prefix(prefix)
        .with_metrics(false)
        .with_poll_interval(Duration::from_millis(20))
        .with_scheduler_interval(Duration::from_millis(50))
        .with_gc_interval(Duration::from_millis(50))
        .with_heartbeat_interval(Duration::from_millis(100))
        .with_heartbeat_freshness(Duration::from_secs(1))
        .with_message_defaults(MessageDefaults {
            retry_delay: Some(0),
            ..MessageDefaults::default()
        })
}

#[tokio::test]
#[ignore] // Run with: cargo test --test redis_integration -- --ignored
async fn test_guarded_transaction_applies_once() {
    let config = isolated_config();
    let store = RedisConnector::new(config.redis_url.clone())
        .connect()
        .await
        .expect("should connect");
    let source = format!("{}:guard-src", config.key_prefix);
    let target = format!("{}:guard-dst", config.key_prefix);
    store.lpush(&source, "payload").await.unwrap();

    let mut first = Transaction::guarded_list(source.as_str(), "payload");
    first.lpush(target.as_str(), "payload");
    let mut second = Transaction::guarded_list(source.as_str(), "payload");
    second.lpush(target.as_str(), "payload");

    assert!(store.exec(first).await.unwrap());
    assert!(!store.exec(second).await.unwrap());
    assert_eq!(store.llen(&source).await.unwrap(), 0);
    assert_eq!(store.llen(&target).await.unwrap(), 1);

    store.del(&target).await.unwrap();
    store.quit().await.unwrap();
}

#[tokio::test]
#[ignore] // Run with: cargo test --test redis_integration -- --ignored
async fn test_conditional_release_and_heartbeat_removal() {
    let config = isolated_config();
    let store = RedisConnector::new(config.redis_url.clone())
        .connect()
        .await
        .expect("should connect");
    let list = format!("{}:busy", config.key_prefix);
    let registry = format!("{}:lists", config.key_prefix);
    let beats = format!("{}:beats", config.key_prefix);
    store.lpush(&list, "payload").await.unwrap();
    store.sadd(&registry, &list).await.unwrap();

    let mut release = Transaction::guarded_empty_list(list.as_str());
    release.del(list.as_str()).srem(registry.as_str(), list.as_str());
    assert!(!store.exec(release.clone()).await.unwrap());
    assert_eq!(store.smembers(&registry).await.unwrap(), vec![list.clone()]);

    store.del(&list).await.unwrap();
    assert!(store.exec(release).await.unwrap());
    assert!(store.smembers(&registry).await.unwrap().is_empty());

    store.hset(&beats, "consumer:a", "fresh").await.unwrap();
    let mut remove = Transaction::guarded_hash_field(beats.as_str(), "consumer:a", "stale");
    remove.hdel(beats.as_str(), "consumer:a");
    assert!(!store.exec(remove).await.unwrap());
    let mut remove = Transaction::guarded_hash_field(beats.as_str(), "consumer:a", "fresh");
    remove.hdel(beats.as_str(), "consumer:a");
    assert!(store.exec(remove).await.unwrap());
    assert!(store.hget(&beats, "consumer:a").await.unwrap().is_none());

    store.quit().await.unwrap();
}

#[tokio::test]
#[ignore] // Run with: cargo test --test redis_integration -- --ignored
async fn test_produce_and_consume_round_trip() {
    let config = isolated_config();
    let producer = Producer::from_config(config.clone()).unwrap();
    producer.run().await.unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    let consumer = Consumer::from_config(config.clone()).unwrap();
    consumer
        .consume("it:jobs", false, move |message: Message| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(message);
                Ok::<(), HandlerError>(())
            }
        })
        .await
        .unwrap();
    consumer.run().await.unwrap();

    let sent = producer
        .produce_to("it:jobs", Message::new().with_body(serde_json::json!({"n": 1})))
        .await
        .unwrap();
    let received = tokio::time::timeout(Duration::from_secs(10), rx.recv())
        .await
        .expect("message should be delivered")
        .unwrap();
    assert_eq!(received.id(), sent.id());
    assert_eq!(received.body(), &serde_json::json!({"n": 1}));

    consumer.shutdown().await.unwrap();
    producer.shutdown().await.unwrap();

    let store = RedisConnector::new(config.redis_url.clone())
        .connect()
        .await
        .unwrap();
    let keys = KeySchema::new(&config.key_prefix).unwrap();
    let manager = QueueManager::new(store.clone(), keys, config.heartbeat_freshness);
    let queues = manager.list_queues().await.unwrap();
    assert_eq!(queues.len(), 1);
    for queue in queues {
        manager.delete_queue(&queue).await.unwrap();
    }
    assert!(manager.list_queues().await.unwrap().is_empty());

    store.quit().await.unwrap();
}
