//! Producer runtime.
//!
//! A [`Producer`] publishes messages once it is up. Calls made while it is
//! still starting wait for startup to finish; calls made while it is down
//! fail with `BrokerError::NotRunning`.

use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt};
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::broker::Broker;
use crate::config::BrokerConfig;
use crate::error::BrokerError;
use crate::events::{BrokerEvent, EventBus};
use crate::heartbeat::Heartbeat;
use crate::keys::{InstanceKind, KeySchema, QueueRef};
use crate::lifecycle::{PowerManager, PowerState, Steps};
use crate::message::{Message, Priority};
use crate::metrics::{MessageRate, RateSnapshot};
use crate::store::{RedisConnector, Store, StoreConnector};

/// Publishes messages into queues.
#[derive(Clone)]
pub struct Producer {
    inner: Arc<Inner>,
}

struct Inner {
    id: String,
    config: BrokerConfig,
    keys: KeySchema,
    connector: Arc<dyn StoreConnector>,
    power: PowerManager,
    events: EventBus,
    runtime: Mutex<Option<Runtime>>,
}

struct Runtime {
    id: String,
    config: BrokerConfig,
    keys: KeySchema,
    events: EventBus,
    connector: Arc<dyn StoreConnector>,
    store: Option<Arc<dyn Store>>,
    heartbeat: Option<Heartbeat>,
    rate: Option<Arc<MessageRate>>,
    broker: Option<Arc<Broker>>,
    final_rate: Option<RateSnapshot>,
}

impl Runtime {
    fn store(&self) -> Result<Arc<dyn Store>, BrokerError> {
        self.store.clone().ok_or(BrokerError::Uninitialized("store"))
    }
}

impl Producer {
    /// Creates a producer that opens its store connection through `connector`.
    pub fn new(config: BrokerConfig, connector: Arc<dyn StoreConnector>) -> Result<Self, BrokerError> {
        config.validate()?;
        let keys = KeySchema::new(&config.key_prefix)?;
        Ok(Self {
            inner: Arc::new(Inner {
                id: Uuid::new_v4().to_string(),
                config,
                keys,
                connector,
                power: PowerManager::new(),
                events: EventBus::new(),
                runtime: Mutex::new(None),
            }),
        })
    }

    /// Creates a producer connecting to `config.redis_url`.
    pub fn from_config(config: BrokerConfig) -> Result<Self, BrokerError> {
        let connector = Arc::new(RedisConnector::new(config.redis_url.clone()));
        Self::new(config, connector)
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn state(&self) -> PowerState {
        self.inner.power.state()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BrokerEvent> {
        self.inner.events.subscribe()
    }

    /// Connects, starts the heartbeat and the message rate.
    pub async fn run(&self) -> Result<(), BrokerError> {
        let inner = &self.inner;
        inner.power.going_up()?;
        inner.events.emit(BrokerEvent::GoingUp);

        let mut runtime = Runtime {
            id: inner.id.clone(),
            config: inner.config.clone(),
            keys: inner.keys.clone(),
            events: inner.events.clone(),
            connector: inner.connector.clone(),
            store: None,
            heartbeat: None,
            rate: None,
            broker: None,
            final_rate: None,
        };

        let started = Steps::new("startup")
            .step("store", connect_store)
            .step("heartbeat", start_heartbeat)
            .step("rate", start_rate)
            .run(&mut runtime)
            .await;

        if let Err(e) = started {
            teardown_steps().run_all(&mut runtime).await;
            inner.power.going_down()?;
            inner.power.down()?;
            inner.events.emit(BrokerEvent::Down);
            return Err(e);
        }

        *inner.runtime.lock().await = Some(runtime);
        inner.power.up()?;
        inner.events.emit(BrokerEvent::Up);
        info!(producer_id = %inner.id, "Producer up");
        Ok(())
    }

    /// Releases everything started by [`Producer::run`] and returns the
    /// final message rate.
    pub async fn shutdown(&self) -> Result<Option<RateSnapshot>, BrokerError> {
        let inner = &self.inner;
        if inner.power.is_going_up() {
            inner.power.settled().await;
        }
        inner.power.going_down()?;
        inner.events.emit(BrokerEvent::GoingDown);

        let runtime = inner.runtime.lock().await.take();
        let mut final_rate = None;
        if let Some(mut runtime) = runtime {
            let failures = teardown_steps().run_all(&mut runtime).await;
            if !failures.is_empty() {
                warn!(producer_id = %inner.id, failed_steps = failures.len(), "Teardown finished with errors");
            }
            final_rate = runtime.final_rate;
        }

        inner.power.down()?;
        inner.events.emit(BrokerEvent::Down);
        info!(producer_id = %inner.id, "Producer down");
        Ok(final_rate)
    }

    /// Publishes `message` to the queue it carries.
    ///
    /// The message gets fresh metadata (a new id) and is either scheduled
    /// or made ready for delivery. Returns the message as stored.
    ///
    /// # Errors
    ///
    /// Fails with `NotRunning` unless the producer is up or going up, and
    /// with `MissingQueue` if no queue is set.
    pub async fn produce(&self, mut message: Message) -> Result<Message, BrokerError> {
        let inner = &self.inner;
        let state = match inner.power.state() {
            PowerState::GoingUp => inner.power.settled().await,
            state => state,
        };
        if state != PowerState::Up {
            return Err(BrokerError::NotRunning {
                id: inner.id.clone(),
            });
        }

        let (broker, rate) = {
            let runtime = inner.runtime.lock().await;
            let runtime = runtime.as_ref().ok_or_else(|| BrokerError::NotRunning {
                id: inner.id.clone(),
            })?;
            let broker = runtime.broker.clone().ok_or(BrokerError::Uninitialized("broker"))?;
            let rate = runtime.rate.clone().ok_or(BrokerError::Uninitialized("rate"))?;
            (broker, rate)
        };

        let queue = message.required_queue()?.clone();
        message.reset();
        if inner.config.priority_queuing {
            if message.priority().is_none() {
                message.set_priority(Some(Priority::Normal));
            }
        } else {
            message.set_priority(None);
        }

        let scheduled = broker.produce(&mut message).await?;
        let id = message.required_id()?;
        inner.events.emit(BrokerEvent::MessageProduced {
            id,
            queue: queue.clone(),
        });
        rate.increment_input_slot(&queue);
        debug!(producer_id = %inner.id, message_id = %id, queue = %queue, scheduled, "Message produced");
        Ok(message)
    }

    /// Publishes `message` to `queue` (`name` or `ns:name`).
    pub async fn produce_to(&self, queue: &str, message: Message) -> Result<Message, BrokerError> {
        let queue = QueueRef::parse_in(queue, &self.inner.config.namespace)?;
        self.produce(message.with_queue(queue)).await
    }
}

fn teardown_steps() -> Steps<Runtime> {
    Steps::new("teardown")
        .step("heartbeat", stop_heartbeat)
        .step("rate", stop_rate)
        .step("store", release_store)
}

fn connect_store(rt: &mut Runtime) -> BoxFuture<'_, Result<(), BrokerError>> {
    async move {
        rt.store = Some(rt.connector.connect().await?);
        Ok(())
    }
    .boxed()
}

fn start_heartbeat(rt: &mut Runtime) -> BoxFuture<'_, Result<(), BrokerError>> {
    async move {
        let heartbeat = Heartbeat::start(
            rt.store()?,
            &rt.keys,
            InstanceKind::Producer,
            &rt.id,
            rt.config.heartbeat_interval,
        )
        .await?;
        rt.heartbeat = Some(heartbeat);
        Ok(())
    }
    .boxed()
}

fn start_rate(rt: &mut Runtime) -> BoxFuture<'_, Result<(), BrokerError>> {
    async move {
        let rate = Arc::new(MessageRate::new(rt.config.metrics_enabled));
        rt.broker = Some(Arc::new(Broker::new(
            rt.store()?,
            rt.keys.clone(),
            rt.config.clone(),
            rt.events.clone(),
            rate.clone(),
        )));
        rt.rate = Some(rate);
        Ok(())
    }
    .boxed()
}

fn stop_heartbeat(rt: &mut Runtime) -> BoxFuture<'_, Result<(), BrokerError>> {
    async move {
        if let Some(heartbeat) = rt.heartbeat.take() {
            heartbeat.stop().await?;
        }
        Ok(())
    }
    .boxed()
}

fn stop_rate(rt: &mut Runtime) -> BoxFuture<'_, Result<(), BrokerError>> {
    async move {
        rt.broker = None;
        if let Some(rate) = rt.rate.take() {
            let snapshot = rate.stop();
            info!(producer_id = %rt.id, produced = snapshot.input, "Message rate stopped");
            rt.final_rate = Some(snapshot);
        }
        Ok(())
    }
    .boxed()
}

fn release_store(rt: &mut Runtime) -> BoxFuture<'_, Result<(), BrokerError>> {
    async move {
        if let Some(store) = rt.store.take() {
            store.quit().await?;
        }
        Ok(())
    }
    .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn producer(memory: Arc<MemoryStore>, priority_queuing: bool) -> Producer {
        let config = BrokerConfig::default()
            .with_metrics(false)
            .with_priority_queuing(priority_queuing);
        Producer::new(config, memory).unwrap()
    }

    #[tokio::test]
    async fn test_produce_requires_running() {
        let producer = producer(Arc::new(MemoryStore::new()), false);
        let err = producer
            .produce_to("q", Message::new())
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::NotRunning { .. }));
    }

    #[tokio::test]
    async fn test_produce_assigns_identity_and_routes() {
        let memory = Arc::new(MemoryStore::new());
        let producer = producer(memory.clone(), false);
        producer.run().await.unwrap();
        let mut events = producer.subscribe();

        let sent = producer
            .produce_to("ns1:q", Message::new().with_body("hi").with_priority(Priority::High))
            .await
            .unwrap();
        let id = sent.required_id().unwrap();
        // Priority is cleared when priority queuing is off.
        assert_eq!(sent.priority(), None);

        let keys = KeySchema::default();
        let queue = QueueRef::parse("ns1:q").unwrap();
        assert_eq!(memory.llen(&keys.pending(&queue)).await.unwrap(), 1);
        assert_eq!(
            events.recv().await.unwrap(),
            BrokerEvent::MessageProduced { id, queue }
        );

        let snapshot = producer.shutdown().await.unwrap().unwrap();
        assert_eq!(snapshot.input, 1);
        assert!(memory.hgetall(&keys.heartbeat_index()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_priority_queuing_defaults_to_normal() {
        let memory = Arc::new(MemoryStore::new());
        let producer = producer(memory.clone(), true);
        producer.run().await.unwrap();

        let sent = producer.produce_to("q", Message::new()).await.unwrap();
        assert_eq!(sent.priority(), Some(Priority::Normal));

        let keys = KeySchema::default();
        let queue = QueueRef::parse("default:q").unwrap();
        assert_eq!(memory.zcard(&keys.pending_priority(&queue)).await.unwrap(), 1);
        producer.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_produce_waits_for_startup() {
        let memory = Arc::new(MemoryStore::new());
        let producer = producer(memory.clone(), false);

        let runner = producer.clone();
        let (started, sent) = tokio::join!(runner.run(), async {
            tokio::task::yield_now().await;
            producer.produce_to("q", Message::new()).await
        });
        started.unwrap();
        assert!(sent.unwrap().id().is_some());
        producer.shutdown().await.unwrap();
    }
}
