//! Consumer runtime.
//!
//! A [`Consumer`] registers handlers per queue with [`Consumer::consume`]
//! and starts with [`Consumer::run`]. Running means:
//!
//! - a heartbeat record refreshed every `heartbeat_interval`
//! - one fetch loop per registered queue, one message in flight per loop
//! - a scheduler tick promoting due scheduled messages
//! - a GC sweep recovering messages of consumers that went offline
//!
//! All of them live in one task group and stop together on
//! [`Consumer::shutdown`].

pub mod handler;
mod worker;

use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt};
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info, warn};
use uuid::Uuid;

pub use self::handler::{HandlerError, MessageHandler};
use self::worker::{QueueWorker, Registration};
use crate::broker::Broker;
use crate::config::BrokerConfig;
use crate::error::{BrokerError, ValidationError};
use crate::events::{BrokerEvent, EventBus};
use crate::gc::GcSweeper;
use crate::heartbeat::{Heartbeat, HeartbeatRegistry};
use crate::keys::{InstanceKind, KeySchema, QueueRef};
use crate::lifecycle::{PowerManager, PowerState, Steps};
use crate::metrics::{MessageRate, RateSnapshot};
use crate::store::{RedisConnector, Store, StoreConnector, Transaction};
use crate::ticker::TaskGroup;

/// Pulls messages from registered queues and runs their handlers.
#[derive(Clone)]
pub struct Consumer {
    inner: Arc<Inner>,
}

struct Inner {
    id: String,
    config: BrokerConfig,
    keys: KeySchema,
    connector: Arc<dyn StoreConnector>,
    power: PowerManager,
    events: EventBus,
    state: Mutex<State>,
}

#[derive(Default)]
struct State {
    registrations: Vec<Registration>,
    runtime: Option<Runtime>,
}

/// Resources owned while running, built up by the startup steps.
struct Runtime {
    id: String,
    config: BrokerConfig,
    keys: KeySchema,
    events: EventBus,
    connector: Arc<dyn StoreConnector>,
    registrations: Vec<Registration>,
    store: Option<Arc<dyn Store>>,
    heartbeat: Option<Heartbeat>,
    rate: Option<Arc<MessageRate>>,
    broker: Option<Arc<Broker>>,
    tasks: TaskGroup,
    final_rate: Option<RateSnapshot>,
}

impl Consumer {
    /// Creates a consumer that opens its store connection through `connector`.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
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
                state: Mutex::new(State::default()),
            }),
        })
    }

    /// Creates a consumer connecting to `config.redis_url`.
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

    pub fn is_running(&self) -> bool {
        self.inner.power.is_up()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BrokerEvent> {
        self.inner.events.subscribe()
    }

    /// Registers `handler` for `queue` (`name` or `ns:name`).
    ///
    /// With `use_priority` the queue's priority set is consumed instead of
    /// its plain list. Registering while running starts the fetch loop
    /// immediately.
    ///
    /// # Errors
    ///
    /// Returns a validation error for an invalid queue name or a queue that
    /// already has a handler.
    pub async fn consume<H>(&self, queue: &str, use_priority: bool, handler: H) -> Result<(), BrokerError>
    where
        H: MessageHandler,
    {
        let queue = QueueRef::parse_in(queue, &self.inner.config.namespace)?;
        let registration = Registration {
            queue: queue.clone(),
            use_priority,
            handler: Arc::new(handler),
        };

        let mut state = self.inner.state.lock().await;
        if state.registrations.iter().any(|r| r.queue == queue) {
            return Err(ValidationError::HandlerAlreadyRegistered(queue.to_string()).into());
        }
        state.registrations.push(registration.clone());
        if let Some(runtime) = state.runtime.as_mut() {
            runtime.register_queue(&registration).await?;
            runtime.spawn_fetch_loop(registration.clone())?;
            runtime.registrations.push(registration);
        }
        info!(consumer_id = %self.inner.id, queue = %queue, use_priority, "Handler registered");
        Ok(())
    }

    /// Queues with a registered handler.
    pub async fn queues(&self) -> Vec<QueueRef> {
        let state = self.inner.state.lock().await;
        state.registrations.iter().map(|r| r.queue.clone()).collect()
    }

    /// Starts heartbeat, fetch loops and background workers.
    ///
    /// On failure everything started so far is released and the consumer
    /// ends up down again.
    pub async fn run(&self) -> Result<(), BrokerError> {
        let inner = &self.inner;
        let mut state = inner.state.lock().await;
        inner.power.going_up()?;
        inner.events.emit(BrokerEvent::GoingUp);
        info!(consumer_id = %inner.id, "Consumer starting");

        let mut runtime = Runtime {
            id: inner.id.clone(),
            config: inner.config.clone(),
            keys: inner.keys.clone(),
            events: inner.events.clone(),
            connector: inner.connector.clone(),
            registrations: state.registrations.clone(),
            store: None,
            heartbeat: None,
            rate: None,
            broker: None,
            tasks: TaskGroup::new(),
            final_rate: None,
        };

        let started = Steps::new("startup")
            .step("store", connect_store)
            .step("heartbeat", start_heartbeat)
            .step("queues", register_queues)
            .step("rate", start_rate)
            .step("workers", start_workers)
            .run(&mut runtime)
            .await;

        if let Err(e) = started {
            teardown_steps().run_all(&mut runtime).await;
            inner.power.going_down()?;
            inner.power.down()?;
            inner.events.emit(BrokerEvent::Down);
            return Err(e);
        }

        state.runtime = Some(runtime);
        inner.power.up()?;
        inner.events.emit(BrokerEvent::Up);
        info!(consumer_id = %inner.id, "Consumer up");
        Ok(())
    }

    /// Stops everything started by [`Consumer::run`].
    ///
    /// Teardown is best effort: every step runs even if an earlier one
    /// failed. Returns the final message rate.
    pub async fn shutdown(&self) -> Result<Option<RateSnapshot>, BrokerError> {
        let inner = &self.inner;
        if inner.power.is_going_up() {
            inner.power.settled().await;
        }
        inner.power.going_down()?;
        inner.events.emit(BrokerEvent::GoingDown);
        info!(consumer_id = %inner.id, "Consumer shutting down");

        let runtime = inner.state.lock().await.runtime.take();
        let mut final_rate = None;
        if let Some(mut runtime) = runtime {
            let failures = teardown_steps().run_all(&mut runtime).await;
            if !failures.is_empty() {
                warn!(consumer_id = %inner.id, failed_steps = failures.len(), "Teardown finished with errors");
            }
            final_rate = runtime.final_rate;
        }

        inner.power.down()?;
        inner.events.emit(BrokerEvent::Down);
        info!(consumer_id = %inner.id, "Consumer down");
        Ok(final_rate)
    }
}

fn teardown_steps() -> Steps<Runtime> {
    Steps::new("teardown")
        .step("heartbeat", stop_heartbeat)
        .step("broker", stop_broker)
        .step("rate", stop_rate)
        .step("store", release_store)
}

impl Runtime {
    fn store(&self) -> Result<Arc<dyn Store>, BrokerError> {
        self.store.clone().ok_or(BrokerError::Uninitialized("store"))
    }

    fn broker(&self) -> Result<Arc<Broker>, BrokerError> {
        self.broker.clone().ok_or(BrokerError::Uninitialized("broker"))
    }

    /// Records the queue, this consumer and its processing list in the
    /// global registries.
    async fn register_queue(&self, registration: &Registration) -> Result<(), BrokerError> {
        let queue = &registration.queue;
        let processing = self.keys.processing(queue, &self.id);
        let mut tx = Transaction::new();
        tx.sadd(self.keys.queues(), queue.to_string())
            .sadd(self.keys.consumers(queue), self.id.as_str())
            .sadd(self.keys.processing_queues(), processing);
        self.store()?.exec(tx).await?;
        debug!(consumer_id = %self.id, queue = %queue, "Queue registered");
        Ok(())
    }

    fn spawn_fetch_loop(&mut self, registration: Registration) -> Result<(), BrokerError> {
        let name = format!("fetch:{}", registration.queue);
        let worker = QueueWorker::new(
            self.id.clone(),
            registration,
            self.broker()?,
            self.events.clone(),
            self.tasks.shutdown_receiver(),
        );
        self.tasks.spawn(name, worker.run());
        Ok(())
    }

    /// Drops this consumer's empty processing lists from the registries.
    ///
    /// Lists still holding a message are left for the GC sweep.
    async fn unregister_queues(&self) -> Result<(), BrokerError> {
        let store = self.store()?;
        for registration in &self.registrations {
            let queue = &registration.queue;
            let processing = self.keys.processing(queue, &self.id);
            let mut tx = Transaction::guarded_empty_list(processing.as_str());
            tx.del(processing.as_str())
                .srem(self.keys.processing_queues(), processing.as_str())
                .srem(self.keys.consumers(queue), self.id.as_str());
            if !store.exec(tx).await? {
                warn!(consumer_id = %self.id, queue = %queue, "Leaving in-flight message for recovery");
            }
        }
        Ok(())
    }
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
            InstanceKind::Consumer,
            &rt.id,
            rt.config.heartbeat_interval,
        )
        .await?;
        rt.heartbeat = Some(heartbeat);
        Ok(())
    }
    .boxed()
}

fn register_queues(rt: &mut Runtime) -> BoxFuture<'_, Result<(), BrokerError>> {
    async move {
        for registration in &rt.registrations {
            rt.register_queue(registration).await?;
        }
        Ok(())
    }
    .boxed()
}

fn start_rate(rt: &mut Runtime) -> BoxFuture<'_, Result<(), BrokerError>> {
    async move {
        let rate = Arc::new(MessageRate::new(rt.config.metrics_enabled));
        let broker = Broker::new(
            rt.store()?,
            rt.keys.clone(),
            rt.config.clone(),
            rt.events.clone(),
            rate.clone(),
        );
        rt.rate = Some(rate);
        rt.broker = Some(Arc::new(broker));
        Ok(())
    }
    .boxed()
}

fn start_workers(rt: &mut Runtime) -> BoxFuture<'_, Result<(), BrokerError>> {
    async move {
        for registration in rt.registrations.clone() {
            rt.spawn_fetch_loop(registration)?;
        }

        let broker = rt.broker()?;
        let store = rt.store()?;
        rt.tasks
            .spawn_ticker(broker.scheduler(), rt.config.scheduler_interval);

        let registry = HeartbeatRegistry::new(
            store.clone(),
            rt.keys.clone(),
            rt.config.heartbeat_freshness,
        );
        let sweeper = GcSweeper::new(store, rt.keys.clone(), registry, broker.collector());
        rt.tasks.spawn_ticker(Arc::new(sweeper), rt.config.gc_interval);
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

fn stop_broker(rt: &mut Runtime) -> BoxFuture<'_, Result<(), BrokerError>> {
    async move {
        let stopped = rt.tasks.shutdown(rt.config.shutdown_timeout).await;
        let unregistered = if rt.store.is_some() {
            rt.unregister_queues().await
        } else {
            Ok(())
        };
        rt.broker = None;
        stopped.and(unregistered)
    }
    .boxed()
}

fn stop_rate(rt: &mut Runtime) -> BoxFuture<'_, Result<(), BrokerError>> {
    async move {
        if let Some(rate) = rt.rate.take() {
            let snapshot = rate.stop();
            info!(
                consumer_id = %rt.id,
                acknowledged = snapshot.acknowledged,
                unacknowledged = snapshot.unacknowledged,
                dead_lettered = snapshot.dead_lettered,
                "Message rate stopped"
            );
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
    use crate::message::Message;
    use crate::store::MemoryStore;
    use std::time::Duration;

    fn config() -> BrokerConfig {
        BrokerConfig::default()
            .with_metrics(false)
            .with_poll_interval(Duration::from_millis(10))
            .with_heartbeat_interval(Duration::from_millis(50))
            .with_shutdown_timeout(Duration::from_secs(2))
    }

    async fn ok(_message: Message) -> Result<(), HandlerError> {
        Ok(())
    }

    #[tokio::test]
    async fn test_duplicate_registration_rejected() {
        let consumer = Consumer::new(config(), Arc::new(MemoryStore::new())).unwrap();
        consumer.consume("orders", false, ok).await.unwrap();
        let err = consumer.consume("default:orders", true, ok).await.unwrap_err();
        assert!(matches!(
            err,
            BrokerError::Validation(ValidationError::HandlerAlreadyRegistered(_))
        ));
        assert!(consumer.consume("Not Valid", false, ok).await.is_err());
    }

    #[tokio::test]
    async fn test_run_and_shutdown_lifecycle() {
        let memory = Arc::new(MemoryStore::new());
        let consumer = Consumer::new(config(), memory.clone()).unwrap();
        let mut events = consumer.subscribe();
        consumer.consume("ns1:q", false, ok).await.unwrap();

        consumer.run().await.unwrap();
        assert!(consumer.is_running());
        assert!(consumer.run().await.is_err());

        let keys = KeySchema::default();
        let queue = QueueRef::parse("ns1:q").unwrap();
        let processing = keys.processing(&queue, consumer.id());
        assert!(memory
            .smembers(&keys.processing_queues())
            .await
            .unwrap()
            .contains(&processing));
        assert_eq!(memory.hgetall(&keys.heartbeat_index()).await.unwrap().len(), 1);

        consumer.shutdown().await.unwrap();
        assert_eq!(consumer.state(), PowerState::Down);
        assert!(memory.smembers(&keys.processing_queues()).await.unwrap().is_empty());
        assert!(memory.smembers(&keys.consumers(&queue)).await.unwrap().is_empty());
        assert!(memory.hgetall(&keys.heartbeat_index()).await.unwrap().is_empty());

        assert_eq!(events.recv().await.unwrap(), BrokerEvent::GoingUp);
        let mut seen = Vec::new();
        while let Ok(event) = events.try_recv() {
            seen.push(event);
        }
        assert!(seen.contains(&BrokerEvent::Up));
        assert_eq!(seen.last(), Some(&BrokerEvent::Down));
    }

    #[tokio::test]
    async fn test_shutdown_when_down_fails() {
        let consumer = Consumer::new(config(), Arc::new(MemoryStore::new())).unwrap();
        assert!(matches!(
            consumer.shutdown().await,
            Err(BrokerError::Lifecycle(_))
        ));
    }
}
