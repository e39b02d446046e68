//! Fetch loop of one consumed queue.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use super::handler::MessageHandler;
use crate::broker::{Broker, Delivery};
use crate::config::MessageDefaults;
use crate::error::BrokerError;
use crate::events::{BrokerEvent, EventBus, UnacknowledgedCause};
use crate::keys::QueueRef;
use crate::message::{now_millis, Message};
use crate::metrics::MetricsCollector;
use crate::store::Transaction;

/// Bounds of the wait between attempts to settle a message.
const MIN_SETTLE_BACKOFF: Duration = Duration::from_millis(10);
const MAX_SETTLE_BACKOFF: Duration = Duration::from_secs(5);

/// How a fetched message leaves the processing list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Settlement {
    Acknowledge,
    Unacknowledge(UnacknowledgedCause),
    /// Decodes but lacks the metadata needed to route it.
    DeadLetterRaw,
}

/// A queue registered through `Consumer::consume`.
#[derive(Clone)]
pub(crate) struct Registration {
    pub queue: QueueRef,
    pub use_priority: bool,
    pub handler: Arc<dyn MessageHandler>,
}

/// Pulls one message at a time from a queue and runs its handler.
pub(crate) struct QueueWorker {
    consumer_id: String,
    registration: Registration,
    processing_key: String,
    broker: Arc<Broker>,
    events: EventBus,
    defaults: MessageDefaults,
    poll_interval: Duration,
    metrics: Option<MetricsCollector>,
    shutdown_rx: broadcast::Receiver<()>,
}

impl QueueWorker {
    pub(crate) fn new(
        consumer_id: String,
        registration: Registration,
        broker: Arc<Broker>,
        events: EventBus,
        shutdown_rx: broadcast::Receiver<()>,
    ) -> Self {
        let config = broker.config();
        let processing_key = broker
            .keys()
            .processing(&registration.queue, &consumer_id);
        Self {
            defaults: config.message,
            poll_interval: config.poll_interval,
            metrics: config.metrics_enabled.then(MetricsCollector::new),
            consumer_id,
            registration,
            processing_key,
            broker,
            events,
            shutdown_rx,
        }
    }

    /// Main fetch loop.
    ///
    /// Runs until the shutdown signal is received. An in-flight handler is
    /// always awaited before the signal is checked again, and its message
    /// is settled before the next fetch. Store failures while settling are
    /// retried with backoff; on shutdown the entry stays in the processing
    /// list for the GC sweep.
    pub(crate) async fn run(mut self) {
        let queue = self.registration.queue.clone();
        info!(consumer_id = %self.consumer_id, queue = %queue, "Fetch loop started");
        let mut idle = false;
        // Entries left behind by an earlier run or a failed fetch.
        let mut stranded = true;

        loop {
            match self.shutdown_rx.try_recv() {
                Ok(()) | Err(broadcast::error::TryRecvError::Closed) => break,
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(broadcast::error::TryRecvError::Empty) => {}
            }

            if stranded {
                match self.reclaim().await {
                    Ok(()) => stranded = false,
                    Err(e) => {
                        error!(
                            consumer_id = %self.consumer_id,
                            queue = %queue,
                            error = %e,
                            "Failed to reclaim processing list"
                        );
                        if !self.pause(self.poll_interval).await {
                            break;
                        }
                        continue;
                    }
                }
            }

            let fetched = self
                .broker
                .fetch(
                    &queue,
                    &self.processing_key,
                    self.registration.use_priority,
                )
                .await;

            match fetched {
                Ok(Some(delivery)) => {
                    idle = false;
                    if let Err(e) = self.register_processing().await {
                        warn!(
                            consumer_id = %self.consumer_id,
                            queue = %queue,
                            error = %e,
                            "Failed to refresh processing list registration"
                        );
                    }
                    let settlement = self.process(&delivery).await;
                    if !self.settle(&delivery, settlement).await {
                        break;
                    }
                    continue;
                }
                Ok(None) => {
                    if !idle {
                        idle = true;
                        self.events.emit(BrokerEvent::Idle {
                            queue: queue.clone(),
                        });
                        debug!(consumer_id = %self.consumer_id, queue = %queue, "Queue idle");
                    }
                }
                Err(e) => {
                    // The move may have happened before the failure.
                    stranded = true;
                    error!(
                        consumer_id = %self.consumer_id,
                        queue = %queue,
                        error = %e,
                        "Failed to fetch message"
                    );
                }
            }

            if !self.pause(self.poll_interval).await {
                break;
            }
        }

        info!(consumer_id = %self.consumer_id, queue = %queue, "Fetch loop stopped");
    }

    /// Sleeps for `duration`. Returns false if shutdown was signalled first.
    async fn pause(&mut self, duration: Duration) -> bool {
        tokio::select! {
            _ = self.shutdown_rx.recv() => false,
            _ = tokio::time::sleep(duration) => true,
        }
    }

    /// Collects whatever is left in this loop's processing list.
    async fn reclaim(&self) -> Result<(), BrokerError> {
        let collected = self
            .broker
            .collector()
            .recover_list(
                &self.registration.queue,
                &self.processing_key,
                UnacknowledgedCause::Recovery,
            )
            .await?;
        if collected > 0 {
            info!(
                consumer_id = %self.consumer_id,
                queue = %self.registration.queue,
                collected = collected,
                "Reclaimed stranded messages"
            );
        }
        Ok(())
    }

    /// Re-adds the processing list and this consumer to the registries, in
    /// case a sweep released them while this consumer looked offline.
    async fn register_processing(&self) -> Result<(), BrokerError> {
        let keys = self.broker.keys();
        let mut tx = Transaction::new();
        tx.sadd(keys.processing_queues(), self.processing_key.as_str())
            .sadd(
                keys.consumers(&self.registration.queue),
                self.consumer_id.as_str(),
            );
        self.broker.store().exec(tx).await?;
        Ok(())
    }

    /// Runs the handler and decides how the delivery is settled.
    async fn process(&self, delivery: &Delivery) -> Settlement {
        let message = &delivery.message;
        let (id, queue) = match (message.required_id(), message.required_queue()) {
            (Ok(id), Ok(queue)) => (id, queue.clone()),
            _ => {
                warn!(
                    consumer_id = %self.consumer_id,
                    queue = %self.registration.queue,
                    "Fetched message without metadata"
                );
                return Settlement::DeadLetterRaw;
            }
        };
        self.events.emit(BrokerEvent::MessageReceived {
            id,
            queue: queue.clone(),
        });

        let ttl = self.defaults.ttl(message.ttl());
        if message.has_expired(ttl, now_millis()) {
            debug!(message_id = %id, queue = %queue, "Message expired before delivery");
            return Settlement::Unacknowledge(UnacknowledgedCause::TtlExpired);
        }

        let timeout_ms = self.defaults.consume_timeout(message.consume_timeout());
        if let Some(metrics) = &self.metrics {
            metrics.inc_in_progress();
        }
        let started = Instant::now();
        let result = self.invoke(message.clone(), timeout_ms).await;
        if let Some(metrics) = &self.metrics {
            metrics.dec_in_progress();
            metrics.observe_handler(&queue.to_string(), started.elapsed().as_secs_f64());
        }

        match result {
            Ok(()) => Settlement::Acknowledge,
            Err(cause) => {
                warn!(message_id = %id, queue = %queue, cause = %cause, "Message unacknowledged");
                Settlement::Unacknowledge(cause)
            }
        }
    }

    /// Applies `settlement`, retrying store failures with exponential
    /// backoff until it succeeds.
    ///
    /// Returns false if shutdown was signalled before that. The entry then
    /// stays in the processing list.
    async fn settle(&mut self, delivery: &Delivery, settlement: Settlement) -> bool {
        let mut backoff = self.poll_interval.max(MIN_SETTLE_BACKOFF);
        loop {
            match self.try_settle(delivery, settlement).await {
                Ok(()) => return true,
                Err(e) => {
                    warn!(
                        consumer_id = %self.consumer_id,
                        queue = %self.registration.queue,
                        settlement = ?settlement,
                        error = %e,
                        retry_in_ms = backoff.as_millis() as u64,
                        "Failed to settle message"
                    );
                    if !self.pause(backoff).await {
                        warn!(
                            consumer_id = %self.consumer_id,
                            queue = %self.registration.queue,
                            "Leaving unsettled message for recovery"
                        );
                        return false;
                    }
                    backoff = (backoff * 2).min(MAX_SETTLE_BACKOFF);
                }
            }
        }
    }

    async fn try_settle(
        &self,
        delivery: &Delivery,
        settlement: Settlement,
    ) -> Result<(), BrokerError> {
        match settlement {
            Settlement::Acknowledge => {
                self.broker.acknowledge(delivery).await?;
            }
            Settlement::Unacknowledge(cause) => {
                self.broker.unacknowledge(delivery, cause).await?;
            }
            Settlement::DeadLetterRaw => {
                self.broker
                    .collector()
                    .dead_letter_raw(
                        &self.registration.queue,
                        &delivery.payload,
                        &delivery.processing_key,
                    )
                    .await?;
            }
        }
        Ok(())
    }

    /// Runs the handler in its own task so a panic or a timeout cannot take
    /// the fetch loop down.
    async fn invoke(&self, message: Message, timeout_ms: u64) -> Result<(), UnacknowledgedCause> {
        let handler = self.registration.handler.clone();
        let mut task = tokio::spawn(async move { handler.handle(message).await });

        let joined = if timeout_ms > 0 {
            match tokio::time::timeout(Duration::from_millis(timeout_ms), &mut task).await {
                Ok(joined) => joined,
                Err(_) => {
                    task.abort();
                    return Err(UnacknowledgedCause::Timeout);
                }
            }
        } else {
            task.await
        };

        match joined {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                debug!(consumer_id = %self.consumer_id, error = %e, "Handler rejected message");
                Err(UnacknowledgedCause::Unacknowledged)
            }
            Err(e) => {
                error!(consumer_id = %self.consumer_id, error = %e, "Handler crashed");
                Err(UnacknowledgedCause::CaughtError)
            }
        }
    }
}
