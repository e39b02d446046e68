//! Failure recovery.
//!
//! [`MessageCollector`] decides the fate of a message that left a handler
//! without being acknowledged: drop it when expired or periodic, retry it
//! (immediately or after a delay) while attempts remain, dead-letter it
//! otherwise. Every decision is a single guarded transaction that removes
//! the message from its processing list, so racing collectors move a
//! message at most once.
//!
//! [`GcSweeper`] finds processing lists owned by consumers that stopped
//! heartbeating and runs their messages through the collector.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::broker::enqueue_op;
use crate::config::MessageDefaults;
use crate::error::BrokerError;
use crate::events::{BrokerEvent, EventBus, UnacknowledgedCause};
use crate::heartbeat::HeartbeatRegistry;
use crate::keys::{instance_key, InstanceKind, KeySchema, QueueRef};
use crate::message::{now_millis, Message};
use crate::metrics::{MessageRate, MetricsCollector};
use crate::scheduler::Scheduler;
use crate::store::{Store, Transaction};
use crate::ticker::TickTask;

/// What [`MessageCollector::collect_message`] did with a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectOutcome {
    /// TTL elapsed; removed.
    Expired,
    /// Periodic instance; removed, the schedule lives on.
    PeriodicDropped,
    /// Pushed back to its pending structure.
    Requeued,
    /// Handed to the scheduler for a delayed retry.
    Delayed,
    /// Retry threshold reached; moved to the dead-letter log.
    DeadLettered,
    /// Someone else already moved the message.
    Skipped,
}

/// Retry/expiry/dead-letter decisions for single messages.
pub struct MessageCollector {
    store: Arc<dyn Store>,
    keys: KeySchema,
    defaults: MessageDefaults,
    scheduler: Arc<Scheduler>,
    events: EventBus,
    rate: Arc<MessageRate>,
    metrics: Option<MetricsCollector>,
}

impl MessageCollector {
    pub fn new(
        store: Arc<dyn Store>,
        keys: KeySchema,
        defaults: MessageDefaults,
        scheduler: Arc<Scheduler>,
        events: EventBus,
        rate: Arc<MessageRate>,
        metrics_enabled: bool,
    ) -> Self {
        Self {
            store,
            keys,
            defaults,
            scheduler,
            events,
            rate,
            metrics: metrics_enabled.then(MetricsCollector::new),
        }
    }

    /// Moves `message`, stored as `payload` in `processing_key`, to its next
    /// state.
    ///
    /// `payload` must be the exact stored form; it is what the guard removes.
    pub async fn collect_message(
        &self,
        mut message: Message,
        payload: &str,
        processing_key: &str,
        cause: UnacknowledgedCause,
    ) -> Result<CollectOutcome, BrokerError> {
        let id = message.required_id()?;
        let queue = message.required_queue()?.clone();
        let now = now_millis();
        let mut tx = Transaction::guarded_list(processing_key, payload);

        let expired = cause == UnacknowledgedCause::TtlExpired
            || message.has_expired(self.defaults.ttl(message.ttl()), now);

        let outcome = if expired {
            CollectOutcome::Expired
        } else if message.is_periodic() {
            CollectOutcome::PeriodicDropped
        } else {
            let attempts = message.increment_attempts()?;
            let threshold = self.defaults.retry_threshold(message.retry_threshold());
            if attempts < threshold {
                let delay = self.defaults.retry_delay(message.retry_delay());
                if delay > 0 {
                    message.set_scheduled_delay(delay);
                    if self.scheduler.schedule(&mut message, &mut tx, now)? {
                        CollectOutcome::Delayed
                    } else {
                        enqueue_op(&mut tx, &self.keys, &message)?;
                        CollectOutcome::Requeued
                    }
                } else {
                    enqueue_op(&mut tx, &self.keys, &message)?;
                    CollectOutcome::Requeued
                }
            } else {
                tx.lpush(self.keys.dead_letter(&queue), message.to_json()?);
                CollectOutcome::DeadLettered
            }
        };

        if !self.store.exec(tx).await? {
            debug!(message_id = %id, queue = %queue, "Message already collected elsewhere");
            return Ok(CollectOutcome::Skipped);
        }

        self.events.emit(BrokerEvent::MessageUnacknowledged {
            id,
            queue: queue.clone(),
            cause,
        });
        self.rate.increment_unacknowledged_slot(&queue, cause);
        self.emit_outcome(outcome, id, &queue, cause);

        debug!(
            message_id = %id,
            queue = %queue,
            cause = %cause,
            outcome = ?outcome,
            attempts = message.attempts(),
            "Message collected"
        );
        Ok(outcome)
    }

    fn emit_outcome(
        &self,
        outcome: CollectOutcome,
        id: uuid::Uuid,
        queue: &QueueRef,
        cause: UnacknowledgedCause,
    ) {
        let label = queue.to_string();
        match outcome {
            CollectOutcome::Expired => {
                self.events.emit(BrokerEvent::GcMessageDestroyed {
                    id,
                    queue: queue.clone(),
                });
                if let Some(metrics) = &self.metrics {
                    metrics.record_expired(&label);
                }
            }
            CollectOutcome::Requeued => {
                self.events.emit(BrokerEvent::GcMessageRequeued {
                    id,
                    queue: queue.clone(),
                });
                if let Some(metrics) = &self.metrics {
                    metrics.record_requeued(&label);
                }
            }
            CollectOutcome::Delayed => {
                self.events.emit(BrokerEvent::GcMessageDelayed {
                    id,
                    queue: queue.clone(),
                });
                if let Some(metrics) = &self.metrics {
                    metrics.record_delayed(&label);
                }
            }
            CollectOutcome::DeadLettered => {
                self.events.emit(BrokerEvent::MessageDeadLettered {
                    id,
                    queue: queue.clone(),
                    cause,
                });
                self.rate.increment_dead_lettered_slot(queue);
            }
            CollectOutcome::PeriodicDropped | CollectOutcome::Skipped => {}
        }
    }

    /// Moves an undecodable entry verbatim to the queue's dead-letter log.
    pub async fn dead_letter_raw(
        &self,
        queue: &QueueRef,
        payload: &str,
        processing_key: &str,
    ) -> Result<bool, BrokerError> {
        let mut tx = Transaction::guarded_list(processing_key, payload);
        tx.lpush(self.keys.dead_letter(queue), payload);
        let applied = self.store.exec(tx).await?;
        if applied {
            warn!(queue = %queue, "Moved malformed payload to dead-letter log");
        }
        Ok(applied)
    }

    /// Collects every entry of `processing_key`, oldest first.
    ///
    /// Entries that do not decode go to the dead-letter log verbatim.
    /// Returns how many entries this call moved.
    pub async fn recover_list(
        &self,
        queue: &QueueRef,
        processing_key: &str,
        cause: UnacknowledgedCause,
    ) -> Result<usize, BrokerError> {
        let entries = self.store.lrange(processing_key, 0, -1).await?;
        let mut collected = 0;
        // Oldest entries sit at the tail.
        for payload in entries.iter().rev() {
            let moved = match Message::from_json(payload) {
                Ok(message) => {
                    self.collect_message(message, payload, processing_key, cause)
                        .await?
                        != CollectOutcome::Skipped
                }
                Err(_) => self.dead_letter_raw(queue, payload, processing_key).await?,
            };
            if moved {
                collected += 1;
            }
        }
        Ok(collected)
    }
}

/// Totals of one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub collected: usize,
    pub released_lists: usize,
    pub removed_heartbeats: u64,
}

/// Recovers in-flight messages of consumers that are no longer alive.
pub struct GcSweeper {
    store: Arc<dyn Store>,
    keys: KeySchema,
    registry: HeartbeatRegistry,
    collector: Arc<MessageCollector>,
}

impl GcSweeper {
    pub fn new(
        store: Arc<dyn Store>,
        keys: KeySchema,
        registry: HeartbeatRegistry,
        collector: Arc<MessageCollector>,
    ) -> Self {
        Self {
            store,
            keys,
            registry,
            collector,
        }
    }

    pub async fn sweep(&self, now: i64) -> Result<SweepReport, BrokerError> {
        let liveness = self.registry.partition(now).await?;
        let registry_key = self.keys.processing_queues();
        let mut report = SweepReport::default();

        for processing_key in self.store.smembers(&registry_key).await? {
            let Some((queue, consumer_id)) = self.keys.parse_processing_key(&processing_key)
            else {
                warn!(key = %processing_key, "Unregistering unparsable processing key");
                self.store.srem(&registry_key, &processing_key).await?;
                continue;
            };
            if liveness
                .online
                .contains(&instance_key(InstanceKind::Consumer, &consumer_id))
            {
                continue;
            }

            report.collected += self
                .collector
                .recover_list(&queue, &processing_key, UnacknowledgedCause::Recovery)
                .await?;

            // A consumer that fetched after the drain keeps its list.
            let mut tx = Transaction::guarded_empty_list(processing_key.as_str());
            tx.del(processing_key.as_str())
                .srem(registry_key.as_str(), processing_key.as_str())
                .srem(self.keys.consumers(&queue), consumer_id.as_str());
            if self.store.exec(tx).await? {
                report.released_lists += 1;
                debug!(queue = %queue, consumer_id = %consumer_id, "Released processing list");
            }
        }

        report.removed_heartbeats = self.registry.remove_stale(&liveness.offline).await?;

        if report.collected > 0 || report.released_lists > 0 {
            info!(
                collected = report.collected,
                released_lists = report.released_lists,
                removed_heartbeats = report.removed_heartbeats,
                "GC sweep recovered messages"
            );
        }
        Ok(report)
    }
}

#[async_trait]
impl TickTask for GcSweeper {
    fn name(&self) -> &'static str {
        "gc"
    }

    async fn tick(&self) -> Result<(), BrokerError> {
        self.sweep(now_millis()).await?;
        Ok(())
    }
}
