//! Delayed and periodic delivery.
//!
//! Scheduled messages live in one global sorted set scored by their due
//! time in epoch milliseconds. A [`Scheduler`] tick promotes every due
//! entry into its queue's pending structure, one guarded transaction per
//! message, and re-inserts periodic messages at their next occurrence.

use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use tracing::{debug, warn};

use crate::broker::enqueue_op;
use crate::error::{BrokerError, MessageError};
use crate::keys::KeySchema;
use crate::message::{now_millis, Message};
use crate::metrics::MetricsCollector;
use crate::store::{Store, Transaction};
use crate::ticker::TickTask;

/// Next time `expression` fires strictly after `now`, in epoch milliseconds.
pub fn next_cron_time(expression: &str, now: i64) -> Result<Option<i64>, MessageError> {
    let schedule =
        cron::Schedule::from_str(expression).map_err(|e| MessageError::InvalidCron {
            expression: expression.to_string(),
            reason: e.to_string(),
        })?;
    let Some(after) = Utc.timestamp_millis_opt(now).single() else {
        return Ok(None);
    };
    Ok(schedule.after(&after).next().map(|t| t.timestamp_millis()))
}

/// Computes the next due time of `message` and updates its scheduling
/// metadata accordingly. Returns `None` when nothing is left to schedule.
///
/// A pending initial delay wins. Otherwise a cron occurrence and a repeat
/// occurrence are compared: repeats run between cron firings once the cron
/// has fired, and each cron firing restarts the repeat count.
pub fn next_timestamp(message: &mut Message, now: i64) -> Result<Option<i64>, MessageError> {
    let cron_next = match message.scheduled_cron() {
        Some(expression) => next_cron_time(expression, now)?,
        None => None,
    };
    let delay = message.scheduled_delay();
    let repeat = message.scheduled_repeat();
    let period = message.scheduled_repeat_period().unwrap_or(0);
    let metadata = message.metadata_mut()?;

    if let Some(delay) = delay {
        if !metadata.delayed {
            metadata.delayed = true;
            return Ok(Some(now.saturating_add(delay as i64)));
        }
    }

    let repeat_next = (repeat > 0 && metadata.scheduled_repeat_count < repeat)
        .then(|| now.saturating_add(period as i64));

    let next = match (cron_next, repeat_next) {
        (Some(cron), Some(repeat)) if repeat < cron && metadata.scheduled_cron_fired => {
            metadata.scheduled_repeat_count += 1;
            Some(repeat)
        }
        (Some(cron), _) => {
            metadata.scheduled_repeat_count = 0;
            metadata.scheduled_cron_fired = true;
            Some(cron)
        }
        (None, Some(repeat)) => {
            metadata.scheduled_repeat_count += 1;
            Some(repeat)
        }
        (None, None) => None,
    };
    Ok(next)
}

/// Writes into and promotes from the scheduled set.
pub struct Scheduler {
    store: Arc<dyn Store>,
    keys: KeySchema,
    metrics: Option<MetricsCollector>,
}

impl Scheduler {
    pub fn new(store: Arc<dyn Store>, keys: KeySchema, metrics_enabled: bool) -> Self {
        Self {
            store,
            keys,
            metrics: metrics_enabled.then(MetricsCollector::new),
        }
    }

    /// Queues a ZADD of `message` at its next due time into `tx`.
    ///
    /// Returns false, leaving `tx` untouched, when the message has nothing
    /// left to schedule.
    pub fn schedule(
        &self,
        message: &mut Message,
        tx: &mut Transaction,
        now: i64,
    ) -> Result<bool, MessageError> {
        let Some(due) = next_timestamp(message, now)? else {
            return Ok(false);
        };
        message.metadata_mut()?.scheduled_at = Some(due);
        let payload = message.to_json()?;
        tx.zadd(self.keys.scheduled(), due as f64, payload);
        debug!(
            message_id = %message.required_id()?,
            due = due,
            "Message scheduled"
        );
        Ok(true)
    }

    /// Moves every entry due at `now` into its pending structure.
    ///
    /// Returns the number of messages promoted. Entries claimed by a
    /// concurrent scheduler are skipped.
    pub async fn promote_due(&self, now: i64) -> Result<usize, BrokerError> {
        let scheduled_key = self.keys.scheduled();
        let due = self
            .store
            .zrange_by_score(&scheduled_key, 0.0, now as f64)
            .await?;

        let mut promoted = 0;
        for (payload, _) in due {
            let message = match Message::from_json(&payload) {
                Ok(message) => message,
                Err(e) => {
                    warn!(error = %e, "Dropping malformed scheduled entry");
                    self.store.zrem(&scheduled_key, &payload).await?;
                    continue;
                }
            };

            let queue = message.required_queue()?.to_string();
            let mut tx = Transaction::guarded_zset(&scheduled_key, &payload);
            if message.is_periodic() {
                let mut delivered = message.fresh_instance();
                delivered.mark_published(now)?;
                enqueue_op(&mut tx, &self.keys, &delivered)?;

                let mut next = message;
                self.schedule(&mut next, &mut tx, now)?;
            } else {
                let mut delivered = message;
                delivered.mark_published(now)?;
                enqueue_op(&mut tx, &self.keys, &delivered)?;
            }

            if self.store.exec(tx).await? {
                promoted += 1;
                if let Some(metrics) = &self.metrics {
                    metrics.record_promotion(&queue);
                }
            }
        }

        if promoted > 0 {
            debug!(promoted = promoted, "Promoted scheduled messages");
        }
        Ok(promoted)
    }
}

#[async_trait]
impl TickTask for Scheduler {
    fn name(&self) -> &'static str {
        "scheduler"
    }

    async fn tick(&self) -> Result<(), BrokerError> {
        self.promote_due(now_millis()).await?;
        Ok(())
    }
}
