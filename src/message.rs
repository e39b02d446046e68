//! Message entity.
//!
//! A [`Message`] carries an opaque JSON body plus delivery settings (TTL,
//! retry policy, priority, scheduling). Runtime bookkeeping lives in
//! [`MessageMetadata`], which is absent until a producer publishes the
//! message. The JSON form is what the store holds in every list and set.

use std::fmt;
use std::str::FromStr;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::MessageError;
use crate::keys::QueueRef;

/// Current wall-clock time in epoch milliseconds.
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// Delivery priority. Lower values are delivered first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum Priority {
    Highest = 0,
    VeryHigh = 1,
    High = 2,
    AboveNormal = 3,
    Normal = 4,
    Low = 5,
    VeryLow = 6,
    Lowest = 7,
}

impl Priority {
    /// Score used in the pending priority set.
    pub fn score(self) -> f64 {
        f64::from(u8::from(self))
    }
}

impl From<Priority> for u8 {
    fn from(priority: Priority) -> Self {
        priority as u8
    }
}

impl TryFrom<u8> for Priority {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Priority::Highest),
            1 => Ok(Priority::VeryHigh),
            2 => Ok(Priority::High),
            3 => Ok(Priority::AboveNormal),
            4 => Ok(Priority::Normal),
            5 => Ok(Priority::Low),
            6 => Ok(Priority::VeryLow),
            7 => Ok(Priority::Lowest),
            other => Err(format!("priority must be between 0 and 7, got {}", other)),
        }
    }
}

/// Runtime bookkeeping assigned when a message is produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageMetadata {
    pub uuid: Uuid,
    pub published_at: Option<i64>,
    pub scheduled_at: Option<i64>,
    pub scheduled_cron_fired: bool,
    pub scheduled_repeat_count: u32,
    pub attempts: u32,
    /// The initial scheduled delay has been consumed.
    pub delayed: bool,
    pub expired: bool,
}

impl MessageMetadata {
    fn new(uuid: Uuid) -> Self {
        Self {
            uuid,
            published_at: None,
            scheduled_at: None,
            scheduled_cron_fired: false,
            scheduled_repeat_count: 0,
            attempts: 0,
            delayed: false,
            expired: false,
        }
    }
}

/// A unit of work travelling through a queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    created_at: i64,
    queue: Option<QueueRef>,
    ttl: Option<u64>,
    retry_threshold: Option<u32>,
    retry_delay: Option<u64>,
    consume_timeout: Option<u64>,
    body: Value,
    priority: Option<Priority>,
    scheduled_cron: Option<String>,
    scheduled_delay: Option<u64>,
    #[serde(default)]
    scheduled_repeat: u32,
    scheduled_repeat_period: Option<u64>,
    metadata: Option<MessageMetadata>,
}

impl Default for Message {
    fn default() -> Self {
        Self {
            created_at: now_millis(),
            queue: None,
            ttl: None,
            retry_threshold: None,
            retry_delay: None,
            consume_timeout: None,
            body: Value::Null,
            priority: None,
            scheduled_cron: None,
            scheduled_delay: None,
            scheduled_repeat: 0,
            scheduled_repeat_period: None,
            metadata: None,
        }
    }
}

impl Message {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decodes a message from its stored JSON form.
    pub fn from_json(payload: &str) -> Result<Self, MessageError> {
        Ok(serde_json::from_str(payload)?)
    }

    /// Encodes the message into its stored JSON form.
    pub fn to_json(&self) -> Result<String, MessageError> {
        Ok(serde_json::to_string(self)?)
    }

    // Builders

    pub fn with_body(mut self, body: impl Into<Value>) -> Self {
        self.body = body.into();
        self
    }

    /// Sets the body from any serializable value.
    pub fn with_json_body<T: Serialize>(mut self, body: &T) -> Result<Self, MessageError> {
        self.body = serde_json::to_value(body)?;
        Ok(self)
    }

    pub fn with_queue(mut self, queue: QueueRef) -> Self {
        self.queue = Some(queue);
        self
    }

    /// Time to live in milliseconds, counted from `created_at`.
    pub fn with_ttl(mut self, ttl: u64) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn with_retry_threshold(mut self, threshold: u32) -> Self {
        self.retry_threshold = Some(threshold);
        self
    }

    /// Delay in milliseconds before a failed delivery is retried.
    pub fn with_retry_delay(mut self, delay: u64) -> Self {
        self.retry_delay = Some(delay);
        self
    }

    /// Maximum handler run time in milliseconds.
    pub fn with_consume_timeout(mut self, timeout: u64) -> Self {
        self.consume_timeout = Some(timeout);
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = Some(priority);
        self
    }

    /// Sets a 6-field cron expression (seconds first).
    ///
    /// # Errors
    ///
    /// Returns `MessageError::InvalidCron` if the expression does not parse.
    pub fn with_scheduled_cron(mut self, expression: &str) -> Result<Self, MessageError> {
        cron::Schedule::from_str(expression).map_err(|e| MessageError::InvalidCron {
            expression: expression.to_string(),
            reason: e.to_string(),
        })?;
        self.scheduled_cron = Some(expression.to_string());
        Ok(self)
    }

    /// Delays the first delivery by `delay` milliseconds.
    pub fn with_scheduled_delay(mut self, delay: u64) -> Self {
        self.set_scheduled_delay(delay);
        self
    }

    /// Number of repeated deliveries.
    pub fn with_scheduled_repeat(mut self, repeat: u32) -> Self {
        self.scheduled_repeat = repeat;
        self
    }

    /// Period between repeated deliveries in milliseconds.
    pub fn with_scheduled_repeat_period(mut self, period: u64) -> Self {
        self.scheduled_repeat_period = Some(period);
        self
    }

    // Mutators used by the runtime

    /// Sets a scheduled delay and marks it as not yet consumed.
    pub fn set_scheduled_delay(&mut self, delay: u64) {
        self.scheduled_delay = Some(delay);
        if let Some(metadata) = self.metadata.as_mut() {
            metadata.delayed = false;
        }
    }

    pub fn set_queue(&mut self, queue: QueueRef) {
        self.queue = Some(queue);
    }

    pub fn set_priority(&mut self, priority: Option<Priority>) {
        self.priority = priority;
    }

    /// Assigns fresh metadata with a new identity.
    pub fn reset(&mut self) {
        self.created_at = now_millis();
        self.metadata = Some(MessageMetadata::new(Uuid::new_v4()));
    }

    /// Assigns fresh metadata but keeps the current identity.
    pub fn reset_keeping_id(&mut self) {
        let uuid = self.id().unwrap_or_else(Uuid::new_v4);
        self.created_at = now_millis();
        self.metadata = Some(MessageMetadata::new(uuid));
    }

    /// Builds the instance delivered for one firing of a periodic message.
    ///
    /// The copy gets a new identity and creation time while keeping body
    /// and delivery settings.
    pub fn fresh_instance(&self) -> Self {
        let mut instance = self.clone();
        instance.reset();
        instance
    }

    pub(crate) fn metadata_mut(&mut self) -> Result<&mut MessageMetadata, MessageError> {
        self.metadata.as_mut().ok_or(MessageError::MissingMetadata)
    }

    /// Increments and returns the attempt counter.
    pub fn increment_attempts(&mut self) -> Result<u32, MessageError> {
        let metadata = self.metadata_mut()?;
        metadata.attempts += 1;
        Ok(metadata.attempts)
    }

    pub fn mark_published(&mut self, at: i64) -> Result<(), MessageError> {
        self.metadata_mut()?.published_at = Some(at);
        Ok(())
    }

    // Accessors

    pub fn id(&self) -> Option<Uuid> {
        self.metadata.as_ref().map(|m| m.uuid)
    }

    /// Identity of a produced message.
    pub fn required_id(&self) -> Result<Uuid, MessageError> {
        self.id().ok_or(MessageError::MissingMetadata)
    }

    pub fn queue(&self) -> Option<&QueueRef> {
        self.queue.as_ref()
    }

    pub fn required_queue(&self) -> Result<&QueueRef, MessageError> {
        self.queue.as_ref().ok_or(MessageError::MissingQueue)
    }

    pub fn created_at(&self) -> i64 {
        self.created_at
    }

    pub fn body(&self) -> &Value {
        &self.body
    }

    pub fn ttl(&self) -> Option<u64> {
        self.ttl
    }

    pub fn retry_threshold(&self) -> Option<u32> {
        self.retry_threshold
    }

    pub fn retry_delay(&self) -> Option<u64> {
        self.retry_delay
    }

    pub fn consume_timeout(&self) -> Option<u64> {
        self.consume_timeout
    }

    pub fn priority(&self) -> Option<Priority> {
        self.priority
    }

    pub fn scheduled_cron(&self) -> Option<&str> {
        self.scheduled_cron.as_deref()
    }

    pub fn scheduled_delay(&self) -> Option<u64> {
        self.scheduled_delay
    }

    pub fn scheduled_repeat(&self) -> u32 {
        self.scheduled_repeat
    }

    pub fn scheduled_repeat_period(&self) -> Option<u64> {
        self.scheduled_repeat_period
    }

    pub fn metadata(&self) -> Option<&MessageMetadata> {
        self.metadata.as_ref()
    }

    pub fn attempts(&self) -> u32 {
        self.metadata.as_ref().map_or(0, |m| m.attempts)
    }

    /// True when the message recurs on a cron or repeat schedule.
    pub fn is_periodic(&self) -> bool {
        self.scheduled_cron.is_some() || self.scheduled_repeat > 0
    }

    /// True when the message must go through the scheduler.
    pub fn is_schedulable(&self) -> bool {
        self.is_periodic() || self.scheduled_delay.is_some()
    }

    /// True when `ttl` milliseconds have elapsed since creation.
    ///
    /// A TTL of 0 never expires.
    pub fn has_expired(&self, ttl: u64, now: i64) -> bool {
        if ttl == 0 {
            return false;
        }
        let ttl = i64::try_from(ttl).unwrap_or(i64::MAX);
        now.saturating_sub(self.created_at) >= ttl
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.id() {
            Some(id) => write!(f, "Message({})", id),
            None => f.write_str("Message(unpublished)"),
        }
    }
}
