//! Key schema for every structure the broker keeps in the store.
//!
//! Keys are derived from a [`KeySchema`] value carrying the prefix, so
//! brokers with different prefixes can share one process without touching
//! any global state.

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

/// Namespace used when a queue is given without one.
pub const DEFAULT_NAMESPACE: &str = "default";

/// Default prefix shared by every key.
pub const DEFAULT_KEY_PREFIX: &str = "rmq";

static NAME_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-z0-9]+([._-][a-z0-9]+)*$").expect("name pattern is a valid regex")
});

/// Returns true when `name` is a valid key segment.
pub fn is_valid_name(name: &str) -> bool {
    NAME_PATTERN.is_match(name)
}

/// Lower-cases and validates a queue name.
pub fn validate_queue_name(name: &str) -> Result<String, ValidationError> {
    let lowered = name.to_lowercase();
    if is_valid_name(&lowered) {
        Ok(lowered)
    } else {
        Err(ValidationError::InvalidQueueName(name.to_string()))
    }
}

/// Lower-cases and validates a namespace.
pub fn validate_namespace(namespace: &str) -> Result<String, ValidationError> {
    let lowered = namespace.to_lowercase();
    if is_valid_name(&lowered) {
        Ok(lowered)
    } else {
        Err(ValidationError::InvalidNamespace(namespace.to_string()))
    }
}

/// A queue identified by namespace and name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct QueueRef {
    #[serde(rename = "ns")]
    pub namespace: String,
    pub name: String,
}

impl QueueRef {
    /// Builds a validated queue reference.
    pub fn new(namespace: &str, name: &str) -> Result<Self, ValidationError> {
        Ok(Self {
            namespace: validate_namespace(namespace)?,
            name: validate_queue_name(name)?,
        })
    }

    /// Parses `"ns:name"` or `"name"` (placed in [`DEFAULT_NAMESPACE`]).
    pub fn parse(input: &str) -> Result<Self, ValidationError> {
        Self::parse_in(input, DEFAULT_NAMESPACE)
    }

    /// Parses `"ns:name"` or `"name"`, using `default_namespace` for the latter.
    pub fn parse_in(input: &str, default_namespace: &str) -> Result<Self, ValidationError> {
        match input.split_once(':') {
            Some((ns, name)) => Self::new(ns, name),
            None => Self::new(default_namespace, input),
        }
    }
}

impl fmt::Display for QueueRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.namespace, self.name)
    }
}

/// Kind of participant owning a heartbeat record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InstanceKind {
    Consumer,
    Producer,
}

impl InstanceKind {
    fn as_str(self) -> &'static str {
        match self {
            InstanceKind::Consumer => "consumer",
            InstanceKind::Producer => "producer",
        }
    }
}

impl fmt::Display for InstanceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Heartbeat hash field for an instance, e.g. `consumer:{id}`.
pub fn instance_key(kind: InstanceKind, id: &str) -> String {
    format!("{}:{}", kind, id)
}

/// Splits a heartbeat field back into kind and id.
pub fn parse_instance_key(key: &str) -> Result<(InstanceKind, String), ValidationError> {
    let invalid = || ValidationError::InvalidInstanceKey(key.to_string());
    let (kind, id) = key.split_once(':').ok_or_else(invalid)?;
    if id.is_empty() {
        return Err(invalid());
    }
    let kind = match kind {
        "consumer" => InstanceKind::Consumer,
        "producer" => InstanceKind::Producer,
        _ => return Err(invalid()),
    };
    Ok((kind, id.to_string()))
}

/// Key derivation bound to one prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeySchema {
    prefix: String,
}

impl Default for KeySchema {
    fn default() -> Self {
        Self {
            prefix: DEFAULT_KEY_PREFIX.to_string(),
        }
    }
}

impl KeySchema {
    pub fn new(prefix: &str) -> Result<Self, ValidationError> {
        if !is_valid_name(prefix) {
            return Err(ValidationError::InvalidKeyPrefix(prefix.to_string()));
        }
        Ok(Self {
            prefix: prefix.to_string(),
        })
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    fn queue_key(&self, queue: &QueueRef, suffix: &str) -> String {
        format!(
            "{}:queue:{}:{}:{}",
            self.prefix, queue.namespace, queue.name, suffix
        )
    }

    /// Plain FIFO list of messages ready for delivery.
    pub fn pending(&self, queue: &QueueRef) -> String {
        self.queue_key(queue, "pending")
    }

    /// Sorted set of prioritized messages ready for delivery.
    pub fn pending_priority(&self, queue: &QueueRef) -> String {
        self.queue_key(queue, "pending_priority")
    }

    pub fn acknowledged(&self, queue: &QueueRef) -> String {
        self.queue_key(queue, "acknowledged")
    }

    pub fn dead_letter(&self, queue: &QueueRef) -> String {
        self.queue_key(queue, "dead_letter")
    }

    /// Set of consumer ids registered on the queue.
    pub fn consumers(&self, queue: &QueueRef) -> String {
        self.queue_key(queue, "consumers")
    }

    /// Per-consumer list holding the message in flight.
    pub fn processing(&self, queue: &QueueRef, consumer_id: &str) -> String {
        self.queue_key(queue, &format!("processing:{}", consumer_id))
    }

    /// Global sorted set of scheduled messages scored by due time.
    pub fn scheduled(&self) -> String {
        format!("{}:scheduled", self.prefix)
    }

    /// Global hash of heartbeat records keyed by instance key.
    pub fn heartbeat_index(&self) -> String {
        format!("{}:heartbeat:index", self.prefix)
    }

    /// Set of every known queue as `ns:name`.
    pub fn queues(&self) -> String {
        format!("{}:queues", self.prefix)
    }

    /// Set of every registered processing list key.
    pub fn processing_queues(&self) -> String {
        format!("{}:processing_queues", self.prefix)
    }

    /// Recovers the queue and consumer id from a processing list key.
    pub fn parse_processing_key(&self, key: &str) -> Option<(QueueRef, String)> {
        let rest = key.strip_prefix(&self.prefix)?.strip_prefix(":queue:")?;
        let mut parts = rest.splitn(4, ':');
        let namespace = parts.next()?;
        let name = parts.next()?;
        if parts.next()? != "processing" {
            return None;
        }
        let consumer_id = parts.next().filter(|id| !id.is_empty())?;
        let queue = QueueRef::new(namespace, name).ok()?;
        Some((queue, consumer_id.to_string()))
    }
}
