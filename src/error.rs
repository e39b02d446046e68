//! Error types for redis-mq operations.
//!
//! Defines error types for every layer of the broker:
//! - Store adapter (connection, command and serialization failures)
//! - Message construction and decoding
//! - Input validation (queue names, message references)
//! - Participant lifecycle transitions
//! - The umbrella `BrokerError` returned by runtime components

use std::time::Duration;

use thiserror::Error;

use crate::config::ConfigError;
use crate::lifecycle::PowerState;

/// Errors raised by a key-value store adapter.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Failed to connect to the store.
    #[error("Store connection failed: {0}")]
    ConnectionFailed(String),

    /// A Redis command or transaction failed.
    #[error("Redis operation failed: {0}")]
    Redis(#[from] redis::RedisError),

    /// Failed to encode transaction arguments.
    #[error("Serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The connection has been released by its owner.
    #[error("Store connection has been closed")]
    Closed,
}

/// Errors that can occur while building or decoding a message.
#[derive(Debug, Error)]
pub enum MessageError {
    #[error("Invalid cron expression '{expression}': {reason}")]
    InvalidCron { expression: String, reason: String },

    #[error("Message has no queue assigned")]
    MissingQueue,

    #[error("Message has not been produced yet (metadata missing)")]
    MissingMetadata,

    #[error("Malformed message payload: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Errors returned synchronously for invalid caller input.
///
/// No store mutation happens when one of these is returned.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Invalid queue name '{0}': expected lowercase alphanumerics separated by '.', '_' or '-'")]
    InvalidQueueName(String),

    #[error("Invalid namespace '{0}': expected lowercase alphanumerics separated by '.', '_' or '-'")]
    InvalidNamespace(String),

    #[error("Invalid key prefix '{0}'")]
    InvalidKeyPrefix(String),

    #[error("Invalid instance key '{0}'")]
    InvalidInstanceKey(String),

    #[error("Either message parameters are invalid or the message has been already deleted")]
    MessageNotFound,

    #[error("Handler for queue '{0}' is already registered")]
    HandlerAlreadyRegistered(String),

    #[error("Queue '{0}' has online consumers")]
    QueueHasConsumers(String),
}

/// Errors raised by the power-state machine of a participant.
#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("Invalid state transition from '{from}' to '{to}'")]
    InvalidTransition { from: PowerState, to: PowerState },
}

/// Umbrella error for producers, consumers and background workers.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Message(#[from] MessageError),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    /// A component that must exist while running was not set up.
    #[error("Expected an instance of {0}")]
    Uninitialized(&'static str),

    /// The participant is not up and is not going up either.
    #[error("Instance {id} is not running")]
    NotRunning { id: String },

    /// Background tasks did not stop in time.
    #[error("Shutdown timed out after {0:?}")]
    ShutdownTimeout(Duration),
}

impl From<redis::RedisError> for BrokerError {
    fn from(err: redis::RedisError) -> Self {
        BrokerError::Store(StoreError::Redis(err))
    }
}
