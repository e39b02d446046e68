//! redis-mq: a message queue built on Redis.
//!
//! Producers publish [`Message`]s into named queues, consumers fetch them
//! one at a time into a per-consumer processing list and acknowledge or
//! reject them. Rejected and orphaned messages are retried, delayed or
//! dead-lettered by the garbage collector, and scheduled messages are
//! promoted by the scheduler. Everything lives in Redis keys described by
//! [`KeySchema`].

// Core modules
pub mod broker;
pub mod cli;
pub mod config;
pub mod consumer;
pub mod error;
pub mod events;
pub mod gc;
pub mod heartbeat;
pub mod keys;
pub mod lifecycle;
pub mod manager;
pub mod message;
pub mod metrics;
pub mod producer;
pub mod scheduler;
pub mod store;
pub mod ticker;

pub use config::{BrokerConfig, ConfigError, MessageDefaults};
pub use consumer::{Consumer, HandlerError, MessageHandler};
pub use error::{BrokerError, LifecycleError, MessageError, StoreError, ValidationError};
pub use events::{BrokerEvent, UnacknowledgedCause};
pub use keys::{KeySchema, QueueRef};
pub use lifecycle::PowerState;
pub use manager::{MessageManager, Paginated, QueueManager};
pub use message::{Message, Priority};
pub use producer::Producer;
pub use store::{MemoryStore, RedisConnector, Store, StoreConnector};
