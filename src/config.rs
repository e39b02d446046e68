//! Broker configuration.
//!
//! This module provides the configuration shared by producers, consumers and
//! the background workers: store location, key namespace, per-message
//! defaults and the timing of every periodic loop.

use std::time::Duration;

use thiserror::Error;

use crate::keys;

/// Hard default for message TTL in milliseconds (0 disables expiry).
pub const DEFAULT_MESSAGE_TTL: u64 = 0;

/// Hard default for the consume timeout in milliseconds (0 disables it).
pub const DEFAULT_CONSUME_TIMEOUT: u64 = 0;

/// Hard default for the retry threshold.
pub const DEFAULT_RETRY_THRESHOLD: u32 = 3;

/// Hard default for the delay before a failed message is retried, in milliseconds.
pub const DEFAULT_RETRY_DELAY: u64 = 60_000;

/// Errors that can occur during configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("Missing environment variable: {0}")]
    MissingEnvVar(String),

    /// An environment variable has an invalid value.
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// Configuration validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),
}

/// Resolves an effective value from the three-tier fallback chain.
///
/// The message override wins, then the instance default, then the hard
/// default. Used identically for TTL, retry threshold, retry delay and
/// consume timeout.
pub fn resolve_effective<T: Copy>(
    message_override: Option<T>,
    instance_default: Option<T>,
    hard_default: T,
) -> T {
    message_override.or(instance_default).unwrap_or(hard_default)
}

/// Instance-level message defaults.
///
/// Every field is optional; unset fields fall through to the hard defaults.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MessageDefaults {
    /// Consume timeout in milliseconds.
    pub consume_timeout: Option<u64>,
    /// Time to live in milliseconds.
    pub ttl: Option<u64>,
    /// Number of failed attempts before a message is dead-lettered.
    pub retry_threshold: Option<u32>,
    /// Delay before a failed message is retried, in milliseconds.
    pub retry_delay: Option<u64>,
}

impl MessageDefaults {
    /// Effective TTL for a message override.
    pub fn ttl(&self, message_override: Option<u64>) -> u64 {
        resolve_effective(message_override, self.ttl, DEFAULT_MESSAGE_TTL)
    }

    /// Effective consume timeout for a message override.
    pub fn consume_timeout(&self, message_override: Option<u64>) -> u64 {
        resolve_effective(
            message_override,
            self.consume_timeout,
            DEFAULT_CONSUME_TIMEOUT,
        )
    }

    /// Effective retry threshold for a message override.
    pub fn retry_threshold(&self, message_override: Option<u32>) -> u32 {
        resolve_effective(
            message_override,
            self.retry_threshold,
            DEFAULT_RETRY_THRESHOLD,
        )
    }

    /// Effective retry delay for a message override.
    pub fn retry_delay(&self, message_override: Option<u64>) -> u64 {
        resolve_effective(message_override, self.retry_delay, DEFAULT_RETRY_DELAY)
    }
}

/// Configuration for a broker participant.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    // Store settings
    /// Redis connection URL.
    pub redis_url: String,
    /// Prefix shared by every key this broker writes.
    pub key_prefix: String,
    /// Namespace used for queues given without an explicit namespace.
    pub namespace: String,

    // Queue behaviour
    /// Keep acknowledged messages in a per-queue log.
    pub store_messages: bool,
    /// Route produced messages through the priority queue.
    pub priority_queuing: bool,
    /// Record Prometheus metrics for message rates.
    pub metrics_enabled: bool,
    /// Per-message defaults applied by consumers.
    pub message: MessageDefaults,

    // Timing
    /// How often a running instance refreshes its heartbeat.
    pub heartbeat_interval: Duration,
    /// Maximum heartbeat age before an instance is considered offline.
    pub heartbeat_freshness: Duration,
    /// How often due scheduled messages are promoted.
    pub scheduler_interval: Duration,
    /// How often processing lists of dead consumers are swept.
    pub gc_interval: Duration,
    /// How long a fetch loop sleeps when its queue is empty.
    pub poll_interval: Duration,
    /// Maximum time to wait for in-flight work during shutdown.
    pub shutdown_timeout: Duration,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            redis_url: "redis://localhost:6379".to_string(),
            key_prefix: "rmq".to_string(),
            namespace: keys::DEFAULT_NAMESPACE.to_string(),

            store_messages: false,
            priority_queuing: false,
            metrics_enabled: true,
            message: MessageDefaults::default(),

            heartbeat_interval: Duration::from_secs(1),
            heartbeat_freshness: Duration::from_secs(10),
            scheduler_interval: Duration::from_secs(1),
            gc_interval: Duration::from_secs(1),
            poll_interval: Duration::from_millis(500),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl BrokerConfig {
    /// Creates a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `REDIS_MQ_URL`: Redis connection URL (default: redis://localhost:6379)
    /// - `REDIS_MQ_KEY_PREFIX`: Key prefix (default: rmq)
    /// - `REDIS_MQ_NAMESPACE`: Default queue namespace (default: default)
    /// - `REDIS_MQ_STORE_MESSAGES`: Keep acknowledged messages (default: false)
    /// - `REDIS_MQ_PRIORITY_QUEUING`: Produce into priority queues (default: false)
    /// - `REDIS_MQ_METRICS_ENABLED`: Record metrics (default: true)
    /// - `REDIS_MQ_MESSAGE_TTL_MS`: Default message TTL
    /// - `REDIS_MQ_MESSAGE_CONSUME_TIMEOUT_MS`: Default consume timeout
    /// - `REDIS_MQ_MESSAGE_RETRY_THRESHOLD`: Default retry threshold
    /// - `REDIS_MQ_MESSAGE_RETRY_DELAY_MS`: Default retry delay
    /// - `REDIS_MQ_HEARTBEAT_INTERVAL_MS`: Heartbeat period (default: 1000)
    /// - `REDIS_MQ_HEARTBEAT_FRESHNESS_MS`: Freshness window (default: 10000)
    /// - `REDIS_MQ_SCHEDULER_INTERVAL_MS`: Scheduler tick (default: 1000)
    /// - `REDIS_MQ_GC_INTERVAL_MS`: GC sweep tick (default: 1000)
    /// - `REDIS_MQ_POLL_INTERVAL_MS`: Empty-queue poll delay (default: 500)
    /// - `REDIS_MQ_SHUTDOWN_TIMEOUT_SECS`: Shutdown timeout (default: 30)
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if a variable has an invalid value.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(val) = std::env::var("REDIS_MQ_URL") {
            config.redis_url = val;
        }

        if let Ok(val) = std::env::var("REDIS_MQ_KEY_PREFIX") {
            config.key_prefix = val;
        }

        if let Ok(val) = std::env::var("REDIS_MQ_NAMESPACE") {
            config.namespace = val.to_lowercase();
        }

        if let Ok(val) = std::env::var("REDIS_MQ_STORE_MESSAGES") {
            config.store_messages = parse_env_bool(&val, "REDIS_MQ_STORE_MESSAGES")?;
        }

        if let Ok(val) = std::env::var("REDIS_MQ_PRIORITY_QUEUING") {
            config.priority_queuing = parse_env_bool(&val, "REDIS_MQ_PRIORITY_QUEUING")?;
        }

        if let Ok(val) = std::env::var("REDIS_MQ_METRICS_ENABLED") {
            config.metrics_enabled = parse_env_bool(&val, "REDIS_MQ_METRICS_ENABLED")?;
        }

        // Message defaults
        if let Ok(val) = std::env::var("REDIS_MQ_MESSAGE_TTL_MS") {
            config.message.ttl = Some(parse_env_value(&val, "REDIS_MQ_MESSAGE_TTL_MS")?);
        }

        if let Ok(val) = std::env::var("REDIS_MQ_MESSAGE_CONSUME_TIMEOUT_MS") {
            config.message.consume_timeout = Some(parse_env_value(
                &val,
                "REDIS_MQ_MESSAGE_CONSUME_TIMEOUT_MS",
            )?);
        }

        if let Ok(val) = std::env::var("REDIS_MQ_MESSAGE_RETRY_THRESHOLD") {
            config.message.retry_threshold =
                Some(parse_env_value(&val, "REDIS_MQ_MESSAGE_RETRY_THRESHOLD")?);
        }

        if let Ok(val) = std::env::var("REDIS_MQ_MESSAGE_RETRY_DELAY_MS") {
            config.message.retry_delay =
                Some(parse_env_value(&val, "REDIS_MQ_MESSAGE_RETRY_DELAY_MS")?);
        }

        // Timing
        if let Ok(val) = std::env::var("REDIS_MQ_HEARTBEAT_INTERVAL_MS") {
            let ms: u64 = parse_env_value(&val, "REDIS_MQ_HEARTBEAT_INTERVAL_MS")?;
            config.heartbeat_interval = Duration::from_millis(ms);
        }

        if let Ok(val) = std::env::var("REDIS_MQ_HEARTBEAT_FRESHNESS_MS") {
            let ms: u64 = parse_env_value(&val, "REDIS_MQ_HEARTBEAT_FRESHNESS_MS")?;
            config.heartbeat_freshness = Duration::from_millis(ms);
        }

        if let Ok(val) = std::env::var("REDIS_MQ_SCHEDULER_INTERVAL_MS") {
            let ms: u64 = parse_env_value(&val, "REDIS_MQ_SCHEDULER_INTERVAL_MS")?;
            config.scheduler_interval = Duration::from_millis(ms);
        }

        if let Ok(val) = std::env::var("REDIS_MQ_GC_INTERVAL_MS") {
            let ms: u64 = parse_env_value(&val, "REDIS_MQ_GC_INTERVAL_MS")?;
            config.gc_interval = Duration::from_millis(ms);
        }

        if let Ok(val) = std::env::var("REDIS_MQ_POLL_INTERVAL_MS") {
            let ms: u64 = parse_env_value(&val, "REDIS_MQ_POLL_INTERVAL_MS")?;
            config.poll_interval = Duration::from_millis(ms);
        }

        if let Ok(val) = std::env::var("REDIS_MQ_SHUTDOWN_TIMEOUT_SECS") {
            let secs: u64 = parse_env_value(&val, "REDIS_MQ_SHUTDOWN_TIMEOUT_SECS")?;
            config.shutdown_timeout = Duration::from_secs(secs);
        }

        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration values.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationFailed` if any values are invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.redis_url.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "redis_url cannot be empty".to_string(),
            ));
        }

        if !keys::is_valid_name(&self.key_prefix) {
            return Err(ConfigError::ValidationFailed(format!(
                "key_prefix '{}' is not a valid key segment",
                self.key_prefix
            )));
        }

        if !keys::is_valid_name(&self.namespace) {
            return Err(ConfigError::ValidationFailed(format!(
                "namespace '{}' is not a valid key segment",
                self.namespace
            )));
        }

        let intervals = [
            ("heartbeat_interval", self.heartbeat_interval),
            ("scheduler_interval", self.scheduler_interval),
            ("gc_interval", self.gc_interval),
            ("poll_interval", self.poll_interval),
        ];
        for (name, interval) in intervals {
            if interval.is_zero() {
                return Err(ConfigError::ValidationFailed(format!(
                    "{} must be greater than 0",
                    name
                )));
            }
        }

        if self.heartbeat_freshness <= self.heartbeat_interval {
            return Err(ConfigError::ValidationFailed(
                "heartbeat_freshness must be greater than heartbeat_interval".to_string(),
            ));
        }

        Ok(())
    }

    /// Builder method to set the Redis URL.
    pub fn with_redis_url(mut self, url: impl Into<String>) -> Self {
        self.redis_url = url.into();
        self
    }

    /// Builder method to set the key prefix.
    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    /// Builder method to set the default namespace.
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into().to_lowercase();
        self
    }

    /// Builder method to keep acknowledged messages.
    pub fn with_store_messages(mut self, enabled: bool) -> Self {
        self.store_messages = enabled;
        self
    }

    /// Builder method to enable priority queuing for produced messages.
    pub fn with_priority_queuing(mut self, enabled: bool) -> Self {
        self.priority_queuing = enabled;
        self
    }

    /// Builder method to enable or disable metrics.
    pub fn with_metrics(mut self, enabled: bool) -> Self {
        self.metrics_enabled = enabled;
        self
    }

    /// Builder method to set message defaults.
    pub fn with_message_defaults(mut self, defaults: MessageDefaults) -> Self {
        self.message = defaults;
        self
    }

    /// Builder method to set the heartbeat interval.
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Builder method to set the heartbeat freshness window.
    pub fn with_heartbeat_freshness(mut self, window: Duration) -> Self {
        self.heartbeat_freshness = window;
        self
    }

    /// Builder method to set the scheduler tick.
    pub fn with_scheduler_interval(mut self, interval: Duration) -> Self {
        self.scheduler_interval = interval;
        self
    }

    /// Builder method to set the GC sweep tick.
    pub fn with_gc_interval(mut self, interval: Duration) -> Self {
        self.gc_interval = interval;
        self
    }

    /// Builder method to set the empty-queue poll interval.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Builder method to set the shutdown timeout.
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }
}

/// Parse an environment variable value into a type.
fn parse_env_value<T: std::str::FromStr>(value: &str, key: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("could not parse '{}'", value),
    })
}

/// Parse an environment variable as a boolean.
fn parse_env_bool(value: &str, key: &str) -> Result<bool, ConfigError> {
    match value.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("expected boolean value, got '{}'", value),
        }),
    }
}
