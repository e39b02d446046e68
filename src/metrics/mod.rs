//! Metrics module for Prometheus-based monitoring.
//!
//! Message flow (produced, acknowledged, unacknowledged, dead-lettered,
//! requeued, delayed, expired) is exported through a global Prometheus
//! registry. Each participant also keeps a [`MessageRate`] with plain
//! atomic counters.
//!
//! # Example
//!
//! ```ignore
//! use redis_mq::metrics::{init_metrics, export_metrics, MetricsCollector};
//!
//! init_metrics().expect("Failed to initialize metrics");
//!
//! let collector = MetricsCollector::new();
//! collector.record_produced("default:orders");
//!
//! let metrics_text = export_metrics();
//! ```

pub mod collectors;
pub mod prometheus;
pub mod rate;

pub use self::collectors::MetricsCollector;
pub use self::prometheus::{export_metrics, init_metrics};
pub use self::rate::{MessageRate, RateSnapshot};

pub use self::prometheus::{
    HANDLER_DURATION, MESSAGES_ACKNOWLEDGED, MESSAGES_DEAD_LETTERED, MESSAGES_DELAYED,
    MESSAGES_EXPIRED, MESSAGES_IN_PROGRESS, MESSAGES_PRODUCED, MESSAGES_REQUEUED,
    MESSAGES_UNACKNOWLEDGED, QUEUE_DEPTH, REGISTRY, SCHEDULED_PROMOTIONS,
};
