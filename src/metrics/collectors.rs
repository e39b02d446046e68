//! High-level interface for recording broker metrics.
//!
//! The `MetricsCollector` struct wraps the raw Prometheus metrics and keeps
//! labeling consistent. Every method is a no-op until `init_metrics()` ran.

use super::prometheus::{
    HANDLER_DURATION, MESSAGES_ACKNOWLEDGED, MESSAGES_DEAD_LETTERED, MESSAGES_DELAYED,
    MESSAGES_EXPIRED, MESSAGES_IN_PROGRESS, MESSAGES_PRODUCED, MESSAGES_REQUEUED,
    MESSAGES_UNACKNOWLEDGED, QUEUE_DEPTH, SCHEDULED_PROMOTIONS,
};

/// Metrics collector for recording message flow.
#[derive(Debug, Clone, Copy, Default)]
pub struct MetricsCollector;

impl MetricsCollector {
    /// Create a new MetricsCollector instance.
    ///
    /// Note: Metrics must be initialized with `init_metrics()` before
    /// anything is recorded.
    pub fn new() -> Self {
        Self
    }

    pub fn record_produced(&self, queue: &str) {
        if let Some(produced) = MESSAGES_PRODUCED.get() {
            produced.with_label_values(&[queue]).inc();
        }
        tracing::trace!(queue = queue, "Recorded produced message");
    }

    pub fn record_acknowledged(&self, queue: &str) {
        if let Some(acknowledged) = MESSAGES_ACKNOWLEDGED.get() {
            acknowledged.with_label_values(&[queue]).inc();
        }
        tracing::trace!(queue = queue, "Recorded acknowledged message");
    }

    /// Record a message that left its handler without acknowledgment.
    ///
    /// # Arguments
    ///
    /// * `queue` - Queue in `ns:name` form
    /// * `cause` - Unacknowledged cause label (e.g. "timeout", "recovery")
    pub fn record_unacknowledged(&self, queue: &str, cause: &str) {
        if let Some(unacknowledged) = MESSAGES_UNACKNOWLEDGED.get() {
            unacknowledged.with_label_values(&[queue, cause]).inc();
        }
        tracing::trace!(queue = queue, cause = cause, "Recorded unacknowledged message");
    }

    pub fn record_dead_lettered(&self, queue: &str) {
        if let Some(dead_lettered) = MESSAGES_DEAD_LETTERED.get() {
            dead_lettered.with_label_values(&[queue]).inc();
        }
    }

    pub fn record_requeued(&self, queue: &str) {
        if let Some(requeued) = MESSAGES_REQUEUED.get() {
            requeued.with_label_values(&[queue]).inc();
        }
    }

    pub fn record_delayed(&self, queue: &str) {
        if let Some(delayed) = MESSAGES_DELAYED.get() {
            delayed.with_label_values(&[queue]).inc();
        }
    }

    pub fn record_expired(&self, queue: &str) {
        if let Some(expired) = MESSAGES_EXPIRED.get() {
            expired.with_label_values(&[queue]).inc();
        }
    }

    pub fn record_promotion(&self, queue: &str) {
        if let Some(promotions) = SCHEDULED_PROMOTIONS.get() {
            promotions.with_label_values(&[queue]).inc();
        }
    }

    /// Record how long a handler ran, in seconds.
    pub fn observe_handler(&self, queue: &str, duration_secs: f64) {
        if let Some(histogram) = HANDLER_DURATION.get() {
            histogram.with_label_values(&[queue]).observe(duration_secs);
        }
        tracing::trace!(
            queue = queue,
            duration_secs = duration_secs,
            "Recorded handler duration"
        );
    }

    /// Update the pending depth for a specific queue.
    pub fn update_queue_depth(&self, queue: &str, depth: u64) {
        if let Some(queue_depth) = QUEUE_DEPTH.get() {
            queue_depth.with_label_values(&[queue]).set(depth as f64);
        }
        tracing::trace!(queue = queue, depth = depth, "Updated queue depth metric");
    }

    pub fn inc_in_progress(&self) {
        if let Some(in_progress) = MESSAGES_IN_PROGRESS.get() {
            in_progress.inc();
        }
    }

    pub fn dec_in_progress(&self) {
        if let Some(in_progress) = MESSAGES_IN_PROGRESS.get() {
            in_progress.dec();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::{export_metrics, init_metrics};

    fn ensure_metrics_init() {
        let _ = init_metrics();
    }

    #[test]
    fn test_metrics_collector_new() {
        let collector = MetricsCollector::new();
        assert!(std::mem::size_of_val(&collector) == 0);
    }

    #[test]
    fn test_record_message_flow() {
        ensure_metrics_init();
        let collector = MetricsCollector::new();

        collector.record_produced("default:collector-test");
        collector.record_acknowledged("default:collector-test");
        collector.record_unacknowledged("default:collector-test", "timeout");
        collector.record_dead_lettered("default:collector-test");

        let metrics = export_metrics();
        assert!(metrics.contains("redis_mq_messages_unacknowledged_total"));
        assert!(metrics.contains("cause=\"timeout\""));
    }

    #[test]
    fn test_record_gc_outcomes() {
        ensure_metrics_init();
        let collector = MetricsCollector::new();

        collector.record_requeued("default:gc-test");
        collector.record_delayed("default:gc-test");
        collector.record_expired("default:gc-test");
        collector.record_promotion("default:gc-test");
    }

    #[test]
    fn test_handler_and_depth() {
        ensure_metrics_init();
        let collector = MetricsCollector::new();

        collector.observe_handler("default:handler-test", 0.12);
        collector.update_queue_depth("default:handler-test", 42);
        collector.inc_in_progress();
        collector.dec_in_progress();
    }
}
