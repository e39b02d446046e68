//! Prometheus metrics registration and export.
//!
//! This module defines all Prometheus metrics used by redis-mq and provides
//! functions for initializing, registering, and exporting metrics.

use prometheus::{
    CounterVec, Encoder, Gauge, GaugeVec, HistogramVec, Opts, Registry, TextEncoder,
};
use std::sync::OnceLock;

/// Global Prometheus registry for all redis-mq metrics.
pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

/// Total messages produced, labeled by queue.
pub static MESSAGES_PRODUCED: OnceLock<CounterVec> = OnceLock::new();

/// Total messages acknowledged, labeled by queue.
pub static MESSAGES_ACKNOWLEDGED: OnceLock<CounterVec> = OnceLock::new();

/// Total messages unacknowledged, labeled by queue and cause.
pub static MESSAGES_UNACKNOWLEDGED: OnceLock<CounterVec> = OnceLock::new();

/// Total messages moved to the dead-letter log, labeled by queue.
pub static MESSAGES_DEAD_LETTERED: OnceLock<CounterVec> = OnceLock::new();

/// Total messages requeued by the collector, labeled by queue.
pub static MESSAGES_REQUEUED: OnceLock<CounterVec> = OnceLock::new();

/// Total messages delayed before retry, labeled by queue.
pub static MESSAGES_DELAYED: OnceLock<CounterVec> = OnceLock::new();

/// Total messages dropped on TTL expiry, labeled by queue.
pub static MESSAGES_EXPIRED: OnceLock<CounterVec> = OnceLock::new();

/// Total scheduled messages promoted to pending, labeled by queue.
pub static SCHEDULED_PROMOTIONS: OnceLock<CounterVec> = OnceLock::new();

/// Handler run time in seconds, labeled by queue.
pub static HANDLER_DURATION: OnceLock<HistogramVec> = OnceLock::new();

/// Number of messages currently handled.
pub static MESSAGES_IN_PROGRESS: OnceLock<Gauge> = OnceLock::new();

/// Number of pending messages, labeled by queue.
pub static QUEUE_DEPTH: OnceLock<GaugeVec> = OnceLock::new();

fn queue_counter(name: &str, help: &str) -> Result<CounterVec, prometheus::Error> {
    CounterVec::new(Opts::new(name, help), &["queue"])
}

/// Initialize all metrics and register them with the registry.
///
/// Calling it again after a successful initialization is a no-op.
///
/// # Errors
///
/// Returns a `prometheus::Error` if metric registration fails, typically due to
/// duplicate metric names or invalid metric configurations.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    if REGISTRY.get().is_some() {
        return Ok(());
    }

    let registry = Registry::new();

    // Message flow
    let produced = queue_counter("redis_mq_messages_produced_total", "Total messages produced")?;
    let acknowledged = queue_counter(
        "redis_mq_messages_acknowledged_total",
        "Total messages acknowledged",
    )?;
    let unacknowledged = CounterVec::new(
        Opts::new(
            "redis_mq_messages_unacknowledged_total",
            "Total messages unacknowledged",
        ),
        &["queue", "cause"],
    )?;
    let dead_lettered = queue_counter(
        "redis_mq_messages_dead_lettered_total",
        "Total messages moved to the dead-letter log",
    )?;
    let requeued = queue_counter(
        "redis_mq_messages_requeued_total",
        "Total messages requeued for another attempt",
    )?;
    let delayed = queue_counter(
        "redis_mq_messages_delayed_total",
        "Total messages scheduled for a delayed retry",
    )?;
    let expired = queue_counter(
        "redis_mq_messages_expired_total",
        "Total messages dropped after their TTL elapsed",
    )?;
    let promotions = queue_counter(
        "redis_mq_scheduled_promotions_total",
        "Total scheduled messages moved to pending",
    )?;

    // Handlers
    let handler_duration = HistogramVec::new(
        prometheus::HistogramOpts::new(
            "redis_mq_handler_duration_seconds",
            "Message handler run time in seconds",
        )
        .buckets(vec![0.005, 0.025, 0.1, 0.5, 1.0, 5.0, 30.0]),
        &["queue"],
    )?;
    let in_progress = Gauge::new(
        "redis_mq_messages_in_progress",
        "Number of messages currently being handled",
    )?;

    let queue_depth = GaugeVec::new(
        Opts::new("redis_mq_queue_depth", "Number of pending messages"),
        &["queue"],
    )?;

    registry.register(Box::new(produced.clone()))?;
    registry.register(Box::new(acknowledged.clone()))?;
    registry.register(Box::new(unacknowledged.clone()))?;
    registry.register(Box::new(dead_lettered.clone()))?;
    registry.register(Box::new(requeued.clone()))?;
    registry.register(Box::new(delayed.clone()))?;
    registry.register(Box::new(expired.clone()))?;
    registry.register(Box::new(promotions.clone()))?;
    registry.register(Box::new(handler_duration.clone()))?;
    registry.register(Box::new(in_progress.clone()))?;
    registry.register(Box::new(queue_depth.clone()))?;

    // If any of these fail, metrics were already initialized (idempotent)
    let _ = REGISTRY.set(registry);
    let _ = MESSAGES_PRODUCED.set(produced);
    let _ = MESSAGES_ACKNOWLEDGED.set(acknowledged);
    let _ = MESSAGES_UNACKNOWLEDGED.set(unacknowledged);
    let _ = MESSAGES_DEAD_LETTERED.set(dead_lettered);
    let _ = MESSAGES_REQUEUED.set(requeued);
    let _ = MESSAGES_DELAYED.set(delayed);
    let _ = MESSAGES_EXPIRED.set(expired);
    let _ = SCHEDULED_PROMOTIONS.set(promotions);
    let _ = HANDLER_DURATION.set(handler_duration);
    let _ = MESSAGES_IN_PROGRESS.set(in_progress);
    let _ = QUEUE_DEPTH.set(queue_depth);

    tracing::info!("Prometheus metrics initialized successfully");

    Ok(())
}

/// Export all registered metrics in Prometheus text format.
///
/// If the registry has not been initialized or encoding fails, returns a
/// comment line describing the problem.
pub fn export_metrics() -> String {
    let Some(registry) = REGISTRY.get() else {
        return "# Metrics not initialized. Call init_metrics() first.\n".to_string();
    };

    let encoder = TextEncoder::new();
    let metric_families = registry.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        return format!("# Error encoding metrics: {}\n", e);
    }

    String::from_utf8(buffer)
        .unwrap_or_else(|e| format!("# Error converting metrics to UTF-8: {}\n", e))
}
