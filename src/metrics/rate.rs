//! Per-participant message rate counters.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use super::collectors::MetricsCollector;
use crate::events::UnacknowledgedCause;
use crate::keys::QueueRef;

/// Point-in-time copy of a [`MessageRate`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RateSnapshot {
    pub input: u64,
    pub acknowledged: u64,
    pub unacknowledged: u64,
    pub dead_lettered: u64,
}

impl RateSnapshot {
    /// Returns the total number of messages handled (acknowledged + unacknowledged).
    pub fn total_processed(&self) -> u64 {
        self.acknowledged + self.unacknowledged
    }
}

/// Counts messages flowing through one producer or consumer and forwards
/// them to Prometheus when enabled.
#[derive(Debug)]
pub struct MessageRate {
    input: AtomicU64,
    acknowledged: AtomicU64,
    unacknowledged: AtomicU64,
    dead_lettered: AtomicU64,
    prometheus: bool,
    stopped: AtomicBool,
    collector: MetricsCollector,
}

impl MessageRate {
    pub fn new(prometheus: bool) -> Self {
        Self {
            input: AtomicU64::new(0),
            acknowledged: AtomicU64::new(0),
            unacknowledged: AtomicU64::new(0),
            dead_lettered: AtomicU64::new(0),
            prometheus,
            stopped: AtomicBool::new(false),
            collector: MetricsCollector::new(),
        }
    }

    fn active(&self) -> bool {
        !self.stopped.load(Ordering::SeqCst)
    }

    pub fn increment_input_slot(&self, queue: &QueueRef) {
        if !self.active() {
            return;
        }
        self.input.fetch_add(1, Ordering::SeqCst);
        if self.prometheus {
            self.collector.record_produced(&queue.to_string());
        }
    }

    pub fn increment_acknowledged_slot(&self, queue: &QueueRef) {
        if !self.active() {
            return;
        }
        self.acknowledged.fetch_add(1, Ordering::SeqCst);
        if self.prometheus {
            self.collector.record_acknowledged(&queue.to_string());
        }
    }

    pub fn increment_unacknowledged_slot(&self, queue: &QueueRef, cause: UnacknowledgedCause) {
        if !self.active() {
            return;
        }
        self.unacknowledged.fetch_add(1, Ordering::SeqCst);
        if self.prometheus {
            self.collector
                .record_unacknowledged(&queue.to_string(), cause.as_str());
        }
    }

    pub fn increment_dead_lettered_slot(&self, queue: &QueueRef) {
        if !self.active() {
            return;
        }
        self.dead_lettered.fetch_add(1, Ordering::SeqCst);
        if self.prometheus {
            self.collector.record_dead_lettered(&queue.to_string());
        }
    }

    pub fn snapshot(&self) -> RateSnapshot {
        RateSnapshot {
            input: self.input.load(Ordering::SeqCst),
            acknowledged: self.acknowledged.load(Ordering::SeqCst),
            unacknowledged: self.unacknowledged.load(Ordering::SeqCst),
            dead_lettered: self.dead_lettered.load(Ordering::SeqCst),
        }
    }

    /// Stops counting and returns the final snapshot.
    pub fn stop(&self) -> RateSnapshot {
        self.stopped.store(true, Ordering::SeqCst);
        self.snapshot()
    }
}
