//! Lifecycle and message events.
//!
//! Each producer and consumer owns an [`EventBus`]; callers subscribe to it
//! and receive every [`BrokerEvent`] emitted after subscription.

use std::fmt;

use tokio::sync::broadcast;
use uuid::Uuid;

use crate::keys::QueueRef;

/// Why a message left a handler without being acknowledged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnacknowledgedCause {
    /// The consume timeout elapsed first.
    Timeout,
    /// The handler panicked.
    CaughtError,
    /// The handler returned an error.
    Unacknowledged,
    /// Collected by the GC sweep after its consumer went offline.
    Recovery,
    /// The TTL had already elapsed when the message was received.
    TtlExpired,
}

impl UnacknowledgedCause {
    pub fn as_str(self) -> &'static str {
        match self {
            UnacknowledgedCause::Timeout => "timeout",
            UnacknowledgedCause::CaughtError => "caught_error",
            UnacknowledgedCause::Unacknowledged => "unacknowledged",
            UnacknowledgedCause::Recovery => "recovery",
            UnacknowledgedCause::TtlExpired => "ttl_expired",
        }
    }
}

impl fmt::Display for UnacknowledgedCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Events observable by users of a producer or consumer.
#[derive(Debug, Clone, PartialEq)]
pub enum BrokerEvent {
    GoingUp,
    Up,
    GoingDown,
    Down,
    /// A fetch loop found its queue empty after having been busy.
    Idle { queue: QueueRef },
    MessageProduced { id: Uuid, queue: QueueRef },
    MessageReceived { id: Uuid, queue: QueueRef },
    MessageAcknowledged { id: Uuid, queue: QueueRef },
    MessageUnacknowledged {
        id: Uuid,
        queue: QueueRef,
        cause: UnacknowledgedCause,
    },
    MessageDeadLettered {
        id: Uuid,
        queue: QueueRef,
        cause: UnacknowledgedCause,
    },
    GcMessageRequeued { id: Uuid, queue: QueueRef },
    GcMessageDelayed { id: Uuid, queue: QueueRef },
    /// Dropped because its TTL elapsed.
    GcMessageDestroyed { id: Uuid, queue: QueueRef },
}

const EVENT_CAPACITY: usize = 1024;

/// Broadcast channel for [`BrokerEvent`]s.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<BrokerEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BrokerEvent> {
        self.tx.subscribe()
    }

    /// Publishes an event. Having no subscribers is not an error.
    pub fn emit(&self, event: BrokerEvent) {
        let _ = self.tx.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_emit_and_receive() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        bus.emit(BrokerEvent::Up);
        assert_eq!(rx.recv().await.unwrap(), BrokerEvent::Up);
    }

    #[test]
    fn test_emit_without_subscribers() {
        let bus = EventBus::new();
        bus.emit(BrokerEvent::Down);
    }

    #[test]
    fn test_cause_display() {
        assert_eq!(UnacknowledgedCause::TtlExpired.to_string(), "ttl_expired");
        assert_eq!(UnacknowledgedCause::CaughtError.as_str(), "caught_error");
    }
}
