//! Management operations over stored queues and messages.
//!
//! These read and edit the store directly and need no running producer or
//! consumer.

pub mod messages;
pub mod queues;

use serde::Serialize;

pub use self::messages::{MessageManager, SequencedMessage};
pub use self::queues::{ConsumerInfo, QueueManager, QueueMetrics};

/// One page of a listing.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Paginated<T> {
    /// Size of the whole listing.
    pub total: u64,
    pub items: Vec<T>,
}

impl<T> Paginated<T> {
    pub fn empty(total: u64) -> Self {
        Self {
            total,
            items: Vec::new(),
        }
    }
}
