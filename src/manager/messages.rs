//! Browsing and editing stored messages.

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::Paginated;
use crate::broker::enqueue_op;
use crate::error::{BrokerError, ValidationError};
use crate::keys::{KeySchema, QueueRef};
use crate::message::{Message, Priority};
use crate::store::{Store, Transaction};

/// A list entry with its position, counted from the head.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SequencedMessage {
    pub sequence_id: u64,
    pub message: Message,
}

/// Paginated reads, deletes, requeues and purges.
pub struct MessageManager {
    store: Arc<dyn Store>,
    keys: KeySchema,
}

fn page_bounds(skip: u64, take: u64) -> (i64, i64) {
    let start = i64::try_from(skip).unwrap_or(i64::MAX);
    let stop = start.saturating_add(i64::try_from(take).unwrap_or(i64::MAX)) - 1;
    (start, stop)
}

fn decode_or_warn(payload: &str) -> Option<Message> {
    match Message::from_json(payload) {
        Ok(message) => Some(message),
        Err(e) => {
            warn!(error = %e, "Skipping malformed stored message");
            None
        }
    }
}

impl MessageManager {
    pub fn new(store: Arc<dyn Store>, keys: KeySchema) -> Self {
        Self { store, keys }
    }

    async fn list_page(
        &self,
        key: &str,
        skip: u64,
        take: u64,
    ) -> Result<Paginated<SequencedMessage>, BrokerError> {
        let total = self.store.llen(key).await?;
        if take == 0 || skip >= total {
            return Ok(Paginated::empty(total));
        }
        let (start, stop) = page_bounds(skip, take);
        let items = self
            .store
            .lrange(key, start, stop)
            .await?
            .iter()
            .zip(skip..)
            .filter_map(|(payload, sequence_id)| {
                decode_or_warn(payload).map(|message| SequencedMessage {
                    sequence_id,
                    message,
                })
            })
            .collect();
        Ok(Paginated { total, items })
    }

    async fn zset_page(
        &self,
        key: &str,
        skip: u64,
        take: u64,
    ) -> Result<Paginated<Message>, BrokerError> {
        let total = self.store.zcard(key).await?;
        if take == 0 || skip >= total {
            return Ok(Paginated::empty(total));
        }
        let (start, stop) = page_bounds(skip, take);
        let items = self
            .store
            .zrange(key, start, stop)
            .await?
            .iter()
            .filter_map(|payload| decode_or_warn(payload))
            .collect();
        Ok(Paginated { total, items })
    }

    pub async fn pending(
        &self,
        queue: &QueueRef,
        skip: u64,
        take: u64,
    ) -> Result<Paginated<SequencedMessage>, BrokerError> {
        self.list_page(&self.keys.pending(queue), skip, take).await
    }

    pub async fn acknowledged(
        &self,
        queue: &QueueRef,
        skip: u64,
        take: u64,
    ) -> Result<Paginated<SequencedMessage>, BrokerError> {
        self.list_page(&self.keys.acknowledged(queue), skip, take)
            .await
    }

    pub async fn dead_lettered(
        &self,
        queue: &QueueRef,
        skip: u64,
        take: u64,
    ) -> Result<Paginated<SequencedMessage>, BrokerError> {
        self.list_page(&self.keys.dead_letter(queue), skip, take)
            .await
    }

    /// Prioritized messages, highest priority first.
    pub async fn pending_with_priority(
        &self,
        queue: &QueueRef,
        skip: u64,
        take: u64,
    ) -> Result<Paginated<Message>, BrokerError> {
        self.zset_page(&self.keys.pending_priority(queue), skip, take)
            .await
    }

    /// Scheduled messages of every queue, soonest first.
    pub async fn scheduled(&self, skip: u64, take: u64) -> Result<Paginated<Message>, BrokerError> {
        self.zset_page(&self.keys.scheduled(), skip, take).await
    }

    /// Stored form of the list entry at `sequence_id` if it is message `id`.
    async fn list_entry(
        &self,
        key: &str,
        sequence_id: u64,
        id: Uuid,
    ) -> Result<Option<(String, Message)>, BrokerError> {
        let index = i64::try_from(sequence_id).unwrap_or(i64::MAX);
        let Some(payload) = self.store.lindex(key, index).await? else {
            return Ok(None);
        };
        Ok(Message::from_json(&payload)
            .ok()
            .filter(|m| m.id() == Some(id))
            .map(|m| (payload, m)))
    }

    async fn delete_list_message(
        &self,
        key: &str,
        sequence_id: u64,
        id: Uuid,
    ) -> Result<bool, BrokerError> {
        let Some((payload, _)) = self.list_entry(key, sequence_id, id).await? else {
            debug!(message_id = %id, sequence_id, "Message to delete is already gone");
            return Ok(false);
        };
        let tx = Transaction::guarded_list(key, payload);
        Ok(self.store.exec(tx).await?)
    }

    async fn delete_zset_message(&self, key: &str, id: Uuid) -> Result<bool, BrokerError> {
        for payload in self.store.zrange(key, 0, -1).await? {
            let matches = Message::from_json(&payload).is_ok_and(|m| m.id() == Some(id));
            if matches {
                return Ok(self.store.zrem(key, &payload).await?);
            }
        }
        Ok(false)
    }

    /// Deletes a pending message. A message that is already gone is not an
    /// error; the return value tells whether something was deleted.
    pub async fn delete_pending_message(
        &self,
        queue: &QueueRef,
        sequence_id: u64,
        id: Uuid,
    ) -> Result<bool, BrokerError> {
        self.delete_list_message(&self.keys.pending(queue), sequence_id, id)
            .await
    }

    pub async fn delete_acknowledged_message(
        &self,
        queue: &QueueRef,
        sequence_id: u64,
        id: Uuid,
    ) -> Result<bool, BrokerError> {
        self.delete_list_message(&self.keys.acknowledged(queue), sequence_id, id)
            .await
    }

    pub async fn delete_dead_lettered_message(
        &self,
        queue: &QueueRef,
        sequence_id: u64,
        id: Uuid,
    ) -> Result<bool, BrokerError> {
        self.delete_list_message(&self.keys.dead_letter(queue), sequence_id, id)
            .await
    }

    pub async fn delete_pending_message_with_priority(
        &self,
        queue: &QueueRef,
        id: Uuid,
    ) -> Result<bool, BrokerError> {
        self.delete_zset_message(&self.keys.pending_priority(queue), id)
            .await
    }

    pub async fn delete_scheduled_message(&self, id: Uuid) -> Result<bool, BrokerError> {
        self.delete_zset_message(&self.keys.scheduled(), id).await
    }

    /// Moves a logged message back to its pending structure.
    ///
    /// The message keeps its id but gets fresh metadata. With a priority it
    /// goes to the priority set, otherwise to the plain list.
    async fn requeue_list_message(
        &self,
        queue: &QueueRef,
        from: &str,
        sequence_id: u64,
        id: Uuid,
        priority: Option<Priority>,
    ) -> Result<(), BrokerError> {
        let (payload, mut message) = self
            .list_entry(from, sequence_id, id)
            .await?
            .ok_or(ValidationError::MessageNotFound)?;

        message.reset_keeping_id();
        message.set_queue(queue.clone());
        message.set_priority(priority);

        let mut tx = Transaction::guarded_list(from, payload);
        enqueue_op(&mut tx, &self.keys, &message)?;
        if !self.store.exec(tx).await? {
            return Err(ValidationError::MessageNotFound.into());
        }
        info!(message_id = %id, queue = %queue, "Message requeued");
        Ok(())
    }

    pub async fn requeue_from_dead_letter(
        &self,
        queue: &QueueRef,
        sequence_id: u64,
        id: Uuid,
        priority: Option<Priority>,
    ) -> Result<(), BrokerError> {
        let from = self.keys.dead_letter(queue);
        self.requeue_list_message(queue, &from, sequence_id, id, priority)
            .await
    }

    pub async fn requeue_from_acknowledged(
        &self,
        queue: &QueueRef,
        sequence_id: u64,
        id: Uuid,
        priority: Option<Priority>,
    ) -> Result<(), BrokerError> {
        let from = self.keys.acknowledged(queue);
        self.requeue_list_message(queue, &from, sequence_id, id, priority)
            .await
    }

    pub async fn purge_pending(&self, queue: &QueueRef) -> Result<(), BrokerError> {
        Ok(self.store.del(&self.keys.pending(queue)).await?)
    }

    pub async fn purge_pending_with_priority(&self, queue: &QueueRef) -> Result<(), BrokerError> {
        Ok(self.store.del(&self.keys.pending_priority(queue)).await?)
    }

    pub async fn purge_acknowledged(&self, queue: &QueueRef) -> Result<(), BrokerError> {
        Ok(self.store.del(&self.keys.acknowledged(queue)).await?)
    }

    pub async fn purge_dead_letter(&self, queue: &QueueRef) -> Result<(), BrokerError> {
        Ok(self.store.del(&self.keys.dead_letter(queue)).await?)
    }

    pub async fn purge_scheduled(&self) -> Result<(), BrokerError> {
        Ok(self.store.del(&self.keys.scheduled()).await?)
    }
}
