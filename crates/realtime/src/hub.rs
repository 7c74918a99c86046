//! In-process broadcast hub.
//!
//! One lazily-created `broadcast` channel per named topic. Publishing to a
//! topic nobody listens on is a no-op, and topics whose last receiver is
//! gone are pruned on the next publish.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chatwire_common::AppResult;
use chatwire_common::events::{
    ConversationPayload, MessageDeletedPayload, MessagePayload, ReadReceiptPayload, ServerEvent,
    channels,
};
use chatwire_core::EventPublisher;
use tokio::sync::broadcast;

/// Fan-out hub for realtime events.
///
/// Message events go to the conversation channel and every participant's
/// user channel; the double delivery is resolved by client-side de-dup.
/// Read receipts, deletions and typing stay on the conversation channel,
/// and conversation lifecycle events go to user channels only.
#[derive(Clone)]
pub struct RealtimeHub {
    senders: Arc<RwLock<HashMap<String, broadcast::Sender<ServerEvent>>>>,
    capacity: usize,
}

impl RealtimeHub {
    /// Create a hub whose per-channel buffers hold `capacity` events.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            senders: Arc::new(RwLock::new(HashMap::new())),
            capacity: capacity.max(1),
        }
    }

    /// Subscribe to a channel, creating it if needed.
    pub fn subscribe(&self, channel: &str) -> broadcast::Receiver<ServerEvent> {
        let mut senders = match self.senders.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        senders
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe()
    }

    /// Publish an event to a channel. Silently dropped when nobody listens.
    pub fn publish(&self, channel: &str, event: ServerEvent) {
        let stale = {
            let senders = match self.senders.read() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            match senders.get(channel) {
                Some(tx) => {
                    let _ = tx.send(event);
                    tx.receiver_count() == 0
                }
                None => false,
            }
        };
        if stale {
            self.remove_if_idle(channel);
        }
    }

    /// Number of live subscribers on a channel.
    #[must_use]
    pub fn subscriber_count(&self, channel: &str) -> usize {
        let senders = match self.senders.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        senders
            .get(channel)
            .map_or(0, broadcast::Sender::receiver_count)
    }

    fn remove_if_idle(&self, channel: &str) {
        let mut senders = match self.senders.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        // Re-check under the write lock; a subscriber may have raced in.
        if senders
            .get(channel)
            .is_some_and(|tx| tx.receiver_count() == 0)
        {
            senders.remove(channel);
        }
    }

    fn publish_to_users(&self, user_ids: &[String], event: &ServerEvent) {
        for user_id in user_ids {
            self.publish(&channels::user(user_id), event.clone());
        }
    }
}

impl Default for RealtimeHub {
    fn default() -> Self {
        Self::new(1000)
    }
}

#[async_trait]
impl EventPublisher for RealtimeHub {
    async fn publish_message(
        &self,
        participant_ids: &[String],
        message: &MessagePayload,
    ) -> AppResult<()> {
        let event = ServerEvent::Message(message.clone());
        self.publish(&channels::conversation(&message.conversation_id), event.clone());
        self.publish_to_users(participant_ids, &event);
        Ok(())
    }

    async fn publish_message_read(
        &self,
        _participant_ids: &[String],
        receipt: &ReadReceiptPayload,
    ) -> AppResult<()> {
        self.publish(
            &channels::conversation(&receipt.conversation_id),
            ServerEvent::MessageRead(receipt.clone()),
        );
        Ok(())
    }

    async fn publish_message_deleted(
        &self,
        _participant_ids: &[String],
        deleted: &MessageDeletedPayload,
    ) -> AppResult<()> {
        self.publish(
            &channels::conversation(&deleted.conversation_id),
            ServerEvent::MessageDeleted(deleted.clone()),
        );
        Ok(())
    }

    async fn publish_conversation_created(
        &self,
        conversation: &ConversationPayload,
    ) -> AppResult<()> {
        let event = ServerEvent::ConversationCreated(conversation.clone());
        self.publish_to_users(&conversation.active_participant_ids(), &event);
        Ok(())
    }

    async fn publish_conversation_updated(
        &self,
        conversation: &ConversationPayload,
    ) -> AppResult<()> {
        let event = ServerEvent::ConversationUpdated(conversation.clone());
        self.publish_to_users(&conversation.active_participant_ids(), &event);
        Ok(())
    }
}
