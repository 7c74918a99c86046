//! Event publisher service.
//!
//! Provides an abstraction for publishing real-time events.
//! The actual implementation is provided by the realtime crate.

use async_trait::async_trait;
use chatwire_common::AppResult;
use chatwire_common::events::{ConversationPayload, MessageDeletedPayload, MessagePayload, ReadReceiptPayload};
use std::sync::Arc;

/// Trait for publishing real-time events.
///
/// This allows the core services to publish events without directly
/// depending on the session hub implementation.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish a new or updated message to its conversation channel and to
    /// every participant's user channel.
    async fn publish_message(
        &self,
        participant_ids: &[String],
        message: &MessagePayload,
    ) -> AppResult<()>;

    /// Publish a read receipt.
    async fn publish_message_read(
        &self,
        participant_ids: &[String],
        receipt: &ReadReceiptPayload,
    ) -> AppResult<()>;

    /// Publish a message deletion tombstone.
    async fn publish_message_deleted(
        &self,
        participant_ids: &[String],
        deleted: &MessageDeletedPayload,
    ) -> AppResult<()>;

    /// Publish a newly created conversation to its participants.
    async fn publish_conversation_created(
        &self,
        conversation: &ConversationPayload,
    ) -> AppResult<()>;

    /// Publish updated conversation metadata to its participants.
    async fn publish_conversation_updated(
        &self,
        conversation: &ConversationPayload,
    ) -> AppResult<()>;
}

/// A no-op implementation of `EventPublisher` for testing or when real-time
/// events are disabled.
#[derive(Clone, Default)]
pub struct NoOpEventPublisher;

#[async_trait]
impl EventPublisher for NoOpEventPublisher {
    async fn publish_message(
        &self,
        _participant_ids: &[String],
        _message: &MessagePayload,
    ) -> AppResult<()> {
        Ok(())
    }

    async fn publish_message_read(
        &self,
        _participant_ids: &[String],
        _receipt: &ReadReceiptPayload,
    ) -> AppResult<()> {
        Ok(())
    }

    async fn publish_message_deleted(
        &self,
        _participant_ids: &[String],
        _deleted: &MessageDeletedPayload,
    ) -> AppResult<()> {
        Ok(())
    }

    async fn publish_conversation_created(
        &self,
        _conversation: &ConversationPayload,
    ) -> AppResult<()> {
        Ok(())
    }

    async fn publish_conversation_updated(
        &self,
        _conversation: &ConversationPayload,
    ) -> AppResult<()> {
        Ok(())
    }
}

/// Wrapper for boxed `EventPublisher` trait object.
pub type EventPublisherService = Arc<dyn EventPublisher>;
