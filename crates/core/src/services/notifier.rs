//! Notification sink service.
//!
//! Offline recipients of a message are handed to this sink. Delivery of the
//! notification itself (push, email) happens outside this system; failures
//! are logged and never fail the send.

use async_trait::async_trait;
use chatwire_common::AppResult;
use chatwire_common::events::MessagePayload;
use std::sync::Arc;

/// Trait for notifying offline users about conversation activity.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    /// A message arrived for a recipient with no live session.
    async fn message_created(&self, recipient_id: &str, message: &MessagePayload) -> AppResult<()>;
}

/// A no-op implementation of `NotificationSink`.
#[derive(Clone, Default)]
pub struct NoOpNotificationSink;

#[async_trait]
impl NotificationSink for NoOpNotificationSink {
    async fn message_created(
        &self,
        _recipient_id: &str,
        _message: &MessagePayload,
    ) -> AppResult<()> {
        Ok(())
    }
}

/// Wrapper for boxed `NotificationSink` trait object.
pub type NotificationSinkService = Arc<dyn NotificationSink>;
