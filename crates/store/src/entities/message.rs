//! Message entity.

use chatwire_common::events::{
    AttachmentPayload, LastMessagePayload, MessageKind, MessagePayload, MessageStatus,
};
use chrono::{DateTime, Utc};

/// A message within a conversation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Model {
    pub id: String,

    pub conversation_id: String,

    pub sender_id: String,

    /// Text content. Retained after soft deletion for audit purposes,
    /// but never exposed over the wire once deleted.
    pub content: Option<String>,

    pub kind: MessageKind,

    pub attachments: Vec<AttachmentPayload>,

    /// ID of the message this one replies to.
    pub reply_to: Option<String>,

    pub status: MessageStatus,

    pub sent_at: DateTime<Utc>,

    pub edited_at: Option<DateTime<Utc>>,

    pub deleted_at: Option<DateTime<Utc>>,

    /// User who soft deleted the message.
    pub deleted_by: Option<String>,
}

impl Model {
    /// Whether this message has been soft deleted.
    #[must_use]
    pub const fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    /// Converts to the wire payload shape.
    ///
    /// Deleted messages keep their ID and timestamps but lose content and
    /// attachments, so clients render a tombstone.
    #[must_use]
    pub fn to_payload(&self) -> MessagePayload {
        let deleted = self.is_deleted();
        MessagePayload {
            id: self.id.clone(),
            conversation_id: self.conversation_id.clone(),
            sender_id: self.sender_id.clone(),
            content: if deleted { None } else { self.content.clone() },
            kind: self.kind,
            attachments: if deleted {
                Vec::new()
            } else {
                self.attachments.clone()
            },
            reply_to: self.reply_to.clone(),
            status: self.status.clone(),
            sent_at: self.sent_at,
            edited_at: self.edited_at,
            is_deleted: deleted,
        }
    }

    /// Preview form used for a conversation's `lastMessage` field.
    #[must_use]
    pub fn to_last_message(&self) -> LastMessagePayload {
        LastMessagePayload {
            id: self.id.clone(),
            sender_id: self.sender_id.clone(),
            content: if self.is_deleted() {
                None
            } else {
                self.content.clone()
            },
            kind: self.kind,
            sent_at: self.sent_at,
        }
    }
}
