//! Wire protocol shared by the client and server.
//!
//! Defines channel names, the realtime event vocabulary in both directions,
//! and the payload shapes carried over the REST API. All payloads serialize
//! with camelCase field names.

#![allow(missing_docs)]

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Channel names for event routing.
pub mod channels {
    /// Global conversation events for the authenticated user.
    pub const CHAT: &str = "chat";
    /// Online/offline announcements.
    pub const PRESENCE: &str = "presence";
    /// Prefix for per-conversation channels.
    pub const CONVERSATION_PREFIX: &str = "chat:";
    /// Prefix for per-user channels.
    pub const USER_PREFIX: &str = "user:";

    /// Channel carrying events scoped to one conversation.
    #[must_use]
    pub fn conversation(conversation_id: &str) -> String {
        format!("{CONVERSATION_PREFIX}{conversation_id}")
    }

    /// Channel carrying events addressed to one user's sessions.
    #[must_use]
    pub fn user(user_id: &str) -> String {
        format!("{USER_PREFIX}{user_id}")
    }

    /// Extracts the conversation ID from a per-conversation channel name.
    #[must_use]
    pub fn conversation_id(channel: &str) -> Option<&str> {
        channel.strip_prefix(CONVERSATION_PREFIX)
    }
}

/// Conversation kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConversationKind {
    Direct,
    Group,
    Support,
}

/// Role of a participant within a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParticipantRole {
    Owner,
    Member,
}

/// Message content kinds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    #[default]
    Text,
    Image,
    Video,
    Audio,
    Document,
    Location,
    System,
}

impl MessageKind {
    /// Kind implied by an attachment's MIME type.
    #[must_use]
    pub fn from_mime(mime_type: &str) -> Self {
        match mime_type.split('/').next() {
            Some("image") => Self::Image,
            Some("video") => Self::Video,
            Some("audio") => Self::Audio,
            _ => Self::Document,
        }
    }
}

/// Delivery state of a message.
///
/// States only ever advance: `sent` to `delivered` to `read`. A message
/// already marked read never regresses to delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageState {
    Sent,
    Delivered,
    Read,
}

impl MessageState {
    /// Returns whether advancing to `next` is a forward transition.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Sent, Self::Delivered | Self::Read) | (Self::Delivered, Self::Read)
        )
    }
}

/// Delivery status of a message, with transition timestamps.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageStatus {
    pub state: MessageState,
    #[serde(default)]
    pub delivered_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub read_at: Option<DateTime<Utc>>,
}

impl MessageStatus {
    /// Initial status of a freshly sent message.
    #[must_use]
    pub const fn sent() -> Self {
        Self {
            state: MessageState::Sent,
            delivered_at: None,
            read_at: None,
        }
    }

    /// Advances to `delivered` if the transition is allowed.
    ///
    /// Returns whether the status changed.
    pub fn mark_delivered(&mut self, at: DateTime<Utc>) -> bool {
        if !self.state.can_transition_to(MessageState::Delivered) {
            return false;
        }
        self.state = MessageState::Delivered;
        self.delivered_at = Some(at);
        true
    }

    /// Advances to `read` if the transition is allowed.
    ///
    /// Returns whether the status changed.
    pub fn mark_read(&mut self, at: DateTime<Utc>) -> bool {
        if !self.state.can_transition_to(MessageState::Read) {
            return false;
        }
        if self.delivered_at.is_none() {
            self.delivered_at = Some(at);
        }
        self.state = MessageState::Read;
        self.read_at = Some(at);
        true
    }
}

/// A file attached to a message. Binary storage lives elsewhere; this is
/// only the descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachmentPayload {
    pub id: String,
    pub file_name: String,
    pub file_size: u64,
    pub mime_type: String,
    pub url: String,
    #[serde(default)]
    pub thumbnail_url: Option<String>,
}

/// A participant entry within a conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantPayload {
    pub user_id: String,
    pub role: ParticipantRole,
    pub joined_at: DateTime<Utc>,
    #[serde(default)]
    pub last_seen_at: Option<DateTime<Utc>>,
    pub is_active: bool,
}

/// Denormalized preview of a conversation's most recent message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LastMessagePayload {
    pub id: String,
    pub sender_id: String,
    #[serde(default)]
    pub content: Option<String>,
    pub kind: MessageKind,
    pub sent_at: DateTime<Utc>,
}

/// A per-user mute entry, optionally expiring.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MuteEntry {
    pub user_id: String,
    #[serde(default)]
    pub until: Option<DateTime<Utc>>,
}

/// Block state of a conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockState {
    pub blocked_by: String,
    pub blocked_at: DateTime<Utc>,
}

/// Per-user conversation settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationSettingsPayload {
    #[serde(default)]
    pub archived_by: Vec<String>,
    #[serde(default)]
    pub pinned_by: Vec<String>,
    #[serde(default)]
    pub muted_by: Vec<MuteEntry>,
    #[serde(default)]
    pub block: Option<BlockState>,
}

/// A conversation summary as exposed over the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationPayload {
    pub id: String,
    pub kind: ConversationKind,
    pub participants: Vec<ParticipantPayload>,
    #[serde(default)]
    pub last_message: Option<LastMessagePayload>,
    /// Unread message count keyed by user ID.
    #[serde(default)]
    pub unread_counts: HashMap<String, u32>,
    #[serde(default)]
    pub settings: ConversationSettingsPayload,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ConversationPayload {
    /// IDs of all active participants.
    #[must_use]
    pub fn active_participant_ids(&self) -> Vec<String> {
        self.participants
            .iter()
            .filter(|p| p.is_active)
            .map(|p| p.user_id.clone())
            .collect()
    }
}

/// A message as exposed over the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagePayload {
    pub id: String,
    pub conversation_id: String,
    pub sender_id: String,
    #[serde(default)]
    pub content: Option<String>,
    pub kind: MessageKind,
    #[serde(default)]
    pub attachments: Vec<AttachmentPayload>,
    #[serde(default)]
    pub reply_to: Option<String>,
    pub status: MessageStatus,
    pub sent_at: DateTime<Utc>,
    #[serde(default)]
    pub edited_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub is_deleted: bool,
}

impl MessagePayload {
    /// Preview form used for a conversation's `lastMessage` field.
    #[must_use]
    pub fn to_last_message(&self) -> LastMessagePayload {
        LastMessagePayload {
            id: self.id.clone(),
            sender_id: self.sender_id.clone(),
            content: if self.is_deleted {
                None
            } else {
                self.content.clone()
            },
            kind: self.kind,
            sent_at: self.sent_at,
        }
    }
}

/// Read receipt covering one or more messages in a conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadReceiptPayload {
    pub conversation_id: String,
    pub user_id: String,
    pub message_ids: Vec<String>,
    pub read_at: DateTime<Utc>,
}

/// Typing indicator scoped to a conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingPayload {
    pub conversation_id: String,
    pub user_id: String,
}

/// Online/offline announcement for a user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresencePayload {
    pub user_id: String,
}

/// Tombstone announcement for a deleted message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageDeletedPayload {
    pub conversation_id: String,
    pub message_id: String,
}

/// Reference to a conversation, used by join/leave and typing requests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationRefPayload {
    pub conversation_id: String,
}

/// Request to flip read receipts for a set of messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarkReadPayload {
    pub conversation_id: String,
    pub message_ids: Vec<String>,
}

/// A confirmed message republished by its sender for fan-out.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessagePayload {
    pub conversation_id: String,
    pub message: MessagePayload,
}

/// Events sent from a client session to the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "body")]
pub enum ClientEvent {
    /// Enter a conversation channel to receive its scoped events.
    #[serde(rename = "chat:join_conversation")]
    JoinConversation(ConversationRefPayload),
    /// Leave a conversation channel.
    #[serde(rename = "chat:leave_conversation")]
    LeaveConversation(ConversationRefPayload),
    /// Republish a confirmed message for fan-out to other sessions.
    #[serde(rename = "chat:send_message")]
    SendMessage(SendMessagePayload),
    /// Flip read receipts for the session user.
    #[serde(rename = "chat:mark_read")]
    MarkRead(MarkReadPayload),
    /// The session user started typing.
    #[serde(rename = "chat:typing_start")]
    TypingStart(ConversationRefPayload),
    /// The session user stopped typing.
    #[serde(rename = "chat:typing_stop")]
    TypingStop(ConversationRefPayload),
}

/// Events pushed from the server to client sessions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "body")]
pub enum ServerEvent {
    /// A message was created or updated in a conversation.
    #[serde(rename = "chat:message")]
    Message(MessagePayload),
    /// A user read messages in a conversation.
    #[serde(rename = "chat:message_read")]
    MessageRead(ReadReceiptPayload),
    /// A message was deleted.
    #[serde(rename = "chat:message_deleted")]
    MessageDeleted(MessageDeletedPayload),
    /// A conversation involving the recipient was created.
    #[serde(rename = "chat:conversation_created")]
    ConversationCreated(ConversationPayload),
    /// Conversation metadata changed.
    #[serde(rename = "chat:conversation_updated")]
    ConversationUpdated(ConversationPayload),
    /// A user started typing in a conversation.
    #[serde(rename = "chat:typing_start")]
    TypingStart(TypingPayload),
    /// A user stopped typing in a conversation.
    #[serde(rename = "chat:typing_stop")]
    TypingStop(TypingPayload),
    /// A user came online.
    #[serde(rename = "presence:online")]
    PresenceOnline(PresencePayload),
    /// A user went offline.
    #[serde(rename = "presence:offline")]
    PresenceOffline(PresencePayload),
    /// The session credential expired; the connection closes after this.
    #[serde(rename = "auth:token_expired")]
    TokenExpired,
}

impl ServerEvent {
    /// The conversation this event is scoped to, if any.
    #[must_use]
    pub fn conversation_id(&self) -> Option<&str> {
        match self {
            Self::Message(m) => Some(&m.conversation_id),
            Self::MessageRead(r) => Some(&r.conversation_id),
            Self::MessageDeleted(d) => Some(&d.conversation_id),
            Self::ConversationCreated(c) | Self::ConversationUpdated(c) => Some(&c.id),
            Self::TypingStart(t) | Self::TypingStop(t) => Some(&t.conversation_id),
            Self::PresenceOnline(_) | Self::PresenceOffline(_) | Self::TokenExpired => None,
        }
    }
}

// === REST request/response bodies ===

/// Body of `POST /api/conversations/{id}/messages`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageRequest {
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub kind: MessageKind,
    #[serde(default)]
    pub attachments: Vec<AttachmentPayload>,
    #[serde(default)]
    pub reply_to: Option<String>,
}

/// Body of `POST /api/conversations`.
///
/// Without a `kind`, looks up or creates the direct conversation with
/// `participant_id`. With `kind` set to group or support, creates a new
/// conversation with the listed participants.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateConversationRequest {
    #[serde(default)]
    pub participant_id: Option<String>,
    #[serde(default)]
    pub kind: Option<ConversationKind>,
    #[serde(default)]
    pub participant_ids: Vec<String>,
}

/// Body of `POST /api/conversations/{id}/read`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarkReadRequest {
    #[serde(default)]
    pub message_ids: Vec<String>,
}

/// Response of `POST /api/conversations/{id}/read`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarkReadResponse {
    /// Number of messages whose receipt actually flipped.
    pub read_count: u64,
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn sample_message() -> MessagePayload {
        MessagePayload {
            id: "msg1".to_string(),
            conversation_id: "conv1".to_string(),
            sender_id: "user1".to_string(),
            content: Some("Hello".to_string()),
            kind: MessageKind::Text,
            attachments: vec![],
            reply_to: None,
            status: MessageStatus::sent(),
            sent_at: Utc::now(),
            edited_at: None,
            is_deleted: false,
        }
    }

    #[test]
    fn test_channel_names() {
        assert_eq!(channels::conversation("conv1"), "chat:conv1");
        assert_eq!(channels::user("user1"), "user:user1");
        assert_eq!(channels::conversation_id("chat:conv1"), Some("conv1"));
        assert_eq!(channels::conversation_id("user:user1"), None);
        assert_eq!(channels::conversation_id(channels::CHAT), None);
    }

    #[test]
    fn test_client_event_serialization() {
        let event = ClientEvent::SendMessage(SendMessagePayload {
            conversation_id: "conv1".to_string(),
            message: sample_message(),
        });

        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"chat:send_message\""));
        assert!(json.contains("\"conversationId\":\"conv1\""));
        assert!(json.contains("\"senderId\":\"user1\""));

        let parsed: ClientEvent = serde_json::from_str(&json).unwrap();
        assert!(matches!(parsed, ClientEvent::SendMessage(_)));
    }

    #[test]
    fn test_typing_event_serialization() {
        let event = ServerEvent::TypingStart(TypingPayload {
            conversation_id: "conv1".to_string(),
            user_id: "user2".to_string(),
        });

        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"chat:typing_start\""));
        assert!(json.contains("\"userId\":\"user2\""));
    }

    #[test]
    fn test_token_expired_serialization() {
        let json = serde_json::to_string(&ServerEvent::TokenExpired).unwrap();
        assert_eq!(json, "{\"type\":\"auth:token_expired\"}");

        let parsed: ServerEvent = serde_json::from_str(&json).unwrap();
        assert!(matches!(parsed, ServerEvent::TokenExpired));
    }

    #[test]
    fn test_server_event_conversation_id() {
        let message = ServerEvent::Message(sample_message());
        assert_eq!(message.conversation_id(), Some("conv1"));

        let presence = ServerEvent::PresenceOnline(PresencePayload {
            user_id: "user1".to_string(),
        });
        assert_eq!(presence.conversation_id(), None);
    }

    #[test]
    fn test_message_state_transitions() {
        use MessageState::{Delivered, Read, Sent};

        assert!(Sent.can_transition_to(Delivered));
        assert!(Sent.can_transition_to(Read));
        assert!(Delivered.can_transition_to(Read));

        assert!(!Read.can_transition_to(Delivered));
        assert!(!Read.can_transition_to(Sent));
        assert!(!Delivered.can_transition_to(Sent));
        assert!(!Sent.can_transition_to(Sent));
    }

    #[test]
    fn test_message_status_monotonic() {
        let now = Utc::now();
        let mut status = MessageStatus::sent();

        assert!(status.mark_delivered(now));
        assert!(!status.mark_delivered(now));
        assert!(status.mark_read(now));
        assert!(!status.mark_read(now));
        assert!(!status.mark_delivered(now));
        assert_eq!(status.state, MessageState::Read);
    }

    #[test]
    fn test_read_skips_delivered_but_keeps_timestamp() {
        let now = Utc::now();
        let mut status = MessageStatus::sent();

        assert!(status.mark_read(now));
        assert_eq!(status.state, MessageState::Read);
        assert_eq!(status.delivered_at, Some(now));
        assert_eq!(status.read_at, Some(now));
    }

    #[test]
    fn test_kind_from_mime() {
        assert_eq!(MessageKind::from_mime("image/png"), MessageKind::Image);
        assert_eq!(MessageKind::from_mime("video/mp4"), MessageKind::Video);
        assert_eq!(MessageKind::from_mime("audio/ogg"), MessageKind::Audio);
        assert_eq!(MessageKind::from_mime("text/plain"), MessageKind::Document);
        assert_eq!(
            MessageKind::from_mime("application/pdf"),
            MessageKind::Document
        );
    }

    #[test]
    fn test_deleted_message_preview_is_blank() {
        let mut message = sample_message();
        message.is_deleted = true;

        let preview = message.to_last_message();
        assert_eq!(preview.content, None);
        assert_eq!(preview.id, "msg1");
    }
}
