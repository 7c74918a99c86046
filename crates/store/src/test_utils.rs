//! Test fixtures for conversation store tests.
//!
//! Builders for conversation and message models with sensible defaults.

use std::collections::HashMap;

use chatwire_common::events::{ConversationKind, MessageKind, MessageStatus};
use chrono::{DateTime, Utc};

use crate::entities::{conversation, message};

/// A direct conversation between two users, created just now.
#[must_use]
pub fn direct_conversation(id: &str, a: &str, b: &str) -> conversation::Model {
    let now = Utc::now();
    conversation::Model {
        id: id.to_string(),
        kind: ConversationKind::Direct,
        participants: vec![
            conversation::Participant::member(a, now),
            conversation::Participant::member(b, now),
        ],
        last_message: None,
        unread_counts: HashMap::new(),
        settings: conversation::Settings::default(),
        created_at: now,
        updated_at: now,
    }
}

/// A group conversation with one owner and any number of members.
#[must_use]
pub fn group_conversation(id: &str, owner: &str, members: &[&str]) -> conversation::Model {
    let now = Utc::now();
    let mut participants = vec![conversation::Participant::owner(owner, now)];
    participants.extend(
        members
            .iter()
            .map(|member| conversation::Participant::member(member, now)),
    );
    conversation::Model {
        id: id.to_string(),
        kind: ConversationKind::Group,
        participants,
        last_message: None,
        unread_counts: HashMap::new(),
        settings: conversation::Settings::default(),
        created_at: now,
        updated_at: now,
    }
}

/// A plain text message sent just now.
#[must_use]
pub fn text_message(id: &str, conversation_id: &str, sender_id: &str, content: &str) -> message::Model {
    message_at(id, conversation_id, sender_id, content, Utc::now())
}

/// A plain text message with an explicit send time.
#[must_use]
pub fn message_at(
    id: &str,
    conversation_id: &str,
    sender_id: &str,
    content: &str,
    sent_at: DateTime<Utc>,
) -> message::Model {
    message::Model {
        id: id.to_string(),
        conversation_id: conversation_id.to_string(),
        sender_id: sender_id.to_string(),
        content: Some(content.to_string()),
        kind: MessageKind::Text,
        attachments: Vec::new(),
        reply_to: None,
        status: MessageStatus::sent(),
        sent_at,
        edited_at: None,
        deleted_at: None,
        deleted_by: None,
    }
}
