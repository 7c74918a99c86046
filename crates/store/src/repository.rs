//! Conversation repository.
//!
//! All conversation aggregates live behind one lock. Every operation takes
//! the write lock exactly once, so a reader never observes a message log,
//! unread counter or `lastMessage` preview that disagree with each other.

use std::collections::HashMap;
use std::sync::Arc;

use chatwire_common::events::BlockState;
use chatwire_common::{AppError, AppResult};
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::entities::{conversation, message};

#[derive(Debug, Default)]
struct StoreState {
    conversations: HashMap<String, conversation::Model>,
    /// Message logs keyed by conversation ID, ordered by `sent_at`.
    messages: HashMap<String, Vec<message::Model>>,
}

/// Repository for conversation aggregates.
#[derive(Clone, Default)]
pub struct ConversationRepository {
    state: Arc<RwLock<StoreState>>,
}

impl ConversationRepository {
    /// Create a new, empty repository.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a new conversation.
    pub async fn insert(
        &self,
        conversation: conversation::Model,
    ) -> AppResult<conversation::Model> {
        let mut state = self.state.write().await;
        if state.conversations.contains_key(&conversation.id) {
            return Err(AppError::Conflict(format!(
                "Conversation {} already exists",
                conversation.id
            )));
        }
        state.messages.insert(conversation.id.clone(), Vec::new());
        state
            .conversations
            .insert(conversation.id.clone(), conversation.clone());
        Ok(conversation)
    }

    /// Look up or insert the direct conversation between the candidate's two
    /// participants.
    ///
    /// Returns the winning row and whether it was created by this call. The
    /// check and the insert happen under one write lock, so two concurrent
    /// callers for the same pair always converge on a single conversation.
    pub async fn get_or_create_direct(
        &self,
        candidate: conversation::Model,
    ) -> AppResult<(conversation::Model, bool)> {
        if candidate.kind != chatwire_common::events::ConversationKind::Direct
            || candidate.participants.len() != 2
        {
            return Err(AppError::Validation(
                "Direct conversations require exactly two participants".to_string(),
            ));
        }
        let a = candidate.participants[0].user_id.clone();
        let b = candidate.participants[1].user_id.clone();

        let mut state = self.state.write().await;
        if let Some(existing) = state
            .conversations
            .values()
            .find(|c| c.is_direct_between(&a, &b))
        {
            return Ok((existing.clone(), false));
        }

        state.messages.insert(candidate.id.clone(), Vec::new());
        state
            .conversations
            .insert(candidate.id.clone(), candidate.clone());
        Ok((candidate, true))
    }

    /// Find a conversation by ID.
    pub async fn find_by_id(&self, id: &str) -> AppResult<Option<conversation::Model>> {
        let state = self.state.read().await;
        Ok(state.conversations.get(id).cloned())
    }

    /// All conversations where the user is an active participant, most
    /// recently updated first.
    pub async fn conversations_for_user(
        &self,
        user_id: &str,
    ) -> AppResult<Vec<conversation::Model>> {
        let state = self.state.read().await;
        let mut conversations: Vec<conversation::Model> = state
            .conversations
            .values()
            .filter(|c| c.is_active_participant(user_id))
            .cloned()
            .collect();
        conversations.sort_by(|a, b| {
            b.updated_at
                .cmp(&a.updated_at)
                .then_with(|| a.id.cmp(&b.id))
        });
        Ok(conversations)
    }

    /// The ordered message log of a conversation.
    pub async fn messages(&self, conversation_id: &str) -> AppResult<Vec<message::Model>> {
        let state = self.state.read().await;
        if !state.conversations.contains_key(conversation_id) {
            return Err(AppError::ConversationNotFound(conversation_id.to_string()));
        }
        Ok(state
            .messages
            .get(conversation_id)
            .cloned()
            .unwrap_or_default())
    }

    /// Find a single message within a conversation.
    pub async fn find_message(
        &self,
        conversation_id: &str,
        message_id: &str,
    ) -> AppResult<Option<message::Model>> {
        let state = self.state.read().await;
        if !state.conversations.contains_key(conversation_id) {
            return Err(AppError::ConversationNotFound(conversation_id.to_string()));
        }
        Ok(state
            .messages
            .get(conversation_id)
            .and_then(|log| log.iter().find(|m| m.id == message_id))
            .cloned())
    }

    /// Append a message to its conversation.
    ///
    /// In the same critical section this inserts the message in timestamp
    /// order, refreshes the `lastMessage` preview and bumps the unread
    /// counter of every active participant except the sender. Re-sending an
    /// ID that already exists is a conflict.
    pub async fn append_message(&self, message: message::Model) -> AppResult<conversation::Model> {
        let mut state = self.state.write().await;
        let state = &mut *state;
        let conversation = state
            .conversations
            .get_mut(&message.conversation_id)
            .ok_or_else(|| AppError::ConversationNotFound(message.conversation_id.clone()))?;

        let log = state
            .messages
            .entry(message.conversation_id.clone())
            .or_default();
        if log.iter().any(|m| m.id == message.id) {
            return Err(AppError::Conflict(format!(
                "Message {} already exists",
                message.id
            )));
        }

        let position = insert_position(log, message.sent_at);
        let is_last = position == log.len();
        log.insert(position, message.clone());

        if is_last {
            conversation.last_message = Some(message.to_last_message());
        }
        conversation.updated_at = conversation.updated_at.max(message.sent_at);

        for participant in &conversation.participants {
            if participant.is_active && participant.user_id != message.sender_id {
                *conversation
                    .unread_counts
                    .entry(participant.user_id.clone())
                    .or_insert(0) += 1;
            }
        }

        Ok(conversation.clone())
    }

    /// Advance a message to `delivered` if its state allows it.
    ///
    /// A message already read stays read; the call is then a no-op.
    pub async fn set_delivered(
        &self,
        conversation_id: &str,
        message_id: &str,
        at: DateTime<Utc>,
    ) -> AppResult<message::Model> {
        let mut state = self.state.write().await;
        if !state.conversations.contains_key(conversation_id) {
            return Err(AppError::ConversationNotFound(conversation_id.to_string()));
        }
        let message = state
            .messages
            .get_mut(conversation_id)
            .and_then(|log| log.iter_mut().find(|m| m.id == message_id))
            .ok_or_else(|| AppError::MessageNotFound(message_id.to_string()))?;

        message.status.mark_delivered(at);
        Ok(message.clone())
    }

    /// Flip read receipts for a set of messages on behalf of one reader.
    ///
    /// Messages sent by the reader, unknown IDs and receipts that would move
    /// a state backwards are skipped, so replayed receipts are harmless.
    /// Returns the IDs that actually flipped. The reader's unread counter is
    /// zeroed and their `last_seen_at` advanced in the same section.
    pub async fn mark_read(
        &self,
        conversation_id: &str,
        reader_id: &str,
        message_ids: &[String],
        at: DateTime<Utc>,
    ) -> AppResult<Vec<String>> {
        let mut state = self.state.write().await;
        let state = &mut *state;
        let conversation = state
            .conversations
            .get_mut(conversation_id)
            .ok_or_else(|| AppError::ConversationNotFound(conversation_id.to_string()))?;

        let mut flipped = Vec::new();
        if let Some(log) = state.messages.get_mut(conversation_id) {
            for id in message_ids {
                let Some(message) = log.iter_mut().find(|m| &m.id == id) else {
                    continue;
                };
                if message.sender_id == reader_id {
                    continue;
                }
                if message.status.mark_read(at) {
                    flipped.push(id.clone());
                }
            }
        }

        conversation.unread_counts.insert(reader_id.to_string(), 0);
        if let Some(participant) = conversation.participant_mut(reader_id) {
            participant.last_seen_at = Some(participant.last_seen_at.map_or(at, |seen| seen.max(at)));
        }

        Ok(flipped)
    }

    /// Replace the text content of a message.
    pub async fn edit_message(
        &self,
        conversation_id: &str,
        message_id: &str,
        content: &str,
        at: DateTime<Utc>,
    ) -> AppResult<message::Model> {
        let mut state = self.state.write().await;
        let state = &mut *state;
        let conversation = state
            .conversations
            .get_mut(conversation_id)
            .ok_or_else(|| AppError::ConversationNotFound(conversation_id.to_string()))?;

        let message = state
            .messages
            .get_mut(conversation_id)
            .and_then(|log| log.iter_mut().find(|m| m.id == message_id))
            .ok_or_else(|| AppError::MessageNotFound(message_id.to_string()))?;

        if message.is_deleted() {
            return Err(AppError::Validation(
                "Cannot edit a deleted message".to_string(),
            ));
        }

        message.content = Some(content.to_string());
        message.edited_at = Some(at);

        let updated = message.clone();
        if conversation
            .last_message
            .as_ref()
            .is_some_and(|last| last.id == updated.id)
        {
            conversation.last_message = Some(updated.to_last_message());
        }

        Ok(updated)
    }

    /// Soft delete a message.
    ///
    /// The row is retained with its content, but payload conversions render
    /// it as a tombstone from now on.
    pub async fn soft_delete_message(
        &self,
        conversation_id: &str,
        message_id: &str,
        deleted_by: &str,
        at: DateTime<Utc>,
    ) -> AppResult<message::Model> {
        let mut state = self.state.write().await;
        let state = &mut *state;
        let conversation = state
            .conversations
            .get_mut(conversation_id)
            .ok_or_else(|| AppError::ConversationNotFound(conversation_id.to_string()))?;

        let message = state
            .messages
            .get_mut(conversation_id)
            .and_then(|log| log.iter_mut().find(|m| m.id == message_id))
            .ok_or_else(|| AppError::MessageNotFound(message_id.to_string()))?;

        if message.deleted_at.is_none() {
            message.deleted_at = Some(at);
            message.deleted_by = Some(deleted_by.to_string());
        }

        let deleted = message.clone();
        if conversation
            .last_message
            .as_ref()
            .is_some_and(|last| last.id == deleted.id)
        {
            conversation.last_message = Some(deleted.to_last_message());
        }

        Ok(deleted)
    }

    /// Mark a participant as having left or rejoined the conversation.
    pub async fn set_participant_active(
        &self,
        conversation_id: &str,
        user_id: &str,
        active: bool,
    ) -> AppResult<conversation::Model> {
        self.with_conversation(conversation_id, |conversation| {
            let participant = conversation
                .participant_mut(user_id)
                .ok_or_else(|| AppError::NotFound(format!("Participant {user_id}")))?;
            participant.is_active = active;
            Ok(())
        })
        .await
    }

    /// Set or clear the archived flag for one user.
    pub async fn set_archived(
        &self,
        conversation_id: &str,
        user_id: &str,
        archived: bool,
    ) -> AppResult<conversation::Model> {
        self.with_conversation(conversation_id, |conversation| {
            if archived {
                conversation.settings.archived_by.insert(user_id.to_string());
            } else {
                conversation.settings.archived_by.remove(user_id);
            }
            Ok(())
        })
        .await
    }

    /// Set or clear the pinned flag for one user.
    pub async fn set_pinned(
        &self,
        conversation_id: &str,
        user_id: &str,
        pinned: bool,
    ) -> AppResult<conversation::Model> {
        self.with_conversation(conversation_id, |conversation| {
            if pinned {
                conversation.settings.pinned_by.insert(user_id.to_string());
            } else {
                conversation.settings.pinned_by.remove(user_id);
            }
            Ok(())
        })
        .await
    }

    /// Mute the conversation for one user, optionally until a deadline.
    pub async fn mute(
        &self,
        conversation_id: &str,
        user_id: &str,
        until: Option<DateTime<Utc>>,
    ) -> AppResult<conversation::Model> {
        self.with_conversation(conversation_id, |conversation| {
            conversation
                .settings
                .muted_by
                .insert(user_id.to_string(), until);
            Ok(())
        })
        .await
    }

    /// Clear the mute for one user.
    pub async fn unmute(
        &self,
        conversation_id: &str,
        user_id: &str,
    ) -> AppResult<conversation::Model> {
        self.with_conversation(conversation_id, |conversation| {
            conversation.settings.muted_by.remove(user_id);
            Ok(())
        })
        .await
    }

    /// Block the conversation.
    pub async fn block(
        &self,
        conversation_id: &str,
        block: BlockState,
    ) -> AppResult<conversation::Model> {
        self.with_conversation(conversation_id, |conversation| {
            if conversation.settings.block.is_some() {
                return Err(AppError::Conflict(
                    "Conversation is already blocked".to_string(),
                ));
            }
            conversation.settings.block = Some(block);
            Ok(())
        })
        .await
    }

    /// Clear the block state. A no-op when not blocked.
    pub async fn unblock(&self, conversation_id: &str) -> AppResult<conversation::Model> {
        self.with_conversation(conversation_id, |conversation| {
            conversation.settings.block = None;
            Ok(())
        })
        .await
    }

    async fn with_conversation(
        &self,
        conversation_id: &str,
        apply: impl FnOnce(&mut conversation::Model) -> AppResult<()>,
    ) -> AppResult<conversation::Model> {
        let mut state = self.state.write().await;
        let conversation = state
            .conversations
            .get_mut(conversation_id)
            .ok_or_else(|| AppError::ConversationNotFound(conversation_id.to_string()))?;
        apply(conversation)?;
        Ok(conversation.clone())
    }
}

/// Position at which a message with this timestamp is inserted.
///
/// Ties go after existing messages with the same timestamp, preserving
/// arrival order.
fn insert_position(log: &[message::Model], sent_at: DateTime<Utc>) -> usize {
    log.iter()
        .rposition(|m| m.sent_at <= sent_at)
        .map_or(0, |pos| pos + 1)
}
