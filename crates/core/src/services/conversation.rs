//! Conversation service.
//!
//! Owns the domain rules of the server conversation aggregate: who may
//! send, what counts as delivered, when receipts flip, and which realtime
//! events fan out afterwards. Persistence failures abort the operation;
//! event publishing failures are logged and swallowed so a slow hub never
//! fails a write.

use crate::services::event_publisher::EventPublisherService;
use crate::services::notifier::NotificationSinkService;
use crate::services::presence::PresenceService;
use chatwire_common::events::{
    AttachmentPayload, BlockState, ConversationKind, MessageDeletedPayload, MessageKind,
    MessageStatus, ReadReceiptPayload,
};
use chatwire_common::{AppError, AppResult, IdGenerator};
use chatwire_store::ConversationRepository;
use chatwire_store::entities::{conversation, message};
use chrono::{DateTime, Utc};

/// Input for sending a new message.
#[derive(Debug, Clone, Default)]
pub struct SendMessageInput {
    pub content: Option<String>,
    pub kind: MessageKind,
    pub attachments: Vec<AttachmentPayload>,
    pub reply_to: Option<String>,
}

/// Input for creating a group or support conversation.
#[derive(Debug, Clone)]
pub struct CreateConversationInput {
    pub kind: ConversationKind,
    pub participant_ids: Vec<String>,
}

/// Conversation service.
#[derive(Clone)]
pub struct ConversationService {
    repo: ConversationRepository,
    event_publisher: Option<EventPublisherService>,
    presence: Option<PresenceService>,
    notifications: Option<NotificationSinkService>,
    id_gen: IdGenerator,
}

impl ConversationService {
    /// Create a new conversation service.
    #[must_use]
    pub const fn new(repo: ConversationRepository) -> Self {
        Self {
            repo,
            event_publisher: None,
            presence: None,
            notifications: None,
            id_gen: IdGenerator::new(),
        }
    }

    /// Set the event publisher.
    pub fn set_event_publisher(&mut self, event_publisher: EventPublisherService) {
        self.event_publisher = Some(event_publisher);
    }

    /// Set the presence provider used for delivered markers and
    /// notification routing.
    pub fn set_presence(&mut self, presence: PresenceService) {
        self.presence = Some(presence);
    }

    /// Set the notification sink for offline recipients.
    pub fn set_notification_sink(&mut self, notifications: NotificationSinkService) {
        self.notifications = Some(notifications);
    }

    /// Look up or create the direct conversation with another user.
    ///
    /// Returns the conversation and whether this call created it. Two
    /// concurrent callers for the same pair converge on one row; the loser
    /// receives the winner's conversation.
    pub async fn get_or_create_direct(
        &self,
        user_id: &str,
        partner_id: &str,
    ) -> AppResult<(conversation::Model, bool)> {
        if user_id == partner_id {
            return Err(AppError::BadRequest(
                "Cannot start a conversation with yourself".to_string(),
            ));
        }

        let now = Utc::now();
        let candidate = conversation::Model {
            id: self.id_gen.generate(),
            kind: ConversationKind::Direct,
            participants: vec![
                conversation::Participant::member(user_id, now),
                conversation::Participant::member(partner_id, now),
            ],
            last_message: None,
            unread_counts: std::collections::HashMap::new(),
            settings: conversation::Settings::default(),
            created_at: now,
            updated_at: now,
        };

        let (conversation, created) = self.repo.get_or_create_direct(candidate).await?;

        if created {
            if let Some(ref event_publisher) = self.event_publisher {
                if let Err(e) = event_publisher
                    .publish_conversation_created(&conversation.to_payload())
                    .await
                {
                    tracing::warn!(error = %e, "Failed to publish conversation created event");
                }
            }
        }

        Ok((conversation, created))
    }

    /// Create a group or support conversation with the given participants.
    pub async fn create_conversation(
        &self,
        creator_id: &str,
        input: CreateConversationInput,
    ) -> AppResult<conversation::Model> {
        if input.kind == ConversationKind::Direct {
            return Err(AppError::BadRequest(
                "Direct conversations are created through the partner lookup".to_string(),
            ));
        }

        let now = Utc::now();
        let mut participants = vec![conversation::Participant::owner(creator_id, now)];
        for participant_id in &input.participant_ids {
            if participant_id == creator_id
                || participants.iter().any(|p| &p.user_id == participant_id)
            {
                continue;
            }
            participants.push(conversation::Participant::member(participant_id, now));
        }
        if participants.len() < 2 {
            return Err(AppError::Validation(
                "Conversation requires at least one other participant".to_string(),
            ));
        }

        let conversation = self
            .repo
            .insert(conversation::Model {
                id: self.id_gen.generate(),
                kind: input.kind,
                participants,
                last_message: None,
                unread_counts: std::collections::HashMap::new(),
                settings: conversation::Settings::default(),
                created_at: now,
                updated_at: now,
            })
            .await?;

        if let Some(ref event_publisher) = self.event_publisher {
            if let Err(e) = event_publisher
                .publish_conversation_created(&conversation.to_payload())
                .await
            {
                tracing::warn!(error = %e, "Failed to publish conversation created event");
            }
        }

        Ok(conversation)
    }

    /// All conversations where the user is an active participant, most
    /// recently updated first.
    pub async fn conversations_for_user(
        &self,
        user_id: &str,
    ) -> AppResult<Vec<conversation::Model>> {
        self.repo.conversations_for_user(user_id).await
    }

    /// A single conversation, checked for active membership.
    pub async fn conversation_for_user(
        &self,
        user_id: &str,
        conversation_id: &str,
    ) -> AppResult<conversation::Model> {
        let conversation = self
            .repo
            .find_by_id(conversation_id)
            .await?
            .ok_or_else(|| AppError::ConversationNotFound(conversation_id.to_string()))?;
        if !conversation.is_active_participant(user_id) {
            return Err(AppError::Forbidden(
                "Not a participant in this conversation".to_string(),
            ));
        }
        Ok(conversation)
    }

    /// Whether the user is an active participant of the conversation.
    pub async fn is_active_participant(
        &self,
        user_id: &str,
        conversation_id: &str,
    ) -> AppResult<bool> {
        let conversation = self
            .repo
            .find_by_id(conversation_id)
            .await?
            .ok_or_else(|| AppError::ConversationNotFound(conversation_id.to_string()))?;
        Ok(conversation.is_active_participant(user_id))
    }

    /// The ordered message log of a conversation.
    pub async fn messages(
        &self,
        user_id: &str,
        conversation_id: &str,
    ) -> AppResult<Vec<message::Model>> {
        self.conversation_for_user(user_id, conversation_id).await?;
        self.repo.messages(conversation_id).await
    }

    /// Send a message into a conversation.
    ///
    /// The message is appended with `sent` status, then advanced to
    /// `delivered` if any other participant has a live session. The final
    /// state is what fans out to subscribers.
    pub async fn send_message(
        &self,
        sender_id: &str,
        conversation_id: &str,
        input: SendMessageInput,
    ) -> AppResult<message::Model> {
        let content = input.content.filter(|text| !text.trim().is_empty());
        if content.is_none() && input.attachments.is_empty() {
            return Err(AppError::BadRequest(
                "Message must have text or attachments".to_string(),
            ));
        }

        let conversation = self.conversation_for_user(sender_id, conversation_id).await?;

        if conversation.settings.block.is_some() {
            return Err(AppError::Blocked(
                "Conversation is blocked".to_string(),
            ));
        }

        if let Some(ref reply_to) = input.reply_to {
            self.repo
                .find_message(conversation_id, reply_to)
                .await?
                .ok_or_else(|| {
                    AppError::Validation(format!(
                        "Reply target {reply_to} not found in this conversation"
                    ))
                })?;
        }

        let now = Utc::now();
        let mut message = message::Model {
            id: self.id_gen.generate(),
            conversation_id: conversation_id.to_string(),
            sender_id: sender_id.to_string(),
            content,
            kind: input.kind,
            attachments: input.attachments,
            reply_to: input.reply_to,
            status: MessageStatus::sent(),
            sent_at: now,
            edited_at: None,
            deleted_at: None,
            deleted_by: None,
        };

        let conversation = self.repo.append_message(message.clone()).await?;

        let recipients: Vec<String> = conversation
            .active_participant_ids()
            .into_iter()
            .filter(|id| id != sender_id)
            .collect();

        if let Some(ref presence) = self.presence {
            if presence.any_online(&recipients).await {
                message = self
                    .repo
                    .set_delivered(conversation_id, &message.id, Utc::now())
                    .await?;
            }
        }

        let payload = message.to_payload();

        if let Some(ref event_publisher) = self.event_publisher {
            if let Err(e) = event_publisher
                .publish_message(&conversation.active_participant_ids(), &payload)
                .await
            {
                tracing::warn!(error = %e, "Failed to publish message event");
            }
        }

        if let Some(ref notifications) = self.notifications {
            for recipient_id in &recipients {
                let online = match self.presence {
                    Some(ref presence) => presence.is_online(recipient_id).await,
                    None => false,
                };
                if online || conversation.is_muted_by(recipient_id, now) {
                    continue;
                }
                if let Err(e) = notifications.message_created(recipient_id, &payload).await {
                    tracing::warn!(error = %e, recipient_id, "Failed to notify offline recipient");
                }
            }
        }

        Ok(message)
    }

    /// Flip read receipts for a set of messages on behalf of the reader.
    ///
    /// Returns how many receipts actually flipped. Nothing is published
    /// when the receipt covers no eligible messages.
    pub async fn mark_read(
        &self,
        reader_id: &str,
        conversation_id: &str,
        message_ids: &[String],
    ) -> AppResult<u64> {
        let conversation = self.conversation_for_user(reader_id, conversation_id).await?;

        let now = Utc::now();
        let flipped = self
            .repo
            .mark_read(conversation_id, reader_id, message_ids, now)
            .await?;
        if flipped.is_empty() {
            return Ok(0);
        }

        if let Some(ref event_publisher) = self.event_publisher {
            let receipt = ReadReceiptPayload {
                conversation_id: conversation_id.to_string(),
                user_id: reader_id.to_string(),
                message_ids: flipped.clone(),
                read_at: now,
            };
            if let Err(e) = event_publisher
                .publish_message_read(&conversation.active_participant_ids(), &receipt)
                .await
            {
                tracing::warn!(error = %e, "Failed to publish read receipt event");
            }
        }

        Ok(flipped.len() as u64)
    }

    /// Replace the text content of a message. Only the sender may edit.
    pub async fn edit_message(
        &self,
        editor_id: &str,
        conversation_id: &str,
        message_id: &str,
        content: &str,
    ) -> AppResult<message::Model> {
        let conversation = self.conversation_for_user(editor_id, conversation_id).await?;

        let existing = self
            .repo
            .find_message(conversation_id, message_id)
            .await?
            .ok_or_else(|| AppError::MessageNotFound(message_id.to_string()))?;
        if existing.sender_id != editor_id {
            return Err(AppError::Forbidden(
                "Cannot edit another user's message".to_string(),
            ));
        }
        if content.trim().is_empty() {
            return Err(AppError::BadRequest(
                "Edited content cannot be empty".to_string(),
            ));
        }

        let updated = self
            .repo
            .edit_message(conversation_id, message_id, content, Utc::now())
            .await?;

        if let Some(ref event_publisher) = self.event_publisher {
            if let Err(e) = event_publisher
                .publish_message(&conversation.active_participant_ids(), &updated.to_payload())
                .await
            {
                tracing::warn!(error = %e, "Failed to publish message edit event");
            }
        }

        Ok(updated)
    }

    /// Soft delete a message. Only the sender may delete.
    pub async fn delete_message(
        &self,
        user_id: &str,
        conversation_id: &str,
        message_id: &str,
    ) -> AppResult<()> {
        let conversation = self.conversation_for_user(user_id, conversation_id).await?;

        let existing = self
            .repo
            .find_message(conversation_id, message_id)
            .await?
            .ok_or_else(|| AppError::MessageNotFound(message_id.to_string()))?;
        if existing.sender_id != user_id {
            return Err(AppError::Forbidden(
                "Cannot delete another user's message".to_string(),
            ));
        }

        self.repo
            .soft_delete_message(conversation_id, message_id, user_id, Utc::now())
            .await?;

        if let Some(ref event_publisher) = self.event_publisher {
            let deleted = MessageDeletedPayload {
                conversation_id: conversation_id.to_string(),
                message_id: message_id.to_string(),
            };
            if let Err(e) = event_publisher
                .publish_message_deleted(&conversation.active_participant_ids(), &deleted)
                .await
            {
                tracing::warn!(error = %e, "Failed to publish message deleted event");
            }
        }

        Ok(())
    }

    /// Archive or unarchive the conversation for one user.
    pub async fn set_archived(
        &self,
        user_id: &str,
        conversation_id: &str,
        archived: bool,
    ) -> AppResult<conversation::Model> {
        self.conversation_for_user(user_id, conversation_id).await?;
        let updated = self
            .repo
            .set_archived(conversation_id, user_id, archived)
            .await?;
        self.publish_updated(&updated).await;
        Ok(updated)
    }

    /// Pin or unpin the conversation for one user.
    pub async fn set_pinned(
        &self,
        user_id: &str,
        conversation_id: &str,
        pinned: bool,
    ) -> AppResult<conversation::Model> {
        self.conversation_for_user(user_id, conversation_id).await?;
        let updated = self.repo.set_pinned(conversation_id, user_id, pinned).await?;
        self.publish_updated(&updated).await;
        Ok(updated)
    }

    /// Mute the conversation for one user, optionally until a deadline.
    pub async fn mute(
        &self,
        user_id: &str,
        conversation_id: &str,
        until: Option<DateTime<Utc>>,
    ) -> AppResult<conversation::Model> {
        self.conversation_for_user(user_id, conversation_id).await?;
        let updated = self.repo.mute(conversation_id, user_id, until).await?;
        self.publish_updated(&updated).await;
        Ok(updated)
    }

    /// Clear the mute for one user.
    pub async fn unmute(
        &self,
        user_id: &str,
        conversation_id: &str,
    ) -> AppResult<conversation::Model> {
        self.conversation_for_user(user_id, conversation_id).await?;
        let updated = self.repo.unmute(conversation_id, user_id).await?;
        self.publish_updated(&updated).await;
        Ok(updated)
    }

    /// Block the conversation. Sends are rejected in both directions until
    /// the blocking user unblocks.
    pub async fn block(
        &self,
        user_id: &str,
        conversation_id: &str,
    ) -> AppResult<conversation::Model> {
        self.conversation_for_user(user_id, conversation_id).await?;
        let updated = self
            .repo
            .block(
                conversation_id,
                BlockState {
                    blocked_by: user_id.to_string(),
                    blocked_at: Utc::now(),
                },
            )
            .await?;
        self.publish_updated(&updated).await;
        Ok(updated)
    }

    /// Clear the block state. Only the blocking user may unblock.
    pub async fn unblock(
        &self,
        user_id: &str,
        conversation_id: &str,
    ) -> AppResult<conversation::Model> {
        let conversation = self.conversation_for_user(user_id, conversation_id).await?;

        match conversation.settings.block {
            None => Ok(conversation),
            Some(ref block) if block.blocked_by != user_id => Err(AppError::Forbidden(
                "Only the blocking user can unblock".to_string(),
            )),
            Some(_) => {
                let updated = self.repo.unblock(conversation_id).await?;
                self.publish_updated(&updated).await;
                Ok(updated)
            }
        }
    }

    /// Leave a group or support conversation.
    pub async fn leave(
        &self,
        user_id: &str,
        conversation_id: &str,
    ) -> AppResult<conversation::Model> {
        let conversation = self.conversation_for_user(user_id, conversation_id).await?;
        if conversation.kind == ConversationKind::Direct {
            return Err(AppError::Validation(
                "Cannot leave a direct conversation".to_string(),
            ));
        }

        let updated = self
            .repo
            .set_participant_active(conversation_id, user_id, false)
            .await?;
        self.publish_updated(&updated).await;
        Ok(updated)
    }

    async fn publish_updated(&self, conversation: &conversation::Model) {
        if let Some(ref event_publisher) = self.event_publisher {
            if let Err(e) = event_publisher
                .publish_conversation_updated(&conversation.to_payload())
                .await
            {
                tracing::warn!(error = %e, "Failed to publish conversation updated event");
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::services::event_publisher::EventPublisher;
    use crate::services::notifier::NotificationSink;
    use crate::services::presence::PresenceProvider;
    use async_trait::async_trait;
    use chatwire_common::events::{ConversationPayload, MessagePayload, MessageState};
    use maplit::hashset;
    use std::collections::HashSet;
    use std::sync::{Arc, Mutex};

    /// Records every published event as a short tag for assertions.
    #[derive(Clone, Default)]
    struct RecordingPublisher {
        events: Arc<Mutex<Vec<String>>>,
    }

    impl RecordingPublisher {
        fn events(&self) -> Vec<String> {
            self.events.lock().unwrap().clone()
        }

        fn record(&self, tag: String) {
            self.events.lock().unwrap().push(tag);
        }
    }

    #[async_trait]
    impl EventPublisher for RecordingPublisher {
        async fn publish_message(
            &self,
            participant_ids: &[String],
            message: &MessagePayload,
        ) -> AppResult<()> {
            self.record(format!("message:{}:{}", message.id, participant_ids.len()));
            Ok(())
        }

        async fn publish_message_read(
            &self,
            _participant_ids: &[String],
            receipt: &ReadReceiptPayload,
        ) -> AppResult<()> {
            self.record(format!(
                "read:{}:{}",
                receipt.user_id,
                receipt.message_ids.len()
            ));
            Ok(())
        }

        async fn publish_message_deleted(
            &self,
            _participant_ids: &[String],
            deleted: &MessageDeletedPayload,
        ) -> AppResult<()> {
            self.record(format!("deleted:{}", deleted.message_id));
            Ok(())
        }

        async fn publish_conversation_created(
            &self,
            conversation: &ConversationPayload,
        ) -> AppResult<()> {
            self.record(format!("created:{}", conversation.id));
            Ok(())
        }

        async fn publish_conversation_updated(
            &self,
            conversation: &ConversationPayload,
        ) -> AppResult<()> {
            self.record(format!("updated:{}", conversation.id));
            Ok(())
        }
    }

    /// Fixed set of online users.
    #[derive(Clone, Default)]
    struct StaticPresence {
        online: HashSet<String>,
    }

    #[async_trait]
    impl PresenceProvider for StaticPresence {
        async fn is_online(&self, user_id: &str) -> bool {
            self.online.contains(user_id)
        }
    }

    #[derive(Clone, Default)]
    struct RecordingSink {
        notified: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl NotificationSink for RecordingSink {
        async fn message_created(
            &self,
            recipient_id: &str,
            _message: &MessagePayload,
        ) -> AppResult<()> {
            self.notified.lock().unwrap().push(recipient_id.to_string());
            Ok(())
        }
    }

    struct Harness {
        service: ConversationService,
        publisher: RecordingPublisher,
        sink: RecordingSink,
    }

    fn harness(online: HashSet<String>) -> Harness {
        let publisher = RecordingPublisher::default();
        let sink = RecordingSink::default();
        let mut service = ConversationService::new(ConversationRepository::new());
        service.set_event_publisher(Arc::new(publisher.clone()));
        service.set_presence(Arc::new(StaticPresence { online }));
        service.set_notification_sink(Arc::new(sink.clone()));
        Harness {
            service,
            publisher,
            sink,
        }
    }

    #[tokio::test]
    async fn test_get_or_create_direct_publishes_once() {
        let h = harness(HashSet::new());

        let (first, created) = h.service.get_or_create_direct("alice", "bob").await.unwrap();
        assert!(created);

        let (second, created) = h.service.get_or_create_direct("bob", "alice").await.unwrap();
        assert!(!created);
        assert_eq!(first.id, second.id);

        assert_eq!(h.publisher.events(), vec![format!("created:{}", first.id)]);
    }

    #[tokio::test]
    async fn test_no_self_conversations() {
        let h = harness(HashSet::new());
        let err = h
            .service
            .get_or_create_direct("alice", "alice")
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::BadRequest(_)));
    }

    #[tokio::test]
    async fn test_send_message_requires_content() {
        let h = harness(HashSet::new());
        let (conv, _) = h.service.get_or_create_direct("alice", "bob").await.unwrap();

        let err = h
            .service
            .send_message(
                "alice",
                &conv.id,
                SendMessageInput {
                    content: Some("   ".to_string()),
                    ..SendMessageInput::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::BadRequest(_)));
    }

    #[tokio::test]
    async fn test_send_message_rejects_outsiders() {
        let h = harness(HashSet::new());
        let (conv, _) = h.service.get_or_create_direct("alice", "bob").await.unwrap();

        let err = h
            .service
            .send_message(
                "mallory",
                &conv.id,
                SendMessageInput {
                    content: Some("hi".to_string()),
                    ..SendMessageInput::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Forbidden(_)));
    }

    #[tokio::test]
    async fn test_send_message_delivered_when_recipient_online() {
        let h = harness(hashset! {"bob".to_string()});
        let (conv, _) = h.service.get_or_create_direct("alice", "bob").await.unwrap();

        let message = h
            .service
            .send_message(
                "alice",
                &conv.id,
                SendMessageInput {
                    content: Some("hi".to_string()),
                    ..SendMessageInput::default()
                },
            )
            .await
            .unwrap();

        assert_eq!(message.status.state, MessageState::Delivered);
        assert!(message.status.delivered_at.is_some());
        // Online recipients are not notified out of band
        assert!(h.sink.notified.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_send_message_stays_sent_when_recipient_offline() {
        let h = harness(HashSet::new());
        let (conv, _) = h.service.get_or_create_direct("alice", "bob").await.unwrap();

        let message = h
            .service
            .send_message(
                "alice",
                &conv.id,
                SendMessageInput {
                    content: Some("hi".to_string()),
                    ..SendMessageInput::default()
                },
            )
            .await
            .unwrap();

        assert_eq!(message.status.state, MessageState::Sent);
        assert_eq!(*h.sink.notified.lock().unwrap(), vec!["bob".to_string()]);
    }

    #[tokio::test]
    async fn test_muted_recipients_are_not_notified() {
        let h = harness(HashSet::new());
        let (conv, _) = h.service.get_or_create_direct("alice", "bob").await.unwrap();
        h.service.mute("bob", &conv.id, None).await.unwrap();

        h.service
            .send_message(
                "alice",
                &conv.id,
                SendMessageInput {
                    content: Some("hi".to_string()),
                    ..SendMessageInput::default()
                },
            )
            .await
            .unwrap();

        assert!(h.sink.notified.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_blocked_conversation_rejects_sends_both_ways() {
        let h = harness(HashSet::new());
        let (conv, _) = h.service.get_or_create_direct("alice", "bob").await.unwrap();
        h.service.block("alice", &conv.id).await.unwrap();

        for sender in ["alice", "bob"] {
            let err = h
                .service
                .send_message(
                    sender,
                    &conv.id,
                    SendMessageInput {
                        content: Some("hi".to_string()),
                        ..SendMessageInput::default()
                    },
                )
                .await
                .unwrap_err();
            assert!(matches!(err, AppError::Blocked(_)));
        }

        // Only the blocker may unblock
        let err = h.service.unblock("bob", &conv.id).await.unwrap_err();
        assert!(matches!(err, AppError::Forbidden(_)));
        h.service.unblock("alice", &conv.id).await.unwrap();

        h.service
            .send_message(
                "bob",
                &conv.id,
                SendMessageInput {
                    content: Some("hi again".to_string()),
                    ..SendMessageInput::default()
                },
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_reply_target_must_exist() {
        let h = harness(HashSet::new());
        let (conv, _) = h.service.get_or_create_direct("alice", "bob").await.unwrap();

        let err = h
            .service
            .send_message(
                "alice",
                &conv.id,
                SendMessageInput {
                    content: Some("hi".to_string()),
                    reply_to: Some("ghost".to_string()),
                    ..SendMessageInput::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
    }

    #[tokio::test]
    async fn test_mark_read_publishes_flipped_ids_only() {
        let h = harness(HashSet::new());
        let (conv, _) = h.service.get_or_create_direct("alice", "bob").await.unwrap();

        let m1 = h
            .service
            .send_message(
                "alice",
                &conv.id,
                SendMessageInput {
                    content: Some("one".to_string()),
                    ..SendMessageInput::default()
                },
            )
            .await
            .unwrap();
        let m2 = h
            .service
            .send_message(
                "bob",
                &conv.id,
                SendMessageInput {
                    content: Some("two".to_string()),
                    ..SendMessageInput::default()
                },
            )
            .await
            .unwrap();

        let count = h
            .service
            .mark_read("bob", &conv.id, &[m1.id.clone(), m2.id.clone()])
            .await
            .unwrap();
        assert_eq!(count, 1);

        // Replay flips nothing and publishes nothing further
        let count = h
            .service
            .mark_read("bob", &conv.id, &[m1.id.clone()])
            .await
            .unwrap();
        assert_eq!(count, 0);

        let reads: Vec<String> = h
            .publisher
            .events()
            .into_iter()
            .filter(|e| e.starts_with("read:"))
            .collect();
        assert_eq!(reads, vec!["read:bob:1".to_string()]);
    }

    #[tokio::test]
    async fn test_edit_and_delete_are_sender_only() {
        let h = harness(HashSet::new());
        let (conv, _) = h.service.get_or_create_direct("alice", "bob").await.unwrap();
        let message = h
            .service
            .send_message(
                "alice",
                &conv.id,
                SendMessageInput {
                    content: Some("typo".to_string()),
                    ..SendMessageInput::default()
                },
            )
            .await
            .unwrap();

        let err = h
            .service
            .edit_message("bob", &conv.id, &message.id, "fixed")
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Forbidden(_)));

        let edited = h
            .service
            .edit_message("alice", &conv.id, &message.id, "fixed")
            .await
            .unwrap();
        assert_eq!(edited.content.as_deref(), Some("fixed"));

        let err = h
            .service
            .delete_message("bob", &conv.id, &message.id)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Forbidden(_)));

        h.service
            .delete_message("alice", &conv.id, &message.id)
            .await
            .unwrap();
        assert!(
            h.publisher
                .events()
                .contains(&format!("deleted:{}", message.id))
        );
    }

    #[tokio::test]
    async fn test_group_lifecycle() {
        let h = harness(HashSet::new());

        let group = h
            .service
            .create_conversation(
                "alice",
                CreateConversationInput {
                    kind: ConversationKind::Group,
                    participant_ids: vec!["bob".to_string(), "carol".to_string()],
                },
            )
            .await
            .unwrap();
        assert_eq!(group.participants.len(), 3);
        assert_eq!(
            group.participant("alice").unwrap().role,
            chatwire_common::events::ParticipantRole::Owner
        );

        h.service.leave("carol", &group.id).await.unwrap();
        assert!(
            h.service
                .conversations_for_user("carol")
                .await
                .unwrap()
                .is_empty()
        );

        // Direct conversations cannot be left
        let (direct, _) = h.service.get_or_create_direct("alice", "bob").await.unwrap();
        let err = h.service.leave("alice", &direct.id).await.unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
    }

    #[tokio::test]
    async fn test_direct_kind_uses_partner_lookup() {
        let h = harness(HashSet::new());
        let err = h
            .service
            .create_conversation(
                "alice",
                CreateConversationInput {
                    kind: ConversationKind::Direct,
                    participant_ids: vec!["bob".to_string()],
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::BadRequest(_)));
    }
}
