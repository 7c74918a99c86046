//! Optimistic conversation store.
//!
//! Client-side source of truth for conversations, message logs, unread
//! counters and typing indicators. Writes apply locally first and are
//! reconciled against the server's confirmation; realtime events merge in
//! by message ID, so replays and room echoes of already-known messages
//! never duplicate an entry.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chatwire_common::config::SyncConfig;
use chatwire_common::error::{AppError, AppResult};
use chatwire_common::events::{
    ClientEvent, ConversationKind, ConversationPayload, ConversationRefPayload, MessageDeletedPayload,
    MessageKind, MessagePayload, MessageState, MessageStatus, ReadReceiptPayload,
    SendMessagePayload, SendMessageRequest, ServerEvent, TypingPayload,
};
use chatwire_common::id::IdGenerator;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, broadcast, watch};
use tokio::task::JoinHandle;

use crate::api::ConversationApiService;
use crate::presence::PresenceTracker;
use crate::subscriptions::{Subscription, SubscriptionRegistry};
use crate::transport::{ConnectionEvent, Transport};

/// Local reconciliation state of a message copy held by the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalState {
    /// Applied optimistically; the server has not confirmed the write yet.
    Pending,
    /// Confirmed by the server.
    Confirmed,
    /// The write failed; the content is retained for manual retry.
    Failed,
}

/// A message plus its local reconciliation state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageView {
    /// The message as currently known.
    pub message: MessagePayload,
    /// Whether the server has confirmed this copy.
    pub local: LocalState,
}

/// Point-in-time view of one conversation for rendering.
#[derive(Debug, Clone)]
pub struct ConversationSnapshot {
    /// Conversation summary.
    pub conversation: ConversationPayload,
    /// Message log in timeline order.
    pub messages: Vec<MessageView>,
    /// Users currently typing, excluding the local user. Sorted.
    pub typing_user_ids: Vec<String>,
    /// Unread counter of the local user.
    pub unread_count: u32,
}

/// Point-in-time view of the whole store for rendering.
#[derive(Debug, Clone)]
pub struct ChatSnapshot {
    /// Pinned conversations first, then most recently updated.
    pub conversations: Vec<ConversationSnapshot>,
    /// The focused conversation, if any.
    pub active_conversation_id: Option<String>,
}

impl ChatSnapshot {
    /// Look up one conversation in the snapshot.
    #[must_use]
    pub fn conversation(&self, conversation_id: &str) -> Option<&ConversationSnapshot> {
        self.conversations
            .iter()
            .find(|snapshot| snapshot.conversation.id == conversation_id)
    }
}

struct ActiveConversation {
    conversation_id: String,
    _subscription: Subscription,
}

#[derive(Default)]
struct StoreState {
    conversations: HashMap<String, ConversationPayload>,
    logs: HashMap<String, Vec<MessageView>>,
    typing: HashMap<String, HashSet<String>>,
    active: Option<ActiveConversation>,
}

struct StoreInner {
    user_id: String,
    api: ConversationApiService,
    transport: Transport,
    registry: SubscriptionRegistry,
    presence: PresenceTracker,
    id_gen: IdGenerator,
    typing_timeout: Duration,
    state: Mutex<StoreState>,
    /// Auto-stop timers for the local user's typing, per conversation.
    typing_out: std::sync::Mutex<HashMap<String, JoinHandle<()>>>,
    /// Safety-net expiry timers for remote typing indicators, keyed by
    /// conversation and user.
    typing_expiry: std::sync::Mutex<HashMap<(String, String), JoinHandle<()>>>,
    changes: watch::Sender<u64>,
}

/// The synchronized conversation state of one authenticated user.
///
/// Cheap to clone; all clones share the same state and pumps.
#[derive(Clone)]
pub struct ChatStore {
    inner: Arc<StoreInner>,
}

impl ChatStore {
    /// Create a store for `user_id`, attached to the given transport.
    ///
    /// The event and lifecycle pumps start immediately, so this must be
    /// called inside a Tokio runtime. Build the store before calling
    /// [`Transport::connect`], or the session's opening presence replay
    /// arrives with nobody listening. Nothing is fetched until
    /// [`load_conversations`](Self::load_conversations) runs.
    #[must_use]
    pub fn new(
        user_id: impl Into<String>,
        api: ConversationApiService,
        transport: Transport,
        sync: &SyncConfig,
    ) -> Self {
        let registry = SubscriptionRegistry::new(&transport);
        let store = Self {
            inner: Arc::new(StoreInner {
                user_id: user_id.into(),
                api,
                registry,
                presence: PresenceTracker::new(),
                id_gen: IdGenerator::new(),
                typing_timeout: Duration::from_millis(sync.typing_timeout_ms),
                state: Mutex::new(StoreState::default()),
                typing_out: std::sync::Mutex::new(HashMap::new()),
                typing_expiry: std::sync::Mutex::new(HashMap::new()),
                changes: watch::Sender::new(0),
                transport,
            }),
        };
        store.spawn_pumps();
        store
    }

    /// The authenticated user this store belongs to.
    #[must_use]
    pub fn user_id(&self) -> &str {
        &self.inner.user_id
    }

    /// Presence roster mirror fed by the realtime link.
    #[must_use]
    pub fn presence(&self) -> &PresenceTracker {
        &self.inner.presence
    }

    /// Channel subscriptions held by this client.
    #[must_use]
    pub fn subscriptions(&self) -> &SubscriptionRegistry {
        &self.inner.registry
    }

    /// Subscribe to change notifications. The value increments on every
    /// visible mutation; pair with `changed()` to re-render.
    #[must_use]
    pub fn subscribe_changes(&self) -> watch::Receiver<u64> {
        self.inner.changes.subscribe()
    }

    // === Fetching ===

    /// Fetch the conversation list, replacing local summaries.
    pub async fn load_conversations(&self) -> AppResult<()> {
        let fetched = self.inner.api.list_conversations().await?;
        let mut guard = self.inner.state.lock().await;
        guard.conversations = fetched
            .into_iter()
            .map(|conversation| (conversation.id.clone(), conversation))
            .collect();
        drop(guard);
        self.note_change();
        Ok(())
    }

    /// Fetch a conversation's message log.
    ///
    /// Local `Pending` and `Failed` entries survive the refresh; the rest
    /// of the log is replaced by the server's copy.
    pub async fn load_messages(&self, conversation_id: &str) -> AppResult<()> {
        let fetched = self.inner.api.messages(conversation_id).await?;
        let mut guard = self.inner.state.lock().await;
        let log = guard.logs.entry(conversation_id.to_string()).or_default();

        let mut merged: Vec<MessageView> = fetched
            .into_iter()
            .map(|message| MessageView {
                message,
                local: LocalState::Confirmed,
            })
            .collect();
        let kept: Vec<MessageView> = log
            .iter()
            .filter(|view| view.local != LocalState::Confirmed)
            .cloned()
            .collect();
        for view in kept {
            let position = insert_position(&merged, view.message.sent_at);
            merged.insert(position, view);
        }
        *log = merged;
        drop(guard);
        self.note_change();
        Ok(())
    }

    /// Look up or create the direct conversation with another user.
    ///
    /// Returns the conversation ID.
    pub async fn open_direct(&self, partner_id: &str) -> AppResult<String> {
        let conversation = self.inner.api.get_or_create_direct(partner_id).await?;
        let id = conversation.id.clone();
        let mut guard = self.inner.state.lock().await;
        guard.conversations.insert(id.clone(), conversation);
        drop(guard);
        self.note_change();
        Ok(id)
    }

    /// Create a group or support conversation. Returns the conversation ID.
    pub async fn create_conversation(
        &self,
        kind: ConversationKind,
        participant_ids: Vec<String>,
    ) -> AppResult<String> {
        let conversation = self
            .inner
            .api
            .create_conversation(kind, participant_ids)
            .await?;
        let id = conversation.id.clone();
        let mut guard = self.inner.state.lock().await;
        guard.conversations.insert(id.clone(), conversation);
        drop(guard);
        self.note_change();
        Ok(id)
    }

    // === Sending ===

    /// Send a message.
    ///
    /// The local copy appears immediately as [`LocalState::Pending`] and is
    /// reconciled in place once the server confirms. On failure the entry
    /// flips to [`LocalState::Failed`], keeping the content for
    /// [`retry_message`](Self::retry_message); nothing retries on its own.
    pub async fn send_message(
        &self,
        conversation_id: &str,
        request: SendMessageRequest,
    ) -> AppResult<MessagePayload> {
        let temp_id = self.inner.id_gen.generate_temp();
        let optimistic = MessagePayload {
            id: temp_id.clone(),
            conversation_id: conversation_id.to_string(),
            sender_id: self.inner.user_id.clone(),
            content: request.content.clone(),
            kind: request.kind,
            attachments: request.attachments.clone(),
            reply_to: request.reply_to.clone(),
            status: MessageStatus::sent(),
            sent_at: Utc::now(),
            edited_at: None,
            is_deleted: false,
        };

        {
            let mut guard = self.inner.state.lock().await;
            let state = &mut *guard;
            state
                .logs
                .entry(conversation_id.to_string())
                .or_default()
                .push(MessageView {
                    message: optimistic.clone(),
                    local: LocalState::Pending,
                });
            if let Some(conversation) = state.conversations.get_mut(conversation_id) {
                conversation.last_message = Some(optimistic.to_last_message());
                conversation.updated_at = optimistic.sent_at;
            }
        }
        self.note_change();
        self.stop_typing(conversation_id);

        match self.inner.api.send_message(conversation_id, &request).await {
            Ok(confirmed) => {
                self.reconcile_confirmed(conversation_id, &temp_id, &confirmed)
                    .await;
                self.relay_confirmed(conversation_id, &confirmed);
                Ok(confirmed)
            }
            Err(error) => {
                self.mark_send_failed(conversation_id, &temp_id).await;
                Err(error)
            }
        }
    }

    /// Upload a file and send it as an attachment message.
    pub async fn send_attachment(
        &self,
        conversation_id: &str,
        file_name: &str,
        mime_type: &str,
        bytes: Vec<u8>,
    ) -> AppResult<MessagePayload> {
        let attachment = self
            .inner
            .api
            .upload_attachment(conversation_id, file_name, mime_type, bytes)
            .await?;
        let kind = MessageKind::from_mime(&attachment.mime_type);
        self.send_message(
            conversation_id,
            SendMessageRequest {
                content: None,
                kind,
                attachments: vec![attachment],
                reply_to: None,
            },
        )
        .await
    }

    /// Retry a failed send. The entry flips back to `Pending` and goes
    /// through the same confirmation path as a fresh send.
    pub async fn retry_message(
        &self,
        conversation_id: &str,
        message_id: &str,
    ) -> AppResult<MessagePayload> {
        let request = {
            let mut guard = self.inner.state.lock().await;
            let view = guard
                .logs
                .get_mut(conversation_id)
                .and_then(|log| log.iter_mut().find(|view| view.message.id == message_id));
            match view {
                Some(view) if view.local == LocalState::Failed => {
                    view.local = LocalState::Pending;
                    SendMessageRequest {
                        content: view.message.content.clone(),
                        kind: view.message.kind,
                        attachments: view.message.attachments.clone(),
                        reply_to: view.message.reply_to.clone(),
                    }
                }
                Some(_) => {
                    return Err(AppError::Conflict(
                        "Message is not in a failed state".to_string(),
                    ));
                }
                None => return Err(AppError::MessageNotFound(message_id.to_string())),
            }
        };
        self.note_change();

        match self.inner.api.send_message(conversation_id, &request).await {
            Ok(confirmed) => {
                self.reconcile_confirmed(conversation_id, message_id, &confirmed)
                    .await;
                self.relay_confirmed(conversation_id, &confirmed);
                Ok(confirmed)
            }
            Err(error) => {
                self.mark_send_failed(conversation_id, message_id).await;
                Err(error)
            }
        }
    }

    /// Discard a failed send. Returns whether an entry was removed.
    pub async fn remove_failed(&self, conversation_id: &str, message_id: &str) -> bool {
        let mut guard = self.inner.state.lock().await;
        let removed = guard.logs.get_mut(conversation_id).is_some_and(|log| {
            let before = log.len();
            log.retain(|view| {
                !(view.message.id == message_id && view.local == LocalState::Failed)
            });
            log.len() != before
        });
        drop(guard);
        if removed {
            self.note_change();
        }
        removed
    }

    // === Reading ===

    /// Flip read receipts for everything unread in a conversation.
    ///
    /// Messages the user sent, already-read copies, tombstones and
    /// unconfirmed placeholders are all skipped; with nothing eligible no
    /// request is made and `Ok(0)` is returned.
    pub async fn mark_as_read(&self, conversation_id: &str) -> AppResult<u64> {
        let eligible: Vec<String> = {
            let guard = self.inner.state.lock().await;
            guard.logs.get(conversation_id).map_or_else(Vec::new, |log| {
                log.iter()
                    .filter(|view| {
                        view.local == LocalState::Confirmed
                            && view.message.sender_id != self.inner.user_id
                            && !view.message.is_deleted
                            && view.message.status.state != MessageState::Read
                    })
                    .map(|view| view.message.id.clone())
                    .collect()
            })
        };

        if eligible.is_empty() {
            self.zero_unread(conversation_id).await;
            return Ok(0);
        }

        let count = self
            .inner
            .api
            .mark_read(conversation_id, &eligible)
            .await?;

        // Flip locally right away; the receipt event that follows is
        // absorbed by the monotonic state transition.
        let now = Utc::now();
        let mut guard = self.inner.state.lock().await;
        let state = &mut *guard;
        if let Some(log) = state.logs.get_mut(conversation_id) {
            for view in log.iter_mut() {
                if eligible.contains(&view.message.id) {
                    view.message.status.mark_read(now);
                }
            }
        }
        if let Some(conversation) = state.conversations.get_mut(conversation_id) {
            conversation
                .unread_counts
                .insert(self.inner.user_id.clone(), 0);
        }
        drop(guard);
        self.note_change();
        Ok(count)
    }

    /// Make a conversation the focused one: join its channel, load its
    /// log and flip read receipts for everything unread. `None` clears
    /// the focus and leaves the channel.
    pub async fn set_active_conversation(&self, conversation_id: Option<&str>) -> AppResult<()> {
        match conversation_id {
            Some(id) => {
                let subscription = self.inner.registry.join(id);
                {
                    let mut guard = self.inner.state.lock().await;
                    guard.active = Some(ActiveConversation {
                        conversation_id: id.to_string(),
                        _subscription: subscription,
                    });
                }
                self.note_change();
                self.load_messages(id).await?;
                self.mark_as_read(id).await?;
            }
            None => {
                let mut guard = self.inner.state.lock().await;
                guard.active = None;
                drop(guard);
                self.note_change();
            }
        }
        Ok(())
    }

    // === Typing ===

    /// Report local keystrokes in a conversation.
    ///
    /// The first call announces `typing_start`; the indicator auto-stops
    /// after the configured idle timeout unless further calls keep it
    /// alive.
    pub fn notify_typing(&self, conversation_id: &str) {
        let store = self.clone();
        let conversation = conversation_id.to_string();
        let timeout = self.inner.typing_timeout;
        let handle = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            store.finish_typing(&conversation);
        });

        let mut timers = self.lock_typing_out();
        let fresh = !timers.contains_key(conversation_id);
        if let Some(previous) = timers.insert(conversation_id.to_string(), handle) {
            previous.abort();
        }
        if fresh {
            self.inner
                .transport
                .emit(&ClientEvent::TypingStart(ConversationRefPayload {
                    conversation_id: conversation_id.to_string(),
                }));
        }
    }

    /// Stop the local typing indicator, e.g. when the draft is cleared.
    pub fn stop_typing(&self, conversation_id: &str) {
        let had_timer = {
            let mut timers = self.lock_typing_out();
            match timers.remove(conversation_id) {
                Some(handle) => {
                    handle.abort();
                    true
                }
                None => false,
            }
        };
        if had_timer {
            self.inner
                .transport
                .emit(&ClientEvent::TypingStop(ConversationRefPayload {
                    conversation_id: conversation_id.to_string(),
                }));
        }
    }

    fn finish_typing(&self, conversation_id: &str) {
        let removed = self.lock_typing_out().remove(conversation_id).is_some();
        if removed {
            self.inner
                .transport
                .emit(&ClientEvent::TypingStop(ConversationRefPayload {
                    conversation_id: conversation_id.to_string(),
                }));
        }
    }

    // === Snapshots ===

    /// Point-in-time view of the whole store.
    pub async fn snapshot(&self) -> ChatSnapshot {
        let guard = self.inner.state.lock().await;
        let mut conversations: Vec<ConversationSnapshot> = guard
            .conversations
            .values()
            .map(|conversation| self.conversation_view(&guard, conversation))
            .collect();
        conversations.sort_by(|a, b| {
            let a_pinned = a.conversation.settings.pinned_by.contains(&self.inner.user_id);
            let b_pinned = b.conversation.settings.pinned_by.contains(&self.inner.user_id);
            b_pinned
                .cmp(&a_pinned)
                .then_with(|| b.conversation.updated_at.cmp(&a.conversation.updated_at))
                .then_with(|| a.conversation.id.cmp(&b.conversation.id))
        });
        ChatSnapshot {
            conversations,
            active_conversation_id: guard
                .active
                .as_ref()
                .map(|active| active.conversation_id.clone()),
        }
    }

    /// Point-in-time view of one conversation.
    pub async fn conversation_snapshot(
        &self,
        conversation_id: &str,
    ) -> Option<ConversationSnapshot> {
        let guard = self.inner.state.lock().await;
        guard
            .conversations
            .get(conversation_id)
            .map(|conversation| self.conversation_view(&guard, conversation))
    }

    fn conversation_view(
        &self,
        state: &StoreState,
        conversation: &ConversationPayload,
    ) -> ConversationSnapshot {
        let messages = state.logs.get(&conversation.id).cloned().unwrap_or_default();
        let mut typing_user_ids: Vec<String> = state
            .typing
            .get(&conversation.id)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default();
        typing_user_ids.sort_unstable();
        let unread_count = conversation
            .unread_counts
            .get(&self.inner.user_id)
            .copied()
            .unwrap_or(0);
        ConversationSnapshot {
            conversation: conversation.clone(),
            messages,
            typing_user_ids,
            unread_count,
        }
    }

    // === Event application ===

    fn spawn_pumps(&self) {
        let mut events = self.inner.transport.subscribe_events();
        let event_store = self.clone();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => event_store.handle_server_event(event).await,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "Server events lagged; refreshing");
                        if let Err(error) = event_store.catch_up().await {
                            tracing::warn!(error = %error, "Refresh after lag failed");
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                }
            }
        });

        let mut lifecycle = self.inner.transport.subscribe_lifecycle();
        let lifecycle_store = self.clone();
        tokio::spawn(async move {
            loop {
                match lifecycle.recv().await {
                    Ok(event) => lifecycle_store.handle_connection_event(event).await,
                    Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => return,
                }
            }
        });
    }

    async fn handle_connection_event(&self, event: ConnectionEvent) {
        match event {
            ConnectionEvent::Lost { .. } => {
                // Typing indicators and presence are stale the moment the
                // link drops; both repopulate from live events.
                self.inner.presence.clear();
                self.clear_typing().await;
            }
            ConnectionEvent::Reconnected { .. } => {
                if let Err(error) = self.catch_up().await {
                    tracing::warn!(error = %error, "Catch-up after reconnect failed");
                }
            }
            ConnectionEvent::Established
            | ConnectionEvent::Error { .. }
            | ConnectionEvent::Failed
            | ConnectionEvent::TokenExpired => {}
        }
    }

    async fn handle_server_event(&self, event: ServerEvent) {
        match event {
            ServerEvent::Message(message) => self.apply_message(message).await,
            ServerEvent::MessageRead(receipt) => self.apply_receipt(receipt).await,
            ServerEvent::MessageDeleted(deleted) => self.apply_deleted(deleted).await,
            ServerEvent::ConversationCreated(conversation)
            | ServerEvent::ConversationUpdated(conversation) => {
                self.apply_conversation(conversation).await;
            }
            ServerEvent::TypingStart(typing) => self.apply_typing(typing, true).await,
            ServerEvent::TypingStop(typing) => self.apply_typing(typing, false).await,
            event @ (ServerEvent::PresenceOnline(_) | ServerEvent::PresenceOffline(_)) => {
                if self.inner.presence.apply(&event) {
                    self.note_change();
                }
            }
            // The transport turns this frame into a lifecycle event
            // before it reaches the event stream.
            ServerEvent::TokenExpired => {}
        }
    }

    async fn apply_message(&self, message: MessagePayload) {
        let conversation_id = message.conversation_id.clone();
        let foreign = message.sender_id != self.inner.user_id;
        let mut auto_read = false;
        let known;
        let changed;

        {
            let mut guard = self.inner.state.lock().await;
            let state = &mut *guard;
            known = state.conversations.contains_key(&conversation_id);
            let log = state.logs.entry(conversation_id.clone()).or_default();

            if let Some(existing) = log.iter_mut().find(|view| view.message.id == message.id) {
                changed = merge_message(existing, message.clone());
            } else if !foreign && try_absorb_echo(log, &message) {
                changed = true;
            } else {
                let position = insert_position(log, message.sent_at);
                log.insert(
                    position,
                    MessageView {
                        message: message.clone(),
                        local: LocalState::Confirmed,
                    },
                );
                changed = true;

                if foreign && !message.is_deleted {
                    let is_active = state
                        .active
                        .as_ref()
                        .is_some_and(|active| active.conversation_id == conversation_id);
                    if is_active {
                        auto_read = true;
                    } else if let Some(conversation) =
                        state.conversations.get_mut(&conversation_id)
                    {
                        *conversation
                            .unread_counts
                            .entry(self.inner.user_id.clone())
                            .or_insert(0) += 1;
                    }
                }
            }

            if changed {
                if let Some(conversation) = state.conversations.get_mut(&conversation_id) {
                    let newer = conversation
                        .last_message
                        .as_ref()
                        .is_none_or(|last| last.sent_at <= message.sent_at);
                    if newer {
                        conversation.last_message = Some(message.to_last_message());
                        if conversation.updated_at < message.sent_at {
                            conversation.updated_at = message.sent_at;
                        }
                    }
                }
            }
        }

        if changed {
            self.note_change();
        }
        if !known {
            // A message for a conversation this store has never listed
            // means the index is stale, e.g. a group created elsewhere.
            let store = self.clone();
            tokio::spawn(async move {
                if let Err(error) = store.load_conversations().await {
                    tracing::warn!(error = %error, "Conversation refresh failed");
                }
            });
        }
        if auto_read {
            // The conversation is on screen, so the arrival is a read.
            let store = self.clone();
            let conversation = conversation_id;
            tokio::spawn(async move {
                if let Err(error) = store.mark_as_read(&conversation).await {
                    tracing::warn!(error = %error, "Auto mark-read failed");
                }
            });
        }
    }

    async fn apply_receipt(&self, receipt: ReadReceiptPayload) {
        let mut changed = false;
        let mut guard = self.inner.state.lock().await;
        let state = &mut *guard;

        if let Some(log) = state.logs.get_mut(&receipt.conversation_id) {
            for view in log.iter_mut() {
                if receipt.message_ids.contains(&view.message.id)
                    && view.message.status.mark_read(receipt.read_at)
                {
                    changed = true;
                }
            }
        }

        if receipt.user_id == self.inner.user_id {
            // Another session of this user read the conversation.
            if let Some(conversation) = state.conversations.get_mut(&receipt.conversation_id) {
                let counter = conversation
                    .unread_counts
                    .entry(self.inner.user_id.clone())
                    .or_insert(0);
                if *counter != 0 {
                    *counter = 0;
                    changed = true;
                }
            }
        }

        drop(guard);
        if changed {
            self.note_change();
        }
    }

    async fn apply_deleted(&self, deleted: MessageDeletedPayload) {
        let mut changed = false;
        let mut guard = self.inner.state.lock().await;
        let state = &mut *guard;

        if let Some(view) = state
            .logs
            .get_mut(&deleted.conversation_id)
            .and_then(|log| log.iter_mut().find(|view| view.message.id == deleted.message_id))
        {
            if !view.message.is_deleted {
                view.message.is_deleted = true;
                view.message.content = None;
                view.message.attachments.clear();
                changed = true;
            }
        }

        if changed {
            if let Some(last) = state
                .conversations
                .get_mut(&deleted.conversation_id)
                .and_then(|conversation| conversation.last_message.as_mut())
            {
                if last.id == deleted.message_id {
                    last.content = None;
                }
            }
        }

        drop(guard);
        if changed {
            self.note_change();
        }
    }

    async fn apply_conversation(&self, conversation: ConversationPayload) {
        let mut guard = self.inner.state.lock().await;
        let changed = guard.conversations.get(&conversation.id) != Some(&conversation);
        guard
            .conversations
            .insert(conversation.id.clone(), conversation);
        drop(guard);
        if changed {
            self.note_change();
        }
    }

    async fn apply_typing(&self, typing: TypingPayload, started: bool) {
        if typing.user_id == self.inner.user_id {
            return;
        }

        let mut guard = self.inner.state.lock().await;
        let changed = if started {
            guard
                .typing
                .entry(typing.conversation_id.clone())
                .or_default()
                .insert(typing.user_id.clone())
        } else {
            match guard.typing.get_mut(&typing.conversation_id) {
                Some(set) => {
                    let removed = set.remove(&typing.user_id);
                    if set.is_empty() {
                        guard.typing.remove(&typing.conversation_id);
                    }
                    removed
                }
                None => false,
            }
        };
        drop(guard);

        if started {
            self.arm_remote_typing_expiry(&typing);
        } else {
            self.cancel_remote_typing_expiry(&typing);
        }
        if changed {
            self.note_change();
        }
    }

    // === Reconciliation internals ===

    async fn reconcile_confirmed(
        &self,
        conversation_id: &str,
        placeholder_id: &str,
        confirmed: &MessagePayload,
    ) {
        let mut guard = self.inner.state.lock().await;
        let state = &mut *guard;

        if let Some(log) = state.logs.get_mut(conversation_id) {
            let echo_arrived = log.iter().any(|view| view.message.id == confirmed.id);
            if echo_arrived {
                // The room echo beat the confirmation; drop the placeholder.
                log.retain(|view| view.message.id != placeholder_id);
            } else if let Some(view) =
                log.iter_mut().find(|view| view.message.id == placeholder_id)
            {
                view.message = confirmed.clone();
                view.local = LocalState::Confirmed;
            } else {
                let position = insert_position(log, confirmed.sent_at);
                log.insert(
                    position,
                    MessageView {
                        message: confirmed.clone(),
                        local: LocalState::Confirmed,
                    },
                );
            }
        }

        if let Some(conversation) = state.conversations.get_mut(conversation_id) {
            let placeholder_is_preview = conversation
                .last_message
                .as_ref()
                .is_some_and(|last| last.id == placeholder_id);
            if placeholder_is_preview {
                conversation.last_message = Some(confirmed.to_last_message());
                if conversation.updated_at < confirmed.sent_at {
                    conversation.updated_at = confirmed.sent_at;
                }
            }
        }

        drop(guard);
        self.note_change();
    }

    async fn mark_send_failed(&self, conversation_id: &str, placeholder_id: &str) {
        let mut guard = self.inner.state.lock().await;
        if let Some(view) = guard
            .logs
            .get_mut(conversation_id)
            .and_then(|log| log.iter_mut().find(|view| view.message.id == placeholder_id))
        {
            view.local = LocalState::Failed;
        }
        drop(guard);
        self.note_change();
    }

    fn relay_confirmed(&self, conversation_id: &str, confirmed: &MessagePayload) {
        // Other sessions subscribed to the conversation channel get the
        // copy immediately; their stores absorb the duplicate by ID.
        self.inner
            .transport
            .emit(&ClientEvent::SendMessage(SendMessagePayload {
                conversation_id: conversation_id.to_string(),
                message: confirmed.clone(),
            }));
    }

    async fn zero_unread(&self, conversation_id: &str) {
        let mut guard = self.inner.state.lock().await;
        let mut changed = false;
        if let Some(conversation) = guard.conversations.get_mut(conversation_id) {
            let counter = conversation
                .unread_counts
                .entry(self.inner.user_id.clone())
                .or_insert(0);
            if *counter != 0 {
                *counter = 0;
                changed = true;
            }
        }
        drop(guard);
        if changed {
            self.note_change();
        }
    }

    async fn catch_up(&self) -> AppResult<()> {
        self.load_conversations().await?;
        let active = {
            let guard = self.inner.state.lock().await;
            guard
                .active
                .as_ref()
                .map(|active| active.conversation_id.clone())
        };
        if let Some(conversation_id) = active {
            self.load_messages(&conversation_id).await?;
        }
        Ok(())
    }

    async fn clear_typing(&self) {
        {
            let mut timers = self.lock_typing_expiry();
            for (_, handle) in timers.drain() {
                handle.abort();
            }
        }
        {
            let mut timers = self.lock_typing_out();
            for (_, handle) in timers.drain() {
                handle.abort();
            }
        }
        let mut guard = self.inner.state.lock().await;
        let had_any = !guard.typing.is_empty();
        guard.typing.clear();
        drop(guard);
        if had_any {
            self.note_change();
        }
    }

    fn arm_remote_typing_expiry(&self, typing: &TypingPayload) {
        let key = (typing.conversation_id.clone(), typing.user_id.clone());
        let store = self.clone();
        let payload = typing.clone();
        // The sender auto-stops after one timeout; twice that covers a
        // lost stop frame.
        let timeout = self.inner.typing_timeout * 2;
        let handle = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            store.expire_remote_typing(payload).await;
        });

        let mut timers = self.lock_typing_expiry();
        if let Some(previous) = timers.insert(key, handle) {
            previous.abort();
        }
    }

    fn cancel_remote_typing_expiry(&self, typing: &TypingPayload) {
        let key = (typing.conversation_id.clone(), typing.user_id.clone());
        let mut timers = self.lock_typing_expiry();
        if let Some(handle) = timers.remove(&key) {
            handle.abort();
        }
    }

    async fn expire_remote_typing(&self, typing: TypingPayload) {
        {
            let key = (typing.conversation_id.clone(), typing.user_id.clone());
            self.lock_typing_expiry().remove(&key);
        }
        self.apply_typing(typing, false).await;
    }

    fn note_change(&self) {
        self.inner.changes.send_modify(|version| *version += 1);
    }

    fn lock_typing_out(&self) -> std::sync::MutexGuard<'_, HashMap<String, JoinHandle<()>>> {
        match self.inner.typing_out.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn lock_typing_expiry(
        &self,
    ) -> std::sync::MutexGuard<'_, HashMap<(String, String), JoinHandle<()>>> {
        match self.inner.typing_expiry.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Position keeping the log sorted by `sent_at`, ties after existing
/// entries so arrival order is preserved.
fn insert_position(log: &[MessageView], sent_at: DateTime<Utc>) -> usize {
    log.iter()
        .rposition(|view| view.message.sent_at <= sent_at)
        .map_or(0, |index| index + 1)
}

/// Merge a server copy into an existing entry. Returns whether anything
/// visible changed. The server copy wins except for delivery state, which
/// never regresses.
fn merge_message(existing: &mut MessageView, mut incoming: MessagePayload) -> bool {
    let current = existing.message.status.state;
    if current != incoming.status.state && !current.can_transition_to(incoming.status.state) {
        incoming.status = existing.message.status.clone();
    }
    let changed = existing.message != incoming || existing.local != LocalState::Confirmed;
    existing.message = incoming;
    existing.local = LocalState::Confirmed;
    changed
}

/// Replace the oldest matching `Pending` placeholder with the confirmed
/// copy that echoed back through the conversation channel before the REST
/// confirmation landed. Returns whether a placeholder was absorbed.
fn try_absorb_echo(log: &mut [MessageView], message: &MessagePayload) -> bool {
    let Some(view) = log.iter_mut().find(|view| {
        view.local == LocalState::Pending
            && view.message.content == message.content
            && view.message.kind == message.kind
            && view.message.attachments == message.attachments
    }) else {
        return false;
    };
    view.message = message.clone();
    view.local = LocalState::Confirmed;
    true
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::api::ConversationApi;
    use crate::reconnect::ReconnectPolicy;
    use async_trait::async_trait;
    use chatwire_common::events::{
        AttachmentPayload, ParticipantPayload, ParticipantRole, PresencePayload,
    };
    use chatwire_common::id::is_temp_id;
    use std::sync::Mutex as StdMutex;
    use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
    use tokio::sync::Notify;

    struct FakeApi {
        conversations: StdMutex<Vec<ConversationPayload>>,
        logs: StdMutex<HashMap<String, Vec<MessagePayload>>>,
        read_calls: StdMutex<Vec<(String, Vec<String>)>>,
        fail_sends: AtomicBool,
        hold_sends: AtomicBool,
        release: Notify,
        next_id: AtomicU64,
    }

    impl FakeApi {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                conversations: StdMutex::new(Vec::new()),
                logs: StdMutex::new(HashMap::new()),
                read_calls: StdMutex::new(Vec::new()),
                fail_sends: AtomicBool::new(false),
                hold_sends: AtomicBool::new(false),
                release: Notify::new(),
                next_id: AtomicU64::new(1),
            })
        }

        fn assigned_id(&self) -> String {
            format!("m{}", self.next_id.fetch_add(1, Ordering::SeqCst))
        }

        fn read_calls(&self) -> Vec<(String, Vec<String>)> {
            self.read_calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ConversationApi for FakeApi {
        async fn list_conversations(&self) -> AppResult<Vec<ConversationPayload>> {
            Ok(self.conversations.lock().unwrap().clone())
        }

        async fn get_or_create_direct(&self, partner_id: &str) -> AppResult<ConversationPayload> {
            let conversation = direct_conversation(
                &format!("direct-{partner_id}"),
                "alice",
                partner_id,
            );
            self.conversations.lock().unwrap().push(conversation.clone());
            Ok(conversation)
        }

        async fn create_conversation(
            &self,
            _kind: ConversationKind,
            _participant_ids: Vec<String>,
        ) -> AppResult<ConversationPayload> {
            Err(AppError::Internal("not exercised here".to_string()))
        }

        async fn messages(&self, conversation_id: &str) -> AppResult<Vec<MessagePayload>> {
            Ok(self
                .logs
                .lock()
                .unwrap()
                .get(conversation_id)
                .cloned()
                .unwrap_or_default())
        }

        async fn send_message(
            &self,
            conversation_id: &str,
            request: &SendMessageRequest,
        ) -> AppResult<MessagePayload> {
            if self.hold_sends.load(Ordering::SeqCst) {
                self.release.notified().await;
            }
            if self.fail_sends.load(Ordering::SeqCst) {
                return Err(AppError::Http("connection reset".to_string()));
            }
            let message = MessagePayload {
                id: self.assigned_id(),
                conversation_id: conversation_id.to_string(),
                sender_id: "alice".to_string(),
                content: request.content.clone(),
                kind: request.kind,
                attachments: request.attachments.clone(),
                reply_to: request.reply_to.clone(),
                status: MessageStatus::sent(),
                sent_at: Utc::now(),
                edited_at: None,
                is_deleted: false,
            };
            self.logs
                .lock()
                .unwrap()
                .entry(conversation_id.to_string())
                .or_default()
                .push(message.clone());
            Ok(message)
        }

        async fn mark_read(
            &self,
            conversation_id: &str,
            message_ids: &[String],
        ) -> AppResult<u64> {
            self.read_calls
                .lock()
                .unwrap()
                .push((conversation_id.to_string(), message_ids.to_vec()));
            Ok(message_ids.len() as u64)
        }

        async fn upload_attachment(
            &self,
            _conversation_id: &str,
            file_name: &str,
            mime_type: &str,
            bytes: Vec<u8>,
        ) -> AppResult<AttachmentPayload> {
            Ok(AttachmentPayload {
                id: "a1".to_string(),
                file_name: file_name.to_string(),
                file_size: bytes.len() as u64,
                mime_type: mime_type.to_string(),
                url: format!("http://localhost/files/{file_name}"),
                thumbnail_url: None,
            })
        }
    }

    fn participant(user_id: &str) -> ParticipantPayload {
        ParticipantPayload {
            user_id: user_id.to_string(),
            role: ParticipantRole::Member,
            joined_at: Utc::now(),
            last_seen_at: None,
            is_active: true,
        }
    }

    fn direct_conversation(id: &str, a: &str, b: &str) -> ConversationPayload {
        ConversationPayload {
            id: id.to_string(),
            kind: ConversationKind::Direct,
            participants: vec![participant(a), participant(b)],
            last_message: None,
            unread_counts: HashMap::new(),
            settings: chatwire_common::events::ConversationSettingsPayload::default(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn foreign_message(id: &str, conversation_id: &str, sender: &str, content: &str) -> MessagePayload {
        MessagePayload {
            id: id.to_string(),
            conversation_id: conversation_id.to_string(),
            sender_id: sender.to_string(),
            content: Some(content.to_string()),
            kind: MessageKind::Text,
            attachments: vec![],
            reply_to: None,
            status: MessageStatus::sent(),
            sent_at: Utc::now(),
            edited_at: None,
            is_deleted: false,
        }
    }

    struct Harness {
        api: Arc<FakeApi>,
        store: ChatStore,
    }

    fn harness() -> Harness {
        harness_with(SyncConfig::default())
    }

    fn harness_with(sync: SyncConfig) -> Harness {
        let api = FakeApi::new();
        let service: ConversationApiService = api.clone();
        let transport = Transport::new("http://localhost:0", "token", ReconnectPolicy::default());
        let store = ChatStore::new("alice", service, transport, &sync);
        Harness { api, store }
    }

    async fn seeded_harness() -> Harness {
        let h = harness();
        h.store
            .handle_server_event(ServerEvent::ConversationCreated(direct_conversation(
                "c1", "alice", "bob",
            )))
            .await;
        h
    }

    async fn wait_until(store: &ChatStore, predicate: impl Fn(&ChatSnapshot) -> bool) {
        let mut changes = store.subscribe_changes();
        for _ in 0..100 {
            let snapshot = store.snapshot().await;
            if predicate(&snapshot) {
                return;
            }
            let _ = tokio::time::timeout(Duration::from_millis(100), changes.changed()).await;
        }
        panic!("store did not converge");
    }

    #[tokio::test]
    async fn test_send_is_visible_before_confirmation() {
        let h = seeded_harness().await;
        h.api.hold_sends.store(true, Ordering::SeqCst);

        let store = h.store.clone();
        let send = tokio::spawn(async move {
            store
                .send_message(
                    "c1",
                    SendMessageRequest {
                        content: Some("hi bob".to_string()),
                        ..SendMessageRequest::default()
                    },
                )
                .await
        });

        wait_until(&h.store, |snapshot| {
            snapshot
                .conversation("c1")
                .is_some_and(|view| view.messages.len() == 1)
        })
        .await;

        let view = h.store.conversation_snapshot("c1").await.unwrap();
        assert_eq!(view.messages[0].local, LocalState::Pending);
        assert!(is_temp_id(&view.messages[0].message.id));
        assert_eq!(
            view.conversation.last_message.as_ref().unwrap().content,
            Some("hi bob".to_string())
        );

        h.api.release.notify_one();
        let confirmed = send.await.unwrap().unwrap();
        assert_eq!(confirmed.id, "m1");

        let view = h.store.conversation_snapshot("c1").await.unwrap();
        assert_eq!(view.messages.len(), 1);
        assert_eq!(view.messages[0].local, LocalState::Confirmed);
        assert_eq!(view.messages[0].message.id, "m1");
    }

    #[tokio::test]
    async fn test_failed_send_keeps_content_for_retry() {
        let h = seeded_harness().await;
        h.api.fail_sends.store(true, Ordering::SeqCst);

        let result = h
            .store
            .send_message(
                "c1",
                SendMessageRequest {
                    content: Some("lost?".to_string()),
                    ..SendMessageRequest::default()
                },
            )
            .await;
        assert!(result.is_err());

        let view = h.store.conversation_snapshot("c1").await.unwrap();
        assert_eq!(view.messages.len(), 1);
        assert_eq!(view.messages[0].local, LocalState::Failed);
        assert_eq!(view.messages[0].message.content, Some("lost?".to_string()));
        let failed_id = view.messages[0].message.id.clone();

        h.api.fail_sends.store(false, Ordering::SeqCst);
        let confirmed = h.store.retry_message("c1", &failed_id).await.unwrap();
        assert_eq!(confirmed.content, Some("lost?".to_string()));

        let view = h.store.conversation_snapshot("c1").await.unwrap();
        assert_eq!(view.messages.len(), 1);
        assert_eq!(view.messages[0].local, LocalState::Confirmed);
        assert!(!is_temp_id(&view.messages[0].message.id));
    }

    #[tokio::test]
    async fn test_remove_failed_discards_entry() {
        let h = seeded_harness().await;
        h.api.fail_sends.store(true, Ordering::SeqCst);

        let _ = h
            .store
            .send_message(
                "c1",
                SendMessageRequest {
                    content: Some("oops".to_string()),
                    ..SendMessageRequest::default()
                },
            )
            .await;
        let view = h.store.conversation_snapshot("c1").await.unwrap();
        let failed_id = view.messages[0].message.id.clone();

        assert!(h.store.remove_failed("c1", &failed_id).await);
        assert!(!h.store.remove_failed("c1", &failed_id).await);

        let view = h.store.conversation_snapshot("c1").await.unwrap();
        assert!(view.messages.is_empty());
    }

    #[tokio::test]
    async fn test_message_for_unknown_conversation_refreshes_list() {
        let h = harness();
        h.api
            .conversations
            .lock()
            .unwrap()
            .push(direct_conversation("c9", "alice", "bob"));

        // No creation event ever arrived for c9; the message alone must
        // pull the summary in.
        h.store
            .handle_server_event(ServerEvent::Message(foreign_message(
                "m1", "c9", "bob", "surprise",
            )))
            .await;

        wait_until(&h.store, |snapshot| snapshot.conversation("c9").is_some()).await;
        let view = h.store.conversation_snapshot("c9").await.unwrap();
        assert_eq!(view.messages.len(), 1);
        assert_eq!(view.messages[0].message.id, "m1");
    }

    #[tokio::test]
    async fn test_duplicate_events_do_not_duplicate_messages() {
        let h = seeded_harness().await;
        let message = foreign_message("m1", "c1", "bob", "hello");

        h.store
            .handle_server_event(ServerEvent::Message(message.clone()))
            .await;
        h.store
            .handle_server_event(ServerEvent::Message(message))
            .await;

        let view = h.store.conversation_snapshot("c1").await.unwrap();
        assert_eq!(view.messages.len(), 1);
        // The unread counter only moved on the first application.
        assert_eq!(view.unread_count, 1);
    }

    #[tokio::test]
    async fn test_room_echo_before_confirmation_is_absorbed() {
        let h = seeded_harness().await;
        h.api.hold_sends.store(true, Ordering::SeqCst);

        let store = h.store.clone();
        let send = tokio::spawn(async move {
            store
                .send_message(
                    "c1",
                    SendMessageRequest {
                        content: Some("race".to_string()),
                        ..SendMessageRequest::default()
                    },
                )
                .await
        });

        wait_until(&h.store, |snapshot| {
            snapshot
                .conversation("c1")
                .is_some_and(|view| view.messages.len() == 1)
        })
        .await;

        // The confirmed copy arrives through the conversation channel
        // before the REST confirmation returns.
        let echo = foreign_message("m1", "c1", "alice", "race");
        h.store
            .handle_server_event(ServerEvent::Message(echo))
            .await;

        let view = h.store.conversation_snapshot("c1").await.unwrap();
        assert_eq!(view.messages.len(), 1);
        assert_eq!(view.messages[0].message.id, "m1");
        assert_eq!(view.messages[0].local, LocalState::Confirmed);

        h.api.release.notify_one();
        let confirmed = send.await.unwrap().unwrap();
        assert_eq!(confirmed.id, "m1");

        let view = h.store.conversation_snapshot("c1").await.unwrap();
        assert_eq!(view.messages.len(), 1);
    }

    #[tokio::test]
    async fn test_unread_bumps_and_resets() {
        let h = seeded_harness().await;

        h.store
            .handle_server_event(ServerEvent::Message(foreign_message(
                "m1", "c1", "bob", "one",
            )))
            .await;
        h.store
            .handle_server_event(ServerEvent::Message(foreign_message(
                "m2", "c1", "bob", "two",
            )))
            .await;

        let view = h.store.conversation_snapshot("c1").await.unwrap();
        assert_eq!(view.unread_count, 2);

        let count = h.store.mark_as_read("c1").await.unwrap();
        assert_eq!(count, 2);
        assert_eq!(
            h.api.read_calls(),
            vec![(
                "c1".to_string(),
                vec!["m1".to_string(), "m2".to_string()]
            )]
        );

        let view = h.store.conversation_snapshot("c1").await.unwrap();
        assert_eq!(view.unread_count, 0);
        assert_eq!(view.messages[0].message.status.state, MessageState::Read);
    }

    #[tokio::test]
    async fn test_mark_as_read_without_eligible_messages_is_a_no_op() {
        let h = seeded_harness().await;

        // Only the user's own message in the log.
        h.store
            .send_message(
                "c1",
                SendMessageRequest {
                    content: Some("mine".to_string()),
                    ..SendMessageRequest::default()
                },
            )
            .await
            .unwrap();

        let count = h.store.mark_as_read("c1").await.unwrap();
        assert_eq!(count, 0);
        assert!(h.api.read_calls().is_empty());
    }

    #[tokio::test]
    async fn test_active_conversation_auto_reads_arrivals() {
        let h = seeded_harness().await;
        h.store.set_active_conversation(Some("c1")).await.unwrap();

        h.store
            .handle_server_event(ServerEvent::Message(foreign_message(
                "m9", "c1", "bob", "seen instantly",
            )))
            .await;

        wait_until(&h.store, |snapshot| {
            snapshot
                .conversation("c1")
                .is_some_and(|view| view.unread_count == 0)
        })
        .await;
        let calls = h.api.read_calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].1, vec!["m9".to_string()]);
    }

    #[tokio::test]
    async fn test_receipt_flips_sender_copy_and_backfills_delivery() {
        let h = seeded_harness().await;
        let confirmed = h
            .store
            .send_message(
                "c1",
                SendMessageRequest {
                    content: Some("read me".to_string()),
                    ..SendMessageRequest::default()
                },
            )
            .await
            .unwrap();

        let read_at = Utc::now();
        h.store
            .handle_server_event(ServerEvent::MessageRead(ReadReceiptPayload {
                conversation_id: "c1".to_string(),
                user_id: "bob".to_string(),
                message_ids: vec![confirmed.id.clone()],
                read_at,
            }))
            .await;

        let view = h.store.conversation_snapshot("c1").await.unwrap();
        let status = &view.messages[0].message.status;
        assert_eq!(status.state, MessageState::Read);
        assert_eq!(status.read_at, Some(read_at));
        assert_eq!(status.delivered_at, Some(read_at));
    }

    #[tokio::test]
    async fn test_deleted_message_becomes_tombstone() {
        let h = seeded_harness().await;
        h.store
            .handle_server_event(ServerEvent::Message(foreign_message(
                "m1", "c1", "bob", "regret",
            )))
            .await;

        h.store
            .handle_server_event(ServerEvent::MessageDeleted(MessageDeletedPayload {
                conversation_id: "c1".to_string(),
                message_id: "m1".to_string(),
            }))
            .await;

        let view = h.store.conversation_snapshot("c1").await.unwrap();
        assert_eq!(view.messages.len(), 1);
        assert!(view.messages[0].message.is_deleted);
        assert_eq!(view.messages[0].message.content, None);
        assert_eq!(view.conversation.last_message.as_ref().unwrap().content, None);
    }

    #[tokio::test]
    async fn test_load_messages_preserves_unconfirmed_entries() {
        let h = seeded_harness().await;

        // A failed send sits in the log.
        h.api.fail_sends.store(true, Ordering::SeqCst);
        let _ = h
            .store
            .send_message(
                "c1",
                SendMessageRequest {
                    content: Some("draft".to_string()),
                    ..SendMessageRequest::default()
                },
            )
            .await;
        h.api.fail_sends.store(false, Ordering::SeqCst);

        // The server log has two confirmed messages.
        h.api.logs.lock().unwrap().insert(
            "c1".to_string(),
            vec![
                foreign_message("m1", "c1", "bob", "one"),
                foreign_message("m2", "c1", "bob", "two"),
            ],
        );

        h.store.load_messages("c1").await.unwrap();

        let view = h.store.conversation_snapshot("c1").await.unwrap();
        assert_eq!(view.messages.len(), 3);
        let failed: Vec<_> = view
            .messages
            .iter()
            .filter(|view| view.local == LocalState::Failed)
            .collect();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].message.content, Some("draft".to_string()));
    }

    #[tokio::test]
    async fn test_typing_indicators_follow_events() {
        let h = seeded_harness().await;
        let typing = TypingPayload {
            conversation_id: "c1".to_string(),
            user_id: "bob".to_string(),
        };

        h.store
            .handle_server_event(ServerEvent::TypingStart(typing.clone()))
            .await;
        let view = h.store.conversation_snapshot("c1").await.unwrap();
        assert_eq!(view.typing_user_ids, vec!["bob"]);

        h.store
            .handle_server_event(ServerEvent::TypingStop(typing))
            .await;
        let view = h.store.conversation_snapshot("c1").await.unwrap();
        assert!(view.typing_user_ids.is_empty());
    }

    #[tokio::test]
    async fn test_own_typing_events_are_not_shown() {
        let h = seeded_harness().await;
        h.store
            .handle_server_event(ServerEvent::TypingStart(TypingPayload {
                conversation_id: "c1".to_string(),
                user_id: "alice".to_string(),
            }))
            .await;

        let view = h.store.conversation_snapshot("c1").await.unwrap();
        assert!(view.typing_user_ids.is_empty());
    }

    #[tokio::test]
    async fn test_stale_typing_indicator_expires() {
        let h = harness_with(SyncConfig {
            typing_timeout_ms: 50,
            ..SyncConfig::default()
        });
        h.store
            .handle_server_event(ServerEvent::ConversationCreated(direct_conversation(
                "c1", "alice", "bob",
            )))
            .await;

        h.store
            .handle_server_event(ServerEvent::TypingStart(TypingPayload {
                conversation_id: "c1".to_string(),
                user_id: "bob".to_string(),
            }))
            .await;
        let view = h.store.conversation_snapshot("c1").await.unwrap();
        assert_eq!(view.typing_user_ids, vec!["bob"]);

        // No stop frame arrives; the safety net clears the indicator.
        wait_until(&h.store, |snapshot| {
            snapshot
                .conversation("c1")
                .is_some_and(|view| view.typing_user_ids.is_empty())
        })
        .await;
    }

    #[tokio::test]
    async fn test_snapshot_orders_pinned_first_then_recency() {
        let h = harness();
        let mut older = direct_conversation("c-old", "alice", "bob");
        older.updated_at = Utc::now() - chrono::Duration::hours(2);
        let mut newer = direct_conversation("c-new", "alice", "carol");
        newer.updated_at = Utc::now();
        let mut pinned = direct_conversation("c-pinned", "alice", "dave");
        pinned.updated_at = Utc::now() - chrono::Duration::hours(5);
        pinned.settings.pinned_by.push("alice".to_string());

        for conversation in [older, newer, pinned] {
            h.store
                .handle_server_event(ServerEvent::ConversationCreated(conversation))
                .await;
        }

        let snapshot = h.store.snapshot().await;
        let order: Vec<&str> = snapshot
            .conversations
            .iter()
            .map(|view| view.conversation.id.as_str())
            .collect();
        assert_eq!(order, vec!["c-pinned", "c-new", "c-old"]);
    }

    #[tokio::test]
    async fn test_presence_events_update_tracker() {
        let h = harness();
        h.store
            .handle_server_event(ServerEvent::PresenceOnline(PresencePayload {
                user_id: "bob".to_string(),
            }))
            .await;

        assert!(h.store.presence().is_online("bob"));
        assert_eq!(h.store.presence().online_users(), vec!["bob"]);
    }

    #[tokio::test]
    async fn test_open_direct_registers_conversation() {
        let h = harness();
        let id = h.store.open_direct("bob").await.unwrap();
        assert_eq!(id, "direct-bob");

        let snapshot = h.store.snapshot().await;
        assert!(snapshot.conversation("direct-bob").is_some());
    }

    #[tokio::test]
    async fn test_message_edit_replaces_content_in_place() {
        let h = seeded_harness().await;
        h.store
            .handle_server_event(ServerEvent::Message(foreign_message(
                "m1", "c1", "bob", "typo",
            )))
            .await;

        let mut edited = foreign_message("m1", "c1", "bob", "fixed");
        edited.edited_at = Some(Utc::now());
        h.store
            .handle_server_event(ServerEvent::Message(edited))
            .await;

        let view = h.store.conversation_snapshot("c1").await.unwrap();
        assert_eq!(view.messages.len(), 1);
        assert_eq!(view.messages[0].message.content, Some("fixed".to_string()));
        assert!(view.messages[0].message.edited_at.is_some());
        // The second application of the same ID never bumps unread again.
        assert_eq!(view.unread_count, 1);
    }

    #[tokio::test]
    async fn test_receipt_never_regresses_read_state() {
        let h = seeded_harness().await;
        let confirmed = h
            .store
            .send_message(
                "c1",
                SendMessageRequest {
                    content: Some("monotonic".to_string()),
                    ..SendMessageRequest::default()
                },
            )
            .await
            .unwrap();

        let read_at = Utc::now();
        h.store
            .handle_server_event(ServerEvent::MessageRead(ReadReceiptPayload {
                conversation_id: "c1".to_string(),
                user_id: "bob".to_string(),
                message_ids: vec![confirmed.id.clone()],
                read_at,
            }))
            .await;

        // A stale copy of the message with an older status replays.
        let mut stale = confirmed.clone();
        stale.status = MessageStatus::sent();
        h.store
            .handle_server_event(ServerEvent::Message(stale))
            .await;

        let view = h.store.conversation_snapshot("c1").await.unwrap();
        assert_eq!(view.messages[0].message.status.state, MessageState::Read);
    }
}
