//! Conversation channel subscriptions.
//!
//! Reference-counts joined conversation channels so several views of the
//! same conversation share one server-side membership, and restores every
//! membership after the link reconnects. Events missed while the link was
//! down are not replayed; the next message fetch catches the log up.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use chatwire_common::events::{ClientEvent, ConversationRefPayload};
use tokio::sync::{broadcast, mpsc};

use crate::transport::{ConnectionEvent, Transport};

enum RoomCommand {
    Join(String),
    Leave(String),
}

struct RegistryInner {
    refcounts: Arc<Mutex<HashMap<String, usize>>>,
    commands: mpsc::UnboundedSender<RoomCommand>,
}

/// Reference-counted registry of joined conversation channels.
#[derive(Clone)]
pub struct SubscriptionRegistry {
    inner: Arc<RegistryInner>,
}

impl SubscriptionRegistry {
    /// Create a registry sending join/leave frames through the given
    /// transport.
    #[must_use]
    pub fn new(transport: &Transport) -> Self {
        let refcounts = Arc::new(Mutex::new(HashMap::new()));
        let (commands, commands_rx) = mpsc::unbounded_channel();
        let lifecycle = transport.subscribe_lifecycle();

        tokio::spawn(worker(
            transport.clone(),
            Arc::clone(&refcounts),
            commands_rx,
            lifecycle,
        ));

        Self {
            inner: Arc::new(RegistryInner {
                refcounts,
                commands,
            }),
        }
    }

    /// Join a conversation channel.
    ///
    /// The membership lives until the returned guard is dropped. Joining
    /// an already-joined conversation only bumps the reference count.
    #[must_use = "the channel is left again when this guard is dropped"]
    pub fn join(&self, conversation_id: &str) -> Subscription {
        let first = {
            let mut counts = lock(&self.inner.refcounts);
            let count = counts.entry(conversation_id.to_string()).or_insert(0);
            *count += 1;
            *count == 1
        };
        if first {
            let _ = self
                .inner
                .commands
                .send(RoomCommand::Join(conversation_id.to_string()));
        }
        Subscription {
            inner: Arc::clone(&self.inner),
            conversation_id: conversation_id.to_string(),
        }
    }

    /// Whether the conversation channel is currently joined.
    #[must_use]
    pub fn is_subscribed(&self, conversation_id: &str) -> bool {
        lock(&self.inner.refcounts).contains_key(conversation_id)
    }

    /// Sorted list of joined conversation channels.
    #[must_use]
    pub fn subscribed(&self) -> Vec<String> {
        let mut ids: Vec<String> = lock(&self.inner.refcounts).keys().cloned().collect();
        ids.sort_unstable();
        ids
    }
}

/// Guard for one joined conversation channel. Dropping the last guard of
/// a conversation sends the leave frame.
pub struct Subscription {
    inner: Arc<RegistryInner>,
    conversation_id: String,
}

impl Subscription {
    /// The conversation this guard keeps joined.
    #[must_use]
    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let last = {
            let mut counts = lock(&self.inner.refcounts);
            match counts.get_mut(&self.conversation_id) {
                Some(count) if *count > 1 => {
                    *count -= 1;
                    false
                }
                Some(_) => {
                    counts.remove(&self.conversation_id);
                    true
                }
                None => false,
            }
        };
        if last {
            let _ = self
                .inner
                .commands
                .send(RoomCommand::Leave(self.conversation_id.clone()));
        }
    }
}

fn lock(refcounts: &Mutex<HashMap<String, usize>>) -> MutexGuard<'_, HashMap<String, usize>> {
    match refcounts.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

async fn worker(
    transport: Transport,
    refcounts: Arc<Mutex<HashMap<String, usize>>>,
    mut commands: mpsc::UnboundedReceiver<RoomCommand>,
    mut lifecycle: broadcast::Receiver<ConnectionEvent>,
) {
    loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(RoomCommand::Join(conversation_id)) => {
                    transport.emit(&ClientEvent::JoinConversation(ConversationRefPayload {
                        conversation_id,
                    }));
                }
                Some(RoomCommand::Leave(conversation_id)) => {
                    transport.emit(&ClientEvent::LeaveConversation(ConversationRefPayload {
                        conversation_id,
                    }));
                }
                None => return,
            },
            event = lifecycle.recv() => match event {
                Ok(ConnectionEvent::Established | ConnectionEvent::Reconnected { .. }) => {
                    // A fresh server session starts with no memberships.
                    let joined: Vec<String> = lock(&refcounts).keys().cloned().collect();
                    for conversation_id in joined {
                        tracing::debug!(%conversation_id, "Restoring channel membership");
                        transport.emit(&ClientEvent::JoinConversation(ConversationRefPayload {
                            conversation_id,
                        }));
                    }
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Lifecycle events lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return,
            },
        }
    }
}
