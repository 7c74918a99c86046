//! Client-side presence tracking.

use std::collections::HashSet;
use std::sync::{Arc, RwLock};

use chatwire_common::events::ServerEvent;

/// Mirrors the server's presence roster on the client, fed by
/// `presence:online` and `presence:offline` events.
///
/// The server replays the full roster when a session opens, so the tracker
/// converges shortly after every (re)connect without its own fetch.
#[derive(Debug, Clone, Default)]
pub struct PresenceTracker {
    online: Arc<RwLock<HashSet<String>>>,
}

impl PresenceTracker {
    /// Create an empty tracker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply a presence event. Returns whether the roster changed.
    ///
    /// Non-presence events are ignored so the caller can feed the whole
    /// event stream through.
    pub fn apply(&self, event: &ServerEvent) -> bool {
        match event {
            ServerEvent::PresenceOnline(p) => self.set_online(&p.user_id),
            ServerEvent::PresenceOffline(p) => self.set_offline(&p.user_id),
            _ => false,
        }
    }

    /// Mark a user online. Returns whether the roster changed.
    pub fn set_online(&self, user_id: &str) -> bool {
        self.write().insert(user_id.to_string())
    }

    /// Mark a user offline. Returns whether the roster changed.
    pub fn set_offline(&self, user_id: &str) -> bool {
        self.write().remove(user_id)
    }

    /// Whether the user currently has at least one open session.
    #[must_use]
    pub fn is_online(&self, user_id: &str) -> bool {
        self.read().contains(user_id)
    }

    /// Sorted snapshot of online users.
    #[must_use]
    pub fn online_users(&self) -> Vec<String> {
        let mut users: Vec<String> = self.read().iter().cloned().collect();
        users.sort_unstable();
        users
    }

    /// Drop all entries. Called when the link is lost, since the roster is
    /// stale until the next replay.
    pub fn clear(&self) {
        self.write().clear();
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashSet<String>> {
        match self.online.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashSet<String>> {
        match self.online.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
