//! Server-side presence roster.
//!
//! Counts live sessions per user. Only the first session of a user
//! announces `presence:online` and only the last one leaving announces
//! `presence:offline`, so a user with three tabs open flaps nothing.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chatwire_common::events::{PresencePayload, ServerEvent, channels};
use chatwire_core::PresenceProvider;

use crate::hub::RealtimeHub;

/// Live-session accounting plus online/offline fan-out.
#[derive(Clone)]
pub struct PresenceRoster {
    sessions: Arc<Mutex<HashMap<String, usize>>>,
    hub: RealtimeHub,
}

impl PresenceRoster {
    /// Create a roster publishing transitions through the given hub.
    #[must_use]
    pub fn new(hub: RealtimeHub) -> Self {
        Self {
            sessions: Arc::new(Mutex::new(HashMap::new())),
            hub,
        }
    }

    /// Record a new session for the user. Publishes `presence:online` when
    /// this is their first live session.
    pub fn session_opened(&self, user_id: &str) {
        let came_online = {
            let mut sessions = self.lock();
            let count = sessions.entry(user_id.to_string()).or_insert(0);
            *count += 1;
            *count == 1
        };
        if came_online {
            tracing::debug!(user_id, "User came online");
            self.hub.publish(
                channels::PRESENCE,
                ServerEvent::PresenceOnline(PresencePayload {
                    user_id: user_id.to_string(),
                }),
            );
        }
    }

    /// Record a closed session. Publishes `presence:offline` when it was
    /// the user's last live session.
    pub fn session_closed(&self, user_id: &str) {
        let went_offline = {
            let mut sessions = self.lock();
            match sessions.get_mut(user_id) {
                Some(count) if *count > 1 => {
                    *count -= 1;
                    false
                }
                Some(_) => {
                    sessions.remove(user_id);
                    true
                }
                None => false,
            }
        };
        if went_offline {
            tracing::debug!(user_id, "User went offline");
            self.hub.publish(
                channels::PRESENCE,
                ServerEvent::PresenceOffline(PresencePayload {
                    user_id: user_id.to_string(),
                }),
            );
        }
    }

    /// Snapshot of currently online users, sorted for stable replay.
    #[must_use]
    pub fn online_users(&self) -> Vec<String> {
        let mut users: Vec<String> = self.lock().keys().cloned().collect();
        users.sort_unstable();
        users
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, usize>> {
        match self.sessions.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[async_trait]
impl PresenceProvider for PresenceRoster {
    async fn is_online(&self, user_id: &str) -> bool {
        self.lock().contains_key(user_id)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_first_and_last_session_announce() {
        let hub = RealtimeHub::new(16);
        let mut rx = hub.subscribe(channels::PRESENCE);
        let roster = PresenceRoster::new(hub);

        roster.session_opened("alice");
        roster.session_opened("alice");
        assert!(roster.is_online("alice").await);

        roster.session_closed("alice");
        assert!(roster.is_online("alice").await);
        roster.session_closed("alice");
        assert!(!roster.is_online("alice").await);

        assert!(matches!(
            rx.recv().await.unwrap(),
            ServerEvent::PresenceOnline(p) if p.user_id == "alice"
        ));
        assert!(matches!(
            rx.recv().await.unwrap(),
            ServerEvent::PresenceOffline(p) if p.user_id == "alice"
        ));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_unknown_session_close_is_ignored() {
        let hub = RealtimeHub::new(16);
        let mut rx = hub.subscribe(channels::PRESENCE);
        let roster = PresenceRoster::new(hub);

        roster.session_closed("ghost");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_roster_snapshot_is_sorted() {
        let roster = PresenceRoster::new(RealtimeHub::new(16));
        roster.session_opened("carol");
        roster.session_opened("alice");
        roster.session_opened("bob");

        assert_eq!(roster.online_users(), vec!["alice", "bob", "carol"]);
    }
}
