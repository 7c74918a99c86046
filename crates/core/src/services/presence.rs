//! Presence lookup service.
//!
//! Lets core services ask whether users currently have live sessions
//! without depending on the realtime crate. Presence is advisory: a stale
//! answer only affects delivered markers and notification routing, never
//! message persistence.

use async_trait::async_trait;
use std::sync::Arc;

/// Trait for querying session presence.
#[async_trait]
pub trait PresenceProvider: Send + Sync {
    /// Whether the user has at least one live session.
    async fn is_online(&self, user_id: &str) -> bool;

    /// Whether any of the users has a live session.
    async fn any_online(&self, user_ids: &[String]) -> bool {
        for user_id in user_ids {
            if self.is_online(user_id).await {
                return true;
            }
        }
        false
    }
}

/// A no-op implementation that reports everyone as offline.
#[derive(Clone, Default)]
pub struct NoOpPresenceProvider;

#[async_trait]
impl PresenceProvider for NoOpPresenceProvider {
    async fn is_online(&self, _user_id: &str) -> bool {
        false
    }
}

/// Wrapper for boxed `PresenceProvider` trait object.
pub type PresenceService = Arc<dyn PresenceProvider>;
