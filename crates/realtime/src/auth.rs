//! Session authentication seam.
//!
//! Token issuance lives outside this system; the realtime layer only
//! verifies bearer tokens through the [`SessionAuthenticator`] trait and
//! works with the resulting [`SessionIdentity`]. An expired token is a
//! distinct failure from an invalid one so sessions can tell the client
//! to re-authenticate instead of silently retrying.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chatwire_common::config::AuthConfig;
use chatwire_common::{AppError, AppResult};
use chrono::{DateTime, Utc};

/// The authenticated principal behind a session or request.
#[derive(Debug, Clone)]
pub struct SessionIdentity {
    /// The user the token belongs to.
    pub user_id: String,
    /// When the token stops being valid. `None` means it never expires.
    pub expires_at: Option<DateTime<Utc>>,
}

impl SessionIdentity {
    /// Whether the identity is expired at the given instant.
    #[must_use]
    pub fn is_expired(&self, at: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|expires_at| expires_at <= at)
    }
}

/// Verifies bearer tokens.
#[async_trait]
pub trait SessionAuthenticator: Send + Sync {
    /// Resolve a token to an identity, or fail with `Unauthorized` for an
    /// unknown token and `TokenExpired` for a known-but-stale one.
    async fn authenticate(&self, token: &str) -> AppResult<SessionIdentity>;
}

/// Shared handle to a session authenticator.
pub type SessionAuthenticatorService = Arc<dyn SessionAuthenticator>;

/// Fixed token table, loaded from configuration.
///
/// Meant for development and single-tenant deployments; tokens never
/// expire. Production deployments plug a real verifier into the trait.
#[derive(Debug, Clone, Default)]
pub struct StaticTokenAuthenticator {
    tokens: HashMap<String, String>,
}

impl StaticTokenAuthenticator {
    /// Build from an explicit token-to-user table.
    #[must_use]
    pub const fn new(tokens: HashMap<String, String>) -> Self {
        Self { tokens }
    }

    /// Build from the `auth.static_tokens` configuration section.
    #[must_use]
    pub fn from_config(config: &AuthConfig) -> Self {
        Self::new(config.static_tokens.clone())
    }
}

#[async_trait]
impl SessionAuthenticator for StaticTokenAuthenticator {
    async fn authenticate(&self, token: &str) -> AppResult<SessionIdentity> {
        self.tokens
            .get(token)
            .map(|user_id| SessionIdentity {
                user_id: user_id.clone(),
                expires_at: None,
            })
            .ok_or(AppError::Unauthorized)
    }
}
