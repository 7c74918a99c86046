//! Application state and request middleware.

use axum::{body::Body, extract::State, http::Request, middleware::Next, response::Response};
use chatwire_common::config::Config;
use chatwire_core::ConversationService;

use crate::auth::SessionAuthenticatorService;
use crate::hub::RealtimeHub;
use crate::presence::PresenceRoster;

/// Application state.
#[derive(Clone)]
pub struct AppState {
    pub conversation_service: ConversationService,
    pub hub: RealtimeHub,
    pub roster: PresenceRoster,
    pub authenticator: SessionAuthenticatorService,
    pub config: Config,
}

/// Authentication middleware.
///
/// Resolves a `Bearer` token to a [`crate::auth::SessionIdentity`] and
/// stores it in request extensions. Requests without a valid token pass
/// through unauthenticated; protected handlers reject them through the
/// `AuthUser` extractor.
pub async fn auth_middleware(
    State(state): State<AppState>,
    mut req: Request<Body>,
    next: Next,
) -> Response {
    if let Some(token) = bearer_token(&req) {
        match state.authenticator.authenticate(&token).await {
            Ok(identity) => {
                req.extensions_mut().insert(identity);
            }
            Err(e) => {
                tracing::debug!(error = %e, "Request token rejected");
            }
        }
    }

    next.run(req).await
}

fn bearer_token(req: &Request<Body>) -> Option<String> {
    req.headers()
        .get("Authorization")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(std::string::ToString::to_string)
}
