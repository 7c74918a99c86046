//! Realtime layer for chatwire.
//!
//! This crate is the server's HTTP surface:
//!
//! - **Hub**: per-channel broadcast fan-out for server events
//! - **Presence**: live-session roster with online/offline transitions
//! - **Sessions**: the WebSocket endpoint driving joined channels
//! - **Endpoints**: the REST persistence API (conversations, messages,
//!   receipts, attachments)
//!
//! Built on Axum 0.8 with the conversation service from `chatwire-core`
//! underneath.

pub mod auth;
pub mod endpoints;
pub mod extractors;
pub mod hub;
pub mod middleware;
pub mod presence;
pub mod response;
pub mod session;

pub use auth::{
    SessionAuthenticator, SessionAuthenticatorService, SessionIdentity, StaticTokenAuthenticator,
};
pub use endpoints::router;
pub use hub::RealtimeHub;
pub use presence::PresenceRoster;
pub use session::session_handler;
