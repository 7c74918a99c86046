//! REST endpoints for the persistence API.

mod attachments;
mod conversations;

use axum::Router;

use crate::middleware::AppState;

/// Create the API router.
pub fn router() -> Router<AppState> {
    Router::new().nest("/conversations", conversations::router())
}
