//! API response types.
//!
//! Success bodies wrap their payload in a `{"data": ...}` envelope. Error
//! bodies are produced by [`chatwire_common::AppError`] as
//! `{"error": {"code", "message"}}` with the matching status code, so
//! handlers return `AppResult<ApiResponse<T>>` and never build error
//! JSON by hand.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;

/// Success envelope for API responses.
#[derive(Debug, Serialize)]
pub struct ApiResponse<T: Serialize> {
    pub data: T,
}

impl<T: Serialize> ApiResponse<T> {
    /// Wrap a success payload.
    pub const fn ok(data: T) -> Self {
        Self { data }
    }
}

impl<T: Serialize> IntoResponse for ApiResponse<T> {
    fn into_response(self) -> Response {
        (StatusCode::OK, Json(self)).into_response()
    }
}

/// Empty success response.
#[must_use]
pub fn no_content() -> impl IntoResponse {
    StatusCode::NO_CONTENT
}
