//! Attachment upload endpoint.
//!
//! Storage itself is an external concern. This endpoint accepts the
//! multipart upload, assigns it an id and a URL, and answers with the
//! descriptor the client embeds in its next message send.

use axum::extract::{Multipart, Path, State};
use chatwire_common::events::AttachmentPayload;
use chatwire_common::{AppError, AppResult, IdGenerator};
use tracing::info;

use crate::extractors::AuthUser;
use crate::middleware::AppState;
use crate::response::ApiResponse;

/// Upload an attachment for use in a conversation.
pub async fn upload_attachment(
    AuthUser(user): AuthUser,
    State(state): State<AppState>,
    Path(conversation_id): Path<String>,
    mut multipart: Multipart,
) -> AppResult<ApiResponse<AttachmentPayload>> {
    state
        .conversation_service
        .conversation_for_user(&user.user_id, &conversation_id)
        .await?;

    let mut file_name: Option<String> = None;
    let mut mime_type: Option<String> = None;
    let mut file_size: Option<u64> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| AppError::BadRequest(e.to_string()))?
    {
        let name = field.name().unwrap_or("").to_string();

        match name.as_str() {
            "file" => {
                if file_name.is_none() {
                    file_name = field.file_name().map(std::string::ToString::to_string);
                }
                mime_type = field.content_type().map(std::string::ToString::to_string);
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|e| AppError::BadRequest(e.to_string()))?;
                file_size = Some(bytes.len() as u64);
            }
            "name" => {
                let text = field
                    .text()
                    .await
                    .map_err(|e| AppError::BadRequest(e.to_string()))?;
                if !text.is_empty() {
                    file_name = Some(text);
                }
            }
            _ => {}
        }
    }

    let file_size = file_size
        .ok_or_else(|| AppError::BadRequest("Multipart upload needs a file field".to_string()))?;

    let id = IdGenerator::new().generate();
    let base = state.config.server.url.trim_end_matches('/');
    let descriptor = AttachmentPayload {
        url: format!("{base}/files/{id}"),
        file_name: file_name.unwrap_or_else(|| format!("upload-{id}")),
        file_size,
        mime_type: mime_type.unwrap_or_else(|| "application/octet-stream".to_string()),
        thumbnail_url: None,
        id,
    };

    info!(
        user = %user.user_id,
        conversation = %conversation_id,
        file = %descriptor.file_name,
        size = descriptor.file_size,
        "Attachment accepted"
    );

    Ok(ApiResponse::ok(descriptor))
}
