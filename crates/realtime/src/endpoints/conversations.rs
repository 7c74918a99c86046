//! Conversation and message endpoints.
//!
//! The realtime push path never persists anything; every durable write in
//! the system enters through these handlers.

use axum::{
    Json, Router,
    extract::{Path, State},
    routing::{get, patch, post},
};
use chatwire_common::AppResult;
use chatwire_common::events::{
    ConversationKind, ConversationPayload, CreateConversationRequest, MarkReadRequest,
    MarkReadResponse, MessagePayload, SendMessageRequest,
};
use chatwire_core::{CreateConversationInput, SendMessageInput};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::info;

use crate::endpoints::attachments;
use crate::extractors::AuthUser;
use crate::middleware::AppState;
use crate::response::{ApiResponse, no_content};

/// Create the conversations router.
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(list_conversations).post(create_conversation))
        .route("/{conversation_id}", get(get_conversation))
        .route(
            "/{conversation_id}/messages",
            get(list_messages).post(send_message),
        )
        .route(
            "/{conversation_id}/messages/{message_id}",
            patch(edit_message).delete(delete_message),
        )
        .route("/{conversation_id}/read", post(mark_as_read))
        .route(
            "/{conversation_id}/attachments",
            post(attachments::upload_attachment),
        )
        .route("/{conversation_id}/archive", post(set_archived))
        .route("/{conversation_id}/pin", post(set_pinned))
        .route("/{conversation_id}/mute", post(mute).delete(unmute))
        .route("/{conversation_id}/block", post(block).delete(unblock))
        .route("/{conversation_id}/leave", post(leave))
}

/// List conversations for the authenticated user, most recent first.
async fn list_conversations(
    AuthUser(user): AuthUser,
    State(state): State<AppState>,
) -> AppResult<ApiResponse<Vec<ConversationPayload>>> {
    let conversations = state
        .conversation_service
        .conversations_for_user(&user.user_id)
        .await?;

    Ok(ApiResponse::ok(
        conversations
            .iter()
            .map(chatwire_store::entities::conversation::Model::to_payload)
            .collect(),
    ))
}

/// Create a conversation.
///
/// Without a `kind` this looks up or creates the direct conversation with
/// `participantId`; with a group or support `kind` it creates a fresh
/// conversation around `participantIds`.
async fn create_conversation(
    AuthUser(user): AuthUser,
    State(state): State<AppState>,
    Json(req): Json<CreateConversationRequest>,
) -> AppResult<ApiResponse<ConversationPayload>> {
    let conversation = match req.kind {
        None | Some(ConversationKind::Direct) => {
            let partner_id = req.participant_id.ok_or_else(|| {
                chatwire_common::AppError::BadRequest(
                    "participantId is required for direct conversations".to_string(),
                )
            })?;

            info!(user = %user.user_id, partner = %partner_id, "Opening direct conversation");

            let (conversation, _created) = state
                .conversation_service
                .get_or_create_direct(&user.user_id, &partner_id)
                .await?;
            conversation
        }
        Some(kind) => {
            info!(user = %user.user_id, participants = req.participant_ids.len(), "Creating conversation");

            state
                .conversation_service
                .create_conversation(
                    &user.user_id,
                    CreateConversationInput {
                        kind,
                        participant_ids: req.participant_ids,
                    },
                )
                .await?
        }
    };

    Ok(ApiResponse::ok(conversation.to_payload()))
}

/// Fetch a single conversation.
async fn get_conversation(
    AuthUser(user): AuthUser,
    State(state): State<AppState>,
    Path(conversation_id): Path<String>,
) -> AppResult<ApiResponse<ConversationPayload>> {
    let conversation = state
        .conversation_service
        .conversation_for_user(&user.user_id, &conversation_id)
        .await?;

    Ok(ApiResponse::ok(conversation.to_payload()))
}

/// Fetch the ordered message log of a conversation.
async fn list_messages(
    AuthUser(user): AuthUser,
    State(state): State<AppState>,
    Path(conversation_id): Path<String>,
) -> AppResult<ApiResponse<Vec<MessagePayload>>> {
    let messages = state
        .conversation_service
        .messages(&user.user_id, &conversation_id)
        .await?;

    Ok(ApiResponse::ok(
        messages
            .iter()
            .map(chatwire_store::entities::message::Model::to_payload)
            .collect(),
    ))
}

/// Send a message into a conversation.
async fn send_message(
    AuthUser(user): AuthUser,
    State(state): State<AppState>,
    Path(conversation_id): Path<String>,
    Json(req): Json<SendMessageRequest>,
) -> AppResult<ApiResponse<MessagePayload>> {
    info!(
        sender = %user.user_id,
        conversation = %conversation_id,
        "Sending message"
    );

    let input = SendMessageInput {
        content: req.content,
        kind: req.kind,
        attachments: req.attachments,
        reply_to: req.reply_to,
    };

    let message = state
        .conversation_service
        .send_message(&user.user_id, &conversation_id, input)
        .await?;

    Ok(ApiResponse::ok(message.to_payload()))
}

/// Edit message request.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EditMessageRequest {
    content: String,
}

/// Replace the text of a message the user previously sent.
async fn edit_message(
    AuthUser(user): AuthUser,
    State(state): State<AppState>,
    Path((conversation_id, message_id)): Path<(String, String)>,
    Json(req): Json<EditMessageRequest>,
) -> AppResult<ApiResponse<MessagePayload>> {
    info!(
        user = %user.user_id,
        conversation = %conversation_id,
        message = %message_id,
        "Editing message"
    );

    let message = state
        .conversation_service
        .edit_message(&user.user_id, &conversation_id, &message_id, &req.content)
        .await?;

    Ok(ApiResponse::ok(message.to_payload()))
}

/// Soft delete a message the user previously sent.
async fn delete_message(
    AuthUser(user): AuthUser,
    State(state): State<AppState>,
    Path((conversation_id, message_id)): Path<(String, String)>,
) -> AppResult<impl axum::response::IntoResponse> {
    info!(
        user = %user.user_id,
        conversation = %conversation_id,
        message = %message_id,
        "Deleting message"
    );

    state
        .conversation_service
        .delete_message(&user.user_id, &conversation_id, &message_id)
        .await?;

    Ok(no_content())
}

/// Flip read receipts for the listed messages.
async fn mark_as_read(
    AuthUser(user): AuthUser,
    State(state): State<AppState>,
    Path(conversation_id): Path<String>,
    Json(req): Json<MarkReadRequest>,
) -> AppResult<ApiResponse<MarkReadResponse>> {
    let read_count = state
        .conversation_service
        .mark_read(&user.user_id, &conversation_id, &req.message_ids)
        .await?;

    Ok(ApiResponse::ok(MarkReadResponse { read_count }))
}

/// Archive request.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ArchiveRequest {
    archived: bool,
}

/// Archive or unarchive the conversation for the caller.
async fn set_archived(
    AuthUser(user): AuthUser,
    State(state): State<AppState>,
    Path(conversation_id): Path<String>,
    Json(req): Json<ArchiveRequest>,
) -> AppResult<ApiResponse<ConversationPayload>> {
    let conversation = state
        .conversation_service
        .set_archived(&user.user_id, &conversation_id, req.archived)
        .await?;

    Ok(ApiResponse::ok(conversation.to_payload()))
}

/// Pin request.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PinRequest {
    pinned: bool,
}

/// Pin or unpin the conversation for the caller.
async fn set_pinned(
    AuthUser(user): AuthUser,
    State(state): State<AppState>,
    Path(conversation_id): Path<String>,
    Json(req): Json<PinRequest>,
) -> AppResult<ApiResponse<ConversationPayload>> {
    let conversation = state
        .conversation_service
        .set_pinned(&user.user_id, &conversation_id, req.pinned)
        .await?;

    Ok(ApiResponse::ok(conversation.to_payload()))
}

/// Mute request.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MuteRequest {
    /// Mute deadline; omitted means muted until unmuted.
    #[serde(default)]
    until: Option<DateTime<Utc>>,
}

/// Mute notifications from the conversation for the caller.
async fn mute(
    AuthUser(user): AuthUser,
    State(state): State<AppState>,
    Path(conversation_id): Path<String>,
    Json(req): Json<MuteRequest>,
) -> AppResult<ApiResponse<ConversationPayload>> {
    let conversation = state
        .conversation_service
        .mute(&user.user_id, &conversation_id, req.until)
        .await?;

    Ok(ApiResponse::ok(conversation.to_payload()))
}

/// Clear the caller's mute.
async fn unmute(
    AuthUser(user): AuthUser,
    State(state): State<AppState>,
    Path(conversation_id): Path<String>,
) -> AppResult<ApiResponse<ConversationPayload>> {
    let conversation = state
        .conversation_service
        .unmute(&user.user_id, &conversation_id)
        .await?;

    Ok(ApiResponse::ok(conversation.to_payload()))
}

/// Block the conversation.
async fn block(
    AuthUser(user): AuthUser,
    State(state): State<AppState>,
    Path(conversation_id): Path<String>,
) -> AppResult<ApiResponse<ConversationPayload>> {
    info!(user = %user.user_id, conversation = %conversation_id, "Blocking conversation");

    let conversation = state
        .conversation_service
        .block(&user.user_id, &conversation_id)
        .await?;

    Ok(ApiResponse::ok(conversation.to_payload()))
}

/// Clear the block. Only the blocking user may do this.
async fn unblock(
    AuthUser(user): AuthUser,
    State(state): State<AppState>,
    Path(conversation_id): Path<String>,
) -> AppResult<ApiResponse<ConversationPayload>> {
    info!(user = %user.user_id, conversation = %conversation_id, "Unblocking conversation");

    let conversation = state
        .conversation_service
        .unblock(&user.user_id, &conversation_id)
        .await?;

    Ok(ApiResponse::ok(conversation.to_payload()))
}

/// Leave a group or support conversation.
async fn leave(
    AuthUser(user): AuthUser,
    State(state): State<AppState>,
    Path(conversation_id): Path<String>,
) -> AppResult<impl axum::response::IntoResponse> {
    info!(user = %user.user_id, conversation = %conversation_id, "Leaving conversation");

    state
        .conversation_service
        .leave(&user.user_id, &conversation_id)
        .await?;

    Ok(no_content())
}
