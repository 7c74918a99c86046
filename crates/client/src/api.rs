//! REST client for the conversation API.

use std::sync::Arc;

use async_trait::async_trait;
use chatwire_common::error::{AppError, AppResult};
use chatwire_common::events::{
    AttachmentPayload, ConversationKind, ConversationPayload, CreateConversationRequest,
    MarkReadRequest, MarkReadResponse, MessagePayload, SendMessageRequest,
};
use serde::Deserialize;
use serde::de::DeserializeOwned;

/// Persistence operations the sync engine performs against the server.
///
/// The store only talks to the server through this trait, so tests can swap
/// in an in-memory double.
#[async_trait]
pub trait ConversationApi: Send + Sync {
    /// Fetch all conversations the user participates in.
    async fn list_conversations(&self) -> AppResult<Vec<ConversationPayload>>;

    /// Look up or create the direct conversation with another user.
    async fn get_or_create_direct(&self, partner_id: &str) -> AppResult<ConversationPayload>;

    /// Create a group or support conversation.
    async fn create_conversation(
        &self,
        kind: ConversationKind,
        participant_ids: Vec<String>,
    ) -> AppResult<ConversationPayload>;

    /// Fetch the message log of a conversation.
    async fn messages(&self, conversation_id: &str) -> AppResult<Vec<MessagePayload>>;

    /// Persist a message and return the confirmed copy.
    async fn send_message(
        &self,
        conversation_id: &str,
        request: &SendMessageRequest,
    ) -> AppResult<MessagePayload>;

    /// Flip read receipts for the given messages.
    ///
    /// Returns the number of receipts that actually changed.
    async fn mark_read(&self, conversation_id: &str, message_ids: &[String]) -> AppResult<u64>;

    /// Upload a file and return its attachment descriptor.
    async fn upload_attachment(
        &self,
        conversation_id: &str,
        file_name: &str,
        mime_type: &str,
        bytes: Vec<u8>,
    ) -> AppResult<AttachmentPayload>;
}

/// Shared handle to a [`ConversationApi`] implementation.
pub type ConversationApiService = Arc<dyn ConversationApi>;

/// Successful response envelope used by the server.
#[derive(Debug, Deserialize)]
struct Envelope<T> {
    data: T,
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    code: String,
    message: String,
}

/// [`ConversationApi`] implementation backed by `reqwest`.
#[derive(Debug, Clone)]
pub struct HttpConversationApi {
    http: reqwest::Client,
    base_url: String,
    token: String,
}

impl HttpConversationApi {
    /// Create a client for the given server, authenticating with `token`.
    #[must_use]
    pub fn new(server_url: &str, token: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: server_url.trim_end_matches('/').to_string(),
            token: token.into(),
        }
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/api{path}", self.base_url)
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> AppResult<T> {
        let response = self
            .http
            .get(self.endpoint(path))
            .bearer_auth(&self.token)
            .send()
            .await?;
        Self::decode(response).await
    }

    async fn post<B, T>(&self, path: &str, body: &B) -> AppResult<T>
    where
        B: serde::Serialize + Sync,
        T: DeserializeOwned,
    {
        let response = self
            .http
            .post(self.endpoint(path))
            .bearer_auth(&self.token)
            .json(body)
            .send()
            .await?;
        Self::decode(response).await
    }

    async fn decode<T: DeserializeOwned>(response: reqwest::Response) -> AppResult<T> {
        let status = response.status();
        if status.is_success() {
            let envelope: Envelope<T> = response.json().await?;
            return Ok(envelope.data);
        }

        let body = response
            .json::<ErrorEnvelope>()
            .await
            .map_or_else(
                |_| ErrorBody {
                    code: "HTTP_ERROR".to_string(),
                    message: status.to_string(),
                },
                |envelope| envelope.error,
            );

        Err(match body.code.as_str() {
            "TOKEN_EXPIRED" => AppError::TokenExpired,
            "UNAUTHORIZED" => AppError::Unauthorized,
            _ => AppError::Http(format!("{}: {}", body.code, body.message)),
        })
    }
}

#[async_trait]
impl ConversationApi for HttpConversationApi {
    async fn list_conversations(&self) -> AppResult<Vec<ConversationPayload>> {
        self.get("/conversations").await
    }

    async fn get_or_create_direct(&self, partner_id: &str) -> AppResult<ConversationPayload> {
        let request = CreateConversationRequest {
            participant_id: Some(partner_id.to_string()),
            ..CreateConversationRequest::default()
        };
        self.post("/conversations", &request).await
    }

    async fn create_conversation(
        &self,
        kind: ConversationKind,
        participant_ids: Vec<String>,
    ) -> AppResult<ConversationPayload> {
        let request = CreateConversationRequest {
            participant_id: None,
            kind: Some(kind),
            participant_ids,
        };
        self.post("/conversations", &request).await
    }

    async fn messages(&self, conversation_id: &str) -> AppResult<Vec<MessagePayload>> {
        self.get(&format!("/conversations/{conversation_id}/messages"))
            .await
    }

    async fn send_message(
        &self,
        conversation_id: &str,
        request: &SendMessageRequest,
    ) -> AppResult<MessagePayload> {
        self.post(&format!("/conversations/{conversation_id}/messages"), request)
            .await
    }

    async fn mark_read(&self, conversation_id: &str, message_ids: &[String]) -> AppResult<u64> {
        let request = MarkReadRequest {
            message_ids: message_ids.to_vec(),
        };
        let response: MarkReadResponse = self
            .post(&format!("/conversations/{conversation_id}/read"), &request)
            .await?;
        Ok(response.read_count)
    }

    async fn upload_attachment(
        &self,
        conversation_id: &str,
        file_name: &str,
        mime_type: &str,
        bytes: Vec<u8>,
    ) -> AppResult<AttachmentPayload> {
        let part = reqwest::multipart::Part::bytes(bytes)
            .file_name(file_name.to_string())
            .mime_str(mime_type)?;
        let form = reqwest::multipart::Form::new().part("file", part);

        let response = self
            .http
            .post(self.endpoint(&format!("/conversations/{conversation_id}/attachments")))
            .bearer_auth(&self.token)
            .multipart(form)
            .send()
            .await?;
        Self::decode(response).await
    }
}
