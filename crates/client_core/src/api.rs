use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::{multipart, Client, RequestBuilder, Response, StatusCode};
use shared::{
    domain::{ConversationId, PartyId},
    error::{ApiError, ErrorCode},
    protocol::{
        ChatMessage, ConversationRecord, CreateConversationRequest, ListMessagesQuery,
        PostMessageRequest, TypingRequest,
    },
};
use tracing::{debug, info};

use crate::auth::AuthTokenProvider;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachmentUpload {
    pub filename: String,
    pub mime_type: Option<String>,
    pub bytes: Vec<u8>,
}

/// REST surface of the conversation service.
#[async_trait]
pub trait ChatApi: Send + Sync {
    async fn create_conversation(&self, participant_id: &PartyId) -> Result<ConversationRecord>;
    /// Page 1 is the newest page; records inside a page are oldest first.
    async fn list_messages(
        &self,
        conversation_id: &ConversationId,
        page: u32,
        page_size: u32,
    ) -> Result<Vec<ChatMessage>>;
    async fn post_message(
        &self,
        conversation_id: &ConversationId,
        text: Option<&str>,
        image_refs: &[String],
    ) -> Result<ChatMessage>;
    async fn post_message_with_files(
        &self,
        conversation_id: &ConversationId,
        text: Option<&str>,
        attachments: &[AttachmentUpload],
    ) -> Result<ChatMessage>;
    async fn send_typing(&self, conversation_id: &ConversationId, is_typing: bool) -> Result<()>;
}

pub struct HttpChatApi {
    http: Client,
    base_url: String,
    auth: Arc<dyn AuthTokenProvider>,
}

impl HttpChatApi {
    pub fn new(base_url: impl Into<String>, auth: Arc<dyn AuthTokenProvider>) -> Self {
        Self {
            http: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            auth,
        }
    }

    fn conversation_url(&self, conversation_id: &ConversationId, suffix: &str) -> String {
        format!(
            "{}/conversations/{}{suffix}",
            self.base_url, conversation_id.0
        )
    }

    /// Sends with the current bearer token; a `401` triggers one token refresh
    /// and one retry.
    async fn send_authorized<F>(&self, build: F) -> Result<Response>
    where
        F: Fn(&Client) -> Result<RequestBuilder> + Send + Sync,
    {
        let token = self.auth.access_token().await?;
        let response = build(&self.http)?.bearer_auth(&token).send().await?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return check_status(response).await;
        }

        info!("chat api: access token rejected, refreshing and retrying once");
        let token = self
            .auth
            .refresh()
            .await
            .context("failed to refresh access token after 401")?;
        let response = build(&self.http)?.bearer_auth(&token).send().await?;
        check_status(response).await
    }
}

async fn check_status(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let url = response.url().to_string();
    let body = response.text().await.unwrap_or_default();
    let api_error = serde_json::from_str::<ApiError>(&body).unwrap_or_else(|_| {
        ApiError::new(ErrorCode::from_status(status.as_u16()), body.clone())
    });
    Err(anyhow!(api_error).context(format!("request to {url} failed with {status}")))
}

#[async_trait]
impl ChatApi for HttpChatApi {
    async fn create_conversation(&self, participant_id: &PartyId) -> Result<ConversationRecord> {
        let url = format!("{}/conversations", self.base_url);
        let body = CreateConversationRequest {
            participant_id: participant_id.clone(),
        };
        let record: ConversationRecord = self
            .send_authorized(|http| Ok(http.post(&url).json(&body)))
            .await?
            .json()
            .await?;
        info!(
            conversation_id = %record.id,
            participant_id = %participant_id,
            "chat api: conversation ready"
        );
        Ok(record)
    }

    async fn list_messages(
        &self,
        conversation_id: &ConversationId,
        page: u32,
        page_size: u32,
    ) -> Result<Vec<ChatMessage>> {
        let url = self.conversation_url(conversation_id, "/messages");
        let query = ListMessagesQuery {
            page: page.max(1),
            page_size: page_size.max(1),
        };
        let messages: Vec<ChatMessage> = self
            .send_authorized(|http| Ok(http.get(&url).query(&query)))
            .await?
            .json()
            .await?;
        debug!(
            conversation_id = %conversation_id,
            page = query.page,
            count = messages.len(),
            "chat api: fetched message page"
        );
        Ok(messages)
    }

    async fn post_message(
        &self,
        conversation_id: &ConversationId,
        text: Option<&str>,
        image_refs: &[String],
    ) -> Result<ChatMessage> {
        let url = self.conversation_url(conversation_id, "/messages");
        let body = PostMessageRequest {
            text: text.map(str::to_string),
            image_refs: image_refs.to_vec(),
        };
        let message = self
            .send_authorized(|http| Ok(http.post(&url).json(&body)))
            .await?
            .json()
            .await?;
        Ok(message)
    }

    async fn post_message_with_files(
        &self,
        conversation_id: &ConversationId,
        text: Option<&str>,
        attachments: &[AttachmentUpload],
    ) -> Result<ChatMessage> {
        let url = self.conversation_url(conversation_id, "/messages/attachments");
        let message = self
            .send_authorized(|http| {
                let mut form = multipart::Form::new();
                if let Some(text) = text {
                    form = form.text("text", text.to_string());
                }
                for attachment in attachments {
                    let part = multipart::Part::bytes(attachment.bytes.clone())
                        .file_name(attachment.filename.clone())
                        .mime_str(
                            attachment
                                .mime_type
                                .as_deref()
                                .unwrap_or("application/octet-stream"),
                        )
                        .with_context(|| {
                            format!("invalid mime type for attachment {}", attachment.filename)
                        })?;
                    form = form.part("files", part);
                }
                Ok(http.post(&url).multipart(form))
            })
            .await?
            .json()
            .await?;
        Ok(message)
    }

    async fn send_typing(&self, conversation_id: &ConversationId, is_typing: bool) -> Result<()> {
        let url = self.conversation_url(conversation_id, "/typing");
        let body = TypingRequest { is_typing };
        self.send_authorized(|http| Ok(http.post(&url).json(&body)))
            .await?;
        Ok(())
    }
}

#[cfg(test)]
#[path = "tests/api_tests.rs"]
mod tests;
