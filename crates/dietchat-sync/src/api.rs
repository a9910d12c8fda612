use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Method, RequestBuilder, Response};
use serde::Deserialize;

use dietchat_types::api::{
    FetchMessagesResponse, MarkReadRequest, MarkReadResponse, MessageEnvelope, PresenceRequest,
    SendMessageRequest,
};
use dietchat_types::models::{ConversationKey, Message};

use crate::error::SyncError;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

/// A page from `fetch_since`. `unread_count` is only present on the full load.
#[derive(Debug, Clone, Default)]
pub struct FetchPage {
    pub messages: Vec<Message>,
    pub unread_count: Option<u64>,
}

/// The conversation HTTP API as the sync client uses it.
#[async_trait]
pub trait ConversationApi: Send + Sync {
    async fn fetch_since(&self, key: ConversationKey, cursor: Option<i64>) -> Result<FetchPage, SyncError>;

    async fn fetch_one(&self, key: ConversationKey, id: i64) -> Result<Message, SyncError>;

    async fn send(&self, key: ConversationKey, req: &SendMessageRequest) -> Result<Message, SyncError>;

    /// Returns how many messages the server actually flipped.
    async fn mark_read(&self, key: ConversationKey, ids: &[i64]) -> Result<u64, SyncError>;

    async fn heartbeat(&self, key: ConversationKey, is_active: bool, source: &str) -> Result<(), SyncError>;
}

/// `ConversationApi` over the service's REST endpoints.
pub struct HttpConversationApi {
    client: reqwest::Client,
    base_url: String,
    token: String,
}

#[derive(Deserialize)]
struct ErrorBody {
    error: Option<String>,
}

impl HttpConversationApi {
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Result<Self, SyncError> {
        let client = reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
        })
    }

    fn messages_url(&self, key: &ConversationKey) -> String {
        format!(
            "{}/conversations/{}/{}/messages",
            self.base_url, key.client_id, key.diet_id
        )
    }

    fn request(&self, method: Method, url: &str) -> RequestBuilder {
        self.client.request(method, url).bearer_auth(&self.token)
    }
}

/// Turn a non-success response into `SyncError::Http` carrying the server's message.
async fn check(response: Response) -> Result<Response, SyncError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let text = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<ErrorBody>(&text)
        .ok()
        .and_then(|b| b.error)
        .unwrap_or(text);
    Err(SyncError::Http {
        status: status.as_u16(),
        message,
    })
}

#[async_trait]
impl ConversationApi for HttpConversationApi {
    async fn fetch_since(&self, key: ConversationKey, cursor: Option<i64>) -> Result<FetchPage, SyncError> {
        let mut request = self.request(Method::GET, &self.messages_url(&key));
        if let Some(cursor) = cursor {
            request = request.query(&[("afterId", cursor)]);
        }
        let body: FetchMessagesResponse = check(request.send().await?).await?.json().await?;
        Ok(FetchPage {
            messages: body.messages,
            unread_count: body.unread_count,
        })
    }

    async fn fetch_one(&self, key: ConversationKey, id: i64) -> Result<Message, SyncError> {
        let request = self
            .request(Method::GET, &self.messages_url(&key))
            .query(&[("messageId", id)]);
        let body: MessageEnvelope = check(request.send().await?).await?.json().await?;
        Ok(body.message)
    }

    async fn send(&self, key: ConversationKey, req: &SendMessageRequest) -> Result<Message, SyncError> {
        let request = self.request(Method::POST, &self.messages_url(&key)).json(req);
        let body: MessageEnvelope = check(request.send().await?).await?.json().await?;
        Ok(body.message)
    }

    async fn mark_read(&self, key: ConversationKey, ids: &[i64]) -> Result<u64, SyncError> {
        let url = format!("{}/read", self.messages_url(&key));
        let request = self.request(Method::PATCH, &url).json(&MarkReadRequest {
            message_ids: ids.to_vec(),
        });
        let body: MarkReadResponse = check(request.send().await?).await?.json().await?;
        Ok(body.marked_count)
    }

    async fn heartbeat(&self, key: ConversationKey, is_active: bool, source: &str) -> Result<(), SyncError> {
        let url = format!("{}/presence", self.base_url);
        let body = PresenceRequest {
            conversation_key: key,
            is_active,
            source: source.to_string(),
        };
        let request = self.request(Method::POST, &url).json(&body);
        check(request.send().await?).await?;
        Ok(())
    }
}
