use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::AUTHORIZATION;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::channel::{NativeNotification, NativePushChannel, PushData};
use crate::error::PushError;

const EXPO_PUSH_URL: &str = "https://exp.host/--/api/v2/push/send";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Native push through the Expo push service.
pub struct ExpoPushChannel {
    client: reqwest::Client,
    endpoint: String,
    access_token: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ExpoMessage<'a> {
    to: &'a str,
    title: &'a str,
    body: &'a str,
    data: &'a PushData,
    sound: &'static str,
    priority: &'static str,
    channel_id: &'static str,
}

#[derive(Deserialize)]
struct ExpoResponse {
    #[serde(default)]
    data: Vec<ExpoTicket>,
}

#[derive(Deserialize)]
struct ExpoTicket {
    status: String,
    message: Option<String>,
    details: Option<serde_json::Value>,
}

impl ExpoPushChannel {
    pub fn new(access_token: Option<String>) -> Result<Self, PushError> {
        Self::with_endpoint(EXPO_PUSH_URL, access_token)
    }

    /// Point at a different push gateway (self-hosted relay, test server).
    pub fn with_endpoint(endpoint: impl Into<String>, access_token: Option<String>) -> Result<Self, PushError> {
        let client = reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
            access_token,
        })
    }
}

#[async_trait]
impl NativePushChannel for ExpoPushChannel {
    async fn send(&self, notification: &NativeNotification) -> Result<(), PushError> {
        let body = [ExpoMessage {
            to: &notification.token,
            title: &notification.title,
            body: &notification.body,
            data: &notification.data,
            sound: "default",
            priority: "high",
            channel_id: "chat",
        }];

        let mut request = self
            .client
            .post(&self.endpoint)
            .json(&body);
        if let Some(token) = &self.access_token {
            request = request.header(AUTHORIZATION, format!("Bearer {}", token));
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(PushError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        // Expo answers 200 with per-message tickets; an error ticket is still a failed send.
        let parsed: ExpoResponse = response.json().await?;
        if let Some(ticket) = parsed.data.into_iter().find(|t| t.status == "error") {
            let reason = ticket
                .details
                .as_ref()
                .and_then(|d| d.get("error"))
                .and_then(|e| e.as_str())
                .unwrap_or("unknown")
                .to_string();
            warn!(
                "Expo rejected push for message {}: {} ({})",
                notification.data.message_id,
                ticket.message.unwrap_or_default(),
                reason
            );
            return Err(PushError::Rejected {
                status: status.as_u16(),
                body: reason,
            });
        }

        Ok(())
    }
}
