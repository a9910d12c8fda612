use async_trait::async_trait;
use serde::Serialize;
use tracing::debug;
use uuid::Uuid;

use crate::error::PushError;

/// Structured payload attached to both channels so a tap can route to the thread.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PushData {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub message_id: i64,
    pub client_id: Uuid,
    pub diet_id: Uuid,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NativeNotification {
    pub token: String,
    pub title: String,
    pub body: String,
    pub data: PushData,
}

/// Body of a web push, serialized as JSON and encrypted for the browser.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WebNotification {
    pub title: String,
    pub body: String,
    pub url: String,
    pub data: PushData,
}

/// One browser subscription as stored at opt-in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebTarget {
    pub endpoint: String,
    pub p256dh: String,
    pub auth: String,
}

/// What the push service answered for one web delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryStatus {
    Delivered,
    /// 404/410: the endpoint will never accept deliveries again.
    Gone(u16),
    /// Any other non-success status. Logged, not retried.
    Failed(u16),
}

impl DeliveryStatus {
    pub fn from_status(status: u16) -> Self {
        match status {
            200..=299 => Self::Delivered,
            404 | 410 => Self::Gone(status),
            other => Self::Failed(other),
        }
    }
}

/// Mobile push (one device token per user).
#[async_trait]
pub trait NativePushChannel: Send + Sync {
    async fn send(&self, notification: &NativeNotification) -> Result<(), PushError>;
}

/// Browser push (any number of subscriptions per user).
#[async_trait]
pub trait WebPushChannel: Send + Sync {
    async fn send(
        &self,
        target: &WebTarget,
        notification: &WebNotification,
    ) -> Result<DeliveryStatus, PushError>;

    /// Application server key handed to browsers at opt-in.
    fn public_key(&self) -> Option<&str>;
}

/// Stand-in when no native push credentials are configured.
pub struct NullNativePush;

#[async_trait]
impl NativePushChannel for NullNativePush {
    async fn send(&self, notification: &NativeNotification) -> Result<(), PushError> {
        debug!("Native push disabled, dropping notification for message {}", notification.data.message_id);
        Err(PushError::NotConfigured("native"))
    }
}

/// Stand-in when no VAPID keys are configured.
pub struct NullWebPush;

#[async_trait]
impl WebPushChannel for NullWebPush {
    async fn send(
        &self,
        _target: &WebTarget,
        notification: &WebNotification,
    ) -> Result<DeliveryStatus, PushError> {
        debug!("Web push disabled, dropping notification for message {}", notification.data.message_id);
        Err(PushError::NotConfigured("web"))
    }

    fn public_key(&self) -> Option<&str> {
        None
    }
}
