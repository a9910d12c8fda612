use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{CONTENT_ENCODING, CONTENT_TYPE};
use web_push::{ContentEncoding, SubscriptionInfo, VapidSignatureBuilder, WebPushMessageBuilder};

use crate::channel::{DeliveryStatus, WebNotification, WebPushChannel, WebTarget};
use crate::error::PushError;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Seconds a push service may hold an undelivered notification.
const PUSH_TTL: u32 = 60 * 60 * 24;

/// Web push with VAPID authentication and aes128gcm payload encryption.
///
/// The `web-push` crate builds the signed, encrypted message; delivery goes
/// through reqwest so the caller sees the raw HTTP status of every endpoint.
pub struct VapidWebPushChannel {
    client: reqwest::Client,
    private_key_pem: String,
    public_key: String,
    subject: String,
}

impl VapidWebPushChannel {
    pub fn new(
        private_key_pem: impl Into<String>,
        public_key: impl Into<String>,
        subject: impl Into<String>,
    ) -> Result<Self, PushError> {
        let client = reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self {
            client,
            private_key_pem: private_key_pem.into(),
            public_key: public_key.into(),
            subject: subject.into(),
        })
    }
}

#[async_trait]
impl WebPushChannel for VapidWebPushChannel {
    async fn send(
        &self,
        target: &WebTarget,
        notification: &WebNotification,
    ) -> Result<DeliveryStatus, PushError> {
        let payload =
            serde_json::to_vec(notification).map_err(|e| PushError::Encode(e.to_string()))?;

        let subscription = SubscriptionInfo::new(&target.endpoint, &target.p256dh, &target.auth);

        let mut signature = VapidSignatureBuilder::from_pem(self.private_key_pem.as_bytes(), &subscription)?;
        signature.add_claim("sub", self.subject.as_str());

        let mut builder = WebPushMessageBuilder::new(&subscription);
        builder.set_ttl(PUSH_TTL);
        builder.set_payload(ContentEncoding::Aes128Gcm, &payload);
        builder.set_vapid_signature(signature.build()?);
        let message = builder.build()?;

        let mut request = self
            .client
            .post(&target.endpoint)
            .header("TTL", message.ttl.to_string())
            .header("Urgency", "high");

        if let Some(body) = message.payload {
            request = request
                .header(CONTENT_ENCODING, "aes128gcm")
                .header(CONTENT_TYPE, "application/octet-stream");
            // Includes the VAPID Authorization header for aes128gcm.
            for (name, value) in body.crypto_headers {
                request = request.header(name, value);
            }
            request = request.body(body.content);
        }

        let response = request.send().await?;
        Ok(DeliveryStatus::from_status(response.status().as_u16()))
    }

    fn public_key(&self) -> Option<&str> {
        Some(&self.public_key)
    }
}
