use std::sync::Arc;

use chrono::Utc;
use futures_util::future::join_all;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};
use uuid::Uuid;

use dietchat_db::Database;
use dietchat_types::models::{ConversationKey, Message, Role};

use crate::channel::{
    DeliveryStatus, NativeNotification, NativePushChannel, PushData, WebNotification,
    WebPushChannel, WebTarget,
};
use crate::error::PushError;

const NATIVE_BODY_CHARS: usize = 100;
const WEB_BODY_CHARS: usize = 120;
const PUSH_KIND: &str = "chat_message";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// The conversation has no linked user on the other side.
    NoRecipient,
    /// The recipient is viewing the conversation right now.
    RecipientActive,
}

/// What one dispatch did. Logged, and inspected by tests.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub recipient: Option<Uuid>,
    pub skipped: Option<SkipReason>,
    pub native_attempted: bool,
    pub native_delivered: bool,
    pub web_attempted: usize,
    pub web_delivered: usize,
    pub web_pruned: usize,
}

#[derive(Clone)]
pub struct NotificationDispatcher {
    inner: Arc<DispatcherInner>,
}

struct DispatcherInner {
    db: Arc<Database>,
    native: Arc<dyn NativePushChannel>,
    web: Arc<dyn WebPushChannel>,
    /// Base URL of the web app, used for deep links
    app_url: String,
}

impl NotificationDispatcher {
    pub fn new(
        db: Arc<Database>,
        native: Arc<dyn NativePushChannel>,
        web: Arc<dyn WebPushChannel>,
        app_url: impl Into<String>,
    ) -> Self {
        Self {
            inner: Arc::new(DispatcherInner {
                db,
                native,
                web,
                app_url: app_url.into().trim_end_matches('/').to_string(),
            }),
        }
    }

    pub fn web_public_key(&self) -> Option<&str> {
        self.inner.web.public_key()
    }

    /// Fire-and-forget entry point used after a send commits.
    pub fn spawn_new_message(&self, message: Message) {
        let dispatcher = self.clone();
        tokio::spawn(async move {
            let report = dispatcher.dispatch_new_message(&message).await;
            debug!("Dispatch for message {}: {:?}", message.id, report);
        });
    }

    /// Run the whole pipeline for one committed message. Never fails; every
    /// error is logged and folded into the report.
    pub async fn dispatch_new_message(&self, message: &Message) -> DispatchReport {
        let mut report = DispatchReport::default();
        let key = message.key();

        let Some(recipient) = self.resolve_recipient(&key, message.sender_id).await else {
            report.skipped = Some(SkipReason::NoRecipient);
            return report;
        };
        report.recipient = Some(recipient);

        if self.recipient_is_viewing(recipient, &key).await {
            debug!("Recipient {} is viewing {}, suppressing push", recipient, key);
            report.skipped = Some(SkipReason::RecipientActive);
            return report;
        }

        let data = PushData {
            kind: PUSH_KIND,
            message_id: message.id,
            client_id: key.client_id,
            diet_id: key.diet_id,
        };

        let (native, web) = tokio::join!(
            self.send_native(recipient, message, data.clone()),
            self.send_web(recipient, message, data),
        );

        report.native_attempted = native.is_some();
        report.native_delivered = native.unwrap_or(false);
        report.web_attempted = web.attempted;
        report.web_delivered = web.delivered;
        report.web_pruned = web.pruned;

        info!(
            "Message {} -> {}: native={:?} web={}/{} pruned={}",
            message.id, recipient, native, web.delivered, web.attempted, web.pruned
        );
        report
    }

    async fn resolve_recipient(&self, key: &ConversationKey, sender_id: Uuid) -> Option<Uuid> {
        let db = self.inner.db.clone();
        let key = *key;
        let participants = match tokio::task::spawn_blocking(move || db.participants(&key)).await {
            Ok(Ok(participants)) => participants,
            Ok(Err(e)) => {
                warn!("Recipient lookup for {} failed: {}", key, e);
                return None;
            }
            Err(e) => {
                warn!("spawn_blocking join error: {}", e);
                return None;
            }
        };

        let recipient = participants.and_then(|p| p.other_party(sender_id));
        if recipient.is_none() {
            debug!("No linked recipient for {} (sender {})", key, sender_id);
        }
        recipient
    }

    /// Presence lookup errors read as "not viewing" so the push still goes out.
    async fn recipient_is_viewing(&self, recipient: Uuid, key: &ConversationKey) -> bool {
        let db = self.inner.db.clone();
        let (user, client, diet) = (
            recipient.to_string(),
            key.client_id.to_string(),
            key.diet_id.to_string(),
        );
        match tokio::task::spawn_blocking(move || db.is_presence_active(&user, &client, &diet, Utc::now()))
            .await
        {
            Ok(Ok(active)) => active,
            Ok(Err(e)) => {
                warn!("Presence lookup for {} failed, treating as inactive: {}", recipient, e);
                false
            }
            Err(e) => {
                warn!("spawn_blocking join error: {}", e);
                false
            }
        }
    }

    /// `None` when the recipient has no device token; otherwise whether the send succeeded.
    async fn send_native(&self, recipient: Uuid, message: &Message, data: PushData) -> Option<bool> {
        let db = self.inner.db.clone();
        let user = recipient.to_string();
        let token = match tokio::task::spawn_blocking(move || db.get_device_token(&user)).await {
            Ok(Ok(token)) => token?,
            Ok(Err(e)) => {
                warn!("Device token lookup for {} failed: {}", recipient, e);
                return None;
            }
            Err(e) => {
                warn!("spawn_blocking join error: {}", e);
                return None;
            }
        };

        let notification = NativeNotification {
            token,
            title: message.sender_name.clone(),
            body: notification_body(message, NATIVE_BODY_CHARS),
            data,
        };

        match self.inner.native.send(&notification).await {
            Ok(()) => Some(true),
            Err(e) => {
                log_push_error("native", recipient, &e);
                Some(false)
            }
        }
    }

    async fn send_web(&self, recipient: Uuid, message: &Message, data: PushData) -> WebFanout {
        let db = self.inner.db.clone();
        let user = recipient.to_string();
        let rows = match tokio::task::spawn_blocking(move || db.get_web_subscriptions(&user)).await {
            Ok(Ok(rows)) => rows,
            Ok(Err(e)) => {
                warn!("Web subscription lookup for {} failed: {}", recipient, e);
                return WebFanout::default();
            }
            Err(e) => {
                warn!("spawn_blocking join error: {}", e);
                return WebFanout::default();
            }
        };

        let notification = WebNotification {
            title: message.sender_name.clone(),
            body: notification_body(message, WEB_BODY_CHARS),
            url: self.deep_link(&message.key(), message.sender_role),
            data,
        };

        // Each endpoint is sent and judged on its own; one failure never stops the rest.
        let sends = rows.into_iter().map(|row| {
            let target = WebTarget {
                endpoint: row.endpoint,
                p256dh: row.p256dh,
                auth: row.auth,
            };
            let notification = &notification;
            async move {
                let result = self.inner.web.send(&target, notification).await;
                let pruned = self.after_web_send(recipient, &target.endpoint, &result).await;
                (matches!(result, Ok(DeliveryStatus::Delivered)), pruned)
            }
        });
        let results = join_all(sends).await;

        WebFanout {
            attempted: results.len(),
            delivered: results.iter().filter(|(delivered, _)| *delivered).count(),
            pruned: results.iter().filter(|(_, pruned)| *pruned).count(),
        }
    }

    /// Post-send hook: judges only the delivery status. Returns true if the
    /// subscription was removed.
    async fn after_web_send(
        &self,
        recipient: Uuid,
        endpoint: &str,
        result: &Result<DeliveryStatus, PushError>,
    ) -> bool {
        match result {
            Ok(DeliveryStatus::Delivered) => false,
            Ok(DeliveryStatus::Gone(status)) => {
                info!(
                    "Web push endpoint {} for {} is gone ({}), removing subscription",
                    endpoint_fingerprint(endpoint),
                    recipient,
                    status
                );
                self.prune_dead_subscription(endpoint).await
            }
            Ok(DeliveryStatus::Failed(status)) => {
                warn!(
                    "Web push to {} for {} failed with status {}",
                    endpoint_fingerprint(endpoint),
                    recipient,
                    status
                );
                false
            }
            Err(e) => {
                log_push_error("web", recipient, e);
                false
            }
        }
    }

    async fn prune_dead_subscription(&self, endpoint: &str) -> bool {
        let db = self.inner.db.clone();
        let endpoint = endpoint.to_string();
        match tokio::task::spawn_blocking(move || db.delete_web_subscription(&endpoint)).await {
            Ok(Ok(deleted)) => deleted,
            Ok(Err(e)) => {
                warn!("Failed to delete dead web subscription: {}", e);
                false
            }
            Err(e) => {
                warn!("spawn_blocking join error: {}", e);
                false
            }
        }
    }

    /// Where a tap on the notification lands, depending on who receives it.
    fn deep_link(&self, key: &ConversationKey, sender_role: Role) -> String {
        match sender_role {
            Role::Client => format!(
                "{}/dietitian/clients/{}/diets/{}/chat",
                self.inner.app_url, key.client_id, key.diet_id
            ),
            Role::Dietitian => format!("{}/client/diets/{}/chat", self.inner.app_url, key.diet_id),
        }
    }
}

#[derive(Debug, Default)]
struct WebFanout {
    attempted: usize,
    delivered: usize,
    pruned: usize,
}

fn log_push_error(channel: &str, recipient: Uuid, e: &PushError) {
    match e {
        PushError::NotConfigured(_) => debug!("{} push skipped for {}: {}", channel, recipient, e),
        _ => warn!("{} push to {} failed: {}", channel, recipient, e),
    }
}

fn notification_body(message: &Message, max_chars: usize) -> String {
    if message.photos.is_empty() {
        truncate_chars(&message.content, max_chars)
    } else {
        truncate_chars(&format!("📷 {}", message.content), max_chars)
    }
}

/// Cut to at most `max_chars` characters, ending in an ellipsis when shortened.
pub(crate) fn truncate_chars(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut out: String = text.chars().take(max_chars.saturating_sub(1)).collect();
    out.push('…');
    out
}

/// Endpoints are bearer capabilities, so logs only carry a short digest.
pub(crate) fn endpoint_fingerprint(endpoint: &str) -> String {
    let digest = Sha256::digest(endpoint.as_bytes());
    hex::encode(&digest[..6])
}
