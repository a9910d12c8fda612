//! Message Store: the authorization and validation rules around the
//! persisted per-conversation log.
//!
//! Every operation takes the caller explicitly and first checks that they are
//! the client user or the dietitian linked to the conversation. The methods
//! are blocking; handlers run them through [`run_blocking`].

use std::collections::HashMap;
use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as B64;
use chrono::{DateTime, Utc};
use tracing::warn;
use uuid::Uuid;

use dietchat_db::models::{MessageRow, NewMessage, PhotoRow};
use dietchat_db::{Database, parse_ts};
use dietchat_types::api::{Claims, PhotoUpload, SendMessageRequest};
use dietchat_types::models::{ConversationKey, Message, Participants, Photo, Role};

use crate::error::ApiError;

const MAX_CONTENT_CHARS: usize = 5000;
const MAX_PHOTOS: usize = 5;
const MAX_PHOTO_BYTES: usize = 5 * 1024 * 1024;

/// Result of a list fetch. `unread_count` is only computed for the full
/// (non-incremental) fetch.
#[derive(Debug)]
pub struct FetchResult {
    pub messages: Vec<Message>,
    pub unread_count: Option<u64>,
}

#[derive(Clone)]
pub struct MessageStore {
    db: Arc<Database>,
}

impl MessageStore {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// The caller's side of the conversation, or Forbidden/NotFound.
    pub fn authorize(&self, caller: &Claims, key: &ConversationKey) -> Result<(Participants, Role), ApiError> {
        let participants = self
            .db
            .participants(key)?
            .ok_or_else(|| ApiError::NotFound("Conversation not found".into()))?;

        let role = if participants.client_user_id == Some(caller.sub) {
            Role::Client
        } else if participants.dietitian_user_id == Some(caller.sub) {
            Role::Dietitian
        } else {
            return Err(ApiError::Forbidden(
                "You are not a participant of this conversation".into(),
            ));
        };

        Ok((participants, role))
    }

    pub fn append(
        &self,
        caller: &Claims,
        key: &ConversationKey,
        req: &SendMessageRequest,
        now: DateTime<Utc>,
    ) -> Result<Message, ApiError> {
        let (_, role) = self.authorize(caller, key)?;

        let content = req.content.trim();
        if content.is_empty() {
            return Err(ApiError::validation("Message content cannot be empty"));
        }
        if content.chars().count() > MAX_CONTENT_CHARS {
            return Err(ApiError::validation(format!(
                "Message content cannot exceed {} characters",
                MAX_CONTENT_CHARS
            )));
        }

        let uploads = req.photos.as_deref().unwrap_or_default();
        if !uploads.is_empty() && role != Role::Client {
            return Err(ApiError::Forbidden("Only clients can attach photos".into()));
        }
        if uploads.len() > MAX_PHOTOS {
            return Err(ApiError::validation(format!(
                "At most {} photos can be attached",
                MAX_PHOTOS
            )));
        }
        let photos = uploads
            .iter()
            .map(validate_photo)
            .collect::<Result<Vec<_>, _>>()?;

        let meal_tag_id = req
            .meal_tag_id
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty());

        let client_id = key.client_id.to_string();
        let diet_id = key.diet_id.to_string();
        let sender_id = caller.sub.to_string();
        let id = self.db.insert_message(
            &NewMessage {
                client_id: &client_id,
                diet_id: &diet_id,
                sender_id: &sender_id,
                sender_role: role.as_str(),
                content,
                meal_tag_id,
            },
            &photos,
            now,
        )?;

        self.load_one(key, id, now)?
            .ok_or_else(|| ApiError::Internal(anyhow::anyhow!("message {} vanished after insert", id)))
    }

    pub fn fetch_since(
        &self,
        caller: &Claims,
        key: &ConversationKey,
        cursor: Option<i64>,
        now: DateTime<Utc>,
    ) -> Result<FetchResult, ApiError> {
        if cursor.is_some_and(|c| c < 0) {
            return Err(ApiError::validation("afterId must be a non-negative integer"));
        }
        self.authorize(caller, key)?;

        let client_id = key.client_id.to_string();
        let diet_id = key.diet_id.to_string();
        let rows = self.db.get_messages_since(&client_id, &diet_id, cursor)?;
        let messages = self.hydrate(rows, now)?;

        let unread_count = match cursor {
            Some(_) => None,
            None => Some(self.db.count_unread(&client_id, &diet_id, &caller.sub.to_string())?),
        };

        Ok(FetchResult { messages, unread_count })
    }

    pub fn fetch_one(
        &self,
        caller: &Claims,
        key: &ConversationKey,
        id: i64,
        now: DateTime<Utc>,
    ) -> Result<Message, ApiError> {
        if id <= 0 {
            return Err(ApiError::validation("messageId must be a positive integer"));
        }
        self.authorize(caller, key)?;
        self.load_one(key, id, now)?
            .ok_or_else(|| ApiError::NotFound("Message not found".into()))
    }

    /// Returns the ids that actually changed. Calling again with the same ids
    /// returns an empty list.
    pub fn mark_read(
        &self,
        caller: &Claims,
        key: &ConversationKey,
        ids: &[i64],
        now: DateTime<Utc>,
    ) -> Result<Vec<i64>, ApiError> {
        if ids.is_empty() {
            return Err(ApiError::validation("messageIds must be a non-empty array"));
        }
        if ids.iter().any(|id| *id <= 0) {
            return Err(ApiError::validation("messageIds must be positive integers"));
        }
        self.authorize(caller, key)?;

        let updated = self.db.mark_read(
            &key.client_id.to_string(),
            &key.diet_id.to_string(),
            &caller.sub.to_string(),
            ids,
            now,
        )?;
        Ok(updated)
    }

    fn load_one(&self, key: &ConversationKey, id: i64, now: DateTime<Utc>) -> Result<Option<Message>, ApiError> {
        let row = self
            .db
            .get_message(&key.client_id.to_string(), &key.diet_id.to_string(), id)?;
        Ok(self.hydrate(row.into_iter().collect(), now)?.pop())
    }

    /// Convert rows to API messages and attach photos that are still live.
    fn hydrate(&self, rows: Vec<MessageRow>, now: DateTime<Utc>) -> Result<Vec<Message>, ApiError> {
        let ids: Vec<i64> = rows.iter().map(|r| r.id).collect();
        let mut photos_by_message: HashMap<i64, Vec<Photo>> = HashMap::new();
        for photo in self.db.get_live_photos(&ids, now)? {
            photos_by_message
                .entry(photo.message_id)
                .or_default()
                .push(photo_from_row(photo));
        }

        Ok(rows
            .into_iter()
            .map(|row| {
                let photos = photos_by_message.remove(&row.id).unwrap_or_default();
                message_from_row(row, photos)
            })
            .collect())
    }
}

/// Run a blocking store call off the async runtime.
pub async fn run_blocking<F, T>(f: F) -> Result<T, ApiError>
where
    F: FnOnce() -> Result<T, ApiError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f).await?
}

/// Accepts `data:image/...;base64,...` URLs or bare base64.
fn validate_photo(upload: &PhotoUpload) -> Result<String, ApiError> {
    let raw = upload.image_data.trim();
    let encoded = match raw.strip_prefix("data:") {
        Some(rest) => {
            let (mime, data) = rest
                .split_once(";base64,")
                .ok_or_else(|| ApiError::validation("Photo must be a base64 data URL"))?;
            if !mime.starts_with("image/") {
                return Err(ApiError::validation("Only image attachments are allowed"));
            }
            data
        }
        None => raw,
    };

    if encoded.is_empty() {
        return Err(ApiError::validation("Photo data is empty"));
    }
    let bytes = B64
        .decode(encoded)
        .map_err(|_| ApiError::validation("Photo data is not valid base64"))?;
    if bytes.len() > MAX_PHOTO_BYTES {
        return Err(ApiError::validation("Photo is too large"));
    }

    Ok(raw.to_string())
}

fn message_from_row(row: MessageRow, photos: Vec<Photo>) -> Message {
    Message {
        id: row.id,
        client_id: parse_uuid(&row.client_id, "client_id", row.id),
        diet_id: parse_uuid(&row.diet_id, "diet_id", row.id),
        sender_id: parse_uuid(&row.sender_id, "sender_id", row.id),
        sender_role: row.sender_role.parse().unwrap_or_else(|e| {
            warn!("Corrupt sender_role on message {}: {}", row.id, e);
            Role::Client
        }),
        sender_name: row.sender_name,
        content: row.content,
        meal_tag_id: row.meal_tag_id,
        created_at: parse_time(&row.created_at, row.id),
        is_read: row.is_read,
        read_at: row.read_at.as_deref().map(|t| parse_time(t, row.id)),
        photos,
    }
}

fn photo_from_row(row: PhotoRow) -> Photo {
    Photo {
        id: row.id,
        created_at: parse_time(&row.created_at, row.message_id),
        expires_at: parse_time(&row.expires_at, row.message_id),
        image_data: row.image_data,
    }
}

fn parse_uuid(raw: &str, column: &str, message_id: i64) -> Uuid {
    raw.parse().unwrap_or_else(|e| {
        warn!("Corrupt {} '{}' on message {}: {}", column, raw, message_id, e);
        Uuid::default()
    })
}

fn parse_time(raw: &str, message_id: i64) -> DateTime<Utc> {
    parse_ts(raw).unwrap_or_else(|e| {
        warn!("Corrupt timestamp '{}' on message {}: {}", raw, message_id, e);
        DateTime::default()
    })
}
