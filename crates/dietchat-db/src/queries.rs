use crate::models::{
    MessageRow, NewMessage, ParticipantsRow, PhotoRow, WebSubscriptionRow,
};
use crate::{Database, format_ts};
use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use dietchat_types::models::{ConversationKey, Participants};
use rusqlite::Row;
use tracing::warn;
use uuid::Uuid;

/// Photos stop being served this many hours after upload.
pub const PHOTO_TTL_HOURS: i64 = 12;

const PHOTO_QUERY_CHUNK: usize = 500;

const MESSAGE_COLUMNS: &str = "m.id, m.client_id, m.diet_id, m.sender_id, m.sender_role, u.name,
     m.content, m.meal_tag_id, m.created_at, m.is_read, m.read_at";

impl Database {
    // -- Users and client links --

    pub fn upsert_user(&self, id: &str, name: &str, role: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO users (id, name, role) VALUES (?1, ?2, ?3)
                 ON CONFLICT(id) DO UPDATE SET name = excluded.name, role = excluded.role",
                (id, name, role),
            )?;
            Ok(())
        })
    }

    pub fn upsert_client(
        &self,
        id: &str,
        name: &str,
        user_id: Option<&str>,
        dietitian_id: Option<&str>,
    ) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO clients (id, name, user_id, dietitian_id) VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(id) DO UPDATE SET
                     name = excluded.name,
                     user_id = excluded.user_id,
                     dietitian_id = excluded.dietitian_id",
                rusqlite::params![id, name, user_id, dietitian_id],
            )?;
            Ok(())
        })
    }

    pub fn upsert_diet(&self, id: &str, client_id: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO diets (id, client_id) VALUES (?1, ?2)
                 ON CONFLICT(id) DO UPDATE SET client_id = excluded.client_id",
                (id, client_id),
            )?;
            Ok(())
        })
    }

    /// Linked users for a conversation. `None` when the diet does not
    /// belong to the client (or either record is missing).
    pub fn get_participants(&self, client_id: &str, diet_id: &str) -> Result<Option<ParticipantsRow>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT c.user_id, c.dietitian_id
                 FROM clients c
                 JOIN diets d ON d.client_id = c.id
                 WHERE c.id = ?1 AND d.id = ?2",
                (client_id, diet_id),
                |row| {
                    Ok(ParticipantsRow {
                        client_user_id: row.get(0)?,
                        dietitian_user_id: row.get(1)?,
                    })
                },
            )
            .optional()
        })
    }

    /// Typed form of [`Database::get_participants`]. A linked id that does not
    /// parse is treated as unlinked.
    pub fn participants(&self, key: &ConversationKey) -> Result<Option<Participants>> {
        let row = self.get_participants(&key.client_id.to_string(), &key.diet_id.to_string())?;
        Ok(row.map(|row| Participants {
            client_user_id: parse_linked_id(row.client_user_id.as_deref(), key),
            dietitian_user_id: parse_linked_id(row.dietitian_user_id.as_deref(), key),
        }))
    }

    // -- Messages --

    /// Insert a message and its photos in one transaction. Returns the new id.
    pub fn insert_message(
        &self,
        message: &NewMessage<'_>,
        photos: &[String],
        now: DateTime<Utc>,
    ) -> Result<i64> {
        let created_at = format_ts(now);
        let expires_at = format_ts(now + Duration::hours(PHOTO_TTL_HOURS));

        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "INSERT INTO messages (client_id, diet_id, sender_id, sender_role, content, meal_tag_id, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                rusqlite::params![
                    message.client_id,
                    message.diet_id,
                    message.sender_id,
                    message.sender_role,
                    message.content,
                    message.meal_tag_id,
                    created_at,
                ],
            )?;
            let id = tx.last_insert_rowid();

            for image_data in photos {
                tx.execute(
                    "INSERT INTO message_photos (message_id, image_data, created_at, expires_at)
                     VALUES (?1, ?2, ?3, ?4)",
                    rusqlite::params![id, image_data, created_at, expires_at],
                )?;
            }

            tx.commit()?;
            Ok(id)
        })
    }

    /// Messages of a conversation in ascending id order, strictly after `after_id`.
    pub fn get_messages_since(
        &self,
        client_id: &str,
        diet_id: &str,
        after_id: Option<i64>,
    ) -> Result<Vec<MessageRow>> {
        self.with_conn(|conn| {
            let sql = format!(
                "SELECT {MESSAGE_COLUMNS}
                 FROM messages m
                 LEFT JOIN users u ON m.sender_id = u.id
                 WHERE m.client_id = ?1 AND m.diet_id = ?2 AND m.id > ?3
                 ORDER BY m.id ASC"
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(
                    rusqlite::params![client_id, diet_id, after_id.unwrap_or(0)],
                    map_message_row,
                )?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    pub fn get_message(&self, client_id: &str, diet_id: &str, id: i64) -> Result<Option<MessageRow>> {
        self.with_conn(|conn| {
            let sql = format!(
                "SELECT {MESSAGE_COLUMNS}
                 FROM messages m
                 LEFT JOIN users u ON m.sender_id = u.id
                 WHERE m.client_id = ?1 AND m.diet_id = ?2 AND m.id = ?3"
            );
            conn.query_row(&sql, rusqlite::params![client_id, diet_id, id], map_message_row)
                .optional()
        })
    }

    /// Unread messages in a conversation that `reader_id` did not author.
    pub fn count_unread(&self, client_id: &str, diet_id: &str, reader_id: &str) -> Result<u64> {
        self.with_conn(|conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM messages
                 WHERE client_id = ?1 AND diet_id = ?2 AND sender_id != ?3 AND is_read = 0",
                (client_id, diet_id, reader_id),
                |row| row.get(0),
            )?;
            Ok(count as u64)
        })
    }

    /// Flip unread messages in `ids` that `reader_id` did not author.
    /// Returns the ids that changed; already-read and self-authored ids are skipped.
    pub fn mark_read(
        &self,
        client_id: &str,
        diet_id: &str,
        reader_id: &str,
        ids: &[i64],
        now: DateTime<Utc>,
    ) -> Result<Vec<i64>> {
        if ids.is_empty() {
            return Ok(vec![]);
        }

        let read_at = format_ts(now);
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            let mut updated = Vec::new();
            {
                let mut stmt = tx.prepare(
                    "UPDATE messages SET is_read = 1, read_at = ?1
                     WHERE id = ?2 AND client_id = ?3 AND diet_id = ?4
                       AND sender_id != ?5 AND is_read = 0",
                )?;
                for id in ids {
                    let changed =
                        stmt.execute(rusqlite::params![read_at, id, client_id, diet_id, reader_id])?;
                    if changed > 0 {
                        updated.push(*id);
                    }
                }
            }
            tx.commit()?;
            Ok(updated)
        })
    }

    // -- Photos --

    /// Batch-fetch photos that have not expired at `now`, ordered by photo id.
    /// Ids are bound in chunks to stay under SQLite's host parameter limit.
    pub fn get_live_photos(&self, message_ids: &[i64], now: DateTime<Utc>) -> Result<Vec<PhotoRow>> {
        if message_ids.is_empty() {
            return Ok(vec![]);
        }

        let now = format_ts(now);
        self.with_conn(|conn| {
            let mut photos = Vec::new();
            for chunk in message_ids.chunks(PHOTO_QUERY_CHUNK) {
                let placeholders: Vec<String> =
                    (2..=chunk.len() + 1).map(|i| format!("?{}", i)).collect();
                let sql = format!(
                    "SELECT id, message_id, image_data, created_at, expires_at FROM message_photos
                     WHERE expires_at > ?1 AND message_id IN ({})",
                    placeholders.join(", ")
                );

                let mut stmt = conn.prepare(&sql)?;
                let mut params: Vec<&dyn rusqlite::types::ToSql> = vec![&now];
                params.extend(chunk.iter().map(|id| id as &dyn rusqlite::types::ToSql));

                let rows = stmt.query_map(params.as_slice(), |row| {
                    Ok(PhotoRow {
                        id: row.get(0)?,
                        message_id: row.get(1)?,
                        image_data: row.get(2)?,
                        created_at: row.get(3)?,
                        expires_at: row.get(4)?,
                    })
                })?;
                for row in rows {
                    photos.push(row?);
                }
            }

            photos.sort_by_key(|p| p.id);
            Ok(photos)
        })
    }

    pub fn delete_expired_photos(&self, now: DateTime<Utc>) -> Result<usize> {
        let now = format_ts(now);
        self.with_conn(|conn| {
            let deleted = conn.execute("DELETE FROM message_photos WHERE expires_at <= ?1", [now])?;
            Ok(deleted)
        })
    }

    // -- Push subscriptions --

    pub fn upsert_device_token(
        &self,
        user_id: &str,
        token: &str,
        platform: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO device_tokens (user_id, token, platform, updated_at) VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(user_id) DO UPDATE SET
                     token = excluded.token,
                     platform = excluded.platform,
                     updated_at = excluded.updated_at",
                rusqlite::params![user_id, token, platform, format_ts(now)],
            )?;
            Ok(())
        })
    }

    pub fn get_device_token(&self, user_id: &str) -> Result<Option<String>> {
        self.with_conn(|conn| {
            conn.query_row("SELECT token FROM device_tokens WHERE user_id = ?1", [user_id], |row| {
                row.get(0)
            })
            .optional()
        })
    }

    pub fn delete_device_token(&self, user_id: &str) -> Result<bool> {
        self.with_conn(|conn| {
            let deleted = conn.execute("DELETE FROM device_tokens WHERE user_id = ?1", [user_id])?;
            Ok(deleted > 0)
        })
    }

    /// Register a browser subscription. An endpoint re-registered by another
    /// user moves to that user.
    pub fn upsert_web_subscription(
        &self,
        user_id: &str,
        endpoint: &str,
        p256dh: &str,
        auth: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO web_push_subscriptions (user_id, endpoint, p256dh, auth, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(endpoint) DO UPDATE SET
                     user_id = excluded.user_id,
                     p256dh = excluded.p256dh,
                     auth = excluded.auth",
                rusqlite::params![user_id, endpoint, p256dh, auth, format_ts(now)],
            )?;
            Ok(())
        })
    }

    pub fn get_web_subscriptions(&self, user_id: &str) -> Result<Vec<WebSubscriptionRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, user_id, endpoint, p256dh, auth FROM web_push_subscriptions
                 WHERE user_id = ?1 ORDER BY id ASC",
            )?;
            let rows = stmt
                .query_map([user_id], |row| {
                    Ok(WebSubscriptionRow {
                        id: row.get(0)?,
                        user_id: row.get(1)?,
                        endpoint: row.get(2)?,
                        p256dh: row.get(3)?,
                        auth: row.get(4)?,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    /// Remove a subscription by its endpoint, regardless of owner.
    pub fn delete_web_subscription(&self, endpoint: &str) -> Result<bool> {
        self.with_conn(|conn| {
            let deleted =
                conn.execute("DELETE FROM web_push_subscriptions WHERE endpoint = ?1", [endpoint])?;
            Ok(deleted > 0)
        })
    }

    /// Owner-initiated opt-out; other users' rows are untouched.
    pub fn delete_web_subscription_for_user(&self, user_id: &str, endpoint: &str) -> Result<bool> {
        self.with_conn(|conn| {
            let deleted = conn.execute(
                "DELETE FROM web_push_subscriptions WHERE user_id = ?1 AND endpoint = ?2",
                (user_id, endpoint),
            )?;
            Ok(deleted > 0)
        })
    }
}

fn parse_linked_id(raw: Option<&str>, key: &ConversationKey) -> Option<Uuid> {
    let raw = raw?;
    match raw.parse() {
        Ok(id) => Some(id),
        Err(e) => {
            warn!("Corrupt linked user id '{}' on client {}: {}", raw, key.client_id, e);
            None
        }
    }
}

fn map_message_row(row: &Row<'_>) -> rusqlite::Result<MessageRow> {
    Ok(MessageRow {
        id: row.get(0)?,
        client_id: row.get(1)?,
        diet_id: row.get(2)?,
        sender_id: row.get(3)?,
        sender_role: row.get(4)?,
        sender_name: row.get::<_, Option<String>>(5)?.unwrap_or_else(|| "unknown".to_string()),
        content: row.get(6)?,
        meal_tag_id: row.get(7)?,
        created_at: row.get(8)?,
        is_read: row.get::<_, i64>(9)? != 0,
        read_at: row.get(10)?,
    })
}

/// Extension trait for optional query results
pub(crate) trait OptionalExt<T> {
    fn optional(self) -> Result<Option<T>>;
}

impl<T> OptionalExt<T> for std::result::Result<T, rusqlite::Error> {
    fn optional(self) -> Result<Option<T>> {
        match self {
            Ok(val) => Ok(Some(val)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use chrono::TimeZone;

    pub(crate) struct Fixture {
        pub db: Database,
        pub client: String,
        pub diet: String,
        pub client_user: String,
        pub dietitian: String,
    }

    pub(crate) fn fixture() -> Fixture {
        let db = Database::open_in_memory().unwrap();
        let client_user = uuid::Uuid::new_v4().to_string();
        let dietitian = uuid::Uuid::new_v4().to_string();
        let client = uuid::Uuid::new_v4().to_string();
        let diet = uuid::Uuid::new_v4().to_string();

        db.upsert_user(&client_user, "Ayşe", "client").unwrap();
        db.upsert_user(&dietitian, "Dyt. Mehmet", "dietitian").unwrap();
        db.upsert_client(&client, "Ayşe Yılmaz", Some(&client_user), Some(&dietitian))
            .unwrap();
        db.upsert_diet(&diet, &client).unwrap();

        Fixture { db, client, diet, client_user, dietitian }
    }

    #[test]
    fn photo_lookup_handles_more_ids_than_one_statement_binds() {
        let f = fixture();
        let first = send(&f, &f.client_user, "client", "sabah", &["aGVsbG8=".to_string()]);
        let last = send(&f, &f.client_user, "client", "akşam", &["d29ybGQ=".to_string()]);

        // Far more ids than SQLite allows as parameters in one statement.
        let mut ids = vec![first];
        ids.extend(last + 1..last + 40_000);
        ids.push(last);

        let photos = f.db.get_live_photos(&ids, noon() + Duration::hours(1)).unwrap();
        let owners: Vec<i64> = photos.iter().map(|p| p.message_id).collect();
        assert_eq!(owners, vec![first, last]);
    }

    fn noon() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
    }

    fn send(f: &Fixture, sender: &str, role: &str, content: &str, photos: &[String]) -> i64 {
        f.db.insert_message(
            &NewMessage {
                client_id: &f.client,
                diet_id: &f.diet,
                sender_id: sender,
                sender_role: role,
                content,
                meal_tag_id: None,
            },
            photos,
            noon(),
        )
        .unwrap()
    }

    #[test]
    fn ids_increase_and_since_is_exclusive() {
        let f = fixture();
        let a = send(&f, &f.client_user, "client", "merhaba", &[]);
        let b = send(&f, &f.dietitian, "dietitian", "selam", &[]);
        let c = send(&f, &f.client_user, "client", "nasılsınız", &[]);
        assert!(a < b && b < c);

        let all = f.db.get_messages_since(&f.client, &f.diet, None).unwrap();
        assert_eq!(all.iter().map(|m| m.id).collect::<Vec<_>>(), vec![a, b, c]);
        assert_eq!(all[1].sender_name, "Dyt. Mehmet");

        let after = f.db.get_messages_since(&f.client, &f.diet, Some(b)).unwrap();
        assert_eq!(after.iter().map(|m| m.id).collect::<Vec<_>>(), vec![c]);
    }

    #[test]
    fn mark_read_skips_own_and_already_read() {
        let f = fixture();
        let mine = send(&f, &f.dietitian, "dietitian", "kontrol", &[]);
        let theirs = send(&f, &f.client_user, "client", "tamam", &[]);

        let updated = f
            .db
            .mark_read(&f.client, &f.diet, &f.dietitian, &[mine, theirs], noon())
            .unwrap();
        assert_eq!(updated, vec![theirs]);

        let again = f
            .db
            .mark_read(&f.client, &f.diet, &f.dietitian, &[mine, theirs], noon())
            .unwrap();
        assert!(again.is_empty());

        let row = f.db.get_message(&f.client, &f.diet, theirs).unwrap().unwrap();
        assert!(row.is_read);
        assert!(row.read_at.is_some());
        let own = f.db.get_message(&f.client, &f.diet, mine).unwrap().unwrap();
        assert!(!own.is_read);
        assert!(own.read_at.is_none());
    }

    #[test]
    fn unread_count_excludes_reader_messages() {
        let f = fixture();
        send(&f, &f.client_user, "client", "bir", &[]);
        send(&f, &f.client_user, "client", "iki", &[]);
        send(&f, &f.dietitian, "dietitian", "üç", &[]);
        assert_eq!(f.db.count_unread(&f.client, &f.diet, &f.dietitian).unwrap(), 2);
        assert_eq!(f.db.count_unread(&f.client, &f.diet, &f.client_user).unwrap(), 1);
    }

    #[test]
    fn photos_expire_after_twelve_hours() {
        let f = fixture();
        let id = send(&f, &f.client_user, "client", "öğle yemeği", &["aGVsbG8=".to_string()]);

        let fresh = f.db.get_live_photos(&[id], noon() + Duration::hours(11)).unwrap();
        assert_eq!(fresh.len(), 1);
        assert_eq!(fresh[0].message_id, id);

        let stale = f.db.get_live_photos(&[id], noon() + Duration::hours(PHOTO_TTL_HOURS)).unwrap();
        assert!(stale.is_empty());

        assert_eq!(f.db.delete_expired_photos(noon() + Duration::hours(13)).unwrap(), 1);
    }

    #[test]
    fn participants_require_diet_of_client() {
        let f = fixture();
        let p = f.db.get_participants(&f.client, &f.diet).unwrap().unwrap();
        assert_eq!(p.client_user_id.as_deref(), Some(f.client_user.as_str()));
        assert_eq!(p.dietitian_user_id.as_deref(), Some(f.dietitian.as_str()));

        let other = uuid::Uuid::new_v4().to_string();
        assert!(f.db.get_participants(&other, &f.diet).unwrap().is_none());

        let key = ConversationKey::new(f.client.parse().unwrap(), f.diet.parse().unwrap());
        let typed = f.db.participants(&key).unwrap().unwrap();
        let dietitian: Uuid = f.dietitian.parse().unwrap();
        let client_user: Uuid = f.client_user.parse().unwrap();
        assert_eq!(typed.other_party(dietitian), Some(client_user));
    }

    #[test]
    fn web_subscription_delete_is_keyed_by_endpoint() {
        let f = fixture();
        let now = noon();
        f.db.upsert_web_subscription(&f.dietitian, "https://push.example/a", "k1", "a1", now)
            .unwrap();
        f.db.upsert_web_subscription(&f.dietitian, "https://push.example/b", "k2", "a2", now)
            .unwrap();

        assert!(f.db.delete_web_subscription("https://push.example/a").unwrap());
        assert!(!f.db.delete_web_subscription("https://push.example/a").unwrap());

        let left = f.db.get_web_subscriptions(&f.dietitian).unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].endpoint, "https://push.example/b");

        assert!(!f.db.delete_web_subscription_for_user(&f.client_user, "https://push.example/b").unwrap());
    }

    #[test]
    fn device_token_is_one_per_user() {
        let f = fixture();
        f.db.upsert_device_token(&f.client_user, "ExponentPushToken[a]", Some("ios"), noon())
            .unwrap();
        f.db.upsert_device_token(&f.client_user, "ExponentPushToken[b]", Some("ios"), noon())
            .unwrap();
        assert_eq!(
            f.db.get_device_token(&f.client_user).unwrap().as_deref(),
            Some("ExponentPushToken[b]")
        );
        assert!(f.db.delete_device_token(&f.client_user).unwrap());
        assert!(f.db.get_device_token(&f.client_user).unwrap().is_none());
    }
}
