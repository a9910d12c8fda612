//! Short-lived "is viewing this conversation" flags.
//!
//! A record is overwritten on every heartbeat and counts as live only while
//! its last heartbeat is younger than [`PRESENCE_TTL`]. Anything else (no
//! record, an inactive record, a stale one) reads as inactive, so a missed
//! heartbeat leads to a notification rather than a silently dropped one.

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};

use crate::models::PresenceRow;
use crate::queries::OptionalExt;
use crate::{Database, format_ts};

/// Seconds a heartbeat keeps a viewer active.
pub const PRESENCE_TTL: i64 = 30;

impl Database {
    pub fn upsert_presence(
        &self,
        user_id: &str,
        client_id: &str,
        diet_id: &str,
        is_active: bool,
        source: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO presence (user_id, client_id, diet_id, is_active, source, last_active_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(user_id, client_id, diet_id) DO UPDATE SET
                     is_active = excluded.is_active,
                     source = excluded.source,
                     last_active_at = excluded.last_active_at",
                rusqlite::params![user_id, client_id, diet_id, is_active, source, format_ts(now)],
            )?;
            Ok(())
        })
    }

    pub fn get_presence(&self, user_id: &str, client_id: &str, diet_id: &str) -> Result<Option<PresenceRow>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT user_id, is_active, source, last_active_at FROM presence
                 WHERE user_id = ?1 AND client_id = ?2 AND diet_id = ?3",
                (user_id, client_id, diet_id),
                |row| {
                    Ok(PresenceRow {
                        user_id: row.get(0)?,
                        is_active: row.get::<_, i64>(1)? != 0,
                        source: row.get(2)?,
                        last_active_at: row.get(3)?,
                    })
                },
            )
            .optional()
        })
    }

    /// True only for an active record whose last heartbeat is within the TTL.
    pub fn is_presence_active(
        &self,
        user_id: &str,
        client_id: &str,
        diet_id: &str,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let threshold = format_ts(now - Duration::seconds(PRESENCE_TTL));
        self.with_conn(|conn| {
            let live: i64 = conn.query_row(
                "SELECT COUNT(*) FROM presence
                 WHERE user_id = ?1 AND client_id = ?2 AND diet_id = ?3
                   AND is_active = 1 AND last_active_at >= ?4",
                (user_id, client_id, diet_id, threshold),
                |row| row.get(0),
            )?;
            Ok(live > 0)
        })
    }

    /// Drop records nobody has refreshed since `before`.
    pub fn delete_presence_before(&self, before: DateTime<Utc>) -> Result<usize> {
        self.with_conn(|conn| {
            let deleted = conn.execute(
                "DELETE FROM presence WHERE last_active_at < ?1",
                [format_ts(before)],
            )?;
            Ok(deleted)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queries::tests::fixture;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 18, 30, 0).unwrap()
    }

    #[test]
    fn missing_record_is_inactive() {
        let f = fixture();
        assert!(!f.db.is_presence_active(&f.dietitian, &f.client, &f.diet, t0()).unwrap());
    }

    #[test]
    fn active_heartbeat_lives_for_ttl() {
        let f = fixture();
        f.db.upsert_presence(&f.dietitian, &f.client, &f.diet, true, "web", t0()).unwrap();

        let within = t0() + Duration::seconds(PRESENCE_TTL);
        assert!(f.db.is_presence_active(&f.dietitian, &f.client, &f.diet, within).unwrap());

        let stale = t0() + Duration::seconds(PRESENCE_TTL + 1);
        assert!(!f.db.is_presence_active(&f.dietitian, &f.client, &f.diet, stale).unwrap());
    }

    #[test]
    fn inactive_heartbeat_overwrites_active() {
        let f = fixture();
        f.db.upsert_presence(&f.client_user, &f.client, &f.diet, true, "mobile", t0()).unwrap();
        f.db.upsert_presence(&f.client_user, &f.client, &f.diet, false, "mobile-background", t0())
            .unwrap();

        assert!(!f.db.is_presence_active(&f.client_user, &f.client, &f.diet, t0()).unwrap());
        let row = f.db.get_presence(&f.client_user, &f.client, &f.diet).unwrap().unwrap();
        assert_eq!(row.source, "mobile-background");
        assert!(!row.is_active);
    }

    #[test]
    fn presence_is_per_conversation() {
        let f = fixture();
        let other_diet = uuid::Uuid::new_v4().to_string();
        f.db.upsert_diet(&other_diet, &f.client).unwrap();
        f.db.upsert_presence(&f.dietitian, &f.client, &other_diet, true, "web", t0()).unwrap();

        assert!(!f.db.is_presence_active(&f.dietitian, &f.client, &f.diet, t0()).unwrap());
        assert!(f.db.is_presence_active(&f.dietitian, &f.client, &other_diet, t0()).unwrap());
    }

    #[test]
    fn sweep_removes_old_records() {
        let f = fixture();
        f.db.upsert_presence(&f.dietitian, &f.client, &f.diet, true, "web", t0()).unwrap();
        assert_eq!(f.db.delete_presence_before(t0() + Duration::hours(1)).unwrap(), 1);
        assert!(f.db.get_presence(&f.dietitian, &f.client, &f.diet).unwrap().is_none());
    }
}
