use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{info, warn};

use dietchat_db::Database;

/// Presence rows untouched for this long are deleted. Anything older than
/// the TTL already reads as inactive; this only bounds table growth.
const PRESENCE_RETENTION_SECS: i64 = 60 * 60;

/// Background task that deletes expired photos and stale presence rows.
pub async fn run_cleanup_loop(db: Arc<Database>, interval_secs: u64) {
    let mut interval = tokio::time::interval(Duration::from_secs(interval_secs));

    loop {
        interval.tick().await;

        let sweep_db = db.clone();
        match tokio::task::spawn_blocking(move || sweep(&sweep_db)).await {
            Ok(Ok((photos, presence))) => {
                if photos > 0 || presence > 0 {
                    info!(
                        "Cleanup: deleted {} expired photo(s), {} stale presence row(s)",
                        photos, presence
                    );
                }
            }
            Ok(Err(e)) => warn!("Cleanup error: {}", e),
            Err(e) => warn!("Cleanup task join error: {}", e),
        }
    }
}

fn sweep(db: &Database) -> anyhow::Result<(usize, usize)> {
    let now = Utc::now();
    let photos = db.delete_expired_photos(now)?;
    let presence = db.delete_presence_before(now - chrono::Duration::seconds(PRESENCE_RETENTION_SECS))?;
    Ok((photos, presence))
}
