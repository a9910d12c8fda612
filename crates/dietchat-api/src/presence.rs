use axum::{Extension, Json, body::Bytes, extract::State};
use chrono::Utc;

use dietchat_types::api::{Ack, Claims, PresenceRequest};

use crate::auth::AppState;
use crate::error::ApiError;
use crate::store::run_blocking;

const MAX_SOURCE_CHARS: usize = 32;

/// `POST /presence`
///
/// Takes raw bytes rather than `Json` so page-teardown beacons, which arrive
/// as `text/plain`, are accepted too.
pub async fn heartbeat(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    body: Bytes,
) -> Result<Json<Ack>, ApiError> {
    let req: PresenceRequest = serde_json::from_slice(&body)
        .map_err(|e| ApiError::validation(format!("Invalid presence payload: {}", e)))?;

    let source: String = req.source.trim().chars().take(MAX_SOURCE_CHARS).collect();
    let key = req.conversation_key;
    let store = state.store.clone();
    let db = state.db.clone();

    run_blocking(move || {
        store.authorize(&claims, &key)?;
        db.upsert_presence(
            &claims.sub.to_string(),
            &key.client_id.to_string(),
            &key.diet_id.to_string(),
            req.is_active,
            &source,
            Utc::now(),
        )?;
        Ok(())
    })
    .await?;

    Ok(Json(Ack::ok()))
}
