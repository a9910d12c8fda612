use axum::{
    Extension, Json,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use chrono::{SubsecRound, Utc};
use tracing::debug;
use uuid::Uuid;

use dietchat_types::api::{
    Claims, FetchMessagesQuery, FetchMessagesResponse, MarkReadRequest, MarkReadResponse,
    MessageEnvelope, SendMessageRequest,
};
use dietchat_types::events::RealtimeEvent;
use dietchat_types::models::ConversationKey;

use crate::auth::AppState;
use crate::error::ApiError;
use crate::extract::{ApiJson, ApiPath, ApiQuery};
use crate::store::run_blocking;

/// `GET /conversations/{clientId}/{dietId}/messages`
///
/// Three shapes: `?messageId=N` returns one message, `?afterId=N` returns the
/// incremental tail, and no query returns the full log plus the caller's
/// unread count. `messageId` wins when both are given.
pub async fn get_messages(
    State(state): State<AppState>,
    ApiPath((client_id, diet_id)): ApiPath<(Uuid, Uuid)>,
    ApiQuery(query): ApiQuery<FetchMessagesQuery>,
    Extension(claims): Extension<Claims>,
) -> Result<Response, ApiError> {
    let key = ConversationKey::new(client_id, diet_id);
    let store = state.store.clone();

    if let Some(message_id) = query.message_id {
        let message =
            run_blocking(move || store.fetch_one(&claims, &key, message_id, Utc::now())).await?;
        return Ok(Json(MessageEnvelope { success: true, message }).into_response());
    }

    let cursor = query.after_id;
    let result = run_blocking(move || store.fetch_since(&claims, &key, cursor, Utc::now())).await?;

    Ok(Json(FetchMessagesResponse {
        success: true,
        messages: result.messages,
        unread_count: result.unread_count,
    })
    .into_response())
}

/// `POST /conversations/{clientId}/{dietId}/messages`
pub async fn send_message(
    State(state): State<AppState>,
    ApiPath((client_id, diet_id)): ApiPath<(Uuid, Uuid)>,
    Extension(claims): Extension<Claims>,
    ApiJson(req): ApiJson<SendMessageRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let key = ConversationKey::new(client_id, diet_id);
    let store = state.store.clone();

    let message = run_blocking(move || store.append(&claims, &key, &req, Utc::now())).await?;

    // Committed: tell live subscribers, then notify the other party out of band.
    state.hub.publish(RealtimeEvent::MessageInsert {
        client_id,
        diet_id,
        id: message.id,
    });
    state.notifier.spawn_new_message(message.clone());

    Ok((StatusCode::CREATED, Json(MessageEnvelope { success: true, message })))
}

/// `PATCH /conversations/{clientId}/{dietId}/messages/read`
pub async fn mark_read(
    State(state): State<AppState>,
    ApiPath((client_id, diet_id)): ApiPath<(Uuid, Uuid)>,
    Extension(claims): Extension<Claims>,
    ApiJson(req): ApiJson<MarkReadRequest>,
) -> Result<Json<MarkReadResponse>, ApiError> {
    let key = ConversationKey::new(client_id, diet_id);
    let store = state.store.clone();
    // Millisecond precision, matching what the row stores.
    let now = Utc::now().trunc_subsecs(3);
    let reader = claims.sub;

    let updated = run_blocking(move || store.mark_read(&claims, &key, &req.message_ids, now)).await?;

    if !updated.is_empty() {
        debug!("{} marked {} message(s) read in {}", reader, updated.len(), key);
    }
    for id in &updated {
        state.hub.publish(RealtimeEvent::MessageUpdate {
            client_id,
            diet_id,
            id: *id,
            is_read: true,
            read_at: Some(now),
        });
    }

    Ok(Json(MarkReadResponse {
        success: true,
        marked_count: updated.len() as u64,
    }))
}
