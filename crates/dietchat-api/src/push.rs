use axum::{Extension, Json, extract::State};
use chrono::Utc;
use tracing::info;

use dietchat_types::api::{
    Ack, Claims, DeviceTokenRequest, VapidKeyResponse, WebSubscriptionRequest,
    WebUnsubscribeRequest,
};

use crate::auth::AppState;
use crate::error::ApiError;
use crate::extract::ApiJson;
use crate::store::run_blocking;

/// `POST /push/device-token`: one native token per user, replaced on re-register.
pub async fn register_device_token(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    ApiJson(req): ApiJson<DeviceTokenRequest>,
) -> Result<Json<Ack>, ApiError> {
    let token = req.token.trim().to_string();
    if token.is_empty() {
        return Err(ApiError::validation("token is required"));
    }
    let platform = req.platform.map(|p| p.trim().to_lowercase()).filter(|p| !p.is_empty());

    let db = state.db.clone();
    let user = claims.sub.to_string();
    run_blocking(move || Ok(db.upsert_device_token(&user, &token, platform.as_deref(), Utc::now())?))
        .await?;

    info!("{} registered a device token", claims.sub);
    Ok(Json(Ack::ok()))
}

/// `DELETE /push/device-token`
pub async fn remove_device_token(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> Result<Json<Ack>, ApiError> {
    let db = state.db.clone();
    let user = claims.sub.to_string();
    let removed = run_blocking(move || Ok(db.delete_device_token(&user)?)).await?;

    if removed {
        info!("{} removed their device token", claims.sub);
    }
    Ok(Json(Ack::ok()))
}

/// `POST /push/web-subscriptions`
pub async fn subscribe_web(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    ApiJson(req): ApiJson<WebSubscriptionRequest>,
) -> Result<Json<Ack>, ApiError> {
    let endpoint = req.endpoint.trim().to_string();
    if !endpoint.starts_with("https://") {
        return Err(ApiError::validation("endpoint must be an https URL"));
    }
    if req.keys.p256dh.trim().is_empty() || req.keys.auth.trim().is_empty() {
        return Err(ApiError::validation("keys.p256dh and keys.auth are required"));
    }

    let db = state.db.clone();
    let user = claims.sub.to_string();
    run_blocking(move || {
        Ok(db.upsert_web_subscription(
            &user,
            &endpoint,
            req.keys.p256dh.trim(),
            req.keys.auth.trim(),
            Utc::now(),
        )?)
    })
    .await?;

    info!("{} registered a web push subscription", claims.sub);
    Ok(Json(Ack::ok()))
}

/// `DELETE /push/web-subscriptions`: only the caller's own subscription is removed.
pub async fn unsubscribe_web(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    ApiJson(req): ApiJson<WebUnsubscribeRequest>,
) -> Result<Json<Ack>, ApiError> {
    let db = state.db.clone();
    let user = claims.sub.to_string();
    let endpoint = req.endpoint.trim().to_string();
    let removed = run_blocking(move || Ok(db.delete_web_subscription_for_user(&user, &endpoint)?)).await?;

    if removed {
        info!("{} removed a web push subscription", claims.sub);
    }
    Ok(Json(Ack::ok()))
}

/// `GET /push/vapid-public-key`: 404 when web push is not configured.
pub async fn vapid_public_key(State(state): State<AppState>) -> Result<Json<VapidKeyResponse>, ApiError> {
    let public_key = state
        .notifier
        .web_public_key()
        .ok_or_else(|| ApiError::NotFound("Web push is not configured".into()))?
        .to_string();
    Ok(Json(VapidKeyResponse { public_key }))
}
