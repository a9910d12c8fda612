//! HTTP surface of the conversation service: message log, presence
//! heartbeats, push opt-in, and the realtime WebSocket upgrade.

pub mod auth;
pub mod error;
pub mod extract;
pub mod messages;
pub mod middleware;
pub mod presence;
pub mod push;
pub mod store;

use axum::{
    Router,
    extract::{State, WebSocketUpgrade},
    middleware::from_fn_with_state,
    response::IntoResponse,
    routing::{get, patch, post},
};

use dietchat_gateway::connection;

pub use auth::{AppState, AppStateInner};
pub use error::ApiError;

/// Build the application router. Transport layers (CORS, tracing) are added
/// by the binary.
pub fn router(state: AppState) -> Router {
    let protected_routes = Router::new()
        .route(
            "/conversations/{client_id}/{diet_id}/messages",
            get(messages::get_messages).post(messages::send_message),
        )
        .route(
            "/conversations/{client_id}/{diet_id}/messages/read",
            patch(messages::mark_read),
        )
        .route("/presence", post(presence::heartbeat))
        .route(
            "/push/device-token",
            post(push::register_device_token).delete(push::remove_device_token),
        )
        .route(
            "/push/web-subscriptions",
            post(push::subscribe_web).delete(push::unsubscribe_web),
        )
        .layer(from_fn_with_state(state.clone(), middleware::require_auth))
        .with_state(state.clone());

    // The socket authenticates with an Identify command after upgrade.
    let public_routes = Router::new()
        .route("/push/vapid-public-key", get(push::vapid_public_key))
        .route("/realtime", get(ws_upgrade))
        .with_state(state);

    Router::new().merge(protected_routes).merge(public_routes)
}

async fn ws_upgrade(State(state): State<AppState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket| {
        connection::handle_connection(
            socket,
            state.hub.clone(),
            state.db.clone(),
            state.jwt_secret.clone(),
        )
    })
}
