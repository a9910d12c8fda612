use std::sync::Arc;

use jsonwebtoken::{EncodingKey, Header, encode};
use uuid::Uuid;

use dietchat_db::Database;
use dietchat_gateway::RealtimeHub;
use dietchat_notify::NotificationDispatcher;
use dietchat_types::api::Claims;
use dietchat_types::models::Role;

use crate::store::MessageStore;

pub type AppState = Arc<AppStateInner>;

pub struct AppStateInner {
    pub db: Arc<Database>,
    pub store: MessageStore,
    pub jwt_secret: String,
    pub hub: RealtimeHub,
    pub notifier: NotificationDispatcher,
}

impl AppStateInner {
    pub fn new(
        db: Arc<Database>,
        jwt_secret: impl Into<String>,
        hub: RealtimeHub,
        notifier: NotificationDispatcher,
    ) -> AppState {
        Arc::new(Self {
            store: MessageStore::new(db.clone()),
            db,
            jwt_secret: jwt_secret.into(),
            hub,
            notifier,
        })
    }
}

/// Mint a credential the middleware accepts. Login lives in the account
/// service; this is for service-to-service calls and tooling.
pub fn create_token(secret: &str, user_id: Uuid, role: Role, name: &str) -> anyhow::Result<String> {
    let claims = Claims {
        sub: user_id,
        role,
        name: name.to_string(),
        exp: (chrono::Utc::now() + chrono::Duration::days(30)).timestamp() as usize,
    };

    let token = encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )?;

    Ok(token)
}
