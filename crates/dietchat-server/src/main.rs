mod cleanup;
mod config;

use std::net::SocketAddr;
use std::sync::Arc;

use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use dietchat_api::AppStateInner;
use dietchat_db::Database;
use dietchat_gateway::RealtimeHub;
use dietchat_notify::{
    ExpoPushChannel, NativePushChannel, NotificationDispatcher, NullNativePush, NullWebPush,
    VapidWebPushChannel, WebPushChannel,
};

use crate::config::Config;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    // Init logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "dietchat=debug,tower_http=debug".into()),
        )
        .init();

    let config = Config::from_env()?;
    if config.jwt_secret == "dev-secret-change-me" {
        warn!("DIETCHAT_JWT_SECRET is not set, using the development secret");
    }

    // Init database
    let db = Arc::new(Database::open(&config.db_path)?);

    // Push channels fall back to no-ops when credentials are missing.
    let native: Arc<dyn NativePushChannel> = match &config.expo_access_token {
        Some(token) => Arc::new(ExpoPushChannel::new(Some(token.clone()))?),
        None => {
            info!("DIETCHAT_EXPO_ACCESS_TOKEN not set, native push disabled");
            Arc::new(NullNativePush)
        }
    };
    let web: Arc<dyn WebPushChannel> = match &config.vapid {
        Some(vapid) => Arc::new(VapidWebPushChannel::new(
            vapid.private_key_pem.clone(),
            vapid.public_key.clone(),
            vapid.subject.clone(),
        )?),
        None => {
            info!("VAPID keys not configured, web push disabled");
            Arc::new(NullWebPush)
        }
    };

    let hub = RealtimeHub::new();
    let notifier = NotificationDispatcher::new(db.clone(), native, web, config.app_url.clone());
    let state = AppStateInner::new(db.clone(), config.jwt_secret.clone(), hub, notifier);

    // Background cleanup task
    tokio::spawn(cleanup::run_cleanup_loop(db, config.cleanup_interval_secs));

    let app = dietchat_api::router(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;
    info!("Dietchat server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
