use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{RwLock, mpsc};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use dietchat_db::Database;
use dietchat_types::api::Claims;
use dietchat_types::events::{RealtimeCommand, RealtimeEvent};
use dietchat_types::models::ConversationKey;

use crate::hub::RealtimeHub;

/// Heartbeat interval: server sends a Ping every 15 seconds.
/// If 2 consecutive Pongs are missed (~30s), the connection is dropped.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

/// A connection that has not identified within this window is closed.
const IDENTIFY_TIMEOUT: Duration = Duration::from_secs(10);

type Subscriptions = Arc<RwLock<HashSet<ConversationKey>>>;

/// Handle a single realtime connection: Identify handshake, then the event loop.
pub async fn handle_connection(
    socket: WebSocket,
    hub: RealtimeHub,
    db: Arc<Database>,
    jwt_secret: String,
) {
    let (mut sender, mut receiver) = socket.split();

    // Step 1: Wait for Identify command with JWT
    let claims = match wait_for_identify(&mut receiver, &jwt_secret).await {
        Some(claims) => claims,
        None => {
            warn!("Realtime client failed to identify, closing");
            let _ = sender.send(Message::Close(None)).await;
            return;
        }
    };

    info!("{} ({}) connected to realtime gateway", claims.name, claims.sub);

    // Step 2: Send Ready event
    let ready = RealtimeEvent::Ready { user_id: claims.sub };
    if !send_event(&mut sender, &ready).await {
        return;
    }

    let open = hub.connection_opened(claims.sub).await;
    debug!("{} now has {} realtime connection(s)", claims.sub, open);

    run_connection_loop(sender, receiver, hub.clone(), db, claims.clone()).await;

    hub.connection_closed(claims.sub).await;
    info!("{} ({}) disconnected from realtime gateway", claims.name, claims.sub);
}

async fn run_connection_loop(
    mut sender: SplitSink<WebSocket, Message>,
    mut receiver: SplitStream<WebSocket>,
    hub: RealtimeHub,
    db: Arc<Database>,
    claims: Claims,
) {
    let mut broadcast_rx = hub.subscribe();

    // Replies to commands travel from the recv task to the send task.
    let (reply_tx, mut reply_rx) = mpsc::unbounded_channel::<RealtimeEvent>();

    // Per-connection conversation subscriptions (shared between send and recv tasks).
    let subscriptions: Subscriptions = Arc::new(RwLock::new(HashSet::new()));
    let send_subscriptions = subscriptions.clone();

    let pong_received = Arc::new(AtomicBool::new(true));
    let pong_flag_send = pong_received.clone();
    let pong_flag_recv = pong_received.clone();

    // Forward subscribed events + command replies -> client, with heartbeat
    let mut send_task = tokio::spawn(async move {
        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        heartbeat.tick().await;
        let mut missed_heartbeats: u8 = 0;

        loop {
            tokio::select! {
                result = broadcast_rx.recv() => {
                    let event = match result {
                        Ok(event) => event,
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                            // Skipped events cannot be replayed. Closing makes the
                            // client fall back to cursor polling, which covers the gap.
                            warn!("Broadcast receiver lagged by {} events, dropping connection", n);
                            break;
                        }
                        Err(_) => break,
                    };

                    if let Some(key) = event.conversation() {
                        if !send_subscriptions.read().await.contains(&key) {
                            continue;
                        }
                    }

                    if !send_event(&mut sender, &event).await {
                        break;
                    }
                }
                reply = reply_rx.recv() => {
                    let Some(event) = reply else { break };
                    if !send_event(&mut sender, &event).await {
                        break;
                    }
                }
                _ = heartbeat.tick() => {
                    if pong_flag_send.swap(false, Ordering::Acquire) {
                        missed_heartbeats = 0;
                    } else {
                        missed_heartbeats += 1;
                        if missed_heartbeats >= 2 {
                            warn!("Heartbeat timeout (missed {} pongs), dropping connection", missed_heartbeats);
                            break;
                        }
                    }
                    if sender.send(Message::Ping(Vec::new().into())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    // Read commands from client
    let recv_subscriptions = subscriptions.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            match msg {
                Message::Text(text) => match serde_json::from_str::<RealtimeCommand>(&text) {
                    Ok(cmd) => {
                        if let Some(reply) =
                            handle_command(&db, &claims, cmd, &recv_subscriptions).await
                        {
                            if reply_tx.send(reply).is_err() {
                                break;
                            }
                        }
                    }
                    Err(e) => {
                        warn!(
                            "{} ({}) bad command: {} -- raw: {}",
                            claims.name,
                            claims.sub,
                            e,
                            text.chars().take(200).collect::<String>()
                        );
                    }
                },
                Message::Pong(_) => {
                    pong_flag_recv.store(true, Ordering::Release);
                }
                Message::Close(_) => break,
                _ => {}
            }
        }
    });

    // Wait for either task to finish
    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }
}

async fn handle_command(
    db: &Arc<Database>,
    claims: &Claims,
    cmd: RealtimeCommand,
    subscriptions: &Subscriptions,
) -> Option<RealtimeEvent> {
    match cmd {
        RealtimeCommand::Identify { .. } => None, // Already handled

        RealtimeCommand::Subscribe { client_id, diet_id } => {
            let key = ConversationKey::new(client_id, diet_id);
            match is_participant(db, key, claims.sub).await {
                Ok(true) => {
                    info!("{} ({}) subscribed to {}", claims.name, claims.sub, key);
                    subscriptions.write().await.insert(key);
                    Some(RealtimeEvent::Subscribed { client_id, diet_id })
                }
                Ok(false) => {
                    warn!("{} ({}) refused subscription to {}", claims.name, claims.sub, key);
                    Some(RealtimeEvent::Error {
                        message: "Not a participant of this conversation".into(),
                    })
                }
                Err(e) => {
                    error!("Subscription check for {} failed: {}", key, e);
                    Some(RealtimeEvent::Error {
                        message: "Subscription failed".into(),
                    })
                }
            }
        }

        RealtimeCommand::Unsubscribe { client_id, diet_id } => {
            subscriptions
                .write()
                .await
                .remove(&ConversationKey::new(client_id, diet_id));
            None
        }
    }
}

async fn is_participant(db: &Arc<Database>, key: ConversationKey, user_id: Uuid) -> anyhow::Result<bool> {
    let db = db.clone();
    let participants = tokio::task::spawn_blocking(move || db.participants(&key)).await??;
    Ok(participants.is_some_and(|p| p.includes(user_id)))
}

async fn wait_for_identify(receiver: &mut SplitStream<WebSocket>, jwt_secret: &str) -> Option<Claims> {
    use jsonwebtoken::{DecodingKey, Validation, decode};

    let timeout = tokio::time::timeout(IDENTIFY_TIMEOUT, async {
        while let Some(Ok(msg)) = receiver.next().await {
            if let Message::Text(text) = msg {
                if let Ok(RealtimeCommand::Identify { token }) =
                    serde_json::from_str::<RealtimeCommand>(&text)
                {
                    let token_data = decode::<Claims>(
                        &token,
                        &DecodingKey::from_secret(jwt_secret.as_bytes()),
                        &Validation::default(),
                    )
                    .ok()?;

                    return Some(token_data.claims);
                }
            }
        }
        None
    });

    timeout.await.ok().flatten()
}

/// Serialize and send one event. Returns false once the socket is gone.
async fn send_event(sender: &mut SplitSink<WebSocket, Message>, event: &RealtimeEvent) -> bool {
    let text = match serde_json::to_string(event) {
        Ok(text) => text,
        Err(e) => {
            error!("Failed to encode realtime event: {}", e);
            return true;
        }
    };
    sender.send(Message::Text(text.into())).await.is_ok()
}
