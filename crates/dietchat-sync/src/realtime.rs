use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, warn};

use dietchat_types::events::{RealtimeCommand, RealtimeEvent};
use dietchat_types::models::ConversationKey;

use crate::error::RealtimeError;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const FEED_CAPACITY: usize = 64;

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Events of one live subscription. `recv` returning `None` means the
/// subscription is gone. Dropping the feed tears the connection down.
pub struct RealtimeFeed {
    rx: mpsc::Receiver<RealtimeEvent>,
    task: Option<JoinHandle<()>>,
}

impl RealtimeFeed {
    pub fn new(rx: mpsc::Receiver<RealtimeEvent>) -> Self {
        Self { rx, task: None }
    }

    fn with_task(rx: mpsc::Receiver<RealtimeEvent>, task: JoinHandle<()>) -> Self {
        Self { rx, task: Some(task) }
    }

    pub async fn recv(&mut self) -> Option<RealtimeEvent> {
        self.rx.recv().await
    }
}

impl Drop for RealtimeFeed {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// Opens a live subscription to one conversation.
#[async_trait]
pub trait RealtimeTransport: Send + Sync {
    async fn subscribe(&self, key: ConversationKey) -> Result<RealtimeFeed, RealtimeError>;
}

/// `RealtimeTransport` over the gateway WebSocket: Identify, Subscribe, then
/// forward message events for the key.
pub struct WsRealtime {
    url: String,
    token: String,
}

impl WsRealtime {
    /// `url` is the full socket URL, e.g. `wss://api.example.com/realtime`.
    pub fn new(url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            token: token.into(),
        }
    }

    /// Derive the socket URL from the HTTP base URL.
    pub fn from_base_url(base_url: &str, token: impl Into<String>) -> Self {
        let base = base_url.trim_end_matches('/');
        let ws_base = if let Some(rest) = base.strip_prefix("https://") {
            format!("wss://{}", rest)
        } else if let Some(rest) = base.strip_prefix("http://") {
            format!("ws://{}", rest)
        } else {
            base.to_string()
        };
        Self::new(format!("{}/realtime", ws_base), token)
    }
}

#[async_trait]
impl RealtimeTransport for WsRealtime {
    async fn subscribe(&self, key: ConversationKey) -> Result<RealtimeFeed, RealtimeError> {
        let (mut socket, _) = connect_async(self.url.as_str())
            .await
            .map_err(|e| RealtimeError::Connect(e.to_string()))?;

        send_command(&mut socket, &RealtimeCommand::Identify { token: self.token.clone() }).await?;
        match next_event(&mut socket).await? {
            RealtimeEvent::Ready { user_id } => debug!("Realtime ready as {}", user_id),
            other => return Err(RealtimeError::Handshake(format!("expected Ready, got {:?}", other))),
        }

        send_command(
            &mut socket,
            &RealtimeCommand::Subscribe {
                client_id: key.client_id,
                diet_id: key.diet_id,
            },
        )
        .await?;
        match next_event(&mut socket).await? {
            RealtimeEvent::Subscribed { .. } => debug!("Realtime subscribed to {}", key),
            RealtimeEvent::Error { message } => return Err(RealtimeError::Refused(message)),
            other => {
                return Err(RealtimeError::Handshake(format!("expected Subscribed, got {:?}", other)));
            }
        }

        let (tx, rx) = mpsc::channel(FEED_CAPACITY);
        let task = tokio::spawn(forward_events(socket, key, tx));
        Ok(RealtimeFeed::with_task(rx, task))
    }
}

async fn forward_events(mut socket: Socket, key: ConversationKey, tx: mpsc::Sender<RealtimeEvent>) {
    // Reading keeps answering the gateway's pings.
    while let Some(frame) = socket.next().await {
        match frame {
            Ok(WsMessage::Text(text)) => match serde_json::from_str::<RealtimeEvent>(&text) {
                Ok(event) => {
                    if event.conversation() != Some(key) {
                        continue;
                    }
                    if tx.send(event).await.is_err() {
                        break;
                    }
                }
                Err(e) => warn!("Undecodable realtime frame: {}", e),
            },
            Ok(WsMessage::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                warn!("Realtime socket error: {}", e);
                break;
            }
        }
    }
    debug!("Realtime feed for {} ended", key);
}

async fn send_command(socket: &mut Socket, cmd: &RealtimeCommand) -> Result<(), RealtimeError> {
    let text = serde_json::to_string(cmd).map_err(|e| RealtimeError::Handshake(e.to_string()))?;
    socket
        .send(WsMessage::Text(text.into()))
        .await
        .map_err(|e| RealtimeError::Handshake(e.to_string()))
}

async fn next_event(socket: &mut Socket) -> Result<RealtimeEvent, RealtimeError> {
    let read = async {
        while let Some(frame) = socket.next().await {
            match frame {
                Ok(WsMessage::Text(text)) => {
                    return serde_json::from_str::<RealtimeEvent>(&text)
                        .map_err(|e| RealtimeError::Handshake(e.to_string()));
                }
                Ok(WsMessage::Close(_)) => break,
                Ok(_) => continue,
                Err(e) => return Err(RealtimeError::Handshake(e.to_string())),
            }
        }
        Err(RealtimeError::Handshake("socket closed during handshake".into()))
    };

    tokio::time::timeout(HANDSHAKE_TIMEOUT, read)
        .await
        .map_err(|_| RealtimeError::Handshake("timed out".into()))?
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn socket_url_follows_http_scheme() {
        assert_eq!(
            WsRealtime::from_base_url("https://api.example.com/", "t").url,
            "wss://api.example.com/realtime"
        );
        assert_eq!(
            WsRealtime::from_base_url("http://127.0.0.1:3000", "t").url,
            "ws://127.0.0.1:3000/realtime"
        );
    }
}
