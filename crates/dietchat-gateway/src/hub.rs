use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{RwLock, broadcast};
use uuid::Uuid;

use dietchat_types::events::RealtimeEvent;

const BROADCAST_CAPACITY: usize = 1024;

/// Fans committed-message events out to every open realtime connection.
/// Each connection filters by the conversations it subscribed to.
#[derive(Clone)]
pub struct RealtimeHub {
    inner: Arc<HubInner>,
}

struct HubInner {
    /// Broadcast channel for conversation events
    broadcast_tx: broadcast::Sender<RealtimeEvent>,

    /// Open connections per user: user_id -> count
    connections: RwLock<HashMap<Uuid, usize>>,
}

impl Default for RealtimeHub {
    fn default() -> Self {
        Self::new()
    }
}

impl RealtimeHub {
    pub fn new() -> Self {
        Self::with_capacity(BROADCAST_CAPACITY)
    }

    /// `capacity` events may be buffered per connection before it lags and is dropped.
    pub fn with_capacity(capacity: usize) -> Self {
        let (broadcast_tx, _) = broadcast::channel(capacity);
        Self {
            inner: Arc::new(HubInner {
                broadcast_tx,
                connections: RwLock::new(HashMap::new()),
            }),
        }
    }

    /// Subscribe to realtime events. Returns a broadcast receiver.
    pub fn subscribe(&self) -> broadcast::Receiver<RealtimeEvent> {
        self.inner.broadcast_tx.subscribe()
    }

    /// Publish an event to all connected clients. Having no listeners is not an error.
    pub fn publish(&self, event: RealtimeEvent) {
        let _ = self.inner.broadcast_tx.send(event);
    }

    /// Record a new connection for `user_id`. Returns how many that user now has open.
    pub async fn connection_opened(&self, user_id: Uuid) -> usize {
        let mut connections = self.inner.connections.write().await;
        let count = connections.entry(user_id).or_default();
        *count += 1;
        *count
    }

    pub async fn connection_closed(&self, user_id: Uuid) {
        let mut connections = self.inner.connections.write().await;
        if let Some(count) = connections.get_mut(&user_id) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                connections.remove(&user_id);
            }
        }
    }
}
