use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::ConversationKey;

/// Events sent over the realtime gateway.
///
/// Message events carry identifiers only. Receivers fetch the full record
/// through the HTTP API before showing it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all_fields = "camelCase")]
pub enum RealtimeEvent {
    /// Server confirms successful authentication
    Ready { user_id: Uuid },

    /// Server confirms a conversation subscription
    Subscribed { client_id: Uuid, diet_id: Uuid },

    /// A message was committed
    MessageInsert {
        client_id: Uuid,
        diet_id: Uuid,
        id: i64,
    },

    /// A message changed read state
    MessageUpdate {
        client_id: Uuid,
        diet_id: Uuid,
        id: i64,
        is_read: bool,
        read_at: Option<DateTime<Utc>>,
    },

    /// A command was rejected
    Error { message: String },
}

impl RealtimeEvent {
    /// Returns the conversation this event is scoped to.
    /// Events that return `None` are connection-level and always delivered.
    pub fn conversation(&self) -> Option<ConversationKey> {
        match self {
            Self::MessageInsert { client_id, diet_id, .. }
            | Self::MessageUpdate { client_id, diet_id, .. } => {
                Some(ConversationKey::new(*client_id, *diet_id))
            }
            _ => None,
        }
    }
}

/// Commands sent FROM client TO server over the realtime socket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all_fields = "camelCase")]
pub enum RealtimeCommand {
    /// Authenticate the connection
    Identify { token: String },

    /// Start receiving events for one conversation
    Subscribe { client_id: Uuid, diet_id: Uuid },

    /// Stop receiving events for one conversation
    Unsubscribe { client_id: Uuid, diet_id: Uuid },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_events_are_conversation_scoped() {
        let key = ConversationKey::new(Uuid::new_v4(), Uuid::new_v4());
        let insert = RealtimeEvent::MessageInsert {
            client_id: key.client_id,
            diet_id: key.diet_id,
            id: 7,
        };
        assert_eq!(insert.conversation(), Some(key));

        let ready = RealtimeEvent::Ready { user_id: Uuid::new_v4() };
        assert_eq!(ready.conversation(), None);
    }

    #[test]
    fn wire_shape_uses_type_and_data() {
        let cmd: RealtimeCommand = serde_json::from_str(
            r#"{"type":"Subscribe","data":{"clientId":"00000000-0000-0000-0000-000000000001","dietId":"00000000-0000-0000-0000-000000000002"}}"#,
        )
        .unwrap();
        match cmd {
            RealtimeCommand::Subscribe { client_id, diet_id } => {
                assert_eq!(client_id.as_u128(), 1);
                assert_eq!(diet_id.as_u128(), 2);
            }
            other => panic!("unexpected command {:?}", other),
        }

        let json = serde_json::to_value(RealtimeEvent::MessageUpdate {
            client_id: Uuid::nil(),
            diet_id: Uuid::nil(),
            id: 3,
            is_read: true,
            read_at: None,
        })
        .unwrap();
        assert_eq!(json["type"], "MessageUpdate");
        assert_eq!(json["data"]["isRead"], true);
    }
}
