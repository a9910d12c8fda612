use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Which side of the conversation a user is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Client,
    Dietitian,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Client => "client",
            Self::Dietitian => "dietitian",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "client" => Ok(Self::Client),
            "dietitian" => Ok(Self::Dietitian),
            other => Err(format!("unknown role '{}'", other)),
        }
    }
}

/// A thread is identified by the client and the diet plan it is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationKey {
    pub client_id: Uuid,
    pub diet_id: Uuid,
}

impl ConversationKey {
    pub fn new(client_id: Uuid, diet_id: Uuid) -> Self {
        Self { client_id, diet_id }
    }
}

impl fmt::Display for ConversationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.client_id, self.diet_id)
    }
}

/// The two users linked to a client record. Either side may be unlinked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Participants {
    pub client_user_id: Option<Uuid>,
    pub dietitian_user_id: Option<Uuid>,
}

impl Participants {
    pub fn includes(&self, user_id: Uuid) -> bool {
        self.client_user_id == Some(user_id) || self.dietitian_user_id == Some(user_id)
    }

    /// The party on the other side of `user_id`, if linked.
    pub fn other_party(&self, user_id: Uuid) -> Option<Uuid> {
        if self.client_user_id == Some(user_id) {
            self.dietitian_user_id
        } else if self.dietitian_user_id == Some(user_id) {
            self.client_user_id
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Photo {
    pub id: i64,
    pub image_data: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: i64,
    pub client_id: Uuid,
    pub diet_id: Uuid,
    pub sender_id: Uuid,
    pub sender_role: Role,
    pub sender_name: String,
    pub content: String,
    pub meal_tag_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub is_read: bool,
    pub read_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub photos: Vec<Photo>,
}

impl Message {
    pub fn key(&self) -> ConversationKey {
        ConversationKey::new(self.client_id, self.diet_id)
    }
}
