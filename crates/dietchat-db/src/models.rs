//! SQLite row shapes. Kept apart from the dietchat-types API models so the
//! storage layer can change without touching the wire format.

/// Linked users of a client record, resolved through a (client, diet) pair.
pub struct ParticipantsRow {
    pub client_user_id: Option<String>,
    pub dietitian_user_id: Option<String>,
}

pub struct NewMessage<'a> {
    pub client_id: &'a str,
    pub diet_id: &'a str,
    pub sender_id: &'a str,
    pub sender_role: &'a str,
    pub content: &'a str,
    pub meal_tag_id: Option<&'a str>,
}

pub struct MessageRow {
    pub id: i64,
    pub client_id: String,
    pub diet_id: String,
    pub sender_id: String,
    pub sender_role: String,
    pub sender_name: String,
    pub content: String,
    pub meal_tag_id: Option<String>,
    pub created_at: String,
    pub is_read: bool,
    pub read_at: Option<String>,
}

pub struct PhotoRow {
    pub id: i64,
    pub message_id: i64,
    pub image_data: String,
    pub created_at: String,
    pub expires_at: String,
}

pub struct PresenceRow {
    pub user_id: String,
    pub is_active: bool,
    pub source: String,
    pub last_active_at: String,
}

pub struct WebSubscriptionRow {
    pub id: i64,
    pub user_id: String,
    pub endpoint: String,
    pub p256dh: String,
    pub auth: String,
}
