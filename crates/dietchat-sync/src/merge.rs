//! Reconciling messages from every arrival path (bulk load, realtime event,
//! poll, optimistic send) into one list.
//!
//! The list is sorted ascending by id and holds each id once. Merging the
//! same message twice leaves the list unchanged, so the order in which the
//! paths deliver does not matter.

use chrono::{DateTime, Utc};

use dietchat_types::models::Message;

/// Merge `incoming` into `current`. Returns how many ids were new.
///
/// A message already present keeps its place; the incoming copy only
/// upgrades the read state (a message never goes back to unread) and fills
/// in photos the local copy did not have.
pub fn merge(current: &mut Vec<Message>, incoming: impl IntoIterator<Item = Message>) -> usize {
    let mut added = 0;
    for message in incoming {
        match current.binary_search_by_key(&message.id, |m| m.id) {
            Ok(idx) => absorb(&mut current[idx], message),
            Err(idx) => {
                current.insert(idx, message);
                added += 1;
            }
        }
    }
    added
}

/// Apply a read-state update to the message with `id`, if present. Only the
/// read fields change. Returns true when the local copy changed.
pub fn apply_read_update(
    current: &mut [Message],
    id: i64,
    is_read: bool,
    read_at: Option<DateTime<Utc>>,
) -> bool {
    let Ok(idx) = current.binary_search_by_key(&id, |m| m.id) else {
        return false;
    };
    let message = &mut current[idx];
    if message.is_read || !is_read {
        return false;
    }
    message.is_read = true;
    message.read_at = read_at.or(message.read_at);
    true
}

/// Highest id in the list, the cursor for the next incremental fetch.
pub fn max_id(current: &[Message]) -> Option<i64> {
    current.last().map(|m| m.id)
}

fn absorb(existing: &mut Message, incoming: Message) {
    if incoming.is_read && !existing.is_read {
        existing.is_read = true;
        existing.read_at = incoming.read_at;
    }
    if existing.photos.is_empty() && !incoming.photos.is_empty() {
        existing.photos = incoming.photos;
    }
}
