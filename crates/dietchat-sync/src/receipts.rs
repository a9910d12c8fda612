//! Batches read receipts for messages the viewer has had on screen.

use std::collections::BTreeSet;

use uuid::Uuid;

use dietchat_types::models::Message;

/// Collects ids of unread messages from the other party so they can be
/// marked read in one call after a dwell.
///
/// An id moves `pending -> in flight -> handled`. Handled ids are never
/// queued again, however many times the same message is observed. A batch
/// that fails goes back to pending.
#[derive(Debug)]
pub struct ReceiptBatcher {
    viewer: Uuid,
    pending: BTreeSet<i64>,
    in_flight: BTreeSet<i64>,
    handled: BTreeSet<i64>,
}

impl ReceiptBatcher {
    pub fn new(viewer: Uuid) -> Self {
        Self {
            viewer,
            pending: BTreeSet::new(),
            in_flight: BTreeSet::new(),
            handled: BTreeSet::new(),
        }
    }

    /// Queue every unread message not authored by the viewer. Returns true
    /// when something new was queued, meaning a dwell should be armed.
    pub fn observe<'a>(&mut self, messages: impl IntoIterator<Item = &'a Message>) -> bool {
        let mut queued = false;
        for message in messages {
            if message.is_read || message.sender_id == self.viewer {
                continue;
            }
            let id = message.id;
            if self.handled.contains(&id) || self.in_flight.contains(&id) {
                continue;
            }
            queued |= self.pending.insert(id);
        }
        queued
    }

    /// Drain everything pending, sorted ascending. `None` when empty.
    pub fn take_batch(&mut self) -> Option<Vec<i64>> {
        if self.pending.is_empty() {
            return None;
        }
        let batch: Vec<i64> = std::mem::take(&mut self.pending).into_iter().collect();
        self.in_flight.extend(batch.iter().copied());
        Some(batch)
    }

    /// The server accepted the batch.
    pub fn confirm(&mut self, ids: &[i64]) {
        for id in ids {
            self.in_flight.remove(id);
            self.handled.insert(*id);
        }
    }

    /// The batch failed; queue it again for the next dwell.
    pub fn requeue(&mut self, ids: &[i64]) {
        for id in ids {
            if self.in_flight.remove(id) {
                self.pending.insert(*id);
            }
        }
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }
}
