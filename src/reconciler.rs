//! Merges history, live pushes and optimistic echoes into one timeline.

use std::collections::HashMap;

use chrono::Utc;
use log::debug;
use uuid::Uuid;

use crate::room::{Draft, Message, MessageKind, OPTIMISTIC_PREFIX};

/// Result of applying a pushed message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushOutcome {
    /// Already present; redelivery.
    Duplicate,
    /// Replaced the optimistic echo `temp_id` in place.
    Promoted { temp_id: String },
    Appended,
}

/// Per-room timeline. Entries keep their insertion slot; ordering by
/// `created_at` happens only in [`MessageReconciler::snapshot`].
#[derive(Debug, Default)]
pub struct MessageReconciler {
    entries: Vec<Message>,
    by_id: HashMap<String, usize>,
    /// client key -> slot of the still-unconfirmed echo
    pending: HashMap<String, usize>,
    last_optimistic_ms: i64,
}

impl MessageReconciler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&Message> {
        self.by_id.get(id).map(|&slot| &self.entries[slot])
    }

    /// Echoes still waiting for their authoritative counterpart.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Inserts a history batch. Ids already in the timeline are left
    /// untouched, so applying the same batch twice is a no-op. Returns how
    /// many entries were added or promoted.
    pub fn insert_history_batch<I>(&mut self, batch: I) -> usize
    where
        I: IntoIterator<Item = Message>,
    {
        let mut changed = 0;
        for message in batch {
            if self.by_id.contains_key(&message.id) {
                continue;
            }
            if self.promote(message.clone()).is_none() {
                self.push(message);
            }
            changed += 1;
        }
        changed
    }

    /// Inserts an optimistic echo for `draft` and returns it.
    pub fn apply_local_echo(&mut self, draft: Draft) -> Message {
        let now = Utc::now();
        let mut stamp = now.timestamp_millis().max(self.last_optimistic_ms + 1);
        while self.by_id.contains_key(&format!("{OPTIMISTIC_PREFIX}{stamp}")) {
            stamp += 1;
        }
        self.last_optimistic_ms = stamp;

        let client_key = Uuid::new_v4().to_string();
        let message = Message {
            id: format!("{OPTIMISTIC_PREFIX}{stamp}"),
            room_id: draft.room_id,
            participant_id: draft.author.id.clone(),
            text: draft.text,
            kind: MessageKind::Message,
            deleted: false,
            created_at: now,
            participant: Some(draft.author),
            client_key: Some(client_key.clone()),
        };

        let slot = self.push(message.clone());
        self.pending.insert(client_key, slot);
        debug!("Optimistic echo {} queued", message.id);
        message
    }

    pub fn apply_pushed_message(&mut self, message: Message) -> PushOutcome {
        if self.by_id.contains_key(&message.id) {
            return PushOutcome::Duplicate;
        }
        if let Some(temp_id) = self.promote(message.clone()) {
            return PushOutcome::Promoted { temp_id };
        }
        self.push(message);
        PushOutcome::Appended
    }

    /// Marks the entry deleted without removing it. Returns `false` when the
    /// id is unknown or the entry was already a tombstone.
    pub fn mark_deleted(&mut self, message_id: &str) -> bool {
        match self.by_id.get(message_id) {
            Some(&slot) if !self.entries[slot].deleted => {
                self.entries[slot].deleted = true;
                true
            }
            _ => false,
        }
    }

    /// Entries ordered by `created_at`; ties keep their timeline slot order.
    pub fn snapshot(&self) -> Vec<Message> {
        let mut ordered = self.entries.clone();
        ordered.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        ordered
    }

    fn push(&mut self, message: Message) -> usize {
        let slot = self.entries.len();
        self.by_id.insert(message.id.clone(), slot);
        self.entries.push(message);
        slot
    }

    /// Swaps the echo whose client key matches `message` for `message`,
    /// keeping its slot. Each key promotes at most once.
    fn promote(&mut self, message: Message) -> Option<String> {
        let key = message.client_key.as_deref()?;
        let slot = self.pending.remove(key)?;

        let temp_id = std::mem::replace(&mut self.entries[slot], message).id;
        self.by_id.remove(&temp_id);
        self.by_id.insert(self.entries[slot].id.clone(), slot);
        debug!("Promoted {} to {}", temp_id, self.entries[slot].id);
        Some(temp_id)
    }
}
