use std::collections::{HashMap, HashSet};
use std::future::poll_fn;
use std::time::Duration;

use tokio_util::time::delay_queue::{DelayQueue, Key};

pub const DEFAULT_TYPING_EXPIRY: Duration = Duration::from_secs(3);

/// Participants currently composing. Each entry owns one timer in the
/// queue; a new pulse resets it, so only silence clears the entry.
#[derive(Debug)]
pub struct TypingIndicator {
    expiry: Duration,
    timers: HashMap<String, Key>,
    queue: DelayQueue<String>,
}

impl Default for TypingIndicator {
    fn default() -> Self {
        Self::new(DEFAULT_TYPING_EXPIRY)
    }
}

impl TypingIndicator {
    pub fn new(expiry: Duration) -> Self {
        TypingIndicator {
            expiry,
            timers: HashMap::new(),
            queue: DelayQueue::new(),
        }
    }

    /// Returns `true` if the participant was not typing before.
    pub fn pulse(&mut self, participant_id: &str) -> bool {
        if let Some(key) = self.timers.get(participant_id) {
            self.queue.reset(key, self.expiry);
            return false;
        }
        let key = self.queue.insert(participant_id.to_string(), self.expiry);
        self.timers.insert(participant_id.to_string(), key);
        true
    }

    pub fn contains(&self, participant_id: &str) -> bool {
        self.timers.contains_key(participant_id)
    }

    pub fn snapshot(&self) -> HashSet<String> {
        self.timers.keys().cloned().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.timers.is_empty()
    }

    /// Waits for the next timer to fire and removes its participant.
    /// Resolves to `None` immediately when nobody is typing.
    pub async fn next_expired(&mut self) -> Option<String> {
        let expired = poll_fn(|cx| self.queue.poll_expired(cx)).await?;
        let participant_id = expired.into_inner();
        self.timers.remove(&participant_id);
        Some(participant_id)
    }

    /// Cancels every pending timer.
    pub fn clear(&mut self) {
        self.queue.clear();
        self.timers.clear();
    }
}
