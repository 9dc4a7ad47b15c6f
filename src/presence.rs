use std::collections::HashSet;

/// Participants believed online. Only as fresh as the last event seen; a
/// dropped connection does not mark anyone offline.
#[derive(Debug, Default)]
pub struct PresenceTracker {
    online: HashSet<String>,
}

impl PresenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` if the participant was not already online.
    pub fn mark_online(&mut self, participant_id: &str) -> bool {
        self.online.insert(participant_id.to_string())
    }

    /// Unknown participants are ignored. Returns `true` if one was removed.
    pub fn mark_offline(&mut self, participant_id: &str) -> bool {
        self.online.remove(participant_id)
    }

    pub fn is_online(&self, participant_id: &str) -> bool {
        self.online.contains(participant_id)
    }

    pub fn online(&self) -> impl Iterator<Item = &str> {
        self.online.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.online.len()
    }

    pub fn is_empty(&self) -> bool {
        self.online.is_empty()
    }
}
