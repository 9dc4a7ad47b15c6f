use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Prefix of client-allocated message ids. Authoritative ids never carry it.
pub const OPTIMISTIC_PREFIX: &str = "temp-";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    pub id: String,
    pub name: String,
}

impl Participant {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Participant {
            id: id.into(),
            name: name.into(),
        }
    }
}

/// A conversation scope. Rooms are created elsewhere and never mutated here.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Room {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub is_direct: bool,
    #[serde(default)]
    pub participants: Vec<Participant>,
}

impl Room {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Room {
            id: id.into(),
            name: name.into(),
            is_direct: false,
            participants: Vec::new(),
        }
    }

    pub fn with_participants(mut self, participants: Vec<Participant>) -> Self {
        self.participants = participants;
        self
    }

    pub fn participant(&self, participant_id: &str) -> Option<&Participant> {
        self.participants.iter().find(|p| p.id == participant_id)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    #[default]
    Message,
    System,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParticipantSummary {
    pub id: String,
    pub name: String,
}

impl From<&Participant> for ParticipantSummary {
    fn from(participant: &Participant) -> Self {
        ParticipantSummary {
            id: participant.id.clone(),
            name: participant.name.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub room_id: String,
    #[serde(default)]
    pub participant_id: String,
    pub text: String,
    #[serde(default)]
    pub kind: MessageKind,
    #[serde(default)]
    pub deleted: bool,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub participant: Option<ParticipantSummary>,
    /// Idempotency key chosen by the sender and echoed back by the server.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_key: Option<String>,
}

impl Message {
    pub fn is_optimistic(&self) -> bool {
        self.id.starts_with(OPTIMISTIC_PREFIX)
    }

    pub fn author_name(&self) -> Option<&str> {
        self.participant.as_ref().map(|p| p.name.as_str())
    }
}

/// What the user typed, before it has an id.
#[derive(Debug, Clone)]
pub struct Draft {
    pub room_id: String,
    pub author: ParticipantSummary,
    pub text: String,
}
