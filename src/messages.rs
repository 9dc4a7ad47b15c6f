use serde::{Deserialize, Serialize};

use crate::room::{Message, ParticipantSummary};

/// Signals sent to the backend over the live connection.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(tag = "type", rename_all_fields = "camelCase")]
pub enum ClientMessage {
    #[serde(rename = "join_room")]
    JoinRoom {
        participant_id: String,
        room_id: String,
    },
    #[serde(rename = "send_message")]
    SendMessage {
        room_id: String,
        text: String,
        client_key: String,
    },
    #[serde(rename = "delete_message")]
    DeleteMessage {
        message_id: String,
        room_id: String,
    },
    #[serde(rename = "typing")]
    Typing { room_id: String },
}

/// Events pushed by the backend.
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(tag = "type", rename_all_fields = "camelCase")]
pub enum ServerEvent {
    #[serde(rename = "new_message")]
    NewMessage { message: Message },
    #[serde(rename = "message_history")]
    MessageHistory {
        room_id: String,
        messages: Vec<Message>,
    },
    #[serde(rename = "typing")]
    Typing {
        room_id: String,
        participant_id: String,
    },
    #[serde(rename = "message_deleted")]
    MessageDeleted {
        room_id: String,
        message_id: String,
    },
    #[serde(rename = "user_joined")]
    ParticipantJoined {
        room_id: String,
        participant: ParticipantSummary,
    },
    #[serde(rename = "user_left")]
    ParticipantLeft {
        room_id: String,
        participant_id: String,
    },
    #[serde(rename = "user_offline")]
    ParticipantOffline { participant_id: String },
    #[serde(rename = "error")]
    Error { message: String },
}

impl ServerEvent {
    /// Room the event is scoped to. `None` for session-wide events.
    pub fn room_id(&self) -> Option<&str> {
        match self {
            ServerEvent::NewMessage { message } => Some(&message.room_id),
            ServerEvent::MessageHistory { room_id, .. }
            | ServerEvent::Typing { room_id, .. }
            | ServerEvent::MessageDeleted { room_id, .. }
            | ServerEvent::ParticipantJoined { room_id, .. }
            | ServerEvent::ParticipantLeft { room_id, .. } => Some(room_id),
            ServerEvent::ParticipantOffline { .. } | ServerEvent::Error { .. } => None,
        }
    }
}
