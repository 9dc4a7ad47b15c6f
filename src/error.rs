use thiserror::Error;
use tokio_tungstenite::tungstenite;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Transport error: {0}")]
    Transport(#[from] tungstenite::Error),
    #[error("Gave up reconnecting after {attempts} attempts")]
    ReconnectExhausted { attempts: u32 },
    #[error("Authentication rejected: {0}")]
    Auth(String),
    #[error("Failed to load history for room {room_id}: {reason}")]
    Fetch { room_id: String, reason: String },
    #[error("Send failed: {0}")]
    Send(String),
    #[error("Connection closed")]
    Closed,
    #[error("No room is selected")]
    NoActiveRoom,
    #[error("Message {0} has not been confirmed by the server yet")]
    Unconfirmed(String),
    #[error("Server reported: {0}")]
    Server(String),
    #[error("Invalid configuration: {0}")]
    Config(#[from] config::ConfigError),
    #[error("Malformed payload: {0}")]
    Json(#[from] serde_json::Error),
}

impl SyncError {
    /// Errors after which the connection must not be retried.
    pub fn is_fatal(&self) -> bool {
        matches!(self, SyncError::Auth(_) | SyncError::ReconnectExhausted { .. })
    }

    /// Only authentication and room-load failures are shown to the user;
    /// everything else is logged.
    pub fn is_user_visible(&self) -> bool {
        matches!(self, SyncError::Auth(_) | SyncError::Fetch { .. })
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;
