//! Client-side synchronization core for room chat.
//!
//! [`ConnectionManager`] owns the live socket, [`RoomSession`] drives one
//! room at a time, and [`MessageReconciler`] merges history, pushed messages
//! and optimistic local echoes into a single timeline.

pub mod config;
pub mod connection;
pub mod error;
pub mod history;
pub mod messages;
pub mod presence;
pub mod reconciler;
pub mod room;
pub mod session;
pub mod typing;

pub use config::ClientConfig;
pub use connection::{ConnectionManager, ConnectionState, ErrorSink, EventRouter, Subscription, Transport};
pub use error::{Result, SyncError};
pub use history::{HistorySource, RestHistory};
pub use messages::{ClientMessage, ServerEvent};
pub use presence::PresenceTracker;
pub use reconciler::{MessageReconciler, PushOutcome};
pub use room::{Draft, Message, MessageKind, Participant, ParticipantSummary, Room};
pub use session::{RoomSession, SessionState, SessionUpdate};
pub use typing::TypingIndicator;
