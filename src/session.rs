//! One active room: join, history load, live events, teardown.
//!
//! All per-room state lives in [`RoomState`] and is dropped as a unit when
//! the room changes. Dropping it releases the event [`Subscription`], cancels
//! typing timers and discards any history fetch still in flight, so a late
//! result can never land in another room's timeline.

use std::collections::HashSet;

use futures_util::future::{try_join, BoxFuture};
use log::{debug, error, info, warn};
use tokio::time::Instant;

use crate::config::TypingConfig;
use crate::connection::{Subscription, Transport};
use crate::error::{Result, SyncError};
use crate::history::HistorySource;
use crate::messages::{ClientMessage, ServerEvent};
use crate::presence::PresenceTracker;
use crate::reconciler::{MessageReconciler, PushOutcome};
use crate::room::{Draft, Message, Participant, Room, OPTIMISTIC_PREFIX};
use crate::typing::TypingIndicator;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Joining,
    Active,
    TornDown,
}

/// What changed after [`RoomSession::next_update`].
#[derive(Debug)]
pub enum SessionUpdate {
    HistoryLoaded { added: usize },
    /// The room stays `Joining`; see [`RoomSession::retry_history`].
    LoadFailed(SyncError),
    HistoryMerged { added: usize },
    MessageAdded(String),
    MessagePromoted { temp_id: String, id: String },
    MessageDeleted(String),
    PresenceChanged { participant_id: String, online: bool },
    TypingChanged,
}

type HistoryLoad<'c> = BoxFuture<'c, Result<(Vec<Message>, Vec<Message>)>>;

struct RoomState<'c> {
    room: Room,
    subscription: Subscription,
    timeline: MessageReconciler,
    presence: PresenceTracker,
    typing: TypingIndicator,
    history: Option<HistoryLoad<'c>>,
    last_typing_signal: Option<Instant>,
}

impl RoomState<'_> {
    fn apply(&mut self, event: ServerEvent, me: &str) -> Option<SessionUpdate> {
        match event {
            ServerEvent::NewMessage { message } => {
                let id = message.id.clone();
                match self.timeline.apply_pushed_message(message) {
                    PushOutcome::Duplicate => {
                        debug!("Duplicate delivery of {}", id);
                        None
                    }
                    PushOutcome::Promoted { temp_id } => {
                        Some(SessionUpdate::MessagePromoted { temp_id, id })
                    }
                    PushOutcome::Appended => Some(SessionUpdate::MessageAdded(id)),
                }
            }
            ServerEvent::MessageHistory { messages, .. } => {
                let added = self.timeline.insert_history_batch(messages);
                (added > 0).then_some(SessionUpdate::HistoryMerged { added })
            }
            ServerEvent::Typing { participant_id, .. } => {
                if participant_id == me {
                    return None;
                }
                self.typing
                    .pulse(&participant_id)
                    .then_some(SessionUpdate::TypingChanged)
            }
            ServerEvent::MessageDeleted { message_id, .. } => self
                .timeline
                .mark_deleted(&message_id)
                .then_some(SessionUpdate::MessageDeleted(message_id)),
            ServerEvent::ParticipantJoined { participant, .. } => {
                self.presence
                    .mark_online(&participant.id)
                    .then(|| SessionUpdate::PresenceChanged {
                        participant_id: participant.id,
                        online: true,
                    })
            }
            ServerEvent::ParticipantLeft { participant_id, .. }
            | ServerEvent::ParticipantOffline { participant_id } => self
                .presence
                .mark_offline(&participant_id)
                .then(|| SessionUpdate::PresenceChanged {
                    participant_id,
                    online: false,
                }),
            ServerEvent::Error { message } => {
                warn!("Unexpected error event on room stream: {}", message);
                None
            }
        }
    }
}

enum Step {
    History(Result<(Vec<Message>, Vec<Message>)>),
    Event(ServerEvent),
    Expired(Option<String>),
    Closed,
}

async fn await_history(load: &mut Option<HistoryLoad<'_>>) -> Result<(Vec<Message>, Vec<Message>)> {
    match load.as_mut() {
        Some(load) => load.await,
        None => std::future::pending().await,
    }
}

/// Drives exactly one room at a time over an exclusively borrowed transport.
pub struct RoomSession<'c, T: Transport, H: HistorySource> {
    transport: &'c mut T,
    history: &'c H,
    me: Participant,
    typing: TypingConfig,
    state: SessionState,
    room: Option<RoomState<'c>>,
}

impl<'c, T: Transport, H: HistorySource> RoomSession<'c, T, H> {
    pub fn new(transport: &'c mut T, history: &'c H, me: Participant, typing: TypingConfig) -> Self {
        RoomSession {
            transport,
            history,
            me,
            typing,
            state: SessionState::Idle,
            room: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn room(&self) -> Option<&Room> {
        self.room.as_ref().map(|r| &r.room)
    }

    /// Leaves the current room, if any, then joins `room`: subscribes,
    /// signals the join and starts both history fetches.
    pub fn select_room(&mut self, room: Room) {
        self.teardown();

        info!("Joining room {} ({})", room.name, room.id);
        let subscription = self.transport.subscribe(&room.id);
        let join = ClientMessage::JoinRoom {
            participant_id: self.me.id.clone(),
            room_id: room.id.clone(),
        };
        if let Err(e) = self.transport.signal(join) {
            warn!("Join signal for room {} not sent: {}", room.id, e);
        }

        let history = Some(self.load_history(room.id.clone()));
        self.room = Some(RoomState {
            room,
            subscription,
            timeline: MessageReconciler::new(),
            presence: PresenceTracker::new(),
            typing: TypingIndicator::new(self.typing.expiry()),
            history,
            last_typing_signal: None,
        });
        self.state = SessionState::Joining;
    }

    /// Re-issues the history fetch after a `LoadFailed`.
    pub fn retry_history(&mut self) -> Result<()> {
        let room_id = match &self.room {
            Some(room) if self.state == SessionState::Joining && room.history.is_none() => {
                room.room.id.clone()
            }
            Some(_) => return Ok(()),
            None => return Err(SyncError::NoActiveRoom),
        };
        info!("Retrying history for room {}", room_id);
        let load = self.load_history(room_id);
        if let Some(room) = self.room.as_mut() {
            room.history = Some(load);
        }
        Ok(())
    }

    pub fn leave(&mut self) {
        self.teardown();
    }

    fn teardown(&mut self) {
        if let Some(mut room) = self.room.take() {
            room.typing.clear();
            info!(
                "Left room {} with {} messages",
                room.room.id,
                room.timeline.len()
            );
            self.state = SessionState::TornDown;
        }
    }

    fn load_history(&self, room_id: String) -> HistoryLoad<'c> {
        let source = self.history;
        Box::pin(async move {
            try_join(
                source.fetch_messages(&room_id),
                source.fetch_system_messages(&room_id),
            )
            .await
        })
    }

    /// Waits for the next change to the active room and applies it. Events
    /// that change nothing are absorbed. Returns `None` when no room is
    /// selected or the subscription was superseded.
    pub async fn next_update(&mut self) -> Option<SessionUpdate> {
        loop {
            let room = self.room.as_mut()?;
            let RoomState {
                subscription,
                typing,
                history,
                ..
            } = &mut *room;

            let step = tokio::select! {
                loaded = await_history(history), if history.is_some() => Step::History(loaded),
                event = subscription.recv() => event.map_or(Step::Closed, Step::Event),
                expired = typing.next_expired(), if !typing.is_empty() => Step::Expired(expired),
            };

            match step {
                Step::History(loaded) => {
                    room.history = None;
                    match loaded {
                        Ok((messages, notices)) => {
                            let added = room
                                .timeline
                                .insert_history_batch(messages.into_iter().chain(notices));
                            info!("Room {} active with {} messages", room.room.id, added);
                            self.state = SessionState::Active;
                            return Some(SessionUpdate::HistoryLoaded { added });
                        }
                        Err(e) => {
                            error!("Loading room {} failed: {}", room.room.id, e);
                            return Some(SessionUpdate::LoadFailed(e));
                        }
                    }
                }
                Step::Event(event) => {
                    if let Some(update) = room.apply(event, &self.me.id) {
                        return Some(update);
                    }
                }
                Step::Expired(Some(participant_id)) => {
                    debug!("{} stopped typing", participant_id);
                    return Some(SessionUpdate::TypingChanged);
                }
                Step::Expired(None) => {}
                Step::Closed => {
                    warn!("Subscription for room {} was superseded", room.room.id);
                    return None;
                }
            }
        }
    }

    /// Shows the message immediately and asks the backend to persist it.
    /// A failed signal leaves the echo in place, unconfirmed.
    pub fn send_message(&mut self, text: &str) -> Result<Message> {
        let room = self.room.as_mut().ok_or(SyncError::NoActiveRoom)?;
        let echo = room.timeline.apply_local_echo(Draft {
            room_id: room.room.id.clone(),
            author: (&self.me).into(),
            text: text.to_string(),
        });

        let signal = ClientMessage::SendMessage {
            room_id: echo.room_id.clone(),
            text: echo.text.clone(),
            client_key: echo.client_key.clone().unwrap_or_default(),
        };
        if let Err(e) = self.transport.signal(signal) {
            warn!("Message {} stays unconfirmed: {}", echo.id, e);
        }
        Ok(echo)
    }

    /// Requests soft deletion. The tombstone appears when the backend
    /// confirms with a `message_deleted` event.
    pub fn delete_message(&mut self, message_id: &str) -> Result<()> {
        let room = self.room.as_ref().ok_or(SyncError::NoActiveRoom)?;
        if message_id.starts_with(OPTIMISTIC_PREFIX) {
            return Err(SyncError::Unconfirmed(message_id.to_string()));
        }
        self.transport.signal(ClientMessage::DeleteMessage {
            message_id: message_id.to_string(),
            room_id: room.room.id.clone(),
        })
    }

    /// Tells the backend the user is composing. Returns whether a signal
    /// went out; calls within the configured interval are dropped.
    pub fn notify_typing(&mut self) -> Result<bool> {
        let room = self.room.as_mut().ok_or(SyncError::NoActiveRoom)?;
        let now = Instant::now();
        if let Some(last) = room.last_typing_signal {
            if now.duration_since(last) < self.typing.signal_interval() {
                return Ok(false);
            }
        }
        room.last_typing_signal = Some(now);
        self.transport.signal(ClientMessage::Typing {
            room_id: room.room.id.clone(),
        })?;
        Ok(true)
    }

    /// Timeline ordered for display. Empty when no room is selected.
    pub fn timeline(&self) -> Vec<Message> {
        self.room
            .as_ref()
            .map(|r| r.timeline.snapshot())
            .unwrap_or_default()
    }

    pub fn typing(&self) -> HashSet<String> {
        self.room
            .as_ref()
            .map(|r| r.typing.snapshot())
            .unwrap_or_default()
    }

    pub fn is_online(&self, participant_id: &str) -> bool {
        self.room
            .as_ref()
            .is_some_and(|r| r.presence.is_online(participant_id))
    }

    pub fn online_participants(&self) -> Vec<&Participant> {
        let Some(room) = self.room.as_ref() else {
            return Vec::new();
        };
        room.room
            .participants
            .iter()
            .filter(|p| room.presence.is_online(&p.id))
            .collect()
    }

    pub fn participant_name(&self, participant_id: &str) -> Option<&str> {
        self.room
            .as_ref()?
            .room
            .participant(participant_id)
            .map(|p| p.name.as_str())
    }
}
