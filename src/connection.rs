//! The single live connection of a session.
//!
//! A background driver task owns the WebSocket. It serialises queued
//! [`ClientMessage`]s, routes decoded [`ServerEvent`]s to the one active room
//! [`Subscription`], and reconnects with exponential backoff when the peer
//! drops. Errors raised on the driver are reported through the caller's
//! [`ErrorSink`] since no caller is on the stack to receive them.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use rand::Rng;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{header::AUTHORIZATION, HeaderValue, StatusCode};
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use crate::config::{ClientConfig, ReconnectConfig};
use crate::error::{Result, SyncError};
use crate::messages::{ClientMessage, ServerEvent};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Receives errors raised asynchronously by the connection driver.
pub type ErrorSink = mpsc::UnboundedSender<SyncError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Connected,
    Reconnecting { attempt: u32 },
    Closed,
}

/// What a [`crate::session::RoomSession`] needs from the live channel.
pub trait Transport: Send + Sync {
    /// Queues a signal for delivery. Never waits on the network.
    fn signal(&self, message: ClientMessage) -> Result<()>;

    /// Routes events for `room_id` to the returned subscription, replacing
    /// any earlier subscription.
    fn subscribe(&self, room_id: &str) -> Subscription;
}

struct ActiveRoute {
    room_id: String,
    generation: u64,
    events: mpsc::UnboundedSender<ServerEvent>,
}

#[derive(Default)]
struct RouterState {
    next_generation: u64,
    active: Option<ActiveRoute>,
}

/// Delivers incoming events to at most one room subscription.
#[derive(Clone, Default)]
pub struct EventRouter {
    state: Arc<Mutex<RouterState>>,
}

impl EventRouter {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, RouterState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn subscribe(&self, room_id: &str) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.lock();
        state.next_generation += 1;
        let generation = state.next_generation;
        if let Some(previous) = state.active.replace(ActiveRoute {
            room_id: room_id.to_string(),
            generation,
            events: tx,
        }) {
            debug!("Subscription for room {} superseded", previous.room_id);
        }
        Subscription {
            room_id: room_id.to_string(),
            generation,
            events: rx,
            router: self.clone(),
        }
    }

    /// Forwards `event` if it belongs to the subscribed room. Session-wide
    /// events always go to the active subscription.
    pub fn dispatch(&self, event: ServerEvent) -> bool {
        let state = self.lock();
        let Some(active) = state.active.as_ref() else {
            return false;
        };
        if let Some(room_id) = event.room_id() {
            if room_id != active.room_id {
                debug!("Dropping event for inactive room {}", room_id);
                return false;
            }
        }
        active.events.send(event).is_ok()
    }

    pub fn active_room(&self) -> Option<String> {
        self.lock().active.as_ref().map(|a| a.room_id.clone())
    }

    pub fn subscription_count(&self) -> usize {
        usize::from(self.lock().active.is_some())
    }

    fn release(&self, generation: u64) {
        let mut state = self.lock();
        if state.active.as_ref().is_some_and(|a| a.generation == generation) {
            state.active = None;
        }
    }
}

/// Room-scoped event stream. Dropping it unsubscribes.
pub struct Subscription {
    room_id: String,
    generation: u64,
    events: mpsc::UnboundedReceiver<ServerEvent>,
    router: EventRouter,
}

impl Subscription {
    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    /// `None` once the subscription has been superseded.
    pub async fn recv(&mut self) -> Option<ServerEvent> {
        self.events.recv().await
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.router.release(self.generation);
    }
}

pub struct ConnectionManager {
    outbound: mpsc::UnboundedSender<ClientMessage>,
    router: EventRouter,
    state: watch::Receiver<ConnectionState>,
    shutdown: Option<oneshot::Sender<()>>,
    driver: Option<JoinHandle<()>>,
}

impl ConnectionManager {
    /// Opens the session's connection, retrying per `config.reconnect`.
    /// Authentication failures are returned immediately.
    pub async fn connect(config: ClientConfig, errors: ErrorSink) -> Result<Self> {
        let (state_tx, state_rx) = watch::channel(ConnectionState::Connecting);
        let socket = match open(&config).await {
            Ok(socket) => socket,
            Err(e @ SyncError::Auth(_)) => return Err(e),
            Err(e) => {
                warn!("Initial connection failed: {}", e);
                match reconnect(&config, &state_tx, None).await {
                    Reconnect::Connected(socket) => socket,
                    Reconnect::Failed(e) | Reconnect::Aborted(e) => return Err(e),
                }
            }
        };
        info!("Connected to {}", config.ws_url);
        state_tx.send_replace(ConnectionState::Connected);

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let router = EventRouter::new();

        let driver = Driver {
            config,
            outbox: Outbox::new(outbound_rx),
            router: router.clone(),
            errors,
            state: state_tx,
            shutdown: shutdown_rx,
        };
        let handle = tokio::spawn(driver.run(socket));

        Ok(ConnectionManager {
            outbound: outbound_tx,
            router,
            state: state_rx,
            shutdown: Some(shutdown_tx),
            driver: Some(handle),
        })
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    pub fn router(&self) -> &EventRouter {
        &self.router
    }

    /// Closes the socket and waits for the driver to stop.
    pub async fn close(mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Some(driver) = self.driver.take() {
            if let Err(e) = driver.await {
                error!("Connection driver panicked: {}", e);
            }
        }
    }
}

impl Transport for ConnectionManager {
    fn signal(&self, message: ClientMessage) -> Result<()> {
        self.outbound
            .send(message)
            .map_err(|_| SyncError::Send("connection driver has stopped".to_string()))
    }

    fn subscribe(&self, room_id: &str) -> Subscription {
        self.router.subscribe(room_id)
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
    }
}

async fn open(config: &ClientConfig) -> Result<Socket> {
    let mut request = config.ws_url.as_str().into_client_request()?;
    if let Some(token) = &config.token {
        let value = HeaderValue::from_str(&format!("Bearer {token}"))
            .map_err(|e| SyncError::Auth(format!("unusable token: {e}")))?;
        request.headers_mut().insert(AUTHORIZATION, value);
    }

    match connect_async(request).await {
        Ok((socket, _)) => Ok(socket),
        Err(tungstenite::Error::Http(response))
            if matches!(
                response.status(),
                StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN
            ) =>
        {
            Err(SyncError::Auth(format!(
                "handshake rejected with {}",
                response.status()
            )))
        }
        Err(e) => Err(e.into()),
    }
}

fn jittered(policy: &ReconnectConfig, attempt: u32) -> Duration {
    let base = policy.base_delay(attempt);
    let spread = u64::try_from(base.as_millis() / 4).unwrap_or(0);
    if spread == 0 {
        return base;
    }
    base + Duration::from_millis(rand::thread_rng().gen_range(0..=spread))
}

enum Reconnect {
    Connected(Socket),
    /// Attempts exhausted or authentication rejected.
    Failed(SyncError),
    /// Shutdown requested while waiting.
    Aborted(SyncError),
}

async fn reconnect(
    config: &ClientConfig,
    state: &watch::Sender<ConnectionState>,
    mut shutdown: Option<&mut oneshot::Receiver<()>>,
) -> Reconnect {
    let policy = &config.reconnect;
    for attempt in 1..=policy.max_attempts {
        state.send_replace(ConnectionState::Reconnecting { attempt });
        let delay = jittered(policy, attempt);
        debug!("Reconnect attempt {} in {:?}", attempt, delay);

        match shutdown.as_deref_mut() {
            Some(shutdown) => {
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = shutdown => return Reconnect::Aborted(SyncError::Closed),
                }
            }
            None => tokio::time::sleep(delay).await,
        }

        match open(config).await {
            Ok(socket) => return Reconnect::Connected(socket),
            Err(e @ SyncError::Auth(_)) => return Reconnect::Failed(e),
            Err(e) => warn!("Reconnect attempt {} failed: {}", attempt, e),
        }
    }
    Reconnect::Failed(SyncError::ReconnectExhausted {
        attempts: policy.max_attempts,
    })
}

enum Closed {
    ByClient,
    ByPeer,
}

/// Outgoing signals. A signal whose write failed is held back and goes out
/// first on the next connection.
struct Outbox {
    queue: mpsc::UnboundedReceiver<ClientMessage>,
    pending: Option<ClientMessage>,
}

impl Outbox {
    fn new(queue: mpsc::UnboundedReceiver<ClientMessage>) -> Self {
        Outbox {
            queue,
            pending: None,
        }
    }

    /// `None` once every sender is gone and nothing is held back.
    async fn next(&mut self) -> Option<ClientMessage> {
        if let Some(message) = self.pending.take() {
            return Some(message);
        }
        self.queue.recv().await
    }

    fn hold(&mut self, message: ClientMessage) {
        self.pending = Some(message);
    }
}

struct Driver {
    config: ClientConfig,
    outbox: Outbox,
    router: EventRouter,
    errors: ErrorSink,
    state: watch::Sender<ConnectionState>,
    shutdown: oneshot::Receiver<()>,
}

impl Driver {
    async fn run(mut self, mut socket: Socket) {
        loop {
            if let Closed::ByClient = self.pump(&mut socket).await {
                break;
            }

            warn!("Connection to {} lost", self.config.ws_url);
            match reconnect(&self.config, &self.state, Some(&mut self.shutdown)).await {
                Reconnect::Connected(fresh) => {
                    info!("Reconnected to {}", self.config.ws_url);
                    socket = fresh;
                    self.state.send_replace(ConnectionState::Connected);
                    self.rejoin(&mut socket).await;
                }
                Reconnect::Aborted(_) => break,
                Reconnect::Failed(e) => {
                    error!("Giving up on connection: {}", e);
                    let _ = self.errors.send(e);
                    break;
                }
            }
        }
        self.state.send_replace(ConnectionState::Closed);
        info!("Connection closed");
    }

    /// Presence is not restored here; it refills from later events.
    async fn rejoin(&self, socket: &mut Socket) {
        let Some(room_id) = self.router.active_room() else {
            return;
        };
        let join = ClientMessage::JoinRoom {
            participant_id: self.config.participant.id.clone(),
            room_id,
        };
        if let Err(e) = send_json(socket, &join).await {
            warn!("Failed to rejoin room: {}", e);
        }
    }

    async fn pump(&mut self, socket: &mut Socket) -> Closed {
        loop {
            tokio::select! {
                _ = &mut self.shutdown => {
                    if let Err(e) = socket.close(None).await {
                        debug!("Close handshake failed: {}", e);
                    }
                    return Closed::ByClient;
                }
                outgoing = self.outbox.next() => {
                    let Some(message) = outgoing else {
                        let _ = socket.close(None).await;
                        return Closed::ByClient;
                    };
                    if let Err(e) = send_json(socket, &message).await {
                        warn!("Failed to send {:?}, holding it for the next connection: {}", message, e);
                        self.outbox.hold(message);
                        return Closed::ByPeer;
                    }
                }
                incoming = socket.next() => match incoming {
                    Some(Ok(Message::Text(text))) => self.handle_text(text.as_str()),
                    Some(Ok(Message::Close(frame))) => {
                        debug!("Peer closed the connection: {:?}", frame);
                        return Closed::ByPeer;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!("WebSocket error: {}", e);
                        return Closed::ByPeer;
                    }
                    None => return Closed::ByPeer,
                },
            }
        }
    }

    fn handle_text(&self, text: &str) {
        match serde_json::from_str::<ServerEvent>(text) {
            Ok(ServerEvent::Error { message }) => {
                error!("Server error: {}", message);
                let _ = self.errors.send(SyncError::Server(message));
            }
            Ok(event) => {
                self.router.dispatch(event);
            }
            Err(e) => warn!("Ignoring malformed event: {}", e),
        }
    }
}

async fn send_json(socket: &mut Socket, message: &ClientMessage) -> Result<()> {
    let text = serde_json::to_string(message)?;
    socket.send(Message::text(text)).await?;
    Ok(())
}
