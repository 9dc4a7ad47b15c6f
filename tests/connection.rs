use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use room_sync::config::{ReconnectConfig, TypingConfig};
use room_sync::{
    ClientConfig, ClientMessage, ConnectionManager, ConnectionState, Message, Participant,
    ServerEvent, SyncError, Transport,
};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{accept_async, accept_hdr_async, WebSocketStream};

const WAIT: Duration = Duration::from_secs(5);

type ServerSocket = WebSocketStream<TcpStream>;

async fn bind() -> (TcpListener, String) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}/ws", listener.local_addr().unwrap());
    (listener, url)
}

fn config(url: &str) -> ClientConfig {
    ClientConfig {
        ws_url: url.to_string(),
        api_url: "http://127.0.0.1:1/api".to_string(),
        token: None,
        participant: Participant::new("P1", "Ann"),
        reconnect: ReconnectConfig {
            max_attempts: 3,
            initial_delay_ms: 10,
            max_delay_ms: 50,
            backoff_factor: 2.0,
        },
        typing: TypingConfig::default(),
    }
}

async fn accept(listener: &TcpListener) -> ServerSocket {
    let (stream, _) = listener.accept().await.unwrap();
    accept_async(stream).await.unwrap()
}

async fn next_signal(ws: &mut ServerSocket) -> ClientMessage {
    loop {
        match ws.next().await.unwrap().unwrap() {
            WsMessage::Text(text) => return serde_json::from_str(text.as_str()).unwrap(),
            _ => continue,
        }
    }
}

async fn push(ws: &mut ServerSocket, event: &ServerEvent) {
    let text = serde_json::to_string(event).unwrap();
    ws.send(WsMessage::text(text)).await.unwrap();
}

fn new_message(id: &str, room_id: &str) -> ServerEvent {
    let message: Message = serde_json::from_value(serde_json::json!({
        "id": id,
        "roomId": room_id,
        "participantId": "P2",
        "text": "hello",
        "createdAt": "2024-05-01T10:00:00Z"
    }))
    .unwrap();
    ServerEvent::NewMessage { message }
}

fn join(room_id: &str) -> ClientMessage {
    ClientMessage::JoinRoom {
        participant_id: "P1".into(),
        room_id: room_id.into(),
    }
}

#[tokio::test]
async fn routes_room_events_and_reports_server_errors() {
    let (listener, url) = bind().await;
    let server = tokio::spawn(async move {
        let mut ws = accept(&listener).await;
        assert_eq!(next_signal(&mut ws).await, join("r1"));
        push(
            &mut ws,
            &ServerEvent::Typing {
                room_id: "r2".into(),
                participant_id: "P2".into(),
            },
        )
        .await;
        push(&mut ws, &new_message("m1", "r1")).await;
        push(
            &mut ws,
            &ServerEvent::Error {
                message: "boom".into(),
            },
        )
        .await;
        ws
    });

    let (errors_tx, mut errors_rx) = mpsc::unbounded_channel();
    let manager = ConnectionManager::connect(config(&url), errors_tx).await.unwrap();
    assert_eq!(manager.state(), ConnectionState::Connected);

    let mut sub = manager.subscribe("r1");
    manager.signal(join("r1")).unwrap();

    let event = timeout(WAIT, sub.recv()).await.unwrap().unwrap();
    assert!(matches!(event, ServerEvent::NewMessage { message } if message.id == "m1"));

    let error = timeout(WAIT, errors_rx.recv()).await.unwrap().unwrap();
    assert!(matches!(error, SyncError::Server(message) if message == "boom"));

    let _ws = server.await.unwrap();
    manager.close().await;
}

#[tokio::test]
async fn reconnects_and_rejoins_the_subscribed_room() {
    let (listener, url) = bind().await;
    let server = tokio::spawn(async move {
        let mut ws = accept(&listener).await;
        let first = next_signal(&mut ws).await;
        drop(ws);

        let mut ws = accept(&listener).await;
        let rejoin = next_signal(&mut ws).await;
        assert_eq!(rejoin, first);
        push(&mut ws, &new_message("m2", "r1")).await;
        ws
    });

    let (errors_tx, _errors_rx) = mpsc::unbounded_channel();
    let manager = ConnectionManager::connect(config(&url), errors_tx).await.unwrap();
    let mut sub = manager.subscribe("r1");
    manager.signal(join("r1")).unwrap();

    let event = timeout(WAIT, sub.recv()).await.unwrap().unwrap();
    assert!(matches!(event, ServerEvent::NewMessage { message } if message.id == "m2"));
    assert_eq!(manager.state(), ConnectionState::Connected);

    let _ws = server.await.unwrap();
    manager.close().await;
}

#[tokio::test]
async fn rejected_handshake_is_an_auth_error() {
    let (listener, url) = bind().await;
    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let reject = |_: &Request, _: Response| -> Result<Response, ErrorResponse> {
            let mut response = ErrorResponse::new(Some("unauthorized".into()));
            *response.status_mut() = StatusCode::UNAUTHORIZED;
            Err(response)
        };
        let _ = accept_hdr_async(stream, reject).await;
    });

    let (errors_tx, _errors_rx) = mpsc::unbounded_channel();
    let result = ConnectionManager::connect(config(&url), errors_tx).await;
    match result {
        Err(error @ SyncError::Auth(_)) => assert!(error.is_fatal() && error.is_user_visible()),
        Err(other) => panic!("expected an auth error, got {other}"),
        Ok(_) => panic!("handshake should have been rejected"),
    }
    server.await.unwrap();
}

#[tokio::test]
async fn sends_the_bearer_token_in_the_handshake() {
    let (listener, url) = bind().await;
    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut seen = None;
        let capture = |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
            seen = request
                .headers()
                .get("authorization")
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);
            Ok(response)
        };
        let ws = accept_hdr_async(stream, capture).await.unwrap();
        (seen, ws)
    });

    let mut config = config(&url);
    config.token = Some("secret".into());
    let (errors_tx, _errors_rx) = mpsc::unbounded_channel();
    let manager = ConnectionManager::connect(config, errors_tx).await.unwrap();

    let (seen, _ws) = server.await.unwrap();
    assert_eq!(seen.as_deref(), Some("Bearer secret"));
    manager.close().await;
}

#[tokio::test]
async fn exhausted_retries_reach_the_error_sink() {
    let (listener, url) = bind().await;
    let server = tokio::spawn(async move {
        let ws = accept(&listener).await;
        drop(ws);
        drop(listener);
    });

    let (errors_tx, mut errors_rx) = mpsc::unbounded_channel();
    let manager = ConnectionManager::connect(config(&url), errors_tx).await.unwrap();
    let mut state = manager.watch_state();
    server.await.unwrap();

    let error = timeout(WAIT, errors_rx.recv()).await.unwrap().unwrap();
    assert!(matches!(error, SyncError::ReconnectExhausted { attempts: 3 }));
    timeout(WAIT, state.wait_for(|s| *s == ConnectionState::Closed))
        .await
        .unwrap()
        .unwrap();
    assert!(manager.signal(join("r1")).is_err());
}

#[tokio::test]
async fn close_stops_the_driver() {
    let (listener, url) = bind().await;
    let server = tokio::spawn(async move {
        let mut ws = accept(&listener).await;
        while let Some(Ok(frame)) = ws.next().await {
            if frame.is_close() {
                break;
            }
        }
    });

    let (errors_tx, mut errors_rx) = mpsc::unbounded_channel();
    let manager = ConnectionManager::connect(config(&url), errors_tx).await.unwrap();
    let state = manager.watch_state();
    manager.close().await;

    assert_eq!(*state.borrow(), ConnectionState::Closed);
    timeout(WAIT, server).await.unwrap().unwrap();
    assert!(errors_rx.try_recv().is_err());
}
