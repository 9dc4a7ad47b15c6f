use std::net::SocketAddr;

use room_sync::{HistorySource, MessageKind, RestHistory, SyncError};
use serde_json::{json, Value};
use warp::http::StatusCode;
use warp::Filter;

fn reply(status: StatusCode, body: Value) -> warp::reply::WithStatus<warp::reply::Json> {
    warp::reply::with_status(warp::reply::json(&body), status)
}

fn serve() -> SocketAddr {
    let messages = warp::path!("api" / "chat" / "rooms" / String / "messages")
        .and(warp::header::optional::<String>("authorization"))
        .map(|room_id: String, auth: Option<String>| {
            if auth.as_deref() != Some("Bearer secret") {
                return reply(StatusCode::UNAUTHORIZED, json!({ "error": "unauthorized" }));
            }
            if room_id == "broken" {
                return reply(StatusCode::INTERNAL_SERVER_ERROR, json!({ "error": "db down" }));
            }
            reply(
                StatusCode::OK,
                json!([
                    {
                        "id": "m1",
                        "roomId": room_id,
                        "participantId": "P2",
                        "text": "hello",
                        "createdAt": "2024-05-01T09:00:00Z",
                        "participant": { "id": "P2", "name": "Bo" }
                    },
                    {
                        "id": "m2",
                        "roomId": room_id,
                        "participantId": "P1",
                        "text": "gone",
                        "deleted": true,
                        "createdAt": "2024-05-01T09:01:00Z"
                    }
                ]),
            )
        });

    let notices = warp::path!("api" / "chat" / "rooms" / String / "system-messages").map(
        |room_id: String| {
            reply(
                StatusCode::OK,
                json!([{
                    "id": "s1",
                    "roomId": room_id,
                    "text": "Bo joined the room",
                    "createdAt": "2024-05-01T08:59:00Z"
                }]),
            )
        },
    );

    let (addr, server) = warp::serve(messages.or(notices)).bind_ephemeral(([127, 0, 0, 1], 0));
    tokio::spawn(server);
    addr
}

#[tokio::test]
async fn fetches_room_messages_with_bearer_auth() {
    let addr = serve();
    let history = RestHistory::new(&format!("http://{addr}/api/"), Some("secret".into()));

    let messages = history.fetch_messages("r1").await.unwrap();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0].room_id, "r1");
    assert_eq!(messages[0].author_name(), Some("Bo"));
    assert!(!messages[0].deleted);
    assert!(messages[1].deleted);
}

#[tokio::test]
async fn system_messages_are_marked_as_system() {
    let addr = serve();
    let history = RestHistory::new(&format!("http://{addr}/api"), None);

    let notices = history.fetch_system_messages("r1").await.unwrap();
    assert_eq!(notices.len(), 1);
    assert_eq!(notices[0].kind, MessageKind::System);
    assert!(notices[0].participant.is_none());
}

#[tokio::test]
async fn missing_token_is_an_auth_error() {
    let addr = serve();
    let history = RestHistory::new(&format!("http://{addr}/api"), None);

    let error = history.fetch_messages("r1").await.unwrap_err();
    assert!(matches!(error, SyncError::Auth(_)));
}

#[tokio::test]
async fn server_failure_is_a_room_load_error() {
    let addr = serve();
    let history = RestHistory::new(&format!("http://{addr}/api"), Some("secret".into()));

    let error = history.fetch_messages("broken").await.unwrap_err();
    match error {
        SyncError::Fetch { room_id, reason } => {
            assert_eq!(room_id, "broken");
            assert!(reason.contains("500"));
        }
        other => panic!("expected a fetch error, got {other}"),
    }
}

#[tokio::test]
async fn room_id_is_a_single_path_segment() {
    let addr = serve();
    let history = RestHistory::new(&format!("http://{addr}/api"), Some("secret".into()));

    let messages = history.fetch_messages("team/alpha").await.unwrap();
    assert_eq!(messages.len(), 2);
}
