use super::*;
use axum::{
    extract::{ws::WebSocket, Path, WebSocketUpgrade},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde_json::json;
use shared::error::ErrorCode;

async fn spawn_stub(app: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    format!("http://{addr}")
}

async fn stub_login() -> Json<serde_json::Value> {
    Json(json!({
        "token": "stub-token",
        "user_id": 7,
        "display_name": "Alice Ngo",
        "role": "employee"
    }))
}

async fn stub_ws_idle(ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(|mut socket: WebSocket| async move {
        while socket.recv().await.is_some() {}
    })
    .into_response()
}

async fn stub_empty_history() -> Json<Vec<MessagePayload>> {
    Json(Vec::new())
}

async fn stub_mark_read() -> StatusCode {
    StatusCode::NO_CONTENT
}

fn confirmed_payload(channel_id: i64, message_id: i64, content: &str) -> MessagePayload {
    MessagePayload {
        message_id: MessageId(message_id),
        channel_id: ChannelId(channel_id),
        sender_id: UserId(7),
        sender_name: Some("Alice Ngo".to_string()),
        content: content.to_string(),
        parent_id: None,
        is_edited: false,
        is_deleted: false,
        sent_at: Utc::now(),
    }
}

async fn wait_for<F>(events: &mut broadcast::Receiver<ClientEvent>, mut predicate: F) -> ClientEvent
where
    F: FnMut(&ClientEvent) -> bool,
{
    tokio::time::timeout(Duration::from_secs(3), async {
        loop {
            let event = events.recv().await.expect("event stream");
            if predicate(&event) {
                return event;
            }
        }
    })
    .await
    .expect("expected event before timeout")
}

#[tokio::test]
async fn login_brings_up_the_event_socket() {
    let app = Router::new()
        .route("/login", post(stub_login))
        .route("/ws", get(stub_ws_idle));
    let server_url = spawn_stub(app).await;

    let client = ChatClient::new();
    let mut events = client.subscribe_events();
    let user_id = client
        .login(&server_url, "alice", None)
        .await
        .expect("login");

    assert_eq!(user_id, UserId(7));
    wait_for(&mut events, |event| matches!(event, ClientEvent::Connected)).await;
}

#[tokio::test]
async fn confirmed_send_replaces_the_optimistic_entry() {
    async fn stub_send(
        Path(channel_id): Path<i64>,
        Json(body): Json<serde_json::Value>,
    ) -> Json<serde_json::Value> {
        let token = body["correlation_token"].as_str().expect("token").to_string();
        let content = body["content"].as_str().expect("content");
        Json(json!({
            "message": confirmed_payload(channel_id, 41, content),
            "correlation_token": token,
        }))
    }

    let app = Router::new()
        .route("/login", post(stub_login))
        .route("/ws", get(stub_ws_idle))
        .route(
            "/channels/:channel_id/messages",
            get(stub_empty_history).post(stub_send),
        )
        .route("/channels/:channel_id/read", post(stub_mark_read));
    let server_url = spawn_stub(app).await;

    let client = ChatClient::new();
    let mut events = client.subscribe_events();
    client
        .login(&server_url, "alice", None)
        .await
        .expect("login");
    client
        .enter_channel(ChannelId(9))
        .await
        .expect("enter channel");

    let token = client.send_message("hello").await.expect("send");

    // The placeholder is visible immediately, before any confirmation.
    let entries = client.timeline_entries(ChannelId(9)).await;
    assert_eq!(entries.len(), 1);
    assert!(matches!(
        &entries[0],
        TimelineEntry::Optimistic(optimistic)
            if optimistic.state == OptimisticState::InFlight
    ));

    let event = wait_for(&mut events, |event| {
        matches!(event, ClientEvent::MessageReceived { .. })
    })
    .await;
    let ClientEvent::MessageReceived {
        message,
        correlation_token,
    } = event
    else {
        unreachable!();
    };
    assert_eq!(correlation_token.as_deref(), Some(token.as_str()));
    assert_eq!(message.content, "hello");

    // Terminal outcome: exactly one confirmed entry, same list position.
    let entries = client.timeline_entries(ChannelId(9)).await;
    assert_eq!(entries.len(), 1);
    assert!(matches!(
        &entries[0],
        TimelineEntry::Confirmed(confirmed) if confirmed.message_id == MessageId(41)
    ));
}

#[tokio::test]
async fn rejected_send_is_retained_flagged_and_retryable() {
    async fn stub_send_failing() -> (StatusCode, Json<ApiError>) {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ApiError::new(ErrorCode::Persistence, "store unavailable")),
        )
    }

    let app = Router::new()
        .route("/login", post(stub_login))
        .route("/ws", get(stub_ws_idle))
        .route(
            "/channels/:channel_id/messages",
            get(stub_empty_history).post(stub_send_failing),
        )
        .route("/channels/:channel_id/read", post(stub_mark_read));
    let server_url = spawn_stub(app).await;

    let client = ChatClient::new();
    let mut events = client.subscribe_events();
    client
        .login(&server_url, "alice", None)
        .await
        .expect("login");
    client
        .enter_channel(ChannelId(9))
        .await
        .expect("enter channel");

    let token = client.send_message("doomed").await.expect("send");

    let event = wait_for(&mut events, |event| {
        matches!(event, ClientEvent::SendFailed { .. })
    })
    .await;
    let ClientEvent::SendFailed {
        channel_id,
        correlation_token,
        ..
    } = event
    else {
        unreachable!();
    };
    assert_eq!(channel_id, ChannelId(9));
    assert_eq!(correlation_token, token);

    // Retained and flagged, never silently dropped.
    let entries = client.timeline_entries(ChannelId(9)).await;
    assert_eq!(entries.len(), 1);
    assert!(matches!(
        &entries[0],
        TimelineEntry::Optimistic(optimistic)
            if optimistic.state == OptimisticState::Failed
    ));

    // A retry re-arms the same entry under a fresh token.
    let retried = client
        .retry_send(ChannelId(9), &token)
        .await
        .expect("retry")
        .expect("entry re-armed");
    assert_ne!(retried, token);
    let entries = client.timeline_entries(ChannelId(9)).await;
    assert_eq!(entries.len(), 1);
}

#[tokio::test]
async fn broadcast_from_another_principal_lands_in_the_timeline() {
    async fn stub_ws_announcing(ws: WebSocketUpgrade) -> Response {
        ws.on_upgrade(|mut socket: WebSocket| async move {
            let event = ServerEvent::MessageReceived {
                message: MessagePayload {
                    message_id: MessageId(77),
                    channel_id: ChannelId(9),
                    sender_id: UserId(2),
                    sender_name: Some("Bob Imari".to_string()),
                    content: "incoming".to_string(),
                    parent_id: None,
                    is_edited: false,
                    is_deleted: false,
                    sent_at: Utc::now(),
                },
                correlation_token: Some("someone-elses-token".to_string()),
            };
            let text = serde_json::to_string(&event).expect("encode");
            let _ = socket
                .send(axum::extract::ws::Message::Text(text))
                .await;
            while socket.recv().await.is_some() {}
        })
        .into_response()
    }

    let app = Router::new()
        .route("/login", post(stub_login))
        .route("/ws", get(stub_ws_announcing));
    let server_url = spawn_stub(app).await;

    let client = ChatClient::new();
    let mut events = client.subscribe_events();
    client
        .login(&server_url, "alice", None)
        .await
        .expect("login");

    let event = wait_for(&mut events, |event| {
        matches!(event, ClientEvent::MessageReceived { .. })
    })
    .await;
    let ClientEvent::MessageReceived { message, .. } = event else {
        unreachable!();
    };
    assert_eq!(message.message_id, MessageId(77));

    // A foreign correlation token reconciles nothing; the message simply
    // appends as a confirmed entry.
    let entries = client.timeline_entries(ChannelId(9)).await;
    assert_eq!(entries.len(), 1);
    assert!(matches!(&entries[0], TimelineEntry::Confirmed(_)));
}
