use std::{net::SocketAddr, sync::Arc, time::Duration};

use axum::{
    extract::{Path, Query, State, WebSocketUpgrade},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use server_api::{
    create_channel, list_channels, list_messages, mark_read, ApiContext, DEFAULT_PAGE_SIZE,
    MAX_PAGE_SIZE,
};
use shared::{
    domain::{ChannelId, ChannelKind, ChannelSummary, MessageId, Principal, Role, UserId},
    error::{ApiError, ErrorCode},
    protocol::{ClientRequest, MessagePayload, ServerEvent},
};
use storage::Storage;
use tokio::sync::mpsc;
use tower_http::limit::RequestBodyLimitLayer;
use tracing::{error, info, warn};

mod auth;
mod config;
mod membership;
mod notify;
mod registry;
mod relay;
mod rooms;

use auth::AuthConfig;
use config::{load_settings, prepare_database_url};
use relay::Relay;

const MAX_BODY_BYTES: usize = 64 * 1024;

#[derive(Clone)]
struct AppState {
    api: ApiContext,
    relay: Arc<Relay>,
    auth: AuthConfig,
}

#[derive(Debug, Deserialize)]
struct LoginRequest {
    username: String,
    display_name: Option<String>,
    role: Option<Role>,
}

#[derive(Debug, Serialize)]
struct LoginResponse {
    token: String,
    user_id: i64,
    display_name: String,
    role: Role,
}

#[derive(Debug, Deserialize)]
struct CreateChannelRequest {
    #[serde(default)]
    name: String,
    kind: ChannelKind,
    #[serde(default)]
    is_private: bool,
    member_ids: Vec<i64>,
}

#[derive(Debug, Serialize)]
struct CreateChannelResponse {
    channel: ChannelSummary,
    created: bool,
}

#[derive(Debug, Deserialize)]
struct ListMessagesQuery {
    limit: Option<u32>,
    before: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct SendMessageRequest {
    content: String,
    correlation_token: String,
    #[serde(default)]
    parent_id: Option<i64>,
}

#[derive(Debug, Serialize)]
struct SendMessageResponse {
    message: MessagePayload,
    correlation_token: String,
}

#[derive(Debug, Deserialize)]
struct EditMessageRequest {
    content: String,
}

#[derive(Debug, Deserialize)]
struct WsQuery {
    token: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_env_filter("info").init();

    let settings = load_settings();
    let database_url = prepare_database_url(&settings.database_url)?;
    let storage = Storage::new(&database_url).await.map_err(|err| {
        error!(
            %database_url,
            %err,
            "failed to open SQLite database; verify parent directory exists and permissions are correct"
        );
        err
    })?;
    let api = ApiContext { storage };
    let relay = Arc::new(Relay::new(
        api.clone(),
        Duration::from_millis(settings.typing_ttl_ms),
    ));
    tokio::spawn(Arc::clone(&relay).run_typing_sweeper());

    let state = AppState {
        api,
        relay,
        auth: AuthConfig {
            secret: settings.auth_secret,
            token_ttl_seconds: settings.token_ttl_seconds,
        },
    };
    let app = build_router(state);

    let addr: SocketAddr = settings.server_bind.parse()?;
    info!(%addr, "messaging relay listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/login", post(login))
        .route("/channels", get(http_list_channels).post(http_create_channel))
        .route(
            "/channels/:channel_id/messages",
            get(http_list_messages).post(http_send_message),
        )
        .route(
            "/channels/:channel_id/messages/:message_id",
            axum::routing::patch(http_edit_message).delete(http_delete_message),
        )
        .route("/channels/:channel_id/read", post(http_mark_read))
        .route("/ws", get(ws_handler))
        .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
        .with_state(state)
}

async fn healthz() -> &'static str {
    "ok"
}

fn error_response(err: ApiError) -> (StatusCode, Json<ApiError>) {
    let status = match err.code {
        ErrorCode::Unauthenticated => StatusCode::UNAUTHORIZED,
        ErrorCode::Forbidden => StatusCode::FORBIDDEN,
        ErrorCode::NotFound => StatusCode::NOT_FOUND,
        ErrorCode::InvalidMessage => StatusCode::BAD_REQUEST,
        ErrorCode::Persistence => StatusCode::SERVICE_UNAVAILABLE,
        ErrorCode::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(err))
}

/// Validates the `Authorization: Bearer` credential on a REST call. The same
/// signature+expiry check guards the websocket handshake.
fn bearer_principal(
    state: &AppState,
    headers: &HeaderMap,
) -> Result<Principal, (StatusCode, Json<ApiError>)> {
    let token = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .ok_or_else(|| {
            error_response(ApiError::new(
                ErrorCode::Unauthenticated,
                "missing bearer credential",
            ))
        })?;
    auth::authenticate(&state.auth, token).map_err(|err| error_response(err.into()))
}

async fn login(
    State(state): State<AppState>,
    Json(req): Json<LoginRequest>,
) -> Result<Json<LoginResponse>, (StatusCode, Json<ApiError>)> {
    let username = req.username.trim();
    if username.is_empty() {
        return Err(error_response(ApiError::new(
            ErrorCode::InvalidMessage,
            "username cannot be empty",
        )));
    }
    let display_name = req
        .display_name
        .as_deref()
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .unwrap_or(username)
        .to_string();
    let role = req.role.unwrap_or(Role::Employee);

    let user_id = state
        .api
        .storage
        .create_user(username, &display_name, role)
        .await
        .map_err(|err| {
            error_response(ApiError::new(ErrorCode::Persistence, err.to_string()))
        })?;

    let principal = Principal {
        user_id,
        display_name: display_name.clone(),
        role,
    };
    let token = auth::mint_token(&state.auth, &principal).map_err(|err| {
        error_response(ApiError::new(ErrorCode::Internal, err.to_string()))
    })?;

    Ok(Json(LoginResponse {
        token,
        user_id: user_id.0,
        display_name,
        role,
    }))
}

async fn http_list_channels(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Vec<ChannelSummary>>, (StatusCode, Json<ApiError>)> {
    let principal = bearer_principal(&state, &headers)?;
    let channels = list_channels(&state.api, principal.user_id)
        .await
        .map_err(error_response)?;
    Ok(Json(channels))
}

async fn http_create_channel(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<CreateChannelRequest>,
) -> Result<Json<CreateChannelResponse>, (StatusCode, Json<ApiError>)> {
    let principal = bearer_principal(&state, &headers)?;
    let member_ids: Vec<UserId> = req.member_ids.iter().copied().map(UserId).collect();
    let created = create_channel(
        &state.api,
        principal.user_id,
        &req.name,
        req.kind,
        req.is_private,
        &member_ids,
    )
    .await
    .map_err(error_response)?;

    state.relay.channel_created(&created);

    Ok(Json(CreateChannelResponse {
        channel: created.channel,
        created: created.created,
    }))
}

async fn http_list_messages(
    State(state): State<AppState>,
    Path(channel_id): Path<i64>,
    headers: HeaderMap,
    Query(q): Query<ListMessagesQuery>,
) -> Result<Json<Vec<MessagePayload>>, (StatusCode, Json<ApiError>)> {
    let principal = bearer_principal(&state, &headers)?;
    let limit = q.limit.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE);
    let messages = list_messages(
        &state.api,
        principal.user_id,
        ChannelId(channel_id),
        limit,
        q.before,
    )
    .await
    .map_err(error_response)?;
    Ok(Json(messages))
}

async fn http_send_message(
    State(state): State<AppState>,
    Path(channel_id): Path<i64>,
    headers: HeaderMap,
    Json(req): Json<SendMessageRequest>,
) -> Result<Json<SendMessageResponse>, (StatusCode, Json<ApiError>)> {
    let principal = bearer_principal(&state, &headers)?;
    let message = state
        .relay
        .handle_send(
            principal.user_id,
            ChannelId(channel_id),
            &req.content,
            req.parent_id.map(MessageId),
            &req.correlation_token,
        )
        .await
        .map_err(error_response)?;
    Ok(Json(SendMessageResponse {
        message,
        correlation_token: req.correlation_token,
    }))
}

async fn http_edit_message(
    State(state): State<AppState>,
    Path((channel_id, message_id)): Path<(i64, i64)>,
    headers: HeaderMap,
    Json(req): Json<EditMessageRequest>,
) -> Result<Json<MessagePayload>, (StatusCode, Json<ApiError>)> {
    let principal = bearer_principal(&state, &headers)?;
    let message = state
        .relay
        .handle_edit(
            principal.user_id,
            ChannelId(channel_id),
            MessageId(message_id),
            &req.content,
        )
        .await
        .map_err(error_response)?;
    Ok(Json(message))
}

async fn http_delete_message(
    State(state): State<AppState>,
    Path((channel_id, message_id)): Path<(i64, i64)>,
    headers: HeaderMap,
) -> Result<StatusCode, (StatusCode, Json<ApiError>)> {
    let principal = bearer_principal(&state, &headers)?;
    state
        .relay
        .handle_delete(
            principal.user_id,
            ChannelId(channel_id),
            MessageId(message_id),
        )
        .await
        .map_err(error_response)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn http_mark_read(
    State(state): State<AppState>,
    Path(channel_id): Path<i64>,
    headers: HeaderMap,
) -> Result<StatusCode, (StatusCode, Json<ApiError>)> {
    let principal = bearer_principal(&state, &headers)?;
    mark_read(&state.api, principal.user_id, ChannelId(channel_id), Utc::now())
        .await
        .map_err(error_response)?;
    Ok(StatusCode::NO_CONTENT)
}

/// The credential is checked before the upgrade completes: an invalid token
/// is refused with 401 and no connection (and therefore no room membership)
/// ever exists for it.
async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(q): Query<WsQuery>,
) -> Response {
    let principal = match auth::authenticate(&state.auth, &q.token) {
        Ok(principal) => principal,
        Err(err) => {
            warn!(%err, "websocket handshake refused");
            return error_response(err.into()).into_response();
        }
    };
    ws.on_upgrade(move |socket| ws_connection(state, socket, principal))
}

async fn ws_connection(
    state: AppState,
    socket: axum::extract::ws::WebSocket,
    principal: Principal,
) {
    use axum::extract::ws::Message;
    use futures::{SinkExt, StreamExt};

    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel();
    let connection_id = state.relay.register_connection(principal, outbound_tx);

    let (mut sender, mut receiver) = socket.split();
    let send_task = tokio::spawn(async move {
        while let Some(event) = outbound_rx.recv().await {
            let text = match serde_json::to_string(&event) {
                Ok(v) => v,
                Err(_) => continue,
            };
            if sender.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    while let Some(Ok(msg)) = receiver.next().await {
        let Message::Text(text) = msg else { continue };
        match serde_json::from_str::<ClientRequest>(&text) {
            Ok(request) => state.relay.handle_request(connection_id, request).await,
            Err(err) => {
                state.relay.registry().send_to_connection(
                    connection_id,
                    ServerEvent::Error(ApiError::new(
                        ErrorCode::InvalidMessage,
                        format!("unrecognized client event: {err}"),
                    )),
                );
            }
        }
    }

    state.relay.disconnect(connection_id);
    send_task.abort();
}
