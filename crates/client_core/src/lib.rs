use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, Instant},
};

use anyhow::{anyhow, Context, Result};
use futures::{SinkExt, StreamExt};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use shared::{
    domain::{ChannelId, ChannelKind, ChannelSummary, MessageId, Role, UserId},
    error::ApiError,
    protocol::{ClientRequest, MessagePayload, NoticePayload, ServerEvent, TypingPayload},
};
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{info, warn};
use url::Url;
use uuid::Uuid;

pub mod timeline;

pub use timeline::{OptimisticMessage, OptimisticState, Timeline, TimelineEntry};

/// Client-enforced typing debounce: at most one "still typing" event per
/// window, matching the server's trailing auto-clear assumption.
pub const TYPING_DEBOUNCE: Duration = Duration::from_secs(2);

/// Upper bound on a send round-trip before the optimistic entry fails.
pub const SEND_TIMEOUT: Duration = Duration::from_secs(10);

const EXPIRY_SWEEP_PERIOD: Duration = Duration::from_secs(1);
const HISTORY_PAGE: u32 = 50;

/// Everything the UI can observe. Closed set: a new server event variant is
/// a compile error here, not a silently dropped string.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    Connected,
    Disconnected,
    MessageReceived {
        message: MessagePayload,
        correlation_token: Option<String>,
    },
    MessageUpdated(MessagePayload),
    MessageDeleted {
        channel_id: ChannelId,
        message_id: MessageId,
    },
    TypingStatus(TypingPayload),
    Notification(NoticePayload),
    ChannelCreated(ChannelSummary),
    SendFailed {
        channel_id: ChannelId,
        correlation_token: String,
        reason: String,
    },
    Error(String),
}

#[derive(Debug, Serialize)]
struct LoginHttpRequest<'a> {
    username: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    display_name: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
struct LoginHttpResponse {
    token: String,
    user_id: i64,
    display_name: String,
    #[allow(dead_code)]
    role: Role,
}

#[derive(Debug, Serialize)]
struct CreateChannelHttpRequest<'a> {
    name: &'a str,
    kind: ChannelKind,
    is_private: bool,
    member_ids: Vec<i64>,
}

#[derive(Debug, Deserialize)]
struct CreateChannelHttpResponse {
    channel: ChannelSummary,
    #[allow(dead_code)]
    created: bool,
}

#[derive(Debug, Serialize)]
struct SendMessageHttpRequest<'a> {
    content: &'a str,
    correlation_token: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    parent_id: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct SendMessageHttpResponse {
    message: MessagePayload,
    correlation_token: String,
}

struct ClientStateInner {
    server_url: Option<String>,
    bearer_token: Option<String>,
    user_id: Option<UserId>,
    active_channel: Option<ChannelId>,
    timelines: HashMap<ChannelId, Timeline>,
    ws_outbound: Option<mpsc::UnboundedSender<ClientRequest>>,
    last_typing_sent: Option<Instant>,
    sweeper_started: bool,
}

/// The client half of the messaging core: REST for durable operations,
/// the event socket for live delivery, and an optimistic timeline per
/// channel reconciled by correlation token.
pub struct ChatClient {
    http: Client,
    inner: Mutex<ClientStateInner>,
    events: broadcast::Sender<ClientEvent>,
}

impl ChatClient {
    pub fn new() -> Arc<Self> {
        let (events, _) = broadcast::channel(1024);
        Arc::new(Self {
            http: Client::new(),
            inner: Mutex::new(ClientStateInner {
                server_url: None,
                bearer_token: None,
                user_id: None,
                active_channel: None,
                timelines: HashMap::new(),
                ws_outbound: None,
                last_typing_sent: None,
                sweeper_started: false,
            }),
            events,
        })
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    pub async fn user_id(&self) -> Option<UserId> {
        self.inner.lock().await.user_id
    }

    /// Authenticates against the login collaborator, stores the bearer
    /// credential, and brings up the live event socket.
    pub async fn login(
        self: &Arc<Self>,
        server_url: &str,
        username: &str,
        display_name: Option<&str>,
    ) -> Result<UserId> {
        Url::parse(server_url).with_context(|| format!("invalid server url: {server_url}"))?;
        let server_url = server_url.trim_end_matches('/').to_string();

        let response = self
            .http
            .post(format!("{server_url}/login"))
            .json(&LoginHttpRequest {
                username,
                display_name,
            })
            .send()
            .await?;
        let body: LoginHttpResponse = parse_response(response).await?;
        let user_id = UserId(body.user_id);
        info!(user_id = user_id.0, display_name = %body.display_name, "logged in");

        {
            let mut inner = self.inner.lock().await;
            inner.server_url = Some(server_url.clone());
            inner.bearer_token = Some(body.token.clone());
            inner.user_id = Some(user_id);
        }

        self.spawn_ws_events(&server_url, &body.token).await?;
        self.spawn_expiry_sweeper().await;
        Ok(user_id)
    }

    pub async fn list_channels(&self) -> Result<Vec<ChannelSummary>> {
        let (server_url, token) = self.session().await?;
        let response = self
            .http
            .get(format!("{server_url}/channels"))
            .bearer_auth(&token)
            .send()
            .await?;
        parse_response(response).await
    }

    pub async fn create_channel(
        &self,
        name: &str,
        kind: ChannelKind,
        is_private: bool,
        member_ids: &[UserId],
    ) -> Result<ChannelSummary> {
        let (server_url, token) = self.session().await?;
        let response = self
            .http
            .post(format!("{server_url}/channels"))
            .bearer_auth(&token)
            .json(&CreateChannelHttpRequest {
                name,
                kind,
                is_private,
                member_ids: member_ids.iter().map(|m| m.0).collect(),
            })
            .send()
            .await?;
        let body: CreateChannelHttpResponse = parse_response(response).await?;
        Ok(body.channel)
    }

    /// Switches the viewed channel: leaves the previous room, joins the new
    /// one, hydrates the timeline from history, and advances the read
    /// marker. Every join is paired with the leave of the room navigated
    /// away from, so fast navigation cannot leak room membership.
    pub async fn enter_channel(&self, channel_id: ChannelId) -> Result<Vec<MessagePayload>> {
        {
            let mut inner = self.inner.lock().await;
            let previous = inner.active_channel.replace(channel_id);
            inner.last_typing_sent = None;
            if let Some(outbound) = &inner.ws_outbound {
                if let Some(previous) = previous {
                    if previous != channel_id {
                        let _ = outbound.send(ClientRequest::LeaveChannel {
                            channel_id: previous,
                        });
                    }
                }
                let _ = outbound.send(ClientRequest::JoinChannel { channel_id });
            }
        }

        let history = self.fetch_messages(channel_id, HISTORY_PAGE, None).await?;
        {
            let mut inner = self.inner.lock().await;
            inner
                .timelines
                .entry(channel_id)
                .or_default()
                .hydrate(history.clone());
        }
        if let Err(err) = self.mark_read(channel_id).await {
            warn!(%err, channel_id = channel_id.0, "read marker update failed");
        }
        Ok(history)
    }

    /// Leaves the active channel's room. Idempotent; safe to call during
    /// teardown regardless of state.
    pub async fn exit_channel(&self) {
        let mut inner = self.inner.lock().await;
        let Some(channel_id) = inner.active_channel.take() else {
            return;
        };
        if let Some(outbound) = &inner.ws_outbound {
            let _ = outbound.send(ClientRequest::LeaveChannel { channel_id });
        }
    }

    pub async fn fetch_messages(
        &self,
        channel_id: ChannelId,
        limit: u32,
        before: Option<MessageId>,
    ) -> Result<Vec<MessagePayload>> {
        let (server_url, token) = self.session().await?;
        let mut request = self
            .http
            .get(format!("{server_url}/channels/{}/messages", channel_id.0))
            .bearer_auth(&token)
            .query(&[("limit", limit)]);
        if let Some(before) = before {
            request = request.query(&[("before", before.0)]);
        }
        let response = request.send().await?;
        parse_response(response).await
    }

    /// Fire-and-forget send: the optimistic entry lands on the timeline
    /// immediately and the relay request runs in the background. Returns the
    /// correlation token identifying the placeholder.
    pub async fn send_message(self: &Arc<Self>, content: &str) -> Result<String> {
        let content = content.trim().to_string();
        if content.is_empty() {
            return Err(anyhow!("message content cannot be empty"));
        }
        let channel_id = {
            let inner = self.inner.lock().await;
            inner
                .active_channel
                .ok_or_else(|| anyhow!("no active channel"))?
        };
        let correlation_token = Uuid::new_v4().to_string();
        {
            let mut inner = self.inner.lock().await;
            inner
                .timelines
                .entry(channel_id)
                .or_default()
                .push_optimistic(&correlation_token, channel_id, &content, Instant::now());
            inner.last_typing_sent = None;
        }

        let client = Arc::clone(self);
        let token = correlation_token.clone();
        tokio::spawn(async move {
            client.deliver_send(channel_id, token, content).await;
        });
        Ok(correlation_token)
    }

    /// Re-issues a failed send under a fresh correlation token.
    pub async fn retry_send(
        self: &Arc<Self>,
        channel_id: ChannelId,
        correlation_token: &str,
    ) -> Result<Option<String>> {
        let new_token = Uuid::new_v4().to_string();
        let content = {
            let mut inner = self.inner.lock().await;
            let Some(timeline) = inner.timelines.get_mut(&channel_id) else {
                return Ok(None);
            };
            timeline.retry(correlation_token, &new_token, Instant::now())
        };
        let Some(content) = content else {
            return Ok(None);
        };

        let client = Arc::clone(self);
        let token = new_token.clone();
        tokio::spawn(async move {
            client.deliver_send(channel_id, token, content).await;
        });
        Ok(Some(new_token))
    }

    pub async fn discard_failed_send(&self, channel_id: ChannelId, correlation_token: &str) {
        let mut inner = self.inner.lock().await;
        if let Some(timeline) = inner.timelines.get_mut(&channel_id) {
            timeline.discard_failed(correlation_token);
        }
    }

    pub async fn edit_message(
        &self,
        channel_id: ChannelId,
        message_id: MessageId,
        content: &str,
    ) -> Result<MessagePayload> {
        let (server_url, token) = self.session().await?;
        let response = self
            .http
            .patch(format!(
                "{server_url}/channels/{}/messages/{}",
                channel_id.0, message_id.0
            ))
            .bearer_auth(&token)
            .json(&serde_json::json!({ "content": content }))
            .send()
            .await?;
        let message: MessagePayload = parse_response(response).await?;
        let mut inner = self.inner.lock().await;
        if let Some(timeline) = inner.timelines.get_mut(&channel_id) {
            timeline.update_confirmed(&message);
        }
        Ok(message)
    }

    pub async fn delete_message(
        &self,
        channel_id: ChannelId,
        message_id: MessageId,
    ) -> Result<()> {
        let (server_url, token) = self.session().await?;
        let response = self
            .http
            .delete(format!(
                "{server_url}/channels/{}/messages/{}",
                channel_id.0, message_id.0
            ))
            .bearer_auth(&token)
            .send()
            .await?;
        expect_success(response).await?;
        let mut inner = self.inner.lock().await;
        if let Some(timeline) = inner.timelines.get_mut(&channel_id) {
            timeline.tombstone(message_id);
        }
        Ok(())
    }

    pub async fn mark_read(&self, channel_id: ChannelId) -> Result<()> {
        let (server_url, token) = self.session().await?;
        let response = self
            .http
            .post(format!("{server_url}/channels/{}/read", channel_id.0))
            .bearer_auth(&token)
            .send()
            .await?;
        expect_success(response).await
    }

    /// Debounced "still typing" signal for the active channel. At most one
    /// event per window; the server's expiry produces the trailing clear.
    pub async fn typing(&self) {
        let mut inner = self.inner.lock().await;
        let Some(channel_id) = inner.active_channel else {
            return;
        };
        let now = Instant::now();
        if inner
            .last_typing_sent
            .is_some_and(|sent| now.duration_since(sent) < TYPING_DEBOUNCE)
        {
            return;
        }
        inner.last_typing_sent = Some(now);
        if let Some(outbound) = &inner.ws_outbound {
            let _ = outbound.send(ClientRequest::Typing {
                channel_id,
                is_typing: true,
            });
        }
    }

    pub async fn stop_typing(&self) {
        let mut inner = self.inner.lock().await;
        let Some(channel_id) = inner.active_channel else {
            return;
        };
        if inner.last_typing_sent.take().is_none() {
            return;
        }
        if let Some(outbound) = &inner.ws_outbound {
            let _ = outbound.send(ClientRequest::Typing {
                channel_id,
                is_typing: false,
            });
        }
    }

    /// Snapshot of the visible list for one channel, in render order.
    pub async fn timeline_entries(&self, channel_id: ChannelId) -> Vec<TimelineEntry> {
        let inner = self.inner.lock().await;
        inner
            .timelines
            .get(&channel_id)
            .map(|timeline| timeline.entries().to_vec())
            .unwrap_or_default()
    }

    async fn deliver_send(self: Arc<Self>, channel_id: ChannelId, token: String, content: String) {
        let result = self.post_message(channel_id, &token, &content).await;
        match result {
            Ok(response) => {
                self.apply_confirm(channel_id, &response.correlation_token, response.message)
                    .await;
            }
            Err(err) => {
                self.apply_reject(channel_id, &token, &err.to_string()).await;
            }
        }
    }

    async fn post_message(
        &self,
        channel_id: ChannelId,
        correlation_token: &str,
        content: &str,
    ) -> Result<SendMessageHttpResponse> {
        let (server_url, token) = self.session().await?;
        let response = self
            .http
            .post(format!("{server_url}/channels/{}/messages", channel_id.0))
            .bearer_auth(&token)
            .timeout(SEND_TIMEOUT)
            .json(&SendMessageHttpRequest {
                content,
                correlation_token,
                parent_id: None,
            })
            .send()
            .await?;
        parse_response(response).await
    }

    async fn apply_confirm(
        &self,
        channel_id: ChannelId,
        correlation_token: &str,
        message: MessagePayload,
    ) {
        let mut inner = self.inner.lock().await;
        let timeline = inner.timelines.entry(channel_id).or_default();
        if !timeline.confirm(correlation_token, message.clone()) {
            // The socket broadcast may have reconciled this token already;
            // fall back to id-level dedupe.
            timeline.receive(message.clone());
        }
        drop(inner);
        let _ = self.events.send(ClientEvent::MessageReceived {
            message,
            correlation_token: Some(correlation_token.to_string()),
        });
    }

    async fn apply_reject(&self, channel_id: ChannelId, correlation_token: &str, reason: &str) {
        warn!(
            channel_id = channel_id.0,
            correlation_token, reason, "send failed"
        );
        {
            let mut inner = self.inner.lock().await;
            if let Some(timeline) = inner.timelines.get_mut(&channel_id) {
                timeline.reject(correlation_token);
            }
        }
        let _ = self.events.send(ClientEvent::SendFailed {
            channel_id,
            correlation_token: correlation_token.to_string(),
            reason: reason.to_string(),
        });
    }

    async fn session(&self) -> Result<(String, String)> {
        let inner = self.inner.lock().await;
        let server_url = inner
            .server_url
            .clone()
            .ok_or_else(|| anyhow!("not logged in"))?;
        let token = inner
            .bearer_token
            .clone()
            .ok_or_else(|| anyhow!("not logged in"))?;
        Ok((server_url, token))
    }

    async fn spawn_ws_events(self: &Arc<Self>, server_url: &str, bearer_token: &str) -> Result<()> {
        let ws_url = if server_url.starts_with("https://") {
            server_url.replacen("https://", "wss://", 1)
        } else if server_url.starts_with("http://") {
            server_url.replacen("http://", "ws://", 1)
        } else {
            return Err(anyhow!("server url must start with http:// or https://"));
        };
        let ws_url = format!("{ws_url}/ws?token={bearer_token}");
        let (ws_stream, _) = connect_async(&ws_url)
            .await
            .with_context(|| "failed to connect event socket")?;
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<ClientRequest>();
        {
            let mut inner = self.inner.lock().await;
            inner.ws_outbound = Some(outbound_tx);
        }
        let _ = self.events.send(ClientEvent::Connected);

        tokio::spawn(async move {
            while let Some(request) = outbound_rx.recv().await {
                let text = match serde_json::to_string(&request) {
                    Ok(v) => v,
                    Err(_) => continue,
                };
                if ws_writer.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
        });

        let client = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Text(text)) => match serde_json::from_str::<ServerEvent>(&text) {
                        Ok(event) => client.dispatch_server_event(event).await,
                        Err(err) => {
                            warn!(%err, "dropping malformed server event");
                        }
                    },
                    Ok(_) => {}
                    Err(err) => {
                        warn!(%err, "event socket error");
                        break;
                    }
                }
            }
            {
                let mut inner = client.inner.lock().await;
                inner.ws_outbound = None;
            }
            let _ = client.events.send(ClientEvent::Disconnected);
        });

        Ok(())
    }

    async fn dispatch_server_event(&self, event: ServerEvent) {
        match event {
            ServerEvent::MessageReceived {
                message,
                correlation_token,
            } => {
                let channel_id = message.channel_id;
                {
                    let mut inner = self.inner.lock().await;
                    let timeline = inner.timelines.entry(channel_id).or_default();
                    let reconciled = correlation_token
                        .as_deref()
                        .is_some_and(|token| timeline.confirm(token, message.clone()));
                    if !reconciled {
                        timeline.receive(message.clone());
                    }
                }
                let _ = self.events.send(ClientEvent::MessageReceived {
                    message,
                    correlation_token,
                });
            }
            ServerEvent::MessageUpdated { message } => {
                {
                    let mut inner = self.inner.lock().await;
                    if let Some(timeline) = inner.timelines.get_mut(&message.channel_id) {
                        timeline.update_confirmed(&message);
                    }
                }
                let _ = self.events.send(ClientEvent::MessageUpdated(message));
            }
            ServerEvent::MessageDeleted {
                channel_id,
                message_id,
            } => {
                {
                    let mut inner = self.inner.lock().await;
                    if let Some(timeline) = inner.timelines.get_mut(&channel_id) {
                        timeline.tombstone(message_id);
                    }
                }
                let _ = self.events.send(ClientEvent::MessageDeleted {
                    channel_id,
                    message_id,
                });
            }
            ServerEvent::TypingStatus { typing } => {
                let _ = self.events.send(ClientEvent::TypingStatus(typing));
            }
            ServerEvent::Notification { notice } => {
                let _ = self.events.send(ClientEvent::Notification(notice));
            }
            ServerEvent::ChannelCreated { channel } => {
                let _ = self.events.send(ClientEvent::ChannelCreated(channel));
            }
            ServerEvent::Error(err) => {
                let _ = self
                    .events
                    .send(ClientEvent::Error(format!("{:?}: {}", err.code, err.message)));
            }
        }
    }

    /// Safety net: if neither confirm nor reject ever arrives (a stalled
    /// collaborator, a dropped response), the sweep fails the entry after
    /// its bounded window so every send reaches a terminal state.
    async fn spawn_expiry_sweeper(self: &Arc<Self>) {
        {
            let mut inner = self.inner.lock().await;
            if inner.sweeper_started {
                return;
            }
            inner.sweeper_started = true;
        }
        let client = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(EXPIRY_SWEEP_PERIOD);
            loop {
                ticker.tick().await;
                let expired: Vec<(ChannelId, String)> = {
                    let mut inner = client.inner.lock().await;
                    let now = Instant::now();
                    inner
                        .timelines
                        .iter_mut()
                        .flat_map(|(channel_id, timeline)| {
                            let channel_id = *channel_id;
                            timeline
                                .expire_pending(now)
                                .into_iter()
                                .map(move |token| (channel_id, token))
                        })
                        .collect()
                };
                for (channel_id, correlation_token) in expired {
                    let _ = client.events.send(ClientEvent::SendFailed {
                        channel_id,
                        correlation_token,
                        reason: "timed out waiting for confirmation".to_string(),
                    });
                }
            }
        });
    }
}

async fn parse_response<T: serde::de::DeserializeOwned>(response: reqwest::Response) -> Result<T> {
    let status = response.status();
    if status.is_success() {
        return Ok(response.json::<T>().await?);
    }
    Err(response_error(status, response).await)
}

async fn expect_success(response: reqwest::Response) -> Result<()> {
    let status = response.status();
    if status.is_success() {
        return Ok(());
    }
    Err(response_error(status, response).await)
}

async fn response_error(status: reqwest::StatusCode, response: reqwest::Response) -> anyhow::Error {
    match response.json::<ApiError>().await {
        Ok(err) => anyhow!("{:?}: {}", err.code, err.message),
        Err(_) => anyhow!("request failed with status {status}"),
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
