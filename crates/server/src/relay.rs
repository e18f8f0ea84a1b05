use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use server_api::{ApiContext, CreatedChannel};
use shared::{
    domain::{ChannelId, ConnectionId, MessageId, Principal, UserId},
    error::{ApiError, ErrorCode},
    protocol::{ClientRequest, MessagePayload, ServerEvent, TypingPayload},
};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::{membership::MembershipIndex, notify, registry::ConnectionRegistry, rooms::RoomTable};

struct TypingEntry {
    display_name: String,
    expires_at: Instant,
}

/// The messaging relay: authorizes inbound events against the membership
/// index, persists sends through the collaborator, and fans results out to
/// the channel's room. One instance per process, constructed at startup and
/// handed to the transport layer explicitly.
///
/// Send state machine per attempt:
/// `PENDING → {AUTHORIZED, REJECTED} → {PERSISTED, PERSIST_FAILED} → BROADCAST`.
/// A message is never broadcast without being durably stored first, and a
/// stored message is always offered to the room before the call returns.
pub struct Relay {
    api: ApiContext,
    registry: ConnectionRegistry,
    rooms: RoomTable,
    membership: MembershipIndex,
    typing: Mutex<HashMap<(ChannelId, UserId), TypingEntry>>,
    typing_ttl: Duration,
}

impl Relay {
    pub fn new(api: ApiContext, typing_ttl: Duration) -> Self {
        let membership = MembershipIndex::new(api.storage.clone());
        Self {
            api,
            registry: ConnectionRegistry::new(),
            rooms: RoomTable::new(),
            membership,
            typing: Mutex::new(HashMap::new()),
            typing_ttl,
        }
    }

    pub fn api(&self) -> &ApiContext {
        &self.api
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    pub fn rooms(&self) -> &RoomTable {
        &self.rooms
    }

    pub fn membership(&self) -> &MembershipIndex {
        &self.membership
    }

    pub fn register_connection(
        &self,
        principal: Principal,
        outbound: mpsc::UnboundedSender<ServerEvent>,
    ) -> ConnectionId {
        self.registry.register(principal, outbound)
    }

    /// Tears down everything the connection held: room memberships and, if
    /// this was the principal's last connection, any live typing state —
    /// other clients get the clearing event even though the origin is gone.
    pub fn disconnect(&self, connection_id: ConnectionId) {
        self.rooms.leave_all(connection_id);
        let Some(principal) = self.registry.deregister(connection_id) else {
            return;
        };
        if !self.registry.is_connected(principal.user_id) {
            self.clear_typing_for_user(principal.user_id);
        }
    }

    /// The full send path. Membership is checked before anything else;
    /// persistence failures surface to the caller with no broadcast.
    pub async fn handle_send(
        &self,
        sender_id: UserId,
        channel_id: ChannelId,
        content: &str,
        parent_id: Option<MessageId>,
        correlation_token: &str,
    ) -> Result<MessagePayload, ApiError> {
        self.authorize(channel_id, sender_id).await?;

        let message =
            server_api::send_message(&self.api, sender_id, channel_id, content, parent_id).await?;

        let event = ServerEvent::MessageReceived {
            message: message.clone(),
            correlation_token: Some(correlation_token.to_string()),
        };
        self.rooms.broadcast(&self.registry, channel_id, &event, None);

        match self.membership.members_of(channel_id).await {
            Ok(members) => {
                notify::dispatch_notices(&self.registry, &self.rooms, &members, &message);
            }
            Err(err) => warn!(%err, channel_id = channel_id.0, "notice fan-out skipped"),
        }

        Ok(message)
    }

    pub async fn handle_edit(
        &self,
        sender_id: UserId,
        channel_id: ChannelId,
        message_id: MessageId,
        content: &str,
    ) -> Result<MessagePayload, ApiError> {
        let message =
            server_api::edit_message(&self.api, sender_id, channel_id, message_id, content).await?;
        let event = ServerEvent::MessageUpdated {
            message: message.clone(),
        };
        self.rooms.broadcast(&self.registry, channel_id, &event, None);
        Ok(message)
    }

    pub async fn handle_delete(
        &self,
        sender_id: UserId,
        channel_id: ChannelId,
        message_id: MessageId,
    ) -> Result<(), ApiError> {
        server_api::delete_message(&self.api, sender_id, channel_id, message_id).await?;
        let event = ServerEvent::MessageDeleted {
            channel_id,
            message_id,
        };
        self.rooms.broadcast(&self.registry, channel_id, &event, None);
        Ok(())
    }

    /// Membership changed under a channel: refresh the index and tell every
    /// member's live connections about a newly created channel.
    pub fn channel_created(&self, created: &CreatedChannel) {
        self.membership.invalidate(created.channel.channel_id);
        if !created.created {
            return;
        }
        let event = ServerEvent::ChannelCreated {
            channel: created.channel.clone(),
        };
        for member in &created.member_ids {
            self.registry.send_to_user(*member, &event);
        }
    }

    /// Socket-side dispatch for the closed request enum. Failures are
    /// reported to the offending connection only.
    pub async fn handle_request(&self, connection_id: ConnectionId, request: ClientRequest) {
        let Some(principal) = self.registry.principal_of(connection_id) else {
            return;
        };
        match request {
            ClientRequest::JoinChannel { channel_id } => {
                match self.authorize(channel_id, principal.user_id).await {
                    Ok(()) => {
                        self.rooms.join(connection_id, channel_id);
                        debug!(
                            connection_id = connection_id.0,
                            channel_id = channel_id.0,
                            "room joined"
                        );
                    }
                    Err(err) => self.send_error(connection_id, err),
                }
            }
            ClientRequest::LeaveChannel { channel_id } => {
                self.rooms.leave(connection_id, channel_id);
            }
            ClientRequest::Typing {
                channel_id,
                is_typing,
            } => {
                if let Err(err) = self.authorize(channel_id, principal.user_id).await {
                    self.send_error(connection_id, err);
                    return;
                }
                self.apply_typing(channel_id, &principal, is_typing);
            }
        }
    }

    /// Ephemeral path: no persistence, sender's own devices excluded.
    fn apply_typing(&self, channel_id: ChannelId, principal: &Principal, is_typing: bool) {
        {
            let mut typing = self.typing.lock().expect("typing lock");
            if is_typing {
                typing.insert(
                    (channel_id, principal.user_id),
                    TypingEntry {
                        display_name: principal.display_name.clone(),
                        expires_at: Instant::now() + self.typing_ttl,
                    },
                );
            } else {
                typing.remove(&(channel_id, principal.user_id));
            }
        }
        let event = ServerEvent::TypingStatus {
            typing: TypingPayload {
                channel_id,
                user_id: principal.user_id,
                display_name: principal.display_name.clone(),
                is_typing,
            },
        };
        self.rooms
            .broadcast_excluding_user(&self.registry, channel_id, &event, principal.user_id);
    }

    /// Server-enforced trailing clear: entries past their deadline are
    /// cleared and the clearing event broadcast regardless of whether the
    /// origin client is still alive.
    pub fn sweep_expired_typing(&self) {
        let now = Instant::now();
        let expired: Vec<(ChannelId, UserId, String)> = {
            let mut typing = self.typing.lock().expect("typing lock");
            let stale: Vec<(ChannelId, UserId)> = typing
                .iter()
                .filter(|(_, entry)| entry.expires_at <= now)
                .map(|(key, _)| *key)
                .collect();
            stale
                .into_iter()
                .filter_map(|key| {
                    typing
                        .remove(&key)
                        .map(|entry| (key.0, key.1, entry.display_name))
                })
                .collect()
        };
        for (channel_id, user_id, display_name) in expired {
            let event = ServerEvent::TypingStatus {
                typing: TypingPayload {
                    channel_id,
                    user_id,
                    display_name,
                    is_typing: false,
                },
            };
            self.rooms
                .broadcast_excluding_user(&self.registry, channel_id, &event, user_id);
        }
    }

    pub async fn run_typing_sweeper(self: Arc<Self>) {
        let period = self.typing_ttl.min(Duration::from_millis(500)).max(Duration::from_millis(50));
        let mut ticker = tokio::time::interval(period);
        loop {
            ticker.tick().await;
            self.sweep_expired_typing();
        }
    }

    fn clear_typing_for_user(&self, user_id: UserId) {
        let cleared: Vec<(ChannelId, String)> = {
            let mut typing = self.typing.lock().expect("typing lock");
            let keys: Vec<(ChannelId, UserId)> = typing
                .keys()
                .filter(|(_, typist)| *typist == user_id)
                .copied()
                .collect();
            keys.into_iter()
                .filter_map(|key| typing.remove(&key).map(|entry| (key.0, entry.display_name)))
                .collect()
        };
        for (channel_id, display_name) in cleared {
            let event = ServerEvent::TypingStatus {
                typing: TypingPayload {
                    channel_id,
                    user_id,
                    display_name,
                    is_typing: false,
                },
            };
            self.rooms
                .broadcast_excluding_user(&self.registry, channel_id, &event, user_id);
        }
    }

    async fn authorize(&self, channel_id: ChannelId, user_id: UserId) -> Result<(), ApiError> {
        let is_member = self
            .membership
            .is_member(channel_id, user_id)
            .await
            .map_err(|err| ApiError::new(ErrorCode::Internal, err.to_string()))?;
        if !is_member {
            return Err(ApiError::new(
                ErrorCode::Forbidden,
                "user is not a channel member",
            ));
        }
        Ok(())
    }

    fn send_error(&self, connection_id: ConnectionId, error: ApiError) {
        self.registry
            .send_to_connection(connection_id, ServerEvent::Error(error));
    }
}

#[cfg(test)]
#[path = "tests/relay_tests.rs"]
mod tests;
