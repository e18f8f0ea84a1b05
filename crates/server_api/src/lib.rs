use chrono::{DateTime, Utc};
use shared::{
    domain::{ChannelId, ChannelKind, ChannelRole, ChannelSummary, MessageId, UserId},
    error::{ApiError, ErrorCode},
    protocol::MessagePayload,
};
use storage::{Storage, StoredChannel, StoredMessage};
use tracing::warn;

pub const MAX_MESSAGE_CHARS: usize = 4096;
pub const DEFAULT_PAGE_SIZE: u32 = 50;
pub const MAX_PAGE_SIZE: u32 = 100;

#[derive(Clone)]
pub struct ApiContext {
    pub storage: Storage,
}

/// Outcome of a channel-creation request. `created` is false when a DIRECT
/// request resolved to an already-existing channel for the same pair.
#[derive(Debug, Clone)]
pub struct CreatedChannel {
    pub channel: ChannelSummary,
    pub created: bool,
    pub member_ids: Vec<UserId>,
}

pub async fn send_message(
    ctx: &ApiContext,
    user_id: UserId,
    channel_id: ChannelId,
    content: &str,
    parent_id: Option<MessageId>,
) -> Result<MessagePayload, ApiError> {
    let content = content.trim();
    if content.is_empty() {
        return Err(ApiError::new(
            ErrorCode::InvalidMessage,
            "message content cannot be empty",
        ));
    }
    if content.chars().count() > MAX_MESSAGE_CHARS {
        return Err(ApiError::new(
            ErrorCode::InvalidMessage,
            format!("message content exceeds {MAX_MESSAGE_CHARS} characters"),
        ));
    }
    ensure_active_membership(ctx, channel_id, user_id).await?;

    if let Some(parent_id) = parent_id {
        let parent = ctx
            .storage
            .message(parent_id)
            .await
            .map_err(internal)?
            .ok_or_else(|| ApiError::new(ErrorCode::NotFound, "parent message not found"))?;
        if parent.channel_id != channel_id {
            return Err(ApiError::new(
                ErrorCode::InvalidMessage,
                "parent message belongs to another channel",
            ));
        }
    }

    let stored = ctx
        .storage
        .insert_message(channel_id, user_id, content, parent_id)
        .await
        .map_err(persistence)?;
    let sender_name = ctx
        .storage
        .display_name_for_user(user_id)
        .await
        .map_err(internal)?;
    Ok(payload_from(stored, sender_name))
}

pub async fn list_messages(
    ctx: &ApiContext,
    user_id: UserId,
    channel_id: ChannelId,
    limit: u32,
    before: Option<i64>,
) -> Result<Vec<MessagePayload>, ApiError> {
    ensure_active_membership(ctx, channel_id, user_id).await?;

    let messages = ctx
        .storage
        .list_channel_messages(channel_id, limit, before)
        .await
        .map_err(persistence)?;

    let mut name_cache: std::collections::HashMap<UserId, Option<String>> =
        std::collections::HashMap::new();
    let mut payloads = Vec::with_capacity(messages.len());
    for message in messages {
        let sender_name = if let Some(cached) = name_cache.get(&message.sender_id) {
            cached.clone()
        } else {
            let resolved = ctx
                .storage
                .display_name_for_user(message.sender_id)
                .await
                .map_err(internal)?;
            name_cache.insert(message.sender_id, resolved.clone());
            resolved
        };
        payloads.push(payload_from(message, sender_name));
    }
    Ok(payloads)
}

pub async fn list_channels(
    ctx: &ApiContext,
    user_id: UserId,
) -> Result<Vec<ChannelSummary>, ApiError> {
    let channels = ctx
        .storage
        .list_channels_for_user(user_id)
        .await
        .map_err(persistence)?;
    let mut summaries = Vec::with_capacity(channels.len());
    for channel in channels {
        summaries.push(summary_from(ctx, channel, user_id).await?);
    }
    Ok(summaries)
}

pub async fn create_channel(
    ctx: &ApiContext,
    user_id: UserId,
    name: &str,
    kind: ChannelKind,
    is_private: bool,
    member_ids: &[UserId],
) -> Result<CreatedChannel, ApiError> {
    let mut members: Vec<UserId> = member_ids.iter().copied().filter(|m| *m != user_id).collect();
    members.sort_unstable();
    members.dedup();

    if kind == ChannelKind::Direct {
        let &[other] = members.as_slice() else {
            return Err(ApiError::new(
                ErrorCode::InvalidMessage,
                "direct channel requires exactly one other member",
            ));
        };
        // Reuse the pair's existing channel rather than minting a duplicate.
        if let Some(existing) = ctx
            .storage
            .find_direct_channel(user_id, other)
            .await
            .map_err(persistence)?
        {
            let channel = ctx
                .storage
                .channel_info(existing)
                .await
                .map_err(persistence)?
                .ok_or_else(|| ApiError::new(ErrorCode::NotFound, "channel not found"))?;
            return Ok(CreatedChannel {
                channel: summary_from(ctx, channel, user_id).await?,
                created: false,
                member_ids: vec![user_id, other],
            });
        }
    } else if name.trim().is_empty() {
        return Err(ApiError::new(
            ErrorCode::InvalidMessage,
            "channel name cannot be empty",
        ));
    }

    let channel_id = ctx
        .storage
        .create_channel(name.trim(), kind, is_private, user_id)
        .await
        .map_err(persistence)?;
    for member in &members {
        ctx.storage
            .add_channel_member(channel_id, *member, ChannelRole::Member)
            .await
            .map_err(persistence)?;
    }

    let channel = ctx
        .storage
        .channel_info(channel_id)
        .await
        .map_err(persistence)?
        .ok_or_else(|| ApiError::new(ErrorCode::NotFound, "channel not found"))?;
    let mut all_members = members;
    all_members.push(user_id);
    Ok(CreatedChannel {
        channel: summary_from(ctx, channel, user_id).await?,
        created: true,
        member_ids: all_members,
    })
}

pub async fn edit_message(
    ctx: &ApiContext,
    user_id: UserId,
    channel_id: ChannelId,
    message_id: MessageId,
    content: &str,
) -> Result<MessagePayload, ApiError> {
    let content = content.trim();
    if content.is_empty() || content.chars().count() > MAX_MESSAGE_CHARS {
        return Err(ApiError::new(
            ErrorCode::InvalidMessage,
            "invalid replacement content",
        ));
    }
    let message = owned_live_message(ctx, user_id, channel_id, message_id).await?;
    ctx.storage
        .edit_message(message.message_id, content)
        .await
        .map_err(persistence)?;
    let sender_name = ctx
        .storage
        .display_name_for_user(user_id)
        .await
        .map_err(internal)?;
    Ok(payload_from(
        StoredMessage {
            content: content.to_string(),
            is_edited: true,
            ..message
        },
        sender_name,
    ))
}

pub async fn delete_message(
    ctx: &ApiContext,
    user_id: UserId,
    channel_id: ChannelId,
    message_id: MessageId,
) -> Result<(), ApiError> {
    let message = owned_live_message(ctx, user_id, channel_id, message_id).await?;
    ctx.storage
        .soft_delete_message(message.message_id)
        .await
        .map_err(persistence)?;
    Ok(())
}

pub async fn mark_read(
    ctx: &ApiContext,
    user_id: UserId,
    channel_id: ChannelId,
    at: DateTime<Utc>,
) -> Result<(), ApiError> {
    ensure_active_membership(ctx, channel_id, user_id).await?;
    ctx.storage
        .mark_read(channel_id, user_id, at)
        .await
        .map_err(persistence)?;
    Ok(())
}

pub async fn ensure_active_membership(
    ctx: &ApiContext,
    channel_id: ChannelId,
    user_id: UserId,
) -> Result<ChannelRole, ApiError> {
    let membership = ctx
        .storage
        .membership(channel_id, user_id)
        .await
        .map_err(internal)?;
    let Some((role, _)) = membership else {
        return Err(ApiError::new(
            ErrorCode::Forbidden,
            "user is not a channel member",
        ));
    };
    Ok(role)
}

async fn owned_live_message(
    ctx: &ApiContext,
    user_id: UserId,
    channel_id: ChannelId,
    message_id: MessageId,
) -> Result<StoredMessage, ApiError> {
    ensure_active_membership(ctx, channel_id, user_id).await?;
    let message = ctx
        .storage
        .message(message_id)
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::new(ErrorCode::NotFound, "message not found"))?;
    if message.channel_id != channel_id {
        return Err(ApiError::new(
            ErrorCode::NotFound,
            "message not found in channel",
        ));
    }
    if message.sender_id != user_id {
        return Err(ApiError::new(
            ErrorCode::Forbidden,
            "only the sender may modify a message",
        ));
    }
    if message.is_deleted {
        return Err(ApiError::new(ErrorCode::NotFound, "message is deleted"));
    }
    Ok(message)
}

/// DIRECT channels carry no authoritative name; render the counterpart's
/// display name for the requesting member instead.
async fn summary_from(
    ctx: &ApiContext,
    channel: StoredChannel,
    viewer: UserId,
) -> Result<ChannelSummary, ApiError> {
    let name = if channel.kind == ChannelKind::Direct {
        let members = ctx
            .storage
            .members_of_channel(channel.channel_id)
            .await
            .map_err(persistence)?;
        members
            .into_iter()
            .find(|m| m.user_id != viewer)
            .map(|m| m.display_name)
            .unwrap_or_else(|| channel.name.clone())
    } else {
        channel.name.clone()
    };
    Ok(ChannelSummary {
        channel_id: channel.channel_id,
        name,
        kind: channel.kind,
        is_private: channel.is_private,
        created_at: channel.created_at,
        last_read_at: channel.last_read_at,
        unread_count: channel.unread_count,
    })
}

fn payload_from(message: StoredMessage, sender_name: Option<String>) -> MessagePayload {
    MessagePayload {
        message_id: message.message_id,
        channel_id: message.channel_id,
        sender_id: message.sender_id,
        sender_name,
        // Tombstoned rows keep their slot but never leak content.
        content: if message.is_deleted {
            String::new()
        } else {
            message.content
        },
        parent_id: message.parent_id,
        is_edited: message.is_edited,
        is_deleted: message.is_deleted,
        sent_at: message.created_at,
    }
}

fn internal(err: anyhow::Error) -> ApiError {
    ApiError::new(ErrorCode::Internal, err.to_string())
}

fn persistence(err: anyhow::Error) -> ApiError {
    warn!(%err, "persistence collaborator failure");
    ApiError::new(ErrorCode::Persistence, err.to_string())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
