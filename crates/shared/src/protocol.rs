use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    domain::{ChannelId, ChannelSummary, MessageId, UserId},
    error::ApiError,
};

/// Characters of message content carried in an out-of-room notice.
pub const NOTICE_PREVIEW_CHARS: usize = 80;

/// Requests a client may issue over the live event channel. Message sends go
/// over REST; the socket carries room scoping and ephemeral typing state only.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ClientRequest {
    JoinChannel {
        channel_id: ChannelId,
    },
    LeaveChannel {
        channel_id: ChannelId,
    },
    Typing {
        channel_id: ChannelId,
        is_typing: bool,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessagePayload {
    pub message_id: MessageId,
    pub channel_id: ChannelId,
    pub sender_id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_name: Option<String>,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<MessageId>,
    pub is_edited: bool,
    pub is_deleted: bool,
    pub sent_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TypingPayload {
    pub channel_id: ChannelId,
    pub user_id: UserId,
    pub display_name: String,
    pub is_typing: bool,
}

/// Lightweight out-of-room notice for a recipient not currently viewing the
/// channel the message landed in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NoticePayload {
    pub channel_id: ChannelId,
    pub message_id: MessageId,
    pub sender_id: UserId,
    pub sender_name: String,
    pub preview: String,
}

impl NoticePayload {
    pub fn preview_of(content: &str) -> String {
        if content.chars().count() <= NOTICE_PREVIEW_CHARS {
            return content.to_string();
        }
        let mut preview: String = content.chars().take(NOTICE_PREVIEW_CHARS).collect();
        preview.push('…');
        preview
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ServerEvent {
    MessageReceived {
        message: MessagePayload,
        /// Echo of the sender's client-generated token so the producing
        /// client can reconcile its optimistic placeholder. Carried to every
        /// room connection; non-originators have no matching entry and
        /// ignore it.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        correlation_token: Option<String>,
    },
    MessageUpdated {
        message: MessagePayload,
    },
    MessageDeleted {
        channel_id: ChannelId,
        message_id: MessageId,
    },
    TypingStatus {
        typing: TypingPayload,
    },
    Notification {
        notice: NoticePayload,
    },
    ChannelCreated {
        channel: ChannelSummary,
    },
    Error(ApiError),
}
