use shared::protocol::{MessagePayload, NoticePayload, ServerEvent};

use crate::{membership::MemberMap, registry::ConnectionRegistry, rooms::RoomTable};

/// Delivers the out-of-room notice for a freshly broadcast message.
///
/// A recipient qualifies when they are a channel member, not the sender,
/// hold at least one live connection, and have no connection joined to the
/// channel's room — a room-joined recipient already saw the broadcast and
/// must not get a duplicate notice. Disconnected members simply miss out;
/// catch-up is the message-list fetch on their next view.
pub fn dispatch_notices(
    registry: &ConnectionRegistry,
    rooms: &RoomTable,
    members: &MemberMap,
    message: &MessagePayload,
) {
    let sender_name = message
        .sender_name
        .clone()
        .or_else(|| members.get(&message.sender_id).cloned())
        .unwrap_or_default();
    let notice = NoticePayload {
        channel_id: message.channel_id,
        message_id: message.message_id,
        sender_id: message.sender_id,
        sender_name,
        preview: NoticePayload::preview_of(&message.content),
    };

    for user_id in members.keys() {
        if *user_id == message.sender_id {
            continue;
        }
        let connections = registry.connections_of(*user_id);
        if connections.is_empty() {
            continue;
        }
        let viewing = connections
            .iter()
            .any(|connection_id| rooms.is_joined(*connection_id, message.channel_id));
        if viewing {
            continue;
        }
        let event = ServerEvent::Notification {
            notice: notice.clone(),
        };
        for connection_id in connections {
            registry.send_to_connection(connection_id, event.clone());
        }
    }
}

#[cfg(test)]
#[path = "tests/notify_tests.rs"]
mod tests;
