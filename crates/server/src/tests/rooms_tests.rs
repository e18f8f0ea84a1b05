use super::*;
use shared::{
    domain::{Principal, Role},
    error::{ApiError, ErrorCode},
};
use tokio::sync::mpsc;

fn principal(id: i64, name: &str) -> Principal {
    Principal {
        user_id: UserId(id),
        display_name: name.to_string(),
        role: Role::Employee,
    }
}

fn probe() -> ServerEvent {
    ServerEvent::Error(ApiError::new(ErrorCode::Internal, "probe"))
}

#[test]
fn join_is_idempotent() {
    let registry = ConnectionRegistry::new();
    let rooms = RoomTable::new();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let connection_id = registry.register(principal(1, "Alice"), tx);

    rooms.join(connection_id, ChannelId(9));
    rooms.join(connection_id, ChannelId(9));

    assert_eq!(rooms.connections_in(ChannelId(9)).len(), 1);

    // One membership entry means exactly one delivery.
    rooms.broadcast(&registry, ChannelId(9), &probe(), None);
    assert!(rx.try_recv().is_ok());
    assert!(rx.try_recv().is_err());
}

#[test]
fn leave_of_non_member_is_a_no_op() {
    let rooms = RoomTable::new();
    rooms.leave(ConnectionId(42), ChannelId(9));
    assert!(rooms.connections_in(ChannelId(9)).is_empty());
}

#[test]
fn joining_a_second_room_does_not_leave_the_first() {
    let registry = ConnectionRegistry::new();
    let rooms = RoomTable::new();
    let (tx, _rx) = mpsc::unbounded_channel();
    let connection_id = registry.register(principal(1, "Alice"), tx);

    rooms.join(connection_id, ChannelId(1));
    rooms.join(connection_id, ChannelId(2));

    assert!(rooms.is_joined(connection_id, ChannelId(1)));
    assert!(rooms.is_joined(connection_id, ChannelId(2)));
}

#[test]
fn leave_all_drops_every_room_for_the_connection() {
    let registry = ConnectionRegistry::new();
    let rooms = RoomTable::new();
    let (tx, _rx) = mpsc::unbounded_channel();
    let connection_id = registry.register(principal(1, "Alice"), tx);

    rooms.join(connection_id, ChannelId(1));
    rooms.join(connection_id, ChannelId(2));
    rooms.leave_all(connection_id);

    assert!(!rooms.is_joined(connection_id, ChannelId(1)));
    assert!(!rooms.is_joined(connection_id, ChannelId(2)));
}

#[test]
fn broadcast_reaches_all_devices_including_the_senders_others() {
    let registry = ConnectionRegistry::new();
    let rooms = RoomTable::new();
    let (tx_tab1, mut rx_tab1) = mpsc::unbounded_channel();
    let (tx_tab2, mut rx_tab2) = mpsc::unbounded_channel();
    let (tx_bob, mut rx_bob) = mpsc::unbounded_channel();
    let tab1 = registry.register(principal(1, "Alice"), tx_tab1);
    let tab2 = registry.register(principal(1, "Alice"), tx_tab2);
    let bob = registry.register(principal(2, "Bob"), tx_bob);

    rooms.join(tab1, ChannelId(9));
    rooms.join(tab2, ChannelId(9));
    rooms.join(bob, ChannelId(9));

    rooms.broadcast(&registry, ChannelId(9), &probe(), None);

    assert!(rx_tab1.try_recv().is_ok());
    assert!(rx_tab2.try_recv().is_ok());
    assert!(rx_bob.try_recv().is_ok());
}

#[test]
fn broadcast_can_exclude_one_connection() {
    let registry = ConnectionRegistry::new();
    let rooms = RoomTable::new();
    let (tx_a, mut rx_a) = mpsc::unbounded_channel();
    let (tx_b, mut rx_b) = mpsc::unbounded_channel();
    let a = registry.register(principal(1, "Alice"), tx_a);
    let b = registry.register(principal(2, "Bob"), tx_b);
    rooms.join(a, ChannelId(9));
    rooms.join(b, ChannelId(9));

    rooms.broadcast(&registry, ChannelId(9), &probe(), Some(a));

    assert!(rx_a.try_recv().is_err());
    assert!(rx_b.try_recv().is_ok());
}

#[test]
fn broadcast_excluding_user_skips_every_device_of_that_user() {
    let registry = ConnectionRegistry::new();
    let rooms = RoomTable::new();
    let (tx_tab1, mut rx_tab1) = mpsc::unbounded_channel();
    let (tx_tab2, mut rx_tab2) = mpsc::unbounded_channel();
    let (tx_bob, mut rx_bob) = mpsc::unbounded_channel();
    let tab1 = registry.register(principal(1, "Alice"), tx_tab1);
    let tab2 = registry.register(principal(1, "Alice"), tx_tab2);
    let bob = registry.register(principal(2, "Bob"), tx_bob);
    rooms.join(tab1, ChannelId(9));
    rooms.join(tab2, ChannelId(9));
    rooms.join(bob, ChannelId(9));

    rooms.broadcast_excluding_user(&registry, ChannelId(9), &probe(), UserId(1));

    assert!(rx_tab1.try_recv().is_err());
    assert!(rx_tab2.try_recv().is_err());
    assert!(rx_bob.try_recv().is_ok());
}

#[test]
fn dead_peer_does_not_abort_fanout_to_the_rest() {
    let registry = ConnectionRegistry::new();
    let rooms = RoomTable::new();
    let (tx_dead, rx_dead) = mpsc::unbounded_channel();
    let (tx_live, mut rx_live) = mpsc::unbounded_channel();
    let dead = registry.register(principal(1, "Alice"), tx_dead);
    let live = registry.register(principal(2, "Bob"), tx_live);
    rooms.join(dead, ChannelId(9));
    rooms.join(live, ChannelId(9));
    drop(rx_dead);

    rooms.broadcast(&registry, ChannelId(9), &probe(), None);

    assert!(rx_live.try_recv().is_ok());
}
