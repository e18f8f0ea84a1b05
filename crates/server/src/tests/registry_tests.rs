use super::*;
use shared::{domain::Role, error::ApiError, error::ErrorCode};

fn principal(id: i64, name: &str) -> Principal {
    Principal {
        user_id: UserId(id),
        display_name: name.to_string(),
        role: Role::Employee,
    }
}

#[test]
fn principal_may_hold_multiple_connections() {
    let registry = ConnectionRegistry::new();
    let (tx_a, _rx_a) = mpsc::unbounded_channel();
    let (tx_b, _rx_b) = mpsc::unbounded_channel();

    let first = registry.register(principal(1, "Alice"), tx_a);
    let second = registry.register(principal(1, "Alice"), tx_b);

    assert_ne!(first, second);
    assert_eq!(registry.connections_of(UserId(1)).len(), 2);
    assert!(registry.is_connected(UserId(1)));
}

#[test]
fn deregister_forgets_the_connection() {
    let registry = ConnectionRegistry::new();
    let (tx, _rx) = mpsc::unbounded_channel();
    let connection_id = registry.register(principal(1, "Alice"), tx);

    let removed = registry.deregister(connection_id).expect("principal");
    assert_eq!(removed.user_id, UserId(1));
    assert!(!registry.is_connected(UserId(1)));
    assert!(registry.principal_of(connection_id).is_none());

    // A second deregister of the same id is a no-op.
    assert!(registry.deregister(connection_id).is_none());
}

#[test]
fn delivery_to_a_dead_queue_reports_failure_without_panicking() {
    let registry = ConnectionRegistry::new();
    let (tx, rx) = mpsc::unbounded_channel();
    let connection_id = registry.register(principal(1, "Alice"), tx);
    drop(rx);

    let delivered = registry.send_to_connection(
        connection_id,
        ServerEvent::Error(ApiError::new(ErrorCode::Internal, "probe")),
    );
    assert!(!delivered);
}

#[test]
fn send_to_user_reaches_every_device() {
    let registry = ConnectionRegistry::new();
    let (tx_a, mut rx_a) = mpsc::unbounded_channel();
    let (tx_b, mut rx_b) = mpsc::unbounded_channel();
    registry.register(principal(1, "Alice"), tx_a);
    registry.register(principal(1, "Alice"), tx_b);

    registry.send_to_user(
        UserId(1),
        &ServerEvent::Error(ApiError::new(ErrorCode::Internal, "probe")),
    );

    assert!(rx_a.try_recv().is_ok());
    assert!(rx_b.try_recv().is_ok());
}
