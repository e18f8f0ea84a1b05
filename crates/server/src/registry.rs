use std::{
    collections::{HashMap, HashSet},
    sync::{
        atomic::{AtomicI64, Ordering},
        Mutex,
    },
};

use shared::{
    domain::{ConnectionId, Principal, UserId},
    protocol::ServerEvent,
};
use tokio::sync::mpsc;
use tracing::debug;

struct Connection {
    principal: Principal,
    outbound: mpsc::UnboundedSender<ServerEvent>,
}

#[derive(Default)]
struct RegistryInner {
    connections: HashMap<ConnectionId, Connection>,
    by_user: HashMap<UserId, HashSet<ConnectionId>>,
}

/// Maps authenticated principals to their live transport connections. A
/// principal may hold several connections at once (multi-tab, multi-device);
/// each connection owns an outbound event queue drained by its socket task.
///
/// All mutations are single map updates under a short-lived lock, never held
/// across an await.
#[derive(Default)]
pub struct ConnectionRegistry {
    next_id: AtomicI64,
    inner: Mutex<RegistryInner>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &self,
        principal: Principal,
        outbound: mpsc::UnboundedSender<ServerEvent>,
    ) -> ConnectionId {
        let connection_id = ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        let user_id = principal.user_id;
        let mut inner = self.inner.lock().expect("registry lock");
        inner.connections.insert(
            connection_id,
            Connection {
                principal,
                outbound,
            },
        );
        inner
            .by_user
            .entry(user_id)
            .or_default()
            .insert(connection_id);
        debug!(connection_id = connection_id.0, user_id = user_id.0, "connection registered");
        connection_id
    }

    pub fn deregister(&self, connection_id: ConnectionId) -> Option<Principal> {
        let mut inner = self.inner.lock().expect("registry lock");
        let connection = inner.connections.remove(&connection_id)?;
        let user_id = connection.principal.user_id;
        if let Some(set) = inner.by_user.get_mut(&user_id) {
            set.remove(&connection_id);
            if set.is_empty() {
                inner.by_user.remove(&user_id);
            }
        }
        debug!(connection_id = connection_id.0, user_id = user_id.0, "connection deregistered");
        Some(connection.principal)
    }

    pub fn principal_of(&self, connection_id: ConnectionId) -> Option<Principal> {
        let inner = self.inner.lock().expect("registry lock");
        inner
            .connections
            .get(&connection_id)
            .map(|c| c.principal.clone())
    }

    pub fn connections_of(&self, user_id: UserId) -> Vec<ConnectionId> {
        let inner = self.inner.lock().expect("registry lock");
        inner
            .by_user
            .get(&user_id)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn is_connected(&self, user_id: UserId) -> bool {
        let inner = self.inner.lock().expect("registry lock");
        inner.by_user.contains_key(&user_id)
    }

    /// Best-effort delivery to one connection. A closed queue (socket task
    /// already gone) is not an error; the caller must never let one dead
    /// peer abort delivery to the rest.
    pub fn send_to_connection(&self, connection_id: ConnectionId, event: ServerEvent) -> bool {
        let inner = self.inner.lock().expect("registry lock");
        match inner.connections.get(&connection_id) {
            Some(connection) => connection.outbound.send(event).is_ok(),
            None => false,
        }
    }

    pub fn send_to_user(&self, user_id: UserId, event: &ServerEvent) {
        for connection_id in self.connections_of(user_id) {
            self.send_to_connection(connection_id, event.clone());
        }
    }
}

#[cfg(test)]
#[path = "tests/registry_tests.rs"]
mod tests;
