use std::{
    collections::{HashMap, HashSet},
    sync::Mutex,
};

use shared::{
    domain::{ChannelId, ConnectionId, UserId},
    protocol::ServerEvent,
};

use crate::registry::ConnectionRegistry;

#[derive(Default)]
struct RoomsInner {
    rooms: HashMap<ChannelId, HashSet<ConnectionId>>,
    joined: HashMap<ConnectionId, HashSet<ChannelId>>,
}

/// The runtime working set for fan-out scoping: which connections are
/// currently "viewing" which channel. Rebuilt as connections join and
/// discarded wholesale on disconnect; never durable.
///
/// Joins are idempotent and leaving a room the connection never joined is a
/// no-op, so client retries and fast navigation cannot corrupt the table.
#[derive(Default)]
pub struct RoomTable {
    inner: Mutex<RoomsInner>,
}

impl RoomTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn join(&self, connection_id: ConnectionId, channel_id: ChannelId) {
        let mut inner = self.inner.lock().expect("rooms lock");
        inner.rooms.entry(channel_id).or_default().insert(connection_id);
        inner
            .joined
            .entry(connection_id)
            .or_default()
            .insert(channel_id);
    }

    pub fn leave(&self, connection_id: ConnectionId, channel_id: ChannelId) {
        let mut inner = self.inner.lock().expect("rooms lock");
        if let Some(members) = inner.rooms.get_mut(&channel_id) {
            members.remove(&connection_id);
            if members.is_empty() {
                inner.rooms.remove(&channel_id);
            }
        }
        if let Some(channels) = inner.joined.get_mut(&connection_id) {
            channels.remove(&channel_id);
            if channels.is_empty() {
                inner.joined.remove(&connection_id);
            }
        }
    }

    /// Drops every room membership the connection holds; called on
    /// disconnect so a crashed client cannot leak room state.
    pub fn leave_all(&self, connection_id: ConnectionId) {
        let mut inner = self.inner.lock().expect("rooms lock");
        let Some(channels) = inner.joined.remove(&connection_id) else {
            return;
        };
        for channel_id in channels {
            if let Some(members) = inner.rooms.get_mut(&channel_id) {
                members.remove(&connection_id);
                if members.is_empty() {
                    inner.rooms.remove(&channel_id);
                }
            }
        }
    }

    pub fn is_joined(&self, connection_id: ConnectionId, channel_id: ChannelId) -> bool {
        let inner = self.inner.lock().expect("rooms lock");
        inner
            .rooms
            .get(&channel_id)
            .is_some_and(|members| members.contains(&connection_id))
    }

    pub fn connections_in(&self, channel_id: ChannelId) -> Vec<ConnectionId> {
        let inner = self.inner.lock().expect("rooms lock");
        inner
            .rooms
            .get(&channel_id)
            .map(|members| members.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Fans an event out to every connection currently joined to the
    /// channel's room, across all principals and all of a principal's
    /// devices. Delivery is per-connection best-effort; a dead peer never
    /// aborts the rest.
    pub fn broadcast(
        &self,
        registry: &ConnectionRegistry,
        channel_id: ChannelId,
        event: &ServerEvent,
        exclude: Option<ConnectionId>,
    ) {
        for connection_id in self.connections_in(channel_id) {
            if Some(connection_id) == exclude {
                continue;
            }
            registry.send_to_connection(connection_id, event.clone());
        }
    }

    /// Room broadcast that skips every connection belonging to one
    /// principal. Typing echoes use this: the typist's own devices never
    /// see their own indicator.
    pub fn broadcast_excluding_user(
        &self,
        registry: &ConnectionRegistry,
        channel_id: ChannelId,
        event: &ServerEvent,
        excluded_user: UserId,
    ) {
        for connection_id in self.connections_in(channel_id) {
            if registry
                .principal_of(connection_id)
                .is_some_and(|p| p.user_id == excluded_user)
            {
                continue;
            }
            registry.send_to_connection(connection_id, event.clone());
        }
    }
}

#[cfg(test)]
#[path = "tests/rooms_tests.rs"]
mod tests;
