use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use anyhow::Result;
use shared::domain::{ChannelId, UserId};
use storage::Storage;

/// A channel's member set as the index caches it: user → display name.
pub type MemberMap = HashMap<UserId, String>;

/// Cached channel → member mapping used for authorization and fan-out.
/// Backed by the persistence collaborator; entries are invalidated whenever
/// membership changes (channel creation, invite, leave) and lazily reloaded.
pub struct MembershipIndex {
    storage: Storage,
    cache: Mutex<HashMap<ChannelId, Arc<MemberMap>>>,
}

impl MembershipIndex {
    pub fn new(storage: Storage) -> Self {
        Self {
            storage,
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub async fn is_member(&self, channel_id: ChannelId, user_id: UserId) -> Result<bool> {
        let members = self.members_of(channel_id).await?;
        Ok(members.contains_key(&user_id))
    }

    pub async fn members_of(&self, channel_id: ChannelId) -> Result<Arc<MemberMap>> {
        if let Some(cached) = self.cached(channel_id) {
            return Ok(cached);
        }

        let loaded = self.storage.members_of_channel(channel_id).await?;
        let members: MemberMap = loaded
            .into_iter()
            .map(|m| (m.user_id, m.display_name))
            .collect();
        let members = Arc::new(members);
        // Last write wins; concurrent loaders converge on the same storage
        // state and the entry is invalidated on any membership change anyway.
        self.cache
            .lock()
            .expect("membership cache lock")
            .insert(channel_id, Arc::clone(&members));
        Ok(members)
    }

    pub fn invalidate(&self, channel_id: ChannelId) {
        self.cache
            .lock()
            .expect("membership cache lock")
            .remove(&channel_id);
    }

    fn cached(&self, channel_id: ChannelId) -> Option<Arc<MemberMap>> {
        self.cache
            .lock()
            .expect("membership cache lock")
            .get(&channel_id)
            .cloned()
    }
}

#[cfg(test)]
#[path = "tests/membership_tests.rs"]
mod tests;
