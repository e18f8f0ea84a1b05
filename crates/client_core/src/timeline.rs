use std::{
    collections::HashMap,
    time::{Duration, Instant},
};

use chrono::{DateTime, Utc};
use shared::{
    domain::ChannelId,
    protocol::MessagePayload,
};

/// How long an in-flight optimistic entry may wait for a confirm or reject
/// before the timeline declares it failed on its own.
pub const CONFIRM_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OptimisticState {
    InFlight,
    Failed,
}

/// Client-only placeholder rendered before the server confirms a send. Its
/// identity is the correlation token; it never shares the persisted message
/// id space.
#[derive(Debug, Clone)]
pub struct OptimisticMessage {
    pub correlation_token: String,
    pub channel_id: ChannelId,
    pub content: String,
    pub inserted_at: DateTime<Utc>,
    pub state: OptimisticState,
    deadline: Instant,
}

#[derive(Debug, Clone)]
pub enum TimelineEntry {
    Confirmed(MessagePayload),
    Optimistic(OptimisticMessage),
}

/// The visible ordered message list for one channel.
///
/// Confirmed entries stay in ascending `sent_at` order (broadcast order is
/// persistence order); in-flight and failed optimistic entries always sit at
/// the tail, and a confirmation replaces its placeholder in place so the
/// visual position never jumps. Reconciliation is keyed by correlation token
/// through a dedicated index, never by scanning for a guessed id.
#[derive(Default)]
pub struct Timeline {
    entries: Vec<TimelineEntry>,
    pending: HashMap<String, usize>,
    failed: HashMap<String, usize>,
}

impl Timeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces confirmed history (a fresh REST fetch) while carrying the
    /// optimistic tail over.
    pub fn hydrate(&mut self, history: Vec<MessagePayload>) {
        let tail: Vec<TimelineEntry> = self
            .entries
            .drain(..)
            .filter(|entry| matches!(entry, TimelineEntry::Optimistic(_)))
            .collect();
        self.entries = history.into_iter().map(TimelineEntry::Confirmed).collect();
        let base = self.entries.len();
        self.pending.clear();
        self.failed.clear();
        for (offset, entry) in tail.iter().enumerate() {
            let TimelineEntry::Optimistic(optimistic) = entry else {
                continue;
            };
            match optimistic.state {
                OptimisticState::InFlight => {
                    self.pending
                        .insert(optimistic.correlation_token.clone(), base + offset);
                }
                OptimisticState::Failed => {
                    self.failed
                        .insert(optimistic.correlation_token.clone(), base + offset);
                }
            }
        }
        self.entries.extend(tail);
    }

    /// Appends the placeholder at the list tail, regardless of what server
    /// timestamp it will eventually get.
    pub fn push_optimistic(
        &mut self,
        correlation_token: &str,
        channel_id: ChannelId,
        content: &str,
        now: Instant,
    ) {
        let index = self.entries.len();
        self.entries
            .push(TimelineEntry::Optimistic(OptimisticMessage {
                correlation_token: correlation_token.to_string(),
                channel_id,
                content: content.to_string(),
                inserted_at: Utc::now(),
                state: OptimisticState::InFlight,
                deadline: now + CONFIRM_TIMEOUT,
            }));
        self.pending.insert(correlation_token.to_string(), index);
    }

    /// Terminal outcome 1: the authoritative message replaces the
    /// placeholder in its existing list position. Returns false if the token
    /// has no in-flight entry (already resolved, or a foreign token).
    pub fn confirm(&mut self, correlation_token: &str, message: MessagePayload) -> bool {
        if let Some(index) = self.pending.remove(correlation_token) {
            self.entries[index] = TimelineEntry::Confirmed(message);
            return true;
        }
        // A confirm that arrives after the timeout already failed the entry
        // upgrades it rather than duplicating the content.
        if let Some(index) = self.failed.remove(correlation_token) {
            self.entries[index] = TimelineEntry::Confirmed(message);
            return true;
        }
        false
    }

    /// Terminal outcome 2: the entry is retained and flagged so the user can
    /// see the failure and retry; never silently dropped.
    pub fn reject(&mut self, correlation_token: &str) -> bool {
        let Some(index) = self.pending.remove(correlation_token) else {
            return false;
        };
        if let TimelineEntry::Optimistic(optimistic) = &mut self.entries[index] {
            optimistic.state = OptimisticState::Failed;
        }
        self.failed.insert(correlation_token.to_string(), index);
        true
    }

    /// Incoming broadcast from another principal (or another device of this
    /// one). Inserted after the confirmed block so optimistic entries keep
    /// the tail; duplicates by message id update in place.
    pub fn receive(&mut self, message: MessagePayload) {
        if self.update_confirmed(&message) {
            return;
        }
        let insert_at = self
            .entries
            .iter()
            .position(|entry| matches!(entry, TimelineEntry::Optimistic(_)))
            .unwrap_or(self.entries.len());
        self.entries
            .insert(insert_at, TimelineEntry::Confirmed(message));
        for index in self.pending.values_mut() {
            if *index >= insert_at {
                *index += 1;
            }
        }
        for index in self.failed.values_mut() {
            if *index >= insert_at {
                *index += 1;
            }
        }
    }

    /// Marks a confirmed entry deleted without moving it; the slot stays so
    /// ordering and reply threading survive.
    pub fn tombstone(&mut self, message_id: shared::domain::MessageId) -> bool {
        for entry in &mut self.entries {
            if let TimelineEntry::Confirmed(existing) = entry {
                if existing.message_id == message_id {
                    existing.is_deleted = true;
                    existing.content.clear();
                    return true;
                }
            }
        }
        false
    }

    /// In-place refresh for edits and tombstones.
    pub fn update_confirmed(&mut self, message: &MessagePayload) -> bool {
        for entry in &mut self.entries {
            if let TimelineEntry::Confirmed(existing) = entry {
                if existing.message_id == message.message_id {
                    *existing = message.clone();
                    return true;
                }
            }
        }
        false
    }

    /// Bounded-outcome guard: in-flight entries past their deadline fail.
    /// Returns the tokens that just failed so the caller can surface them.
    pub fn expire_pending(&mut self, now: Instant) -> Vec<String> {
        let stale: Vec<(String, usize)> = self
            .pending
            .iter()
            .filter(|(_, index)| {
                matches!(
                    &self.entries[**index],
                    TimelineEntry::Optimistic(optimistic) if optimistic.deadline <= now
                )
            })
            .map(|(token, index)| (token.clone(), *index))
            .collect();
        for (token, index) in &stale {
            self.pending.remove(token);
            if let TimelineEntry::Optimistic(optimistic) = &mut self.entries[*index] {
                optimistic.state = OptimisticState::Failed;
            }
            self.failed.insert(token.clone(), *index);
        }
        stale.into_iter().map(|(token, _)| token).collect()
    }

    /// Re-arms a failed entry under a fresh token for another attempt.
    /// Returns the content to resend.
    pub fn retry(&mut self, correlation_token: &str, new_token: &str, now: Instant) -> Option<String> {
        let index = self.failed.remove(correlation_token)?;
        let TimelineEntry::Optimistic(optimistic) = &mut self.entries[index] else {
            return None;
        };
        optimistic.correlation_token = new_token.to_string();
        optimistic.state = OptimisticState::InFlight;
        optimistic.deadline = now + CONFIRM_TIMEOUT;
        let content = optimistic.content.clone();
        self.pending.insert(new_token.to_string(), index);
        Some(content)
    }

    /// Drops a failed entry the user chose to discard.
    pub fn discard_failed(&mut self, correlation_token: &str) -> bool {
        let Some(index) = self.failed.remove(correlation_token) else {
            return false;
        };
        self.entries.remove(index);
        for position in self.pending.values_mut() {
            if *position > index {
                *position -= 1;
            }
        }
        for position in self.failed.values_mut() {
            if *position > index {
                *position -= 1;
            }
        }
        true
    }

    pub fn entries(&self) -> &[TimelineEntry] {
        &self.entries
    }

    pub fn in_flight(&self) -> usize {
        self.pending.len()
    }

    pub fn failed_tokens(&self) -> Vec<String> {
        self.failed.keys().cloned().collect()
    }
}

#[cfg(test)]
#[path = "tests/timeline_tests.rs"]
mod tests;
