//! Presence Roster and first-user election.
//!
//! The roster mirrors the transport's presence primitive: a full snapshot on
//! every sync, incremental joins and leaves in between. Occupancy is always
//! computed against the local client id, so the local user never counts as
//! an "other" user.
//!
//! ## Election
//!
//! `is_first_user()` is true while nobody else is present. Only the first
//! user may seed starter content into an empty document. This is a racy
//! heuristic: two clients whose presence syncs cross in flight can both see
//! themselves alone and both seed. Nothing here detects that.

use std::collections::HashMap;

use chrono::{DateTime, TimeZone, Utc};

use crate::protocol::{ClientId, PresenceMeta};

/// One present user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceEntry {
    pub user_id: ClientId,
    pub username: String,
    pub joined_at: DateTime<Utc>,
}

impl PresenceEntry {
    /// `None` for entries without a username; those are not rendered or
    /// counted.
    pub fn from_meta(meta: &PresenceMeta) -> Option<Self> {
        if meta.username.trim().is_empty() {
            return None;
        }
        let joined_at = Utc
            .timestamp_millis_opt(meta.online_at)
            .single()
            .unwrap_or_else(Utc::now);
        Some(Self {
            user_id: meta.user_id,
            username: meta.username.clone(),
            joined_at,
        })
    }
}

/// Who is currently on the channel.
pub struct PresenceRoster {
    local: ClientId,
    entries: HashMap<ClientId, PresenceEntry>,
    /// Set by the first full sync; occupancy is unknown before that.
    synced: bool,
}

impl PresenceRoster {
    pub fn new(local: ClientId) -> Self {
        Self {
            local,
            entries: HashMap::new(),
            synced: false,
        }
    }

    /// Replace the roster with a full snapshot.
    pub fn sync(&mut self, presences: &[PresenceMeta]) {
        self.entries = presences
            .iter()
            .filter_map(PresenceEntry::from_meta)
            .map(|e| (e.user_id, e))
            .collect();
        self.synced = true;
        log::debug!(
            "Presence sync: {} present, {} others",
            self.entries.len(),
            self.other_users_count()
        );
    }

    pub fn join(&mut self, presences: &[PresenceMeta]) {
        for entry in presences.iter().filter_map(PresenceEntry::from_meta) {
            log::info!("{} joined", entry.username);
            self.entries.insert(entry.user_id, entry);
        }
    }

    /// Remove departed users; returns the ids actually removed.
    pub fn leave(&mut self, presences: &[PresenceMeta]) -> Vec<ClientId> {
        presences
            .iter()
            .filter_map(|meta| self.entries.remove(&meta.user_id))
            .map(|entry| {
                log::info!("{} left", entry.username);
                entry.user_id
            })
            .collect()
    }

    /// Present users other than ourselves.
    pub fn other_users_count(&self) -> usize {
        self.entries
            .keys()
            .filter(|id| **id != self.local)
            .count()
    }

    /// Whether we are alone, as of the last presence event.
    pub fn is_first_user(&self) -> bool {
        self.other_users_count() == 0
    }

    pub fn has_synced(&self) -> bool {
        self.synced
    }

    pub fn contains(&self, user_id: &ClientId) -> bool {
        self.entries.contains_key(user_id)
    }

    /// Present users, earliest joiner first.
    pub fn active_users(&self) -> Vec<PresenceEntry> {
        let mut users: Vec<_> = self.entries.values().cloned().collect();
        users.sort_by(|a, b| {
            a.joined_at
                .cmp(&b.joined_at)
                .then_with(|| a.username.cmp(&b.username))
        });
        users
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn local_id(&self) -> ClientId {
        self.local
    }
}
