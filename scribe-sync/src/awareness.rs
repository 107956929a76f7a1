//! Awareness: ephemeral per-user presence and cursor state.
//!
//! Each client owns exactly one entry in every peer's [`AwarenessStore`],
//! keyed by its [`ClientId`] and versioned by a per-client clock. Local
//! changes are encoded as a delta over only the changed client ids and
//! broadcast as `awareness-update`; peers merge deltas whose clock is newer
//! than what they hold.
//!
//! ```text
//! set_local_cursor() ──► AwarenessChange{Local} ──► AwarenessRelay::publish_change
//!                                                        │ bincode delta
//!                                                        ▼
//!                                             channel "awareness-update"
//!                                                        │
//! AwarenessStore::apply_update(Remote) ◄── AwarenessRelay::on_wire_update
//! ```
//!
//! Nothing here is persisted. A peer's entry disappears when the transport
//! reports it left (see [`AwarenessStore::remove_states`]).

use std::collections::{HashMap, HashSet};

use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::engine::Origin;
use crate::protocol::{AwarenessUpdate, ClientId, WireMessage};
use crate::relay::{Disposition, RelayStats};
use crate::transport::{ChannelHandle, TransportError};

// ───────────────────────────────────────────────────────────────────
// State types
// ───────────────────────────────────────────────────────────────────

const ADJECTIVES: [&str; 5] = ["Happy", "Clever", "Brave", "Bright", "Kind"];
const NOUNS: [&str; 5] = ["Panda", "Tiger", "Eagle", "Dolphin", "Fox"];

/// Display identity shown next to a user's cursor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProfile {
    pub name: String,
    /// CSS color, `hsl(<hue>, 70%, 50%)`.
    pub color: String,
}

impl UserProfile {
    pub fn new(name: impl Into<String>, color: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            color: color.into(),
        }
    }

    /// Given name, random color.
    pub fn named(name: impl Into<String>) -> Self {
        Self::new(name, random_color())
    }
}

/// `<Adjective><Noun><0-99>`, e.g. `BraveFox42`.
pub fn random_username() -> String {
    let mut rng = rand::thread_rng();
    let adjective = ADJECTIVES.choose(&mut rng).copied().unwrap_or("Kind");
    let noun = NOUNS.choose(&mut rng).copied().unwrap_or("Fox");
    format!("{adjective}{noun}{}", rng.gen_range(0..100))
}

pub fn random_color() -> String {
    let hue: u16 = rand::thread_rng().gen_range(0..360);
    format!("hsl({hue}, 70%, 50%)")
}

/// Selection in document byte offsets. `anchor == head` is a caret.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CursorRange {
    pub anchor: u32,
    pub head: u32,
}

impl CursorRange {
    pub fn caret(at: u32) -> Self {
        Self { anchor: at, head: at }
    }

    pub fn is_collapsed(&self) -> bool {
        self.anchor == self.head
    }
}

/// One client's awareness entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AwarenessState {
    pub user: UserProfile,
    pub cursor: Option<CursorRange>,
}

/// Client ids touched by one store operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AwarenessChange {
    pub added: Vec<ClientId>,
    pub updated: Vec<ClientId>,
    pub removed: Vec<ClientId>,
    pub origin: Origin,
}

impl AwarenessChange {
    fn new(origin: Origin) -> Self {
        Self {
            added: Vec::new(),
            updated: Vec::new(),
            removed: Vec::new(),
            origin,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.updated.is_empty() && self.removed.is_empty()
    }

    /// Every id in the change, the set a delta must cover.
    pub fn changed_clients(&self) -> Vec<ClientId> {
        self.added
            .iter()
            .chain(&self.updated)
            .chain(&self.removed)
            .copied()
            .collect()
    }
}

// ───────────────────────────────────────────────────────────────────
// Wire encoding
// ───────────────────────────────────────────────────────────────────

/// `state: None` marks a removed client.
#[derive(Debug, Serialize, Deserialize)]
struct DeltaEntry {
    client: ClientId,
    clock: u32,
    state: Option<AwarenessState>,
}

#[derive(Debug, Serialize, Deserialize)]
struct AwarenessDelta {
    entries: Vec<DeltaEntry>,
}

impl AwarenessDelta {
    fn encode(&self) -> Result<Vec<u8>, AwarenessError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| AwarenessError::Encode(e.to_string()))
    }

    fn decode(bytes: &[u8]) -> Result<Self, AwarenessError> {
        let (delta, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| AwarenessError::Decode(e.to_string()))?;
        Ok(delta)
    }
}

// ───────────────────────────────────────────────────────────────────
// Store
// ───────────────────────────────────────────────────────────────────

/// Awareness entries for every known client, the local one included.
pub struct AwarenessStore {
    local: ClientId,
    states: HashMap<ClientId, AwarenessState>,
    /// Survives removal so late, stale deltas cannot resurrect an entry.
    clocks: HashMap<ClientId, u32>,
    /// Clients the transport reported as gone. Their in-flight updates
    /// are refused.
    departed: HashSet<ClientId>,
}

impl AwarenessStore {
    pub fn new(local: ClientId) -> Self {
        Self {
            local,
            states: HashMap::new(),
            clocks: HashMap::new(),
            departed: HashSet::new(),
        }
    }

    pub fn local_id(&self) -> ClientId {
        self.local
    }

    /// Replace the whole local entry.
    pub fn set_local_state(&mut self, state: AwarenessState) -> AwarenessChange {
        let mut change = AwarenessChange::new(Origin::Local);
        let clock = self.bump_local_clock();
        // A replaced entry counts as updated even when unchanged: the new
        // clock tells peers the client is alive.
        if self.states.insert(self.local, state).is_some() {
            change.updated.push(self.local);
        } else {
            change.added.push(self.local);
        }
        log::trace!("Local awareness clock {clock}");
        change
    }

    /// Move the local cursor. Requires a local entry.
    pub fn set_local_cursor(
        &mut self,
        cursor: Option<CursorRange>,
    ) -> Result<AwarenessChange, AwarenessError> {
        let user = self
            .local_state()
            .map(|s| s.user.clone())
            .ok_or(AwarenessError::NoLocalState)?;
        Ok(self.set_local_state(AwarenessState { user, cursor }))
    }

    pub fn local_state(&self) -> Option<&AwarenessState> {
        self.states.get(&self.local)
    }

    pub fn state(&self, client: &ClientId) -> Option<&AwarenessState> {
        self.states.get(client)
    }

    /// Entries of every client except ourselves.
    pub fn remote_states(&self) -> impl Iterator<Item = (&ClientId, &AwarenessState)> + '_ {
        let local = self.local;
        self.states.iter().filter(move |(id, _)| **id != local)
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    /// Encode a delta covering `clients`. Unknown ids are encoded as removed.
    pub fn encode_update(&self, clients: &[ClientId]) -> Result<Vec<u8>, AwarenessError> {
        let entries = clients
            .iter()
            .map(|client| DeltaEntry {
                client: *client,
                clock: self.clocks.get(client).copied().unwrap_or(0),
                state: self.states.get(client).cloned(),
            })
            .collect();
        AwarenessDelta { entries }.encode()
    }

    /// Merge a delta produced by another peer.
    ///
    /// Entries for the local client and for departed clients are ignored.
    /// An entry is taken only when its clock is newer than the one held; a
    /// removal at the same clock also wins.
    pub fn apply_update(&mut self, bytes: &[u8], origin: Origin) -> Result<AwarenessChange, AwarenessError> {
        let delta = AwarenessDelta::decode(bytes)?;
        let mut change = AwarenessChange::new(origin);

        for entry in delta.entries {
            if entry.client == self.local || self.departed.contains(&entry.client) {
                continue;
            }
            let known = self.clocks.get(&entry.client).copied();
            let newer = known.map_or(true, |c| entry.clock > c);
            let same_clock_removal =
                known == Some(entry.clock) && entry.state.is_none() && self.states.contains_key(&entry.client);
            if !newer && !same_clock_removal {
                continue;
            }
            self.clocks.insert(entry.client, entry.clock);

            match entry.state {
                Some(state) => match self.states.insert(entry.client, state.clone()) {
                    None => change.added.push(entry.client),
                    Some(prev) if prev != state => change.updated.push(entry.client),
                    Some(_) => {}
                },
                None => {
                    if self.states.remove(&entry.client).is_some() {
                        change.removed.push(entry.client);
                    }
                }
            }
        }
        Ok(change)
    }

    /// Drop entries for clients the transport reported as gone.
    ///
    /// The local entry is never removed this way.
    pub fn remove_states(&mut self, clients: &[ClientId], origin: Origin) -> AwarenessChange {
        let mut change = AwarenessChange::new(origin);
        for client in clients {
            if *client == self.local {
                continue;
            }
            self.departed.insert(*client);
            if self.states.remove(client).is_some() {
                change.removed.push(*client);
            }
        }
        change
    }

    /// Clear every entry. The store is unusable for publishing afterwards.
    pub fn destroy(&mut self) -> AwarenessChange {
        let mut change = AwarenessChange::new(Origin::Local);
        change.removed = self.states.keys().copied().collect();
        self.states.clear();
        self.clocks.clear();
        self.departed.clear();
        change
    }

    fn bump_local_clock(&mut self) -> u32 {
        let clock = self.clocks.entry(self.local).or_insert(0);
        *clock += 1;
        *clock
    }
}

// ───────────────────────────────────────────────────────────────────
// Relay
// ───────────────────────────────────────────────────────────────────

/// Awareness Relay: the [`crate::relay::UpdateRelay`] rules applied to the
/// awareness store.
pub struct AwarenessRelay {
    local: ClientId,
    channel: ChannelHandle,
    stats: RelayStats,
}

impl AwarenessRelay {
    pub fn new(local: ClientId, channel: ChannelHandle) -> Self {
        Self {
            local,
            channel,
            stats: RelayStats::default(),
        }
    }

    /// Broadcast a local change. Remote and empty changes are not sent.
    pub fn publish_change(
        &mut self,
        store: &AwarenessStore,
        change: &AwarenessChange,
    ) -> Result<bool, AwarenessError> {
        if change.origin != Origin::Local || change.is_empty() {
            self.stats.suppressed += 1;
            return Ok(false);
        }
        let payload = store.encode_update(&change.changed_clients())?;
        self.channel
            .send(&WireMessage::awareness(self.local, payload))?;
        self.stats.published += 1;
        Ok(true)
    }

    /// Re-send the local entry at its current clock, for peers that joined
    /// after it was last published. Peers that already hold it ignore it.
    pub fn publish_local(&mut self, store: &AwarenessStore) -> Result<bool, AwarenessError> {
        if store.local_state().is_none() {
            return Ok(false);
        }
        let payload = store.encode_update(&[self.local])?;
        self.channel
            .send(&WireMessage::awareness(self.local, payload))?;
        self.stats.published += 1;
        Ok(true)
    }

    /// Merge an inbound awareness update.
    pub fn on_wire_update(&mut self, msg: &AwarenessUpdate, store: &mut AwarenessStore) -> Disposition {
        let disposition = if msg.sender == self.local {
            Disposition::SelfEcho
        } else {
            match store.apply_update(&msg.payload, Origin::Remote) {
                Ok(change) => {
                    if !change.is_empty() {
                        log::debug!(
                            "Awareness from {}: +{} ~{} -{}",
                            msg.sender,
                            change.added.len(),
                            change.updated.len(),
                            change.removed.len()
                        );
                    }
                    Disposition::Applied
                }
                Err(e) => {
                    log::warn!("Dropping awareness update from {}: {e}", msg.sender);
                    Disposition::Dropped
                }
            }
        };
        self.stats.record(disposition);
        disposition
    }

    pub fn stats(&self) -> RelayStats {
        self.stats
    }
}

/// Awareness errors.
#[derive(Debug, thiserror::Error)]
pub enum AwarenessError {
    #[error("no local awareness state")]
    NoLocalState,
    #[error("awareness encode failed: {0}")]
    Encode(String),
    #[error("undecodable awareness update: {0}")]
    Decode(String),
    #[error(transparent)]
    Transport(#[from] TransportError),
}
