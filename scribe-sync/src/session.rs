//! Collaborative editing session for one document.
//!
//! A [`Session`] owns everything the sync layer needs for one open
//! document and nothing is shared between sessions:
//!
//! ```text
//!                 ┌──────────────────────── Session ───────────────────────┐
//! ChannelEvent ──►│ handle_event ─┬─ Delta ─────────► UpdateRelay ──┐      │
//!                 │               ├─ Request/Resp ──► Bootstrap ────┤      │
//!                 │               ├─ Awareness ─────► AwarenessRelay│      │
//!                 │               └─ Presence ──────► PresenceRoster│      │
//!                 │                                                 ▼      │
//!                 │  engine.take_updates() ──Local──► channel "update"     │
//!                 │                        └─Local──► PersistenceBridge ───┼──► DocumentStorage
//!                 └────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Lifecycle
//!
//! 1. [`Session::start`]: load stored content, build the engine, subscribe.
//! 2. [`Session::step`] in a loop: one event, timer or finished write per
//!    call. Every handler runs to completion before the next one.
//! 3. [`Session::stop`]: unsubscribe, cancel (or flush) the pending save,
//!    wait for in-flight writes, destroy awareness, drop the engine.
//!
//! Local edits are refused until the session is [`SyncState::Synced`]; an
//! edit made before bootstrap would be content no peer or store ever sees.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinSet};
use tokio::time::Instant;

use crate::awareness::{
    AwarenessError, AwarenessRelay, AwarenessState, AwarenessStore, CursorRange, UserProfile,
};
use crate::bootstrap::{Bootstrap, SyncState, SyncedVia};
use crate::config::SessionConfig;
use crate::content::DocumentContent;
use crate::engine::{EngineError, Origin, ReplicatedDocument, TextEngine};
use crate::persistence::{
    load_initial_content, ContentChange, LoadedDocument, PersistenceBridge, PersistenceStats,
    SaveJob, SaveOutcome,
};
use crate::presence::{PresenceEntry, PresenceRoster};
use crate::protocol::{channel_name, ClientId, Envelope, PresenceMeta, WireMessage};
use crate::relay::{Disposition, RelayStats, UpdateRelay};
use crate::storage::DocumentStorage;
use crate::transport::{ChannelEvent, ChannelHandle, Transport, TransportError};

/// Outcome of [`Session::stop`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StopReport {
    pub final_state: SyncState,
    /// A pending save was written during stop.
    pub flushed: bool,
    /// A pending save was discarded during stop.
    pub discarded_pending: bool,
    pub writes_ok: u64,
    pub writes_failed: u64,
}

pub struct Session<E: ReplicatedDocument = TextEngine> {
    config: SessionConfig,
    client_id: ClientId,
    channel_name: String,
    username: String,
    loaded: LoadedDocument,

    engine: E,
    awareness: AwarenessStore,
    channel: ChannelHandle,
    events: mpsc::UnboundedReceiver<ChannelEvent>,

    updates: UpdateRelay,
    awareness_relay: AwarenessRelay,
    bootstrap: Bootstrap,
    roster: PresenceRoster,
    persistence: PersistenceBridge,
    storage: Option<Arc<dyn DocumentStorage>>,
    writes: JoinSet<SaveOutcome>,

    seeded: bool,
    closed: bool,
    last_error: Option<String>,
}

impl Session<TextEngine> {
    /// Start a session backed by a fresh [`TextEngine`].
    pub async fn start<T: Transport + ?Sized>(
        transport: &T,
        storage: Option<Arc<dyn DocumentStorage>>,
        document_id: Option<&str>,
        config: SessionConfig,
    ) -> Result<Self, SessionError> {
        Self::start_with(TextEngine::new, transport, storage, document_id, config).await
    }

    /// Current body as flat text.
    pub fn text(&self) -> String {
        self.engine.text()
    }

    /// Insert at a byte offset. Requires [`SyncState::Synced`].
    pub fn insert_text(&mut self, index: u32, chunk: &str) -> Result<(), SessionError> {
        self.edit(|engine| engine.insert_text(index, chunk))
    }

    /// Append at the end of the body. Requires [`SyncState::Synced`].
    pub fn push_text(&mut self, chunk: &str) -> Result<(), SessionError> {
        self.edit(|engine| engine.push_text(chunk))
    }

    /// Remove a byte range. Requires [`SyncState::Synced`].
    pub fn delete_text(&mut self, index: u32, len: u32) -> Result<(), SessionError> {
        self.edit(|engine| engine.delete_text(index, len))
    }
}

impl<E: ReplicatedDocument> Session<E> {
    /// Load content, build the engine with `make_engine`, and subscribe.
    ///
    /// Storage read failures never fail the start; they fall back to the
    /// starter document.
    pub async fn start_with<T: Transport + ?Sized>(
        make_engine: impl FnOnce() -> E,
        transport: &T,
        storage: Option<Arc<dyn DocumentStorage>>,
        document_id: Option<&str>,
        config: SessionConfig,
    ) -> Result<Self, SessionError> {
        let persist = config.persist && storage.is_some();

        let loaded = match (&storage, document_id) {
            (Some(storage), Some(id)) if persist => {
                let storage = storage.clone();
                let id = id.to_string();
                tokio::task::spawn_blocking(move || load_initial_content(Some(&*storage), Some(&id), true))
                    .await
                    .unwrap_or_else(|e| {
                        log::error!("Initial load task failed: {e}");
                        LoadedDocument::starter()
                    })
            }
            _ => LoadedDocument::starter(),
        };

        let client_id = ClientId::random();
        let channel_name = channel_name(&config.channel_prefix, document_id, &config.default_channel);
        let username = config
            .username
            .clone()
            .filter(|name| !name.trim().is_empty())
            .unwrap_or_else(crate::awareness::random_username);

        let engine = make_engine();
        let awareness = AwarenessStore::new(client_id);

        let sub = transport.subscribe(&channel_name)?;
        let mut bootstrap = Bootstrap::new(client_id, config.bootstrap_timeout());
        bootstrap.begin_subscribe();

        log::info!("Session {client_id} ({username}) joining {channel_name}");

        Ok(Self {
            persistence: PersistenceBridge::new(
                document_id.map(str::to_string),
                persist,
                config.save_debounce(),
            ),
            updates: UpdateRelay::new(client_id, sub.handle.clone()),
            awareness_relay: AwarenessRelay::new(client_id, sub.handle.clone()),
            roster: PresenceRoster::new(client_id),
            channel: sub.handle,
            events: sub.events,
            config,
            client_id,
            channel_name,
            username,
            loaded,
            engine,
            awareness,
            bootstrap,
            storage,
            writes: JoinSet::new(),
            seeded: false,
            closed: false,
            last_error: None,
        })
    }

    // ─── Event loop ───────────────────────────────────────────────────

    /// Wait for and handle the next event, timer expiry or finished write.
    ///
    /// Returns `Ok(false)` once the channel is closed and nothing is left
    /// to wait for.
    pub async fn step(&mut self) -> Result<bool, SessionError> {
        let save_at = self.persistence.deadline();
        let bootstrap_at = self.bootstrap.deadline();
        let now = Instant::now();

        tokio::select! {
            event = self.events.recv(), if !self.closed => {
                match event {
                    Some(event) => self.handle_event(event, Instant::now())?,
                    None => self.mark_closed(),
                }
            }
            _ = tokio::time::sleep_until(save_at.unwrap_or(now)), if save_at.is_some() => {
                self.poll_save(Instant::now());
            }
            _ = tokio::time::sleep_until(bootstrap_at.unwrap_or(now)), if bootstrap_at.is_some() && !self.closed => {
                self.poll_bootstrap(Instant::now());
            }
            Some(finished) = self.writes.join_next(), if !self.writes.is_empty() => {
                self.on_write_finished(finished);
            }
            else => return Ok(false),
        }
        Ok(true)
    }

    /// Step until synced, or fail after `limit`.
    pub async fn run_until_synced(&mut self, limit: Duration) -> Result<(), SessionError> {
        let wait = async {
            while !self.is_synced() {
                if !self.step().await? {
                    return Err(SessionError::Closed);
                }
            }
            Ok::<(), SessionError>(())
        };
        tokio::time::timeout(limit, wait)
            .await
            .map_err(|_| SessionError::SyncTimeout(limit))?
    }

    /// Step until nothing happens for `idle`. Returns the number of steps.
    pub async fn settle(&mut self, idle: Duration) -> Result<usize, SessionError> {
        let mut steps = 0;
        loop {
            match tokio::time::timeout(idle, self.step()).await {
                Ok(Ok(true)) => steps += 1,
                Ok(Ok(false)) | Err(_) => return Ok(steps),
                Ok(Err(e)) => return Err(e),
            }
        }
    }

    /// Dispatch one channel event.
    pub fn handle_event(&mut self, event: ChannelEvent, now: Instant) -> Result<(), SessionError> {
        match event {
            ChannelEvent::Subscribed => self.on_subscribed(now)?,
            ChannelEvent::SubscribeFailed(reason) => {
                log::error!("Subscription to {} failed: {reason}", self.channel_name);
                self.last_error = Some(reason);
            }
            ChannelEvent::Broadcast(envelope) => self.on_broadcast(&envelope)?,
            ChannelEvent::PresenceSync(presences) => {
                self.roster.sync(&presences);
                self.maybe_complete_alone();
            }
            ChannelEvent::PresenceJoin(presences) => {
                self.roster.join(&presences);
                // Newcomers missed our earlier awareness broadcasts.
                if presences.iter().any(|p| p.user_id != self.client_id) {
                    self.awareness_relay.publish_local(&self.awareness)?;
                }
            }
            ChannelEvent::PresenceLeave(presences) => {
                let gone = self.roster.leave(&presences);
                let ids: Vec<ClientId> = presences.iter().map(|p| p.user_id).chain(gone).collect();
                self.awareness.remove_states(&ids, Origin::Remote);
            }
            ChannelEvent::Closed => self.mark_closed(),
        }
        self.process_pending(now)?;
        Ok(())
    }

    fn on_subscribed(&mut self, now: Instant) -> Result<(), SessionError> {
        if self.bootstrap.state() != SyncState::Subscribing {
            return Ok(());
        }
        self.channel
            .track(PresenceMeta::now(self.client_id, self.username.clone()))?;

        let change = self.awareness.set_local_state(AwarenessState {
            user: UserProfile::named(self.username.clone()),
            cursor: None,
        });
        self.awareness_relay.publish_change(&self.awareness, &change)?;

        self.bootstrap.on_subscribed(&self.channel, now)?;
        Ok(())
    }

    fn on_broadcast(&mut self, envelope: &Envelope) -> Result<(), SessionError> {
        let msg = match WireMessage::from_envelope(envelope) {
            Ok(msg) => msg,
            Err(e) => {
                log::warn!("Dropping invalid '{}' message: {e}", envelope.event);
                self.updates.record_undecodable();
                return Ok(());
            }
        };

        match msg {
            WireMessage::Delta(delta) => {
                self.updates.on_wire_delta(&delta, &mut self.engine);
            }
            WireMessage::StateRequest(request) => {
                self.bootstrap
                    .on_state_request(&request, &self.engine, &self.channel)?;
            }
            WireMessage::StateResponse(response) => {
                let was_synced = self.bootstrap.is_synced();
                let disposition = self.bootstrap.on_state_response(&response, &mut self.engine);
                if disposition == Disposition::Applied && !was_synced && self.bootstrap.is_synced() {
                    self.on_synced();
                }
            }
            WireMessage::Awareness(update) => {
                self.awareness_relay
                    .on_wire_update(&update, &mut self.awareness);
            }
        }
        Ok(())
    }

    /// Drain engine updates: publish local ones and feed the bridge.
    pub fn process_pending(&mut self, now: Instant) -> Result<(), SessionError> {
        for update in self.engine.take_updates() {
            self.updates.on_engine_update(&update)?;
            let change = match update.origin {
                Origin::Local => ContentChange::local_edit(),
                Origin::Remote => ContentChange::remote_edit(),
            };
            let engine = &self.engine;
            self.persistence
                .on_content_change(change, || engine.content(), now);
        }
        Ok(())
    }

    fn maybe_complete_alone(&mut self) {
        if self.bootstrap.state() != SyncState::Requesting {
            return;
        }
        if self.roster_shows_alone() && self.bootstrap.complete_alone() {
            self.on_synced();
        }
    }

    /// Only trust a presence snapshot that already contains our own entry.
    fn roster_shows_alone(&self) -> bool {
        self.roster.has_synced() && self.roster.contains(&self.client_id) && self.roster.is_first_user()
    }

    fn poll_bootstrap(&mut self, now: Instant) {
        if self.closed || !self.bootstrap.poll_timeout(now) {
            return;
        }
        if self.roster_shows_alone() {
            log::info!("No state response within {:?}, assuming sole occupant", self.config.bootstrap_timeout());
            if self.bootstrap.complete_alone() {
                self.on_synced();
            }
        } else {
            log::warn!(
                "No state response within {:?} ({} other users, snapshot seen: {}); still waiting",
                self.config.bootstrap_timeout(),
                self.roster.other_users_count(),
                self.roster.has_synced()
            );
        }
    }

    /// Seed starter content if we became synced as the sole occupant.
    ///
    /// The seed is broadcast like any local edit but never saved: it came
    /// from storage in the first place.
    fn on_synced(&mut self) {
        log::info!("Session {} synced on {}", self.client_id, self.channel_name);
        if self.bootstrap.synced_via() != Some(SyncedVia::SoleOccupant) || self.seeded {
            return;
        }
        if !self.engine.is_empty() {
            return;
        }
        self.seeded = self.engine.seed(&self.loaded.content);
        for update in self.engine.take_updates() {
            if let Err(e) = self.updates.on_engine_update(&update) {
                log::warn!("Failed to broadcast starter content: {e}");
            }
        }
    }

    fn poll_save(&mut self, now: Instant) {
        if let Some(job) = self.persistence.poll_due(now) {
            self.spawn_write(job);
        }
    }

    fn spawn_write(&mut self, job: SaveJob) {
        match &self.storage {
            Some(storage) => {
                let storage = storage.clone();
                self.writes.spawn_blocking(move || job.execute(&*storage));
            }
            None => log::warn!("No storage attached, dropping save of {}", job.document_id),
        }
    }

    fn on_write_finished(&mut self, finished: Result<SaveOutcome, JoinError>) {
        match finished {
            Ok(outcome) => self.persistence.record_outcome(&outcome),
            Err(e) => log::error!("Save task failed: {e}"),
        }
    }

    fn mark_closed(&mut self) {
        if !self.closed {
            log::info!("Channel {} closed", self.channel_name);
        }
        self.closed = true;
    }

    // ─── Local operations ─────────────────────────────────────────────

    /// Run a local mutation against the engine and publish the result.
    pub fn edit<R>(&mut self, f: impl FnOnce(&mut E) -> Result<R, EngineError>) -> Result<R, SessionError> {
        if self.closed {
            return Err(SessionError::Closed);
        }
        if !self.bootstrap.is_synced() {
            return Err(SessionError::NotSynced(self.bootstrap.state()));
        }
        let out = f(&mut self.engine)?;
        self.process_pending(Instant::now())?;
        Ok(out)
    }

    /// Move the local cursor. Allowed once subscribed; never saves.
    pub fn set_cursor(&mut self, cursor: Option<CursorRange>) -> Result<(), SessionError> {
        if self.closed {
            return Err(SessionError::Closed);
        }
        if self.bootstrap.state() < SyncState::Requesting {
            return Err(SessionError::NotSynced(self.bootstrap.state()));
        }
        let change = self.awareness.set_local_cursor(cursor)?;
        self.awareness_relay.publish_change(&self.awareness, &change)?;
        self.persistence
            .on_content_change(ContentChange::selection(), DocumentContent::empty, Instant::now());
        Ok(())
    }

    /// Leave the channel and tear down in order.
    pub async fn stop(mut self) -> StopReport {
        let final_state = self.bootstrap.state();

        self.channel.unsubscribe();
        self.closed = true;

        let mut flushed = false;
        let mut discarded_pending = false;
        if self.config.flush_on_stop {
            if let Some(job) = self.persistence.flush() {
                self.spawn_write(job);
                flushed = true;
            }
        } else if self.persistence.cancel() {
            log::warn!("Discarding unsaved changes to {:?} on stop", self.persistence.document_id());
            discarded_pending = true;
        }
        while let Some(finished) = self.writes.join_next().await {
            self.on_write_finished(finished);
        }

        self.awareness.destroy();
        let stats = self.persistence.stats();
        drop(self.engine);

        log::info!("Session {} stopped ({final_state})", self.client_id);
        StopReport {
            final_state,
            flushed,
            discarded_pending,
            writes_ok: stats.writes_ok,
            writes_failed: stats.writes_failed,
        }
    }

    // ─── Accessors ────────────────────────────────────────────────────

    pub fn client_id(&self) -> ClientId {
        self.client_id
    }

    pub fn channel_name(&self) -> &str {
        &self.channel_name
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn sync_state(&self) -> SyncState {
        self.bootstrap.state()
    }

    pub fn is_synced(&self) -> bool {
        self.bootstrap.is_synced()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    pub fn content(&self) -> DocumentContent {
        self.engine.content()
    }

    /// What was loaded from storage at start.
    pub fn loaded(&self) -> &LoadedDocument {
        &self.loaded
    }

    pub fn awareness(&self) -> &AwarenessStore {
        &self.awareness
    }

    pub fn roster(&self) -> &PresenceRoster {
        &self.roster
    }

    pub fn active_users(&self) -> Vec<PresenceEntry> {
        self.roster.active_users()
    }

    pub fn is_first_user(&self) -> bool {
        self.roster.is_first_user()
    }

    pub fn other_users_count(&self) -> usize {
        self.roster.other_users_count()
    }

    pub fn bootstrap(&self) -> &Bootstrap {
        &self.bootstrap
    }

    pub fn relay_stats(&self) -> RelayStats {
        self.updates.stats()
    }

    pub fn awareness_stats(&self) -> RelayStats {
        self.awareness_relay.stats()
    }

    pub fn persistence_stats(&self) -> PersistenceStats {
        self.persistence.stats()
    }

    pub fn last_saved(&self) -> Option<chrono::DateTime<chrono::Utc>> {
        self.persistence.last_saved()
    }

    /// Whether starter content was seeded by this session.
    pub fn seeded(&self) -> bool {
        self.seeded
    }

    /// Last subscription failure reported by the transport.
    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }
}

/// Session errors.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("session is not synced yet (state: {0})")]
    NotSynced(SyncState),
    #[error("session is closed")]
    Closed,
    #[error("not synced after {0:?}")]
    SyncTimeout(Duration),
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Awareness(#[from] AwarenessError),
}
