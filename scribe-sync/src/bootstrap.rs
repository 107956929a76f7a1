//! State Bootstrap Protocol.
//!
//! ```text
//!   Init ──start──► Subscribing ──subscribed──► Requesting ──► Synced
//!                                   │                          ▲
//!                                   └ broadcast request-state  │
//!                                                              ├ state-response for us, applied
//!                                                              └ roster says we are alone
//! ```
//!
//! `Requesting` is entered at most once per session, so a session never
//! sends a second `request-state`. Every peer answers a request with its
//! full engine state; the requester applies every response addressed to it,
//! including ones arriving after it is already synced. Duplicate and
//! overlapping states converge in the engine, and an empty answer is still
//! an answer.

use std::fmt;
use std::time::Duration;

use tokio::time::Instant;

use crate::engine::{Origin, ReplicatedDocument};
use crate::protocol::{ClientId, StateRequest, StateResponse, WireMessage};
use crate::relay::Disposition;
use crate::transport::{ChannelHandle, TransportError};

/// Session lifecycle as seen by the bootstrap protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SyncState {
    Init,
    Subscribing,
    Requesting,
    Synced,
}

impl fmt::Display for SyncState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SyncState::Init => "init",
            SyncState::Subscribing => "subscribing",
            SyncState::Requesting => "requesting",
            SyncState::Synced => "synced",
        };
        f.write_str(s)
    }
}

/// How a session became synced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncedVia {
    Response,
    SoleOccupant,
}

pub struct Bootstrap {
    local: ClientId,
    state: SyncState,
    synced_via: Option<SyncedVia>,
    requested_at: Option<Instant>,
    timeout: Duration,
    timeout_fired: bool,
    responses_applied: u32,
    requests_answered: u32,
}

impl Bootstrap {
    pub fn new(local: ClientId, timeout: Duration) -> Self {
        Self {
            local,
            state: SyncState::Init,
            synced_via: None,
            requested_at: None,
            timeout,
            timeout_fired: false,
            responses_applied: 0,
            requests_answered: 0,
        }
    }

    pub fn state(&self) -> SyncState {
        self.state
    }

    pub fn is_synced(&self) -> bool {
        self.state == SyncState::Synced
    }

    pub fn synced_via(&self) -> Option<SyncedVia> {
        self.synced_via
    }

    /// `Init → Subscribing`.
    pub fn begin_subscribe(&mut self) {
        if self.state == SyncState::Init {
            self.transition(SyncState::Subscribing);
        }
    }

    /// `Subscribing → Requesting`: broadcast the one and only state request.
    ///
    /// Returns `Ok(false)` if a request was already sent.
    pub fn on_subscribed(&mut self, channel: &ChannelHandle, now: Instant) -> Result<bool, TransportError> {
        if self.state != SyncState::Subscribing || self.requested_at.is_some() {
            return Ok(false);
        }
        channel.send(&WireMessage::state_request(self.local))?;
        self.requested_at = Some(now);
        self.transition(SyncState::Requesting);
        Ok(true)
    }

    /// Answer a peer's request with our full state.
    pub fn on_state_request<E: ReplicatedDocument>(
        &mut self,
        msg: &StateRequest,
        engine: &E,
        channel: &ChannelHandle,
    ) -> Result<Disposition, TransportError> {
        if msg.sender == self.local {
            return Ok(Disposition::SelfEcho);
        }
        let state = engine.encode_state();
        log::debug!("Answering state request from {} ({} bytes)", msg.sender, state.len());
        channel.send(&WireMessage::state_response(self.local, msg.sender, state))?;
        self.requests_answered += 1;
        Ok(Disposition::Applied)
    }

    /// Apply a response if it is addressed to us.
    pub fn on_state_response<E: ReplicatedDocument>(
        &mut self,
        msg: &StateResponse,
        engine: &mut E,
    ) -> Disposition {
        if msg.recipient != self.local {
            return Disposition::NotAddressed;
        }
        if msg.sender == self.local {
            return Disposition::SelfEcho;
        }
        if let Err(e) = engine.apply_delta(&msg.state, Origin::Remote) {
            log::warn!("Dropping state response from {}: {e}", msg.sender);
            return Disposition::Dropped;
        }
        self.responses_applied += 1;
        log::info!("Applied state from {} ({} bytes)", msg.sender, msg.state.len());
        if self.state == SyncState::Requesting {
            self.synced_via = Some(SyncedVia::Response);
            self.transition(SyncState::Synced);
        }
        Disposition::Applied
    }

    /// `Requesting → Synced` without a response: nobody else is here.
    pub fn complete_alone(&mut self) -> bool {
        if self.state != SyncState::Requesting {
            return false;
        }
        self.synced_via = Some(SyncedVia::SoleOccupant);
        self.transition(SyncState::Synced);
        true
    }

    /// When the wait for a response runs out, if still waiting.
    pub fn deadline(&self) -> Option<Instant> {
        match (self.state, self.requested_at) {
            (SyncState::Requesting, Some(at)) if !self.timeout_fired => Some(at + self.timeout),
            _ => None,
        }
    }

    /// `true` exactly once, when the deadline has passed.
    pub fn poll_timeout(&mut self, now: Instant) -> bool {
        match self.deadline() {
            Some(at) if at <= now => {
                self.timeout_fired = true;
                true
            }
            _ => false,
        }
    }

    pub fn responses_applied(&self) -> u32 {
        self.responses_applied
    }

    pub fn requests_answered(&self) -> u32 {
        self.requests_answered
    }

    fn transition(&mut self, next: SyncState) {
        log::info!("Sync state {} -> {next}", self.state);
        self.state = next;
    }
}
