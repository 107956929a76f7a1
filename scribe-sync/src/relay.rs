//! Update Relay: document deltas between the engine and the channel.
//!
//! ```text
//! engine ──EngineUpdate{Local}──►  on_engine_update  ──► channel "update"
//! engine ◄──apply(Remote)───────   on_wire_delta     ◄── channel "update"
//!                                   │
//!                                   └─ sender == local ⇒ SelfEcho (dropped)
//! ```
//!
//! Deltas applied from the wire re-emerge from the engine tagged
//! [`Origin::Remote`] and are never published again. Delivery is
//! best-effort: nothing is retried, and an undecodable delta is logged and
//! dropped without disturbing the rest of the stream.

use crate::engine::{EngineUpdate, Origin, ReplicatedDocument};
use crate::protocol::{ClientId, DeltaMessage, WireMessage};
use crate::transport::{ChannelHandle, TransportError};

/// What happened to one inbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Merged into local state.
    Applied,
    /// Our own broadcast came back; ignored.
    SelfEcho,
    /// Addressed to another client; ignored.
    NotAddressed,
    /// Undecodable or rejected; logged and dropped.
    Dropped,
}

/// Per-relay traffic counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub published: u64,
    pub suppressed: u64,
    pub applied: u64,
    pub self_echoes: u64,
    pub dropped: u64,
}

impl RelayStats {
    pub(crate) fn record(&mut self, disposition: Disposition) {
        match disposition {
            Disposition::Applied => self.applied += 1,
            Disposition::SelfEcho => self.self_echoes += 1,
            Disposition::Dropped => self.dropped += 1,
            Disposition::NotAddressed => {}
        }
    }
}

pub struct UpdateRelay {
    local: ClientId,
    channel: ChannelHandle,
    stats: RelayStats,
}

impl UpdateRelay {
    pub fn new(local: ClientId, channel: ChannelHandle) -> Self {
        Self {
            local,
            channel,
            stats: RelayStats::default(),
        }
    }

    /// Publish an engine update if it originated locally.
    ///
    /// Returns `Ok(true)` when a message went out.
    pub fn on_engine_update(&mut self, update: &EngineUpdate) -> Result<bool, TransportError> {
        if update.origin != Origin::Local {
            log::trace!("Suppressing rebroadcast of remote delta ({} bytes)", update.delta.len());
            self.stats.suppressed += 1;
            return Ok(false);
        }
        self.channel
            .send(&WireMessage::delta(self.local, update.delta.clone()))?;
        self.stats.published += 1;
        log::debug!("Published delta ({} bytes) on {}", update.delta.len(), self.channel.name());
        Ok(true)
    }

    /// Apply a delta received from the channel.
    pub fn on_wire_delta<E: ReplicatedDocument>(
        &mut self,
        msg: &DeltaMessage,
        engine: &mut E,
    ) -> Disposition {
        let disposition = if msg.sender == self.local {
            log::trace!("Ignoring self-echo delta");
            Disposition::SelfEcho
        } else {
            match engine.apply_delta(&msg.payload, Origin::Remote) {
                Ok(()) => {
                    log::debug!("Applied delta ({} bytes) from {}", msg.payload.len(), msg.sender);
                    Disposition::Applied
                }
                Err(e) => {
                    log::warn!("Dropping delta from {}: {e}", msg.sender);
                    Disposition::Dropped
                }
            }
        };
        self.stats.record(disposition);
        disposition
    }

    /// Count a message that failed validation before reaching the relay.
    pub fn record_undecodable(&mut self) {
        self.stats.dropped += 1;
    }

    pub fn stats(&self) -> RelayStats {
        self.stats
    }

    pub fn local_id(&self) -> ClientId {
        self.local
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::TextEngine;
    use crate::transport::Outbound;

    fn published_delta(rx: &mut tokio::sync::mpsc::UnboundedReceiver<Outbound>) -> DeltaMessage {
        match rx.try_recv().unwrap() {
            Outbound::Broadcast(env) => match WireMessage::from_envelope(&env).unwrap() {
                WireMessage::Delta(d) => d,
                other => panic!("expected delta, got {other:?}"),
            },
            other => panic!("expected broadcast, got {other:?}"),
        }
    }

    #[test]
    fn test_local_update_is_published() {
        let id = ClientId::random();
        let (handle, mut rx) = ChannelHandle::pair("scribe-doc-1");
        let mut relay = UpdateRelay::new(id, handle);
        let mut engine = TextEngine::new();
        engine.insert_text(0, "hi").unwrap();

        for update in engine.take_updates() {
            assert!(relay.on_engine_update(&update).unwrap());
        }
        let delta = published_delta(&mut rx);
        assert_eq!(delta.sender, id);
        assert_eq!(relay.stats().published, 1);
    }

    #[test]
    fn test_remote_update_is_not_rebroadcast() {
        let (handle, mut rx) = ChannelHandle::pair("scribe-doc-1");
        let mut relay = UpdateRelay::new(ClientId::random(), handle);

        let mut peer = TextEngine::new();
        peer.insert_text(0, "from peer").unwrap();
        let delta = peer.take_updates().remove(0).delta;

        let mut engine = TextEngine::new();
        let msg = DeltaMessage {
            sender: ClientId::random(),
            payload: delta,
        };
        assert_eq!(relay.on_wire_delta(&msg, &mut engine), Disposition::Applied);
        for update in engine.take_updates() {
            assert!(!relay.on_engine_update(&update).unwrap());
        }
        assert!(rx.try_recv().is_err());
        assert_eq!(relay.stats().suppressed, 1);
        assert_eq!(engine.text(), "from peer");
    }

    #[test]
    fn test_self_echo_never_applied() {
        let id = ClientId::random();
        let (handle, mut rx) = ChannelHandle::pair("scribe-doc-1");
        let mut relay = UpdateRelay::new(id, handle);

        let mut engine = TextEngine::new();
        engine.insert_text(0, "mine").unwrap();
        for update in engine.take_updates() {
            relay.on_engine_update(&update).unwrap();
        }
        let echo = published_delta(&mut rx);

        // A fresh engine shows whether the echo would have been applied.
        let mut untouched = TextEngine::new();
        assert_eq!(relay.on_wire_delta(&echo, &mut untouched), Disposition::SelfEcho);
        assert!(untouched.is_empty());
        assert!(untouched.take_updates().is_empty());
        assert_eq!(relay.stats().self_echoes, 1);
    }

    #[test]
    fn test_corrupt_delta_dropped() {
        let (handle, _rx) = ChannelHandle::pair("scribe-doc-1");
        let mut relay = UpdateRelay::new(ClientId::random(), handle);
        let mut engine = TextEngine::new();

        let bad = DeltaMessage {
            sender: ClientId::random(),
            payload: vec![0x05, 0x01],
        };
        assert_eq!(relay.on_wire_delta(&bad, &mut engine), Disposition::Dropped);
        assert_eq!(relay.stats().dropped, 1);

        // The relay keeps working afterwards.
        let mut peer = TextEngine::new();
        peer.insert_text(0, "ok").unwrap();
        let good = DeltaMessage {
            sender: ClientId::random(),
            payload: peer.take_updates().remove(0).delta,
        };
        assert_eq!(relay.on_wire_delta(&good, &mut engine), Disposition::Applied);
        assert_eq!(engine.text(), "ok");
    }
}
