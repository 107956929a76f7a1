//! Publish/subscribe transport channel.
//!
//! A channel is a named topic carrying broadcast [`Envelope`]s plus a
//! presence sub-protocol. Delivery is unordered and at-most-once; nothing
//! above this layer may assume otherwise.
//!
//! ```text
//!            ChannelHandle ──Outbound──►  transport task  ──►  topic
//!  Session                                                      │
//!            ChannelEvent  ◄───────────  transport task  ◄──────┘
//! ```
//!
//! Implementations:
//! - [`memory::MemoryHub`]: in-process topics (tests, embedded relay)
//! - [`ws::WsTransport`]: WebSocket client for [`crate::server::RelayServer`]

pub mod frame;
pub mod memory;
pub mod ws;

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::protocol::{Envelope, PresenceMeta, ProtocolError, WireMessage};

pub use memory::MemoryHub;
pub use ws::WsTransport;

/// Events delivered from the channel to its subscriber.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    /// Subscription acknowledged; the channel is usable.
    Subscribed,
    /// Subscription could not be established.
    SubscribeFailed(String),
    /// A broadcast from any member, including ourselves.
    Broadcast(Envelope),
    /// Full presence snapshot.
    PresenceSync(Vec<PresenceMeta>),
    PresenceJoin(Vec<PresenceMeta>),
    PresenceLeave(Vec<PresenceMeta>),
    /// The channel is gone; no further events follow.
    Closed,
}

/// Commands from the subscriber to the channel.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Broadcast(Envelope),
    Track(PresenceMeta),
    Unsubscribe,
}

/// Sending half of a channel subscription.
///
/// Cheap to clone; every relay holds one. Sends never block.
#[derive(Debug, Clone)]
pub struct ChannelHandle {
    name: Arc<str>,
    tx: mpsc::UnboundedSender<Outbound>,
}

impl ChannelHandle {
    /// Create a handle whose commands arrive on the returned receiver.
    ///
    /// Transports use this to build subscriptions; tests use it to observe
    /// exactly what a component publishes.
    pub fn pair(name: &str) -> (Self, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                name: Arc::from(name),
                tx,
            },
            rx,
        )
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Encode and broadcast a protocol message.
    pub fn send(&self, msg: &WireMessage) -> Result<(), TransportError> {
        let envelope = msg.to_envelope()?;
        self.publish(envelope)
    }

    /// Broadcast a pre-built envelope.
    pub fn publish(&self, envelope: Envelope) -> Result<(), TransportError> {
        self.command(Outbound::Broadcast(envelope))
    }

    /// Announce our presence metadata.
    pub fn track(&self, meta: PresenceMeta) -> Result<(), TransportError> {
        self.command(Outbound::Track(meta))
    }

    /// Leave the channel. Idempotent.
    pub fn unsubscribe(&self) {
        let _ = self.tx.send(Outbound::Unsubscribe);
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    fn command(&self, cmd: Outbound) -> Result<(), TransportError> {
        self.tx
            .send(cmd)
            .map_err(|_| TransportError::Closed(self.name.to_string()))
    }
}

/// An established (or pending) subscription.
pub struct Subscription {
    pub handle: ChannelHandle,
    pub events: mpsc::UnboundedReceiver<ChannelEvent>,
}

/// Something that can open channels by name.
///
/// Subscribing spawns the transport's pump task, so it must be called from
/// within a tokio runtime. The subscription is acknowledged asynchronously
/// with [`ChannelEvent::Subscribed`].
pub trait Transport {
    fn subscribe(&self, channel: &str) -> Result<Subscription, TransportError>;
}

impl<T: Transport + ?Sized> Transport for Arc<T> {
    fn subscribe(&self, channel: &str) -> Result<Subscription, TransportError> {
        (**self).subscribe(channel)
    }
}

/// Transport errors.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("channel {0} is closed")]
    Closed(String),
    #[error("could not encode message: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("connection failed: {0}")]
    Connection(String),
}
