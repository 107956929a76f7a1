//! # scribe-sync: Peer-to-peer sync layer for collaborative documents
//!
//! Relays CRDT deltas between any number of peers over an unordered
//! publish/subscribe channel, bootstraps late joiners from a peer's full
//! state, propagates ephemeral cursor awareness, and debounces converged
//! content into durable storage.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   update / request-state /   ┌─────────────┐
//! │ Session A   │   state-response / awareness │ Session B   │
//! │  TextEngine │ ◄──────────────────────────► │  TextEngine │
//! └──────┬──────┘     Transport channel        └──────┬──────┘
//!        │            (MemoryHub or relay)            │
//!        ▼                                            ▼
//! ┌─────────────┐                              ┌─────────────┐
//! │ Persistence │ ──► DocumentStorage ◄─────── │ Persistence │
//! │ Bridge      │     (RocksDB / memory)       │ Bridge      │
//! └─────────────┘                              └─────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: Client ids, tagged wire messages, JSON envelopes
//! - [`engine`]: Replicated document engine interface and `yrs` engine
//! - [`relay`]: Update Relay
//! - [`bootstrap`]: State Bootstrap Protocol
//! - [`awareness`]: Awareness store and relay
//! - [`presence`]: Presence Roster and first-user election
//! - [`persistence`]: Debounced Persistence Bridge
//! - [`session`]: Per-document session lifecycle
//! - [`transport`]: Channel abstraction, in-process hub, WebSocket client
//! - [`server`]: WebSocket relay server

pub mod awareness;
pub mod bootstrap;
pub mod config;
pub mod content;
pub mod debounce;
pub mod engine;
pub mod persistence;
pub mod presence;
pub mod protocol;
pub mod relay;
pub mod server;
pub mod session;
pub mod storage;
pub mod transport;

// Re-exports for convenience
pub use awareness::{
    AwarenessChange, AwarenessError, AwarenessRelay, AwarenessState, AwarenessStore, CursorRange,
    UserProfile,
};
pub use bootstrap::{Bootstrap, SyncState, SyncedVia};
pub use config::{ConfigError, RelayConfig, ScribeConfig, SessionConfig};
pub use content::{Block, DocumentContent, Leaf};
pub use debounce::Debouncer;
pub use engine::{EngineError, EngineUpdate, Origin, ReplicatedDocument, TextEngine};
pub use persistence::{
    ChangeKind, ContentChange, LoadSource, LoadedDocument, PersistenceBridge, PersistenceStats,
    SaveJob, SaveOutcome,
};
pub use presence::{PresenceEntry, PresenceRoster};
pub use protocol::{ClientId, Envelope, PresenceMeta, ProtocolError, WireMessage};
pub use relay::{Disposition, RelayStats, UpdateRelay};
pub use server::{RelayServer, ServerStats};
pub use session::{Session, SessionError, StopReport};
pub use storage::{DocumentStorage, MemoryStorage, RocksStorage, StorageError, StoreConfig, StoredDocument};
pub use transport::{
    ChannelEvent, ChannelHandle, MemoryHub, Subscription, Transport, TransportError, WsTransport,
};
