//! Wire protocol for the document channel.
//!
//! Every message travels as a broadcast [`Envelope`]: an event name plus a
//! JSON payload. Binary blobs (engine deltas, full state, awareness deltas)
//! are base64-encoded so the envelope survives text-only transports.
//!
//! ```text
//! event              payload
//! ───────────────    ──────────────────────────────────────────────
//! update             { update: base64, sender: ClientId }
//! request-state      { sender: ClientId }
//! state-response     { state: base64, sender: ClientId, recipient: ClientId }
//! awareness-update   { update: base64, sender: ClientId }
//! ```
//!
//! Envelopes are validated into the tagged [`WireMessage`] union at the
//! transport boundary. Anything that does not match one of the four shapes
//! is a [`ProtocolError`], never a panic.

use std::fmt;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identity of one connection instance.
///
/// Generated locally per session and never persisted. Backed by a v4 UUID,
/// so collisions between live sessions are negligible; self-echo
/// suppression depends on that.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientId(Uuid);

impl ClientId {
    /// Draw a fresh random client id.
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Short form keeps log lines readable.
        let s = self.0.simple().to_string();
        f.write_str(&s[..8])
    }
}

/// Transport-level broadcast message: event name + opaque JSON payload.
///
/// The transport never looks inside `payload`; only the session does.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub event: String,
    pub payload: serde_json::Value,
}

/// Presence metadata a client tracks on the channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceMeta {
    pub user_id: ClientId,
    pub username: String,
    /// Join time in epoch milliseconds.
    pub online_at: i64,
}

impl PresenceMeta {
    pub fn now(user_id: ClientId, username: impl Into<String>) -> Self {
        Self {
            user_id,
            username: username.into(),
            online_at: chrono::Utc::now().timestamp_millis(),
        }
    }
}

/// A document delta produced by one peer's engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeltaMessage {
    pub sender: ClientId,
    pub payload: Vec<u8>,
}

/// Broadcast once per join, asking any peer for its full state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateRequest {
    pub sender: ClientId,
}

/// Full engine state addressed to one requester.
///
/// Every peer receives it; only `recipient` applies it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateResponse {
    pub sender: ClientId,
    pub recipient: ClientId,
    pub state: Vec<u8>,
}

/// Encoded awareness delta over the changed client ids.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AwarenessUpdate {
    pub sender: ClientId,
    pub payload: Vec<u8>,
}

/// Validated channel message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireMessage {
    Delta(DeltaMessage),
    StateRequest(StateRequest),
    StateResponse(StateResponse),
    Awareness(AwarenessUpdate),
}

/// Raw JSON shapes, one per event name.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "event", content = "payload", rename_all = "kebab-case")]
enum RawMessage {
    Update {
        update: String,
        sender: ClientId,
    },
    RequestState {
        sender: ClientId,
    },
    StateResponse {
        state: String,
        sender: ClientId,
        recipient: ClientId,
    },
    AwarenessUpdate {
        update: String,
        sender: ClientId,
    },
}

pub const EVENT_UPDATE: &str = "update";
pub const EVENT_REQUEST_STATE: &str = "request-state";
pub const EVENT_STATE_RESPONSE: &str = "state-response";
pub const EVENT_AWARENESS_UPDATE: &str = "awareness-update";

impl WireMessage {
    pub fn delta(sender: ClientId, payload: Vec<u8>) -> Self {
        Self::Delta(DeltaMessage { sender, payload })
    }

    pub fn state_request(sender: ClientId) -> Self {
        Self::StateRequest(StateRequest { sender })
    }

    pub fn state_response(sender: ClientId, recipient: ClientId, state: Vec<u8>) -> Self {
        Self::StateResponse(StateResponse {
            sender,
            recipient,
            state,
        })
    }

    pub fn awareness(sender: ClientId, payload: Vec<u8>) -> Self {
        Self::Awareness(AwarenessUpdate { sender, payload })
    }

    /// The client that published this message.
    pub fn sender(&self) -> ClientId {
        match self {
            Self::Delta(m) => m.sender,
            Self::StateRequest(m) => m.sender,
            Self::StateResponse(m) => m.sender,
            Self::Awareness(m) => m.sender,
        }
    }

    pub fn event_name(&self) -> &'static str {
        match self {
            Self::Delta(_) => EVENT_UPDATE,
            Self::StateRequest(_) => EVENT_REQUEST_STATE,
            Self::StateResponse(_) => EVENT_STATE_RESPONSE,
            Self::Awareness(_) => EVENT_AWARENESS_UPDATE,
        }
    }

    /// Encode into a broadcast envelope.
    pub fn to_envelope(&self) -> Result<Envelope, ProtocolError> {
        let raw = match self {
            Self::Delta(m) => RawMessage::Update {
                update: STANDARD.encode(&m.payload),
                sender: m.sender,
            },
            Self::StateRequest(m) => RawMessage::RequestState { sender: m.sender },
            Self::StateResponse(m) => RawMessage::StateResponse {
                state: STANDARD.encode(&m.state),
                sender: m.sender,
                recipient: m.recipient,
            },
            Self::Awareness(m) => RawMessage::AwarenessUpdate {
                update: STANDARD.encode(&m.payload),
                sender: m.sender,
            },
        };
        Ok(serde_json::from_value(serde_json::to_value(raw)?)?)
    }

    /// Validate an envelope received from the transport.
    pub fn from_envelope(envelope: &Envelope) -> Result<Self, ProtocolError> {
        match envelope.event.as_str() {
            EVENT_UPDATE | EVENT_REQUEST_STATE | EVENT_STATE_RESPONSE | EVENT_AWARENESS_UPDATE => {}
            other => return Err(ProtocolError::UnknownEvent(other.to_string())),
        }

        let raw: RawMessage = serde_json::from_value(serde_json::json!({
            "event": envelope.event,
            "payload": envelope.payload,
        }))?;

        Ok(match raw {
            RawMessage::Update { update, sender } => Self::delta(sender, STANDARD.decode(update)?),
            RawMessage::RequestState { sender } => Self::state_request(sender),
            RawMessage::StateResponse {
                state,
                sender,
                recipient,
            } => Self::state_response(sender, recipient, STANDARD.decode(state)?),
            RawMessage::AwarenessUpdate { update, sender } => {
                Self::awareness(sender, STANDARD.decode(update)?)
            }
        })
    }
}

/// Derive the channel (topic) name for a document.
///
/// `<prefix>-<document_id>`, or the process-wide `fallback` for sessions
/// without a document identity.
pub fn channel_name(prefix: &str, document_id: Option<&str>, fallback: &str) -> String {
    match document_id {
        Some(id) if !id.is_empty() => format!("{prefix}-{id}"),
        _ => fallback.to_string(),
    }
}

/// Protocol errors.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("unknown event: {0}")]
    UnknownEvent(String),
    #[error("invalid payload shape: {0}")]
    InvalidShape(#[from] serde_json::Error),
    #[error("invalid base64 payload: {0}")]
    InvalidBase64(#[from] base64::DecodeError),
}
