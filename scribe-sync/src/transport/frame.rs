//! JSON frames spoken between [`super::WsTransport`] and the relay server.
//!
//! One WebSocket connection carries exactly one channel subscription. The
//! first client frame must be `join`.

use serde::{Deserialize, Serialize};

use crate::protocol::{Envelope, PresenceMeta};

/// Client → relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    Join { topic: String },
    Broadcast { envelope: Envelope },
    Track { meta: PresenceMeta },
    Leave,
}

/// Relay → client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    Joined { topic: String },
    Broadcast { envelope: Envelope },
    PresenceSync { presences: Vec<PresenceMeta> },
    PresenceJoin { presences: Vec<PresenceMeta> },
    PresenceLeave { presences: Vec<PresenceMeta> },
    Error { message: String },
}

impl ClientFrame {
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn decode(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

impl ServerFrame {
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn decode(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}
