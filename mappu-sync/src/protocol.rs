//! Wire formats for the relay and the peer mesh.
//!
//! Relay frames are JSON text frames with a base64 payload:
//! ```text
//! join:    {"t":"join","room":"<string>"}
//! update:  {"t":"u","d":"<base64 bytes>"}
//! aware:   {"t":"a","d":"<base64 bytes>"}
//! ```
//! No acknowledgements, no sequence numbers, no compression.
//!
//! Mesh messages travel over a reliable ordered data channel and are
//! bincode-encoded:
//! ```text
//! ┌──────────┬──────────────────────────────┐
//! │ tag      │ payload                      │
//! │ 1 byte   │ len-prefixed bytes / peer id │
//! └──────────┴──────────────────────────────┘
//! ```

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};

use crate::error::SyncError;

/// A frame on the relay WebSocket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "t")]
pub enum RelayFrame {
    /// Bind the connection to a room.
    #[serde(rename = "join")]
    Join { room: String },
    /// Document update, base64 encoded.
    #[serde(rename = "u")]
    Update { d: String },
    /// Awareness update, base64 encoded.
    #[serde(rename = "a")]
    Awareness { d: String },
}

impl RelayFrame {
    pub fn join(room: impl Into<String>) -> Self {
        RelayFrame::Join { room: room.into() }
    }

    pub fn update(bytes: &[u8]) -> Self {
        RelayFrame::Update {
            d: STANDARD.encode(bytes),
        }
    }

    pub fn awareness(bytes: &[u8]) -> Self {
        RelayFrame::Awareness {
            d: STANDARD.encode(bytes),
        }
    }

    /// Parse a text frame.
    pub fn parse(text: &str) -> Result<Self, SyncError> {
        Ok(serde_json::from_str(text)?)
    }

    /// Serialize to a text frame.
    pub fn to_text(&self) -> String {
        // A tagged enum of strings always serializes.
        serde_json::to_string(self).unwrap_or_default()
    }

    /// Decode the binary payload of an update or awareness frame.
    pub fn payload(&self) -> Result<Vec<u8>, SyncError> {
        match self {
            RelayFrame::Update { d } | RelayFrame::Awareness { d } => STANDARD
                .decode(d)
                .map_err(|e| SyncError::Protocol(format!("invalid base64 payload: {e}"))),
            RelayFrame::Join { .. } => Err(SyncError::Protocol("join frame has no payload".into())),
        }
    }
}

/// A message on a direct peer link.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MeshMessage {
    /// Document update (`t: "u"`).
    Update(Vec<u8>),
    /// Awareness update (`t: "a"`).
    Awareness(Vec<u8>),
    /// Peer announcement carrying a peer id (`t: "p"`).
    Announce(String),
}

impl MeshMessage {
    /// Short wire tag, matching the relay vocabulary.
    pub fn tag(&self) -> &'static str {
        match self {
            MeshMessage::Update(_) => "u",
            MeshMessage::Awareness(_) => "a",
            MeshMessage::Announce(_) => "p",
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, SyncError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| SyncError::Protocol(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, SyncError> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| SyncError::Protocol(e.to_string()))?;
        Ok(msg)
    }
}
