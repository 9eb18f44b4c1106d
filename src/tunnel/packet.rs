//! Tunnel packet codec.
//!
//! WIRE FORMAT
//! ===========
//! One text frame per packet: `<type>` for bare control packets, or
//! `<type>:<payload>` where the payload is everything after the first colon.
//! Only `message` packets carry a JSON envelope; `timeout` carries a bare
//! number of seconds. Decoding is total: malformed payloads yield a packet
//! without content, and unrecognized types are preserved verbatim so the
//! session layer can log them.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Application envelope inside a `message` packet.
///
/// Field order matters on the wire: peers and tests compare whole frames, so
/// `type` always serializes before `content`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<Value>,
}

/// One frame on the tunnel, either direction.
#[derive(Clone, Debug, PartialEq)]
pub enum Packet {
    /// Application message; `None` when the inbound payload failed to parse.
    Message(Option<Envelope>),
    Ping,
    Pong,
    Close,
    /// Heartbeat interval announcement, in seconds.
    Timeout(Option<f64>),
    /// A type this codec does not speak, kept verbatim.
    Unknown(String),
}

impl Packet {
    /// Application message packet with the given envelope type and content.
    #[must_use]
    pub fn message(kind: impl Into<String>, content: Option<Value>) -> Self {
        Self::Message(Some(Envelope { kind: kind.into(), content }))
    }

    /// Render the packet as one wire frame.
    #[must_use]
    pub fn encode(&self) -> String {
        match self {
            Self::Message(Some(envelope)) => {
                // Envelope serialization cannot fail: string keys and JSON
                // values only.
                let json = serde_json::to_string(envelope).unwrap_or_default();
                format!("message:{json}")
            }
            Self::Message(None) => "message".to_owned(),
            Self::Ping => "ping".to_owned(),
            Self::Pong => "pong".to_owned(),
            Self::Close => "close".to_owned(),
            Self::Timeout(Some(seconds)) => format!("timeout:{seconds}"),
            Self::Timeout(None) => "timeout".to_owned(),
            Self::Unknown(raw) => raw.clone(),
        }
    }

    /// Parse one wire frame. Never fails; see the module docs.
    #[must_use]
    pub fn decode(raw: &str) -> Self {
        let (kind, payload) = match raw.split_once(':') {
            Some((kind, payload)) => (kind, Some(payload)),
            None => (raw, None),
        };
        match kind {
            "message" => Self::Message(payload.and_then(|p| serde_json::from_str(p).ok())),
            "ping" => Self::Ping,
            "pong" => Self::Pong,
            "close" => Self::Close,
            "timeout" => Self::Timeout(payload.and_then(|p| p.trim().parse().ok())),
            _ => Self::Unknown(raw.to_owned()),
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================
