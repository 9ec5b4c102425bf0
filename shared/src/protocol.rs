//! Control protocol types for Outpost relay communication.
//!
//! Control frames are JSON objects carried in WebSocket text frames, each
//! tagged by a `type` field. Data frames are opaque binary payloads and
//! have no representation here.

use serde::{Deserialize, Serialize};

/// Text frames starting with this prefix are diagnostic echoes from the relay
pub const ECHO_PREFIX: &str = "echo:";

/// `status` value of a successful login acknowledgement
pub const LOGIN_OK: &str = "ok";

/// Control message types the relay is known to send
pub const RELAY_MESSAGE_TYPES: [&str; 4] = ["hello", "login", "start", "error"];

/// Requested visibility of the exposed service
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    #[default]
    Public,
    Private,
}

/// Messages sent from the client to the relay
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ClientMessage {
    /// Requests a session for `device` under `domain`
    Login {
        domain: String,
        secret: String,
        device: String,
    },
    /// Requests (or resumes) forwarding with the given visibility
    Start { usage: Visibility },
}

impl ClientMessage {
    pub fn to_json(&self) -> crate::Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Messages sent from the relay to the client
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum RelayMessage {
    /// Greeting sent right after the transport opens
    Hello,
    /// Login acknowledgement
    Login {
        status: String,
        #[serde(default)]
        primary: bool,
    },
    /// Start acknowledgement carrying the per-session markers
    Start { suspend: Marker, eof: Marker },
    /// Operator-visible failure; the relay decides whether to close
    Error {
        #[serde(default)]
        message: String,
    },
}

impl RelayMessage {
    /// Returns true if `ty` names a message the relay sends.
    pub fn is_known_type(ty: &str) -> bool {
        RELAY_MESSAGE_TYPES.contains(&ty)
    }
}

/// Opaque per-session byte sequence (suspend or end-of-response marker)
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(from = "MarkerRepr")]
pub struct Marker(pub Vec<u8>);

impl Marker {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }
}

/// Encodings the relay may use for a marker
#[derive(Deserialize)]
#[serde(untagged)]
enum MarkerRepr {
    Text(String),
    Bytes(Vec<u8>),
    Buffer { data: Vec<u8> },
}

impl From<MarkerRepr> for Marker {
    fn from(repr: MarkerRepr) -> Self {
        match repr {
            MarkerRepr::Text(s) => Marker(s.into_bytes()),
            MarkerRepr::Bytes(b) | MarkerRepr::Buffer { data: b } => Marker(b),
        }
    }
}
