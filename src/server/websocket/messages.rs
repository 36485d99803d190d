//! WebSocket message types.
//!
//! All traffic uses a generic `{type, payload}` envelope; payloads are
//! carried as JSON values so the protocol can grow without touching the
//! envelope.

use serde::{Deserialize, Serialize};

/// Server -> Client message envelope.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerMessage {
    #[serde(rename = "type")]
    pub msg_type: String,
    pub payload: serde_json::Value,
}

impl ServerMessage {
    pub fn new(msg_type: impl Into<String>, payload: impl Serialize) -> Self {
        Self {
            msg_type: msg_type.into(),
            payload: serde_json::to_value(payload).unwrap_or(serde_json::Value::Null),
        }
    }

    pub fn empty(msg_type: impl Into<String>) -> Self {
        Self {
            msg_type: msg_type.into(),
            payload: serde_json::Value::Null,
        }
    }
}

/// Client -> Server message envelope.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClientMessage {
    #[serde(rename = "type")]
    pub msg_type: String,
    #[serde(default)]
    pub payload: serde_json::Value,
}

/// Reserved message type constants.
pub mod msg_types {
    /// Sent by server on successful connection.
    pub const CONNECTED: &str = "connected";
    /// Client subscription request.
    pub const SUBSCRIBE: &str = "subscribe";
    /// Client delivery acknowledgement.
    pub const ACK: &str = "ack";
    /// Client formally ends its session; the cursor is forgotten.
    pub const UNSUBSCRIBE: &str = "unsubscribe";
    /// Client heartbeat request.
    pub const PING: &str = "ping";
    /// Server heartbeat response.
    pub const PONG: &str = "pong";
    /// One change record (server -> client).
    pub const SKILL_CHANGED: &str = "skill_changed";
    /// Replay finished, stream is live from here (server -> client).
    pub const CATCH_UP_COMPLETE: &str = "catch_up_complete";
    /// Continuity lost; client must drop local state and resync.
    pub const MUST_RESYNC: &str = "must_resync";
    /// Server error response.
    pub const ERROR: &str = "error";
}

/// System-level payloads.
pub mod system {
    use serde::{Deserialize, Serialize};

    /// Sent immediately after the socket is established.
    #[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
    pub struct Connected {
        pub connection_id: String,
        pub server_version: String,
    }

    #[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
    pub struct Pong;

    #[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
    pub struct Error {
        pub code: String,
        pub message: String,
    }

    impl Error {
        pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
            Self {
                code: code.into(),
                message: message.into(),
            }
        }
    }
}

/// Subscription payloads.
pub mod feed {
    use serde::{Deserialize, Serialize};

    /// Start (or resume) a session's change feed.
    #[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
    pub struct SubscribePayload {
        pub session_id: String,
        /// Deliver changes with sequence strictly greater than this.
        #[serde(default)]
        pub from_sequence: u64,
    }

    #[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
    pub struct AckPayload {
        pub sequence: u64,
    }

    /// Replay boundary marker.
    #[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
    pub struct CatchUpComplete {
        pub through: u64,
    }

    #[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
    pub struct MustResync {
        pub message: String,
    }
}
