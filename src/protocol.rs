//! JSON wire protocol for the collaboration channel.
//!
//! Message-oriented: each WebSocket text frame carries exactly one message.
//! Client frames are tagged by `action`, server frames by `type`:
//!
//! ```text
//! client → server                      server → client
//! ───────────────────────────────      ─────────────────────────────────
//! {action:"join", document_id, …}      {type:"state_vector", data}
//! {action:"crdt_op", op}               {type:"crdt_ops", ops, version, origin}
//! {action:"crdt_batch", ops}           {type:"snapshot", data}
//! {action:"sync_request", since_…}     {type:"cursor_update", …}
//! {action:"snapshot_request"}          {type:"user_joined"|"user_left", …}
//! {action:"cursor_move", position}     {type:"presence_update", …}
//! {action:"presence_update", status}   {type:"pong"}
//! {action:"ping"}
//! ```
//!
//! A malformed frame is a decode error at this boundary — dropped and
//! logged by the transport, never surfaced into the CRDT core.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::document::{DocumentSnapshot, StateVector};
use crate::op::Operation;
use crate::presence::{CursorPosition, PresenceStatus};

/// Close code sent when authorization fails during the connection handshake.
pub const CLOSE_UNAUTHORIZED: u16 = 4403;
/// Close code sent when the document's session limit is reached.
pub const CLOSE_ROOM_FULL: u16 = 4429;

/// Messages a client sends to the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Connection handshake: must be the first message. Names the target
    /// document and the caller identity the authorization check runs
    /// against.
    Join {
        document_id: String,
        user_id: String,
        username: String,
    },
    CrdtOp {
        op: Operation,
    },
    CrdtBatch {
        ops: Vec<Operation>,
    },
    SyncRequest {
        since_version: u64,
    },
    SnapshotRequest,
    CursorMove {
        position: CursorPosition,
    },
    PresenceUpdate {
        status: PresenceStatus,
    },
    Ping,
}

/// Messages the server sends to clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Accepted operations plus the document version they produced.
    /// `origin` names the submitting session so a client can tell whose
    /// writes these are and reconcile its own acknowledged edits.
    CrdtOps {
        ops: Vec<Operation>,
        version: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        origin: Option<Uuid>,
    },
    Snapshot {
        data: DocumentSnapshot,
    },
    StateVector {
        data: StateVector,
    },
    CursorUpdate {
        user_id: String,
        username: String,
        position: CursorPosition,
    },
    UserJoined {
        user_id: String,
        username: String,
    },
    UserLeft {
        user_id: String,
        username: String,
    },
    PresenceUpdate {
        user_id: String,
        username: String,
        status: PresenceStatus,
    },
    Pong,
}

impl ClientMessage {
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Encode(e.to_string()))
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::Decode(e.to_string()))
    }
}

impl ServerMessage {
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Encode(e.to_string()))
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::Decode(e.to_string()))
    }
}

/// Transport-boundary errors.
#[derive(Debug, Clone)]
pub enum ProtocolError {
    Encode(String),
    Decode(String),
    ConnectionClosed,
    Unauthorized,
    Timeout,
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Encode(e) => write!(f, "Encode error: {e}"),
            Self::Decode(e) => write!(f, "Decode error: {e}"),
            Self::ConnectionClosed => write!(f, "Connection closed"),
            Self::Unauthorized => write!(f, "Unauthorized"),
            Self::Timeout => write!(f, "Connection timeout"),
        }
    }
}

impl std::error::Error for ProtocolError {}
