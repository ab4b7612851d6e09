//! Relay events exchanged over the signaling WebSocket

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{FileMeta, ParticipantRole, ProtocolError, ProtocolResult, SessionCode};

/// Messages a client sends to the relay
///
/// Every message names its session code explicitly; the relay never infers
/// the room from connection state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum ClientEvent {
    /// Bind this connection to a session under a role
    JoinSession {
        code: SessionCode,
        role: ParticipantRole,
    },
    /// Opaque negotiation payload for the other participant
    Signal { code: SessionCode, payload: Value },
    /// Public key (JWK) for the other participant
    PublicKey { code: SessionCode, jwk: Value },
    /// Early teardown of the session
    CleanupSession { code: SessionCode },
}

impl ClientEvent {
    pub fn code(&self) -> SessionCode {
        match self {
            Self::JoinSession { code, .. }
            | Self::Signal { code, .. }
            | Self::PublicKey { code, .. }
            | Self::CleanupSession { code } => *code,
        }
    }
}

/// Messages the relay sends to a client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum ServerEvent {
    /// Both participants are present
    SessionReady {
        #[serde(rename = "fileMeta")]
        file_meta: FileMeta,
    },
    /// No session under this code
    SessionNotFound,
    /// The session outlived its lifetime
    SessionExpired,
    /// The requested slot is taken
    RoomFull,
    /// The other participant disconnected
    PeerLeft,
    /// Relayed negotiation payload
    Signal { payload: Value },
    /// Relayed public key
    PublicKey { jwk: Value },
    /// Request-level failure
    Error { message: String },
}

/// Peer-channel negotiation payload carried inside `signal` events
///
/// The relay forwards these as raw JSON; only clients interpret them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SignalPayload {
    Offer { sdp: Value },
    Answer { sdp: Value },
    Ice { candidate: Value },
}

impl SignalPayload {
    pub fn to_value(&self) -> ProtocolResult<Value> {
        Ok(serde_json::to_value(self)?)
    }

    pub fn from_value(value: Value) -> ProtocolResult<Self> {
        serde_json::from_value(value).map_err(|e| ProtocolError::InvalidSignal(e.to_string()))
    }
}
