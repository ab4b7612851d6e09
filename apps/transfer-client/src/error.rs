//! Client error types

use crypto_session::CryptoError;
use net_transport::TransportError;
use shared_protocol::ProtocolError;
use thiserror::Error;

/// Shown for every admission failure, whatever the cause
pub const INVALID_CODE_MESSAGE: &str = "Invalid or expired code!";

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Invalid code: {0}")]
    InvalidCode(String),

    #[error("Session not found")]
    SessionNotFound,

    #[error("Session expired")]
    SessionExpired,

    #[error("Session already has two participants")]
    RoomFull,

    #[error("Peer did not join in time")]
    AdmissionTimeout,

    #[error("Peer left the session")]
    PeerLeft,

    #[error("A transfer is already running")]
    Busy,

    #[error("API error: {0}")]
    Api(String),

    #[error("Relay error: {0}")]
    Relay(String),

    #[error("Relay connection closed")]
    RelayClosed,

    #[error("Negotiation error: {0}")]
    Negotiation(String),

    #[error("Channel closed before the transfer finished")]
    ChannelClosed,

    #[error("Channel error: {0}")]
    Channel(String),

    #[error("Received {received} bytes, sender announced {expected}")]
    SizeMismatch { received: u64, expected: u64 },

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type ClientResult<T> = Result<T, ClientError>;

impl ClientError {
    /// Whether the code was refused before any transfer could start
    pub fn is_admission_failure(&self) -> bool {
        matches!(
            self,
            Self::InvalidCode(_)
                | Self::SessionNotFound
                | Self::SessionExpired
                | Self::RoomFull
                | Self::AdmissionTimeout
        )
    }

    /// Message for the person at the keyboard
    pub fn user_message(&self) -> String {
        if self.is_admission_failure() {
            return INVALID_CODE_MESSAGE.to_string();
        }

        match self {
            Self::Crypto(CryptoError::DecryptionFailed) => {
                "Decryption failed, the file was corrupted or tampered with.".to_string()
            }
            Self::PeerLeft => "The other side left the session.".to_string(),
            other => format!("Transfer failed: {other}"),
        }
    }
}

impl From<reqwest::Error> for ClientError {
    fn from(e: reqwest::Error) -> Self {
        Self::Api(e.to_string())
    }
}
