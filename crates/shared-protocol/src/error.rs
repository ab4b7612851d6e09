//! Error types for the protocol

use thiserror::Error;

/// Protocol error
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid session code: {0:?}")]
    InvalidCode(String),

    #[error("Missing required field: {0}")]
    MissingField(&'static str),

    #[error("File too large: {size} bytes (max: {max})")]
    FileTooLarge { size: u64, max: u64 },

    #[error("Invalid channel frame: {0}")]
    InvalidFrame(String),

    #[error("Invalid signal payload: {0}")]
    InvalidSignal(String),
}

/// Result type alias for protocol operations
pub type ProtocolResult<T> = Result<T, ProtocolError>;
