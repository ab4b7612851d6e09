//! Server error types

use thiserror::Error;

use crate::ConfigError;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Session not found")]
    NotFound,

    #[error("Session expired")]
    Expired,

    #[error("Not a participant of this session")]
    NotParticipant,

    #[error("No free session code after {0} attempts")]
    CodeSpaceExhausted(usize),

    #[error("Invalid file metadata: {0}")]
    InvalidFileMeta(#[from] shared_protocol::ProtocolError),
}

pub type RegistryResult<T> = Result<T, RegistryError>;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Invalid bind address {0}")]
    BindAddress(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
