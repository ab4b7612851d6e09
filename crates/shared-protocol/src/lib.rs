//! Shared Protocol Definitions for CipherDrop
//!
//! This crate contains the session types, relay events, HTTP bodies and
//! peer-channel frames shared by the signaling server and the transfer client.

mod api;
mod error;
mod packets;
mod session;
mod signaling;

pub use api::*;
pub use error::*;
pub use packets::*;
pub use session::*;
pub use signaling::*;

/// Number of digits in a session code
pub const CODE_LENGTH: usize = 6;

/// Default session lifetime in seconds (3 minutes)
pub const DEFAULT_SESSION_LIFETIME_SECS: u64 = 3 * 60;

/// Plaintext bytes carried by every chunk except the last
pub const CHUNK_SIZE: usize = 64 * 1024;

/// AEAD nonce length carried with every chunk
pub const IV_SIZE: usize = 12;
