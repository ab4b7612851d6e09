//! Network Transport - peer channels for CipherDrop
//!
//! The transfer state machines only see the [`PeerConnector`] /
//! [`PeerChannel`] traits. Two implementations live here:
//! - [`QuicConnector`]: direct QUIC connection, certificate pinned via the offer
//! - [`MemoryConnector`]: in-process channel for tests

mod channel;
mod error;
mod memory;
mod transport;

pub use channel::*;
pub use error::*;
pub use memory::*;
pub use transport::*;

/// Largest frame accepted on a channel (a 64 KiB chunk is ~88 KiB as base64 JSON)
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Capacity of per-channel event queues
pub const EVENT_BUFFER: usize = 4096;
