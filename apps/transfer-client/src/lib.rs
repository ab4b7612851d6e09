//! CipherDrop Transfer Client
//!
//! Sender and receiver state machines for one-shot encrypted file transfer.
//! Each side talks to the validation API over HTTP, to the signaling relay
//! over WebSocket, and to its peer over a [`net_transport::PeerChannel`].
//!
//! ```text
//! Sender                    Server                    Receiver
//!   | create-session ------->  |                          |
//!   | join (sender) -------->  |  <---- check-session     |
//!   |                          |  <---- join (receiver)   |
//!   | <------ session-ready ---+--- session-ready ------> |
//!   | <------------- public keys via relay -------------> |
//!   | <------------- offer / answer / ice --------------> |
//!   | ============= encrypted chunks, done ============> |
//! ```

pub mod api;
pub mod config;
mod error;
pub mod receiver;
pub mod sender;
pub mod session;
pub mod signaling;

pub use api::{HttpSessionApi, SessionApi};
pub use config::ClientConfig;
pub use error::*;
pub use receiver::{ReceiveBuffer, Receiver};
pub use sender::Sender;
pub use session::{FileSource, Progress, ReceivedFile, TransferStatus, sanitize_file_name};
pub use signaling::{RelayConnector, RelayHandle, RelayLink, WsRelayConnector};
