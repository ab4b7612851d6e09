//! Crypto Session - End-to-End Encryption for CipherDrop
//!
//! Key agreement and authenticated encryption behind the [`CryptoProvider`]
//! trait, plus the chunk codec that turns a byte stream into independently
//! decryptable channel frames.
//!
//! Two suites are provided:
//! - [`P256AesGcm`]: ECDH P-256 + AES-256-GCM with JWK public keys, the suite
//!   browsers speak through WebCrypto
//! - [`X25519ChaCha`]: X25519 + ChaCha20Poly1305

mod codec;
mod ecdh_p256;
mod error;
mod provider;
mod x25519;

pub use codec::*;
pub use ecdh_p256::*;
pub use error::*;
pub use provider::*;
pub use x25519::*;

/// Nonce size for both AEADs (96 bits / 12 bytes)
pub const NONCE_SIZE: usize = shared_protocol::IV_SIZE;

/// Authentication tag size (128 bits / 16 bytes)
pub const TAG_SIZE: usize = 16;

/// Symmetric key size (256 bits / 32 bytes)
pub const SYMMETRIC_KEY_SIZE: usize = 32;
