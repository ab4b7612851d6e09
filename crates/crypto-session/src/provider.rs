//! Cryptographic provider abstraction

use std::sync::Arc;

use serde_json::Value;

use crate::{CryptoError, CryptoResult, NONCE_SIZE, P256AesGcm, X25519ChaCha};

/// Source of key pairs for one cipher suite
pub trait CryptoProvider: Send + Sync {
    /// Suite implemented by this provider
    fn suite(&self) -> CipherSuite;

    /// Generate a fresh key pair for one session
    fn generate_key_pair(&self) -> CryptoResult<Box<dyn AgreementKeyPair>>;
}

/// Private half of a key agreement, held only by the client that generated it
pub trait AgreementKeyPair: Send + Sync {
    /// Public key as a JWK, ready to be relayed
    fn public_jwk(&self) -> CryptoResult<Value>;

    /// Derive the session's symmetric key from the peer's public JWK
    fn derive(&self, peer_jwk: &Value) -> CryptoResult<Arc<dyn SymmetricKey>>;
}

/// Derived AEAD key shared by both ends of a session
pub trait SymmetricKey: Send + Sync {
    /// Encrypt with the given nonce. Output is `[ciphertext][tag]`.
    fn encrypt(&self, iv: &[u8; NONCE_SIZE], plaintext: &[u8]) -> CryptoResult<Vec<u8>>;

    /// Decrypt and verify
    fn decrypt(&self, iv: &[u8; NONCE_SIZE], ciphertext: &[u8]) -> CryptoResult<Vec<u8>>;
}

/// Selectable cipher suite
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CipherSuite {
    /// ECDH P-256 + AES-256-GCM
    #[default]
    P256AesGcm,
    /// X25519 + ChaCha20Poly1305
    X25519ChaCha20,
}

impl CipherSuite {
    /// Instantiate the provider for this suite
    pub fn provider(self) -> Arc<dyn CryptoProvider> {
        match self {
            Self::P256AesGcm => Arc::new(P256AesGcm),
            Self::X25519ChaCha20 => Arc::new(X25519ChaCha),
        }
    }
}

impl std::fmt::Display for CipherSuite {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::P256AesGcm => f.write_str("p256"),
            Self::X25519ChaCha20 => f.write_str("x25519"),
        }
    }
}

impl std::str::FromStr for CipherSuite {
    type Err = CryptoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "p256" | "p-256" | "p256-aes-gcm" => Ok(Self::P256AesGcm),
            "x25519" | "x25519-chacha20" => Ok(Self::X25519ChaCha20),
            other => Err(CryptoError::UnknownSuite(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_suite_parsing() {
        assert_eq!("p256".parse::<CipherSuite>().unwrap(), CipherSuite::P256AesGcm);
        assert_eq!("X25519".parse::<CipherSuite>().unwrap(), CipherSuite::X25519ChaCha20);
        assert!("rsa".parse::<CipherSuite>().is_err());
    }

    #[test]
    fn test_providers_agree_per_suite() {
        for suite in [CipherSuite::P256AesGcm, CipherSuite::X25519ChaCha20] {
            let provider = suite.provider();
            assert_eq!(provider.suite(), suite);

            let alice = provider.generate_key_pair().unwrap();
            let bob = provider.generate_key_pair().unwrap();

            let alice_key = alice.derive(&bob.public_jwk().unwrap()).unwrap();
            let bob_key = bob.derive(&alice.public_jwk().unwrap()).unwrap();

            let iv = [7u8; NONCE_SIZE];
            let sealed = alice_key.encrypt(&iv, b"hello").unwrap();
            assert_eq!(bob_key.decrypt(&iv, &sealed).unwrap(), b"hello");
        }
    }
}
