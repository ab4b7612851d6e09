//! ECDH P-256 key agreement with AES-256-GCM
//!
//! Mirrors what WebCrypto does for `deriveKey({name: "ECDH"}, ..., {name:
//! "AES-GCM", length: 256})`: the raw 32-byte x-coordinate of the shared point
//! is the AES key. Public keys travel as JWK.

use std::sync::Arc;

use aes_gcm::{
    Aes256Gcm, Nonce,
    aead::{Aead, KeyInit},
};
use p256::{PublicKey, SecretKey, ecdh};
use rand::rngs::OsRng;
use serde_json::{Value, json};
use tracing::debug;
use zeroize::Zeroizing;

use crate::{
    AgreementKeyPair, CipherSuite, CryptoError, CryptoProvider, CryptoResult, NONCE_SIZE,
    SYMMETRIC_KEY_SIZE, SymmetricKey,
};

/// ECDH P-256 + AES-256-GCM provider
#[derive(Debug, Clone, Copy, Default)]
pub struct P256AesGcm;

impl CryptoProvider for P256AesGcm {
    fn suite(&self) -> CipherSuite {
        CipherSuite::P256AesGcm
    }

    fn generate_key_pair(&self) -> CryptoResult<Box<dyn AgreementKeyPair>> {
        Ok(Box::new(P256KeyPair::generate()))
    }
}

/// P-256 key pair
pub struct P256KeyPair {
    secret: SecretKey,
    public: PublicKey,
}

impl P256KeyPair {
    /// Generate a new random key pair
    pub fn generate() -> Self {
        let secret = SecretKey::random(&mut OsRng);
        let public = secret.public_key();
        Self { secret, public }
    }

    /// Rebuild a key pair from a big-endian private scalar
    pub fn from_secret_bytes(bytes: &[u8]) -> CryptoResult<Self> {
        let secret =
            SecretKey::from_slice(bytes).map_err(|e| CryptoError::KeyGeneration(e.to_string()))?;
        let public = secret.public_key();
        Ok(Self { secret, public })
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.public
    }

    /// Raw ECDH output (x-coordinate of the shared point)
    pub fn shared_secret(&self, their_public: &PublicKey) -> Zeroizing<[u8; SYMMETRIC_KEY_SIZE]> {
        let shared =
            ecdh::diffie_hellman(self.secret.to_nonzero_scalar(), their_public.as_affine());
        let mut out = Zeroizing::new([0u8; SYMMETRIC_KEY_SIZE]);
        out.copy_from_slice(shared.raw_secret_bytes().as_slice());
        out
    }
}

impl AgreementKeyPair for P256KeyPair {
    fn public_jwk(&self) -> CryptoResult<Value> {
        serde_json::from_str(&self.public.to_jwk_string())
            .map_err(|e| CryptoError::KeyGeneration(e.to_string()))
    }

    fn derive(&self, peer_jwk: &Value) -> CryptoResult<Arc<dyn SymmetricKey>> {
        let their_public = parse_public_jwk(peer_jwk)?;
        let secret = self.shared_secret(&their_public);
        debug!("Derived P-256 session key");
        Ok(Arc::new(AesGcmKey::new(&*secret)?))
    }
}

/// Parse an EC P-256 public JWK
///
/// Members other than the public parameters (`ext`, `key_ops`, ...) are
/// dropped before parsing.
pub fn parse_public_jwk(jwk: &Value) -> CryptoResult<PublicKey> {
    let member = |name: &str| {
        jwk.get(name)
            .and_then(Value::as_str)
            .ok_or_else(|| CryptoError::InvalidPublicKey(format!("missing JWK member {name:?}")))
    };

    let kty = member("kty")?;
    let crv = member("crv")?;
    if kty != "EC" || crv != "P-256" {
        return Err(CryptoError::InvalidPublicKey(format!(
            "expected EC/P-256, got {kty}/{crv}"
        )));
    }

    let public_only = json!({
        "kty": "EC",
        "crv": "P-256",
        "x": member("x")?,
        "y": member("y")?,
    });

    PublicKey::from_jwk_str(&public_only.to_string())
        .map_err(|e| CryptoError::InvalidPublicKey(e.to_string()))
}

/// AES-256-GCM session key
pub struct AesGcmKey {
    cipher: Aes256Gcm,
}

impl AesGcmKey {
    pub fn new(key: &[u8]) -> CryptoResult<Self> {
        let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| CryptoError::InvalidKeyLength {
            expected: SYMMETRIC_KEY_SIZE,
            actual: key.len(),
        })?;
        Ok(Self { cipher })
    }
}

impl SymmetricKey for AesGcmKey {
    fn encrypt(&self, iv: &[u8; NONCE_SIZE], plaintext: &[u8]) -> CryptoResult<Vec<u8>> {
        self.cipher
            .encrypt(Nonce::from_slice(iv), plaintext)
            .map_err(|e| CryptoError::Encryption(e.to_string()))
    }

    fn decrypt(&self, iv: &[u8; NONCE_SIZE], ciphertext: &[u8]) -> CryptoResult<Vec<u8>> {
        self.cipher
            .decrypt(Nonce::from_slice(iv), ciphertext)
            .map_err(|_| CryptoError::DecryptionFailed)
    }
}
