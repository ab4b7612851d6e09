//! X25519 key agreement with ChaCha20Poly1305

use std::sync::Arc;

use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use chacha20poly1305::{
    ChaCha20Poly1305, Nonce,
    aead::{Aead, KeyInit},
};
use rand::rngs::OsRng;
use serde_json::{Value, json};
use tracing::warn;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroizing;

use crate::{
    AgreementKeyPair, CipherSuite, CryptoError, CryptoProvider, CryptoResult, NONCE_SIZE,
    SYMMETRIC_KEY_SIZE, SymmetricKey,
};

/// Public key size (256 bits / 32 bytes)
pub const PUBLIC_KEY_SIZE: usize = 32;

/// X25519 + ChaCha20Poly1305 provider
#[derive(Debug, Clone, Copy, Default)]
pub struct X25519ChaCha;

impl CryptoProvider for X25519ChaCha {
    fn suite(&self) -> CipherSuite {
        CipherSuite::X25519ChaCha20
    }

    fn generate_key_pair(&self) -> CryptoResult<Box<dyn AgreementKeyPair>> {
        Ok(Box::new(X25519KeyPair::generate()))
    }
}

/// Key pair for ephemeral key exchange
pub struct X25519KeyPair {
    secret: StaticSecret,
    public: PublicKey,
}

impl X25519KeyPair {
    /// Generate a new key pair
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    pub fn from_secret_bytes(bytes: [u8; 32]) -> Self {
        let secret = StaticSecret::from(bytes);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    /// Get the public key bytes
    pub fn public_key_bytes(&self) -> [u8; PUBLIC_KEY_SIZE] {
        *self.public.as_bytes()
    }

    /// Perform Diffie-Hellman key exchange
    pub fn diffie_hellman(&self, their_public: &[u8; PUBLIC_KEY_SIZE]) -> Zeroizing<[u8; 32]> {
        let their_public = PublicKey::from(*their_public);
        Zeroizing::new(*self.secret.diffie_hellman(&their_public).as_bytes())
    }
}

impl AgreementKeyPair for X25519KeyPair {
    fn public_jwk(&self) -> CryptoResult<Value> {
        Ok(json!({
            "kty": "OKP",
            "crv": "X25519",
            "x": URL_SAFE_NO_PAD.encode(self.public.as_bytes()),
        }))
    }

    fn derive(&self, peer_jwk: &Value) -> CryptoResult<Arc<dyn SymmetricKey>> {
        let their_public = parse_okp_jwk(peer_jwk)?;
        let shared = self.diffie_hellman(&their_public);

        // All-zero output means the peer sent a low-order point
        if shared.iter().all(|b| *b == 0) {
            warn!("Rejected low-order X25519 public key");
            return Err(CryptoError::KeyExchange("non-contributory public key".to_string()));
        }

        Ok(Arc::new(ChaChaKey::new(&*shared)?))
    }
}

fn parse_okp_jwk(jwk: &Value) -> CryptoResult<[u8; PUBLIC_KEY_SIZE]> {
    let member = |name: &str| {
        jwk.get(name)
            .and_then(Value::as_str)
            .ok_or_else(|| CryptoError::InvalidPublicKey(format!("missing JWK member {name:?}")))
    };

    if member("kty")? != "OKP" || member("crv")? != "X25519" {
        return Err(CryptoError::InvalidPublicKey("expected OKP/X25519".to_string()));
    }

    let raw = URL_SAFE_NO_PAD
        .decode(member("x")?)
        .map_err(|e| CryptoError::InvalidPublicKey(e.to_string()))?;

    raw.as_slice()
        .try_into()
        .map_err(|_| CryptoError::InvalidKeyLength {
            expected: PUBLIC_KEY_SIZE,
            actual: raw.len(),
        })
}

/// ChaCha20Poly1305 session key
pub struct ChaChaKey {
    cipher: ChaCha20Poly1305,
}

impl ChaChaKey {
    pub fn new(key: &[u8]) -> CryptoResult<Self> {
        let cipher =
            ChaCha20Poly1305::new_from_slice(key).map_err(|_| CryptoError::InvalidKeyLength {
                expected: SYMMETRIC_KEY_SIZE,
                actual: key.len(),
            })?;
        Ok(Self { cipher })
    }
}

impl SymmetricKey for ChaChaKey {
    fn encrypt(&self, iv: &[u8; NONCE_SIZE], plaintext: &[u8]) -> CryptoResult<Vec<u8>> {
        self.cipher
            .encrypt(Nonce::from_slice(iv), plaintext)
            .map_err(|e| CryptoError::Encryption(e.to_string()))
    }

    fn decrypt(&self, iv: &[u8; NONCE_SIZE], ciphertext: &[u8]) -> CryptoResult<Vec<u8>> {
        if ciphertext.len() < crate::TAG_SIZE {
            return Err(CryptoError::DecryptionFailed);
        }

        self.cipher
            .decrypt(Nonce::from_slice(iv), ciphertext)
            .map_err(|_| CryptoError::DecryptionFailed)
    }
}
