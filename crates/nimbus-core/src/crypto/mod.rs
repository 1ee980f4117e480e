pub mod aes_gcm;
pub mod key;

use nimbus_types::error::Result;

/// Trait for encrypting and decrypting stored objects.
pub trait CryptoEngine: Send + Sync {
    /// Encrypt plaintext. Returns `[nonce][ciphertext+tag]`.
    /// `aad` is authenticated but not encrypted (the format tag plus the
    /// storage key of the object being sealed).
    fn encrypt(&self, plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>>;

    /// Decrypt data produced by `encrypt`.
    /// `aad` must match what was passed during encryption.
    fn decrypt(&self, data: &[u8], aad: &[u8]) -> Result<Vec<u8>>;

    /// Whether this engine actually encrypts data.
    /// `PlaintextEngine` returns false; real ciphers return true.
    fn is_encrypting(&self) -> bool {
        true
    }

    /// The key used for computing content ids (keyed BLAKE2b-256).
    fn content_id_key(&self) -> &[u8; 32];
}

/// No-encryption engine. Still computes deterministic content ids.
pub struct PlaintextEngine {
    content_id_key: [u8; 32],
}

impl PlaintextEngine {
    pub fn new(content_id_key: &[u8; 32]) -> Self {
        Self {
            content_id_key: *content_id_key,
        }
    }
}

impl CryptoEngine for PlaintextEngine {
    fn encrypt(&self, plaintext: &[u8], _aad: &[u8]) -> Result<Vec<u8>> {
        Ok(plaintext.to_vec())
    }

    fn decrypt(&self, data: &[u8], _aad: &[u8]) -> Result<Vec<u8>> {
        Ok(data.to_vec())
    }

    fn is_encrypting(&self) -> bool {
        false
    }

    fn content_id_key(&self) -> &[u8; 32] {
        &self.content_id_key
    }
}
