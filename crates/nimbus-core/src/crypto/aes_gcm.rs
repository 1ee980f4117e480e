use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use rand::RngCore;

use nimbus_types::error::{NimbusError, Result};

use super::CryptoEngine;

/// AES-256-GCM authenticated encryption engine.
pub struct Aes256GcmEngine {
    cipher: Aes256Gcm,
    content_id_key: [u8; 32],
}

impl Aes256GcmEngine {
    pub fn new(encryption_key: &[u8; 32], content_id_key: &[u8; 32]) -> Self {
        let cipher =
            Aes256Gcm::new_from_slice(encryption_key).expect("valid 32-byte key for AES-256-GCM");
        Self {
            cipher,
            content_id_key: *content_id_key,
        }
    }
}

impl CryptoEngine for Aes256GcmEngine {
    fn encrypt(&self, plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
        let mut nonce_bytes = [0u8; 12];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let payload = aes_gcm::aead::Payload {
            msg: plaintext,
            aad,
        };
        let ciphertext = self
            .cipher
            .encrypt(nonce, payload)
            .map_err(|e| NimbusError::Other(format!("AES-GCM encrypt: {e}")))?;

        // Wire format: [12-byte nonce][ciphertext with appended 16-byte tag]
        let mut out = Vec::with_capacity(12 + ciphertext.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    fn decrypt(&self, data: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
        if data.len() < 12 + 16 {
            return Err(NimbusError::DecryptionFailed);
        }
        let (nonce_bytes, ciphertext) = data.split_at(12);
        let nonce = Nonce::from_slice(nonce_bytes);

        let payload = aes_gcm::aead::Payload {
            msg: ciphertext,
            aad,
        };
        self.cipher
            .decrypt(nonce, payload)
            .map_err(|_| NimbusError::DecryptionFailed)
    }

    fn content_id_key(&self) -> &[u8; 32] {
        &self.content_id_key
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine() -> Aes256GcmEngine {
        Aes256GcmEngine::new(&[0x11; 32], &[0x22; 32])
    }

    #[test]
    fn encrypt_decrypt_roundtrip() {
        let e = engine();
        let sealed = e.encrypt(b"block payload", b"aad").unwrap();
        assert_ne!(&sealed[12..], b"block payload");
        let opened = e.decrypt(&sealed, b"aad").unwrap();
        assert_eq!(opened, b"block payload");
    }

    #[test]
    fn wrong_aad_fails() {
        let e = engine();
        let sealed = e.encrypt(b"data", b"blocks/ab/cdef").unwrap();
        assert!(matches!(
            e.decrypt(&sealed, b"blocks/ab/0000"),
            Err(NimbusError::DecryptionFailed)
        ));
    }

    #[test]
    fn tampered_ciphertext_fails() {
        let e = engine();
        let mut sealed = e.encrypt(b"data", b"aad").unwrap();
        sealed[14] ^= 0x01;
        assert!(matches!(
            e.decrypt(&sealed, b"aad"),
            Err(NimbusError::DecryptionFailed)
        ));
    }

    #[test]
    fn truncated_input_fails() {
        let e = engine();
        assert!(e.decrypt(&[0u8; 20], b"").is_err());
    }

    #[test]
    fn nonces_are_unique() {
        let e = engine();
        let a = e.encrypt(b"same", b"").unwrap();
        let b = e.encrypt(b"same", b"").unwrap();
        assert_ne!(a[..12], b[..12]);
    }
}
