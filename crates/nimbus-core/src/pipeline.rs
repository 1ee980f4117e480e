use std::sync::Arc;

use nimbus_types::error::{NimbusError, Result};
use nimbus_types::ObjectId;

use crate::compress::{self, Compression};
use crate::crypto::CryptoEngine;

/// Domain-separation marker for object identity binding in AEAD AAD.
const OBJECT_CONTEXT_AAD_PREFIX: &[u8] = b"nimbus:object-context:v1\0";

/// Object type tags for the storage envelope format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ObjectKind {
    BlockData = 0,
    Metadata = 1,
}

impl ObjectKind {
    pub fn from_u8(v: u8) -> Result<Self> {
        match v {
            0 => Ok(Self::BlockData),
            1 => Ok(Self::Metadata),
            _ => Err(NimbusError::UnknownFormatTag(v)),
        }
    }
}

fn contextual_aad(tag: u8, context: &[u8]) -> Vec<u8> {
    let mut aad = Vec::with_capacity(1 + OBJECT_CONTEXT_AAD_PREFIX.len() + context.len());
    aad.push(tag);
    aad.extend_from_slice(OBJECT_CONTEXT_AAD_PREFIX);
    aad.extend_from_slice(context);
    aad
}

fn parse_envelope(data: &[u8]) -> Result<(u8, ObjectKind, &[u8])> {
    if data.is_empty() {
        return Err(NimbusError::InvalidFormat("empty object".into()));
    }
    let tag = data[0];
    let kind = ObjectKind::from_u8(tag)?;
    Ok((tag, kind, &data[1..]))
}

/// Upload/download transformation pipeline: compression followed by
/// authenticated encryption, with the object's storage key bound into the
/// AAD so a valid ciphertext cannot be served under the wrong key.
///
/// Wire format: `[1-byte kind tag][nonce][ciphertext + GCM tag]`, where the
/// plaintext under the cipher is the tag-prefixed compressed block. With a
/// `PlaintextEngine` the middle layer collapses and the compressed bytes
/// follow the kind tag directly.
pub struct Pipeline {
    crypto: Arc<dyn CryptoEngine>,
    compression: Compression,
}

impl Pipeline {
    pub fn new(crypto: Arc<dyn CryptoEngine>, compression: Compression) -> Self {
        Self {
            crypto,
            compression,
        }
    }

    /// Compute the content id of a plaintext block. Keyed, so ids leak
    /// nothing about content to anyone without the master key.
    pub fn content_id(&self, data: &[u8]) -> ObjectId {
        ObjectId::compute(self.crypto.content_id_key(), data)
    }

    /// Transform a plaintext block into its stored representation for the
    /// object keyed by `id`.
    pub fn seal(&self, id: &ObjectId, data: &[u8]) -> Result<Vec<u8>> {
        self.seal_kind(ObjectKind::BlockData, id.storage_key().as_bytes(), data)
    }

    /// Reverse `seal` and verify the result hashes back to `id`. A mismatch
    /// is reported as corruption, never silently returned.
    pub fn open(&self, id: &ObjectId, stored: &[u8]) -> Result<Vec<u8>> {
        let data = self.open_kind(ObjectKind::BlockData, id.storage_key().as_bytes(), stored)?;
        let actual = self.content_id(&data);
        if actual != *id {
            return Err(NimbusError::Corruption {
                object: id.to_hex(),
                detail: format!("content hash mismatch (got {})", actual.to_hex()),
            });
        }
        Ok(data)
    }

    /// Seal a metadata object (not content-addressed; bound to its name).
    pub fn seal_metadata(&self, name: &str, data: &[u8]) -> Result<Vec<u8>> {
        self.seal_kind(ObjectKind::Metadata, name.as_bytes(), data)
    }

    /// Open a metadata object previously sealed under `name`.
    pub fn open_metadata(&self, name: &str, stored: &[u8]) -> Result<Vec<u8>> {
        self.open_kind(ObjectKind::Metadata, name.as_bytes(), stored)
    }

    fn seal_kind(&self, kind: ObjectKind, context: &[u8], data: &[u8]) -> Result<Vec<u8>> {
        let tag = kind as u8;
        let compressed = compress::compress(self.compression, data)?;
        let aad = contextual_aad(tag, context);
        let encrypted = self.crypto.encrypt(&compressed, &aad)?;

        let mut out = Vec::with_capacity(1 + encrypted.len());
        out.push(tag);
        out.extend_from_slice(&encrypted);
        Ok(out)
    }

    fn open_kind(&self, expected: ObjectKind, context: &[u8], stored: &[u8]) -> Result<Vec<u8>> {
        let (tag, kind, encrypted) = parse_envelope(stored)?;
        if kind != expected {
            return Err(NimbusError::InvalidFormat(format!(
                "unexpected object kind: expected {expected:?}, got {kind:?}"
            )));
        }
        let aad = contextual_aad(tag, context);
        let compressed = self.crypto.decrypt(encrypted, &aad)?;
        compress::decompress(&compressed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::aes_gcm::Aes256GcmEngine;
    use crate::crypto::PlaintextEngine;

    fn encrypted_pipeline() -> Pipeline {
        Pipeline::new(
            Arc::new(Aes256GcmEngine::new(&[0x41; 32], &[0x42; 32])),
            Compression::ZstdLevel { level: 3 },
        )
    }

    #[test]
    fn seal_open_roundtrip() {
        let p = encrypted_pipeline();
        let data = b"some block payload that compresses compresses compresses".to_vec();
        let id = p.content_id(&data);
        let sealed = p.seal(&id, &data).unwrap();
        assert_eq!(p.open(&id, &sealed).unwrap(), data);
    }

    #[test]
    fn sealed_bytes_reveal_nothing() {
        let p = encrypted_pipeline();
        let data = vec![0x55; 1024];
        let id = p.content_id(&data);
        let sealed = p.seal(&id, &data).unwrap();
        assert_eq!(sealed[0], ObjectKind::BlockData as u8);
        // Nothing beyond the tag byte should repeat the plaintext pattern.
        assert!(!sealed[1..].windows(8).any(|w| w == [0x55; 8]));
    }

    #[test]
    fn open_under_wrong_id_fails() {
        // An object copied to a different storage key must not decrypt:
        // the AAD binds the ciphertext to the key it was sealed for.
        let p = encrypted_pipeline();
        let data = b"block".to_vec();
        let id = p.content_id(&data);
        let other = p.content_id(b"different");
        let sealed = p.seal(&id, &data).unwrap();
        assert!(matches!(
            p.open(&other, &sealed),
            Err(NimbusError::DecryptionFailed)
        ));
    }

    #[test]
    fn plaintext_engine_detects_hash_mismatch() {
        // Without AEAD, corruption is caught by the content-hash check.
        let p = Pipeline::new(Arc::new(PlaintextEngine::new(&[0x42; 32])), Compression::None);
        let data = b"payload".to_vec();
        let id = p.content_id(&data);
        let mut sealed = p.seal(&id, &data).unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0x01;
        assert!(matches!(
            p.open(&id, &sealed),
            Err(NimbusError::Corruption { .. })
        ));
    }

    #[test]
    fn metadata_roundtrip_and_kind_check() {
        let p = encrypted_pipeline();
        let sealed = p.seal_metadata("meta/table", b"serialized table").unwrap();
        assert_eq!(sealed[0], ObjectKind::Metadata as u8);
        assert_eq!(
            p.open_metadata("meta/table", &sealed).unwrap(),
            b"serialized table"
        );

        // A metadata object must not open as block data.
        let id = p.content_id(b"x");
        assert!(matches!(
            p.open(&id, &sealed),
            Err(NimbusError::InvalidFormat(_))
        ));
    }

    #[test]
    fn empty_and_unknown_envelopes_rejected() {
        let p = encrypted_pipeline();
        assert!(p.open_metadata("m", &[]).is_err());
        assert!(matches!(
            p.open_metadata("m", &[0x7E, 1, 2]),
            Err(NimbusError::UnknownFormatTag(0x7E))
        ));
    }
}
