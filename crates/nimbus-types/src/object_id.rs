use blake2::digest::consts::U32;
use blake2::digest::Mac;
use blake2::Blake2bMac;
use serde::{Deserialize, Serialize};
use std::fmt;

type KeyedBlake2b256 = Blake2bMac<U32>;

/// A 32-byte content identifier computed as keyed BLAKE2b-256 over a block's
/// raw payload. Identical payloads always produce identical ids, which is
/// what deduplication relies on.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectId(pub [u8; 32]);

impl ObjectId {
    /// Compute an object ID using keyed BLAKE2b-256 (BLAKE2b-MAC with 32-byte output).
    pub fn compute(key: &[u8; 32], data: &[u8]) -> Self {
        let mut hasher =
            KeyedBlake2b256::new_from_slice(key).expect("valid 32-byte key for BLAKE2b");
        Mac::update(&mut hasher, data);
        let result = hasher.finalize();
        let mut out = [0u8; 32];
        out.copy_from_slice(&result.into_bytes());
        ObjectId(out)
    }

    /// Hex-encode the full object ID.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// First byte as a two-char hex string, used for shard directory.
    pub fn shard_prefix(&self) -> String {
        hex::encode(&self.0[..1])
    }

    /// Remote storage key for this object: `blocks/<shard>/<hex>`.
    pub fn storage_key(&self) -> String {
        format!("blocks/{}/{}", self.shard_prefix(), self.to_hex())
    }
}

impl fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectId({})", &self.to_hex()[..16])
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", &self.to_hex()[..16])
    }
}
