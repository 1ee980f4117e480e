use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of the file a block belongs to. Assigned by the metadata
/// layer; opaque to the cache and store.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FileId(pub u64);

impl fmt::Debug for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FileId({})", self.0)
    }
}

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The (file, block index) pair that keys the block cache.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BlockKey {
    pub file: FileId,
    pub blockno: u64,
}

impl BlockKey {
    pub fn new(file: FileId, blockno: u64) -> Self {
        Self { file, blockno }
    }

    /// Spool file name for this block in the local cache directory.
    pub fn spool_name(&self) -> String {
        format!("file_{}_block_{}", self.file.0, self.blockno)
    }
}

impl fmt::Debug for BlockKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlockKey(file={}, blockno={})", self.file, self.blockno)
    }
}

impl fmt::Display for BlockKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.file, self.blockno)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spool_name_is_stable() {
        let key = BlockKey::new(FileId(7), 42);
        assert_eq!(key.spool_name(), "file_7_block_42");
    }

    #[test]
    fn keys_hash_by_value() {
        use std::collections::HashSet;
        let mut set = HashSet::new();
        set.insert(BlockKey::new(FileId(1), 0));
        assert!(set.contains(&BlockKey::new(FileId(1), 0)));
        assert!(!set.contains(&BlockKey::new(FileId(1), 1)));
    }
}
