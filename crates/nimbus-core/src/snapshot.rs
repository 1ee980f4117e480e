use std::collections::HashSet;
use std::sync::Mutex;

use tracing::debug;

use nimbus_types::error::Result;
use nimbus_types::{FileId, ObjectId};

use crate::store::ObjectStore;

/// Set of files whose blocks may not be modified. Consulted by the cache
/// on every write-intent acquire and dirty release.
pub struct ImmutableFlags {
    files: Mutex<HashSet<FileId>>,
}

impl ImmutableFlags {
    pub fn new() -> Self {
        Self {
            files: Mutex::new(HashSet::new()),
        }
    }

    pub fn mark_immutable(&self, file: FileId) {
        self.files.lock().unwrap().insert(file);
        debug!(file = file.0, "file marked immutable");
    }

    pub fn clear_immutable(&self, file: FileId) {
        self.files.lock().unwrap().remove(&file);
        debug!(file = file.0, "immutable flag cleared");
    }

    pub fn is_immutable(&self, file: FileId) -> bool {
        self.files.lock().unwrap().contains(&file)
    }
}

impl Default for ImmutableFlags {
    fn default() -> Self {
        Self::new()
    }
}

/// Copy-on-write duplication: add one reference per hash the copy shares
/// with the source. Moves no payload and touches no cache entries.
///
/// Returns the hashes whose records were already swept; the caller must
/// re-upload those blocks' payloads (the copy gets a fresh object, the
/// deleted one is not resurrected).
pub fn duplicate(store: &ObjectStore, hashes: &[ObjectId]) -> Result<Vec<ObjectId>> {
    let mut need_reupload = Vec::new();
    for id in hashes {
        if !store.retain(id)? {
            need_reupload.push(*id);
        }
    }
    if !need_reupload.is_empty() {
        debug!(
            total = hashes.len(),
            missing = need_reupload.len(),
            "duplicate found swept objects"
        );
    }
    Ok(need_reupload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compress::Compression;
    use crate::crypto::PlaintextEngine;
    use crate::pipeline::Pipeline;
    use crate::testutil::MemoryBackend;
    use std::sync::Arc;

    fn test_store(dir: &std::path::Path) -> ObjectStore {
        let pipeline = Pipeline::new(Arc::new(PlaintextEngine::new(&[7; 32])), Compression::None);
        ObjectStore::open(Arc::new(MemoryBackend::new()), pipeline, dir, 1).unwrap()
    }

    #[test]
    fn flags_toggle() {
        let flags = ImmutableFlags::new();
        let f = FileId(9);
        assert!(!flags.is_immutable(f));
        flags.mark_immutable(f);
        assert!(flags.is_immutable(f));
        flags.clear_immutable(f);
        assert!(!flags.is_immutable(f));
    }

    #[test]
    fn duplicate_bumps_refcounts() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(dir.path());
        let a = store.upload(b"block a").unwrap();
        let b = store.upload(b"block b").unwrap();

        let missing = duplicate(&store, &[a, b]).unwrap();
        assert!(missing.is_empty());
        assert_eq!(store.refcount(&a), Some(2));
        assert_eq!(store.refcount(&b), Some(2));
    }

    #[test]
    fn duplicate_reports_swept_hashes() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(dir.path());
        let kept = store.upload(b"kept").unwrap();
        let gone = ObjectId([0xEE; 32]);

        let missing = duplicate(&store, &[kept, gone]).unwrap();
        assert_eq!(missing, vec![gone]);
        assert_eq!(store.refcount(&kept), Some(2));
    }
}
