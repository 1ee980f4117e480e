use std::sync::Arc;

use tracing::info;

use nimbus_types::error::Result;

use crate::cache::BlockCache;
use crate::store::ObjectStore;

/// Entry points behind the mount's control socket. The socket transport
/// itself lives outside this crate; these are the operations it invokes.
pub struct Control {
    cache: Arc<BlockCache>,
    store: Arc<ObjectStore>,
}

impl Control {
    pub fn new(cache: Arc<BlockCache>, store: Arc<ObjectStore>) -> Self {
        Self { cache, store }
    }

    /// Upload all dirty blocks; returns once the cache is clean.
    pub fn flushcache(&self) -> Result<()> {
        info!("control: flushcache");
        self.cache.flush_all()
    }

    /// Change the cache budgets, evicting synchronously down to the new
    /// bounds.
    pub fn cachesize(&self, max_bytes: u64, max_entries: usize) -> Result<()> {
        info!(max_bytes, max_entries, "control: cachesize");
        self.cache.resize(max_bytes, max_entries)
    }

    /// Bring the mount to a flush-consistent state, persist the object
    /// table, then hand control to the externally owned metadata upload.
    pub fn upload_meta<F>(&self, upload: F) -> Result<()>
    where
        F: FnOnce() -> Result<()>,
    {
        info!("control: upload_meta");
        self.cache.flush_all()?;
        self.store.snapshot()?;
        upload()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheOptions;
    use crate::compress::Compression;
    use crate::crypto::PlaintextEngine;
    use crate::pipeline::Pipeline;
    use crate::snapshot::ImmutableFlags;
    use crate::testutil::MemoryBackend;
    use nimbus_types::{BlockKey, FileId};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    fn control(dir: &std::path::Path) -> (Control, Arc<BlockCache>) {
        let backend = Arc::new(MemoryBackend::new());
        let pipeline = Pipeline::new(Arc::new(PlaintextEngine::new(&[9; 32])), Compression::None);
        let store =
            Arc::new(ObjectStore::open(backend, pipeline, &dir.join("table"), 1).unwrap());
        let cache = Arc::new(
            BlockCache::new(
                store.clone(),
                Arc::new(ImmutableFlags::new()),
                CacheOptions {
                    dir: dir.to_path_buf(),
                    max_bytes: 1 << 20,
                    max_entries: 16,
                    upload_threads: 1,
                    idle_flush: Duration::from_secs(600),
                },
            )
            .unwrap(),
        );
        (Control::new(cache.clone(), store), cache)
    }

    fn dirty_block(cache: &BlockCache, data: &[u8]) {
        let mut h = cache
            .acquire(BlockKey::new(FileId(1), 0), None, true)
            .unwrap();
        h.data_mut().extend_from_slice(data);
        cache.release(h, true).unwrap();
    }

    #[test]
    fn flushcache_empties_dirty_set() {
        let dir = tempfile::tempdir().unwrap();
        let (control, cache) = control(dir.path());
        dirty_block(&cache, b"pending");
        assert_eq!(cache.dirty_count(), 1);
        control.flushcache().unwrap();
        assert_eq!(cache.dirty_count(), 0);
    }

    #[test]
    fn cachesize_applies_immediately() {
        let dir = tempfile::tempdir().unwrap();
        let (control, cache) = control(dir.path());
        dirty_block(&cache, b"resident");
        control.cachesize(1 << 20, 0).unwrap();
        assert_eq!(cache.resident_count(), 0);
    }

    #[test]
    fn upload_meta_runs_after_flush() {
        let dir = tempfile::tempdir().unwrap();
        let (control, cache) = control(dir.path());
        dirty_block(&cache, b"must be flushed first");

        let ran = AtomicBool::new(false);
        control
            .upload_meta(|| {
                // The callback observes a flush-consistent cache.
                assert_eq!(cache.dirty_count(), 0);
                ran.store(true, Ordering::SeqCst);
                Ok(())
            })
            .unwrap();
        assert!(ran.load(Ordering::SeqCst));
    }
}
