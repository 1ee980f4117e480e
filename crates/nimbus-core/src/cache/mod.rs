//! Block cache manager and upload scheduler.
//!
//! Blocks live in memory with a spool file per entry in the cache
//! directory. Dirty blocks are uploaded by a fixed worker pool fed from a
//! single FIFO queue; the idle-flush timer, `flush_all` and
//! eviction-forced flushes all enqueue into that queue, and a block has at
//! most one job in flight at a time.

use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{select, Receiver, Sender};
use tracing::{debug, warn};

use nimbus_types::error::{NimbusError, Result};
use nimbus_types::{BlockKey, ObjectId};

use crate::snapshot::ImmutableFlags;
use crate::store::ObjectStore;

/// One cached block. The spool file keeps an open descriptor for the
/// entry's lifetime, which is why residency has a separate entry-count
/// budget next to the byte budget.
struct CacheEntry {
    spool: File,
    payload: Vec<u8>,
    /// Object currently backing this block, if it was ever uploaded or
    /// fetched. The block owns one store reference on it.
    hash: Option<ObjectId>,
    dirty: bool,
    /// Set when a dirty write lands while an upload of this block is in
    /// flight; forces a re-upload after the current one completes.
    modified_after_upload: bool,
    pins: u32,
    last_write: Instant,
}

struct CacheState {
    entries: HashMap<BlockKey, CacheEntry>,
    /// LRU order, least recently used first. Invariant: same key set as
    /// `entries`.
    recency: Vec<BlockKey>,
    total_bytes: u64,
    max_bytes: u64,
    max_entries: usize,
    /// Blocks with an upload queued or on the wire.
    in_transit: HashSet<BlockKey>,
    /// Worker failures, surfaced on the next `flush_all`.
    upload_errors: Vec<NimbusError>,
}

struct CacheInner {
    store: Arc<ObjectStore>,
    immutable: Arc<ImmutableFlags>,
    spool_dir: PathBuf,
    state: Mutex<CacheState>,
    /// Signaled on every unpin, upload completion and entry removal.
    changed: Condvar,
    locks: KeyLocks,
    idle_flush: Duration,
}

impl CacheInner {
    fn spool_path(&self, key: BlockKey) -> PathBuf {
        self.spool_dir.join(key.spool_name())
    }
}

#[derive(Debug, Clone)]
pub struct CacheOptions {
    pub dir: PathBuf,
    pub max_bytes: u64,
    pub max_entries: usize,
    pub upload_threads: usize,
    pub idle_flush: Duration,
}

/// A pinned view of one block. The entry cannot be evicted until the
/// handle is passed back to [`BlockCache::release`].
pub struct BlockHandle {
    key: BlockKey,
    data: Vec<u8>,
}

impl BlockHandle {
    pub fn key(&self) -> BlockKey {
        self.key
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut Vec<u8> {
        &mut self.data
    }
}

/// The block cache. One per mount session; owns the upload workers and
/// the idle-flush timer.
pub struct BlockCache {
    inner: Arc<CacheInner>,
    upload_tx: Option<Sender<BlockKey>>,
    workers: Vec<JoinHandle<()>>,
    timer_stop: Option<Sender<()>>,
    timer: Option<JoinHandle<()>>,
}

impl BlockCache {
    pub fn new(
        store: Arc<ObjectStore>,
        immutable: Arc<ImmutableFlags>,
        opts: CacheOptions,
    ) -> Result<Self> {
        let spool_dir = opts.dir.join("blocks");
        std::fs::create_dir_all(&spool_dir)?;

        let inner = Arc::new(CacheInner {
            store,
            immutable,
            spool_dir,
            state: Mutex::new(CacheState {
                entries: HashMap::new(),
                recency: Vec::new(),
                total_bytes: 0,
                max_bytes: opts.max_bytes,
                max_entries: opts.max_entries,
                in_transit: HashSet::new(),
                upload_errors: Vec::new(),
            }),
            changed: Condvar::new(),
            locks: KeyLocks::new(),
            idle_flush: opts.idle_flush,
        });

        let (upload_tx, upload_rx) = crossbeam_channel::unbounded::<BlockKey>();
        let mut workers = Vec::new();
        for i in 0..opts.upload_threads.max(1) {
            let inner = Arc::clone(&inner);
            let rx = upload_rx.clone();
            workers.push(
                std::thread::Builder::new()
                    .name(format!("nimbus-upload-{i}"))
                    .spawn(move || worker_loop(inner, rx))?,
            );
        }

        let (timer_stop, stop_rx) = crossbeam_channel::bounded::<()>(0);
        let timer = {
            let inner = Arc::clone(&inner);
            let tx = upload_tx.clone();
            std::thread::Builder::new()
                .name("nimbus-idle-flush".into())
                .spawn(move || timer_loop(inner, tx, stop_rx))?
        };

        Ok(Self {
            inner,
            upload_tx: Some(upload_tx),
            workers,
            timer_stop: Some(timer_stop),
            timer: Some(timer),
        })
    }

    /// Pin a block for reading or writing and return its current payload.
    ///
    /// A miss with a `known` hash fetches the object from the store (the
    /// entry starts clean); a miss without one starts an empty block.
    /// Concurrent acquires of the same key are serialized by a per-key
    /// lock so a block is fetched at most once. A miss grows the cache and
    /// then evicts down to the budgets before returning; when every other
    /// entry is pinned or in flight this blocks until one is released.
    pub fn acquire(
        &self,
        key: BlockKey,
        known: Option<ObjectId>,
        for_write: bool,
    ) -> Result<BlockHandle> {
        if for_write && self.inner.immutable.is_immutable(key.file) {
            return Err(NimbusError::Immutable(key.file.0));
        }
        let _guard = self.inner.locks.guard(key);

        {
            let mut state = self.inner.state.lock().unwrap();
            if let Some(entry) = state.entries.get_mut(&key) {
                entry.pins += 1;
                let data = entry.payload.clone();
                touch(&mut state.recency, key);
                return Ok(BlockHandle { key, data });
            }
        }

        // Miss. Populate outside the state lock; the key guard keeps a
        // second acquire of the same block from duplicating the fetch.
        let (payload, hash) = match known {
            Some(id) => (self.inner.store.fetch(&id)?, Some(id)),
            None => (Vec::new(), None),
        };
        let mut spool = File::options()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(self.inner.spool_path(key))?;
        spool.write_all(&payload)?;

        let mut state = self.inner.state.lock().unwrap();
        state.total_bytes += payload.len() as u64;
        state.entries.insert(
            key,
            CacheEntry {
                spool,
                payload: payload.clone(),
                hash,
                dirty: false,
                modified_after_upload: false,
                pins: 1,
                last_write: Instant::now(),
            },
        );
        state.recency.push(key);
        debug!(block = %key, fetched = hash.is_some(), "block entered cache");

        // The new entry is pinned, so it cannot be its own victim.
        match self.evict_to_budget(state) {
            Ok(state) => {
                drop(state);
                Ok(BlockHandle { key, data: payload })
            }
            Err(e) => {
                // Hand the pin back before surfacing the eviction failure.
                let mut state = self.inner.state.lock().unwrap();
                if let Some(entry) = state.entries.get_mut(&key) {
                    entry.pins -= 1;
                }
                self.inner.changed.notify_all();
                Err(e)
            }
        }
    }

    /// Unpin a block, applying the handle's payload if `dirty`. A dirty
    /// release resets the block's idle timer and spools the new payload;
    /// it may then block evicting down to the cache budgets.
    pub fn release(&self, handle: BlockHandle, dirty: bool) -> Result<()> {
        let BlockHandle { key, data } = handle;

        if dirty && self.inner.immutable.is_immutable(key.file) {
            // The write is refused; the pin still has to go away.
            let mut state = self.inner.state.lock().unwrap();
            if let Some(entry) = state.entries.get_mut(&key) {
                entry.pins = entry.pins.saturating_sub(1);
            }
            self.inner.changed.notify_all();
            return Err(NimbusError::Immutable(key.file.0));
        }

        let _guard = self.inner.locks.guard(key);
        let mut state = self.inner.state.lock().unwrap();
        let in_transit = state.in_transit.contains(&key);
        let entry = state.entries.get_mut(&key).ok_or_else(|| {
            NimbusError::InvariantViolation(format!("release of non-resident block {key}"))
        })?;
        if entry.pins == 0 {
            return Err(NimbusError::InvariantViolation(format!(
                "release of unpinned block {key}"
            )));
        }
        entry.pins -= 1;

        let mut delta = 0i64;
        if dirty {
            delta = data.len() as i64 - entry.payload.len() as i64;
            write_spool(&mut entry.spool, &data)?;
            entry.payload = data;
            entry.dirty = true;
            entry.last_write = Instant::now();
            if in_transit {
                entry.modified_after_upload = true;
            }
        }
        state.total_bytes = (state.total_bytes as i64 + delta) as u64;
        touch(&mut state.recency, key);
        self.inner.changed.notify_all();

        let state = self.evict_to_budget(state)?;
        drop(state);
        Ok(())
    }

    /// Enqueue every dirty block and wait until no dirty entry and no
    /// in-flight job remains. Upload failures recorded since the last
    /// flush are surfaced here; the affected entries stay dirty.
    pub fn flush_all(&self) -> Result<()> {
        let mut state = self.inner.state.lock().unwrap();
        loop {
            if state.in_transit.is_empty() && !state.upload_errors.is_empty() {
                let first = state.upload_errors.remove(0);
                for e in state.upload_errors.drain(..) {
                    warn!(error = %e, "additional upload failure");
                }
                return Err(first);
            }
            let pending: Vec<BlockKey> = state
                .entries
                .iter()
                .filter(|(k, e)| e.dirty && !state.in_transit.contains(k))
                .map(|(k, _)| *k)
                .collect();
            if pending.is_empty() && state.in_transit.is_empty() {
                return Ok(());
            }
            if let Some(tx) = &self.upload_tx {
                for key in pending {
                    enqueue_upload(&mut state, tx, key);
                }
            }
            state = self.inner.changed.wait(state).unwrap();
        }
    }

    /// Change the cache budgets, evicting down to the new bounds before
    /// returning.
    pub fn resize(&self, max_bytes: u64, max_entries: usize) -> Result<()> {
        let mut state = self.inner.state.lock().unwrap();
        state.max_bytes = max_bytes;
        state.max_entries = max_entries;
        debug!(max_bytes, max_entries, "cache budgets changed");
        let state = self.evict_to_budget(state)?;
        drop(state);
        Ok(())
    }

    /// Drop a block that is being deleted: remove the resident entry and
    /// release the store reference its current hash holds. With `lazy`
    /// an in-flight upload of the block is left to drain on its own;
    /// otherwise the call waits for it first.
    ///
    /// Non-resident blocks are not the cache's to release; their owner
    /// calls [`ObjectStore::release`] directly.
    pub fn detach(&self, key: BlockKey, lazy: bool) -> Result<()> {
        let _guard = self.inner.locks.guard(key);
        let mut state = self.inner.state.lock().unwrap();
        if !lazy {
            while state.in_transit.contains(&key) {
                state = self.inner.changed.wait(state).unwrap();
            }
        }
        if let Some(entry) = state.entries.get(&key) {
            if entry.pins > 0 {
                return Err(NimbusError::InvariantViolation(format!(
                    "detach of pinned block {key}"
                )));
            }
        }
        let hash = match state.entries.remove(&key) {
            Some(entry) => {
                state.total_bytes -= entry.payload.len() as u64;
                state.recency.retain(|k| *k != key);
                let hash = entry.hash;
                drop(entry);
                remove_spool(&self.inner.spool_path(key))?;
                hash
            }
            None => None,
        };
        self.inner.changed.notify_all();
        drop(state);

        if let Some(id) = hash {
            self.inner.store.release(&id)?;
        }
        debug!(block = %key, lazy, "block detached");
        Ok(())
    }

    pub fn resident_count(&self) -> usize {
        self.inner.state.lock().unwrap().entries.len()
    }

    pub fn dirty_count(&self) -> usize {
        let state = self.inner.state.lock().unwrap();
        state.entries.values().filter(|e| e.dirty).count()
    }

    pub fn total_bytes(&self) -> u64 {
        self.inner.state.lock().unwrap().total_bytes
    }

    pub fn is_resident(&self, key: BlockKey) -> bool {
        self.inner.state.lock().unwrap().entries.contains_key(&key)
    }

    /// Evict LRU-first until both budgets hold. Clean victims are dropped;
    /// dirty ones are flushed through the upload queue first. With nothing
    /// evictable this blocks until a release or upload completion changes
    /// that, which is the cache's backpressure on writers.
    fn evict_to_budget<'a>(
        &self,
        mut state: MutexGuard<'a, CacheState>,
    ) -> Result<MutexGuard<'a, CacheState>> {
        loop {
            if state.total_bytes <= state.max_bytes && state.entries.len() <= state.max_entries {
                return Ok(state);
            }
            let victim = state
                .recency
                .iter()
                .copied()
                .find(|k| match state.entries.get(k) {
                    Some(e) => e.pins == 0 && !state.in_transit.contains(k),
                    None => false,
                });
            match victim {
                Some(key) => {
                    let dirty = state.entries.get(&key).map(|e| e.dirty).unwrap_or(false);
                    if dirty {
                        let errors_before = state.upload_errors.len();
                        if let Some(tx) = &self.upload_tx {
                            enqueue_upload(&mut state, tx, key);
                        }
                        state = self.inner.changed.wait(state).unwrap();
                        if state.upload_errors.len() > errors_before {
                            return Err(state.upload_errors.remove(errors_before));
                        }
                    } else {
                        debug!(block = %key, "evicting clean block");
                        remove_entry(&self.inner, &mut state, key)?;
                    }
                }
                None => {
                    // Everything pinned or in flight.
                    state = self.inner.changed.wait(state).unwrap();
                }
            }
        }
    }
}

impl Drop for BlockCache {
    fn drop(&mut self) {
        // Stop the timer first; it holds a clone of the upload sender.
        self.timer_stop.take();
        if let Some(handle) = self.timer.take() {
            let _ = handle.join();
        }
        // Closing the queue lets the workers drain remaining jobs and exit.
        self.upload_tx.take();
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }
}

fn enqueue_upload(state: &mut CacheState, tx: &Sender<BlockKey>, key: BlockKey) {
    if state.in_transit.insert(key) {
        let _ = tx.send(key);
    }
}

fn touch(recency: &mut Vec<BlockKey>, key: BlockKey) {
    if let Some(pos) = recency.iter().position(|k| *k == key) {
        recency.remove(pos);
    }
    recency.push(key);
}

fn remove_entry(inner: &CacheInner, state: &mut CacheState, key: BlockKey) -> Result<()> {
    if let Some(entry) = state.entries.remove(&key) {
        state.total_bytes -= entry.payload.len() as u64;
        state.recency.retain(|k| *k != key);
        drop(entry);
        remove_spool(&inner.spool_path(key))?;
    }
    Ok(())
}

fn remove_spool(path: &Path) -> Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

fn write_spool(spool: &mut File, payload: &[u8]) -> Result<()> {
    spool.seek(SeekFrom::Start(0))?;
    spool.write_all(payload)?;
    spool.set_len(payload.len() as u64)?;
    Ok(())
}

fn timer_loop(inner: Arc<CacheInner>, tx: Sender<BlockKey>, stop: Receiver<()>) {
    let ticker = crossbeam_channel::tick(inner.idle_flush);
    loop {
        select! {
            recv(ticker) -> _ => idle_scan(&inner, &tx),
            recv(stop) -> _ => return,
        }
    }
}

/// Enqueue dirty blocks whose last write is at least one idle period old.
fn idle_scan(inner: &CacheInner, tx: &Sender<BlockKey>) {
    let mut state = inner.state.lock().unwrap();
    let threshold = inner.idle_flush;
    let due: Vec<BlockKey> = state
        .entries
        .iter()
        .filter(|(k, e)| {
            e.dirty && !state.in_transit.contains(k) && e.last_write.elapsed() >= threshold
        })
        .map(|(k, _)| *k)
        .collect();
    for key in due {
        debug!(block = %key, "idle flush");
        enqueue_upload(&mut state, tx, key);
    }
}

fn worker_loop(inner: Arc<CacheInner>, rx: Receiver<BlockKey>) {
    while let Ok(key) = rx.recv() {
        // A write landing mid-upload re-runs the job on the same worker,
        // preserving the one-in-flight-per-block invariant.
        while run_upload(&inner, key) == UploadOutcome::Requeue {}
    }
}

#[derive(PartialEq)]
enum UploadOutcome {
    Done,
    Requeue,
}

fn run_upload(inner: &CacheInner, key: BlockKey) -> UploadOutcome {
    let payload = {
        let mut state = inner.state.lock().unwrap();
        match state.entries.get_mut(&key) {
            Some(entry) if entry.dirty => {
                entry.modified_after_upload = false;
                entry.payload.clone()
            }
            // Detached or already clean; nothing to do.
            _ => {
                state.in_transit.remove(&key);
                inner.changed.notify_all();
                return UploadOutcome::Done;
            }
        }
    };

    let result = inner.store.upload(&payload);

    let mut to_release: Option<ObjectId> = None;
    let outcome;
    {
        let mut state = inner.state.lock().unwrap();
        match result {
            Ok(new_hash) => match state.entries.get_mut(&key) {
                Some(entry) => {
                    if entry.hash == Some(new_hash) {
                        // Content reverted to the recorded object; the
                        // upload's extra reference is redundant.
                        to_release = Some(new_hash);
                    } else {
                        to_release = entry.hash.replace(new_hash);
                    }
                    if entry.modified_after_upload {
                        outcome = UploadOutcome::Requeue;
                    } else {
                        entry.dirty = false;
                        state.in_transit.remove(&key);
                        outcome = UploadOutcome::Done;
                    }
                }
                None => {
                    // Detached mid-upload; nobody owns the new reference.
                    to_release = Some(new_hash);
                    state.in_transit.remove(&key);
                    outcome = UploadOutcome::Done;
                }
            },
            Err(e) => {
                warn!(block = %key, error = %e, "block upload failed");
                state.upload_errors.push(e);
                state.in_transit.remove(&key);
                outcome = UploadOutcome::Done;
            }
        }
        inner.changed.notify_all();
    }

    if let Some(id) = to_release {
        if let Err(e) = inner.store.release(&id) {
            inner.state.lock().unwrap().upload_errors.push(e);
        }
    }
    outcome
}

/// Per-block lock table: serializes acquire/release/detach of the same
/// block without blocking unrelated blocks.
struct KeyLocks {
    held: Mutex<HashSet<BlockKey>>,
    freed: Condvar,
}

struct KeyGuard<'a> {
    locks: &'a KeyLocks,
    key: BlockKey,
}

impl KeyLocks {
    fn new() -> Self {
        Self {
            held: Mutex::new(HashSet::new()),
            freed: Condvar::new(),
        }
    }

    fn guard(&self, key: BlockKey) -> KeyGuard<'_> {
        let mut held = self.held.lock().unwrap();
        while !held.insert(key) {
            held = self.freed.wait(held).unwrap();
        }
        KeyGuard { locks: self, key }
    }
}

impl Drop for KeyGuard<'_> {
    fn drop(&mut self) {
        self.locks.held.lock().unwrap().remove(&self.key);
        self.locks.freed.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compress::Compression;
    use crate::crypto::aes_gcm::Aes256GcmEngine;
    use crate::pipeline::Pipeline;
    use crate::testutil::MemoryBackend;
    use nimbus_types::FileId;

    struct Fixture {
        cache: BlockCache,
        store: Arc<ObjectStore>,
        backend: Arc<MemoryBackend>,
        immutable: Arc<ImmutableFlags>,
        _dir: tempfile::TempDir,
    }

    fn fixture(max_bytes: u64, max_entries: usize) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(MemoryBackend::new());
        let pipeline = Pipeline::new(
            Arc::new(Aes256GcmEngine::new(&[0x01; 32], &[0x02; 32])),
            Compression::Lz4,
        );
        let store = Arc::new(
            ObjectStore::open(backend.clone(), pipeline, &dir.path().join("table"), 1).unwrap(),
        );
        let immutable = Arc::new(ImmutableFlags::new());
        let cache = BlockCache::new(
            store.clone(),
            immutable.clone(),
            CacheOptions {
                dir: dir.path().to_path_buf(),
                max_bytes,
                max_entries,
                upload_threads: 2,
                // Long enough that tests control flushing explicitly.
                idle_flush: Duration::from_secs(600),
            },
        )
        .unwrap();
        Fixture {
            cache,
            store,
            backend,
            immutable,
            _dir: dir,
        }
    }

    fn key(file: u64, blockno: u64) -> BlockKey {
        BlockKey::new(FileId(file), blockno)
    }

    fn write_block(cache: &BlockCache, key: BlockKey, data: &[u8]) {
        let mut handle = cache.acquire(key, None, true).unwrap();
        handle.data_mut().clear();
        handle.data_mut().extend_from_slice(data);
        cache.release(handle, true).unwrap();
    }

    fn wait_for<F: Fn() -> bool>(cond: F) {
        for _ in 0..200 {
            if cond() {
                return;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        panic!("condition not reached within 2s");
    }

    #[test]
    fn write_then_read_back() {
        let fx = fixture(1 << 20, 16);
        let k = key(1, 0);
        write_block(&fx.cache, k, b"hello block");
        let handle = fx.cache.acquire(k, None, false).unwrap();
        assert_eq!(handle.data(), b"hello block");
        fx.cache.release(handle, false).unwrap();
    }

    #[test]
    fn flush_all_uploads_and_cleans() {
        let fx = fixture(1 << 20, 16);
        write_block(&fx.cache, key(1, 0), b"a");
        write_block(&fx.cache, key(1, 1), b"b");
        assert_eq!(fx.cache.dirty_count(), 2);

        fx.cache.flush_all().unwrap();
        assert_eq!(fx.cache.dirty_count(), 0);
        // Flushed blocks stay resident.
        assert_eq!(fx.cache.resident_count(), 2);
        assert_eq!(fx.backend.object_count(), 2);
    }

    #[test]
    fn identical_blocks_deduplicate() {
        let fx = fixture(1 << 20, 16);
        write_block(&fx.cache, key(1, 0), b"same content");
        write_block(&fx.cache, key(2, 7), b"same content");
        fx.cache.flush_all().unwrap();

        assert_eq!(fx.backend.object_count(), 1);
        assert_eq!(fx.store.record_count(), 1);
        let id = fx.store.record_ids()[0];
        assert_eq!(fx.store.refcount(&id), Some(2));
    }

    #[test]
    fn rewrite_releases_superseded_object() {
        let fx = fixture(1 << 20, 16);
        let k = key(3, 0);
        write_block(&fx.cache, k, b"version one");
        fx.cache.flush_all().unwrap();
        assert_eq!(fx.store.record_count(), 1);

        write_block(&fx.cache, k, b"version two");
        fx.cache.flush_all().unwrap();
        // The old object lost its only reference and gets swept.
        wait_for(|| fx.store.record_count() == 1);
        wait_for(|| fx.backend.object_count() == 1);
    }

    #[test]
    fn lru_eviction_prefers_least_recent() {
        let fx = fixture(1 << 20, 3);
        let (a, b, c, d) = (key(1, 0), key(1, 1), key(1, 2), key(1, 3));
        write_block(&fx.cache, a, b"aaaa");
        write_block(&fx.cache, b, b"bbbb");
        fx.cache.flush_all().unwrap();

        // Touch A so B becomes least recently used.
        let h = fx.cache.acquire(a, None, false).unwrap();
        fx.cache.release(h, false).unwrap();

        write_block(&fx.cache, c, b"cccc");
        fx.cache.flush_all().unwrap();
        write_block(&fx.cache, d, b"dddd");
        fx.cache.flush_all().unwrap();

        assert!(fx.cache.resident_count() <= 3);
        assert!(fx.cache.is_resident(a));
        assert!(!fx.cache.is_resident(b));
    }

    #[test]
    fn evicted_block_refetches_by_hash() {
        let fx = fixture(1 << 20, 16);
        let k = key(4, 0);
        write_block(&fx.cache, k, b"survives eviction");
        fx.cache.flush_all().unwrap();
        let id = fx.store.record_ids()[0];

        fx.cache.resize(1 << 20, 0).unwrap();
        fx.cache.resize(1 << 20, 16).unwrap();
        assert!(!fx.cache.is_resident(k));

        let handle = fx.cache.acquire(k, Some(id), false).unwrap();
        assert_eq!(handle.data(), b"survives eviction");
        fx.cache.release(handle, false).unwrap();
    }

    #[test]
    fn resize_evicts_synchronously() {
        let fx = fixture(1 << 20, 16);
        for i in 0..4 {
            write_block(&fx.cache, key(5, i), format!("block {i}").as_bytes());
        }
        fx.cache.resize(1 << 20, 2).unwrap();
        assert!(fx.cache.resident_count() <= 2);
        // Evicted dirty blocks were flushed, not dropped.
        fx.cache.flush_all().unwrap();
        assert_eq!(fx.store.record_count(), 4);
    }

    #[test]
    fn acquire_itself_enforces_entry_budget() {
        let fx = fixture(1 << 20, 2);
        write_block(&fx.cache, key(20, 0), b"aaaa");
        write_block(&fx.cache, key(20, 1), b"bbbb");
        fx.cache.flush_all().unwrap();
        assert_eq!(fx.cache.resident_count(), 2);

        // The miss must evict before the handle is returned, not at the
        // eventual release.
        let handle = fx.cache.acquire(key(20, 2), None, true).unwrap();
        assert!(fx.cache.resident_count() <= 2);
        fx.cache.release(handle, false).unwrap();
    }

    #[test]
    fn acquire_blocks_while_all_entries_pinned() {
        use std::sync::atomic::{AtomicBool, Ordering};

        let fx = Arc::new(fixture(1 << 20, 2));
        let (a, b, c) = (key(21, 0), key(21, 1), key(21, 2));
        write_block(&fx.cache, a, b"aaaa");
        write_block(&fx.cache, b, b"bbbb");
        fx.cache.flush_all().unwrap();

        let ha = fx.cache.acquire(a, None, false).unwrap();
        let hb = fx.cache.acquire(b, None, false).unwrap();

        let started = Arc::new(AtomicBool::new(false));
        let done = Arc::new(AtomicBool::new(false));
        let waiter = {
            let fx = Arc::clone(&fx);
            let started = Arc::clone(&started);
            let done = Arc::clone(&done);
            std::thread::spawn(move || {
                started.store(true, Ordering::SeqCst);
                let h = fx.cache.acquire(c, None, true).unwrap();
                done.store(true, Ordering::SeqCst);
                fx.cache.release(h, false).unwrap();
            })
        };

        wait_for(|| started.load(Ordering::SeqCst));
        std::thread::sleep(Duration::from_millis(100));
        // Both residents are pinned; the third acquire must stall.
        assert!(!done.load(Ordering::SeqCst));

        // One unpin frees a victim and unblocks the waiter.
        fx.cache.release(ha, false).unwrap();
        waiter.join().unwrap();
        assert!(done.load(Ordering::SeqCst));
        assert!(fx.cache.resident_count() <= 2);
        fx.cache.release(hb, false).unwrap();
    }

    #[test]
    fn immutable_file_rejects_writes() {
        let fx = fixture(1 << 20, 16);
        let k = key(6, 0);
        write_block(&fx.cache, k, b"frozen");
        fx.cache.flush_all().unwrap();
        fx.immutable.mark_immutable(FileId(6));

        assert!(matches!(
            fx.cache.acquire(k, None, true),
            Err(NimbusError::Immutable(6))
        ));

        // Dirty release through a read handle is refused too, and the
        // entry stays clean.
        let mut handle = fx.cache.acquire(k, None, false).unwrap();
        handle.data_mut().extend_from_slice(b" thawed?");
        assert!(matches!(
            fx.cache.release(handle, true),
            Err(NimbusError::Immutable(6))
        ));
        assert_eq!(fx.cache.dirty_count(), 0);

        fx.immutable.clear_immutable(FileId(6));
        write_block(&fx.cache, k, b"thawed");
        fx.cache.flush_all().unwrap();
    }

    #[test]
    fn upload_failure_surfaces_on_flush() {
        let fx = fixture(1 << 20, 16);
        fx.backend.set_fail_puts(true);
        write_block(&fx.cache, key(7, 0), b"doomed for now");

        let err = fx.cache.flush_all().unwrap_err();
        assert!(matches!(err, NimbusError::Backend(_)));
        assert_eq!(fx.cache.dirty_count(), 1);

        fx.backend.set_fail_puts(false);
        fx.cache.flush_all().unwrap();
        assert_eq!(fx.cache.dirty_count(), 0);
    }

    #[test]
    fn detach_releases_reference() {
        let fx = fixture(1 << 20, 16);
        let k = key(8, 0);
        write_block(&fx.cache, k, b"short lived");
        fx.cache.flush_all().unwrap();
        assert_eq!(fx.store.record_count(), 1);

        fx.cache.detach(k, false).unwrap();
        assert!(!fx.cache.is_resident(k));
        wait_for(|| fx.store.record_count() == 0);
        wait_for(|| fx.backend.object_count() == 0);
    }

    #[test]
    fn lazy_detach_with_dirty_block_drops_data() {
        let fx = fixture(1 << 20, 16);
        let k = key(8, 1);
        write_block(&fx.cache, k, b"never uploaded");
        fx.cache.detach(k, true).unwrap();
        fx.cache.flush_all().unwrap();
        assert_eq!(fx.store.record_count(), 0);
    }

    #[test]
    fn concurrent_same_block_writers_are_serialized() {
        let fx = Arc::new(fixture(1 << 20, 16));
        let k = key(9, 0);
        write_block(&fx.cache, k, b"seed");
        let barrier = Arc::new(std::sync::Barrier::new(4));
        let mut handles = Vec::new();
        for i in 0..4u8 {
            let fx = Arc::clone(&fx);
            let barrier = Arc::clone(&barrier);
            handles.push(std::thread::spawn(move || {
                barrier.wait();
                let mut h = fx.cache.acquire(k, None, true).unwrap();
                h.data_mut().clear();
                h.data_mut().extend_from_slice(&[i; 64]);
                fx.cache.release(h, true).unwrap();
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        fx.cache.flush_all().unwrap();

        // Whole-block writes: the surviving payload is one writer's
        // block, never an interleaving.
        let h = fx.cache.acquire(k, None, false).unwrap();
        let data = h.data().to_vec();
        fx.cache.release(h, false).unwrap();
        assert_eq!(data.len(), 64);
        assert!(data.iter().all(|b| *b == data[0]));
    }

    #[test]
    fn distinct_blocks_progress_independently() {
        let fx = Arc::new(fixture(1 << 20, 64));
        let mut handles = Vec::new();
        for file in 0..8u64 {
            let fx = Arc::clone(&fx);
            handles.push(std::thread::spawn(move || {
                for blockno in 0..4 {
                    write_block(&fx.cache, key(file + 100, blockno), &[file as u8; 128]);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        fx.cache.flush_all().unwrap();
        assert_eq!(fx.cache.dirty_count(), 0);
        // Eight distinct payloads, deduplicated across the four blocks
        // of each file.
        assert_eq!(fx.backend.object_count(), 8);
    }
}
