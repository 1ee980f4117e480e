pub mod log;

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{SystemTime, UNIX_EPOCH};

use crossbeam_channel::{Receiver, Sender};
use tracing::{debug, warn};

use nimbus_storage::StorageBackend;
use nimbus_types::error::{NimbusError, Result};
use nimbus_types::ObjectId;

use crate::pipeline::Pipeline;
use log::{LogRecord, TableLog};

/// Bookkeeping for one stored object.
#[derive(Debug, Clone, Copy, serde::Serialize, serde::Deserialize)]
pub struct ObjectRecord {
    pub refcount: u32,
    /// Size of the sealed representation on the backend.
    pub stored_size: u64,
    /// Unix seconds at first upload.
    pub created_at: u64,
}

struct TableState {
    records: HashMap<ObjectId, ObjectRecord>,
    /// Hashes whose first upload is currently on the wire. A concurrent
    /// identical upload waits on `flight_done` instead of double-uploading.
    in_flight: HashSet<ObjectId>,
    log: TableLog,
}

struct StoreInner {
    backend: Arc<dyn StorageBackend>,
    pipeline: Pipeline,
    table: Mutex<TableState>,
    flight_done: Condvar,
}

/// Content-addressed object store with reference counting.
///
/// Identical payloads share one stored object; `upload` of a payload whose
/// hash is already in the table is a refcount bump with no backend I/O.
/// Objects whose refcount drops to zero are deleted asynchronously by the
/// sweeper threads, and the table itself is durable across unclean
/// shutdown via [`TableLog`].
pub struct ObjectStore {
    inner: Arc<StoreInner>,
    sweep_tx: Option<Sender<ObjectId>>,
    sweepers: Vec<JoinHandle<()>>,
}

impl ObjectStore {
    /// Open the store, recovering the object table from `table_dir` and
    /// starting `sweeper_threads` garbage-collection workers. Records left
    /// at refcount zero by a crash are queued for sweeping immediately.
    pub fn open(
        backend: Arc<dyn StorageBackend>,
        pipeline: Pipeline,
        table_dir: &Path,
        sweeper_threads: usize,
    ) -> Result<Self> {
        let (records, log) = TableLog::open(table_dir)?;
        let leftover: Vec<ObjectId> = records
            .iter()
            .filter(|(_, rec)| rec.refcount == 0)
            .map(|(id, _)| *id)
            .collect();

        let inner = Arc::new(StoreInner {
            backend,
            pipeline,
            table: Mutex::new(TableState {
                records,
                in_flight: HashSet::new(),
                log,
            }),
            flight_done: Condvar::new(),
        });

        let (sweep_tx, sweep_rx) = crossbeam_channel::unbounded::<ObjectId>();
        let mut sweepers = Vec::with_capacity(sweeper_threads.max(1));
        for i in 0..sweeper_threads.max(1) {
            let inner = Arc::clone(&inner);
            let rx: Receiver<ObjectId> = sweep_rx.clone();
            let handle = std::thread::Builder::new()
                .name(format!("nimbus-sweep-{i}"))
                .spawn(move || {
                    while let Ok(id) = rx.recv() {
                        sweep_one(&inner, &id);
                    }
                })?;
            sweepers.push(handle);
        }

        for id in leftover {
            debug!(object = %id, "queueing unreferenced object left by previous session");
            let _ = sweep_tx.send(id);
        }

        Ok(Self {
            inner,
            sweep_tx: Some(sweep_tx),
            sweepers,
        })
    }

    /// Store a payload, deduplicating by content hash. Returns the object's
    /// id with one reference accounted to the caller.
    pub fn upload(&self, payload: &[u8]) -> Result<ObjectId> {
        let id = self.inner.pipeline.content_id(payload);

        {
            let mut table = self.inner.table.lock().unwrap();
            loop {
                if table.in_flight.contains(&id) {
                    // First upload of this hash is on the wire; wait for it.
                    table = self.inner.flight_done.wait(table).unwrap();
                    continue;
                }
                if let Some(rec) = table.records.get_mut(&id) {
                    // Dedup hit. Also resurrects a record still at
                    // refcount 0 that the sweeper has not reached yet.
                    rec.refcount += 1;
                    let refcount = rec.refcount;
                    table.log.append(&LogRecord::Retain { id })?;
                    table.log.commit()?;
                    debug!(object = %id, refcount, "upload deduplicated");
                    return Ok(id);
                }
                table.in_flight.insert(id);
                break;
            }
        }

        // Novel hash: seal and upload without holding the table lock.
        let outcome = self.put_novel(&id, payload);

        let mut table = self.inner.table.lock().unwrap();
        table.in_flight.remove(&id);
        self.inner.flight_done.notify_all();
        let stored_size = outcome?;
        let created_at = unix_now();
        table.records.insert(
            id,
            ObjectRecord {
                refcount: 1,
                stored_size,
                created_at,
            },
        );
        // Logged only after the backend put succeeded, so replay never
        // counts a half-uploaded object.
        table.log.append(&LogRecord::Insert {
            id,
            stored_size,
            created_at,
        })?;
        table.log.commit()?;
        debug!(object = %id, stored_size, "object uploaded");
        Ok(id)
    }

    fn put_novel(&self, id: &ObjectId, payload: &[u8]) -> Result<u64> {
        let sealed = self.inner.pipeline.seal(id, payload)?;
        self.inner.backend.put(&id.storage_key(), &sealed)?;
        Ok(sealed.len() as u64)
    }

    /// Fetch and open a referenced object. A missing backend object is
    /// corruption: the table says someone still references it.
    pub fn fetch(&self, id: &ObjectId) -> Result<Vec<u8>> {
        {
            let table = self.inner.table.lock().unwrap();
            match table.records.get(id) {
                Some(rec) if rec.refcount > 0 => {}
                Some(_) => {
                    return Err(NimbusError::InvariantViolation(format!(
                        "fetch of unreferenced object {id}"
                    )))
                }
                None => {
                    return Err(NimbusError::InvariantViolation(format!(
                        "fetch of unknown object {id}"
                    )))
                }
            }
        }
        let stored = self
            .inner
            .backend
            .get(&id.storage_key())?
            .ok_or_else(|| NimbusError::Corruption {
                object: id.to_hex(),
                detail: "referenced object missing from backend".into(),
            })?;
        self.inner.pipeline.open(id, &stored)
    }

    /// Add a reference to an existing object. Returns `false` if the record
    /// is gone (already swept); the caller must re-upload the payload.
    pub fn retain(&self, id: &ObjectId) -> Result<bool> {
        let mut table = self.inner.table.lock().unwrap();
        match table.records.get_mut(id) {
            Some(rec) => {
                rec.refcount += 1;
                table.log.append(&LogRecord::Retain { id: *id })?;
                table.log.commit()?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Drop one reference. At zero the object is queued for the sweeper;
    /// nothing is deleted inline. Dropping below zero means the caller's
    /// bookkeeping and ours disagree, which is not recoverable online.
    pub fn release(&self, id: &ObjectId) -> Result<()> {
        let mut table = self.inner.table.lock().unwrap();
        let rec = table.records.get_mut(id).ok_or_else(|| {
            NimbusError::InvariantViolation(format!("release of unknown object {id}"))
        })?;
        if rec.refcount == 0 {
            return Err(NimbusError::InvariantViolation(format!(
                "refcount of object {id} would drop below zero"
            )));
        }
        rec.refcount -= 1;
        let now_zero = rec.refcount == 0;
        table.log.append(&LogRecord::Release { id: *id })?;
        table.log.commit()?;
        drop(table);

        if now_zero {
            if let Some(tx) = &self.sweep_tx {
                let _ = tx.send(*id);
            }
        }
        Ok(())
    }

    /// Queue every zero-refcount record for sweeping. Normally a no-op
    /// (releases queue eagerly); catches records orphaned by lost queue
    /// entries after a crash.
    pub fn sweep_all(&self) {
        let table = self.inner.table.lock().unwrap();
        for (id, rec) in &table.records {
            if rec.refcount == 0 && !table.in_flight.contains(id) {
                if let Some(tx) = &self.sweep_tx {
                    let _ = tx.send(*id);
                }
            }
        }
    }

    /// Write a full table snapshot and truncate the log.
    pub fn snapshot(&self) -> Result<()> {
        let mut table = self.inner.table.lock().unwrap();
        let TableState { records, log, .. } = &mut *table;
        log.snapshot(records)
    }

    /// Current refcount of an object, if its record exists.
    pub fn refcount(&self, id: &ObjectId) -> Option<u32> {
        let table = self.inner.table.lock().unwrap();
        table.records.get(id).map(|rec| rec.refcount)
    }

    /// Number of records in the table (any refcount).
    pub fn record_count(&self) -> usize {
        self.inner.table.lock().unwrap().records.len()
    }

    /// Ids of all records in the table.
    pub fn record_ids(&self) -> Vec<ObjectId> {
        let table = self.inner.table.lock().unwrap();
        table.records.keys().copied().collect()
    }

    pub fn backend(&self) -> &Arc<dyn StorageBackend> {
        &self.inner.backend
    }
}

impl Drop for ObjectStore {
    fn drop(&mut self) {
        // Closing the channel lets the sweepers drain and exit.
        self.sweep_tx.take();
        for handle in self.sweepers.drain(..) {
            let _ = handle.join();
        }
    }
}

fn sweep_one(inner: &StoreInner, id: &ObjectId) {
    {
        let mut table = inner.table.lock().unwrap();
        match table.records.get(id) {
            // A retain after the release-to-zero cancels the sweep.
            Some(rec) if rec.refcount == 0 => {
                table.records.remove(id);
                let logged = table
                    .log
                    .append(&LogRecord::Remove { id: *id })
                    .and_then(|_| table.log.commit());
                if let Err(e) = logged {
                    warn!(object = %id, error = %e, "failed to log object removal");
                }
                // Hold the in-flight marker across the delete so a
                // re-upload of the same hash waits instead of racing it.
                table.in_flight.insert(*id);
            }
            _ => return,
        }
    }
    match inner.backend.delete(&id.storage_key()) {
        Ok(()) => debug!(object = %id, "object swept"),
        Err(e) => warn!(object = %id, error = %e, "sweep delete failed; object leaked until offline check"),
    }
    let mut table = inner.table.lock().unwrap();
    table.in_flight.remove(id);
    inner.flight_done.notify_all();
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compress::Compression;
    use crate::crypto::aes_gcm::Aes256GcmEngine;
    use crate::testutil::MemoryBackend;

    fn pipeline() -> Pipeline {
        Pipeline::new(
            Arc::new(Aes256GcmEngine::new(&[0x01; 32], &[0x02; 32])),
            Compression::ZstdLevel { level: 3 },
        )
    }

    fn open_store(backend: Arc<dyn StorageBackend>, dir: &Path) -> ObjectStore {
        ObjectStore::open(backend, pipeline(), dir, 1).unwrap()
    }

    fn wait_for<F: Fn() -> bool>(cond: F) {
        for _ in 0..200 {
            if cond() {
                return;
            }
            std::thread::sleep(std::time::Duration::from_millis(10));
        }
        panic!("condition not reached within 2s");
    }

    #[test]
    fn upload_fetch_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(Arc::new(MemoryBackend::new()), dir.path());
        let id = store.upload(b"payload").unwrap();
        assert_eq!(store.fetch(&id).unwrap(), b"payload");
        assert_eq!(store.refcount(&id), Some(1));
    }

    #[test]
    fn identical_payloads_share_one_object() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(MemoryBackend::new());
        let store = open_store(backend.clone(), dir.path());

        let a = store.upload(b"same bytes").unwrap();
        let b = store.upload(b"same bytes").unwrap();
        assert_eq!(a, b);
        assert_eq!(store.refcount(&a), Some(2));
        assert_eq!(backend.object_count(), 1);
    }

    #[test]
    fn release_to_zero_deletes_from_backend() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(MemoryBackend::new());
        let store = open_store(backend.clone(), dir.path());

        let id = store.upload(b"ephemeral").unwrap();
        store.release(&id).unwrap();
        wait_for(|| store.refcount(&id).is_none());
        wait_for(|| backend.object_count() == 0);
        // And the record is gone: a later retain reports swept.
        assert!(!store.retain(&id).unwrap());
    }

    #[test]
    fn retain_before_sweep_resurrects() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(MemoryBackend::new());
        // No sweeper races: we never let the queue drain before retaining.
        let store = open_store(backend.clone(), dir.path());

        let id = store.upload(b"kept").unwrap();
        // Re-upload at refcount 0 is a plain dedup hit when the record
        // still exists.
        store.release(&id).unwrap();
        let again = store.upload(b"kept").unwrap();
        assert_eq!(again, id);
        // Either the sweeper lost the race (refcount recheck) and the
        // object survives, or it never ran; both leave refcount 1.
        assert_eq!(store.refcount(&id), Some(1));
        assert_eq!(store.fetch(&id).unwrap(), b"kept");
    }

    #[test]
    fn release_below_zero_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(Arc::new(MemoryBackend::new()), dir.path());
        let id = store.upload(b"x").unwrap();
        store.release(&id).unwrap();
        wait_for(|| store.refcount(&id).is_none());
        let err = store.release(&id).unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn fetch_of_missing_backend_object_is_corruption() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(MemoryBackend::new());
        let store = open_store(backend.clone(), dir.path());
        let id = store.upload(b"data").unwrap();
        backend.remove_all();
        assert!(matches!(
            store.fetch(&id),
            Err(NimbusError::Corruption { .. })
        ));
    }

    #[test]
    fn table_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(MemoryBackend::new());
        let id;
        {
            let store = open_store(backend.clone(), dir.path());
            id = store.upload(b"durable").unwrap();
            store.retain(&id).unwrap();
        }
        let store = open_store(backend, dir.path());
        assert_eq!(store.refcount(&id), Some(2));
        assert_eq!(store.fetch(&id).unwrap(), b"durable");
    }

    #[test]
    fn snapshot_then_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(MemoryBackend::new());
        let id;
        {
            let store = open_store(backend.clone(), dir.path());
            id = store.upload(b"snapped").unwrap();
            store.snapshot().unwrap();
        }
        let store = open_store(backend, dir.path());
        assert_eq!(store.refcount(&id), Some(1));
    }

    #[test]
    fn concurrent_identical_uploads_store_once() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(MemoryBackend::new());
        let store = Arc::new(open_store(backend.clone(), dir.path()));

        let barrier = Arc::new(std::sync::Barrier::new(4));
        let mut handles = Vec::new();
        for _ in 0..4 {
            let store = Arc::clone(&store);
            let barrier = Arc::clone(&barrier);
            handles.push(std::thread::spawn(move || {
                barrier.wait();
                store.upload(b"raced payload").unwrap()
            }));
        }
        let ids: Vec<ObjectId> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert!(ids.windows(2).all(|w| w[0] == w[1]));
        assert_eq!(store.refcount(&ids[0]), Some(4));
        assert_eq!(backend.object_count(), 1);
    }
}
