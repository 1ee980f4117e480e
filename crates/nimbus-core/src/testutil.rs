use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use nimbus_storage::StorageBackend;
use nimbus_types::error::{NimbusError, Result};

/// In-memory storage backend for testing. Thread-safe via Mutex.
pub struct MemoryBackend {
    data: Mutex<HashMap<String, Vec<u8>>>,
    fail_puts: AtomicBool,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self {
            data: Mutex::new(HashMap::new()),
            fail_puts: AtomicBool::new(false),
        }
    }

    /// Make every subsequent `put` fail, for exercising upload-error paths.
    pub fn set_fail_puts(&self, fail: bool) {
        self.fail_puts.store(fail, Ordering::SeqCst);
    }

    pub fn object_count(&self) -> usize {
        self.data.lock().unwrap().len()
    }

    pub fn remove_all(&self) {
        self.data.lock().unwrap().clear();
    }
}

impl StorageBackend for MemoryBackend {
    fn put(&self, key: &str, data: &[u8]) -> Result<()> {
        if self.fail_puts.load(Ordering::SeqCst) {
            return Err(NimbusError::Backend(format!("injected put failure: {key}")));
        }
        let mut map = self.data.lock().unwrap();
        map.insert(key.to_string(), data.to_vec());
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let map = self.data.lock().unwrap();
        Ok(map.get(key).cloned())
    }

    fn delete(&self, key: &str) -> Result<()> {
        let mut map = self.data.lock().unwrap();
        map.remove(key);
        Ok(())
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let map = self.data.lock().unwrap();
        Ok(map
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }

    fn exists(&self, key: &str) -> Result<bool> {
        let map = self.data.lock().unwrap();
        Ok(map.contains_key(key))
    }
}
