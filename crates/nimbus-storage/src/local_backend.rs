use std::fs;
use std::io::Write;
use std::path::{Component, Path, PathBuf};

use nimbus_types::error::{NimbusError, Result};

use crate::StorageBackend;

/// Storage backend for a local filesystem directory, using `std::fs`
/// directly. Mostly used for tests and for mounts whose "remote" store is
/// an NFS or similar path.
pub struct LocalBackend {
    root: PathBuf,
}

impl LocalBackend {
    /// Create a backend rooted at the given directory path. The directory
    /// is created if it does not exist.
    pub fn new(root: &str) -> Result<Self> {
        let root_path = PathBuf::from(root);
        fs::create_dir_all(&root_path)?;
        // Canonicalize for correct strip_prefix behavior with symlinked roots.
        let root = fs::canonicalize(&root_path)?;
        Ok(Self { root })
    }

    /// Reject storage keys that could escape the backend root.
    fn validate_key(key: &str) -> Result<()> {
        if key.is_empty() {
            return Err(NimbusError::InvalidFormat("unsafe storage key: empty".into()));
        }
        if key.starts_with('/') || key.starts_with('\\') {
            return Err(NimbusError::InvalidFormat(format!(
                "unsafe storage key: absolute path '{key}'"
            )));
        }
        if key.contains('\\') {
            return Err(NimbusError::InvalidFormat(format!(
                "unsafe storage key: contains backslash '{key}'"
            )));
        }
        for component in Path::new(key).components() {
            if component == Component::ParentDir {
                return Err(NimbusError::InvalidFormat(format!(
                    "unsafe storage key: parent traversal '{key}'"
                )));
            }
        }
        Ok(())
    }

    /// Resolve a `/`-separated storage key to a filesystem path under the root.
    fn resolve(&self, key: &str) -> Result<PathBuf> {
        Self::validate_key(key)?;
        Ok(self.root.join(key))
    }

    /// Write data to a temp file in the same directory, then atomically
    /// rename into place so readers never observe a partial object.
    fn atomic_write(&self, path: &Path, data: &[u8]) -> Result<()> {
        let dir = path.parent().unwrap_or(&self.root);
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        tmp.write_all(data)?;
        tmp.persist(path).map_err(|e| e.error)?;
        Ok(())
    }

    /// Recursively list all files under `dir` as `/`-separated keys
    /// relative to the backend root.
    fn list_recursive(&self, dir: &Path, keys: &mut Vec<String>) -> Result<()> {
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let file_type = entry.file_type()?;
            if file_type.is_dir() {
                self.list_recursive(&entry.path(), keys)?;
            } else if file_type.is_file() {
                if let Ok(rel) = entry.path().strip_prefix(&self.root) {
                    let key = rel
                        .components()
                        .map(|c| c.as_os_str().to_string_lossy())
                        .collect::<Vec<_>>()
                        .join("/");
                    keys.push(key);
                }
            }
        }
        Ok(())
    }
}

impl StorageBackend for LocalBackend {
    fn put(&self, key: &str, data: &[u8]) -> Result<()> {
        let path = self.resolve(key)?;
        match self.atomic_write(&path, data) {
            Err(NimbusError::Io(ref e)) if e.kind() == std::io::ErrorKind::NotFound => {
                if let Some(parent) = path.parent() {
                    fs::create_dir_all(parent)?;
                }
                self.atomic_write(&path, data)
            }
            other => other,
        }
    }

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let path = self.resolve(key)?;
        match fs::read(&path) {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn delete(&self, key: &str) -> Result<()> {
        let path = self.resolve(key)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>> {
        // A prefix may name a directory or a partial file name; list from
        // the deepest existing directory and filter.
        let (dir, _) = match prefix.rsplit_once('/') {
            Some((dir, rest)) => (self.resolve(dir)?, rest),
            None => (self.root.clone(), prefix),
        };
        let mut keys = Vec::new();
        match fs::metadata(&dir) {
            Ok(meta) if meta.is_dir() => self.list_recursive(&dir, &mut keys)?,
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        keys.retain(|k| k.starts_with(prefix));
        Ok(keys)
    }

    fn exists(&self, key: &str) -> Result<bool> {
        let path = self.resolve(key)?;
        match fs::metadata(&path) {
            Ok(meta) => Ok(meta.is_file()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}
