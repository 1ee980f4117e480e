use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use nimbus_storage::StorageConfig;
use nimbus_types::error::{NimbusError, Result};

use crate::cache::CacheOptions;

/// Mount-time configuration consumed by the core. Produced by the external
/// option parser; defaults here match a plain `mount` with no flags.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MountConfig {
    pub storage: StorageConfig,
    /// Local directory holding spool files and the object-table log.
    pub cache_dir: String,
    #[serde(default = "default_cache_bytes")]
    pub cache_max_bytes: u64,
    #[serde(default = "default_cache_entries")]
    pub cache_max_entries: usize,
    #[serde(default = "default_upload_threads")]
    pub upload_threads: usize,
    #[serde(default = "default_removal_threads")]
    pub removal_threads: usize,
    #[serde(default)]
    pub compression: CompressionConfig,
    /// Seconds a dirty block may sit unwritten before the idle flusher
    /// uploads it. Also the scan period.
    #[serde(default = "default_idle_flush_secs")]
    pub idle_flush_secs: u64,
    #[serde(default)]
    pub encryption: EncryptionConfig,
}

impl MountConfig {
    /// Budgets and pool sizing for the block cache. Sealing (compress +
    /// encrypt) runs on the upload workers, so the pool is sized to satisfy
    /// both the upload-thread and compression-thread knobs.
    pub fn cache_options(&self) -> CacheOptions {
        CacheOptions {
            dir: PathBuf::from(&self.cache_dir),
            max_bytes: self.cache_max_bytes,
            max_entries: self.cache_max_entries,
            upload_threads: self.upload_threads.max(self.compression.threads),
            idle_flush: Duration::from_secs(self.idle_flush_secs),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompressionConfig {
    /// "zstd" (high ratio, slow), "deflate" (medium), "lz4" (fast), "none".
    #[serde(default = "default_algorithm")]
    pub algorithm: String,
    #[serde(default = "default_level")]
    pub level: i32,
    /// Worker threads available for compression. The seal stage shares the
    /// upload pool, so this widens it when larger than `upload_threads`
    /// (see [`MountConfig::cache_options`]).
    #[serde(default = "default_compress_threads")]
    pub threads: usize,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            algorithm: default_algorithm(),
            level: default_level(),
            threads: default_compress_threads(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncryptionConfig {
    /// "aes256gcm" or "none".
    #[serde(default = "default_encryption_mode")]
    pub mode: String,
    pub passphrase: Option<String>,
}

impl Default for EncryptionConfig {
    fn default() -> Self {
        Self {
            mode: default_encryption_mode(),
            passphrase: None,
        }
    }
}

fn default_cache_bytes() -> u64 {
    512 * 1024 * 1024 // 512 MiB
}

fn default_cache_entries() -> usize {
    768
}

fn default_upload_threads() -> usize {
    4
}

fn default_removal_threads() -> usize {
    2
}

fn default_compress_threads() -> usize {
    1
}

fn default_algorithm() -> String {
    "zstd".to_string()
}

fn default_level() -> i32 {
    6
}

fn default_idle_flush_secs() -> u64 {
    10
}

fn default_encryption_mode() -> String {
    "aes256gcm".to_string()
}

/// Load and parse a mount config file.
pub fn load_config(path: &Path) -> Result<MountConfig> {
    let contents = std::fs::read_to_string(path)
        .map_err(|e| NimbusError::Config(format!("cannot read '{}': {e}", path.display())))?;
    let config: MountConfig = serde_yaml::from_str(&contents)
        .map_err(|e| NimbusError::Config(format!("invalid config '{}': {e}", path.display())))?;
    Ok(config)
}
