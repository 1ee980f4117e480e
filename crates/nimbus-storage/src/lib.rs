pub mod gcs_backend;
pub mod local_backend;
pub mod retry;
pub mod s3_backend;
pub mod swift_backend;

use serde::{Deserialize, Serialize};

use nimbus_types::error::{NimbusError, Result};

pub use gcs_backend::GcsBackend;
pub use local_backend::LocalBackend;
pub use s3_backend::S3Backend;
pub use swift_backend::SwiftBackend;

/// Uniform contract over remote object stores.
///
/// All methods are synchronous and retried internally on transient failures
/// (timeouts, 5xx, connection resets) per the backend's [`RetryConfig`].
/// Errors that reach the caller are permanent for that call.
pub trait StorageBackend: Send + Sync {
    /// Store `data` under `key`, replacing any existing object.
    fn put(&self, key: &str, data: &[u8]) -> Result<()>;

    /// Fetch the object at `key`. Returns `None` if it does not exist.
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Delete the object at `key`. Deleting a missing key is not an error.
    fn delete(&self, key: &str) -> Result<()>;

    /// List all keys under `prefix`. The sequence is finite; backends page
    /// through markers/continuation tokens internally.
    fn list(&self, prefix: &str) -> Result<Vec<String>>;

    /// Whether an object exists at `key`.
    fn exists(&self, key: &str) -> Result<bool>;
}

/// Retry policy for transient backend failures.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    #[serde(default = "default_retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            retry_delay_ms: default_retry_delay_ms(),
            retry_max_delay_ms: default_retry_max_delay_ms(),
        }
    }
}

fn default_max_retries() -> u32 {
    5
}

fn default_retry_delay_ms() -> u64 {
    500
}

fn default_retry_max_delay_ms() -> u64 {
    30_000
}

/// HTTP timeouts applied to every request an HTTP backend makes.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TimeoutConfig {
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_secs: u64,
    /// Read and write timeout for a single request.
    #[serde(default = "default_io_timeout_secs")]
    pub io_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            connect_secs: default_connect_timeout_secs(),
            io_secs: default_io_timeout_secs(),
        }
    }
}

impl TimeoutConfig {
    pub(crate) fn agent(&self) -> ureq::Agent {
        ureq::AgentBuilder::new()
            .timeout_connect(std::time::Duration::from_secs(self.connect_secs))
            .timeout_read(std::time::Duration::from_secs(self.io_secs))
            .timeout_write(std::time::Duration::from_secs(self.io_secs))
            .build()
    }
}

fn default_connect_timeout_secs() -> u64 {
    30
}

fn default_io_timeout_secs() -> u64 {
    300
}

/// Connection parameters for backend construction. Credentials arrive
/// pre-parsed from the authentication layer; this crate never reads
/// credential files itself.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Storage URL selecting the backend variant and its addressing, e.g.
    /// `s3://eu-central-1/bucket/prefix` or `local:///var/cache/nimbus`.
    pub url: String,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    /// Bearer / auth token for gs:// and swift:// backends.
    pub access_token: Option<String>,
    #[serde(default)]
    pub allow_insecure_http: bool,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub timeouts: TimeoutConfig,
}

/// Parsed form of a storage URL: `scheme://authority/bucket/prefix`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedUrl {
    pub scheme: String,
    pub authority: String,
    pub bucket: String,
    pub prefix: String,
}

/// Split a storage URL into scheme, authority, bucket and key prefix.
///
/// A URL without a scheme is treated as a local path.
pub fn parse_storage_url(url: &str) -> Result<ParsedUrl> {
    let Some((scheme, rest)) = url.split_once("://") else {
        return Ok(ParsedUrl {
            scheme: "local".into(),
            authority: String::new(),
            bucket: url.to_string(),
            prefix: String::new(),
        });
    };
    if scheme == "local" {
        return Ok(ParsedUrl {
            scheme: scheme.into(),
            authority: String::new(),
            bucket: rest.to_string(),
            prefix: String::new(),
        });
    }
    let mut parts = rest.splitn(3, '/');
    let authority = parts.next().unwrap_or_default().to_string();
    let bucket = parts.next().unwrap_or_default().to_string();
    let prefix = parts.next().unwrap_or_default().trim_matches('/').to_string();
    if authority.is_empty() {
        return Err(NimbusError::Config(format!(
            "storage URL '{url}' is missing an authority component"
        )));
    }
    // gs:// has no authority segment before the bucket.
    if scheme == "gs" {
        return Ok(ParsedUrl {
            scheme: scheme.into(),
            authority: String::new(),
            bucket: authority,
            prefix: if bucket.is_empty() {
                prefix
            } else if prefix.is_empty() {
                bucket
            } else {
                format!("{bucket}/{prefix}")
            },
        });
    }
    if bucket.is_empty() {
        return Err(NimbusError::Config(format!(
            "storage URL '{url}' is missing a bucket/container component"
        )));
    }
    Ok(ParsedUrl {
        scheme: scheme.into(),
        authority,
        bucket,
        prefix,
    })
}

fn require_credentials(cfg: &StorageConfig) -> Result<(&str, &str)> {
    match (&cfg.access_key_id, &cfg.secret_access_key) {
        (Some(id), Some(secret)) => Ok((id, secret)),
        _ => Err(NimbusError::Config(format!(
            "backend '{}' requires access_key_id and secret_access_key",
            cfg.url
        ))),
    }
}

fn require_token(cfg: &StorageConfig) -> Result<&str> {
    cfg.access_token.as_deref().ok_or_else(|| {
        NimbusError::Config(format!("backend '{}' requires an access token", cfg.url))
    })
}

/// Build a storage backend from the resolved configuration.
///
/// Scheme prefixes select the variant: `s3://region/bucket/prefix` (AWS),
/// `s3c://endpoint/bucket/prefix` (any S3-compatible service, path-style),
/// `gs://bucket/prefix`, `swift://host/container/prefix`,
/// `local://path` or a bare filesystem path.
pub fn backend_from_config(cfg: &StorageConfig) -> Result<Box<dyn StorageBackend>> {
    let parsed = parse_storage_url(&cfg.url)?;
    let http_scheme = if cfg.allow_insecure_http { "http" } else { "https" };
    match parsed.scheme.as_str() {
        "local" => Ok(Box::new(LocalBackend::new(&parsed.bucket)?)),
        "s3" => {
            let (id, secret) = require_credentials(cfg)?;
            let endpoint = format!("{http_scheme}://s3.{}.amazonaws.com", parsed.authority);
            Ok(Box::new(S3Backend::new(
                &parsed.bucket,
                &parsed.authority,
                &parsed.prefix,
                &endpoint,
                s3_backend::AddressingStyle::VirtualHost,
                id,
                secret,
                cfg.timeouts,
                cfg.retry.clone(),
            )?))
        }
        "s3c" => {
            let (id, secret) = require_credentials(cfg)?;
            let endpoint = format!("{http_scheme}://{}", parsed.authority);
            Ok(Box::new(S3Backend::new(
                &parsed.bucket,
                "us-east-1",
                &parsed.prefix,
                &endpoint,
                s3_backend::AddressingStyle::Path,
                id,
                secret,
                cfg.timeouts,
                cfg.retry.clone(),
            )?))
        }
        "gs" => {
            let token = require_token(cfg)?;
            Ok(Box::new(GcsBackend::new(
                &parsed.bucket,
                &parsed.prefix,
                token,
                cfg.timeouts,
                cfg.retry.clone(),
            )?))
        }
        "swift" => {
            let token = require_token(cfg)?;
            let endpoint = format!("{http_scheme}://{}", parsed.authority);
            Ok(Box::new(SwiftBackend::new(
                &endpoint,
                &parsed.bucket,
                &parsed.prefix,
                token,
                cfg.timeouts,
                cfg.retry.clone(),
            )?))
        }
        other => Err(NimbusError::UnsupportedBackend(other.to_string())),
    }
}
