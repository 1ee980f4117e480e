use std::io::Read;
use std::time::Duration;

use rusty_s3::actions::{ListObjectsV2, S3Action};
use rusty_s3::{Bucket, Credentials, UrlStyle};

use nimbus_types::error::{NimbusError, Result};

use crate::retry::HttpRetryError;
use crate::{RetryConfig, StorageBackend, TimeoutConfig};

/// Duration for presigned URL validity.
const PRESIGN_DURATION: Duration = Duration::from_secs(3600);

/// How keys are mapped to request URLs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressingStyle {
    /// `https://bucket.endpoint/key`, as AWS proper uses.
    VirtualHost,
    /// `https://endpoint/bucket/key`, for MinIO, Ceph RGW and most other
    /// S3-compatible services.
    Path,
}

/// Backend for AWS S3 and any S3-compatible object store, using presigned
/// requests over a plain HTTP agent.
pub struct S3Backend {
    bucket: Bucket,
    credentials: Credentials,
    agent: ureq::Agent,
    retry: RetryConfig,
    /// Prefix (root path) prepended to all keys.
    root: String,
    label: &'static str,
}

impl S3Backend {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        bucket_name: &str,
        region: &str,
        root: &str,
        endpoint: &str,
        style: AddressingStyle,
        access_key_id: &str,
        secret_access_key: &str,
        timeouts: TimeoutConfig,
        retry: RetryConfig,
    ) -> Result<Self> {
        let base_url = endpoint.parse().map_err(|e| {
            NimbusError::Config(format!("invalid S3 endpoint URL '{endpoint}': {e}"))
        })?;

        let url_style = match style {
            AddressingStyle::VirtualHost => UrlStyle::VirtualHost,
            AddressingStyle::Path => UrlStyle::Path,
        };

        let bucket = Bucket::new(
            base_url,
            url_style,
            bucket_name.to_string(),
            region.to_string(),
        )
        .map_err(|e| NimbusError::Config(format!("failed to create S3 bucket handle: {e}")))?;

        let credentials = Credentials::new(access_key_id, secret_access_key);

        let agent = timeouts.agent();

        let root = root.trim_matches('/').to_string();
        let label = match style {
            AddressingStyle::VirtualHost => "S3",
            AddressingStyle::Path => "S3C",
        };

        Ok(Self {
            bucket,
            credentials,
            agent,
            retry,
            root,
            label,
        })
    }

    /// Prepend the root prefix to a key.
    fn full_key(&self, key: &str) -> String {
        if self.root.is_empty() {
            key.to_string()
        } else {
            format!("{}/{}", self.root, key)
        }
    }

    #[allow(clippy::result_large_err)]
    fn retry_call<T>(
        &self,
        op_name: &str,
        f: impl Fn() -> std::result::Result<T, ureq::Error>,
    ) -> std::result::Result<T, ureq::Error> {
        crate::retry::retry_http(&self.retry, op_name, self.label, f)
    }

    fn retry_call_body<T>(
        &self,
        op_name: &str,
        f: impl Fn() -> std::result::Result<T, HttpRetryError>,
    ) -> std::result::Result<T, HttpRetryError> {
        crate::retry::retry_http_body(&self.retry, op_name, self.label, f)
    }
}

impl StorageBackend for S3Backend {
    fn put(&self, key: &str, data: &[u8]) -> Result<()> {
        let full_key = self.full_key(key);
        let url = self
            .bucket
            .put_object(Some(&self.credentials), &full_key)
            .sign(PRESIGN_DURATION);

        self.retry_call(&format!("PUT {key}"), || {
            self.agent.put(url.as_str()).send_bytes(data)
        })
        .map_err(|e| NimbusError::Backend(format!("{} PUT {key}: {e}", self.label)))?;
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let full_key = self.full_key(key);
        let url = self
            .bucket
            .get_object(Some(&self.credentials), &full_key)
            .sign(PRESIGN_DURATION);

        self.retry_call_body(&format!("GET {key}"), || {
            match self.agent.get(url.as_str()).call() {
                Ok(resp) => {
                    let mut buf = Vec::new();
                    resp.into_reader()
                        .read_to_end(&mut buf)
                        .map_err(HttpRetryError::BodyIo)?;
                    Ok(Some(buf))
                }
                Err(ureq::Error::Status(404, _)) => Ok(None),
                Err(e) => Err(HttpRetryError::http(e)),
            }
        })
        .map_err(|e| NimbusError::Backend(format!("{} GET {key}: {e}", self.label)))
    }

    fn delete(&self, key: &str) -> Result<()> {
        let full_key = self.full_key(key);
        let url = self
            .bucket
            .delete_object(Some(&self.credentials), &full_key)
            .sign(PRESIGN_DURATION);

        // S3 DELETE returns 204 even for missing keys, so idempotency is
        // native here.
        self.retry_call(&format!("DELETE {key}"), || {
            self.agent.delete(url.as_str()).call()
        })
        .map_err(|e| NimbusError::Backend(format!("{} DELETE {key}: {e}", self.label)))?;
        Ok(())
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let full_prefix = self.full_key(prefix);
        let root_prefix_len = if self.root.is_empty() {
            0
        } else {
            self.root.len() + 1 // +1 for the '/'
        };

        let mut keys = Vec::new();
        let mut continuation_token: Option<String> = None;

        loop {
            let mut action = self.bucket.list_objects_v2(Some(&self.credentials));
            action.query_mut().insert("prefix", &full_prefix);
            if let Some(ref token) = continuation_token {
                action.query_mut().insert("continuation-token", token);
            }
            let url = action.sign(PRESIGN_DURATION);

            let parsed = self
                .retry_call_body(&format!("LIST {prefix}"), || {
                    let resp = self
                        .agent
                        .get(url.as_str())
                        .call()
                        .map_err(HttpRetryError::http)?;
                    let mut body = Vec::new();
                    resp.into_reader()
                        .read_to_end(&mut body)
                        .map_err(HttpRetryError::BodyIo)?;
                    let body = std::str::from_utf8(&body).map_err(|e| {
                        HttpRetryError::Permanent(format!(
                            "LIST {prefix}: response is not UTF-8: {e}"
                        ))
                    })?;
                    ListObjectsV2::parse_response(body).map_err(|e| {
                        HttpRetryError::Permanent(format!(
                            "LIST {prefix}: failed to parse response: {e}"
                        ))
                    })
                })
                .map_err(|e| NimbusError::Backend(format!("{} LIST {prefix}: {e}", self.label)))?;

            for obj in &parsed.contents {
                let key = &obj.key;
                // Skip directory markers.
                if key.ends_with('/') {
                    continue;
                }
                // Strip root prefix to return relative keys.
                if root_prefix_len > 0 && key.len() > root_prefix_len {
                    keys.push(key[root_prefix_len..].to_string());
                } else {
                    keys.push(key.clone());
                }
            }

            match parsed.next_continuation_token {
                Some(token) => continuation_token = Some(token),
                None => break,
            }
        }

        Ok(keys)
    }

    fn exists(&self, key: &str) -> Result<bool> {
        let full_key = self.full_key(key);
        let url = self
            .bucket
            .head_object(Some(&self.credentials), &full_key)
            .sign(PRESIGN_DURATION);

        match self.retry_call(&format!("HEAD {key}"), || {
            self.agent.head(url.as_str()).call()
        }) {
            Ok(_) => Ok(true),
            Err(ureq::Error::Status(404, _)) => Ok(false),
            Err(e) => Err(NimbusError::Backend(format!(
                "{} HEAD {key}: {e}",
                self.label
            ))),
        }
    }
}
