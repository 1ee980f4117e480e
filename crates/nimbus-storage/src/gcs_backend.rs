use std::io::Read;

use nimbus_types::error::{NimbusError, Result};

use crate::retry::HttpRetryError;
use crate::{RetryConfig, StorageBackend, TimeoutConfig};

const API_BASE: &str = "https://storage.googleapis.com";

/// Backend for Google Cloud Storage via the JSON API with a pre-acquired
/// OAuth2 bearer token. Token acquisition and refresh belong to the
/// credential layer, not here.
pub struct GcsBackend {
    bucket: String,
    agent: ureq::Agent,
    token: String,
    retry: RetryConfig,
    root: String,
    /// Overridable for tests against a fake server.
    api_base: String,
}

impl GcsBackend {
    pub fn new(
        bucket: &str,
        root: &str,
        token: &str,
        timeouts: TimeoutConfig,
        retry: RetryConfig,
    ) -> Result<Self> {
        if bucket.is_empty() {
            return Err(NimbusError::Config("gs:// URL is missing a bucket".into()));
        }
        let agent = timeouts.agent();
        Ok(Self {
            bucket: bucket.to_string(),
            agent,
            token: token.to_string(),
            retry,
            root: root.trim_matches('/').to_string(),
            api_base: API_BASE.to_string(),
        })
    }

    #[cfg(test)]
    fn with_api_base(mut self, base: &str) -> Self {
        self.api_base = base.trim_end_matches('/').to_string();
        self
    }

    fn full_key(&self, key: &str) -> String {
        if self.root.is_empty() {
            key.to_string()
        } else {
            format!("{}/{}", self.root, key)
        }
    }

    /// Percent-encode an object name for use as a single path segment.
    fn encode_name(name: &str) -> String {
        url::form_urlencoded::byte_serialize(name.as_bytes()).collect()
    }

    fn object_url(&self, key: &str) -> String {
        format!(
            "{}/storage/v1/b/{}/o/{}",
            self.api_base,
            self.bucket,
            Self::encode_name(&self.full_key(key))
        )
    }

    fn auth(&self, req: ureq::Request) -> ureq::Request {
        req.set("Authorization", &format!("Bearer {}", self.token))
    }

    #[allow(clippy::result_large_err)]
    fn retry_call<T>(
        &self,
        op_name: &str,
        f: impl Fn() -> std::result::Result<T, ureq::Error>,
    ) -> std::result::Result<T, ureq::Error> {
        crate::retry::retry_http(&self.retry, op_name, "GCS", f)
    }

    fn retry_call_body<T>(
        &self,
        op_name: &str,
        f: impl Fn() -> std::result::Result<T, HttpRetryError>,
    ) -> std::result::Result<T, HttpRetryError> {
        crate::retry::retry_http_body(&self.retry, op_name, "GCS", f)
    }
}

impl StorageBackend for GcsBackend {
    fn put(&self, key: &str, data: &[u8]) -> Result<()> {
        let url = format!(
            "{}/upload/storage/v1/b/{}/o?uploadType=media&name={}",
            self.api_base,
            self.bucket,
            Self::encode_name(&self.full_key(key))
        );
        self.retry_call(&format!("PUT {key}"), || {
            self.auth(self.agent.post(&url))
                .set("Content-Type", "application/octet-stream")
                .send_bytes(data)
        })
        .map_err(|e| NimbusError::Backend(format!("GCS PUT {key}: {e}")))?;
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let url = format!("{}?alt=media", self.object_url(key));
        self.retry_call_body(&format!("GET {key}"), || {
            match self.auth(self.agent.get(&url)).call() {
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
        .map_err(|e| NimbusError::Backend(format!("GCS GET {key}: {e}")))
    }

    fn delete(&self, key: &str) -> Result<()> {
        let url = self.object_url(key);
        match self.retry_call(&format!("DELETE {key}"), || {
            self.auth(self.agent.delete(&url)).call()
        }) {
            Ok(_) => Ok(()),
            // Deleting a missing object is not an error.
            Err(ureq::Error::Status(404, _)) => Ok(()),
            Err(e) => Err(NimbusError::Backend(format!("GCS DELETE {key}: {e}"))),
        }
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let full_prefix = self.full_key(prefix);
        let root_prefix_len = if self.root.is_empty() {
            0
        } else {
            self.root.len() + 1
        };

        let mut keys = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let mut url = format!(
                "{}/storage/v1/b/{}/o?prefix={}&fields=items(name),nextPageToken",
                self.api_base,
                self.bucket,
                Self::encode_name(&full_prefix)
            );
            if let Some(ref token) = page_token {
                url.push_str("&pageToken=");
                url.push_str(&Self::encode_name(token));
            }

            let body: serde_json::Value = self
                .retry_call_body(&format!("LIST {prefix}"), || {
                    let resp = self
                        .auth(self.agent.get(&url))
                        .call()
                        .map_err(HttpRetryError::http)?;
                    let mut raw = String::new();
                    resp.into_reader()
                        .read_to_string(&mut raw)
                        .map_err(HttpRetryError::BodyIo)?;
                    serde_json::from_str(&raw).map_err(|e| {
                        HttpRetryError::Permanent(format!("LIST {prefix}: bad JSON: {e}"))
                    })
                })
                .map_err(|e| NimbusError::Backend(format!("GCS LIST {prefix}: {e}")))?;

            if let Some(items) = body.get("items").and_then(|v| v.as_array()) {
                for item in items {
                    if let Some(name) = item.get("name").and_then(|v| v.as_str()) {
                        if root_prefix_len > 0 && name.len() > root_prefix_len {
                            keys.push(name[root_prefix_len..].to_string());
                        } else {
                            keys.push(name.to_string());
                        }
                    }
                }
            }

            match body.get("nextPageToken").and_then(|v| v.as_str()) {
                Some(token) => page_token = Some(token.to_string()),
                None => break,
            }
        }

        Ok(keys)
    }

    fn exists(&self, key: &str) -> Result<bool> {
        // Metadata GET (no alt=media) is the cheapest existence probe.
        let url = self.object_url(key);
        match self.retry_call(&format!("STAT {key}"), || {
            self.auth(self.agent.get(&url)).call()
        }) {
            Ok(_) => Ok(true),
            Err(ureq::Error::Status(404, _)) => Ok(false),
            Err(e) => Err(NimbusError::Backend(format!("GCS STAT {key}: {e}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn object_names_are_percent_encoded() {
        assert_eq!(GcsBackend::encode_name("blocks/ab/cd"), "blocks%2Fab%2Fcd");
    }

    #[test]
    fn object_url_includes_root_prefix() {
        let backend = GcsBackend::new(
            "bkt",
            "fs1",
            "tok",
            TimeoutConfig::default(),
            RetryConfig::default(),
        )
        .unwrap()
        .with_api_base("http://127.0.0.1:1");
        assert_eq!(
            backend.object_url("meta/objects"),
            "http://127.0.0.1:1/storage/v1/b/bkt/o/fs1%2Fmeta%2Fobjects"
        );
    }

    #[test]
    fn empty_bucket_rejected() {
        assert!(GcsBackend::new(
            "",
            "",
            "tok",
            TimeoutConfig::default(),
            RetryConfig::default()
        )
        .is_err());
    }
}
