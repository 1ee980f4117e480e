use std::io::Read;

use nimbus_types::error::{NimbusError, Result};

use crate::retry::HttpRetryError;
use crate::{RetryConfig, StorageBackend, TimeoutConfig};

/// Backend for OpenStack Swift object storage.
///
/// `endpoint` is the account storage URL obtained from authentication
/// (e.g. `https://host/v1/AUTH_tenant`); the token is supplied pre-acquired
/// by the credential layer.
pub struct SwiftBackend {
    endpoint: String,
    container: String,
    agent: ureq::Agent,
    token: String,
    retry: RetryConfig,
    root: String,
}

impl SwiftBackend {
    pub fn new(
        endpoint: &str,
        container: &str,
        root: &str,
        token: &str,
        timeouts: TimeoutConfig,
        retry: RetryConfig,
    ) -> Result<Self> {
        if container.is_empty() {
            return Err(NimbusError::Config(
                "swift:// URL is missing a container".into(),
            ));
        }
        let agent = timeouts.agent();
        Ok(Self {
            endpoint: endpoint.trim_end_matches('/').to_string(),
            container: container.to_string(),
            agent,
            token: token.to_string(),
            retry,
            root: root.trim_matches('/').to_string(),
        })
    }

    fn full_key(&self, key: &str) -> String {
        if self.root.is_empty() {
            key.to_string()
        } else {
            format!("{}/{}", self.root, key)
        }
    }

    fn object_url(&self, key: &str) -> String {
        format!("{}/{}/{}", self.endpoint, self.container, self.full_key(key))
    }

    fn auth(&self, req: ureq::Request) -> ureq::Request {
        req.set("X-Auth-Token", &self.token)
    }

    #[allow(clippy::result_large_err)]
    fn retry_call<T>(
        &self,
        op_name: &str,
        f: impl Fn() -> std::result::Result<T, ureq::Error>,
    ) -> std::result::Result<T, ureq::Error> {
        crate::retry::retry_http(&self.retry, op_name, "Swift", f)
    }

    fn retry_call_body<T>(
        &self,
        op_name: &str,
        f: impl Fn() -> std::result::Result<T, HttpRetryError>,
    ) -> std::result::Result<T, HttpRetryError> {
        crate::retry::retry_http_body(&self.retry, op_name, "Swift", f)
    }
}

impl StorageBackend for SwiftBackend {
    fn put(&self, key: &str, data: &[u8]) -> Result<()> {
        let url = self.object_url(key);
        self.retry_call(&format!("PUT {key}"), || {
            self.auth(self.agent.put(&url)).send_bytes(data)
        })
        .map_err(|e| NimbusError::Backend(format!("Swift PUT {key}: {e}")))?;
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let url = self.object_url(key);
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
        .map_err(|e| NimbusError::Backend(format!("Swift GET {key}: {e}")))
    }

    fn delete(&self, key: &str) -> Result<()> {
        let url = self.object_url(key);
        match self.retry_call(&format!("DELETE {key}"), || {
            self.auth(self.agent.delete(&url)).call()
        }) {
            Ok(_) => Ok(()),
            Err(ureq::Error::Status(404, _)) => Ok(()),
            Err(e) => Err(NimbusError::Backend(format!("Swift DELETE {key}: {e}"))),
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
        let mut marker: Option<String> = None;

        // Plain-text container listing, paged via the `marker` parameter:
        // each page lists names strictly after the marker; an empty page
        // ends the sequence.
        loop {
            let mut url = format!(
                "{}/{}?prefix={}",
                self.endpoint,
                self.container,
                urlencode(&full_prefix)
            );
            if let Some(ref m) = marker {
                url.push_str("&marker=");
                url.push_str(&urlencode(m));
            }

            let body = self
                .retry_call_body(&format!("LIST {prefix}"), || {
                    match self.auth(self.agent.get(&url)).call() {
                        Ok(resp) => {
                            let mut buf = String::new();
                            resp.into_reader()
                                .read_to_string(&mut buf)
                                .map_err(HttpRetryError::BodyIo)?;
                            Ok(buf)
                        }
                        // An empty container may report 204.
                        Err(ureq::Error::Status(404, _)) => Ok(String::new()),
                        Err(e) => Err(HttpRetryError::http(e)),
                    }
                })
                .map_err(|e| NimbusError::Backend(format!("Swift LIST {prefix}: {e}")))?;

            let page: Vec<&str> = body.lines().filter(|l| !l.is_empty()).collect();
            if page.is_empty() {
                break;
            }
            marker = Some(page[page.len() - 1].to_string());
            for name in page {
                if root_prefix_len > 0 && name.len() > root_prefix_len {
                    keys.push(name[root_prefix_len..].to_string());
                } else {
                    keys.push(name.to_string());
                }
            }
        }

        Ok(keys)
    }

    fn exists(&self, key: &str) -> Result<bool> {
        let url = self.object_url(key);
        match self.retry_call(&format!("HEAD {key}"), || {
            self.auth(self.agent.head(&url)).call()
        }) {
            Ok(_) => Ok(true),
            Err(ureq::Error::Status(404, _)) => Ok(false),
            Err(e) => Err(NimbusError::Backend(format!("Swift HEAD {key}: {e}"))),
        }
    }
}

fn urlencode(s: &str) -> String {
    url::form_urlencoded::byte_serialize(s.as_bytes()).collect()
}
