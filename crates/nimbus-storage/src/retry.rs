use std::fmt;
use std::time::Duration;

use crate::RetryConfig;

/// Unified error type for an HTTP request plus body read.
///
/// Keeps this module decoupled from `NimbusError`; each backend converts
/// to the application error type at its own boundary.
#[derive(Debug)]
pub enum HttpRetryError {
    /// HTTP-level error (retryable when transport, 429 or 5xx).
    Http(Box<ureq::Error>),
    /// Body read I/O error (retryable for connection reset, EOF, timeout).
    BodyIo(std::io::Error),
    /// Application-level failure; never retried.
    Permanent(String),
}

impl HttpRetryError {
    /// Wrap a `ureq::Error` (boxed to keep the enum small).
    pub fn http(e: ureq::Error) -> Self {
        HttpRetryError::Http(Box::new(e))
    }
}

impl fmt::Display for HttpRetryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HttpRetryError::Http(e) => write!(f, "{e}"),
            HttpRetryError::BodyIo(e) => write!(f, "body read error: {e}"),
            HttpRetryError::Permanent(msg) => write!(f, "{msg}"),
        }
    }
}

/// Whether an HTTP error is transient and worth retrying.
pub fn is_retryable_http(err: &ureq::Error) -> bool {
    match err {
        ureq::Error::Transport(_) => true,
        ureq::Error::Status(code, _) => *code == 429 || *code >= 500,
    }
}

/// Whether an I/O error is transient and worth retrying.
pub fn is_retryable_io(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::BrokenPipe
            | std::io::ErrorKind::UnexpectedEof
            | std::io::ErrorKind::TimedOut
            | std::io::ErrorKind::Interrupted
    )
}

fn is_retryable(err: &HttpRetryError) -> bool {
    match err {
        HttpRetryError::Http(e) => is_retryable_http(e.as_ref()),
        HttpRetryError::BodyIo(e) => is_retryable_io(e),
        HttpRetryError::Permanent(_) => false,
    }
}

/// Retry a closure on transient `ureq::Error`s with exponential backoff
/// plus jitter. Used by backends whose failure is visible at request time.
#[allow(clippy::result_large_err)]
pub fn retry_http<T>(
    config: &RetryConfig,
    op_name: &str,
    backend_label: &str,
    f: impl Fn() -> std::result::Result<T, ureq::Error>,
) -> std::result::Result<T, ureq::Error> {
    let mut delay_ms = config.retry_delay_ms;
    let mut last_err = None;

    for attempt in 0..=config.max_retries {
        if attempt > 0 {
            let jitter = rand::random::<u64>() % delay_ms.max(1);
            std::thread::sleep(Duration::from_millis(delay_ms + jitter));
            delay_ms = (delay_ms * 2).min(config.retry_max_delay_ms);
        }
        match f() {
            Ok(val) => return Ok(val),
            Err(e) if is_retryable_http(&e) && attempt < config.max_retries => {
                tracing::warn!(
                    "{backend_label} {op_name}: transient error (attempt {}/{}), retrying: {e}",
                    attempt + 1,
                    config.max_retries,
                );
                last_err = Some(e);
            }
            Err(e) => return Err(e),
        }
    }
    Err(last_err.unwrap())
}

/// Retry a closure that performs both an HTTP request and a body read.
///
/// Same backoff loop as [`retry_http`] but operates on [`HttpRetryError`]
/// so transient body-read I/O errors are retried as well.
pub fn retry_http_body<T>(
    config: &RetryConfig,
    op_name: &str,
    backend_label: &str,
    f: impl Fn() -> std::result::Result<T, HttpRetryError>,
) -> std::result::Result<T, HttpRetryError> {
    let mut delay_ms = config.retry_delay_ms;
    let mut last_err = None;

    for attempt in 0..=config.max_retries {
        if attempt > 0 {
            let jitter = rand::random::<u64>() % delay_ms.max(1);
            std::thread::sleep(Duration::from_millis(delay_ms + jitter));
            delay_ms = (delay_ms * 2).min(config.retry_max_delay_ms);
        }
        match f() {
            Ok(val) => return Ok(val),
            Err(e) if is_retryable(&e) && attempt < config.max_retries => {
                tracing::warn!(
                    "{backend_label} {op_name}: transient error (attempt {}/{}), retrying: {e}",
                    attempt + 1,
                    config.max_retries,
                );
                last_err = Some(e);
            }
            Err(e) => return Err(e),
        }
    }
    Err(last_err.unwrap())
}
