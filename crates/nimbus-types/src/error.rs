use thiserror::Error;

pub type Result<T> = std::result::Result<T, NimbusError>;

#[derive(Debug, Error)]
pub enum NimbusError {
    /// Permanent backend failure, or a transient one whose retries were
    /// exhausted. Surfaces to the file-operation layer as an I/O failure
    /// on the corresponding block.
    #[error("backend error: {0}")]
    Backend(String),

    /// Downloaded bytes failed hash or decompression verification. Fatal
    /// for the affected fetch; never silently substituted.
    #[error("corrupted object '{object}': {detail}")]
    Corruption { object: String, detail: String },

    #[error("decryption failed: wrong passphrase or corrupted data")]
    DecryptionFailed,

    #[error("key derivation error: {0}")]
    KeyDerivation(String),

    #[error("decompression error: {0}")]
    Decompression(String),

    #[error("unknown compression tag: {0}")]
    UnknownCompressionTag(u8),

    #[error("unknown object format tag: {0}")]
    UnknownFormatTag(u8),

    /// Write attempt on a block under an immutable flag. Returned to the
    /// caller; not fatal to the mount.
    #[error("file {0} is immutable")]
    Immutable(u64),

    /// Bookkeeping invariant broken (e.g. refcount decremented below
    /// zero). The mount must abort and require an offline check.
    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("unsupported backend: '{0}'")]
    UnsupportedBackend(String),

    #[error("invalid format: {0}")]
    InvalidFormat(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] rmp_serde::encode::Error),

    #[error("deserialization error: {0}")]
    Deserialization(#[from] rmp_serde::decode::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl NimbusError {
    /// Whether this error must terminate the mount rather than surface as
    /// a per-operation failure.
    pub fn is_fatal(&self) -> bool {
        matches!(self, NimbusError::InvariantViolation(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invariant_violation_is_fatal() {
        assert!(NimbusError::InvariantViolation("refcount below zero".into()).is_fatal());
    }

    #[test]
    fn operational_errors_are_not_fatal() {
        assert!(!NimbusError::Backend("timeout".into()).is_fatal());
        assert!(!NimbusError::Immutable(3).is_fatal());
        assert!(!NimbusError::Corruption {
            object: "abc".into(),
            detail: "hash mismatch".into()
        }
        .is_fatal());
    }

    #[test]
    fn io_errors_convert() {
        let err: NimbusError = std::io::Error::new(std::io::ErrorKind::NotFound, "gone").into();
        assert!(matches!(err, NimbusError::Io(_)));
    }
}
