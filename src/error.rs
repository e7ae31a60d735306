//! Error types for Tapestry

use std::path::PathBuf;
use thiserror::Error;

/// Main error type for Tapestry operations
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("TOML parsing error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialization error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("Invalid configuration: {reason}")]
    Config { reason: String },

    #[error("Key not found in keystore: {fingerprint}")]
    KeyNotFound { fingerprint: String },

    #[error("File too large for a block: {} ({size} bytes, capacity {capacity})", path.display())]
    FileTooLarge {
        path: PathBuf,
        size: u64,
        capacity: u64,
    },

    #[error("Integrity mismatch for {id}: expected {expected}, got {actual}")]
    IntegrityMismatch {
        id: String,
        expected: String,
        actual: String,
    },

    #[error("Invalid signature on block {block}: {reason}")]
    SignatureInvalid { block: String, reason: String },

    #[error("Untrusted signer {fingerprint} on block {block}")]
    SignatureUntrusted { block: String, fingerprint: String },

    #[error("Decryption failed for block {block}: {status}")]
    DecryptFailure { block: String, status: String },

    #[error("Recovery index unreadable: {reason}")]
    RecoveryIndex { reason: String },

    #[error("No root configured for category: {category}")]
    CategoryUnmapped { category: String },

    #[error("Unsafe restore path {path}: {reason}")]
    UnsafePath { path: String, reason: String },

    #[error("Transport error: {reason}")]
    Transport { reason: String },

    #[error("Crypto provider error: {reason}")]
    Crypto { reason: String },

    #[error("Archive error: {reason}")]
    Archive { reason: String },

    #[error("Worker pool error: {reason}")]
    WorkerPool { reason: String },

    #[error("Operation cancelled by operator")]
    Cancelled,
}

impl Error {
    /// Whether this error aborts the whole run rather than one file or block.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::Config { .. } | Error::KeyNotFound { .. } | Error::RecoveryIndex { .. }
        )
    }

    pub(crate) fn config(reason: impl Into<String>) -> Self {
        Error::Config {
            reason: reason.into(),
        }
    }

    pub(crate) fn archive(reason: impl Into<String>) -> Self {
        Error::Archive {
            reason: reason.into(),
        }
    }

    pub(crate) fn crypto(reason: impl Into<String>) -> Self {
        Error::Crypto {
            reason: reason.into(),
        }
    }
}

/// Result type alias for Tapestry operations
pub type Result<T> = std::result::Result<T, Error>;
