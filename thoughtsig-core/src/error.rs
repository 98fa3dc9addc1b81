//! # Error Handling
//!
//! Error types for the signature cache.
//!
//! ## Taxonomy
//!
//! 1. **Lookup**: `NotFound` means the key is absent or carries no signature
//! 2. **On-disk corruption**: `CorruptIndex` (bad header) and `CorruptRecord`
//!    (data file length prefix disagrees with the index entry)
//! 3. **Write validation**: `InvalidRecordId`, `PayloadTooLarge`
//! 4. **System**: `Io` carries the underlying `std::io::Error` unchanged

use std::path::PathBuf;

use thiserror::Error;

/// Result type alias for signature cache operations
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("record not found: {key}")]
    NotFound { key: String },

    #[error("corrupt index file {path:?}: {details}")]
    CorruptIndex { path: PathBuf, details: String },

    #[error("corrupt record {record_id}: index says {expected} bytes, data file says {actual}")]
    CorruptRecord {
        record_id: String,
        expected: u32,
        actual: u32,
    },

    #[error("invalid record id: {reason}")]
    InvalidRecordId { reason: String },

    #[error("payload of {len} bytes does not fit the 32-bit length field")]
    PayloadTooLarge { len: usize },

    #[error("serialization error: {message}")]
    Serialization {
        message: String,
        source: Option<serde_json::Error>,
    },

    #[error("IO error: {message}")]
    Io {
        message: String,
        source: std::io::Error,
    },

    #[error("{component} is closed")]
    Closed { component: &'static str },

    #[error("configuration error: {message}")]
    Configuration { message: String },

    #[error("internal error: {message}")]
    Internal { message: String },
}

impl Error {
    pub fn not_found(key: impl Into<String>) -> Self {
        Error::NotFound { key: key.into() }
    }

    pub fn io(message: impl Into<String>, source: std::io::Error) -> Self {
        Error::Io {
            message: message.into(),
            source,
        }
    }

    /// Check if error is recoverable
    ///
    /// Corruption never heals by retrying; a closed component stays closed.
    pub fn is_recoverable(&self) -> bool {
        match self {
            Error::CorruptIndex { .. } => false,
            Error::CorruptRecord { .. } => false,
            Error::Closed { .. } => false,
            Error::Configuration { .. } => false,
            _ => true,
        }
    }

    /// Get error code for monitoring
    pub fn error_code(&self) -> &'static str {
        match self {
            Error::NotFound { .. } => "NOT_FOUND",
            Error::CorruptIndex { .. } => "CORRUPT_INDEX",
            Error::CorruptRecord { .. } => "CORRUPT_RECORD",
            Error::InvalidRecordId { .. } => "INVALID_RECORD_ID",
            Error::PayloadTooLarge { .. } => "PAYLOAD_TOO_LARGE",
            Error::Serialization { .. } => "SERIALIZATION_ERROR",
            Error::Io { .. } => "IO_ERROR",
            Error::Closed { .. } => "CLOSED",
            Error::Configuration { .. } => "CONFIG_ERROR",
            Error::Internal { .. } => "INTERNAL_ERROR",
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound { .. })
    }

    pub fn is_corruption(&self) -> bool {
        matches!(self, Error::CorruptIndex { .. } | Error::CorruptRecord { .. })
    }
}

// Conversion from std::io::Error
impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io {
            message: err.to_string(),
            source: err,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization {
            message: err.to_string(),
            source: Some(err),
        }
    }
}
