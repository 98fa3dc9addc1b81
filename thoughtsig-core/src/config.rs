//! # Configuration Management
//!
//! Settings for the signature cache. Everything has a working default; the
//! composition root usually only overrides `data_dir`.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::types::DEFAULT_SIGNATURE_PREFIX_LEN;

/// Name of the subdirectory under `data_dir` that holds the day files.
pub const SIGNATURES_SUBDIR: &str = "signatures";

/// Signature cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SignatureCacheConfig {
    pub data_dir: PathBuf,
    /// Max entries held by the LRU index
    pub lru_capacity: usize,
    /// Days of index files scanned at startup
    pub recovery_days: usize,
    /// Max day readers kept open at once
    pub max_open_readers: usize,
    /// Bounded write-behind queue
    pub queue_capacity: usize,
    /// Entries that trigger an early flush
    pub flush_batch_size: usize,
    #[serde(with = "duration_millis")]
    pub flush_interval: Duration,
    pub signature_prefix_len: usize,
    /// fsync both files after every flushed batch
    pub sync_on_flush: bool,
}

impl Default for SignatureCacheConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            lru_capacity: 50_000,
            recovery_days: 3,
            max_open_readers: 16,
            queue_capacity: 1024,
            flush_batch_size: 256,
            flush_interval: Duration::from_secs(1),
            signature_prefix_len: DEFAULT_SIGNATURE_PREFIX_LEN,
            sync_on_flush: true,
        }
    }
}

impl SignatureCacheConfig {
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Default::default()
        }
    }

    /// Directory holding `<date>.dat` / `<date>.idx` pairs
    pub fn signatures_dir(&self) -> PathBuf {
        self.data_dir.join(SIGNATURES_SUBDIR)
    }

    pub fn validate(&self) -> Result<()> {
        let checks: [(&str, bool); 6] = [
            ("lru_capacity", self.lru_capacity > 0),
            ("max_open_readers", self.max_open_readers > 0),
            ("queue_capacity", self.queue_capacity > 0),
            ("flush_batch_size", self.flush_batch_size > 0),
            ("flush_interval", !self.flush_interval.is_zero()),
            ("signature_prefix_len", self.signature_prefix_len > 0),
        ];
        for (name, ok) in checks {
            if !ok {
                return Err(Error::Configuration {
                    message: format!("{name} must be greater than zero"),
                });
            }
        }
        Ok(())
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}
