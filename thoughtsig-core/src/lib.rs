//! # Thoughtsig Core
//!
//! Building blocks shared by the signature store and its tooling:
//! - Entry / EntryIndex types and record keys
//! - JSON payload codec (the on-disk record contract)
//! - Error types
//! - Configuration
//! - Metrics
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────┐
//! │                 thoughtsig-core                 │
//! ├─────────────────────────────────────────────────┤
//! │  • types    - Entry, EntryIndex, record keys   │
//! │  • codec    - JSON payload encode/decode       │
//! │  • error    - Error handling                   │
//! │  • config   - SignatureCacheConfig             │
//! │  • metrics  - Atomic cache counters            │
//! └─────────────────────────────────────────────────┘
//! ```

pub mod codec;
pub mod config;
pub mod error;
pub mod metrics;
pub mod types;

// Re-export commonly used types
pub use codec::{decode_entry, encode_entry};
pub use config::SignatureCacheConfig;
pub use error::{Error, Result};
pub use metrics::{CacheMetrics, MetricsSnapshot};
pub use types::{
    prefixes_consistent, record_key, signature_prefix, split_record_key, Entry, EntryIndex,
    Timestamp,
};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
