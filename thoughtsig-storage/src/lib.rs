//! # Thoughtsig Storage
//!
//! Day-partitioned persistence for reasoning signatures, tuned for "write
//! once, read a few times shortly after" traffic.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Write Path                             │
//! │                                                             │
//! │  save ──> Hot map + LRU index ──> Queue ──> Flush task      │
//! │                                               │             │
//! │                                               ▼             │
//! │                                  Writer (today .dat/.idx)   │
//! └─────────────────────────────────────────────────────────────┘
//!
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Read Path                              │
//! │                                                             │
//! │  lookup ──> LRU index ──> Hot map | Writer | Reader pool    │
//! │                              │        │          │          │
//! │                              ▼        ▼          ▼          │
//! │                           unflushed  today    past days     │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! On startup only the index files of the last few days are read; record
//! payloads are fetched lazily on first lookup.

pub mod format;
pub mod index_cache;
pub mod manager;
pub mod platform;
pub mod pool;
pub mod reader;
pub mod store;
pub mod writer;

pub use format::{list_days, ByteOffset, EntryCount, IndexEntry, IndexScan, RecordLen};
pub use index_cache::IndexCache;
pub use manager::{CacheStats, Manager};
pub use pool::{PoolConfig, PoolStats, ReaderHandle, ReaderPool};
pub use reader::Reader;
pub use store::{local_today, DayClock, Store};
pub use writer::Writer;
