//! # Signature Cache Manager
//!
//! Public entry point. Owns the LRU index, the store and the metrics, and turns
//! every read-side failure into a miss: a signature cache that cannot answer
//! simply makes the caller fall back to sending no signature.
//!
//! ```text
//!   save ──► hot map + index ──► queue ──► (flush task) ──► day files
//!
//!   lookup ──► index ──► EntryIndex ──► store.load_by_index ──► Entry
//!                 │ miss
//!                 └──► hot map by tool call id (lookup_by_tool_call_id only)
//! ```

use std::sync::Arc;

use chrono::NaiveDate;
use serde::Serialize;
use tracing::{debug, info, warn};

use thoughtsig_core::{
    error::{Error, Result},
    prefixes_consistent, record_key, CacheMetrics, Entry, EntryIndex,
    MetricsSnapshot, SignatureCacheConfig,
};

use crate::format::validate_record_id;
use crate::index_cache::IndexCache;
use crate::pool::PoolStats;
use crate::store::{DayClock, Store};

/// Point-in-time view of the cache.
#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub metrics: MetricsSnapshot,
    pub indexed: usize,
    pub index_capacity: usize,
    pub hot: usize,
    pub open_readers: usize,
    pub reader_hits: u64,
    pub reader_misses: u64,
    pub reader_evictions: u64,
    pub writer_date: Option<NaiveDate>,
}

pub struct Manager {
    config: SignatureCacheConfig,
    index: Arc<IndexCache>,
    store: Store,
    metrics: CacheMetrics,
}

impl Manager {
    /// Open the store under `<data_dir>/signatures` and rebuild the index
    /// from the last `recovery_days` days.
    pub async fn open(config: SignatureCacheConfig) -> Result<Self> {
        let index = Arc::new(IndexCache::new(config.lru_capacity));
        let metrics = CacheMetrics::new();
        let store = Store::open(config.clone(), Arc::clone(&index), metrics.clone()).await?;
        Self::finish_open(config, index, store, metrics)
    }

    pub async fn open_with_clock(config: SignatureCacheConfig, clock: DayClock) -> Result<Self> {
        let index = Arc::new(IndexCache::new(config.lru_capacity));
        let metrics = CacheMetrics::new();
        let store =
            Store::open_with_clock(config.clone(), Arc::clone(&index), metrics.clone(), clock)
                .await?;
        Self::finish_open(config, index, store, metrics)
    }

    fn finish_open(
        config: SignatureCacheConfig,
        index: Arc<IndexCache>,
        store: Store,
        metrics: CacheMetrics,
    ) -> Result<Self> {
        let recovered = store.load_recent(config.recovery_days)?;
        info!(
            "Signature cache ready at {:?}: {} indexed entries",
            store.dir(),
            recovered
        );
        Ok(Self {
            config,
            index,
            store,
            metrics,
        })
    }

    pub fn config(&self) -> &SignatureCacheConfig {
        &self.config
    }

    /// Store a signature. Empty ids or signature make this a no-op, a request
    /// id containing ':' is rejected.
    ///
    /// The entry is readable as soon as this returns; it reaches disk with the
    /// next flush. Waits while the write queue is full.
    pub async fn save(
        &self,
        request_id: &str,
        tool_call_id: &str,
        signature: &str,
        reasoning: &str,
        model: &str,
    ) -> Result<()> {
        if request_id.is_empty() || tool_call_id.is_empty() || signature.is_empty() {
            debug!("Ignoring signature save with empty fields");
            return Ok(());
        }
        // Keys split at the first ':' on recovery.
        if request_id.contains(':') {
            return Err(Error::InvalidRecordId {
                reason: format!("request id {request_id:?} contains ':'"),
            });
        }
        validate_record_id(&record_key(request_id, tool_call_id))?;
        if self.store.is_closed() {
            return Err(Error::Closed { component: "store" });
        }

        let entry = Entry::new(request_id, tool_call_id, signature, reasoning, model);
        self.store.put_hot(entry.clone());
        if let Err(e) = self.store.enqueue(entry.clone()).await {
            self.store.drop_hot(&entry);
            return Err(e);
        }
        self.metrics.record_save();
        Ok(())
    }

    pub fn lookup(&self, request_id: &str, tool_call_id: &str) -> Option<Entry> {
        let found = self
            .index
            .get(&record_key(request_id, tool_call_id))
            .and_then(|index| self.resolve(&index));
        self.count(found)
    }

    /// Most recent entry saved for `tool_call_id`, across request ids.
    pub fn lookup_by_tool_call_id(&self, tool_call_id: &str) -> Option<Entry> {
        let found = match self.index.get_by_tool_call_id(tool_call_id) {
            Some(index) => self.resolve(&index),
            None => self.store.hot_get_by_tool_call_id(tool_call_id),
        };
        self.count(found)
    }

    /// Like [`lookup_by_tool_call_id`](Self::lookup_by_tool_call_id), but only
    /// returns an entry whose signature starts with `prefix`.
    pub fn lookup_by_tool_call_id_and_signature_prefix(
        &self,
        tool_call_id: &str,
        prefix: &str,
    ) -> Option<Entry> {
        if prefix.is_empty() {
            return self.lookup_by_tool_call_id(tool_call_id);
        }

        let found = match self.index.get_by_tool_call_id(tool_call_id) {
            Some(index) => {
                // Cheap rejection before touching disk.
                if !index.signature_prefix.is_empty()
                    && !prefixes_consistent(&index.signature_prefix, prefix)
                {
                    self.metrics.record_prefix_rejection();
                    return self.count(None);
                }
                self.resolve(&index)
            }
            None => self.store.hot_get_by_tool_call_id(tool_call_id),
        };

        let found = match found {
            Some(entry) if !entry.signature.starts_with(prefix) => {
                self.metrics.record_prefix_rejection();
                None
            }
            other => other,
        };
        self.count(found)
    }

    fn resolve(&self, index: &EntryIndex) -> Option<Entry> {
        match self.store.load_by_index(index) {
            Ok(entry) if entry.is_valid() => Some(entry),
            Ok(_) => None,
            Err(e) if e.is_not_found() => None,
            Err(e) => {
                warn!("Signature lookup for {} failed: {}", index.key(), e);
                None
            }
        }
    }

    fn count(&self, found: Option<Entry>) -> Option<Entry> {
        if found.is_none() {
            self.metrics.record_miss();
        }
        found
    }

    /// Persist everything saved so far.
    pub async fn flush(&self) -> Result<()> {
        self.store.flush().await
    }

    /// Remove a past day's files.
    pub fn delete_day(&self, date: NaiveDate) -> Result<()> {
        self.store.delete_day(date)
    }

    /// Flush pending writes and release files. Saves fail afterwards.
    pub async fn close(&self) -> Result<()> {
        self.store.close().await
    }

    pub fn stats(&self) -> CacheStats {
        let PoolStats {
            open_readers,
            hits,
            misses,
            evictions,
            ..
        } = self.store.pool_stats();
        CacheStats {
            metrics: self.metrics.snapshot(),
            indexed: self.index.len(),
            index_capacity: self.index.capacity(),
            hot: self.store.hot_len(),
            open_readers,
            reader_hits: hits,
            reader_misses: misses,
            reader_evictions: evictions,
            writer_date: self.store.writer_date(),
        }
    }
}
