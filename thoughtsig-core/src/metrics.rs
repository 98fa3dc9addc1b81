//! # Metrics
//!
//! Lock-free counters for the signature cache. A single `CacheMetrics` is
//! cloned into the manager, the store and the flush task.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;

/// Metrics collector
#[derive(Clone, Default)]
pub struct CacheMetrics {
    inner: Arc<MetricsInner>,
}

#[derive(Default)]
struct MetricsInner {
    // Write path
    saves: AtomicU64,
    entries_flushed: AtomicU64,
    bytes_flushed: AtomicU64,
    flush_batches: AtomicU64,
    flush_errors: AtomicU64,
    entries_dropped: AtomicU64,

    // Read path
    hot_hits: AtomicU64,
    disk_hits: AtomicU64,
    misses: AtomicU64,
    prefix_rejections: AtomicU64,
    corrupt_reads: AtomicU64,

    // Startup
    recovered_entries: AtomicU64,
}

impl CacheMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_save(&self) {
        self.inner.saves.fetch_add(1, Ordering::Relaxed);
    }

    /// Record entries persisted by one batch
    pub fn record_flush(&self, entries: u64, bytes: u64) {
        self.inner.flush_batches.fetch_add(1, Ordering::Relaxed);
        self.inner.entries_flushed.fetch_add(entries, Ordering::Relaxed);
        self.inner.bytes_flushed.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_flush_error(&self) {
        self.inner.flush_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Entries discarded because they can never be written
    pub fn record_dropped(&self, entries: u64) {
        self.inner.entries_dropped.fetch_add(entries, Ordering::Relaxed);
    }

    pub fn record_hot_hit(&self) {
        self.inner.hot_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_disk_hit(&self) {
        self.inner.disk_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_miss(&self) {
        self.inner.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_prefix_rejection(&self) {
        self.inner.prefix_rejections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_corrupt_read(&self) {
        self.inner.corrupt_reads.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_recovered(&self, count: u64) {
        self.inner.recovered_entries.fetch_add(count, Ordering::Relaxed);
    }

    /// Get current metrics snapshot
    pub fn snapshot(&self) -> MetricsSnapshot {
        let i = &self.inner;
        MetricsSnapshot {
            saves: i.saves.load(Ordering::Relaxed),
            entries_flushed: i.entries_flushed.load(Ordering::Relaxed),
            bytes_flushed: i.bytes_flushed.load(Ordering::Relaxed),
            flush_batches: i.flush_batches.load(Ordering::Relaxed),
            flush_errors: i.flush_errors.load(Ordering::Relaxed),
            entries_dropped: i.entries_dropped.load(Ordering::Relaxed),
            hot_hits: i.hot_hits.load(Ordering::Relaxed),
            disk_hits: i.disk_hits.load(Ordering::Relaxed),
            misses: i.misses.load(Ordering::Relaxed),
            prefix_rejections: i.prefix_rejections.load(Ordering::Relaxed),
            corrupt_reads: i.corrupt_reads.load(Ordering::Relaxed),
            recovered_entries: i.recovered_entries.load(Ordering::Relaxed),
        }
    }
}

/// Metrics snapshot
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub saves: u64,
    pub entries_flushed: u64,
    pub bytes_flushed: u64,
    pub flush_batches: u64,
    pub flush_errors: u64,
    pub entries_dropped: u64,
    pub hot_hits: u64,
    pub disk_hits: u64,
    pub misses: u64,
    pub prefix_rejections: u64,
    pub corrupt_reads: u64,
    pub recovered_entries: u64,
}

impl MetricsSnapshot {
    pub fn hits(&self) -> u64 {
        self.hot_hits + self.disk_hits
    }

    pub fn hit_rate(&self) -> f64 {
        let total = self.hits() + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits() as f64 / total as f64
        }
    }
}
