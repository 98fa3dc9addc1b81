//! # Reader Pool
//!
//! Keeps a bounded set of day readers open so historical lookups don't pay for
//! reopening files and reloading the index every time.
//!
//! - Readers are shared: concurrent requests for a day get the same reader
//! - Handles are reference counted; dropping one releases it
//! - Over capacity, the least recently used reader *with no live handles* is
//!   closed. Readers in use are never evicted, so the pool may briefly exceed
//!   its cap while every slot is busy
//!
//! The pool lock covers bookkeeping only. Opening a reader and reading
//! through a handle both happen outside it.

use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::NaiveDate;
use lru::LruCache;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use thoughtsig_core::error::{Error, Result};

use crate::format::{data_path, index_path};
use crate::platform::fd_limit;
use crate::reader::Reader;

/// Descriptors left for the active writer and the rest of the process.
const RESERVED_FDS: usize = 64;

/// Reader pool configuration
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Max day readers to keep open
    pub max_open: usize,
    /// Percentage of system limit to use as soft cap (0.0-1.0)
    pub soft_limit_ratio: f64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_open: 16,
            soft_limit_ratio: 0.8,
        }
    }
}

/// Reader pool statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub open_readers: usize,
    pub max_open: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

pub struct ReaderPool {
    dir: PathBuf,
    shared: Arc<PoolShared>,
}

struct PoolShared {
    max_open: usize,
    state: Mutex<PoolState>,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

struct PoolState {
    readers: LruCache<NaiveDate, Slot>,
    next_id: u64,
    closed: bool,
}

struct Slot {
    /// Distinguishes a reopened reader from one that was deleted or evicted.
    id: u64,
    reader: Arc<Reader>,
    refs: usize,
}

impl ReaderPool {
    pub fn new(dir: impl Into<PathBuf>, config: PoolConfig) -> Self {
        let system_fd_limit = fd_limit();
        let soft_cap = ((system_fd_limit as f64 * config.soft_limit_ratio) as usize)
            .saturating_sub(RESERVED_FDS);
        let max_open = config.max_open.min(soft_cap).max(1);

        info!(
            "Reader pool initialized: max={}, system_limit={}",
            max_open, system_fd_limit
        );

        Self {
            dir: dir.into(),
            shared: Arc::new(PoolShared {
                max_open,
                state: Mutex::new(PoolState {
                    readers: LruCache::unbounded(),
                    next_id: 0,
                    closed: false,
                }),
                hits: AtomicU64::new(0),
                misses: AtomicU64::new(0),
                evictions: AtomicU64::new(0),
            }),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Borrow the reader for `date`, opening it on first use.
    pub fn acquire(&self, date: NaiveDate) -> Result<ReaderHandle> {
        {
            let mut state = self.shared.state.lock();
            if state.closed {
                return Err(Error::Closed { component: "reader pool" });
            }
            if let Some(handle) = self.checkout(&mut state, date) {
                self.shared.hits.fetch_add(1, Ordering::Relaxed);
                return Ok(handle);
            }
        }

        self.shared.misses.fetch_add(1, Ordering::Relaxed);
        let reader = Arc::new(Reader::open(&self.dir, date)?);

        let mut state = self.shared.state.lock();
        if state.closed {
            return Err(Error::Closed { component: "reader pool" });
        }
        // Another caller may have opened the same day meanwhile; share theirs.
        if let Some(handle) = self.checkout(&mut state, date) {
            return Ok(handle);
        }

        let id = state.next_id;
        state.next_id += 1;
        state.readers.push(
            date,
            Slot {
                id,
                reader: Arc::clone(&reader),
                refs: 1,
            },
        );
        self.shared.evict_idle(&mut state);

        Ok(ReaderHandle {
            reader,
            date,
            id,
            shared: Arc::clone(&self.shared),
        })
    }

    fn checkout(&self, state: &mut PoolState, date: NaiveDate) -> Option<ReaderHandle> {
        let slot = state.readers.get_mut(&date)?;
        slot.refs += 1;
        Some(ReaderHandle {
            reader: Arc::clone(&slot.reader),
            date,
            id: slot.id,
            shared: Arc::clone(&self.shared),
        })
    }

    /// Whether a reader for `date` is currently open. Does not touch recency.
    pub fn is_open(&self, date: NaiveDate) -> bool {
        self.shared.state.lock().readers.contains(&date)
    }

    /// Close any open reader for `date` and remove its files from disk.
    pub fn delete_date(&self, date: NaiveDate) -> Result<()> {
        if let Some(slot) = self.shared.state.lock().readers.pop(&date) {
            if slot.refs > 0 {
                warn!(
                    "Deleting {} while {} handle(s) are still reading it",
                    date, slot.refs
                );
            }
        }

        for path in [data_path(&self.dir, date), index_path(&self.dir, date)] {
            match std::fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(Error::io(format!("removing {path:?}"), e)),
            }
        }
        info!("Deleted signature files for {}", date);
        Ok(())
    }

    /// Close every reader; later `acquire` calls fail.
    pub fn close(&self) {
        let mut state = self.shared.state.lock();
        state.closed = true;
        let open = state.readers.len();
        state.readers.clear();
        debug!("Reader pool closed ({} readers released)", open);
    }

    /// Get current statistics
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            open_readers: self.shared.state.lock().readers.len(),
            max_open: self.shared.max_open,
            hits: self.shared.hits.load(Ordering::Relaxed),
            misses: self.shared.misses.load(Ordering::Relaxed),
            evictions: self.shared.evictions.load(Ordering::Relaxed),
        }
    }
}

impl PoolShared {
    /// Close idle readers, least recently used first, until back under the cap.
    fn evict_idle(&self, state: &mut PoolState) {
        while state.readers.len() > self.max_open {
            let victim = state
                .readers
                .iter()
                .rev()
                .find(|(_, slot)| slot.refs == 0)
                .map(|(date, _)| *date);

            let Some(date) = victim else {
                break;
            };
            state.readers.pop(&date);
            self.evictions.fetch_add(1, Ordering::Relaxed);
            debug!("Evicted idle reader for {}", date);
        }
    }

    fn release(&self, date: NaiveDate, id: u64) {
        let mut state = self.state.lock();
        if let Some(slot) = state.readers.peek_mut(&date) {
            if slot.id == id {
                slot.refs = slot.refs.saturating_sub(1);
            }
        }
        self.evict_idle(&mut state);
    }
}

/// A borrowed reader. Dropping the handle returns it to the pool.
pub struct ReaderHandle {
    reader: Arc<Reader>,
    date: NaiveDate,
    id: u64,
    shared: Arc<PoolShared>,
}

impl ReaderHandle {
    pub fn date(&self) -> NaiveDate {
        self.date
    }

    /// Explicit release; same as dropping the handle.
    pub fn close(self) {}
}

impl Deref for ReaderHandle {
    type Target = Reader;

    fn deref(&self) -> &Reader {
        &self.reader
    }
}

impl Drop for ReaderHandle {
    fn drop(&mut self) {
        self.shared.release(self.date, self.id);
    }
}
