//! # LRU Index Cache
//!
//! Bounded map of `EntryIndex` pointers, reachable two ways:
//!
//! ```text
//!   "req:call" ─────────────► EntryIndex   (primary, recency ordered)
//!   "call" ──► "req:call" ──┘               (secondary, latest key per tool call)
//! ```
//!
//! Only pointers live here, never signature or reasoning text, so 50k entries
//! stay in the low megabytes.

use std::collections::HashMap;
use std::num::NonZeroUsize;

use chrono::NaiveDate;
use lru::LruCache;
use parking_lot::Mutex;

use thoughtsig_core::EntryIndex;

pub struct IndexCache {
    capacity: NonZeroUsize,
    inner: Mutex<IndexInner>,
}

struct IndexInner {
    entries: LruCache<String, EntryIndex>,
    by_tool_call: HashMap<String, String>,
}

impl IndexInner {
    fn insert(&mut self, index: EntryIndex) {
        let key = index.key();
        let tool_call_id = index.tool_call_id.clone();

        if let Some((evicted_key, evicted)) = self.entries.push(key.clone(), index) {
            if evicted_key != key {
                self.unlink(&evicted.tool_call_id, &evicted_key);
            }
        }
        self.by_tool_call.insert(tool_call_id, key);
    }

    /// Drop the secondary link only if it still points at `key`.
    fn unlink(&mut self, tool_call_id: &str, key: &str) {
        if self.by_tool_call.get(tool_call_id).map(String::as_str) == Some(key) {
            self.by_tool_call.remove(tool_call_id);
        }
    }
}

impl IndexCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            capacity,
            inner: Mutex::new(IndexInner {
                entries: LruCache::new(capacity),
                by_tool_call: HashMap::new(),
            }),
        }
    }

    /// Upsert and move to the front.
    pub fn put(&self, index: EntryIndex) {
        self.inner.lock().insert(index);
    }

    /// Upsert unless the key currently points at a hot (unflushed) entry.
    /// Returns whether the cache changed.
    pub fn put_unless_hot(&self, index: EntryIndex) -> bool {
        let mut inner = self.inner.lock();
        if matches!(inner.entries.peek(&index.key()), Some(existing) if existing.is_hot()) {
            return false;
        }
        inner.insert(index);
        true
    }

    /// Record the signature prefix of a persisted pointer still at `date`.
    /// Leaves recency and the tool call link alone. Returns whether it applied.
    pub fn fill_prefix(&self, key: &str, prefix: String, date: NaiveDate) -> bool {
        let mut inner = self.inner.lock();
        match inner.entries.peek_mut(key) {
            Some(existing)
                if existing.date == Some(date) && existing.signature_prefix.is_empty() =>
            {
                existing.signature_prefix = prefix;
                true
            }
            _ => false,
        }
    }

    pub fn get(&self, key: &str) -> Option<EntryIndex> {
        self.inner.lock().entries.get(key).cloned()
    }

    pub fn get_by_tool_call_id(&self, tool_call_id: &str) -> Option<EntryIndex> {
        let mut inner = self.inner.lock();
        let key = inner.by_tool_call.get(tool_call_id)?.clone();
        match inner.entries.get(&key) {
            Some(index) => Some(index.clone()),
            None => {
                inner.by_tool_call.remove(tool_call_id);
                None
            }
        }
    }

    /// Look without promoting.
    pub fn peek(&self, key: &str) -> Option<EntryIndex> {
        self.inner.lock().entries.peek(key).cloned()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.inner.lock().entries.contains(key)
    }

    pub fn remove(&self, key: &str) -> Option<EntryIndex> {
        let mut inner = self.inner.lock();
        let removed = inner.entries.pop(key)?;
        inner.unlink(&removed.tool_call_id, key);
        Some(removed)
    }

    /// Keys from most to least recently used.
    pub fn keys(&self) -> Vec<String> {
        self.inner.lock().entries.iter().map(|(k, _)| k.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity.get()
    }
}
