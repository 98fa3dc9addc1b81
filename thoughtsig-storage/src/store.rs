//! Signature Store
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    Signature Store                          │
//! ├─────────────────────────────────────────────────────────────┤
//! │                                                             │
//! │  Write Path:                                                │
//! │  ┌─────────┐    ┌──────────┐    ┌─────────┐                 │
//! │  │  Entry  │───>│ Hot map  │───>│  Queue  │                 │
//! │  └─────────┘    │ + index  │    └────┬────┘                 │
//! │                 └──────────┘         │ flush task           │
//! │                                      ▼ (1s or 256 entries)  │
//! │                                 ┌──────────┐                │
//! │                                 │  Writer  │ today's files  │
//! │                                 └──────────┘                │
//! │                                                             │
//! │  Read Path (by EntryIndex):                                 │
//! │  date = None ──────> hot map                                │
//! │  date = today ─────> writer (serves its own records)        │
//! │  date = older ─────> reader pool                            │
//! │                                                             │
//! │  Recovery Path:                                             │
//! │  ┌────────────────┐    ┌─────────────────────┐              │
//! │  │ last N .idx    │───>│ EntryIndex per id   │              │
//! │  │ files (no data)│    │ into the LRU index  │              │
//! │  └────────────────┘    └─────────────────────┘              │
//! │                                                             │
//! └─────────────────────────────────────────────────────────────┘
//!
//! Only the flush task ever writes to the writer. If a batch fails halfway, the
//! written prefix is dropped from the batch and the loop stops pulling from the
//! queue until a retry succeeds, so a broken disk turns into backpressure on
//! `enqueue` instead of silent loss.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::NaiveDate;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use thoughtsig_core::{
    decode_entry, encode_entry,
    error::{Error, Result},
    signature_prefix, split_record_key, CacheMetrics, Entry, EntryIndex, SignatureCacheConfig,
};

use crate::format::{index_path, list_days, scan_index};
use crate::index_cache::IndexCache;
use crate::pool::{PoolConfig, PoolStats, ReaderPool};
use crate::writer::Writer;

/// Source of "today" for picking the active day file.
pub type DayClock = Arc<dyn Fn() -> NaiveDate + Send + Sync>;

/// Local calendar date.
pub fn local_today() -> NaiveDate {
    chrono::Local::now().date_naive()
}

type FlushReply = oneshot::Sender<Result<()>>;

/// Entries not yet persisted, with a reverse map from tool call id.
#[derive(Default)]
struct HotBuffer {
    entries: HashMap<String, Entry>,
    by_tool_call: HashMap<String, String>,
}

impl HotBuffer {
    fn insert(&mut self, key: String, entry: Entry) {
        self.by_tool_call.insert(entry.tool_call_id.clone(), key.clone());
        self.entries.insert(key, entry);
    }

    fn remove(&mut self, key: &str) {
        if let Some(entry) = self.entries.remove(key) {
            if self.by_tool_call.get(&entry.tool_call_id).map(String::as_str) == Some(key) {
                self.by_tool_call.remove(&entry.tool_call_id);
            }
        }
    }
}

pub struct Store {
    shared: Arc<StoreShared>,
    queue_tx: RwLock<Option<mpsc::Sender<Entry>>>,
    flush_tx: mpsc::Sender<FlushReply>,
    shutdown: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

struct StoreShared {
    dir: PathBuf,
    config: SignatureCacheConfig,
    index: Arc<IndexCache>,
    hot: RwLock<HotBuffer>,
    writer: RwLock<Option<Arc<Writer>>>,
    pool: ReaderPool,
    metrics: CacheMetrics,
    clock: DayClock,
    /// Writes allowed before every further write fails. `None` never fails.
    #[cfg(test)]
    fail_after: Mutex<Option<usize>>,
}

impl Store {
    pub async fn open(
        config: SignatureCacheConfig,
        index: Arc<IndexCache>,
        metrics: CacheMetrics,
    ) -> Result<Self> {
        Self::open_with_clock(config, index, metrics, Arc::new(local_today)).await
    }

    /// Open with a custom day source (day rollover is driven by it).
    pub async fn open_with_clock(
        config: SignatureCacheConfig,
        index: Arc<IndexCache>,
        metrics: CacheMetrics,
        clock: DayClock,
    ) -> Result<Self> {
        config.validate()?;
        let dir = config.signatures_dir();
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| Error::io(format!("creating signature directory {dir:?}"), e))?;

        let writer = Arc::new(Writer::open(&dir, clock())?);
        let pool = ReaderPool::new(
            dir.clone(),
            PoolConfig {
                max_open: config.max_open_readers,
                ..Default::default()
            },
        );

        let (queue_tx, queue_rx) = mpsc::channel(config.queue_capacity);
        let (flush_tx, flush_rx) = mpsc::channel(8);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let shared = Arc::new(StoreShared {
            dir,
            config,
            index,
            hot: RwLock::new(HotBuffer::default()),
            writer: RwLock::new(Some(writer)),
            pool,
            metrics,
            clock,
            #[cfg(test)]
            fail_after: Mutex::new(None),
        });

        let bg = Arc::clone(&shared);
        let task = tokio::spawn(async move {
            bg.flush_loop(queue_rx, flush_rx, shutdown_rx).await;
        });

        Ok(Self {
            shared,
            queue_tx: RwLock::new(Some(queue_tx)),
            flush_tx,
            shutdown: shutdown_tx,
            task: Mutex::new(Some(task)),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.shared.dir
    }

    pub fn index(&self) -> &Arc<IndexCache> {
        &self.shared.index
    }

    /// Stage `entry` in the hot buffer and point the index at it.
    ///
    /// Both updates happen under the hot lock so the flush task cannot
    /// interleave a disk pointer for an older write of the same key.
    pub fn put_hot(&self, entry: Entry) {
        let key = entry.key();
        let pointer = EntryIndex::hot(&entry, self.shared.config.signature_prefix_len);
        let mut hot = self.shared.hot.write();
        hot.insert(key, entry);
        self.shared.index.put(pointer);
    }

    /// Queue `entry` for persistence. Waits while the queue is full.
    pub async fn enqueue(&self, entry: Entry) -> Result<()> {
        let tx = self
            .queue_tx
            .read()
            .clone()
            .ok_or(Error::Closed { component: "store" })?;
        tx.send(entry)
            .await
            .map_err(|_| Error::Closed { component: "store" })
    }

    /// Undo a `put_hot` whose entry never made it into the queue.
    pub fn drop_hot(&self, entry: &Entry) {
        self.shared.discard(entry);
    }

    pub fn is_closed(&self) -> bool {
        self.queue_tx.read().is_none()
    }

    pub fn hot_get(&self, key: &str) -> Option<Entry> {
        self.shared.hot.read().entries.get(key).cloned()
    }

    pub fn hot_get_by_tool_call_id(&self, tool_call_id: &str) -> Option<Entry> {
        let hot = self.shared.hot.read();
        let key = hot.by_tool_call.get(tool_call_id)?;
        hot.entries.get(key).cloned()
    }

    pub fn hot_len(&self) -> usize {
        self.shared.hot.read().entries.len()
    }

    /// Resolve a pointer to its full entry.
    pub fn load_by_index(&self, index: &EntryIndex) -> Result<Entry> {
        self.shared.load_by_index(index)
    }

    /// Rebuild the index from the newest `days` index files. Returns entries added.
    pub fn load_recent(&self, days: usize) -> Result<usize> {
        self.shared.load_recent(days)
    }

    /// Persist everything queued so far and wait for the result.
    pub async fn flush(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.flush_tx
            .send(tx)
            .await
            .map_err(|_| Error::Closed { component: "store" })?;
        rx.await.map_err(|_| Error::Closed { component: "store" })?
    }

    /// Remove a past day's files. The active day cannot be deleted.
    pub fn delete_day(&self, date: NaiveDate) -> Result<()> {
        if self.writer_date() == Some(date) {
            return Err(Error::Internal {
                message: format!("refusing to delete active day {date}"),
            });
        }
        self.shared.pool.delete_date(date)
    }

    pub fn writer_date(&self) -> Option<NaiveDate> {
        self.shared.writer.read().as_ref().map(|w| w.date())
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.shared.pool.stats()
    }

    /// Drain the queue, flush and close the writer, close the reader pool.
    pub async fn close(&self) -> Result<()> {
        self.queue_tx.write().take();
        let _ = self.shutdown.send(true);

        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                error!("Signature flush task failed: {}", e);
            }
        }

        let writer = self.shared.writer.write().take();
        if let Some(writer) = writer {
            writer.close()?;
        }
        self.shared.pool.close();
        info!("Signature store closed");
        Ok(())
    }
}

impl Drop for Store {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}

impl StoreShared {
    async fn flush_loop(
        &self,
        mut queue_rx: mpsc::Receiver<Entry>,
        mut flush_rx: mpsc::Receiver<FlushReply>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        let batch_size = self.config.flush_batch_size;
        let mut ticker = interval(self.config.flush_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let mut pending: Vec<Entry> = Vec::with_capacity(batch_size);
        // Set while a failed batch is outstanding; the queue is left alone meanwhile.
        let mut stalled = false;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    stalled = self.persist(&mut pending).is_err();
                }
                received = queue_rx.recv(), if !stalled => {
                    match received {
                        Some(entry) => {
                            pending.push(entry);
                            if pending.len() >= batch_size {
                                stalled = self.persist(&mut pending).is_err();
                            }
                        }
                        None => break,
                    }
                }
                Some(reply) = flush_rx.recv() => {
                    drain_ready(&mut queue_rx, &mut pending);
                    let result = self.persist(&mut pending);
                    stalled = result.is_err();
                    let _ = reply.send(result);
                }
                _ = shutdown_rx.changed() => break,
            }
        }

        queue_rx.close();
        drain_ready(&mut queue_rx, &mut pending);
        if let Err(e) = self.persist(&mut pending) {
            error!(
                "Shutdown flush failed, {} signature entries not persisted: {}",
                pending.len(),
                e
            );
        }
        debug!("Signature flush task stopped");
    }

    /// Write `pending` to today's file. Written entries leave `pending` even on error.
    fn persist(&self, pending: &mut Vec<Entry>) -> Result<()> {
        if pending.is_empty() {
            return Ok(());
        }

        let writer = match self.current_writer() {
            Ok(writer) => writer,
            Err(e) => {
                self.metrics.record_flush_error();
                warn!("No writer available, {} entries stay queued: {}", pending.len(), e);
                return Err(e);
            }
        };

        let mut done = 0;
        let mut written = 0u64;
        let mut dropped = 0u64;
        let mut bytes = 0u64;
        let mut failure = None;
        for entry in pending.iter() {
            match self.write_one(&writer, entry) {
                Ok(len) => {
                    written += 1;
                    bytes += len as u64;
                }
                Err(e) if is_permanent(&e) => {
                    error!("Dropping unpersistable signature entry {}: {}", entry.key(), e);
                    self.discard(entry);
                    dropped += 1;
                }
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
            done += 1;
        }

        if failure.is_none() && self.config.sync_on_flush {
            if let Err(e) = writer.flush() {
                failure = Some(e);
            }
        }

        pending.drain(..done);
        if dropped > 0 {
            self.metrics.record_dropped(dropped);
        }
        match failure {
            None => {
                self.metrics.record_flush(written, bytes);
                debug!("Flushed {} signature entries to {}", written, writer.date());
                Ok(())
            }
            Some(e) => {
                if written > 0 {
                    self.metrics.record_flush(written, bytes);
                }
                self.metrics.record_flush_error();
                warn!(
                    "Signature flush failed after {} entries, {} will be retried: {}",
                    written,
                    pending.len(),
                    e
                );
                Err(e)
            }
        }
    }

    fn write_one(&self, writer: &Writer, entry: &Entry) -> Result<usize> {
        #[cfg(test)]
        if let Some(left) = self.fail_after.lock().as_mut() {
            if *left == 0 {
                return Err(
                    std::io::Error::new(std::io::ErrorKind::Other, "injected write failure").into(),
                );
            }
            *left -= 1;
        }

        let key = entry.key();
        let payload = encode_entry(entry)?;
        writer.write(&key, &payload)?;
        self.promote(&key, entry, writer.date());
        Ok(payload.len())
    }

    /// Swap the hot pointer for a disk pointer, unless a newer write took over the key.
    fn promote(&self, key: &str, entry: &Entry, date: NaiveDate) {
        let mut hot = self.hot.write();
        let superseded = match hot.entries.get(key) {
            Some(current) if current.same_write(entry) => false,
            Some(_) => true,
            None => false,
        };
        if superseded {
            return;
        }
        hot.remove(key);
        self.index.put(EntryIndex::persisted(
            entry,
            self.config.signature_prefix_len,
            date,
        ));
    }

    fn discard(&self, entry: &Entry) {
        let key = entry.key();
        let mut hot = self.hot.write();
        if matches!(hot.entries.get(&key), Some(current) if current.same_write(entry)) {
            hot.remove(&key);
            self.index.remove(&key);
        }
    }

    /// Writer for today, rotating away from yesterday's if the date moved on.
    fn current_writer(&self) -> Result<Arc<Writer>> {
        let today = (self.clock)();
        if let Some(writer) = self.writer.read().as_ref() {
            if writer.date() == today {
                return Ok(Arc::clone(writer));
            }
        }

        let mut slot = self.writer.write();
        if let Some(writer) = slot.as_ref() {
            if writer.date() == today {
                return Ok(Arc::clone(writer));
            }
        }

        let writer = Arc::new(Writer::open(&self.dir, today)?);
        if let Some(previous) = slot.replace(Arc::clone(&writer)) {
            info!("Rotating signature files: {} -> {}", previous.date(), today);
            if let Err(e) = previous.close() {
                warn!("Closing writer for {} failed: {}", previous.date(), e);
            }
        }
        Ok(writer)
    }

    fn active_writer_for(&self, date: NaiveDate) -> Option<Arc<Writer>> {
        self.writer
            .read()
            .as_ref()
            .filter(|w| w.date() == date)
            .map(Arc::clone)
    }

    fn load_by_index(&self, index: &EntryIndex) -> Result<Entry> {
        let key = index.key();
        let Some(date) = index.date else {
            let hot_entry = self.hot.read().entries.get(&key).cloned();
            if let Some(entry) = hot_entry {
                if !index.signature_prefix.is_empty()
                    && !entry.signature.starts_with(&index.signature_prefix)
                {
                    return Err(Error::not_found(key));
                }
                self.metrics.record_hot_hit();
                return Ok(entry);
            }
            // Flushed between the index lookup and now.
            return match self.index.peek(&key) {
                Some(fresh) if !fresh.is_hot() => self.load_by_index(&fresh),
                _ => Err(Error::not_found(key)),
            };
        };

        let result = self.load_persisted(&key, date, &index.signature_prefix);
        if let Err(e) = &result {
            if e.is_corruption() {
                self.metrics.record_corrupt_read();
                warn!("Corrupt signature record {} in {}: {}", key, date, e);
            }
        }
        result
    }

    fn load_persisted(&self, key: &str, date: NaiveDate, known_prefix: &str) -> Result<Entry> {
        let payload = match self.active_writer_for(date) {
            Some(writer) => match writer.load(key) {
                // Rotated out from under us; the day is readable through the pool now.
                Err(Error::Closed { .. }) => self.pool.acquire(date)?.load(key)?,
                other => other?,
            },
            None => self.pool.acquire(date)?.load(key)?,
        };

        let entry = decode_entry(&payload)?;
        if entry.key() != key {
            return Err(Error::Internal {
                message: format!("record {key} in {date} holds entry {}", entry.key()),
            });
        }
        if !entry.is_valid() {
            return Err(Error::not_found(key));
        }
        if !known_prefix.is_empty() && !entry.signature.starts_with(known_prefix) {
            return Err(Error::not_found(key));
        }

        if known_prefix.is_empty() {
            // Recovered pointers learn their prefix on first read.
            self.index.fill_prefix(
                key,
                signature_prefix(&entry.signature, self.config.signature_prefix_len),
                date,
            );
        }
        self.metrics.record_disk_hit();
        Ok(entry)
    }

    fn load_recent(&self, days: usize) -> Result<usize> {
        let all_days = list_days(&self.dir)?;
        let start = all_days.len().saturating_sub(days);
        let mut added = 0usize;

        // Oldest first so newer days win for repeated keys.
        for &date in &all_days[start..] {
            let path = index_path(&self.dir, date);
            let scan = match scan_index(&path) {
                Ok(scan) => scan,
                Err(e) if e.is_corruption() => {
                    warn!("Skipping unreadable index {:?}: {}", path, e);
                    continue;
                }
                Err(e) => return Err(e),
            };

            for (record_id, _) in &scan.entries {
                let Some((request_id, tool_call_id)) = split_record_key(record_id) else {
                    warn!("Skipping malformed record id {:?} in {}", record_id, date);
                    continue;
                };
                if self
                    .index
                    .put_unless_hot(EntryIndex::recovered(request_id, tool_call_id, date))
                {
                    added += 1;
                }
            }
            debug!("Recovered {} index entries from {}", scan.entries.len(), date);
        }

        self.metrics.record_recovered(added as u64);
        info!(
            "Signature index recovery: {} entries from {} day(s)",
            added,
            all_days.len() - start
        );
        Ok(added)
    }
}

fn drain_ready(queue_rx: &mut mpsc::Receiver<Entry>, pending: &mut Vec<Entry>) {
    while let Ok(entry) = queue_rx.try_recv() {
        pending.push(entry);
    }
}

/// Errors that retrying the same entry can never fix.
fn is_permanent(err: &Error) -> bool {
    matches!(
        err,
        Error::InvalidRecordId { .. } | Error::PayloadTooLarge { .. } | Error::Serialization { .. }
    )
}
