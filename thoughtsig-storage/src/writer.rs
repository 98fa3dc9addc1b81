//! Active-day writer.
//!
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                    Append Sequence                              │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  1. data file  ◄── [len:4][payload]        (at data_len)        │
//! │  2. index file ◄── [id:128][off:8][len:4][rsv:4]                │
//! │  3. header     ◄── advisory count                               │
//! │                                                                 │
//! │  any step fails ──► truncate both files to their old lengths    │
//! └─────────────────────────────────────────────────────────────────┘
//!
//! The writer keeps its own id → location map, so the current day is served
//! straight from here without going through the reader pool. Appends take the
//! exclusive lock; lookups take the shared lock and read through a separate
//! read-only handle.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

use thoughtsig_core::error::{Error, Result};

use crate::format::{
    data_path, encode_header, encode_index_entry, encode_record, file_len, index_path,
    read_record, scan_index_bytes, validate_record_id, write_header_count, ByteOffset,
    EntryCount, IndexEntry, INDEX_HEADER_SIZE,
};

pub struct Writer {
    date: NaiveDate,
    data_path: PathBuf,
    index_path: PathBuf,
    inner: RwLock<WriterInner>,
    read_handle: Mutex<Option<File>>,
}

struct WriterInner {
    files: Option<WriterFiles>,
    data_len: ByteOffset,
    count: EntryCount,
    records: HashMap<String, IndexEntry>,
    #[cfg(test)]
    fail_index_append: bool,
}

struct WriterFiles {
    data: File,
    index: File,
}

impl Writer {
    /// Open (or create) the file pair for `date` in `dir`, replaying its index.
    pub fn open(dir: impl AsRef<Path>, date: NaiveDate) -> Result<Self> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)
            .map_err(|e| Error::io(format!("creating signature directory {dir:?}"), e))?;

        let data_path = data_path(dir, date);
        let index_path = index_path(dir, date);

        let data = open_rw(&data_path)?;
        let mut index = open_rw(&index_path)?;
        let data_len = ByteOffset::new(file_len(&data)?);
        let index_size = file_len(&index)?;

        let (count, records) = if index_size < INDEX_HEADER_SIZE {
            // Nothing recorded yet (or the very first header write was torn).
            index.set_len(0)?;
            index.seek(SeekFrom::Start(0))?;
            index.write_all(&encode_header(EntryCount::new(0)))?;
            (EntryCount::new(0), HashMap::new())
        } else {
            replay_index(&index_path, &mut index, data_len)?
        };

        let read_handle = File::open(&data_path)
            .map_err(|e| Error::io(format!("opening {data_path:?} for reading"), e))?;

        info!(
            "Opened writer for {}: {} entries, {} data bytes",
            date,
            count,
            data_len.get()
        );

        Ok(Self {
            date,
            data_path,
            index_path,
            inner: RwLock::new(WriterInner {
                files: Some(WriterFiles { data, index }),
                data_len,
                count,
                records,
                #[cfg(test)]
                fail_index_append: false,
            }),
            read_handle: Mutex::new(Some(read_handle)),
        })
    }

    pub fn date(&self) -> NaiveDate {
        self.date
    }

    pub fn data_path(&self) -> &Path {
        &self.data_path
    }

    pub fn index_path(&self) -> &Path {
        &self.index_path
    }

    /// Entries appended to the index file (including overwritten ids).
    pub fn len(&self) -> u64 {
        self.inner.read().count.get()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn data_len(&self) -> u64 {
        self.inner.read().data_len.get()
    }

    /// Append one record. A repeated id points the index at the new bytes.
    pub fn write(&self, record_id: &str, payload: &[u8]) -> Result<IndexEntry> {
        validate_record_id(record_id)?;
        let (length, record) = encode_record(payload)?;

        let mut inner = self.inner.write();
        let offset = inner.data_len;
        let entry = IndexEntry { offset, length };
        let slot = encode_index_entry(record_id, entry)?;
        let index_len = inner.count.index_file_size();
        let next_count = inner.count.next();

        if let Err(e) = inner.append(offset, &record, index_len, &slot, next_count) {
            inner.rollback(offset, index_len);
            return Err(e);
        }

        inner.data_len = offset.after_record(length);
        inner.count = next_count;
        inner.records.insert(record_id.to_string(), entry);
        Ok(entry)
    }

    pub fn load(&self, record_id: &str) -> Result<Vec<u8>> {
        let entry = {
            let inner = self.inner.read();
            if inner.files.is_none() {
                return Err(Error::Closed { component: "writer" });
            }
            inner.records.get(record_id).copied()
        }
        .ok_or_else(|| Error::not_found(record_id))?;

        let mut handle = self.read_handle.lock();
        let file = handle.as_mut().ok_or(Error::Closed { component: "writer" })?;
        read_record(file, record_id, entry)
    }

    /// False once closed, matching `load`.
    pub fn exists(&self, record_id: &str) -> bool {
        let inner = self.inner.read();
        inner.files.is_some() && inner.records.contains_key(record_id)
    }

    /// Force both files to stable storage.
    pub fn flush(&self) -> Result<()> {
        let inner = self.inner.write();
        let files = inner.files.as_ref().ok_or(Error::Closed { component: "writer" })?;
        files.data.sync_data()?;
        files.index.sync_data()?;
        Ok(())
    }

    /// Write the final header count, sync, and release the file handles.
    pub fn close(&self) -> Result<()> {
        let mut inner = self.inner.write();
        let count = inner.count;
        let Some(mut files) = inner.files.take() else {
            return Ok(());
        };
        self.read_handle.lock().take();

        write_header_count(&mut files.index, count)?;
        files.index.sync_all()?;
        files.data.sync_all()?;
        info!("Closed writer for {}: {} entries", self.date, count);
        Ok(())
    }
}

impl Drop for Writer {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!("Failed to close writer for {}: {}", self.date, e);
        }
    }
}

impl WriterInner {
    fn append(
        &mut self,
        offset: ByteOffset,
        record: &[u8],
        index_len: u64,
        slot: &[u8],
        next_count: EntryCount,
    ) -> Result<()> {
        #[cfg(test)]
        let fail_index_append = self.fail_index_append;
        let files = self.files.as_mut().ok_or(Error::Closed { component: "writer" })?;

        files.data.seek(SeekFrom::Start(offset.get()))?;
        files.data.write_all(record)?;

        #[cfg(test)]
        if fail_index_append {
            return Err(std::io::Error::new(std::io::ErrorKind::Other, "injected index failure").into());
        }

        files.index.seek(SeekFrom::Start(index_len))?;
        files.index.write_all(slot)?;
        write_header_count(&mut files.index, next_count)?;
        Ok(())
    }

    /// Cut both files back to their pre-append lengths.
    fn rollback(&mut self, data_len: ByteOffset, index_len: u64) {
        let count = self.count;
        let Some(files) = self.files.as_mut() else {
            return;
        };
        if let Err(e) = files.data.set_len(data_len.get()) {
            error!("Rollback of data file to {} failed: {}", data_len, e);
        }
        if let Err(e) = files.index.set_len(index_len) {
            error!("Rollback of index file to {} bytes failed: {}", index_len, e);
        }
        if let Err(e) = write_header_count(&mut files.index, count) {
            warn!("Could not restore index header count: {}", e);
        }
        debug!("Rolled back partial append at {}", data_len);
    }
}

fn open_rw(path: &Path) -> Result<File> {
    OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .open(path)
        .map_err(|e| Error::io(format!("opening {path:?}"), e))
}

/// Rebuild the id map from an existing index file and trim a torn tail.
fn replay_index(
    path: &Path,
    index: &mut File,
    data_len: ByteOffset,
) -> Result<(EntryCount, HashMap<String, IndexEntry>)> {
    let mut buf = Vec::new();
    index.seek(SeekFrom::Start(0))?;
    index.read_to_end(&mut buf)?;
    let scan = scan_index_bytes(path, &buf)?;

    if scan.trailing_bytes > 0 {
        warn!(
            "Index {:?}: dropping {} bytes of a torn trailing entry",
            path, scan.trailing_bytes
        );
        index.set_len(scan.valid.index_file_size())?;
    }
    if scan.declared != scan.valid {
        write_header_count(index, scan.valid)?;
    }

    let mut records = HashMap::with_capacity(scan.entries.len());
    for (id, entry) in scan.entries {
        if entry.offset.after_record(entry.length) > data_len {
            warn!("Index {:?}: {} points past end of data file, skipping", path, id);
            continue;
        }
        records.insert(id, entry);
    }
    Ok((scan.valid, records))
}
