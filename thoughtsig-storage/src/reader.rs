//! Read-only access to a past day's files.
//!
//! The whole index is loaded once on open; every lookup afterwards is a single
//! positioned read against the data file, followed by a page cache drop hint.

use std::collections::HashMap;
use std::fs::File;
use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use parking_lot::Mutex;
use tracing::debug;

use thoughtsig_core::error::{Error, Result};

use crate::format::{data_path, index_path, read_record, scan_index, IndexEntry, LENGTH_PREFIX_SIZE};
use crate::platform;

pub struct Reader {
    date: NaiveDate,
    path: PathBuf,
    data: Mutex<File>,
    index: HashMap<String, IndexEntry>,
}

impl Reader {
    /// Open the file pair for `date` in `dir`.
    pub fn open(dir: impl AsRef<Path>, date: NaiveDate) -> Result<Self> {
        let dir = dir.as_ref();
        let idx_path = index_path(dir, date);
        let path = data_path(dir, date);

        let scan = scan_index(&idx_path)?;
        let data = File::open(&path).map_err(|e| Error::io(format!("opening {path:?}"), e))?;

        let mut index = HashMap::with_capacity(scan.entries.len());
        for (id, entry) in scan.entries {
            index.insert(id, entry);
        }

        debug!("Opened reader for {}: {} records", date, index.len());

        Ok(Self {
            date,
            path,
            data: Mutex::new(data),
            index,
        })
    }

    pub fn date(&self) -> NaiveDate {
        self.date
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Distinct record ids in this day.
    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn exists(&self, record_id: &str) -> bool {
        self.index.contains_key(record_id)
    }

    pub fn record_ids(&self) -> impl Iterator<Item = &str> {
        self.index.keys().map(String::as_str)
    }

    pub fn entry(&self, record_id: &str) -> Option<IndexEntry> {
        self.index.get(record_id).copied()
    }

    pub fn load(&self, record_id: &str) -> Result<Vec<u8>> {
        let entry = self
            .entry(record_id)
            .ok_or_else(|| Error::not_found(record_id))?;

        let mut file = self.data.lock();
        let payload = read_record(&mut *file, record_id, entry)?;
        platform::drop_page_cache(
            &file,
            entry.offset.get(),
            LENGTH_PREFIX_SIZE + entry.length.get() as u64,
        );
        Ok(payload)
    }
}
