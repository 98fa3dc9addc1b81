//! Day file format.
//!
//! Each calendar day owns a `<YYYY-MM-DD>.dat` / `<YYYY-MM-DD>.idx` pair.
//!
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    Index File Layout                        │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Header (10 bytes, big-endian)                              │
//! │    Magic (4) │ Version (2) │ Entry Count (4, advisory)      │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Entry (144 bytes, fixed stride)                            │
//! │    Record Id (128, zero padded)                             │
//! │    Offset (8) ──► start of the record in the data file      │
//! │    Length (4)    payload length                             │
//! │    Reserved (4)                                             │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Entry 2..N                                                 │
//! └─────────────────────────────────────────────────────────────┘
//!
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    Data File Layout                         │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Length (4, big-endian) │ Payload (Length bytes)            │
//! │  Length (4, big-endian) │ Payload ...                       │
//! └─────────────────────────────────────────────────────────────┘
//!
//! The number of valid index entries is always derived from the file size,
//! `(size - 10) / 144`, dropping any torn trailing entry. The header count is
//! diagnostics only.

use std::fmt;
use std::fs::File;
use std::io::{Cursor, ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use bytes::{BufMut, BytesMut};
use chrono::NaiveDate;
use tracing::warn;

use thoughtsig_core::error::{Error, Result};

pub const INDEX_MAGIC: u32 = 0x5453_4958; // "TSIX"
pub const INDEX_VERSION: u16 = 1;
pub const INDEX_HEADER_SIZE: u64 = 10;
pub const INDEX_ENTRY_SIZE: u64 = 144;
pub const MAX_RECORD_ID_LEN: usize = 128;
pub const LENGTH_PREFIX_SIZE: u64 = 4;

/// Byte offset of the header's entry-count field.
pub(crate) const HEADER_COUNT_OFFSET: u64 = 6;

const DATE_FORMAT: &str = "%Y-%m-%d";
pub const DATA_EXTENSION: &str = "dat";
pub const INDEX_EXTENSION: &str = "idx";

/// Position in a data file, in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct ByteOffset(u64);

impl ByteOffset {
    pub const fn new(offset: u64) -> Self {
        Self(offset)
    }

    pub fn get(self) -> u64 {
        self.0
    }

    /// Where the payload of a record starting here begins.
    pub fn payload_start(self) -> u64 {
        self.0 + LENGTH_PREFIX_SIZE
    }

    /// Offset just past a record of `len` payload bytes starting here.
    pub fn after_record(self, len: RecordLen) -> ByteOffset {
        ByteOffset(self.0 + LENGTH_PREFIX_SIZE + len.get() as u64)
    }
}

impl fmt::Display for ByteOffset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "@{}", self.0)
    }
}

/// Payload length of one record, bounded by the 32-bit length field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct RecordLen(u32);

impl RecordLen {
    pub const fn new(len: u32) -> Self {
        Self(len)
    }

    pub fn from_payload(payload: &[u8]) -> Result<Self> {
        u32::try_from(payload.len())
            .map(RecordLen)
            .map_err(|_| Error::PayloadTooLarge { len: payload.len() })
    }

    pub fn get(self) -> u32 {
        self.0
    }

    pub fn as_usize(self) -> usize {
        self.0 as usize
    }
}

/// Number of entries in an index file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct EntryCount(u64);

impl EntryCount {
    pub const fn new(count: u64) -> Self {
        Self(count)
    }

    pub fn get(self) -> u64 {
        self.0
    }

    /// Valid entries in an index file of `file_size` bytes, ignoring a torn tail.
    pub fn from_index_size(file_size: u64) -> Self {
        Self(file_size.saturating_sub(INDEX_HEADER_SIZE) / INDEX_ENTRY_SIZE)
    }

    /// Exact index file size holding this many entries.
    pub fn index_file_size(self) -> u64 {
        INDEX_HEADER_SIZE + self.0 * INDEX_ENTRY_SIZE
    }

    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }

    /// Value stored in the 4-byte header field (saturates).
    fn header_value(self) -> u32 {
        u32::try_from(self.0).unwrap_or(u32::MAX)
    }
}

impl fmt::Display for EntryCount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Location of one record inside a day's data file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexEntry {
    pub offset: ByteOffset,
    pub length: RecordLen,
}

/// Reject ids that cannot be stored in the fixed-width id field.
pub fn validate_record_id(record_id: &str) -> Result<()> {
    if record_id.is_empty() {
        return Err(Error::InvalidRecordId {
            reason: "record id is empty".to_string(),
        });
    }
    if record_id.len() > MAX_RECORD_ID_LEN {
        return Err(Error::InvalidRecordId {
            reason: format!(
                "record id is {} bytes, max is {}",
                record_id.len(),
                MAX_RECORD_ID_LEN
            ),
        });
    }
    if record_id.as_bytes().contains(&0) {
        return Err(Error::InvalidRecordId {
            reason: "record id contains a NUL byte".to_string(),
        });
    }
    Ok(())
}

pub fn encode_header(count: EntryCount) -> [u8; INDEX_HEADER_SIZE as usize] {
    let mut buf = [0u8; INDEX_HEADER_SIZE as usize];
    buf[0..4].copy_from_slice(&INDEX_MAGIC.to_be_bytes());
    buf[4..6].copy_from_slice(&INDEX_VERSION.to_be_bytes());
    buf[6..10].copy_from_slice(&count.header_value().to_be_bytes());
    buf
}

/// Validate magic and version; returns the advisory entry count.
pub fn decode_header(path: &Path, buf: &[u8]) -> Result<EntryCount> {
    if buf.len() < INDEX_HEADER_SIZE as usize {
        return Err(Error::CorruptIndex {
            path: path.to_path_buf(),
            details: format!("truncated header: {} bytes", buf.len()),
        });
    }
    let mut cursor = Cursor::new(buf);
    let magic = cursor.read_u32::<BigEndian>()?;
    if magic != INDEX_MAGIC {
        return Err(Error::CorruptIndex {
            path: path.to_path_buf(),
            details: format!("bad magic {magic:#010x}"),
        });
    }
    let version = cursor.read_u16::<BigEndian>()?;
    if version != INDEX_VERSION {
        return Err(Error::CorruptIndex {
            path: path.to_path_buf(),
            details: format!("unsupported version {version}"),
        });
    }
    Ok(EntryCount::new(cursor.read_u32::<BigEndian>()? as u64))
}

pub fn encode_index_entry(record_id: &str, entry: IndexEntry) -> Result<[u8; INDEX_ENTRY_SIZE as usize]> {
    validate_record_id(record_id)?;
    let mut buf = [0u8; INDEX_ENTRY_SIZE as usize];
    buf[..record_id.len()].copy_from_slice(record_id.as_bytes());
    let mut tail = &mut buf[MAX_RECORD_ID_LEN..];
    tail.write_u64::<BigEndian>(entry.offset.get())?;
    tail.write_u32::<BigEndian>(entry.length.get())?;
    // last 4 bytes reserved
    Ok(buf)
}

/// Decode one fixed-size entry. `None` for an unusable (empty or non-UTF-8) id.
pub fn decode_index_entry(buf: &[u8]) -> Result<Option<(String, IndexEntry)>> {
    let id_field = &buf[..MAX_RECORD_ID_LEN];
    let id_len = id_field.iter().position(|&b| b == 0).unwrap_or(MAX_RECORD_ID_LEN);
    let mut cursor = Cursor::new(&buf[MAX_RECORD_ID_LEN..]);
    let offset = ByteOffset::new(cursor.read_u64::<BigEndian>()?);
    let length = RecordLen::new(cursor.read_u32::<BigEndian>()?);

    if id_len == 0 {
        return Ok(None);
    }
    match std::str::from_utf8(&id_field[..id_len]) {
        Ok(id) => Ok(Some((id.to_string(), IndexEntry { offset, length }))),
        Err(_) => Ok(None),
    }
}

/// Length-prefixed record bytes ready to append to a data file.
pub fn encode_record(payload: &[u8]) -> Result<(RecordLen, BytesMut)> {
    let len = RecordLen::from_payload(payload)?;
    let mut buf = BytesMut::with_capacity(LENGTH_PREFIX_SIZE as usize + payload.len());
    buf.put_u32(len.get());
    buf.put_slice(payload);
    Ok((len, buf))
}

/// Read one record and cross-check its length prefix against the index.
pub fn read_record<F: Read + Seek>(file: &mut F, record_id: &str, entry: IndexEntry) -> Result<Vec<u8>> {
    let truncated = |actual: u32| Error::CorruptRecord {
        record_id: record_id.to_string(),
        expected: entry.length.get(),
        actual,
    };

    file.seek(SeekFrom::Start(entry.offset.get()))?;
    let stored = match file.read_u32::<BigEndian>() {
        Ok(len) => len,
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Err(truncated(0)),
        Err(e) => return Err(e.into()),
    };
    if stored != entry.length.get() {
        return Err(truncated(stored));
    }

    let mut payload = vec![0u8; entry.length.as_usize()];
    match file.read_exact(&mut payload) {
        Ok(()) => Ok(payload),
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => Err(truncated(stored)),
        Err(e) => Err(e.into()),
    }
}

/// Patch the advisory count in place.
pub(crate) fn write_header_count<F: Write + Seek>(file: &mut F, count: EntryCount) -> Result<()> {
    file.seek(SeekFrom::Start(HEADER_COUNT_OFFSET))?;
    file.write_u32::<BigEndian>(count.header_value())?;
    Ok(())
}

/// Result of reading a whole index file.
#[derive(Debug, Clone)]
pub struct IndexScan {
    /// Count stored in the header; may be stale after a crash.
    pub declared: EntryCount,
    /// Count derived from the file size.
    pub valid: EntryCount,
    /// Bytes of a torn trailing entry, if any.
    pub trailing_bytes: u64,
    /// Usable entries in file order.
    pub entries: Vec<(String, IndexEntry)>,
}

/// Read and validate an entire index file.
pub fn scan_index(path: &Path) -> Result<IndexScan> {
    let buf = std::fs::read(path).map_err(|e| Error::io(format!("reading index {path:?}"), e))?;
    scan_index_bytes(path, &buf)
}

pub(crate) fn scan_index_bytes(path: &Path, buf: &[u8]) -> Result<IndexScan> {
    let declared = decode_header(path, buf)?;
    let file_size = buf.len() as u64;
    let valid = EntryCount::from_index_size(file_size);
    let trailing_bytes = file_size - valid.index_file_size();

    if declared != valid {
        warn!(
            "Index {:?}: header declares {} entries, file holds {}",
            path, declared, valid
        );
    }

    let mut entries = Vec::with_capacity(valid.get() as usize);
    for i in 0..valid.get() {
        let start = (INDEX_HEADER_SIZE + i * INDEX_ENTRY_SIZE) as usize;
        let slot = &buf[start..start + INDEX_ENTRY_SIZE as usize];
        match decode_index_entry(slot)? {
            Some(decoded) => entries.push(decoded),
            None => warn!("Index {:?}: skipping unreadable entry #{}", path, i),
        }
    }

    Ok(IndexScan {
        declared,
        valid,
        trailing_bytes,
        entries,
    })
}

pub fn format_day(date: NaiveDate) -> String {
    date.format(DATE_FORMAT).to_string()
}

pub fn parse_day(name: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(name, DATE_FORMAT).ok()
}

pub fn data_path(dir: &Path, date: NaiveDate) -> PathBuf {
    dir.join(format!("{}.{}", format_day(date), DATA_EXTENSION))
}

pub fn index_path(dir: &Path, date: NaiveDate) -> PathBuf {
    dir.join(format!("{}.{}", format_day(date), INDEX_EXTENSION))
}

/// Days that have an index file in `dir`, oldest first.
pub fn list_days(dir: &Path) -> Result<Vec<NaiveDate>> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(Error::io(format!("listing {dir:?}"), e)),
    };

    let mut days = Vec::new();
    for entry in entries {
        let path = entry?.path();
        if path.extension() != Some(std::ffi::OsStr::new(INDEX_EXTENSION)) {
            continue;
        }
        if let Some(day) = path.file_stem().and_then(|s| s.to_str()).and_then(parse_day) {
            days.push(day);
        }
    }
    days.sort();
    Ok(days)
}

/// Length of an open file.
pub(crate) fn file_len(file: &File) -> Result<u64> {
    Ok(file.metadata()?.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_roundtrip() {
        let buf = encode_header(EntryCount::new(42));
        assert_eq!(&buf[0..4], b"TSIX");
        let count = decode_header(Path::new("x.idx"), &buf).unwrap();
        assert_eq!(count.get(), 42);
    }

    #[test]
    fn test_bad_magic_is_corrupt_index() {
        let mut buf = encode_header(EntryCount::new(0));
        buf[0] = b'X';
        let err = decode_header(Path::new("x.idx"), &buf).unwrap_err();
        assert_eq!(err.error_code(), "CORRUPT_INDEX");
    }

    #[test]
    fn test_bad_version_is_corrupt_index() {
        let mut buf = encode_header(EntryCount::new(0));
        buf[5] = 9;
        assert!(decode_header(Path::new("x.idx"), &buf).unwrap_err().is_corruption());
    }

    #[test]
    fn test_short_header_is_corrupt_index() {
        let err = decode_header(Path::new("x.idx"), &[0u8; 6]).unwrap_err();
        assert!(matches!(err, Error::CorruptIndex { .. }));
    }

    #[test]
    fn test_index_entry_layout() {
        let entry = IndexEntry {
            offset: ByteOffset::new(0x0102_0304_0506_0708),
            length: RecordLen::new(0x0A0B_0C0D),
        };
        let buf = encode_index_entry("r1:call_1", entry).unwrap();
        assert_eq!(buf.len(), 144);
        assert_eq!(&buf[..9], b"r1:call_1");
        assert!(buf[9..128].iter().all(|&b| b == 0));
        assert_eq!(&buf[128..136], &[1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(&buf[136..140], &[0x0A, 0x0B, 0x0C, 0x0D]);
        assert_eq!(&buf[140..144], &[0, 0, 0, 0]);

        let (id, decoded) = decode_index_entry(&buf).unwrap().unwrap();
        assert_eq!(id, "r1:call_1");
        assert_eq!(decoded, entry);
    }

    #[test]
    fn test_record_id_limits() {
        assert!(validate_record_id("").is_err());
        assert!(validate_record_id(&"a".repeat(128)).is_ok());
        assert!(validate_record_id(&"a".repeat(129)).is_err());
        assert!(validate_record_id("a\0b").is_err());
    }

    #[test]
    fn test_entry_count_truncates_torn_tail() {
        assert_eq!(EntryCount::from_index_size(0).get(), 0);
        assert_eq!(EntryCount::from_index_size(INDEX_HEADER_SIZE).get(), 0);
        assert_eq!(EntryCount::from_index_size(INDEX_HEADER_SIZE + 144 * 3).get(), 3);
        assert_eq!(EntryCount::from_index_size(INDEX_HEADER_SIZE + 144 * 3 + 100).get(), 3);
        assert_eq!(EntryCount::new(3).index_file_size(), INDEX_HEADER_SIZE + 432);
    }

    #[test]
    fn test_offset_arithmetic() {
        let start = ByteOffset::new(100);
        assert_eq!(start.payload_start(), 104);
        assert_eq!(start.after_record(RecordLen::new(5)), ByteOffset::new(109));
    }

    #[test]
    fn test_record_prefix_check() {
        let (len, bytes) = encode_record(b"hello").unwrap();
        assert_eq!(len.get(), 5);
        let entry = IndexEntry {
            offset: ByteOffset::new(0),
            length: len,
        };

        let mut cursor = Cursor::new(bytes.clone());
        assert_eq!(read_record(&mut cursor, "k", entry).unwrap(), b"hello");

        let mut tampered = bytes;
        tampered[3] = 9;
        let mut cursor = Cursor::new(tampered);
        match read_record(&mut cursor, "k", entry) {
            Err(Error::CorruptRecord { expected, actual, .. }) => {
                assert_eq!(expected, 5);
                assert_eq!(actual, 9);
            }
            other => panic!("expected CorruptRecord, got {other:?}"),
        }
    }

    #[test]
    fn test_day_paths() {
        let day = NaiveDate::from_ymd_opt(2024, 3, 9).unwrap();
        assert_eq!(data_path(Path::new("/d"), day), PathBuf::from("/d/2024-03-09.dat"));
        assert_eq!(index_path(Path::new("/d"), day), PathBuf::from("/d/2024-03-09.idx"));
        assert_eq!(parse_day("2024-03-09"), Some(day));
        assert_eq!(parse_day("latest"), None);
    }
}
