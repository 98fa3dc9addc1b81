//! # Core Types
//!
//! The cached record (`Entry`) and its lightweight in-memory pointer (`EntryIndex`).
//!
//! ```text
//!   Entry (hot buffer / on disk)          EntryIndex (LRU only)
//!   ┌──────────────────────────┐          ┌──────────────────────────┐
//!   │ signature   (large)      │          │ request_id, tool_call_id │
//!   │ reasoning   (large)      │  ──────► │ model, timestamps        │
//!   │ request_id, tool_call_id │          │ signature_prefix (~50B)  │
//!   │ model, timestamps        │          │ date: None = hot         │
//!   └──────────────────────────┘          └──────────────────────────┘
//! ```

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Timestamp type used throughout the system
pub type Timestamp = DateTime<Utc>;

/// Default length of the cached signature prefix, in bytes.
pub const DEFAULT_SIGNATURE_PREFIX_LEN: usize = 50;

/// Build the record key `requestID:toolCallID`.
pub fn record_key(request_id: &str, tool_call_id: &str) -> String {
    let mut key = String::with_capacity(request_id.len() + tool_call_id.len() + 1);
    key.push_str(request_id);
    key.push(':');
    key.push_str(tool_call_id);
    key
}

/// Split a record key at its first `:`.
pub fn split_record_key(key: &str) -> Option<(&str, &str)> {
    let (request_id, tool_call_id) = key.split_once(':')?;
    if request_id.is_empty() || tool_call_id.is_empty() {
        return None;
    }
    Some((request_id, tool_call_id))
}

/// First `max_len` bytes of `signature`, cut back to a char boundary.
pub fn signature_prefix(signature: &str, max_len: usize) -> String {
    if signature.len() <= max_len {
        return signature.to_string();
    }
    let mut end = max_len;
    while !signature.is_char_boundary(end) {
        end -= 1;
    }
    signature[..end].to_string()
}

/// Two prefixes are consistent when the shorter one is a prefix of the longer.
pub fn prefixes_consistent(a: &str, b: &str) -> bool {
    if a.len() <= b.len() {
        b.starts_with(a)
    } else {
        a.starts_with(b)
    }
}

/// A cached thought signature. This is the persisted payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    pub signature: String,
    #[serde(default)]
    pub reasoning: String,
    #[serde(rename = "requestID")]
    pub request_id: String,
    #[serde(rename = "toolCallID")]
    pub tool_call_id: String,
    #[serde(default)]
    pub model: String,
    #[serde(rename = "createdAt")]
    pub created_at: Timestamp,
    #[serde(rename = "lastAccess")]
    pub last_access: Timestamp,
}

impl Entry {
    pub fn new(
        request_id: impl Into<String>,
        tool_call_id: impl Into<String>,
        signature: impl Into<String>,
        reasoning: impl Into<String>,
        model: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            signature: signature.into(),
            reasoning: reasoning.into(),
            request_id: request_id.into(),
            tool_call_id: tool_call_id.into(),
            model: model.into(),
            created_at: now,
            last_access: now,
        }
    }

    pub fn key(&self) -> String {
        record_key(&self.request_id, &self.tool_call_id)
    }

    /// Entries missing any identifying field or the signature are never stored or served.
    pub fn is_valid(&self) -> bool {
        !self.signature.is_empty() && !self.request_id.is_empty() && !self.tool_call_id.is_empty()
    }

    /// Whether `other` is the very same write (not a later overwrite of the same key).
    pub fn same_write(&self, other: &Entry) -> bool {
        self.created_at == other.created_at && self.signature == other.signature
    }
}

/// In-memory pointer to an `Entry`. Never carries signature or reasoning text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryIndex {
    pub request_id: String,
    pub tool_call_id: String,
    pub model: String,
    pub created_at: Timestamp,
    pub last_access: Timestamp,
    /// Empty when unknown (e.g. rebuilt from index files at startup).
    pub signature_prefix: String,
    /// Day whose files hold the record. `None` while the entry is still hot.
    pub date: Option<NaiveDate>,
}

impl EntryIndex {
    /// Pointer for an entry that lives only in the hot buffer.
    pub fn hot(entry: &Entry, prefix_len: usize) -> Self {
        Self {
            request_id: entry.request_id.clone(),
            tool_call_id: entry.tool_call_id.clone(),
            model: entry.model.clone(),
            created_at: entry.created_at,
            last_access: entry.last_access,
            signature_prefix: signature_prefix(&entry.signature, prefix_len),
            date: None,
        }
    }

    /// Pointer for an entry persisted in `date`'s files.
    pub fn persisted(entry: &Entry, prefix_len: usize, date: NaiveDate) -> Self {
        Self {
            date: Some(date),
            ..Self::hot(entry, prefix_len)
        }
    }

    /// Pointer rebuilt from a bare record id found in an index file.
    pub fn recovered(request_id: &str, tool_call_id: &str, date: NaiveDate) -> Self {
        let day_start = date
            .and_hms_opt(0, 0, 0)
            .map(|dt| dt.and_utc())
            .unwrap_or_else(Utc::now);
        Self {
            request_id: request_id.to_string(),
            tool_call_id: tool_call_id.to_string(),
            model: String::new(),
            created_at: day_start,
            last_access: day_start,
            signature_prefix: String::new(),
            date: Some(date),
        }
    }

    pub fn key(&self) -> String {
        record_key(&self.request_id, &self.tool_call_id)
    }

    pub fn is_hot(&self) -> bool {
        self.date.is_none()
    }
}
