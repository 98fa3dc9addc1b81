//! Payload codec for persisted entries.
//!
//! Records are stored as JSON so recovery tooling can read day files without
//! this crate. Field names (`requestID`, `toolCallID`, `createdAt`, ...) are part
//! of the on-disk contract.

use crate::{error::Result, Entry};

/// Serialize an entry to its on-disk payload
#[inline]
pub fn encode_entry(entry: &Entry) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(entry)?)
}

/// Deserialize an on-disk payload
#[inline]
pub fn decode_entry(bytes: &[u8]) -> Result<Entry> {
    Ok(serde_json::from_slice(bytes)?)
}
