//! Byte layouts for the shared store.
//!
//! Rate window: `[window_start_ms: i64 LE][count: u32 LE]`, 12 bytes.
//! Tile entry: `[expires_at_ms: i64 LE][json TileEntry]`. The expiry prefix
//! lets a purge decide without decoding the body.

use chrono::{DateTime, TimeZone, Utc};
use morsel_core::{RateWindowRecord, StorageError, TileEntry};

pub const WINDOW_RECORD_LEN: usize = 12;
const TIMESTAMP_LEN: usize = 8;

pub fn encode_window(record: &RateWindowRecord) -> [u8; WINDOW_RECORD_LEN] {
    let mut bytes = [0u8; WINDOW_RECORD_LEN];
    bytes[0..8].copy_from_slice(&record.window_start.timestamp_millis().to_le_bytes());
    bytes[8..12].copy_from_slice(&record.count.to_le_bytes());
    bytes
}

pub fn decode_window(key: &str, bytes: &[u8]) -> Result<RateWindowRecord, StorageError> {
    if bytes.len() != WINDOW_RECORD_LEN {
        return Err(corrupt(key, format!("expected 12 bytes, got {}", bytes.len())));
    }
    let window_start = read_timestamp(key, bytes)?;
    let count_bytes: [u8; 4] = bytes[8..12]
        .try_into()
        .map_err(|_| corrupt(key, "invalid count"))?;
    Ok(RateWindowRecord {
        window_start,
        count: u32::from_le_bytes(count_bytes),
    })
}

pub fn encode_tile(entry: &TileEntry) -> Result<Vec<u8>, StorageError> {
    let body = serde_json::to_vec(entry).map_err(|e| StorageError::Serialization {
        reason: e.to_string(),
    })?;
    let mut bytes = Vec::with_capacity(TIMESTAMP_LEN + body.len());
    bytes.extend_from_slice(&entry.expires_at.timestamp_millis().to_le_bytes());
    bytes.extend_from_slice(&body);
    Ok(bytes)
}

pub fn decode_tile(key: &str, bytes: &[u8]) -> Result<TileEntry, StorageError> {
    if bytes.len() < TIMESTAMP_LEN {
        return Err(corrupt(key, "missing expiry prefix"));
    }
    serde_json::from_slice(&bytes[TIMESTAMP_LEN..]).map_err(|e| corrupt(key, e.to_string()))
}

/// Expiry of an encoded tile without decoding its body.
pub fn tile_expiry(key: &str, bytes: &[u8]) -> Result<DateTime<Utc>, StorageError> {
    read_timestamp(key, bytes)
}

fn read_timestamp(key: &str, bytes: &[u8]) -> Result<DateTime<Utc>, StorageError> {
    let prefix: [u8; 8] = bytes
        .get(0..TIMESTAMP_LEN)
        .and_then(|slice| slice.try_into().ok())
        .ok_or_else(|| corrupt(key, "missing timestamp"))?;
    Utc.timestamp_millis_opt(i64::from_le_bytes(prefix))
        .single()
        .ok_or_else(|| corrupt(key, "timestamp out of range"))
}

fn corrupt(key: &str, reason: impl Into<String>) -> StorageError {
    StorageError::Corrupt {
        key: key.to_string(),
        reason: reason.into(),
    }
}
