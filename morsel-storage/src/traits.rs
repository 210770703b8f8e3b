//! Store traits for rate windows and tile memberships.
//!
//! Both stores may be shared across processes. The only cross-caller
//! coordination the gate needs is a per-key atomic read-modify-write on
//! rate windows; tiles are last-write-wins.

use async_trait::async_trait;
use morsel_core::{RateKey, RateWindowRecord, StorageError, TileEntry, Timestamp};

/// What an atomic window update writes back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowWrite {
    /// Leave the stored record untouched.
    Keep,
    /// Replace (or create) the stored record.
    Put(RateWindowRecord),
}

/// Backing store for rate windows.
///
/// # Atomicity
///
/// `update` must run `apply` and persist its result as one atomic step per
/// key: no other `update` on the same key may observe the record between
/// the read and the write. Implementations get this from a per-key lock
/// (in-process) or a serialized write transaction (shared store).
#[async_trait]
pub trait RateWindowStore: Send + Sync {
    /// Read a record without modifying it.
    async fn load(&self, key: &RateKey) -> Result<Option<RateWindowRecord>, StorageError>;

    /// Atomically read, decide, and write a record.
    ///
    /// `apply` sees the current record (or `None`) and returns what to write
    /// plus a value handed back to the caller. It runs under the key's lock
    /// and must not block.
    async fn update<F, R>(&self, key: &RateKey, apply: F) -> Result<R, StorageError>
    where
        F: FnOnce(Option<RateWindowRecord>) -> (WindowWrite, R) + Send,
        R: Send;

    /// Delete records whose window started before `cutoff`.
    async fn purge_windows_before(&self, cutoff: Timestamp) -> Result<u64, StorageError>;

    /// Number of stored records, expired or not.
    async fn window_count(&self) -> Result<u64, StorageError>;
}

/// Backing store for tile memberships.
#[async_trait]
pub trait TileStore: Send + Sync {
    /// Read a tile entry regardless of expiry. Expiry is the caller's call.
    async fn get_tile(&self, tile_key: &str) -> Result<Option<TileEntry>, StorageError>;

    /// Read several tiles. Each slot carries its own result so one corrupt
    /// entry does not hide the others.
    async fn get_tiles(
        &self,
        tile_keys: &[String],
    ) -> Vec<Result<Option<TileEntry>, StorageError>> {
        let mut results = Vec::with_capacity(tile_keys.len());
        for key in tile_keys {
            results.push(self.get_tile(key).await);
        }
        results
    }

    /// Insert or overwrite a tile entry.
    async fn put_tile(&self, entry: &TileEntry) -> Result<(), StorageError>;

    /// Delete tiles whose `expires_at` is at or before `now`.
    async fn purge_expired_tiles(&self, now: Timestamp) -> Result<u64, StorageError>;

    /// Number of stored tiles, expired or not.
    async fn tile_count(&self) -> Result<u64, StorageError>;
}
