//! LMDB-backed shared store.
//!
//! Uses the heed crate (Rust bindings for LMDB) so rate windows and tile
//! memberships survive restarts and can be shared by every process on the
//! host that opens the same directory.
//!
//! # Concurrency
//!
//! LMDB allows one write transaction at a time across all processes using
//! the environment. `update` reads, decides, and writes inside a single
//! write transaction, so the read-check-increment on a rate window cannot
//! lose an update even when several processes share an actor.
//!
//! Reads use read transactions and never block writers.

use std::path::Path;

use async_trait::async_trait;
use heed::types::Bytes;
use heed::{Database, Env, EnvOpenOptions};
use morsel_core::{RateKey, RateWindowRecord, StorageError, TileEntry, Timestamp};

use crate::codec::{decode_tile, decode_window, encode_tile, encode_window, tile_expiry};
use crate::traits::{RateWindowStore, TileStore, WindowWrite};

const WINDOWS_DB: &str = "rate_windows";
const TILES_DB: &str = "tiles";

/// Error type for opening the LMDB store.
#[derive(Debug, thiserror::Error)]
pub enum LmdbStoreError {
    /// Failed to open or create the LMDB environment.
    #[error("Failed to open LMDB environment: {0}")]
    EnvOpen(String),

    /// Failed to open a database within the environment.
    #[error("Failed to open database {name}: {reason}")]
    DbOpen { name: &'static str, reason: String },

    /// Transaction error.
    #[error("Transaction error: {0}")]
    Transaction(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<LmdbStoreError> for StorageError {
    fn from(e: LmdbStoreError) -> Self {
        StorageError::Backend {
            reason: e.to_string(),
        }
    }
}

fn txn_error(e: heed::Error) -> StorageError {
    StorageError::Backend {
        reason: e.to_string(),
    }
}

/// Rate window and tile store in one LMDB environment.
///
/// # Example
///
/// ```ignore
/// let store = LmdbStore::open("/var/lib/morsel", 64)?;
/// let limiter = RateLimiter::new(Arc::new(store), table, clock);
/// ```
pub struct LmdbStore {
    env: Env,
    windows: Database<Bytes, Bytes>,
    tiles: Database<Bytes, Bytes>,
}

impl LmdbStore {
    /// Open (or create) the store.
    ///
    /// # Arguments
    ///
    /// * `path` - Directory holding the LMDB files
    /// * `max_size_mb` - Map size in megabytes
    pub fn open<P: AsRef<Path>>(path: P, max_size_mb: usize) -> Result<Self, LmdbStoreError> {
        std::fs::create_dir_all(&path)?;

        // SAFETY: the environment is opened once per process for this path;
        // the store owns it for its whole lifetime.
        let env = unsafe {
            EnvOpenOptions::new()
                .map_size(max_size_mb * 1024 * 1024)
                .max_dbs(2)
                .open(path.as_ref())
        }
        .map_err(|e| LmdbStoreError::EnvOpen(e.to_string()))?;

        let mut wtxn = env
            .write_txn()
            .map_err(|e| LmdbStoreError::Transaction(e.to_string()))?;

        let windows: Database<Bytes, Bytes> = env
            .create_database(&mut wtxn, Some(WINDOWS_DB))
            .map_err(|e| LmdbStoreError::DbOpen {
                name: WINDOWS_DB,
                reason: e.to_string(),
            })?;

        let tiles: Database<Bytes, Bytes> = env
            .create_database(&mut wtxn, Some(TILES_DB))
            .map_err(|e| LmdbStoreError::DbOpen {
                name: TILES_DB,
                reason: e.to_string(),
            })?;

        wtxn.commit()
            .map_err(|e| LmdbStoreError::Transaction(e.to_string()))?;

        Ok(Self {
            env,
            windows,
            tiles,
        })
    }
}

#[async_trait]
impl RateWindowStore for LmdbStore {
    async fn load(&self, key: &RateKey) -> Result<Option<RateWindowRecord>, StorageError> {
        let rtxn = self.env.read_txn().map_err(txn_error)?;
        match self.windows.get(&rtxn, key.as_str().as_bytes()) {
            Ok(Some(bytes)) => decode_window(key.as_str(), bytes).map(Some),
            Ok(None) => Ok(None),
            Err(e) => Err(txn_error(e)),
        }
    }

    async fn update<F, R>(&self, key: &RateKey, apply: F) -> Result<R, StorageError>
    where
        F: FnOnce(Option<RateWindowRecord>) -> (WindowWrite, R) + Send,
        R: Send,
    {
        let mut wtxn = self.env.write_txn().map_err(txn_error)?;

        // A corrupt record is treated as absent and overwritten by this update.
        let current = self
            .windows
            .get(&wtxn, key.as_str().as_bytes())
            .map_err(txn_error)?
            .and_then(|bytes| decode_window(key.as_str(), bytes).ok());

        let (write, outcome) = apply(current);

        match write {
            WindowWrite::Put(record) => {
                self.windows
                    .put(&mut wtxn, key.as_str().as_bytes(), &encode_window(&record))
                    .map_err(txn_error)?;
                wtxn.commit().map_err(txn_error)?;
            }
            WindowWrite::Keep => wtxn.abort(),
        }

        Ok(outcome)
    }

    async fn purge_windows_before(&self, cutoff: Timestamp) -> Result<u64, StorageError> {
        let mut wtxn = self.env.write_txn().map_err(txn_error)?;

        let mut stale = Vec::new();
        for item in self.windows.iter(&wtxn).map_err(txn_error)? {
            let (key, bytes) = item.map_err(txn_error)?;
            let key_str = String::from_utf8_lossy(key);
            match decode_window(&key_str, bytes) {
                Ok(record) if record.window_start >= cutoff => {}
                // Old and unreadable records are both reclaimed.
                _ => stale.push(key.to_vec()),
            }
        }

        let mut purged = 0u64;
        for key in &stale {
            if self.windows.delete(&mut wtxn, key).map_err(txn_error)? {
                purged += 1;
            }
        }

        wtxn.commit().map_err(txn_error)?;
        Ok(purged)
    }

    async fn window_count(&self) -> Result<u64, StorageError> {
        let rtxn = self.env.read_txn().map_err(txn_error)?;
        self.windows.len(&rtxn).map_err(txn_error)
    }
}

#[async_trait]
impl TileStore for LmdbStore {
    async fn get_tile(&self, tile_key: &str) -> Result<Option<TileEntry>, StorageError> {
        let rtxn = self.env.read_txn().map_err(txn_error)?;
        match self.tiles.get(&rtxn, tile_key.as_bytes()) {
            Ok(Some(bytes)) => decode_tile(tile_key, bytes).map(Some),
            Ok(None) => Ok(None),
            Err(e) => Err(txn_error(e)),
        }
    }

    async fn get_tiles(
        &self,
        tile_keys: &[String],
    ) -> Vec<Result<Option<TileEntry>, StorageError>> {
        let rtxn = match self.env.read_txn() {
            Ok(rtxn) => rtxn,
            Err(e) => {
                let err = txn_error(e);
                return tile_keys.iter().map(|_| Err(err.clone())).collect();
            }
        };

        tile_keys
            .iter()
            .map(|key| match self.tiles.get(&rtxn, key.as_bytes()) {
                Ok(Some(bytes)) => decode_tile(key, bytes).map(Some),
                Ok(None) => Ok(None),
                Err(e) => Err(txn_error(e)),
            })
            .collect()
    }

    async fn put_tile(&self, entry: &TileEntry) -> Result<(), StorageError> {
        let bytes = encode_tile(entry)?;

        let mut wtxn = self.env.write_txn().map_err(txn_error)?;
        self.tiles
            .put(&mut wtxn, entry.tile_key.as_bytes(), &bytes)
            .map_err(txn_error)?;
        wtxn.commit().map_err(txn_error)?;

        Ok(())
    }

    async fn purge_expired_tiles(&self, now: Timestamp) -> Result<u64, StorageError> {
        let mut wtxn = self.env.write_txn().map_err(txn_error)?;

        let mut expired = Vec::new();
        for item in self.tiles.iter(&wtxn).map_err(txn_error)? {
            let (key, bytes) = item.map_err(txn_error)?;
            let key_str = String::from_utf8_lossy(key);
            match tile_expiry(&key_str, bytes) {
                Ok(expires_at) if now < expires_at => {}
                _ => expired.push(key.to_vec()),
            }
        }

        let mut purged = 0u64;
        for key in &expired {
            if self.tiles.delete(&mut wtxn, key).map_err(txn_error)? {
                purged += 1;
            }
        }

        wtxn.commit().map_err(txn_error)?;
        Ok(purged)
    }

    async fn tile_count(&self) -> Result<u64, StorageError> {
        let rtxn = self.env.read_txn().map_err(txn_error)?;
        self.tiles.len(&rtxn).map_err(txn_error)
    }
}
