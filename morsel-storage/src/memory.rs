//! In-process store backed by `DashMap`.
//!
//! DashMap's entry API holds the shard lock for the duration of the
//! closure, which gives `update` its per-key atomicity without a global
//! lock. Suitable for single-process deployments and tests.

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use morsel_core::{RateKey, RateWindowRecord, StorageError, TileEntry, Timestamp};

use crate::traits::{RateWindowStore, TileStore, WindowWrite};

/// In-memory rate window and tile store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    windows: DashMap<String, RateWindowRecord>,
    tiles: DashMap<String, TileEntry>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RateWindowStore for MemoryStore {
    async fn load(&self, key: &RateKey) -> Result<Option<RateWindowRecord>, StorageError> {
        Ok(self.windows.get(key.as_str()).map(|r| *r.value()))
    }

    async fn update<F, R>(&self, key: &RateKey, apply: F) -> Result<R, StorageError>
    where
        F: FnOnce(Option<RateWindowRecord>) -> (WindowWrite, R) + Send,
        R: Send,
    {
        let outcome = match self.windows.entry(key.as_str().to_string()) {
            Entry::Occupied(mut occupied) => {
                let (write, outcome) = apply(Some(*occupied.get()));
                if let WindowWrite::Put(record) = write {
                    *occupied.get_mut() = record;
                }
                outcome
            }
            Entry::Vacant(vacant) => {
                let (write, outcome) = apply(None);
                if let WindowWrite::Put(record) = write {
                    vacant.insert(record);
                }
                outcome
            }
        };
        Ok(outcome)
    }

    async fn purge_windows_before(&self, cutoff: Timestamp) -> Result<u64, StorageError> {
        let mut purged = 0u64;
        self.windows.retain(|_, record| {
            let keep = record.window_start >= cutoff;
            if !keep {
                purged += 1;
            }
            keep
        });
        Ok(purged)
    }

    async fn window_count(&self) -> Result<u64, StorageError> {
        Ok(self.windows.len() as u64)
    }
}

#[async_trait]
impl TileStore for MemoryStore {
    async fn get_tile(&self, tile_key: &str) -> Result<Option<TileEntry>, StorageError> {
        Ok(self.tiles.get(tile_key).map(|e| e.value().clone()))
    }

    async fn put_tile(&self, entry: &TileEntry) -> Result<(), StorageError> {
        self.tiles.insert(entry.tile_key.clone(), entry.clone());
        Ok(())
    }

    async fn purge_expired_tiles(&self, now: Timestamp) -> Result<u64, StorageError> {
        let mut purged = 0u64;
        self.tiles.retain(|_, entry| {
            let keep = !entry.is_expired(now);
            if !keep {
                purged += 1;
            }
            keep
        });
        Ok(purged)
    }

    async fn tile_count(&self) -> Result<u64, StorageError> {
        Ok(self.tiles.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use morsel_core::{Action, Actor, PlaceId};
    use std::sync::Arc;

    fn at(millis: i64) -> Timestamp {
        Utc.timestamp_millis_opt(millis).single().unwrap()
    }

    fn increment(current: Option<RateWindowRecord>) -> (WindowWrite, u32) {
        let next = match current {
            Some(record) => RateWindowRecord {
                count: record.count + 1,
                ..record
            },
            None => RateWindowRecord::open(at(0)),
        };
        (WindowWrite::Put(next), next.count)
    }

    #[tokio::test]
    async fn test_update_creates_then_increments() {
        let store = MemoryStore::new();
        let key = RateKey::new(&Actor::user("u1"), Action::Search);

        assert_eq!(store.update(&key, increment).await.unwrap(), 1);
        assert_eq!(store.update(&key, increment).await.unwrap(), 2);
        assert_eq!(store.load(&key).await.unwrap().unwrap().count, 2);
    }

    #[tokio::test]
    async fn test_update_keep_does_not_write() {
        let store = MemoryStore::new();
        let key = RateKey::new(&Actor::user("u1"), Action::Search);

        store
            .update(&key, |_| (WindowWrite::Keep, ()))
            .await
            .unwrap();
        assert!(store.load(&key).await.unwrap().is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_updates_do_not_lose_increments() {
        let store = Arc::new(MemoryStore::new());
        let key = RateKey::new(&Actor::user("u1"), Action::Search);

        let mut handles = Vec::new();
        for _ in 0..64 {
            let store = Arc::clone(&store);
            let key = key.clone();
            handles.push(tokio::spawn(async move {
                store.update(&key, increment).await.unwrap()
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(store.load(&key).await.unwrap().unwrap().count, 64);
    }

    #[tokio::test]
    async fn test_purge_windows_before_cutoff() {
        let store = MemoryStore::new();
        let old = RateKey::new(&Actor::user("old"), Action::Search);
        let fresh = RateKey::new(&Actor::user("fresh"), Action::Search);

        store
            .update(&old, |_| (WindowWrite::Put(RateWindowRecord::open(at(0))), ()))
            .await
            .unwrap();
        store
            .update(&fresh, |_| {
                (WindowWrite::Put(RateWindowRecord::open(at(10_000))), ())
            })
            .await
            .unwrap();

        assert_eq!(store.purge_windows_before(at(5_000)).await.unwrap(), 1);
        assert_eq!(store.window_count().await.unwrap(), 1);
        assert!(store.load(&fresh).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_tiles_overwrite_and_purge() {
        let store = MemoryStore::new();
        let entry = TileEntry::new("g6:9q8yyk", 13, vec![PlaceId::new("a")], at(1_000));
        store.put_tile(&entry).await.unwrap();

        let empty = TileEntry::new("g6:9q8yyk", 13, Vec::new(), at(2_000));
        store.put_tile(&empty).await.unwrap();
        assert_eq!(store.get_tile("g6:9q8yyk").await.unwrap(), Some(empty));

        assert_eq!(store.purge_expired_tiles(at(1_500)).await.unwrap(), 0);
        assert_eq!(store.purge_expired_tiles(at(2_000)).await.unwrap(), 1);
        assert_eq!(store.tile_count().await.unwrap(), 0);
    }
}
