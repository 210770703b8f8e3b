//! Viewport planning over cached tile memberships.
//!
//! A viewport is covered by sampling its four corners and its center,
//! taking the geohash cell of each at the zoom's precision, and adding the
//! eight neighbors of every sampled cell. The result over-covers the
//! viewport, which is cheap compared to a missed cell.
//!
//! Entries hold only place identifiers. Expiry is decided here on read;
//! the store keeps expired entries until a sweep removes them.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use morsel_core::{precision_for_zoom, Bounds, Clock, PlaceId, StorageError, TileEntry};
use morsel_storage::TileStore;
use serde::Serialize;

use crate::geohash::TileKey;

/// Every tile needed to cover `bounds` at `zoom`.
///
/// Always contains the tile holding the center of `bounds`. Sample points
/// outside the valid coordinate ranges are skipped.
pub fn tile_keys_for_bounds(bounds: &Bounds, zoom: u8) -> BTreeSet<TileKey> {
    let precision = precision_for_zoom(zoom);
    let center = bounds.center();
    let samples = bounds.corners().into_iter().chain(std::iter::once(center));

    let mut keys = BTreeSet::new();
    for point in samples.filter(|point| point.is_valid()) {
        let Ok(cell) = TileKey::containing(point, precision) else {
            continue;
        };
        keys.extend(cell.neighbors());
        keys.insert(cell);
    }
    keys
}

/// A tile whose membership is known and unexpired.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CachedTile {
    pub tile_key: String,
    pub entity_ids: BTreeSet<PlaceId>,
}

/// A tile that must be fetched from upstream.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UncachedTile {
    #[serde(serialize_with = "serialize_display")]
    pub tile_key: TileKey,
    pub bounds: Bounds,
}

fn serialize_display<S: serde::Serializer>(key: &TileKey, s: S) -> Result<S::Ok, S::Error> {
    s.collect_str(key)
}

/// Split of a viewport's tiles into known and unknown.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ViewportPlan {
    pub cached: Vec<CachedTile>,
    pub uncached: Vec<UncachedTile>,
}

impl ViewportPlan {
    /// Union of every cached tile's identifiers.
    pub fn cached_ids(&self) -> BTreeSet<PlaceId> {
        self.cached
            .iter()
            .flat_map(|tile| tile.entity_ids.iter().cloned())
            .collect()
    }
}

/// Tile cache hit/miss counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TileIndexStats {
    pub hits: u64,
    pub misses: u64,
}

impl TileIndexStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// Spatial tile index over a tile store.
pub struct TileIndex<S> {
    store: Arc<S>,
    clock: Arc<dyn Clock>,
    default_ttl: Duration,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl<S: TileStore> TileIndex<S> {
    pub fn new(store: Arc<S>, clock: Arc<dyn Clock>, default_ttl: Duration) -> Self {
        Self {
            store,
            clock,
            default_ttl,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    /// Classify every tile covering `bounds` as cached or uncached.
    ///
    /// Missing, expired, and unreadable entries are all uncached. Only a
    /// backend failure is returned as an error.
    pub async fn plan_viewport(
        &self,
        bounds: &Bounds,
        zoom: u8,
    ) -> Result<ViewportPlan, StorageError> {
        let keys: Vec<TileKey> = tile_keys_for_bounds(bounds, zoom).into_iter().collect();
        let encoded: Vec<String> = keys.iter().map(ToString::to_string).collect();
        let now = self.clock.now();
        let lookups = self.store.get_tiles(&encoded).await;

        let mut plan = ViewportPlan::default();
        for ((key, encoded), lookup) in keys.into_iter().zip(encoded).zip(lookups) {
            let entry = match lookup {
                Ok(entry) => entry,
                Err(StorageError::Corrupt { reason, .. }) => {
                    tracing::debug!(
                        tile_key = %encoded,
                        reason = %reason,
                        "Unreadable tile entry, refetching"
                    );
                    None
                }
                Err(e) => return Err(e),
            };

            match entry {
                Some(entry) if entry.tile_key == encoded && !entry.is_expired(now) => {
                    plan.cached.push(CachedTile {
                        tile_key: encoded,
                        entity_ids: entry.entity_ids,
                    });
                }
                _ => plan.uncached.push(UncachedTile {
                    bounds: key.bounds(),
                    tile_key: key,
                }),
            }
        }

        self.hits
            .fetch_add(plan.cached.len() as u64, Ordering::Relaxed);
        self.misses
            .fetch_add(plan.uncached.len() as u64, Ordering::Relaxed);

        Ok(plan)
    }

    /// Record the identifiers observed in a tile, replacing any previous
    /// entry. An empty set is stored as a valid "nothing here" result.
    ///
    /// A malformed tile key is skipped without error.
    pub async fn write_tile(
        &self,
        tile_key: &str,
        zoom: u8,
        entity_ids: impl IntoIterator<Item = PlaceId>,
        ttl: Duration,
    ) -> Result<(), StorageError> {
        let key = match TileKey::parse(tile_key) {
            Ok(key) => key,
            Err(e) => {
                tracing::debug!(tile_key, error = %e, "Skipping write for malformed tile key");
                return Ok(());
            }
        };

        let expires_at = self.clock.now() + chrono::Duration::milliseconds(ttl.as_millis() as i64);
        let entry = TileEntry::new(key.to_string(), zoom, entity_ids, expires_at);
        self.store.put_tile(&entry).await
    }

    /// Delete entries that have expired.
    pub async fn purge_expired(&self) -> Result<u64, StorageError> {
        self.store.purge_expired_tiles(self.clock.now()).await
    }

    pub fn stats(&self) -> TileIndexStats {
        TileIndexStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }
}
