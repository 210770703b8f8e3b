//! Stored records: rate windows and tile memberships.
//!
//! Both are lazily expired. Staleness is decided on read against the
//! caller's clock; sweeps only reclaim space.

use crate::{PlaceId, Timestamp};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::time::Duration;

/// Counter for one `actorKind:actorId:action` key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateWindowRecord {
    pub window_start: Timestamp,
    pub count: u32,
}

impl RateWindowRecord {
    /// A new window opened by its first call.
    pub fn open(now: Timestamp) -> Self {
        Self {
            window_start: now,
            count: 1,
        }
    }

    /// Whether `now` has reached the end of this window.
    pub fn is_expired(&self, now: Timestamp, window: Duration) -> bool {
        let elapsed = now.signed_duration_since(self.window_start);
        elapsed.num_milliseconds() >= window.as_millis() as i64
    }

    /// Instant at which this window ends.
    pub fn resets_at(&self, window: Duration) -> Timestamp {
        self.window_start + chrono::Duration::milliseconds(window.as_millis() as i64)
    }
}

/// Which places were observed in one tile.
///
/// Holds only opaque identifiers. An empty set is a valid "checked, nothing
/// here" result and counts as cached until it expires.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TileEntry {
    pub tile_key: String,
    pub zoom: u8,
    pub entity_ids: BTreeSet<PlaceId>,
    pub expires_at: Timestamp,
}

impl TileEntry {
    pub fn new(
        tile_key: impl Into<String>,
        zoom: u8,
        entity_ids: impl IntoIterator<Item = PlaceId>,
        expires_at: Timestamp,
    ) -> Self {
        Self {
            tile_key: tile_key.into(),
            zoom,
            entity_ids: entity_ids.into_iter().collect(),
            expires_at,
        }
    }

    pub fn is_expired(&self, now: Timestamp) -> bool {
        now >= self.expires_at
    }
}
