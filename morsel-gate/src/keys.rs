//! Canonical coalescing keys.
//!
//! Two requests that would get the same answer from the provider must
//! produce the same key. Inputs are normalized (trimmed, lowercased,
//! whitespace collapsed) and the per-session bundling token is never part of
//! a key, so two sessions asking the same question still share one call.
//!
//! Location bias is rounded to `BIAS_KEY_DECIMALS` places (about 1.1 km at
//! two decimals). That rounding exists only for request dedup; viewport
//! caching uses geohash tiles instead.

use std::fmt;

use morsel_core::constants::BIAS_KEY_DECIMALS;
use morsel_core::{AutocompleteRequest, DetailRequest, FieldMask, LatLng, TextSearchRequest};

use crate::geohash::TileKey;

/// An opaque, content-addressed coalescing key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CoalesceKey(String);

impl CoalesceKey {
    /// `details:{place}:{mask}:{language}:{region}`
    pub fn details(request: &DetailRequest) -> Self {
        Self(format!(
            "details:{}:{}:{}:{}",
            request.place_id.as_str().trim(),
            request.fields,
            normalize(&request.language),
            normalize(&request.region),
        ))
    }

    /// `tile:{tile_key}:{mask}`
    pub fn tile(tile_key: &TileKey, mask: FieldMask) -> Self {
        Self(format!("tile:{}:{}", tile_key, mask))
    }

    /// `autocomplete:{input}:{bias}:{language}`
    pub fn autocomplete(request: &AutocompleteRequest) -> Self {
        Self(format!(
            "autocomplete:{}:{}:{}",
            normalize(&request.input),
            bias_component(request.bias),
            normalize(&request.language),
        ))
    }

    /// `text_search:{query}:{bias}:{language}`
    pub fn text_search(request: &TextSearchRequest) -> Self {
        Self(format!(
            "text_search:{}:{}:{}",
            normalize(&request.query),
            bias_component(request.bias),
            normalize(&request.language),
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CoalesceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Trim, lowercase, and collapse internal whitespace.
pub fn normalize(input: &str) -> String {
    input
        .split_whitespace()
        .map(str::to_lowercase)
        .collect::<Vec<_>>()
        .join(" ")
}

fn bias_component(bias: Option<LatLng>) -> String {
    match bias {
        Some(point) => {
            let rounded = point.rounded(BIAS_KEY_DECIMALS);
            let places = BIAS_KEY_DECIMALS as usize;
            // Adding 0.0 folds -0.0 into 0.0 so both print the same.
            format!(
                "{:.*},{:.*}",
                places,
                rounded.lat + 0.0,
                places,
                rounded.lng + 0.0
            )
        }
        None => "-".to_string(),
    }
}
