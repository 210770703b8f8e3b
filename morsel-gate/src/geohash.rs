//! Geohash encoding, decoding, and neighbors.
//!
//! A geohash bisects the longitude and latitude ranges alternately,
//! longitude first, one bit per step. Every five bits become one character
//! of the base32 alphabet below. Longer hashes name smaller cells.
//!
//! Tiles are addressed by a precision-tagged key, `g{precision}:{hash}`, so
//! cells of different precisions never share a store key.

use std::fmt;
use std::str::FromStr;

use morsel_core::constants::NEIGHBOR_STEP_FRACTION;
use morsel_core::geo::{MAX_LAT, MAX_LNG, MIN_LAT, MIN_LNG};
use morsel_core::{Bounds, GeohashError, LatLng};

const BASE32: &[u8; 32] = b"0123456789bcdefghjkmnpqrstuvwxyz";

/// Longest supported hash. Twelve characters is a cell a few centimeters
/// across.
pub const MAX_PRECISION: usize = 12;

const BITS_PER_CHAR: u32 = 5;

fn check_precision(precision: usize) -> Result<(), GeohashError> {
    if (1..=MAX_PRECISION).contains(&precision) {
        Ok(())
    } else {
        Err(GeohashError::InvalidPrecision(precision))
    }
}

/// Encode a point at `precision` characters.
///
/// Coordinates outside the valid ranges land in the edge cell on that side.
pub fn encode(point: LatLng, precision: usize) -> Result<String, GeohashError> {
    check_precision(precision)?;

    let mut lat = (MIN_LAT, MAX_LAT);
    let mut lng = (MIN_LNG, MAX_LNG);
    let mut hash = String::with_capacity(precision);
    let mut even = true;
    let mut bits = 0usize;
    let mut bit_count = 0;

    while hash.len() < precision {
        let (range, value) = if even {
            (&mut lng, point.lng)
        } else {
            (&mut lat, point.lat)
        };
        let mid = (range.0 + range.1) / 2.0;
        bits <<= 1;
        if value >= mid {
            bits |= 1;
            range.0 = mid;
        } else {
            range.1 = mid;
        }
        even = !even;
        bit_count += 1;

        if bit_count == BITS_PER_CHAR {
            hash.push(BASE32[bits] as char);
            bits = 0;
            bit_count = 0;
        }
    }

    Ok(hash)
}

/// Rectangle covered by a hash.
pub fn decode_bounds(hash: &str) -> Result<Bounds, GeohashError> {
    check_precision(hash.len())?;

    let mut lat = (MIN_LAT, MAX_LAT);
    let mut lng = (MIN_LNG, MAX_LNG);
    let mut even = true;

    for c in hash.chars() {
        let lower = c.to_ascii_lowercase();
        let index = BASE32
            .iter()
            .position(|&symbol| symbol as char == lower)
            .ok_or(GeohashError::InvalidCharacter(c))?;

        for shift in (0..BITS_PER_CHAR).rev() {
            let bit = (index >> shift) & 1;
            let range = if even { &mut lng } else { &mut lat };
            let mid = (range.0 + range.1) / 2.0;
            if bit == 1 {
                range.0 = mid;
            } else {
                range.1 = mid;
            }
            even = !even;
        }
    }

    Ok(Bounds::new(lat.1, lat.0, lng.1, lng.0))
}

/// Center of the cell named by a hash.
pub fn decode(hash: &str) -> Result<LatLng, GeohashError> {
    decode_bounds(hash).map(|bounds| bounds.center())
}

/// Compass steps to the eight neighbors: N, NE, E, SE, S, SW, W, NW.
const DIRECTIONS: [(f64, f64); 8] = [
    (1.0, 0.0),
    (1.0, 1.0),
    (0.0, 1.0),
    (-1.0, 1.0),
    (-1.0, 0.0),
    (-1.0, -1.0),
    (0.0, -1.0),
    (1.0, -1.0),
];

/// Hashes of the cells around `hash`, at the same precision.
///
/// Steps from the cell center by `NEIGHBOR_STEP_FRACTION` of the cell's
/// height and width and re-encodes. Steps that leave the valid coordinate
/// ranges are dropped, so cells on the poles or the antimeridian have fewer
/// than eight neighbors.
pub fn neighbors(hash: &str) -> Result<Vec<String>, GeohashError> {
    let bounds = decode_bounds(hash)?;
    let center = bounds.center();
    let lat_step = bounds.height() * NEIGHBOR_STEP_FRACTION;
    let lng_step = bounds.width() * NEIGHBOR_STEP_FRACTION;

    let mut out = Vec::with_capacity(DIRECTIONS.len());
    for (dlat, dlng) in DIRECTIONS {
        let point = LatLng::new(center.lat + dlat * lat_step, center.lng + dlng * lng_step);
        if !point.is_valid() {
            continue;
        }
        let neighbor = encode(point, hash.len())?;
        if neighbor != hash && !out.contains(&neighbor) {
            out.push(neighbor);
        }
    }
    Ok(out)
}

// ============================================================================
// TILE KEY
// ============================================================================

/// Store key for one tile: `g{precision}:{hash}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TileKey {
    hash: String,
}

impl TileKey {
    /// Tile containing `point` at `precision`.
    pub fn containing(point: LatLng, precision: usize) -> Result<Self, GeohashError> {
        encode(point, precision).map(|hash| Self { hash })
    }

    /// Wrap an existing hash after validating it.
    pub fn from_hash(hash: &str) -> Result<Self, GeohashError> {
        decode_bounds(hash)?;
        Ok(Self {
            hash: hash.to_ascii_lowercase(),
        })
    }

    /// Parse a `g{precision}:{hash}` key. The precision tag must match the
    /// hash length.
    pub fn parse(key: &str) -> Result<Self, GeohashError> {
        let malformed = || GeohashError::MalformedTileKey(key.to_string());

        let rest = key.strip_prefix('g').ok_or_else(malformed)?;
        let (precision, hash) = rest.split_once(':').ok_or_else(malformed)?;
        let precision: usize = precision.parse().map_err(|_| malformed())?;
        if precision != hash.len() {
            return Err(malformed());
        }
        Self::from_hash(hash).map_err(|_| malformed())
    }

    pub fn hash(&self) -> &str {
        &self.hash
    }

    pub fn precision(&self) -> usize {
        self.hash.len()
    }

    /// Rectangle covered by this tile.
    pub fn bounds(&self) -> Bounds {
        // The hash was validated on construction.
        decode_bounds(&self.hash).unwrap_or_else(|_| Bounds::new(0.0, 0.0, 0.0, 0.0))
    }

    /// Neighbor tiles at the same precision.
    pub fn neighbors(&self) -> Vec<TileKey> {
        neighbors(&self.hash)
            .unwrap_or_default()
            .into_iter()
            .map(|hash| TileKey { hash })
            .collect()
    }
}

impl fmt::Display for TileKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "g{}:{}", self.hash.len(), self.hash)
    }
}

impl FromStr for TileKey {
    type Err = GeohashError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_known_encodings() {
        // Reference values from the canonical geohash test vectors.
        assert_eq!(encode(LatLng::new(57.64911, 10.40744), 11).unwrap(), "u4pruydqqvj");
        assert_eq!(encode(LatLng::new(37.8324, 112.5584), 9).unwrap(), "ww8p1r4t8");
        assert_eq!(encode(LatLng::new(0.0, 0.0), 1).unwrap(), "s");
    }

    #[test]
    fn test_decode_known_cell() {
        let bounds = decode_bounds("ezs42").unwrap();
        assert!((bounds.south - 42.583_007_812_5).abs() < 1e-9);
        assert!((bounds.north - 42.626_953_125).abs() < 1e-9);
        assert!((bounds.west + 5.625).abs() < 1e-9);
        assert!((bounds.east + 5.581_054_687_5).abs() < 1e-9);
    }

    #[test]
    fn test_invalid_inputs() {
        assert_eq!(
            encode(LatLng::new(0.0, 0.0), 0),
            Err(GeohashError::InvalidPrecision(0))
        );
        assert_eq!(
            encode(LatLng::new(0.0, 0.0), 13),
            Err(GeohashError::InvalidPrecision(13))
        );
        assert_eq!(decode_bounds(""), Err(GeohashError::InvalidPrecision(0)));
        assert_eq!(decode_bounds("9qa"), Err(GeohashError::InvalidCharacter('a')));
    }

    #[test]
    fn test_decode_accepts_uppercase() {
        assert_eq!(decode_bounds("9Q8YY").unwrap(), decode_bounds("9q8yy").unwrap());
    }

    #[test]
    fn test_interior_cell_has_eight_distinct_neighbors() {
        let around = neighbors("9q8yyk").unwrap();
        assert_eq!(around.len(), 8);
        assert!(!around.contains(&"9q8yyk".to_string()));
        for hash in &around {
            assert_eq!(hash.len(), 6);
        }
    }

    #[test]
    fn test_known_neighbors() {
        let around = neighbors("ezs42").unwrap();
        for expected in ["ezs48", "ezs49", "ezs43", "ezs41", "ezs40", "ezefp", "ezefr", "ezefx"] {
            assert!(around.contains(&expected.to_string()), "missing {}", expected);
        }
    }

    #[test]
    fn test_polar_cell_drops_out_of_range_neighbors() {
        let top = encode(LatLng::new(89.99, 0.0), 2).unwrap();
        let around = neighbors(&top).unwrap();
        assert!(around.len() < 8);
        for hash in around {
            assert!(decode(&hash).unwrap().lat < 90.0);
        }
    }

    #[test]
    fn test_tile_key_roundtrip() {
        let key = TileKey::containing(LatLng::new(37.7749, -122.4194), 6).unwrap();
        assert_eq!(key.to_string(), "g6:9q8yyk");
        assert_eq!(TileKey::parse("g6:9q8yyk").unwrap(), key);
        assert_eq!("g6:9q8yyk".parse::<TileKey>().unwrap().precision(), 6);
    }

    #[test]
    fn test_malformed_tile_keys() {
        for bad in ["", "9q8yyk", "g6", "g5:9q8yyk", "gx:9q8", "g3:9qa", "g0:"] {
            assert!(
                matches!(TileKey::parse(bad), Err(GeohashError::MalformedTileKey(_))),
                "{} should be malformed",
                bad
            );
        }
    }

    proptest! {
        #[test]
        fn prop_decoded_cell_contains_point(
            lat in -90.0f64..=90.0,
            lng in -180.0f64..=180.0,
            precision in 1usize..=12,
        ) {
            let point = LatLng::new(lat, lng);
            let hash = encode(point, precision).unwrap();
            prop_assert_eq!(hash.len(), precision);
            let bounds = decode_bounds(&hash).unwrap();
            prop_assert!(bounds.contains(point));
        }

        #[test]
        fn prop_neighbors_are_valid_and_distinct(
            lat in -89.0f64..=89.0,
            lng in -179.0f64..=179.0,
            precision in 1usize..=9,
        ) {
            let hash = encode(LatLng::new(lat, lng), precision).unwrap();
            let around = neighbors(&hash).unwrap();
            prop_assert!(around.len() <= 8);
            for neighbor in &around {
                prop_assert_eq!(neighbor.len(), precision);
                prop_assert_ne!(neighbor, &hash);
                prop_assert!(decode(neighbor).unwrap().is_valid());
            }
        }
    }
}
