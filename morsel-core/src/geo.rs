//! Geographic primitives.

use serde::{Deserialize, Serialize};

pub const MIN_LAT: f64 = -90.0;
pub const MAX_LAT: f64 = 90.0;
pub const MIN_LNG: f64 = -180.0;
pub const MAX_LNG: f64 = 180.0;

/// A point in WGS84 degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LatLng {
    pub lat: f64,
    pub lng: f64,
}

impl LatLng {
    pub fn new(lat: f64, lng: f64) -> Self {
        Self { lat, lng }
    }

    /// Whether the point lies inside `[-90, 90] x [-180, 180]`.
    pub fn is_valid(&self) -> bool {
        (MIN_LAT..=MAX_LAT).contains(&self.lat) && (MIN_LNG..=MAX_LNG).contains(&self.lng)
    }

    /// Round both coordinates to `decimals` places. Used to build request
    /// keys from a location bias, never for tiling.
    pub fn rounded(&self, decimals: u32) -> Self {
        let factor = 10f64.powi(decimals as i32);
        Self {
            lat: (self.lat * factor).round() / factor,
            lng: (self.lng * factor).round() / factor,
        }
    }
}

/// An axis-aligned rectangle in degrees.
///
/// Viewports crossing the antimeridian are not represented; callers split
/// them into two boxes.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bounds {
    pub north: f64,
    pub south: f64,
    pub east: f64,
    pub west: f64,
}

impl Bounds {
    pub fn new(north: f64, south: f64, east: f64, west: f64) -> Self {
        Self {
            north,
            south,
            east,
            west,
        }
    }

    pub fn center(&self) -> LatLng {
        LatLng::new(
            (self.north + self.south) / 2.0,
            (self.east + self.west) / 2.0,
        )
    }

    /// Corners in NE, NW, SE, SW order.
    pub fn corners(&self) -> [LatLng; 4] {
        [
            LatLng::new(self.north, self.east),
            LatLng::new(self.north, self.west),
            LatLng::new(self.south, self.east),
            LatLng::new(self.south, self.west),
        ]
    }

    /// Inclusive containment.
    pub fn contains(&self, point: LatLng) -> bool {
        point.lat >= self.south
            && point.lat <= self.north
            && point.lng >= self.west
            && point.lng <= self.east
    }

    pub fn width(&self) -> f64 {
        self.east - self.west
    }

    pub fn height(&self) -> f64 {
        self.north - self.south
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_bounds_center_and_contains() {
        let bounds = Bounds::new(37.80, 37.70, -122.40, -122.50);
        let center = bounds.center();
        assert!((center.lat - 37.75).abs() < 1e-9);
        assert!((center.lng + 122.45).abs() < 1e-9);
        assert!(bounds.contains(center));
        for corner in bounds.corners() {
            assert!(bounds.contains(corner));
        }
        assert!(!bounds.contains(LatLng::new(38.0, -122.45)));
    }

    #[test]
    fn test_rounded_bias() {
        let p = LatLng::new(37.774_929, -122.419_416).rounded(2);
        assert_eq!(p, LatLng::new(37.77, -122.42));
    }

    #[test]
    fn test_validity() {
        assert!(LatLng::new(90.0, 180.0).is_valid());
        assert!(!LatLng::new(90.1, 0.0).is_valid());
        assert!(!LatLng::new(0.0, -180.5).is_valid());
    }

    proptest! {
        /// Rounding a bias never moves it by more than half a unit in the
        /// last kept decimal.
        #[test]
        fn prop_rounding_is_bounded(lat in -90.0f64..=90.0, lng in -180.0f64..=180.0) {
            let p = LatLng::new(lat, lng);
            let r = p.rounded(2);
            prop_assert!((r.lat - lat).abs() <= 0.005 + 1e-9);
            prop_assert!((r.lng - lng).abs() <= 0.005 + 1e-9);
            prop_assert!(r.is_valid());
        }
    }
}
