//! morsel Core - Types and Contracts
//!
//! Pure data structures shared by the provider-access layer: errors,
//! configuration, geometry, actors and actions, stored records, the time
//! source, and the upstream provider contract. No I/O lives here.

use chrono::{DateTime, Utc};

pub mod access;
pub mod clock;
pub mod config;
pub mod constants;
pub mod error;
pub mod geo;
pub mod provider;
pub mod records;

/// Timestamp type using UTC timezone.
pub type Timestamp = DateTime<Utc>;

pub use access::{Action, Actor, AuthTier, RateKey};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{precision_for_zoom, ActionRules, GateConfig, RateLimitTable, RateRule};
pub use error::{
    ConfigError, GateError, GateResult, GeohashError, RateLimitError, SessionError, StorageError,
    UpstreamError, UpstreamErrorKind,
};
pub use geo::{Bounds, LatLng};
pub use provider::{
    AutocompleteRequest, DetailRequest, FieldMask, PlaceDetail, PlaceId, PlaceProvider,
    SessionToken, Suggestion, TextSearchRequest,
};
pub use records::{RateWindowRecord, TileEntry};
