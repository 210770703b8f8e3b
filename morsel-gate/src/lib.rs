//! morsel Gate - Provider Access Layer
//!
//! Everything that stands between the app and a metered places API:
//!
//! - [`Coalescer`]: identical concurrent requests share one upstream call
//! - [`RateLimiter`]: sliding-window quotas per actor and action
//! - [`TileIndex`]: geohash tiles remember which places a cell holds
//! - [`SessionManager`]: bundling tokens and superseded-request cancellation
//! - [`PlacesGateway`]: the four composed around a [`PlaceProvider`]
//!
//! [`PlaceProvider`]: morsel_core::PlaceProvider

pub mod coalescer;
pub mod gateway;
pub mod geohash;
pub mod keys;
pub mod metrics;
pub mod rate_limiter;
pub mod session;
pub mod sweep;
pub mod telemetry;
pub mod tile_index;

pub use coalescer::{Coalesced, Coalescer, CoalescerStats};
pub use gateway::{AreaSearch, PlacesGateway};
pub use geohash::TileKey;
pub use keys::CoalesceKey;
pub use metrics::GateMetrics;
pub use rate_limiter::{RateDecision, RateLimiter};
pub use session::{RequestSignal, SearchSession, SessionManager, SessionState};
pub use sweep::{sweep_once, sweep_task, SweepMetrics, SweepSnapshot};
pub use telemetry::init_tracing;
pub use tile_index::{tile_keys_for_bounds, TileIndex, TileIndexStats, ViewportPlan};
