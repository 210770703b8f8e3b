//! Constants for morsel
//!
//! Default values for the static configuration surface. Centralized here so
//! the limit table, TTLs, and their tests agree on one source.

// ============================================================================
// TILES
// ============================================================================

/// Default lifetime of a tile membership entry (1 day)
pub const DEFAULT_TILE_TTL_SECS: u64 = 86_400;

/// Fraction of a cell's width/height used to step into a neighbor cell
pub const NEIGHBOR_STEP_FRACTION: f64 = 0.9;

/// Decimal places kept when a location bias is folded into a request key
pub const BIAS_KEY_DECIMALS: u32 = 2;

// ============================================================================
// SESSIONS
// ============================================================================

/// Default maximum age of a search session (3 minutes, the provider's
/// bundling window)
pub const DEFAULT_SESSION_MAX_AGE_SECS: u64 = 180;

// ============================================================================
// MAINTENANCE
// ============================================================================

/// Default interval between retention sweeps (5 minutes)
pub const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 300;

/// Default LMDB location
pub const DEFAULT_LMDB_PATH: &str = "./data/morsel";

/// Default LMDB map size in megabytes
pub const DEFAULT_LMDB_MAP_SIZE_MB: usize = 64;

// ============================================================================
// PROVIDER DEFAULTS
// ============================================================================

/// Default language for detail and suggestion requests
pub const DEFAULT_LANGUAGE: &str = "en";

/// Default region for detail and suggestion requests
pub const DEFAULT_REGION: &str = "us";

// ============================================================================
// RATE LIMITING
// ============================================================================

/// Standard rate window (1 minute)
pub const MINUTE_WINDOW_MS: u64 = 60_000;

/// Long rate window for write-style actions (1 hour)
pub const HOUR_WINDOW_MS: u64 = 3_600_000;
