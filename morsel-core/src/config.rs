//! Gate Configuration Module
//!
//! Static configuration for the provider-access layer: the action limit
//! table, the zoom to geohash precision table, TTLs, and store location.
//! Loaded from environment variables with defaults suitable for development.

use crate::constants::{
    DEFAULT_LANGUAGE, DEFAULT_LMDB_MAP_SIZE_MB, DEFAULT_LMDB_PATH, DEFAULT_REGION,
    DEFAULT_SESSION_MAX_AGE_SECS, DEFAULT_SWEEP_INTERVAL_SECS, DEFAULT_TILE_TTL_SECS,
    HOUR_WINDOW_MS, MINUTE_WINDOW_MS,
};
use crate::error::ConfigError;
use crate::{Action, AuthTier};
use std::collections::HashMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

// ============================================================================
// RATE LIMIT TABLE
// ============================================================================

/// A limit of `limit` calls per `window`. `limit == 0` disallows the action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateRule {
    pub limit: u32,
    pub window: Duration,
}

impl RateRule {
    pub const fn new(limit: u32, window_ms: u64) -> Self {
        Self {
            limit,
            window: Duration::from_millis(window_ms),
        }
    }

    pub const fn disallowed() -> Self {
        Self::new(0, 0)
    }

    pub fn is_disallowed(&self) -> bool {
        self.limit == 0
    }
}

/// Limits for one action, split by tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActionRules {
    pub authenticated: RateRule,
    pub anonymous: RateRule,
}

impl ActionRules {
    pub fn for_tier(&self, tier: AuthTier) -> RateRule {
        match tier {
            AuthTier::Authenticated => self.authenticated,
            AuthTier::Anonymous => self.anonymous,
        }
    }

    /// Built-in limits for an action.
    pub const fn defaults(action: Action) -> Self {
        match action {
            Action::Search => Self {
                authenticated: RateRule::new(60, MINUTE_WINDOW_MS),
                anonymous: RateRule::new(10, MINUTE_WINDOW_MS),
            },
            Action::AreaSearch => Self {
                authenticated: RateRule::new(120, MINUTE_WINDOW_MS),
                anonymous: RateRule::new(30, MINUTE_WINDOW_MS),
            },
            Action::Autocomplete => Self {
                authenticated: RateRule::new(300, MINUTE_WINDOW_MS),
                anonymous: RateRule::new(60, MINUTE_WINDOW_MS),
            },
            Action::PlaceDetails => Self {
                authenticated: RateRule::new(60, MINUTE_WINDOW_MS),
                anonymous: RateRule::new(20, MINUTE_WINDOW_MS),
            },
            Action::Photo => Self {
                authenticated: RateRule::new(120, MINUTE_WINDOW_MS),
                anonymous: RateRule::disallowed(),
            },
            Action::ReviewWrite => Self {
                authenticated: RateRule::new(10, HOUR_WINDOW_MS),
                anonymous: RateRule::disallowed(),
            },
        }
    }
}

/// Per-action, per-tier limits.
///
/// Built once at startup and shared read-only. An action with no entry is
/// treated the same as one configured with `limit = 0`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitTable {
    rules: HashMap<Action, ActionRules>,
}

impl Default for RateLimitTable {
    fn default() -> Self {
        Self {
            rules: Action::ALL
                .into_iter()
                .map(|action| (action, ActionRules::defaults(action)))
                .collect(),
        }
    }
}

impl RateLimitTable {
    /// A table with no actions configured; every check is denied.
    pub fn empty() -> Self {
        Self {
            rules: HashMap::new(),
        }
    }

    /// Replace the rules for one action and tier.
    ///
    /// A rule with a non-zero limit needs a non-zero window; the table's
    /// `validate` rejects one that has none.
    pub fn with_rule(mut self, action: Action, tier: AuthTier, rule: RateRule) -> Self {
        let entry = self.rules.entry(action).or_insert(ActionRules {
            authenticated: RateRule::disallowed(),
            anonymous: RateRule::disallowed(),
        });
        match tier {
            AuthTier::Authenticated => entry.authenticated = rule,
            AuthTier::Anonymous => entry.anonymous = rule,
        }
        self
    }

    /// Remove an action entirely.
    pub fn without(mut self, action: Action) -> Self {
        self.rules.remove(&action);
        self
    }

    /// Rule for an action and tier, if configured.
    pub fn rule(&self, action: Action, tier: AuthTier) -> Option<RateRule> {
        self.rules.get(&action).map(|rules| rules.for_tier(tier))
    }

    /// Reject rules that allow calls over an empty window. Such a window is
    /// expired the moment it opens, so the limit would never apply.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (action, rules) in &self.rules {
            for (tier, rule) in [
                (AuthTier::Authenticated, rules.authenticated),
                (AuthTier::Anonymous, rules.anonymous),
            ] {
                if !rule.is_disallowed() && rule.window.is_zero() {
                    return Err(ConfigError::InvalidValue {
                        field: format!("rate_limits.{}.{}", action, tier),
                        value: format!("{} per 0ms", rule.limit),
                        reason: "window must be greater than zero".to_string(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Longest window across every configured rule. Records older than this
    /// cannot influence any decision.
    pub fn longest_window(&self) -> Duration {
        self.rules
            .values()
            .flat_map(|rules| [rules.authenticated.window, rules.anonymous.window])
            .max()
            .unwrap_or(Duration::ZERO)
    }
}

// ============================================================================
// ZOOM -> PRECISION
// ============================================================================

/// `(max_zoom, precision)` steps; the first step whose `max_zoom` is at
/// least the requested zoom wins.
const ZOOM_PRECISION_STEPS: [(u8, usize); 6] = [(3, 2), (6, 3), (9, 4), (12, 5), (15, 6), (17, 7)];

/// Precision used above the last step.
const MAX_TILE_PRECISION: usize = 8;

/// Geohash precision for a map zoom level. Coarser cells at low zoom so a
/// tile roughly tracks what fits on screen.
pub fn precision_for_zoom(zoom: u8) -> usize {
    ZOOM_PRECISION_STEPS
        .iter()
        .find(|(max_zoom, _)| zoom <= *max_zoom)
        .map(|(_, precision)| *precision)
        .unwrap_or(MAX_TILE_PRECISION)
}

// ============================================================================
// GATE CONFIGURATION
// ============================================================================

/// Configuration for the provider-access layer.
#[derive(Debug, Clone)]
pub struct GateConfig {
    /// Lifetime of a tile membership entry.
    pub tile_ttl: Duration,

    /// Maximum age of a search session before its token is unusable.
    pub session_max_age: Duration,

    /// Interval between retention sweeps.
    pub sweep_interval: Duration,

    /// Directory for the shared LMDB store.
    pub lmdb_path: PathBuf,

    /// LMDB map size in megabytes.
    pub lmdb_map_size_mb: usize,

    /// Language used when a request does not carry one.
    pub default_language: String,

    /// Region used when a request does not carry one.
    pub default_region: String,

    /// Per-action limits.
    pub rate_limits: RateLimitTable,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            tile_ttl: Duration::from_secs(DEFAULT_TILE_TTL_SECS),
            session_max_age: Duration::from_secs(DEFAULT_SESSION_MAX_AGE_SECS),
            sweep_interval: Duration::from_secs(DEFAULT_SWEEP_INTERVAL_SECS),
            lmdb_path: PathBuf::from(DEFAULT_LMDB_PATH),
            lmdb_map_size_mb: DEFAULT_LMDB_MAP_SIZE_MB,
            default_language: DEFAULT_LANGUAGE.to_string(),
            default_region: DEFAULT_REGION.to_string(),
            rate_limits: RateLimitTable::default(),
        }
    }
}

impl GateConfig {
    /// Create GateConfig from environment variables.
    ///
    /// Environment variables:
    /// - `MORSEL_TILE_TTL_SECS`: Tile entry lifetime (default: 86400)
    /// - `MORSEL_SESSION_MAX_AGE_SECS`: Search session lifetime (default: 180)
    /// - `MORSEL_SWEEP_INTERVAL_SECS`: Retention sweep interval (default: 300)
    /// - `MORSEL_LMDB_PATH`: Shared store directory (default: ./data/morsel)
    /// - `MORSEL_LMDB_MAP_SIZE_MB`: Shared store map size (default: 64)
    /// - `MORSEL_DEFAULT_LANGUAGE`: Request language fallback (default: en)
    /// - `MORSEL_DEFAULT_REGION`: Request region fallback (default: us)
    ///
    /// The rate limit table is not environment-configurable.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let config = Self {
            tile_ttl: Duration::from_secs(env_or("MORSEL_TILE_TTL_SECS", DEFAULT_TILE_TTL_SECS)?),
            session_max_age: Duration::from_secs(env_or(
                "MORSEL_SESSION_MAX_AGE_SECS",
                DEFAULT_SESSION_MAX_AGE_SECS,
            )?),
            sweep_interval: Duration::from_secs(env_or(
                "MORSEL_SWEEP_INTERVAL_SECS",
                DEFAULT_SWEEP_INTERVAL_SECS,
            )?),
            lmdb_path: std::env::var("MORSEL_LMDB_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.lmdb_path),
            lmdb_map_size_mb: env_or("MORSEL_LMDB_MAP_SIZE_MB", DEFAULT_LMDB_MAP_SIZE_MB)?,
            default_language: std::env::var("MORSEL_DEFAULT_LANGUAGE")
                .unwrap_or(defaults.default_language),
            default_region: std::env::var("MORSEL_DEFAULT_REGION")
                .unwrap_or(defaults.default_region),
            rate_limits: defaults.rate_limits,
        };

        config.validate()?;
        Ok(config)
    }

    /// Reject zero durations and sizes, and unbounded rate rules.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let checks = [
            ("tile_ttl", self.tile_ttl.is_zero()),
            ("session_max_age", self.session_max_age.is_zero()),
            ("sweep_interval", self.sweep_interval.is_zero()),
            ("lmdb_map_size_mb", self.lmdb_map_size_mb == 0),
        ];
        for (field, is_zero) in checks {
            if is_zero {
                return Err(ConfigError::InvalidValue {
                    field: field.to_string(),
                    value: "0".to_string(),
                    reason: "must be greater than zero".to_string(),
                });
            }
        }
        self.rate_limits.validate()
    }
}

fn env_or<T: FromStr>(key: &str, default: T) -> Result<T, ConfigError> {
    match std::env::var(key) {
        Ok(raw) => raw.trim().parse().map_err(|_| ConfigError::InvalidValue {
            field: key.to_string(),
            value: raw.clone(),
            reason: "not a valid number".to_string(),
        }),
        Err(_) => Ok(default),
    }
}
