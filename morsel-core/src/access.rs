//! Actors, actions, and rate-limit keys.
//!
//! Actions are a closed set: every rate-limited operation the gateway
//! performs has a variant here, and the limit table is total over it.
//! Parsing an unrecognized action name yields a typed error instead of a
//! silently missing table entry.

use crate::error::RateLimitError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

// ============================================================================
// ACTION
// ============================================================================

/// A class of expensive, rate-limited operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    /// Free-text place search.
    Search,
    /// Viewport ("search this area") tile fetch.
    AreaSearch,
    /// Search-box suggestions, one per debounced keystroke.
    Autocomplete,
    /// Place details lookup.
    PlaceDetails,
    /// Place photo fetch.
    Photo,
    /// Writing a review against a place.
    ReviewWrite,
}

impl Action {
    /// Every action, in table order.
    pub const ALL: [Action; 6] = [
        Action::Search,
        Action::AreaSearch,
        Action::Autocomplete,
        Action::PlaceDetails,
        Action::Photo,
        Action::ReviewWrite,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Search => "search",
            Action::AreaSearch => "area_search",
            Action::Autocomplete => "autocomplete",
            Action::PlaceDetails => "place_details",
            Action::Photo => "photo",
            Action::ReviewWrite => "review_write",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Action {
    type Err = RateLimitError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Action::ALL
            .into_iter()
            .find(|action| action.as_str() == s)
            .ok_or_else(|| RateLimitError::UnknownAction {
                name: s.to_string(),
            })
    }
}

// ============================================================================
// ACTORS
// ============================================================================

/// Whether a caller is signed in. Each tier has its own limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthTier {
    Authenticated,
    Anonymous,
}

impl fmt::Display for AuthTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthTier::Authenticated => f.write_str("authenticated"),
            AuthTier::Anonymous => f.write_str("anonymous"),
        }
    }
}

/// The caller a rate limit applies to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Actor {
    /// Signed-in user, keyed by user id.
    User(String),
    /// Anonymous caller, keyed by network address.
    Ip(IpAddr),
}

impl Actor {
    pub fn user(id: impl Into<String>) -> Self {
        Actor::User(id.into())
    }

    pub fn tier(&self) -> AuthTier {
        match self {
            Actor::User(_) => AuthTier::Authenticated,
            Actor::Ip(_) => AuthTier::Anonymous,
        }
    }

    /// Key prefix naming the actor kind.
    pub fn kind(&self) -> &'static str {
        match self {
            Actor::User(_) => "user",
            Actor::Ip(_) => "ip",
        }
    }
}

impl fmt::Display for Actor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Actor::User(id) => write!(f, "user:{}", id),
            Actor::Ip(ip) => write!(f, "ip:{}", ip),
        }
    }
}

// ============================================================================
// RATE KEY
// ============================================================================

/// Store key for a rate window: `actorKind:actorId:action`.
///
/// Authenticated and anonymous actors can never collide because the kind
/// prefix differs, so the two tiers never share a counter.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RateKey {
    encoded: String,
    action: Action,
    tier: AuthTier,
}

impl RateKey {
    pub fn new(actor: &Actor, action: Action) -> Self {
        Self {
            encoded: format!("{}:{}", actor, action),
            action,
            tier: actor.tier(),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.encoded
    }

    pub fn action(&self) -> Action {
        self.action
    }

    pub fn tier(&self) -> AuthTier {
        self.tier
    }
}

impl fmt::Display for RateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encoded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn test_action_roundtrip_through_str() {
        for action in Action::ALL {
            assert_eq!(action.as_str().parse::<Action>(), Ok(action));
        }
    }

    #[test]
    fn test_unknown_action_is_typed_error() {
        let err = "teleport".parse::<Action>().unwrap_err();
        assert_eq!(
            err,
            RateLimitError::UnknownAction {
                name: "teleport".to_string()
            }
        );
    }

    #[test]
    fn test_rate_key_format() {
        let user = RateKey::new(&Actor::user("42"), Action::Search);
        assert_eq!(user.as_str(), "user:42:search");
        assert_eq!(user.tier(), AuthTier::Authenticated);

        let ip = RateKey::new(&Actor::Ip(IpAddr::V4(Ipv4Addr::new(1, 2, 3, 4))), Action::Search);
        assert_eq!(ip.as_str(), "ip:1.2.3.4:search");
        assert_eq!(ip.tier(), AuthTier::Anonymous);
    }

    #[test]
    fn test_tiers_never_share_keys() {
        // A user literally named like an address still gets a distinct key.
        let user = RateKey::new(&Actor::user("1.2.3.4"), Action::Search);
        let ip = RateKey::new(&Actor::Ip("1.2.3.4".parse().unwrap()), Action::Search);
        assert_ne!(user, ip);
    }
}
