//! Upstream place provider contract.
//!
//! The provider is a metered, per-call-billed geodata API. This crate only
//! describes what the gateway asks of it; implementations live with the
//! application. Only opaque place identifiers are ever persisted by the
//! gateway. Detail payloads pass through in memory.

use crate::error::UpstreamError;
use crate::geo::{Bounds, LatLng};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Opaque provider identifier for a place.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PlaceId(String);

impl PlaceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PlaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PlaceId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

// ============================================================================
// FIELD MASKS
// ============================================================================

/// Pre-approved subsets of upstream fields. The mask bounds per-call cost.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldMask {
    /// Identifiers only; the cheapest tier, used for tiling.
    Ids,
    /// What a map card shows.
    Summary,
    /// Full detail sheet.
    Detail,
}

impl FieldMask {
    pub fn as_str(&self) -> &'static str {
        match self {
            FieldMask::Ids => "ids",
            FieldMask::Summary => "summary",
            FieldMask::Detail => "detail",
        }
    }

    /// Upstream field names requested under this mask.
    pub fn fields(&self) -> &'static [&'static str] {
        match self {
            FieldMask::Ids => &["id"],
            FieldMask::Summary => &["id", "displayName", "location", "primaryType", "rating"],
            FieldMask::Detail => &[
                "id",
                "displayName",
                "location",
                "primaryType",
                "rating",
                "formattedAddress",
                "regularOpeningHours",
                "priceLevel",
                "websiteUri",
                "nationalPhoneNumber",
            ],
        }
    }
}

impl fmt::Display for FieldMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// SESSION TOKEN
// ============================================================================

/// Per-session bundling token forwarded to the provider so a run of
/// suggestions followed by one details call bills as a single session.
///
/// Never part of a coalescing key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionToken(Uuid);

impl SessionToken {
    pub fn generate() -> Self {
        Self(Uuid::now_v7())
    }
}

impl fmt::Display for SessionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// REQUESTS / RESPONSES
// ============================================================================

/// A place details lookup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetailRequest {
    pub place_id: PlaceId,
    pub fields: FieldMask,
    pub language: String,
    pub region: String,
}

impl DetailRequest {
    pub fn new(
        place_id: impl Into<PlaceId>,
        fields: FieldMask,
        language: impl Into<String>,
        region: impl Into<String>,
    ) -> Self {
        Self {
            place_id: place_id.into(),
            fields,
            language: language.into(),
            region: region.into(),
        }
    }
}

/// Provider content for one place. Opaque to the gateway.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlaceDetail {
    pub place_id: PlaceId,
    pub payload: serde_json::Value,
}

/// A search-box suggestion request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutocompleteRequest {
    pub input: String,
    pub bias: Option<LatLng>,
    pub language: String,
}

/// One suggestion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Suggestion {
    pub place_id: PlaceId,
    pub primary_text: String,
    pub secondary_text: Option<String>,
}

/// A free-text search request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextSearchRequest {
    pub query: String,
    pub bias: Option<LatLng>,
    pub language: String,
}

impl From<String> for PlaceId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

// ============================================================================
// PROVIDER TRAIT
// ============================================================================

/// The paid upstream API.
///
/// Every method is a billed network call. The gateway invokes them only
/// after a successful rate-limit check and always through the coalescer.
#[async_trait]
pub trait PlaceProvider: Send + Sync {
    /// Identifiers of places inside `bounds`.
    async fn fetch_tile(&self, bounds: Bounds, mask: FieldMask)
        -> Result<Vec<PlaceId>, UpstreamError>;

    /// Content for one place.
    async fn fetch_detail(
        &self,
        request: &DetailRequest,
        session: Option<&SessionToken>,
    ) -> Result<PlaceDetail, UpstreamError>;

    /// Suggestions for a partial input.
    async fn autocomplete(
        &self,
        request: &AutocompleteRequest,
        session: Option<&SessionToken>,
    ) -> Result<Vec<Suggestion>, UpstreamError>;

    /// Identifiers matching a free-text query.
    async fn text_search(&self, request: &TextSearchRequest)
        -> Result<Vec<PlaceId>, UpstreamError>;
}
