//! morsel Test Utilities
//!
//! Shared test infrastructure for the morsel workspace:
//! - A scriptable mock of the upstream places provider
//! - Proptest generators for coordinates, viewports, and zoom levels
//! - Fixtures for common scenarios
//! - Assertions for gate errors

pub use morsel_core::{
    Action, Actor, AuthTier, Bounds, Clock, FieldMask, GateConfig, GateError, GateResult, LatLng,
    ManualClock, PlaceDetail, PlaceId, RateLimitError, RateLimitTable, RateRule, SessionError,
    SessionToken, Suggestion, UpstreamError,
};
pub use morsel_storage::MemoryStore;

use async_trait::async_trait;
use morsel_core::{AutocompleteRequest, DetailRequest, PlaceProvider, TextSearchRequest};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

// ============================================================================
// MOCK PROVIDER
// ============================================================================

/// In-memory stand-in for the paid places API.
///
/// Counts every call per method, optionally sleeps before answering, and can
/// be switched into a failing mode. Answers are deterministic: the same
/// bounds always yield the same identifiers.
#[derive(Debug, Default)]
pub struct MockPlaceProvider {
    delay: Duration,
    places_per_tile: usize,
    failure: Mutex<Option<UpstreamError>>,
    last_session: Mutex<Option<SessionToken>>,
    tile_calls: AtomicUsize,
    detail_calls: AtomicUsize,
    autocomplete_calls: AtomicUsize,
    text_search_calls: AtomicUsize,
}

impl MockPlaceProvider {
    pub fn new() -> Self {
        Self {
            places_per_tile: 2,
            ..Self::default()
        }
    }

    /// Sleep this long before every answer.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Identifiers returned per tile. Zero models an empty area.
    pub fn with_places_per_tile(mut self, count: usize) -> Self {
        self.places_per_tile = count;
        self
    }

    /// Fail every call with `error` until [`recover`](Self::recover).
    pub fn fail_with(&self, error: UpstreamError) {
        *self.failure.lock().unwrap_or_else(PoisonError::into_inner) = Some(error);
    }

    pub fn recover(&self) {
        *self.failure.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }

    pub fn tile_calls(&self) -> usize {
        self.tile_calls.load(Ordering::SeqCst)
    }

    pub fn detail_calls(&self) -> usize {
        self.detail_calls.load(Ordering::SeqCst)
    }

    pub fn autocomplete_calls(&self) -> usize {
        self.autocomplete_calls.load(Ordering::SeqCst)
    }

    pub fn text_search_calls(&self) -> usize {
        self.text_search_calls.load(Ordering::SeqCst)
    }

    /// Total billed calls across every method.
    pub fn total_calls(&self) -> usize {
        self.tile_calls() + self.detail_calls() + self.autocomplete_calls() + self.text_search_calls()
    }

    /// Session token forwarded with the most recent call that carried one.
    pub fn last_session(&self) -> Option<SessionToken> {
        *self
            .last_session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Identifiers the mock reports for `bounds`.
    pub fn ids_for(&self, bounds: &Bounds) -> Vec<PlaceId> {
        let center = bounds.center();
        (0..self.places_per_tile)
            .map(|i| PlaceId::new(format!("place:{:.5}:{:.5}:{}", center.lat, center.lng, i)))
            .collect()
    }

    async fn answer(
        &self,
        counter: &AtomicUsize,
        session: Option<&SessionToken>,
    ) -> Result<(), UpstreamError> {
        counter.fetch_add(1, Ordering::SeqCst);
        if let Some(token) = session {
            *self
                .last_session
                .lock()
                .unwrap_or_else(PoisonError::into_inner) = Some(*token);
        }
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let failure = self
            .failure
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        match failure {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl PlaceProvider for MockPlaceProvider {
    async fn fetch_tile(
        &self,
        bounds: Bounds,
        _mask: FieldMask,
    ) -> Result<Vec<PlaceId>, UpstreamError> {
        self.answer(&self.tile_calls, None).await?;
        Ok(self.ids_for(&bounds))
    }

    async fn fetch_detail(
        &self,
        request: &DetailRequest,
        session: Option<&SessionToken>,
    ) -> Result<PlaceDetail, UpstreamError> {
        self.answer(&self.detail_calls, session).await?;
        Ok(PlaceDetail {
            place_id: request.place_id.clone(),
            payload: serde_json::json!({
                "id": request.place_id.as_str(),
                "fields": request.fields.fields(),
                "language": request.language,
            }),
        })
    }

    async fn autocomplete(
        &self,
        request: &AutocompleteRequest,
        session: Option<&SessionToken>,
    ) -> Result<Vec<Suggestion>, UpstreamError> {
        self.answer(&self.autocomplete_calls, session).await?;
        let input = request.input.to_lowercase();
        Ok((0..3)
            .map(|i| Suggestion {
                place_id: PlaceId::new(format!("suggest:{}:{}", input, i)),
                primary_text: format!("{} {}", request.input, i),
                secondary_text: None,
            })
            .collect())
    }

    async fn text_search(
        &self,
        request: &TextSearchRequest,
    ) -> Result<Vec<PlaceId>, UpstreamError> {
        self.answer(&self.text_search_calls, None).await?;
        let query = request.query.to_lowercase();
        Ok((0..5)
            .map(|i| PlaceId::new(format!("search:{}:{}", query, i)))
            .collect())
    }
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for morsel types.

    use super::*;
    use proptest::prelude::*;

    /// Any valid coordinate.
    pub fn arb_lat_lng() -> impl Strategy<Value = LatLng> {
        (-90.0f64..=90.0, -180.0f64..=180.0).prop_map(|(lat, lng)| LatLng::new(lat, lng))
    }

    /// A viewport up to a couple of degrees across, fully inside the valid
    /// coordinate range.
    pub fn arb_bounds() -> impl Strategy<Value = Bounds> {
        (-85.0f64..85.0, -175.0f64..175.0, 0.0f64..2.0, 0.0f64..2.0).prop_map(
            |(south, west, height, width)| {
                let north = (south + height).min(90.0);
                let east = (west + width).min(180.0);
                Bounds::new(north, south, east, west)
            },
        )
    }

    /// Map zoom levels as a client sends them.
    pub fn arb_zoom() -> impl Strategy<Value = u8> {
        0u8..=21
    }

    /// Every valid geohash precision.
    pub fn arb_precision() -> impl Strategy<Value = usize> {
        1usize..=12
    }

    /// A handful of place identifiers.
    pub fn arb_place_ids() -> impl Strategy<Value = Vec<PlaceId>> {
        prop::collection::vec("[A-Za-z0-9_-]{4,24}".prop_map(PlaceId::new), 0..16)
    }

    pub fn arb_action() -> impl Strategy<Value = Action> {
        prop::sample::select(Action::ALL.to_vec())
    }
}

// ============================================================================
// FIXTURES
// ============================================================================

pub mod fixtures {
    //! Common scenario data.

    use super::*;
    use std::sync::Arc;

    /// Mission District, San Francisco, about 1km on a side.
    pub fn mission_viewport() -> Bounds {
        Bounds::new(37.765, 37.755, -122.410, -122.425)
    }

    /// A degenerate viewport around one point.
    pub fn point_viewport(point: LatLng) -> Bounds {
        Bounds::new(point.lat, point.lat, point.lng, point.lng)
    }

    pub fn sf_center() -> LatLng {
        LatLng::new(37.7749, -122.4194)
    }

    /// A manual clock, shared.
    pub fn manual_clock() -> Arc<ManualClock> {
        Arc::new(ManualClock::default())
    }

    /// Default config with a custom limit table.
    pub fn config_with_limits(rate_limits: RateLimitTable) -> GateConfig {
        GateConfig {
            rate_limits,
            ..GateConfig::default()
        }
    }

    /// A table allowing `limit` calls per `window_ms` for one action and
    /// tier, and nothing else.
    pub fn single_rule(action: Action, tier: AuthTier, limit: u32, window_ms: u64) -> RateLimitTable {
        RateLimitTable::empty().with_rule(action, tier, RateRule::new(limit, window_ms))
    }
}

// ============================================================================
// ASSERTIONS
// ============================================================================

pub mod assertions {
    //! Assertions for gate results.

    use super::*;

    /// Assert a rate-limited error and return its retry-after seconds.
    pub fn assert_rate_limited<T: std::fmt::Debug>(result: &GateResult<T>, action: Action) -> u64 {
        match result {
            Err(GateError::RateLimit(RateLimitError::RateLimited {
                action: got,
                retry_after_secs,
            })) => {
                assert_eq!(*got, action, "rate limited on the wrong action");
                *retry_after_secs
            }
            other => panic!("Expected RateLimited on {}, got {:?}", action, other),
        }
    }

    /// Assert the action is not offered to the caller's tier.
    pub fn assert_disallowed<T: std::fmt::Debug>(result: &GateResult<T>) {
        assert!(
            matches!(
                result,
                Err(GateError::RateLimit(RateLimitError::ActionDisallowed { .. }))
            ),
            "Expected ActionDisallowed, got {:?}",
            result
        );
    }

    pub fn assert_cancelled<T: std::fmt::Debug>(result: &GateResult<T>) {
        assert!(
            matches!(result, Err(GateError::Cancelled)),
            "Expected Cancelled, got {:?}",
            result
        );
    }

    pub fn assert_upstream_error<T: std::fmt::Debug>(result: &GateResult<T>) {
        assert!(
            matches!(result, Err(GateError::Upstream(_))),
            "Expected upstream error, got {:?}",
            result
        );
    }
}
