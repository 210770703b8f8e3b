//! Places Gateway
//!
//! Orchestrates every paid upstream call: the rate limiter decides whether a
//! call may happen, the coalescer makes sure identical concurrent calls
//! happen once, and the tile index remembers which cells are already known
//! so a viewport only pays for the cells it has never seen.
//!
//! # Example
//!
//! ```ignore
//! let gateway = PlacesGateway::new(provider, store, GateConfig::from_env()?, clock)
//!     .with_metrics(Arc::new(GateMetrics::register(&registry)?));
//!
//! let sessions = gateway.session_manager();
//! let suggestions = gateway
//!     .autocomplete(&actor, &sessions, "ramen", Some(center))
//!     .await?;
//! ```

use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::future::try_join_all;
use morsel_core::{
    Action, Actor, AutocompleteRequest, Bounds, Clock, DetailRequest, FieldMask, GateConfig,
    GateError, GateResult, LatLng, PlaceDetail, PlaceId, PlaceProvider, RateLimitError,
    SessionToken, Suggestion, TextSearchRequest, UpstreamError,
};
use morsel_storage::{RateWindowStore, TileStore};
use serde::Serialize;

use crate::coalescer::{Coalesced, Coalescer};
use crate::geohash::TileKey;
use crate::keys::{normalize, CoalesceKey};
use crate::metrics::GateMetrics;
use crate::rate_limiter::{RateDecision, RateLimiter};
use crate::session::{RequestSignal, SessionManager};
use crate::tile_index::{TileIndex, UncachedTile};

const OP_FETCH_TILE: &str = "fetch_tile";
const OP_FETCH_DETAIL: &str = "fetch_detail";
const OP_AUTOCOMPLETE: &str = "autocomplete";
const OP_TEXT_SEARCH: &str = "text_search";

/// Result of a viewport search.
///
/// When the actor's quota runs out partway through, the tiles already
/// fetched are still returned; the rest are listed in `deferred_tiles` with
/// the wait before they can be requested.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AreaSearch {
    pub place_ids: BTreeSet<PlaceId>,
    /// Tiles answered from the cache.
    pub cached_tiles: usize,
    /// Tiles answered from upstream, including shared fetches.
    pub fetched_tiles: usize,
    /// Of `fetched_tiles`, how many joined a fetch another caller started.
    pub shared_tiles: usize,
    /// Tiles skipped because the rate limit was reached.
    #[serde(serialize_with = "serialize_keys")]
    pub deferred_tiles: Vec<TileKey>,
    pub retry_after: Option<Duration>,
}

impl AreaSearch {
    /// Whether every tile of the viewport was resolved.
    pub fn is_complete(&self) -> bool {
        self.deferred_tiles.is_empty()
    }
}

fn serialize_keys<S: serde::Serializer>(keys: &[TileKey], s: S) -> Result<S::Ok, S::Error> {
    s.collect_seq(keys.iter().map(ToString::to_string))
}

/// Time an upstream call and record its outcome.
async fn timed<T>(
    metrics: Option<&GateMetrics>,
    operation: &'static str,
    call: impl Future<Output = Result<T, UpstreamError>>,
) -> Result<T, UpstreamError> {
    let started = Instant::now();
    let result = call.await;
    if let Some(metrics) = metrics {
        metrics.record_upstream(operation, result.is_ok(), started.elapsed().as_secs_f64());
    }
    if let Err(e) = &result {
        tracing::warn!(operation, error = %e, "Upstream call failed");
    }
    result
}

/// Gateway in front of a metered places provider.
pub struct PlacesGateway<S> {
    provider: Arc<dyn PlaceProvider>,
    limiter: Arc<RateLimiter<S>>,
    tiles: Arc<TileIndex<S>>,
    tile_fetches: Coalescer<Vec<PlaceId>, UpstreamError>,
    details: Coalescer<PlaceDetail, UpstreamError>,
    suggestions: Coalescer<Vec<Suggestion>, UpstreamError>,
    searches: Coalescer<Vec<PlaceId>, UpstreamError>,
    clock: Arc<dyn Clock>,
    config: GateConfig,
    metrics: Option<Arc<GateMetrics>>,
}

impl<S> PlacesGateway<S>
where
    S: RateWindowStore + TileStore + 'static,
{
    /// Build a gateway over one store holding both rate windows and tiles.
    pub fn new(
        provider: Arc<dyn PlaceProvider>,
        store: Arc<S>,
        config: GateConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let limiter = RateLimiter::new(
            Arc::clone(&store),
            Arc::new(config.rate_limits.clone()),
            Arc::clone(&clock),
        );
        let tiles = TileIndex::new(store, Arc::clone(&clock), config.tile_ttl);

        Self {
            provider,
            limiter: Arc::new(limiter),
            tiles: Arc::new(tiles),
            tile_fetches: Coalescer::new(),
            details: Coalescer::new(),
            suggestions: Coalescer::new(),
            searches: Coalescer::new(),
            clock,
            config,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<GateMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn limiter(&self) -> &Arc<RateLimiter<S>> {
        &self.limiter
    }

    pub fn tiles(&self) -> &Arc<TileIndex<S>> {
        &self.tiles
    }

    /// Upstream tile fetches currently in flight.
    pub fn tile_fetches_in_flight(&self) -> usize {
        self.tile_fetches.in_flight()
    }

    /// A session manager for one client context, using this gateway's clock
    /// and session max age.
    pub fn session_manager(&self) -> SessionManager {
        SessionManager::new(Arc::clone(&self.clock), self.config.session_max_age)
    }

    /// A details request filled with the configured language and region.
    pub fn detail_request(&self, place_id: PlaceId, fields: FieldMask) -> DetailRequest {
        DetailRequest::new(
            place_id,
            fields,
            self.config.default_language.as_str(),
            self.config.default_region.as_str(),
        )
    }

    // ========================================================================
    // RATE LIMITING
    // ========================================================================

    async fn admit(&self, actor: &Actor, action: Action) -> GateResult<RateDecision> {
        let decision = self.limiter.check(actor, action).await?;
        if let Some(metrics) = &self.metrics {
            metrics.record_rate_decision(
                action.as_str(),
                &actor.tier().to_string(),
                decision.outcome(),
            );
        }
        Ok(decision)
    }

    async fn enforce(&self, actor: &Actor, action: Action) -> GateResult<()> {
        let decision = self.admit(actor, action).await?;
        match decision.denial(action, actor.tier()) {
            Some(err) => Err(err.into()),
            None => Ok(()),
        }
    }

    fn observe<T>(
        &self,
        operation: &str,
        outcome: Result<Coalesced<T>, UpstreamError>,
    ) -> GateResult<Coalesced<T>> {
        if let (Some(metrics), Ok(coalesced)) = (&self.metrics, &outcome) {
            metrics.record_coalesced(operation, coalesced.was_shared);
        }
        outcome.map_err(GateError::from)
    }

    // ========================================================================
    // AREA SEARCH
    // ========================================================================

    /// Place identifiers inside `bounds`, fetching only tiles not already
    /// cached.
    ///
    /// Every uncached tile costs one `AreaSearch` rate check. When the quota
    /// runs out the remaining tiles are deferred and the partial result is
    /// returned. Resolves to `GateError::Cancelled` as soon as `signal` is
    /// cancelled; fetches already started still complete and are cached.
    pub async fn search_area(
        &self,
        actor: &Actor,
        bounds: &Bounds,
        zoom: u8,
        signal: &RequestSignal,
    ) -> GateResult<AreaSearch> {
        if signal.is_cancelled() {
            return Err(GateError::Cancelled);
        }

        tokio::select! {
            biased;
            _ = signal.cancelled() => Err(GateError::Cancelled),
            result = self.run_area_search(actor, bounds, zoom) => result,
        }
    }

    async fn run_area_search(
        &self,
        actor: &Actor,
        bounds: &Bounds,
        zoom: u8,
    ) -> GateResult<AreaSearch> {
        let plan = self.tiles.plan_viewport(bounds, zoom).await?;
        if let Some(metrics) = &self.metrics {
            metrics.record_tile_lookups(plan.cached.len(), plan.uncached.len());
        }

        let mut result = AreaSearch {
            place_ids: plan.cached_ids(),
            cached_tiles: plan.cached.len(),
            ..AreaSearch::default()
        };

        let mut admitted = Vec::with_capacity(plan.uncached.len());
        let mut pending = plan.uncached.into_iter();
        while let Some(tile) = pending.next() {
            let decision = self.admit(actor, Action::AreaSearch).await?;
            if decision.allowed {
                admitted.push(tile);
                continue;
            }
            if decision.is_disallowed() {
                return Err(RateLimitError::ActionDisallowed {
                    action: Action::AreaSearch,
                    tier: actor.tier(),
                }
                .into());
            }
            result.retry_after = decision.retry_after;
            result.deferred_tiles = std::iter::once(tile.tile_key)
                .chain(pending.by_ref().map(|tile| tile.tile_key))
                .collect();
            break;
        }

        let fetched = try_join_all(admitted.iter().map(|tile| self.fetch_tile(tile, zoom))).await?;
        for coalesced in fetched {
            result.fetched_tiles += 1;
            if coalesced.was_shared {
                result.shared_tiles += 1;
            }
            result.place_ids.extend(coalesced.value);
        }

        tracing::debug!(
            actor = %actor,
            zoom,
            cached = result.cached_tiles,
            fetched = result.fetched_tiles,
            shared = result.shared_tiles,
            deferred = result.deferred_tiles.len(),
            places = result.place_ids.len(),
            "Area search completed"
        );

        Ok(result)
    }

    /// Fetch one tile through the coalescer. The leader's task writes the
    /// membership back, so the cache is filled even if every waiter leaves.
    async fn fetch_tile(&self, tile: &UncachedTile, zoom: u8) -> GateResult<Coalesced<Vec<PlaceId>>> {
        let key = CoalesceKey::tile(&tile.tile_key, FieldMask::Ids);
        let provider = Arc::clone(&self.provider);
        let tiles = Arc::clone(&self.tiles);
        let metrics = self.metrics.clone();
        let bounds = tile.bounds;
        let tile_key = tile.tile_key.to_string();
        let ttl = self.config.tile_ttl;

        let outcome = self
            .tile_fetches
            .execute(key.as_str(), move || async move {
                let ids = timed(
                    metrics.as_deref(),
                    OP_FETCH_TILE,
                    provider.fetch_tile(bounds, FieldMask::Ids),
                )
                .await?;
                if let Err(e) = tiles.write_tile(&tile_key, zoom, ids.clone(), ttl).await {
                    tracing::warn!(tile_key = %tile_key, error = %e, "Failed to cache tile membership");
                }
                Ok(ids)
            })
            .await;

        self.observe(OP_FETCH_TILE, outcome)
    }

    // ========================================================================
    // DETAILS, SUGGESTIONS, TEXT SEARCH
    // ========================================================================

    /// Details for one place. The session token is forwarded upstream but
    /// is not part of the coalescing key.
    pub async fn place_details(
        &self,
        actor: &Actor,
        request: DetailRequest,
        session: Option<SessionToken>,
    ) -> GateResult<Coalesced<PlaceDetail>> {
        self.enforce(actor, Action::PlaceDetails).await?;

        let key = CoalesceKey::details(&request);
        let provider = Arc::clone(&self.provider);
        let metrics = self.metrics.clone();
        let outcome = self
            .details
            .execute(key.as_str(), move || async move {
                timed(
                    metrics.as_deref(),
                    OP_FETCH_DETAIL,
                    provider.fetch_detail(&request, session.as_ref()),
                )
                .await
            })
            .await;

        self.observe(OP_FETCH_DETAIL, outcome)
    }

    /// Suggestions for the search box.
    ///
    /// Each call supersedes the previous call on the same session: the older
    /// call resolves to `GateError::Cancelled`. Blank input clears without
    /// an upstream call.
    pub async fn autocomplete(
        &self,
        actor: &Actor,
        sessions: &SessionManager,
        input: &str,
        bias: Option<LatLng>,
    ) -> GateResult<Vec<Suggestion>> {
        let (token, signal) = sessions.begin_request()?;
        if normalize(input).is_empty() {
            return Ok(Vec::new());
        }
        self.enforce(actor, Action::Autocomplete).await?;

        let request = AutocompleteRequest {
            input: input.trim().to_string(),
            bias,
            language: self.config.default_language.clone(),
        };
        let key = CoalesceKey::autocomplete(&request);
        let provider = Arc::clone(&self.provider);
        let metrics = self.metrics.clone();
        let work = self.suggestions.execute(key.as_str(), move || async move {
            timed(
                metrics.as_deref(),
                OP_AUTOCOMPLETE,
                provider.autocomplete(&request, Some(&token)),
            )
            .await
        });

        tokio::select! {
            biased;
            _ = signal.cancelled() => Err(GateError::Cancelled),
            outcome = work => self.observe(OP_AUTOCOMPLETE, outcome).map(|c| c.value),
        }
    }

    /// Details for a chosen suggestion, billed to the current session, which
    /// is then consumed.
    pub async fn select_suggestion(
        &self,
        actor: &Actor,
        sessions: &SessionManager,
        place_id: PlaceId,
        fields: FieldMask,
    ) -> GateResult<PlaceDetail> {
        let token = sessions.token()?;
        let request = self.detail_request(place_id, fields);
        let detail = self.place_details(actor, request, Some(token)).await?;
        sessions.consume()?;
        Ok(detail.value)
    }

    /// Free-text place search. Blank queries return nothing without an
    /// upstream call.
    pub async fn text_search(
        &self,
        actor: &Actor,
        query: &str,
        bias: Option<LatLng>,
    ) -> GateResult<Coalesced<Vec<PlaceId>>> {
        if normalize(query).is_empty() {
            return Ok(Coalesced {
                value: Vec::new(),
                was_shared: false,
            });
        }
        self.enforce(actor, Action::Search).await?;

        let request = TextSearchRequest {
            query: query.trim().to_string(),
            bias,
            language: self.config.default_language.clone(),
        };
        let key = CoalesceKey::text_search(&request);
        let provider = Arc::clone(&self.provider);
        let metrics = self.metrics.clone();
        let outcome = self
            .searches
            .execute(key.as_str(), move || async move {
                timed(
                    metrics.as_deref(),
                    OP_TEXT_SEARCH,
                    provider.text_search(&request),
                )
                .await
            })
            .await;

        self.observe(OP_TEXT_SEARCH, outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use morsel_core::{AuthTier, ManualClock, RateLimitTable, RateRule, SessionError};
    use morsel_storage::MemoryStore;
    use morsel_test_utils::assertions::assert_upstream_error;
    use morsel_test_utils::MockPlaceProvider;
    use prometheus::Registry;

    fn config(table: RateLimitTable) -> GateConfig {
        GateConfig {
            rate_limits: table,
            ..GateConfig::default()
        }
    }

    fn gateway(
        provider: Arc<MockPlaceProvider>,
        table: RateLimitTable,
    ) -> (PlacesGateway<MemoryStore>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::default());
        let gateway = PlacesGateway::new(
            provider,
            Arc::new(MemoryStore::new()),
            config(table),
            clock.clone(),
        );
        (gateway, clock)
    }

    fn viewport() -> Bounds {
        Bounds::new(37.765, 37.755, -122.410, -122.425)
    }

    #[tokio::test]
    async fn test_second_search_is_served_from_cache() {
        let provider = Arc::new(MockPlaceProvider::new());
        let (gateway, _clock) = gateway(provider.clone(), RateLimitTable::default());
        let actor = Actor::user("u1");

        let first = gateway
            .search_area(&actor, &viewport(), 13, &RequestSignal::never())
            .await
            .unwrap();
        assert!(first.is_complete());
        assert_eq!(first.cached_tiles, 0);
        assert!(first.fetched_tiles > 0);
        assert_eq!(provider.tile_calls(), first.fetched_tiles);

        let second = gateway
            .search_area(&actor, &viewport(), 13, &RequestSignal::never())
            .await
            .unwrap();
        assert_eq!(second.fetched_tiles, 0);
        assert_eq!(second.cached_tiles, first.fetched_tiles);
        assert_eq!(second.place_ids, first.place_ids);
        assert_eq!(provider.tile_calls(), first.fetched_tiles);
    }

    #[tokio::test]
    async fn test_quota_exhaustion_returns_partial_result() {
        let provider = Arc::new(MockPlaceProvider::new());
        let table = RateLimitTable::empty().with_rule(
            Action::AreaSearch,
            AuthTier::Authenticated,
            RateRule::new(4, 60_000),
        );
        let (gateway, _clock) = gateway(provider.clone(), table);

        let result = gateway
            .search_area(&Actor::user("u1"), &viewport(), 13, &RequestSignal::never())
            .await
            .unwrap();
        assert_eq!(result.fetched_tiles, 4);
        assert!(!result.is_complete());
        let wait = result.retry_after.unwrap();
        assert!(wait > Duration::ZERO && wait <= Duration::from_secs(60));
        assert_eq!(provider.tile_calls(), 4);
    }

    #[tokio::test]
    async fn test_disallowed_area_search_is_an_error() {
        let provider = Arc::new(MockPlaceProvider::new());
        let (gateway, _clock) = gateway(provider.clone(), RateLimitTable::empty());

        let err = gateway
            .search_area(&Actor::user("u1"), &viewport(), 13, &RequestSignal::never())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            GateError::RateLimit(RateLimitError::ActionDisallowed { .. })
        ));
        assert_eq!(provider.tile_calls(), 0);
    }

    #[tokio::test]
    async fn test_upstream_failure_propagates_and_is_not_cached() {
        let provider = Arc::new(MockPlaceProvider::new());
        provider.fail_with(UpstreamError::unavailable("fetch_tile", "provider down"));
        let (gateway, _clock) = gateway(provider.clone(), RateLimitTable::default());

        let failed = gateway
            .search_area(&Actor::user("u1"), &viewport(), 13, &RequestSignal::never())
            .await;
        assert_upstream_error(&failed);
        assert_eq!(gateway.tiles().stats().hits, 0);

        provider.recover();
        let ok = gateway
            .search_area(&Actor::user("u1"), &viewport(), 13, &RequestSignal::never())
            .await
            .unwrap();
        assert!(ok.fetched_tiles > 0);
    }

    #[tokio::test]
    async fn test_cancelled_signal_short_circuits() {
        let provider = Arc::new(MockPlaceProvider::new());
        let (gateway, clock) = gateway(provider.clone(), RateLimitTable::default());
        let sessions = SessionManager::new(clock, Duration::from_secs(180));
        let stale = sessions.new_request_signal();
        let _fresh = sessions.new_request_signal();

        let err = gateway
            .search_area(&Actor::user("u1"), &viewport(), 13, &stale)
            .await
            .unwrap_err();
        assert!(matches!(err, GateError::Cancelled));
        assert_eq!(provider.tile_calls(), 0);
    }

    #[tokio::test]
    async fn test_details_coalesce_across_sessions() {
        let provider = Arc::new(MockPlaceProvider::new().with_delay(Duration::from_millis(30)));
        let (gateway, _clock) = gateway(provider.clone(), RateLimitTable::default());
        let actor = Actor::user("u1");

        let a = gateway.place_details(
            &actor,
            gateway.detail_request(PlaceId::new("ChIJ123"), FieldMask::Detail),
            Some(SessionToken::generate()),
        );
        let b = gateway.place_details(
            &actor,
            gateway.detail_request(PlaceId::new("ChIJ123"), FieldMask::Detail),
            Some(SessionToken::generate()),
        );
        let (a, b) = tokio::join!(a, b);
        let (a, b) = (a.unwrap(), b.unwrap());

        assert_eq!(a.value, b.value);
        assert!(a.was_shared != b.was_shared);
        assert_eq!(provider.detail_calls(), 1);
    }

    #[tokio::test]
    async fn test_place_details_rate_limited() {
        let provider = Arc::new(MockPlaceProvider::new());
        let table = RateLimitTable::empty().with_rule(
            Action::PlaceDetails,
            AuthTier::Authenticated,
            RateRule::new(1, 60_000),
        );
        let (gateway, _clock) = gateway(provider.clone(), table);
        let actor = Actor::user("u1");
        let request = gateway.detail_request(PlaceId::new("p"), FieldMask::Summary);

        gateway
            .place_details(&actor, request.clone(), None)
            .await
            .unwrap();
        let err = gateway
            .place_details(&actor, request, None)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            GateError::RateLimit(RateLimitError::RateLimited {
                retry_after_secs: 60,
                ..
            })
        ));
        assert_eq!(provider.detail_calls(), 1);
    }

    #[tokio::test]
    async fn test_new_keystroke_cancels_previous_autocomplete() {
        let provider = Arc::new(MockPlaceProvider::new().with_delay(Duration::from_millis(50)));
        let (gateway, _clock) = gateway(provider.clone(), RateLimitTable::default());
        let gateway = Arc::new(gateway);
        let sessions = Arc::new(gateway.session_manager());
        let actor = Actor::user("u1");

        let first = {
            let gateway = Arc::clone(&gateway);
            let sessions = Arc::clone(&sessions);
            let actor = actor.clone();
            tokio::spawn(async move { gateway.autocomplete(&actor, &sessions, "ra", None).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        let second = gateway
            .autocomplete(&actor, &sessions, "ram", None)
            .await
            .unwrap();
        assert!(!second.is_empty());
        assert!(matches!(first.await.unwrap(), Err(GateError::Cancelled)));
    }

    #[tokio::test]
    async fn test_blank_autocomplete_skips_upstream() {
        let provider = Arc::new(MockPlaceProvider::new());
        let (gateway, _clock) = gateway(provider.clone(), RateLimitTable::default());
        let sessions = gateway.session_manager();

        let out = gateway
            .autocomplete(&Actor::user("u1"), &sessions, "   ", None)
            .await
            .unwrap();
        assert!(out.is_empty());
        assert_eq!(provider.autocomplete_calls(), 0);
    }

    #[tokio::test]
    async fn test_selecting_a_suggestion_consumes_the_session() {
        let provider = Arc::new(MockPlaceProvider::new());
        let (gateway, _clock) = gateway(provider.clone(), RateLimitTable::default());
        let sessions = gateway.session_manager();
        let actor = Actor::user("u1");

        let suggestions = gateway
            .autocomplete(&actor, &sessions, "pho", None)
            .await
            .unwrap();
        let token = sessions.token().unwrap();
        let chosen = suggestions[0].place_id.clone();

        let detail = gateway
            .select_suggestion(&actor, &sessions, chosen.clone(), FieldMask::Detail)
            .await
            .unwrap();
        assert_eq!(detail.place_id, chosen);
        assert_eq!(provider.last_session(), Some(token));
        assert_eq!(sessions.consume(), Err(SessionError::Consumed));
        assert_ne!(sessions.token().unwrap(), token);
    }

    #[tokio::test]
    async fn test_text_search_and_metrics() {
        let provider = Arc::new(MockPlaceProvider::new());
        let registry = Registry::new();
        let metrics = Arc::new(GateMetrics::register(&registry).unwrap());
        let (gateway, _clock) = gateway(provider.clone(), RateLimitTable::default());
        let gateway = gateway.with_metrics(metrics.clone());
        let actor = Actor::user("u1");

        let found = gateway
            .text_search(&actor, "  Best   Tacos ", None)
            .await
            .unwrap();
        assert!(!found.value.is_empty());
        let blank = gateway.text_search(&actor, "", None).await.unwrap();
        assert!(blank.value.is_empty());
        assert_eq!(provider.text_search_calls(), 1);

        assert_eq!(
            metrics
                .rate_decisions_total
                .with_label_values(&["search", "authenticated", "allowed"])
                .get(),
            1
        );
        assert_eq!(
            metrics
                .upstream_calls_total
                .with_label_values(&["text_search", "success"])
                .get(),
            1
        );
    }
}
