//! Sliding-window rate limiting per actor and action.
//!
//! Each `actorKind:actorId:action` key owns one window that starts with the
//! first call and lasts the configured duration. Per key the state moves
//! Fresh -> Counting -> Expired -> Counting: an expired window is reset by
//! the next call, never incremented.
//!
//! The read-check-increment runs inside the store's atomic per-key update,
//! so concurrent callers sharing an actor cannot double-admit.

use std::sync::Arc;
use std::time::Duration;

use morsel_core::{
    Action, Actor, AuthTier, Clock, GateResult, RateKey, RateLimitError, RateLimitTable,
    RateRule, RateWindowRecord, StorageError, Timestamp,
};
use morsel_storage::{RateWindowStore, WindowWrite};
use serde::Serialize;

/// Outcome of a rate check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RateDecision {
    pub allowed: bool,
    /// Calls left in the current window after this one.
    pub remaining: u32,
    /// Configured ceiling; 0 when the action is disallowed for the tier.
    pub limit: u32,
    /// When the current window ends. `None` when the action is disallowed.
    pub reset_at: Option<Timestamp>,
    /// Exact wait before the next call can succeed. Set only when denied by
    /// an exhausted window.
    pub retry_after: Option<Duration>,
}

impl RateDecision {
    fn disallowed() -> Self {
        Self {
            allowed: false,
            remaining: 0,
            limit: 0,
            reset_at: None,
            retry_after: None,
        }
    }

    fn allowed(rule: RateRule, record: &RateWindowRecord) -> Self {
        Self {
            allowed: true,
            remaining: rule.limit.saturating_sub(record.count),
            limit: rule.limit,
            reset_at: Some(record.resets_at(rule.window)),
            retry_after: None,
        }
    }

    fn exhausted(rule: RateRule, record: &RateWindowRecord, now: Timestamp) -> Self {
        let reset_at = record.resets_at(rule.window);
        Self {
            allowed: false,
            remaining: 0,
            limit: rule.limit,
            reset_at: Some(reset_at),
            retry_after: Some((reset_at - now).to_std().unwrap_or(Duration::ZERO)),
        }
    }

    /// Denied because the action is not offered to this tier at all.
    pub fn is_disallowed(&self) -> bool {
        !self.allowed && self.limit == 0
    }

    /// The error a denied call surfaces at a call boundary. `None` when
    /// allowed.
    pub fn denial(&self, action: Action, tier: AuthTier) -> Option<RateLimitError> {
        if self.allowed {
            return None;
        }
        Some(match self.retry_after {
            Some(wait) => RateLimitError::rate_limited(action, wait),
            None => RateLimitError::ActionDisallowed { action, tier },
        })
    }

    /// Short label for logs and metrics.
    pub fn outcome(&self) -> &'static str {
        if self.allowed {
            "allowed"
        } else if self.is_disallowed() {
            "disallowed"
        } else {
            "limited"
        }
    }
}

/// Decide a call against the current record.
fn admit(
    current: Option<RateWindowRecord>,
    rule: RateRule,
    now: Timestamp,
) -> (WindowWrite, RateDecision) {
    match current {
        Some(record) if !record.is_expired(now, rule.window) => {
            if record.count >= rule.limit {
                (WindowWrite::Keep, RateDecision::exhausted(rule, &record, now))
            } else {
                let next = RateWindowRecord {
                    count: record.count + 1,
                    ..record
                };
                (WindowWrite::Put(next), RateDecision::allowed(rule, &next))
            }
        }
        _ => {
            let fresh = RateWindowRecord::open(now);
            (WindowWrite::Put(fresh), RateDecision::allowed(rule, &fresh))
        }
    }
}

/// Sliding-window limiter over a shared store.
pub struct RateLimiter<S> {
    store: Arc<S>,
    table: Arc<RateLimitTable>,
    clock: Arc<dyn Clock>,
}

impl<S: RateWindowStore> RateLimiter<S> {
    pub fn new(store: Arc<S>, table: Arc<RateLimitTable>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            table,
            clock,
        }
    }

    fn rule(&self, action: Action, tier: AuthTier) -> Option<RateRule> {
        self.table
            .rule(action, tier)
            .filter(|rule| !rule.is_disallowed())
    }

    /// Count one call and decide whether it may proceed.
    pub async fn check(&self, actor: &Actor, action: Action) -> Result<RateDecision, StorageError> {
        let key = RateKey::new(actor, action);
        let Some(rule) = self.rule(action, actor.tier()) else {
            tracing::debug!(key = %key, "Action disallowed for tier");
            return Ok(RateDecision::disallowed());
        };

        let now = self.clock.now();
        let decision = self
            .store
            .update(&key, move |current| admit(current, rule, now))
            .await?;

        if !decision.allowed {
            tracing::debug!(
                key = %key,
                limit = rule.limit,
                retry_after_ms = decision.retry_after.map(|d| d.as_millis() as u64),
                "Rate limit exceeded"
            );
        }

        Ok(decision)
    }

    /// Quota as `check` would see it, without counting a call.
    pub async fn status(&self, actor: &Actor, action: Action) -> Result<RateDecision, StorageError> {
        let key = RateKey::new(actor, action);
        let Some(rule) = self.rule(action, actor.tier()) else {
            return Ok(RateDecision::disallowed());
        };

        let now = self.clock.now();
        let current = match self.store.load(&key).await {
            Ok(record) => record,
            // `check` resets unreadable records, so report them as fresh.
            Err(StorageError::Corrupt { .. }) => None,
            Err(e) => return Err(e),
        };

        Ok(match current {
            Some(record) if !record.is_expired(now, rule.window) => {
                if record.count >= rule.limit {
                    RateDecision::exhausted(rule, &record, now)
                } else {
                    RateDecision::allowed(rule, &record)
                }
            }
            _ => RateDecision {
                allowed: true,
                remaining: rule.limit,
                limit: rule.limit,
                reset_at: Some(RateWindowRecord::open(now).resets_at(rule.window)),
                retry_after: None,
            },
        })
    }

    /// `check`, turning a denial into an error for use at a call boundary.
    pub async fn enforce(&self, actor: &Actor, action: Action) -> GateResult<RateDecision> {
        let decision = self.check(actor, action).await?;
        match decision.denial(action, actor.tier()) {
            Some(err) => Err(err.into()),
            None => Ok(decision),
        }
    }

    /// Delete windows that started before the longest configured window.
    pub async fn purge_expired(&self) -> Result<u64, StorageError> {
        let longest = self.table.longest_window();
        let cutoff = self.clock.now()
            - chrono::Duration::milliseconds(longest.as_millis() as i64);
        self.store.purge_windows_before(cutoff).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use morsel_core::{GateError, ManualClock};
    use morsel_storage::MemoryStore;
    use std::net::{IpAddr, Ipv4Addr};

    fn limiter(table: RateLimitTable) -> (RateLimiter<MemoryStore>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::default());
        let limiter = RateLimiter::new(
            Arc::new(MemoryStore::new()),
            Arc::new(table),
            clock.clone(),
        );
        (limiter, clock)
    }

    fn three_per_second() -> RateLimitTable {
        RateLimitTable::empty().with_rule(
            Action::Search,
            AuthTier::Authenticated,
            RateRule::new(3, 1_000),
        )
    }

    #[tokio::test]
    async fn test_remaining_counts_down() {
        let (limiter, _clock) = limiter(three_per_second());
        let actor = Actor::user("u1");

        let remaining: Vec<u32> = [
            limiter.check(&actor, Action::Search).await.unwrap(),
            limiter.check(&actor, Action::Search).await.unwrap(),
            limiter.check(&actor, Action::Search).await.unwrap(),
        ]
        .iter()
        .map(|d| d.remaining)
        .collect();
        assert_eq!(remaining, vec![2, 1, 0]);

        let denied = limiter.check(&actor, Action::Search).await.unwrap();
        assert!(!denied.allowed);
        assert_eq!(denied.outcome(), "limited");
        assert_eq!(denied.retry_after, Some(Duration::from_millis(1_000)));
    }

    #[tokio::test]
    async fn test_window_resets_exactly_at_duration() {
        let (limiter, clock) = limiter(three_per_second());
        let actor = Actor::user("u1");
        for _ in 0..3 {
            limiter.check(&actor, Action::Search).await.unwrap();
        }

        clock.advance(Duration::from_millis(999));
        let denied = limiter.check(&actor, Action::Search).await.unwrap();
        assert!(!denied.allowed);
        assert_eq!(denied.retry_after, Some(Duration::from_millis(1)));

        clock.advance(Duration::from_millis(1));
        let fresh = limiter.check(&actor, Action::Search).await.unwrap();
        assert!(fresh.allowed);
        assert_eq!(fresh.remaining, 2);
    }

    #[tokio::test]
    async fn test_denied_calls_do_not_extend_window() {
        let (limiter, clock) = limiter(three_per_second());
        let actor = Actor::user("u1");
        for _ in 0..3 {
            limiter.check(&actor, Action::Search).await.unwrap();
        }
        for _ in 0..5 {
            clock.advance(Duration::from_millis(100));
            assert!(!limiter.check(&actor, Action::Search).await.unwrap().allowed);
        }
        clock.advance(Duration::from_millis(500));
        assert!(limiter.check(&actor, Action::Search).await.unwrap().allowed);
    }

    #[tokio::test]
    async fn test_status_does_not_move_window() {
        let (limiter, clock) = limiter(three_per_second());
        let actor = Actor::user("u1");

        let before = limiter.status(&actor, Action::Search).await.unwrap();
        assert!(before.allowed);
        assert_eq!(before.remaining, 3);

        limiter.check(&actor, Action::Search).await.unwrap();
        for _ in 0..10 {
            let status = limiter.status(&actor, Action::Search).await.unwrap();
            assert_eq!(status.remaining, 2);
        }

        clock.advance(Duration::from_millis(400));
        limiter.check(&actor, Action::Search).await.unwrap();
        limiter.check(&actor, Action::Search).await.unwrap();
        let exhausted = limiter.status(&actor, Action::Search).await.unwrap();
        assert!(!exhausted.allowed);
        assert_eq!(exhausted.retry_after, Some(Duration::from_millis(600)));
    }

    #[tokio::test]
    async fn test_zero_limit_and_missing_action_are_disallowed() {
        let (limiter, _clock) = limiter(RateLimitTable::default().without(Action::Search));
        let anon = Actor::Ip(IpAddr::V4(Ipv4Addr::new(1, 2, 3, 4)));

        let photo = limiter.check(&anon, Action::Photo).await.unwrap();
        assert!(photo.is_disallowed());
        assert_eq!(photo.retry_after, None);

        let search = limiter.check(&Actor::user("u1"), Action::Search).await.unwrap();
        assert!(search.is_disallowed());
        assert_eq!(search.reset_at, None);
    }

    #[tokio::test]
    async fn test_enforce_maps_denials_to_errors() {
        let table = three_per_second().with_rule(
            Action::Photo,
            AuthTier::Anonymous,
            RateRule::disallowed(),
        );
        let (limiter, clock) = limiter(table);
        let actor = Actor::user("u1");
        for _ in 0..3 {
            limiter.enforce(&actor, Action::Search).await.unwrap();
        }

        clock.advance(Duration::from_millis(250));
        let err = limiter.enforce(&actor, Action::Search).await.unwrap_err();
        assert!(matches!(
            err,
            GateError::RateLimit(RateLimitError::RateLimited {
                action: Action::Search,
                retry_after_secs: 1,
            })
        ));

        let anon = Actor::Ip(IpAddr::V4(Ipv4Addr::LOCALHOST));
        let err = limiter.enforce(&anon, Action::Photo).await.unwrap_err();
        assert!(matches!(
            err,
            GateError::RateLimit(RateLimitError::ActionDisallowed {
                action: Action::Photo,
                tier: AuthTier::Anonymous,
            })
        ));
    }

    #[tokio::test]
    async fn test_purge_keeps_windows_inside_longest_window() {
        let (limiter, clock) = limiter(RateLimitTable::default());
        limiter.check(&Actor::user("old"), Action::ReviewWrite).await.unwrap();

        clock.advance(Duration::from_secs(1_800));
        limiter.check(&Actor::user("recent"), Action::Search).await.unwrap();
        assert_eq!(limiter.purge_expired().await.unwrap(), 0);

        clock.advance(Duration::from_secs(1_801));
        assert_eq!(limiter.purge_expired().await.unwrap(), 1);
    }
}
