//! Prometheus Metrics Definitions
//!
//! Gateway metrics are registered into a caller-supplied `Registry` so each
//! gateway (and each test) owns an isolated set.

use prometheus::{HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry};

/// Upstream call latency buckets (seconds)
/// Covers: 10ms, 25ms, 50ms, 100ms, 250ms, 500ms, 1s, 2.5s, 5s, 10s
const UPSTREAM_LATENCY_BUCKETS: &[f64] =
    &[0.010, 0.025, 0.050, 0.100, 0.250, 0.500, 1.0, 2.5, 5.0, 10.0];

/// Container for all gateway metrics.
#[derive(Clone)]
pub struct GateMetrics {
    /// Tile cache lookups - labels: result (hit/miss)
    pub tile_lookups_total: IntCounterVec,

    /// Coalesced calls - labels: operation, role (leader/follower)
    pub coalesced_calls_total: IntCounterVec,

    /// Rate limit decisions - labels: action, tier, outcome
    pub rate_decisions_total: IntCounterVec,

    /// Upstream provider calls - labels: operation, status
    pub upstream_calls_total: IntCounterVec,

    /// Upstream call duration histogram - labels: operation
    pub upstream_duration_seconds: HistogramVec,
}

impl GateMetrics {
    /// Create all metrics and register them with `registry`.
    pub fn register(registry: &Registry) -> prometheus::Result<Self> {
        let metrics = Self {
            tile_lookups_total: IntCounterVec::new(
                Opts::new("morsel_tile_lookups_total", "Tile cache lookups by result"),
                &["result"],
            )?,
            coalesced_calls_total: IntCounterVec::new(
                Opts::new(
                    "morsel_coalesced_calls_total",
                    "Coalesced upstream requests by role",
                ),
                &["operation", "role"],
            )?,
            rate_decisions_total: IntCounterVec::new(
                Opts::new("morsel_rate_decisions_total", "Rate limit decisions"),
                &["action", "tier", "outcome"],
            )?,
            upstream_calls_total: IntCounterVec::new(
                Opts::new("morsel_upstream_calls_total", "Upstream provider calls"),
                &["operation", "status"],
            )?,
            upstream_duration_seconds: HistogramVec::new(
                HistogramOpts::new(
                    "morsel_upstream_duration_seconds",
                    "Upstream provider call duration in seconds",
                )
                .buckets(UPSTREAM_LATENCY_BUCKETS.to_vec()),
                &["operation"],
            )?,
        };

        registry.register(Box::new(metrics.tile_lookups_total.clone()))?;
        registry.register(Box::new(metrics.coalesced_calls_total.clone()))?;
        registry.register(Box::new(metrics.rate_decisions_total.clone()))?;
        registry.register(Box::new(metrics.upstream_calls_total.clone()))?;
        registry.register(Box::new(metrics.upstream_duration_seconds.clone()))?;

        Ok(metrics)
    }

    /// Record the outcome of one viewport plan.
    pub fn record_tile_lookups(&self, hits: usize, misses: usize) {
        self.tile_lookups_total
            .with_label_values(&["hit"])
            .inc_by(hits as u64);
        self.tile_lookups_total
            .with_label_values(&["miss"])
            .inc_by(misses as u64);
    }

    /// Record whether a caller led or joined an upstream request.
    pub fn record_coalesced(&self, operation: &str, was_shared: bool) {
        let role = if was_shared { "follower" } else { "leader" };
        self.coalesced_calls_total
            .with_label_values(&[operation, role])
            .inc();
    }

    /// Record a rate limit decision.
    pub fn record_rate_decision(&self, action: &str, tier: &str, outcome: &str) {
        self.rate_decisions_total
            .with_label_values(&[action, tier, outcome])
            .inc();
    }

    /// Record an upstream call.
    pub fn record_upstream(&self, operation: &str, success: bool, duration_secs: f64) {
        let status = if success { "success" } else { "error" };
        self.upstream_calls_total
            .with_label_values(&[operation, status])
            .inc();
        self.upstream_duration_seconds
            .with_label_values(&[operation])
            .observe(duration_secs);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prometheus::Encoder;

    #[test]
    fn test_register_and_record() {
        let registry = Registry::new();
        let metrics = GateMetrics::register(&registry).unwrap();

        metrics.record_tile_lookups(3, 2);
        metrics.record_coalesced("fetch_tile", false);
        metrics.record_coalesced("fetch_tile", true);
        metrics.record_coalesced("fetch_tile", true);
        metrics.record_rate_decision("search", "anonymous", "limited");
        metrics.record_upstream("fetch_tile", true, 0.02);

        assert_eq!(
            metrics.tile_lookups_total.with_label_values(&["hit"]).get(),
            3
        );
        assert_eq!(
            metrics
                .coalesced_calls_total
                .with_label_values(&["fetch_tile", "follower"])
                .get(),
            2
        );

        let text = prometheus::TextEncoder::new()
            .encode_to_string(&registry.gather())
            .unwrap();
        assert!(text.contains("morsel_rate_decisions_total"));
        assert!(text.contains("morsel_upstream_duration_seconds"));
    }

    #[test]
    fn test_double_registration_fails() {
        let registry = Registry::new();
        GateMetrics::register(&registry).unwrap();
        assert!(GateMetrics::register(&registry).is_err());
    }

    #[test]
    fn test_separate_registries_are_isolated() {
        let a = GateMetrics::register(&Registry::new()).unwrap();
        let b = GateMetrics::register(&Registry::new()).unwrap();
        a.record_tile_lookups(1, 0);
        assert_eq!(b.tile_lookups_total.with_label_values(&["hit"]).get(), 0);
    }
}
