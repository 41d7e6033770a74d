//! Global metrics registry and metric handle definitions.

use prometheus::{HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts, Registry};

use std::sync::LazyLock;

/// Global metrics instance. Initialized once, accessed from any call site.
static METRICS: LazyLock<Metrics> = LazyLock::new(Metrics::new);

/// All Prometheus metric handles for the process.
///
/// Access via `Metrics::global()`. Metric handles are cheap to clone (Arc
/// internally) so call sites can grab references without threading state.
pub struct Metrics {
    pub(crate) registry: Registry,

    /// Provider attempts.
    /// Labels: provider, outcome (ok/transient/rate_limit/permanent).
    pub provider_attempts_total: IntCounterVec,

    /// Provider attempt duration in seconds.
    /// Label: provider.
    pub provider_request_duration_seconds: HistogramVec,

    /// Generations where every provider failed.
    pub chain_exhausted_total: IntCounter,

    /// Generations currently holding a concurrency slot.
    pub in_flight_generations: IntGauge,

    /// Requests rejected by the sequencer.
    /// Label: reason.
    pub queue_rejections_total: IntCounterVec,

    /// Throttle decisions for autonomous candidates.
    /// Label: decision (proceed/suppressed).
    pub throttle_decisions_total: IntCounterVec,
}

impl Metrics {
    fn new() -> Self {
        let registry = Registry::new();

        let provider_attempts_total = IntCounterVec::new(
            Opts::new("pals_provider_attempts_total", "Provider completion attempts"),
            &["provider", "outcome"],
        )
        .expect("hardcoded metric descriptor");

        let provider_request_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "pals_provider_request_duration_seconds",
                "Provider attempt duration in seconds",
            )
            .buckets(vec![0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 15.0, 30.0, 60.0, 120.0]),
            &["provider"],
        )
        .expect("hardcoded metric descriptor");

        let chain_exhausted_total = IntCounter::new(
            "pals_chain_exhausted_total",
            "Generations where every provider failed",
        )
        .expect("hardcoded metric descriptor");

        let in_flight_generations = IntGauge::new(
            "pals_in_flight_generations",
            "Generations currently holding a concurrency slot",
        )
        .expect("hardcoded metric descriptor");

        let queue_rejections_total = IntCounterVec::new(
            Opts::new("pals_queue_rejections_total", "Requests rejected at enqueue"),
            &["reason"],
        )
        .expect("hardcoded metric descriptor");

        let throttle_decisions_total = IntCounterVec::new(
            Opts::new(
                "pals_throttle_decisions_total",
                "Bot-exchange throttle decisions",
            ),
            &["decision"],
        )
        .expect("hardcoded metric descriptor");

        registry
            .register(Box::new(provider_attempts_total.clone()))
            .expect("hardcoded metric");
        registry
            .register(Box::new(provider_request_duration_seconds.clone()))
            .expect("hardcoded metric");
        registry
            .register(Box::new(chain_exhausted_total.clone()))
            .expect("hardcoded metric");
        registry
            .register(Box::new(in_flight_generations.clone()))
            .expect("hardcoded metric");
        registry
            .register(Box::new(queue_rejections_total.clone()))
            .expect("hardcoded metric");
        registry
            .register(Box::new(throttle_decisions_total.clone()))
            .expect("hardcoded metric");

        Self {
            registry,
            provider_attempts_total,
            provider_request_duration_seconds,
            chain_exhausted_total,
            in_flight_generations,
            queue_rejections_total,
            throttle_decisions_total,
        }
    }

    /// Access the global metrics instance.
    pub fn global() -> &'static Self {
        &METRICS
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registered_metrics_render() {
        Metrics::global().chain_exhausted_total.inc();
        let text = crate::telemetry::render().unwrap();
        assert!(text.contains("pals_chain_exhausted_total"));
    }
}
