//! Prometheus metrics.
//!
//! All metrics live in a custom registry prefixed with `connectify` so they
//! never collide with metrics registered by dependencies.

use once_cell::sync::Lazy;
use prometheus::core::Collector;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, IntGaugeVec, Registry,
    TextEncoder, opts,
};
use tracing::warn;

pub static REGISTRY: Lazy<Registry> = Lazy::new(|| {
    Registry::new_custom(Some("connectify".to_string()), None).unwrap_or_else(|_| Registry::new())
});

/// Register `collector` with [`REGISTRY`]. A failed registration is logged
/// and the collector keeps counting, just without being exported.
fn registered<C>(name: &str, collector: C) -> C
where
    C: Collector + Clone + 'static,
{
    if let Err(e) = REGISTRY.register(Box::new(collector.clone())) {
        warn!(name, error = %e, "Metric not registered");
    }
    collector
}

macro_rules! define_gauge {
    ($name:ident, $metric:expr, $help:expr) => {
        #[doc = $help]
        pub static $name: Lazy<IntGauge> = Lazy::new(|| {
            registered($metric, IntGauge::new($metric, $help).expect("valid gauge"))
        });
    };
}

macro_rules! define_vec {
    ($name:ident: $ty:ident, $metric:expr, $help:expr, [$($label:expr),+ $(,)?]) => {
        #[doc = $help]
        pub static $name: Lazy<$ty> = Lazy::new(|| {
            registered(
                $metric,
                $ty::new(opts!($metric, $help), &[$($label),+]).expect("valid metric vec"),
            )
        });
    };
}

macro_rules! define_histogram_vec {
    ($name:ident, $metric:expr, $help:expr, [$($label:expr),+ $(,)?], [$($bucket:expr),+ $(,)?]) => {
        #[doc = $help]
        pub static $name: Lazy<HistogramVec> = Lazy::new(|| {
            let opts = HistogramOpts::new($metric, $help).buckets(vec![$($bucket),+]);
            registered(
                $metric,
                HistogramVec::new(opts, &[$($label),+]).expect("valid histogram"),
            )
        });
    };
}

// =============================================================================
// Data plane
// =============================================================================

define_vec!(
    PRODUCE_REQUESTS: IntCounterVec,
    "produce_requests_total",
    "Produce requests handled, by outcome",
    ["status"]
);
define_vec!(
    CONSUME_REQUESTS: IntCounterVec,
    "consume_requests_total",
    "Consume requests handled, by outcome",
    ["status"]
);
define_histogram_vec!(
    REPLICA_PROPOSAL_DURATION,
    "replica_proposal_duration_seconds",
    "Time from proposal to commit on a partition replica",
    ["status"],
    [0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]
);
define_gauge!(
    HOSTED_REPLICAS,
    "hosted_replicas",
    "Partition replicas hosted by this broker"
);

// =============================================================================
// Control plane
// =============================================================================

define_vec!(
    BROKER_TRANSITIONS: IntCounterVec,
    "broker_transitions_total",
    "Broker activate/deactivate transitions",
    ["transition"]
);
define_vec!(
    PENDING_REQUESTS: IntGaugeVec,
    "pending_requests",
    "Requests queued for an inactive broker",
    ["broker"]
);
define_vec!(
    SYNC_BROADCASTS: IntCounterVec,
    "sync_broadcasts_total",
    "Sync pushes to read-only managers, by outcome",
    ["route", "status"]
);

/// Encode all metrics in Prometheus text format.
pub fn encode_metrics() -> Result<String, Box<dyn std::error::Error + Send + Sync>> {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8(buffer)?)
}

pub fn record_produce(status: &str) {
    PRODUCE_REQUESTS.with_label_values(&[status]).inc();
}

pub fn record_consume(status: &str) {
    CONSUME_REQUESTS.with_label_values(&[status]).inc();
}

pub fn record_broker_transition(transition: &str) {
    BROKER_TRANSITIONS.with_label_values(&[transition]).inc();
}

pub fn set_pending_requests(broker: &str, depth: usize) {
    PENDING_REQUESTS
        .with_label_values(&[broker])
        .set(depth as i64);
}

pub fn record_sync(route: &str, status: &str) {
    SYNC_BROADCASTS.with_label_values(&[route, status]).inc();
}

pub fn record_proposal(status: &str, duration_secs: f64) {
    REPLICA_PROPOSAL_DURATION
        .with_label_values(&[status])
        .observe(duration_secs);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_contains_recorded_metric() {
        record_produce("success");
        record_broker_transition("deactivate");
        let text = encode_metrics().unwrap();
        assert!(text.contains("connectify_produce_requests_total"));
        assert!(text.contains("connectify_broker_transitions_total"));
    }

    #[test]
    fn test_pending_gauge_tracks_depth() {
        set_pending_requests("metrics-test-broker", 4);
        assert_eq!(
            PENDING_REQUESTS
                .with_label_values(&["metrics-test-broker"])
                .get(),
            4
        );
    }
}
