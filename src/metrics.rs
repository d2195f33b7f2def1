//! Prometheus metrics for the reconciliation engine.
//!
//! Covers:
//! - Event production per cluster and event type
//! - Push-watch breaks and full-sync latency
//! - Running cluster watchers and coordination-tree sub-watches
//! - Pipeline task outcomes
//! - Leadership state
//!
//! All metrics live in a custom registry with the "fleetwatch" prefix.
//! Registration failures fall back to an unregistered metric instead of
//! panicking.

use once_cell::sync::Lazy;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, IntGaugeVec,
    Registry, TextEncoder, opts,
};
use tracing::warn;

/// Custom Prometheus registry for engine metrics.
pub static REGISTRY: Lazy<Registry> = Lazy::new(|| {
    Registry::new_custom(Some("fleetwatch".to_string()), None).unwrap_or_else(|_| Registry::new())
});

// =============================================================================
// Metric Declaration Macros
// =============================================================================

/// Declare an IntGauge metric.
macro_rules! define_gauge {
    ($name:ident, $metric_name:expr, $help:expr) => {
        #[doc = $help]
        pub static $name: Lazy<IntGauge> =
            Lazy::new(|| register_int_gauge_safe(&REGISTRY, $metric_name, $help));
    };
}

/// Declare an IntGaugeVec metric with labels.
macro_rules! define_gauge_vec {
    ($name:ident, $metric_name:expr, $help:expr, [$($label:expr),+ $(,)?]) => {
        #[doc = $help]
        pub static $name: Lazy<IntGaugeVec> = Lazy::new(|| {
            register_int_gauge_vec_safe(&REGISTRY, $metric_name, $help, &[$($label),+])
        });
    };
}

/// Declare an IntCounter metric (no labels).
macro_rules! define_counter {
    ($name:ident, $metric_name:expr, $help:expr) => {
        #[doc = $help]
        pub static $name: Lazy<IntCounter> =
            Lazy::new(|| register_int_counter_safe(&REGISTRY, $metric_name, $help));
    };
}

/// Declare an IntCounterVec metric with labels.
macro_rules! define_counter_vec {
    ($name:ident, $metric_name:expr, $help:expr, [$($label:expr),+ $(,)?]) => {
        #[doc = $help]
        pub static $name: Lazy<IntCounterVec> = Lazy::new(|| {
            register_int_counter_vec_safe(&REGISTRY, $metric_name, $help, &[$($label),+])
        });
    };
}

/// Declare a HistogramVec metric with labels and buckets.
macro_rules! define_histogram_vec {
    ($name:ident, $metric_name:expr, $help:expr, [$($label:expr),+ $(,)?], [$($bucket:expr),+ $(,)?]) => {
        #[doc = $help]
        pub static $name: Lazy<HistogramVec> = Lazy::new(|| {
            register_histogram_vec_safe(&REGISTRY, $metric_name, $help, &[$($label),+], vec![$($bucket),+])
        });
    };
}

// =============================================================================
// Watcher metrics
// =============================================================================

define_counter_vec!(
    EVENTS_EMITTED,
    "events_emitted_total",
    "Metric events emitted by cluster watchers",
    ["cluster", "event_type"]
);
define_counter_vec!(
    EVENTS_DROPPED,
    "events_dropped_total",
    "Metric events dropped before reaching the pipeline",
    ["reason"]
);
define_counter_vec!(
    WATCH_BREAKS,
    "watch_breaks_total",
    "Push-watch subscriptions that broke and were re-opened",
    ["cluster", "kind"]
);
define_histogram_vec!(
    FULL_SYNC_DURATION,
    "full_sync_duration_seconds",
    "Duration of one full-sync pass",
    ["kind"],
    [0.001, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 30.0]
);
define_counter_vec!(
    COLLABORATOR_ERRORS,
    "collaborator_errors_total",
    "Failed calls to storage, coordination store or application API",
    ["source"]
);
define_gauge!(
    ACTIVE_CLUSTER_WATCHERS,
    "active_cluster_watchers",
    "Cluster watchers currently running"
);
define_gauge!(
    ACTIVE_TREE_WATCHES,
    "active_tree_watches",
    "Coordination-tree sub-watches currently running"
);
define_gauge_vec!(
    TRACKED_ENDPOINTS,
    "tracked_endpoints",
    "Coordination-tree endpoints currently tracked per cluster",
    ["cluster"]
);

// =============================================================================
// Pipeline and leadership metrics
// =============================================================================

define_counter_vec!(
    PIPELINE_TASKS,
    "pipeline_tasks_total",
    "Pipeline actions by action and outcome",
    ["action", "status"]
);
define_gauge!(
    IS_MASTER,
    "is_master",
    "1 while this process holds the master role"
);
define_counter!(
    ROLE_TRANSITIONS,
    "role_transitions_total",
    "Master/slave role transitions observed"
);

// =============================================================================
// Recording helpers
// =============================================================================

/// Record an emitted metric event.
pub fn record_event(cluster: &str, event_type: &str) {
    EVENTS_EMITTED
        .with_label_values(&[cluster, event_type])
        .inc();
}

/// Record an event dropped before the pipeline.
pub fn record_dropped_event(reason: &str) {
    EVENTS_DROPPED.with_label_values(&[reason]).inc();
}

/// Record a broken push-watch.
pub fn record_watch_break(cluster: &str, kind: &str) {
    WATCH_BREAKS.with_label_values(&[cluster, kind]).inc();
}

/// Record a full-sync pass.
pub fn record_full_sync(kind: &str, duration_secs: f64) {
    FULL_SYNC_DURATION
        .with_label_values(&[kind])
        .observe(duration_secs);
}

/// Record a failed collaborator call.
pub fn record_collaborator_error(source: &str) {
    COLLABORATOR_ERRORS.with_label_values(&[source]).inc();
}

/// Record a pipeline action outcome.
pub fn record_pipeline_task(action: &str, success: bool) {
    let status = if success { "success" } else { "failure" };
    PIPELINE_TASKS.with_label_values(&[action, status]).inc();
}

/// Record a role transition.
pub fn set_master(is_master: bool) {
    IS_MASTER.set(if is_master { 1 } else { 0 });
    ROLE_TRANSITIONS.inc();
}

/// Set the number of tracked endpoints for a cluster.
pub fn set_tracked_endpoints(cluster: &str, count: usize) {
    TRACKED_ENDPOINTS
        .with_label_values(&[cluster])
        .set(count as i64);
}

/// Drop the tracked-endpoint series of a stopped cluster watcher.
pub fn clear_tracked_endpoints(cluster: &str) {
    let _ = TRACKED_ENDPOINTS.remove_label_values(&[cluster]);
}

/// Encode all metrics in Prometheus text format.
pub fn encode_metrics() -> Result<String, Box<dyn std::error::Error>> {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8(buffer)?)
}

// =============================================================================
// Safe registration
// =============================================================================

fn register_int_gauge_safe(registry: &Registry, name: &str, help: &str) -> IntGauge {
    let gauge = IntGauge::new(name, help).expect("metric name/help should be valid");
    match registry.register(Box::new(gauge.clone())) {
        Ok(()) => gauge,
        Err(e) => {
            warn!(name, error = %e, "Failed to register IntGauge metric, using unregistered fallback");
            gauge
        }
    }
}

fn register_int_gauge_vec_safe(
    registry: &Registry,
    name: &str,
    help: &str,
    labels: &[&str],
) -> IntGaugeVec {
    let gauge = IntGaugeVec::new(opts!(name, help), labels).expect("metric opts should be valid");
    match registry.register(Box::new(gauge.clone())) {
        Ok(()) => gauge,
        Err(e) => {
            warn!(name, error = %e, "Failed to register IntGaugeVec metric, using unregistered fallback");
            gauge
        }
    }
}

fn register_int_counter_safe(registry: &Registry, name: &str, help: &str) -> IntCounter {
    let counter = IntCounter::new(name, help).expect("metric name/help should be valid");
    match registry.register(Box::new(counter.clone())) {
        Ok(()) => counter,
        Err(e) => {
            warn!(name, error = %e, "Failed to register IntCounter metric, using unregistered fallback");
            counter
        }
    }
}

fn register_int_counter_vec_safe(
    registry: &Registry,
    name: &str,
    help: &str,
    labels: &[&str],
) -> IntCounterVec {
    let counter =
        IntCounterVec::new(opts!(name, help), labels).expect("metric opts should be valid");
    match registry.register(Box::new(counter.clone())) {
        Ok(()) => counter,
        Err(e) => {
            warn!(name, error = %e, "Failed to register IntCounterVec metric, using unregistered fallback");
            counter
        }
    }
}

fn register_histogram_vec_safe(
    registry: &Registry,
    name: &str,
    help: &str,
    labels: &[&str],
    buckets: Vec<f64>,
) -> HistogramVec {
    let histogram = HistogramVec::new(HistogramOpts::new(name, help).buckets(buckets), labels)
        .expect("metric opts should be valid");
    match registry.register(Box::new(histogram.clone())) {
        Ok(()) => histogram,
        Err(e) => {
            warn!(name, error = %e, "Failed to register HistogramVec metric, using unregistered fallback");
            histogram
        }
    }
}
