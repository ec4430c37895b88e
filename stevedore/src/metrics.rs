//! Prometheus metrics instrumentation for the engine.
//!
//! This module provides the counters the engine emits around submission,
//! queueing, termination, and reconciliation. All metrics are conditionally
//! compiled behind the `metrics` feature flag.
//!
//! # Metrics
//!
//! ## Counters
//! - `stevedore_engine_execute_total` - Run submissions, by outcome
//! - `stevedore_engine_enqueue_total` - Queue publishes, by outcome
//! - `stevedore_engine_terminate_total` - Terminations, by outcome
//! - `stevedore_engine_podname_change_total` - Pod replacements seen during reconciliation
//! - `stevedore_engine_node_scale_up_total` - Autoscaler scale-ups triggered by run pods, by source
#![cfg(feature = "metrics")]

use prometheus::{CounterVec, Opts, Registry};
use std::sync::LazyLock;

/// Global Prometheus registry for engine metrics.
pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

/// Counter for run submissions.
///
/// Labels:
/// - `status`: The submission outcome (success, failure)
pub static ENGINE_EXECUTE_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new(
        "stevedore_engine_execute_total",
        "Total number of run submissions",
    );
    CounterVec::new(opts, &["status"])
        .expect("stevedore_engine_execute_total metric creation failed")
});

/// Counter for queue publishes.
///
/// Labels:
/// - `status`: The publish outcome (success, failure)
pub static ENGINE_ENQUEUE_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new(
        "stevedore_engine_enqueue_total",
        "Total number of runs published to the queue",
    );
    CounterVec::new(opts, &["status"])
        .expect("stevedore_engine_enqueue_total metric creation failed")
});

/// Counter for run terminations.
///
/// Labels:
/// - `status`: The termination outcome (success, failure)
pub static ENGINE_TERMINATE_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new(
        "stevedore_engine_terminate_total",
        "Total number of run terminations",
    );
    CounterVec::new(opts, &["status"])
        .expect("stevedore_engine_terminate_total metric creation failed")
});

/// Counter for pod replacements observed during reconciliation.
pub static ENGINE_PODNAME_CHANGE_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new(
        "stevedore_engine_podname_change_total",
        "Total number of pod replacements observed for reconciled runs",
    );
    CounterVec::new(opts, &[])
        .expect("stevedore_engine_podname_change_total metric creation failed")
});

/// Counter for autoscaler scale-ups triggered by run pods.
///
/// Labels:
/// - `source`: The object that triggered the scale-up
pub static ENGINE_NODE_SCALE_UP_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new(
        "stevedore_engine_node_scale_up_total",
        "Total number of autoscaler scale-ups triggered by run pods",
    );
    CounterVec::new(opts, &["source"])
        .expect("stevedore_engine_node_scale_up_total metric creation failed")
});

/// Initialize all metrics by registering them with the global registry.
///
/// This function is idempotent - calling it multiple times is safe.
pub fn init_metrics() -> anyhow::Result<()> {
    let registry = &*REGISTRY;

    for metric in [
        Box::new(ENGINE_EXECUTE_TOTAL.clone()) as Box<dyn prometheus::core::Collector>,
        Box::new(ENGINE_ENQUEUE_TOTAL.clone()),
        Box::new(ENGINE_TERMINATE_TOTAL.clone()),
        Box::new(ENGINE_PODNAME_CHANGE_TOTAL.clone()),
        Box::new(ENGINE_NODE_SCALE_UP_TOTAL.clone()),
    ] {
        if let Err(e) = registry.register(metric) {
            let msg = e.to_string();
            if !msg.contains("Duplicate metrics collector registration attempted") {
                return Err(e.into());
            }
        }
    }

    Ok(())
}

/// Helper to record a submission outcome.
pub fn record_execute(status: &str) {
    ENGINE_EXECUTE_TOTAL.with_label_values(&[status]).inc();
}

/// Helper to record a queue publish outcome.
pub fn record_enqueue(status: &str) {
    ENGINE_ENQUEUE_TOTAL.with_label_values(&[status]).inc();
}

/// Helper to record a termination outcome.
pub fn record_terminate(status: &str) {
    ENGINE_TERMINATE_TOTAL.with_label_values(&[status]).inc();
}

/// Helper to record a pod replacement.
pub fn record_podname_change() {
    ENGINE_PODNAME_CHANGE_TOTAL.with_label_values(&[]).inc();
}

/// Helper to record an autoscaler scale-up trigger.
pub fn record_node_scale_up(source: &str) {
    ENGINE_NODE_SCALE_UP_TOTAL
        .with_label_values(&[source])
        .inc();
}

/// Gather all registered metrics in Prometheus text format.
pub fn gather_metrics() -> anyhow::Result<String> {
    let encoder = prometheus::TextEncoder::new();
    let metric_families = REGISTRY.gather();
    encoder
        .encode_to_string(&metric_families)
        .map_err(Into::into)
}
