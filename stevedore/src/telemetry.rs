//! Tracing and telemetry instrumentation for the engine.
//!
//! This module provides helper functions for creating tracing spans and
//! recording counters around run lifecycle events. All functions work both
//! with and without the `metrics` feature flag; counters are fire-and-forget
//! and never affect control flow.

use tracing::{info_span, Span};

/// Outcome label attached to operation counters.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Outcome {
    /// The operation completed.
    Success,
    /// The operation failed.
    Failure,
}

impl Outcome {
    /// Get the string representation of this outcome.
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Success => "success",
            Outcome::Failure => "failure",
        }
    }
}

/// Create a tracing span for a run submission.
#[must_use]
pub fn submit_span(run_id: impl AsRef<str>) -> Span {
    info_span!("stevedore.submit", run_id = %run_id.as_ref())
}

/// Create a tracing span for a reconciliation pass.
#[must_use]
pub fn reconcile_span(run_id: impl AsRef<str>) -> Span {
    info_span!("stevedore.reconcile", run_id = %run_id.as_ref())
}

/// Record a submission outcome.
pub fn record_execute(outcome: Outcome) {
    tracing::info!(status = outcome.as_str(), "run submitted");

    #[cfg(feature = "metrics")]
    crate::metrics::record_execute(outcome.as_str());
}

/// Record a queue publish outcome.
pub fn record_enqueue(outcome: Outcome) {
    tracing::info!(status = outcome.as_str(), "run enqueued");

    #[cfg(feature = "metrics")]
    crate::metrics::record_enqueue(outcome.as_str());
}

/// Record a termination outcome.
pub fn record_terminate(outcome: Outcome) {
    tracing::info!(status = outcome.as_str(), "run terminated");

    #[cfg(feature = "metrics")]
    crate::metrics::record_terminate(outcome.as_str());
}

/// Record that reconciliation found a newer pod for a run.
pub fn record_podname_change(run_id: &str, previous: &str, next: &str) {
    tracing::info!(
        run_id = %run_id,
        prev_pod_name = %previous,
        next_pod_name = %next,
        "pod replaced"
    );

    #[cfg(feature = "metrics")]
    crate::metrics::record_podname_change();
}

/// Record an autoscaler scale-up triggered by a run's pod.
pub fn record_node_scale_up(source_object: &str) {
    tracing::info!(source = %source_object, "node scale-up triggered");

    #[cfg(feature = "metrics")]
    crate::metrics::record_node_scale_up(&format!("source:{source_object}"));
}
