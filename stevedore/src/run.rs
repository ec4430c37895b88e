use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::Display;

/// Engine identity string recorded on runs executed by the cluster-backed
/// engine. Used as the engine filter when querying historical runs.
pub const KUBERNETES_ENGINE: &str = "kubernetes";

/// Lifecycle states of a run.
///
/// Transitions are monotonic: `Queued -> Running -> Stopped`, with no
/// back-edges. The derived ordering encodes that progression so callers can
/// guard against regressions with a comparison.
#[derive(
    Clone, Copy, Debug, Default, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    /// Accepted and enqueued, not yet submitted to the cluster.
    #[default]
    Queued,
    /// At least one pod is actively executing the run.
    Running,
    /// Terminal: the run finished, failed, or was terminated.
    Stopped,
}

impl RunStatus {
    /// Get the string representation of this status.
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Queued => "queued",
            RunStatus::Running => "running",
            RunStatus::Stopped => "stopped",
        }
    }

    /// Whether this status is terminal.
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunStatus::Stopped)
    }
}

impl Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Node lifecycle class a run is scheduled onto.
///
/// GPU runs are always forced onto on-demand capacity by the resource
/// planner; everything else defaults to spot.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeLifecycle {
    /// Preemptible spot capacity.
    #[default]
    Spot,
    /// Non-preemptible on-demand capacity.
    Ondemand,
}

impl NodeLifecycle {
    /// Get the string representation of this lifecycle class.
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeLifecycle::Spot => "spot",
            NodeLifecycle::Ondemand => "ondemand",
        }
    }
}

impl Display for NodeLifecycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A single name/value environment pair.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct EnvVar {
    /// Variable name; sanitized before reaching a container manifest.
    pub name: String,
    /// Variable value, passed through untouched.
    pub value: String,
}

impl EnvVar {
    /// Create a new environment pair.
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// A cluster event observed against a run's pod.
///
/// Two events are the same event when all five fields match; the
/// reconciliation loop relies on that value equality to merge idempotently.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct PodEvent {
    /// Human-readable event message.
    pub message: String,
    /// First time the event was observed, when the cluster reported one.
    pub timestamp: Option<DateTime<Utc>>,
    /// Event type, e.g. `Normal` or `Warning`.
    pub event_type: String,
    /// Machine-readable reason, e.g. `Scheduled`, `TriggeredScaleUp`.
    pub reason: String,
    /// Name of the object the event was recorded against.
    pub source_object: String,
}

/// A counted list of pod events, as returned from an event fetch.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PodEventList {
    /// Number of events in the list.
    pub total: usize,
    /// The events, in observation order.
    pub pod_events: Vec<PodEvent>,
}

impl PodEventList {
    /// Wrap a list of events, recording its length.
    pub fn new(pod_events: Vec<PodEvent>) -> Self {
        Self {
            total: pod_events.len(),
            pod_events,
        }
    }
}

/// The unit of work: one scheduled instance of a [`Definition`].
///
/// `run_id` is unique and doubles as the cluster job name, which is what
/// makes submission idempotent. Fields that are only known after cluster
/// observation (exit code, pod placement, timestamps) are `Option` so that
/// "unset" is never conflated with a zero value.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Run {
    /// Unique run identifier; used verbatim as the cluster job name.
    pub run_id: String,
    /// Identifier of the definition this run was created from.
    pub definition_id: String,
    /// Logical cluster the run is routed to.
    pub cluster_name: String,
    /// Grouping label for reporting.
    pub group_name: String,
    /// Container image reference.
    pub image: String,
    /// Free-form shell script, possibly multiline.
    pub command: Option<String>,
    /// Run-level environment, merged over the definition's environment.
    #[serde(default)]
    pub env: Vec<EnvVar>,
    /// Granted CPU in millicores; set by the resource planner.
    pub cpu: Option<i64>,
    /// Granted memory in MiB; set by the resource planner.
    pub memory: Option<i64>,
    /// Node lifecycle class the run is scheduled onto.
    pub node_lifecycle: Option<NodeLifecycle>,
    /// Current lifecycle status.
    #[serde(default)]
    pub status: RunStatus,
    /// Container exit code; set only on terminal transitions.
    pub exit_code: Option<i64>,
    /// Terminal reason reported by the cluster, e.g. `OOMKilled`.
    pub exit_reason: Option<String>,
    /// When the run was accepted onto the queue.
    pub queued_at: Option<DateTime<Utc>>,
    /// When the cluster job started.
    pub started_at: Option<DateTime<Utc>>,
    /// When the run reached a terminal state.
    pub finished_at: Option<DateTime<Utc>>,
    /// Name of the pod currently (or last) executing the run.
    pub pod_name: Option<String>,
    /// Namespace the pod was observed in.
    pub namespace: Option<String>,
    /// Name of the run's container inside the pod.
    pub container_name: Option<String>,
    /// DNS name of the node hosting the pod.
    pub instance_dns_name: Option<String>,
    /// High-water mark of observed CPU usage in millicores.
    pub max_cpu_used: Option<i64>,
    /// High-water mark of observed memory usage in MiB.
    pub max_memory_used: Option<i64>,
    /// Pod events observed so far, deduplicated, in first-observation order.
    #[serde(default)]
    pub pod_events: Vec<PodEvent>,
}

impl Run {
    /// Advance the usage watermarks with a fresh observation.
    ///
    /// Watermarks never decrease; a recorded value of zero counts as unset.
    pub fn observe_usage(&mut self, cpu_millis: i64, memory_mib: i64) {
        if self.max_cpu_used.unwrap_or(0) < cpu_millis {
            self.max_cpu_used = Some(cpu_millis);
        }
        if self.max_memory_used.unwrap_or(0) < memory_mib {
            self.max_memory_used = Some(memory_mib);
        }
    }

    /// Append events not already present, preserving first-observation order.
    ///
    /// Presence is decided by value equality over all event fields.
    pub fn merge_pod_events(&mut self, incoming: &[PodEvent]) {
        for event in incoming {
            if !self.pod_events.contains(event) {
                self.pod_events.push(event.clone());
            }
        }
    }
}

/// The reusable template a run is instantiated from.
///
/// Carries the image, declared resource defaults, environment, ports, and
/// the flag opting the definition into adaptive resource allocation.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Definition {
    /// Unique definition identifier.
    pub definition_id: String,
    /// Default container image for runs of this definition.
    pub image: String,
    /// Default CPU in millicores; `None` or zero falls through to the
    /// global minimum.
    pub cpu: Option<i64>,
    /// Default memory in MiB; `None` or zero falls through to the global
    /// minimum.
    pub memory: Option<i64>,
    /// Number of GPUs required; anything positive forces on-demand capacity.
    pub gpu: Option<i64>,
    /// Definition-level environment, overridden by run-level pairs.
    #[serde(default)]
    pub env: Vec<EnvVar>,
    /// Container ports to expose.
    #[serde(default)]
    pub ports: Vec<i32>,
    /// Whether historical usage may size this definition's runs.
    pub adaptive_resource_allocation: Option<bool>,
}

impl Definition {
    /// Number of GPUs requested, treating `None` as zero.
    pub fn gpu_count(&self) -> i64 {
        self.gpu.unwrap_or(0)
    }
}
