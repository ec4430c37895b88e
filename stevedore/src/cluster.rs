use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

use crate::run::EnvVar;

/// Errors from cluster API calls.
///
/// Submission errors are classified by message text, the same way the API
/// server reports them: a duplicate job says "already exists", a rejected
/// manifest says "is invalid". Everything else is assumed transient.
#[derive(Debug, Error)]
pub enum ClusterError {
    /// The API server rejected the request; carries the server's message.
    #[error("cluster api error: {0}")]
    Api(String),
    /// The named object does not exist.
    #[error("not found: {0}")]
    NotFound(String),
    /// Transport-level failure reaching the cluster.
    #[error("cluster transport error: {0}")]
    Transport(#[source] anyhow::Error),
}

impl ClusterError {
    /// Whether this error reports a job that already exists.
    pub fn is_already_exists(&self) -> bool {
        self.message_contains("already exists")
    }

    /// Whether this error reports a manifest the cluster considers invalid.
    pub fn is_invalid(&self) -> bool {
        self.message_contains("is invalid")
    }

    fn message_contains(&self, needle: &str) -> bool {
        self.to_string().to_lowercase().contains(needle)
    }
}

/// A CPU/memory/GPU triple, each axis optional.
///
/// CPU is millicores, memory is MiB, GPU is a whole-device count.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct ResourceList {
    /// CPU in millicores.
    pub cpu_millis: Option<i64>,
    /// Memory in MiB.
    pub memory_mib: Option<i64>,
    /// GPU device count (extended resource).
    pub gpu: Option<i64>,
}

/// Requests and limits for a container, request <= limit on both axes.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct ResourceRequirements {
    /// Hard caps the container may not exceed.
    pub limits: ResourceList,
    /// Scheduling requests the node must be able to satisfy.
    pub requests: ResourceList,
}

/// Operator for a node-selector requirement.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum SelectorOperator {
    /// The node label value must be one of the listed values.
    In,
    /// The node label value must not be any of the listed values.
    NotIn,
}

/// One required node-selector match expression.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct NodeSelectorRequirement {
    /// Node label key, e.g. `kubernetes.io/lifecycle`.
    pub key: String,
    /// Match operator.
    pub operator: SelectorOperator,
    /// Values matched against the label.
    pub values: Vec<String>,
}

/// Required-during-scheduling node affinity for a pod template.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct NodeAffinity {
    /// Match expressions that must all hold for a node to be eligible.
    pub required: Vec<NodeSelectorRequirement>,
}

/// Pod restart policy. Runs never restart in place; retries happen at the
/// job level through the backoff limit.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub enum RestartPolicy {
    /// Never restart a finished container.
    #[default]
    Never,
    /// Restart only on failure.
    OnFailure,
    /// Always restart.
    Always,
}

/// The container a run executes in.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ContainerSpec {
    /// Container name; the run id for submitted runs.
    pub name: String,
    /// Image reference.
    pub image: String,
    /// Full command slice, shell wrapper included.
    pub command: Vec<String>,
    /// Sanitized, merged environment.
    pub env: Vec<EnvVar>,
    /// Exposed container ports.
    pub ports: Vec<i32>,
    /// Requests and limits granted by the planner.
    pub resources: ResourceRequirements,
}

/// A job manifest ready for submission.
///
/// The manifest name is the run id; resubmitting the same run therefore
/// collides on the job name and is reported back as "already exists".
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct JobManifest {
    /// Job name; equal to the run id.
    pub name: String,
    /// Seconds a finished job lingers before the cluster reaps it.
    pub ttl_seconds_after_finished: i32,
    /// Wall-clock ceiling for the job, lifecycle-class dependent.
    pub active_deadline_seconds: i64,
    /// Pod retry budget.
    pub backoff_limit: i32,
    /// Pod template annotations.
    pub annotations: BTreeMap<String, String>,
    /// Scheduler responsible for placing the pod.
    pub scheduler_name: String,
    /// Service account the pod runs under.
    pub service_account_name: String,
    /// Pod restart policy.
    pub restart_policy: RestartPolicy,
    /// Node affinity synthesized from the run's resource shape.
    pub affinity: Option<NodeAffinity>,
    /// The single container executing the run.
    pub container: ContainerSpec,
}

/// Counts and times observed on a job's status block.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct JobStatus {
    /// Number of actively running pods.
    pub active: i32,
    /// Number of pods that succeeded.
    pub succeeded: i32,
    /// Number of pods that failed.
    pub failed: i32,
    /// When the job controller started the job.
    pub start_time: Option<DateTime<Utc>>,
    /// When the job completed, if it has.
    pub completion_time: Option<DateTime<Utc>>,
}

/// A job as read back from the cluster.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ClusterJob {
    /// Job name.
    pub name: String,
    /// Observed status block.
    pub status: JobStatus,
}

/// Terminal state of a finished container.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct TerminatedState {
    /// Process exit code.
    pub exit_code: i64,
    /// Cluster-reported reason, e.g. `Completed`, `OOMKilled`, `Error`.
    pub reason: String,
}

/// Status of one container within a pod.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ContainerStatus {
    /// Container name.
    pub name: String,
    /// Terminal state, when the container has finished.
    pub terminated: Option<TerminatedState>,
}

/// A pod observed for a run's job.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PodDescriptor {
    /// Pod name.
    pub name: String,
    /// Namespace the pod lives in.
    pub namespace: String,
    /// DNS name of the node hosting the pod, when scheduled.
    pub node_name: Option<String>,
    /// Creation timestamp; retries produce newer pods.
    pub created_at: Option<DateTime<Utc>>,
    /// Container specs, in declaration order.
    pub containers: Vec<ContainerSpec>,
    /// Container statuses, in declaration order.
    pub container_statuses: Vec<ContainerStatus>,
}

/// An event recorded against a cluster object.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ClusterEvent {
    /// Human-readable message.
    pub message: String,
    /// Machine-readable reason.
    pub reason: String,
    /// Event type, e.g. `Normal` or `Warning`.
    pub event_type: String,
    /// First time the event was observed.
    pub first_timestamp: Option<DateTime<Utc>>,
    /// Name of the object the event refers to.
    pub object_name: String,
}

/// Point-in-time usage of one container.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct ContainerUsage {
    /// Container name.
    pub name: String,
    /// CPU usage in millicores.
    pub cpu_millis: i64,
    /// Memory usage in MiB.
    pub memory_mib: i64,
}

/// Usage sample for a pod, one entry per container.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PodMetrics {
    /// Per-container usage, in declaration order.
    pub containers: Vec<ContainerUsage>,
}

/// Deletion propagation policy.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub enum PropagationPolicy {
    /// Delete the owner first, dependents in the background.
    #[default]
    Background,
    /// Delete dependents before the owner.
    Foreground,
    /// Leave dependents in place.
    Orphan,
}

/// Options applied to delete calls.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct DeleteOptions {
    /// Seconds of grace before forceful deletion.
    pub grace_period_seconds: i64,
    /// Propagation policy for dependent objects.
    pub propagation: PropagationPolicy,
}

impl DeleteOptions {
    /// Immediate deletion with background propagation, as used by terminate.
    pub fn immediate() -> Self {
        Self {
            grace_period_seconds: 0,
            propagation: PropagationPolicy::Background,
        }
    }
}

/// Label selector matching the pods of a run's job.
pub fn job_name_selector(run_id: &str) -> String {
    format!("job-name={run_id}")
}

/// Field selector matching events recorded against a pod.
pub fn involved_object_selector(pod_name: &str) -> String {
    format!("involvedObject.name=={pod_name}")
}

/// Shared handle onto the cluster's job and pod surface.
///
/// Implementations are externally owned and injected at engine
/// initialization; the engine never constructs or tears them down. All
/// methods are blocking I/O from the engine's perspective and must honor
/// the caller's cancellation.
#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// Submit a job manifest, returning the job as the cluster accepted it.
    async fn create_job(
        &self,
        namespace: &str,
        manifest: &JobManifest,
    ) -> Result<ClusterJob, ClusterError>;

    /// Fetch a job by name.
    async fn get_job(&self, namespace: &str, name: &str) -> Result<ClusterJob, ClusterError>;

    /// Delete a job.
    async fn delete_job(
        &self,
        namespace: &str,
        name: &str,
        options: &DeleteOptions,
    ) -> Result<(), ClusterError>;

    /// List pods matching a label selector.
    async fn list_pods(
        &self,
        namespace: &str,
        label_selector: &str,
    ) -> Result<Vec<PodDescriptor>, ClusterError>;

    /// Delete a pod.
    async fn delete_pod(
        &self,
        namespace: &str,
        name: &str,
        options: &DeleteOptions,
    ) -> Result<(), ClusterError>;

    /// List events matching a field selector.
    async fn list_events(
        &self,
        namespace: &str,
        field_selector: &str,
    ) -> Result<Vec<ClusterEvent>, ClusterError>;
}

/// Shared handle onto the cluster's pod-metrics API.
#[async_trait]
pub trait PodMetricsSource: Send + Sync {
    /// Fetch the current usage sample for a pod.
    async fn pod_metrics(
        &self,
        namespace: &str,
        pod_name: &str,
    ) -> Result<PodMetrics, ClusterError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn submission_errors_classify_by_message() {
        let dup = ClusterError::Api("jobs.batch \"run-1\" already exists".to_string());
        assert!(dup.is_already_exists());
        assert!(!dup.is_invalid());

        let invalid = ClusterError::Api("Job.batch \"run-1\" is invalid: spec".to_string());
        assert!(invalid.is_invalid());
        assert!(!invalid.is_already_exists());

        let transient = ClusterError::Api("etcdserver: request timed out".to_string());
        assert!(!transient.is_already_exists());
        assert!(!transient.is_invalid());
    }

    #[test]
    fn classification_is_case_insensitive() {
        let dup = ClusterError::Api("Already Exists".to_string());
        assert!(dup.is_already_exists());
    }

    #[test]
    fn selectors_format_as_cluster_expects() {
        assert_eq!(job_name_selector("run-9"), "job-name=run-9");
        assert_eq!(
            involved_object_selector("run-9-abc12"),
            "involvedObject.name==run-9-abc12"
        );
    }
}
