use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

use stevedore::{
    ClusterClient, ClusterError, ClusterEvent, ClusterJob, DeleteOptions, JobManifest, JobStatus,
    PodDescriptor, PodMetrics, PodMetricsSource,
};

/// How the fake cluster answers the next job submissions.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum SubmitBehavior {
    /// Accept manifests normally; duplicates still collide.
    #[default]
    Accept,
    /// Reject every manifest as invalid.
    RejectInvalid,
    /// Fail every submission with a transient error.
    FailTransient,
}

#[derive(Default)]
struct ClusterState {
    jobs: HashMap<String, ClusterJob>,
    manifests: Vec<JobManifest>,
    pods: HashMap<String, Vec<PodDescriptor>>,
    events: Vec<ClusterEvent>,
    deleted_jobs: Vec<String>,
    deleted_pods: Vec<String>,
    submit_behavior: SubmitBehavior,
    fail_pod_deletes: bool,
}

/// In-memory cluster: jobs keyed by name, pods keyed by the `job-name`
/// label, events matched by involved-object name.
#[derive(Clone, Default)]
pub struct InMemoryCluster {
    state: Arc<Mutex<ClusterState>>,
}

impl InMemoryCluster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Script how subsequent submissions are answered.
    pub fn set_submit_behavior(&self, behavior: SubmitBehavior) {
        self.state.lock().submit_behavior = behavior;
    }

    /// Make pod deletes fail while job deletes keep succeeding.
    pub fn fail_pod_deletes(&self, fail: bool) {
        self.state.lock().fail_pod_deletes = fail;
    }

    /// Overwrite the status block of a stored job.
    pub fn set_job_status(&self, name: &str, status: JobStatus) {
        let mut state = self.state.lock();
        state
            .jobs
            .entry(name.to_string())
            .or_insert_with(|| ClusterJob {
                name: name.to_string(),
                status: JobStatus::default(),
            })
            .status = status;
    }

    /// Register a pod under a job's `job-name` label.
    pub fn add_pod(&self, job_name: &str, pod: PodDescriptor) {
        self.state
            .lock()
            .pods
            .entry(job_name.to_string())
            .or_default()
            .push(pod);
    }

    /// Drop all pods registered for a job.
    pub fn clear_pods(&self, job_name: &str) {
        self.state.lock().pods.remove(job_name);
    }

    /// Record an event.
    pub fn add_event(&self, event: ClusterEvent) {
        self.state.lock().events.push(event);
    }

    /// Manifests accepted so far, in submission order.
    pub fn submitted_manifests(&self) -> Vec<JobManifest> {
        self.state.lock().manifests.clone()
    }

    /// Names of jobs deleted so far.
    pub fn deleted_jobs(&self) -> Vec<String> {
        self.state.lock().deleted_jobs.clone()
    }

    /// Names of pods deleted so far.
    pub fn deleted_pods(&self) -> Vec<String> {
        self.state.lock().deleted_pods.clone()
    }
}

#[async_trait]
impl ClusterClient for InMemoryCluster {
    async fn create_job(
        &self,
        _namespace: &str,
        manifest: &JobManifest,
    ) -> Result<ClusterJob, ClusterError> {
        let mut state = self.state.lock();
        match state.submit_behavior {
            SubmitBehavior::RejectInvalid => {
                return Err(ClusterError::Api(format!(
                    "Job.batch \"{}\" is invalid: spec.template.spec.containers[0].image",
                    manifest.name
                )));
            }
            SubmitBehavior::FailTransient => {
                return Err(ClusterError::Api(
                    "etcdserver: request timed out".to_string(),
                ));
            }
            SubmitBehavior::Accept => {}
        }

        if state.jobs.contains_key(&manifest.name) {
            return Err(ClusterError::Api(format!(
                "jobs.batch \"{}\" already exists",
                manifest.name
            )));
        }

        let job = ClusterJob {
            name: manifest.name.clone(),
            status: JobStatus::default(),
        };
        state.jobs.insert(manifest.name.clone(), job.clone());
        state.manifests.push(manifest.clone());
        Ok(job)
    }

    async fn get_job(&self, _namespace: &str, name: &str) -> Result<ClusterJob, ClusterError> {
        self.state
            .lock()
            .jobs
            .get(name)
            .cloned()
            .ok_or_else(|| ClusterError::NotFound(format!("jobs.batch \"{name}\"")))
    }

    async fn delete_job(
        &self,
        _namespace: &str,
        name: &str,
        _options: &DeleteOptions,
    ) -> Result<(), ClusterError> {
        let mut state = self.state.lock();
        state.jobs.remove(name);
        state.deleted_jobs.push(name.to_string());
        Ok(())
    }

    async fn list_pods(
        &self,
        _namespace: &str,
        label_selector: &str,
    ) -> Result<Vec<PodDescriptor>, ClusterError> {
        let job_name = label_selector
            .strip_prefix("job-name=")
            .ok_or_else(|| ClusterError::Api(format!("unsupported selector: {label_selector}")))?;
        Ok(self
            .state
            .lock()
            .pods
            .get(job_name)
            .cloned()
            .unwrap_or_default())
    }

    async fn delete_pod(
        &self,
        _namespace: &str,
        name: &str,
        _options: &DeleteOptions,
    ) -> Result<(), ClusterError> {
        let mut state = self.state.lock();
        if state.fail_pod_deletes {
            return Err(ClusterError::Api(format!(
                "pods \"{name}\" could not be deleted"
            )));
        }
        for pods in state.pods.values_mut() {
            pods.retain(|pod| pod.name != name);
        }
        state.deleted_pods.push(name.to_string());
        Ok(())
    }

    async fn list_events(
        &self,
        _namespace: &str,
        field_selector: &str,
    ) -> Result<Vec<ClusterEvent>, ClusterError> {
        let object_name = field_selector
            .strip_prefix("involvedObject.name==")
            .ok_or_else(|| ClusterError::Api(format!("unsupported selector: {field_selector}")))?;
        Ok(self
            .state
            .lock()
            .events
            .iter()
            .filter(|event| event.object_name == object_name)
            .cloned()
            .collect())
    }
}

/// In-memory pod-metrics source keyed by pod name.
#[derive(Clone, Default)]
pub struct InMemoryMetricsSource {
    samples: Arc<Mutex<HashMap<String, PodMetrics>>>,
}

impl InMemoryMetricsSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the usage sample returned for a pod.
    pub fn set_metrics(&self, pod_name: &str, metrics: PodMetrics) {
        self.samples.lock().insert(pod_name.to_string(), metrics);
    }
}

#[async_trait]
impl PodMetricsSource for InMemoryMetricsSource {
    async fn pod_metrics(
        &self,
        _namespace: &str,
        pod_name: &str,
    ) -> Result<PodMetrics, ClusterError> {
        self.samples
            .lock()
            .get(pod_name)
            .cloned()
            .ok_or_else(|| ClusterError::NotFound(format!("podmetrics \"{pod_name}\"")))
    }
}
