use async_trait::async_trait;
use chrono::{Duration, Utc};
use tracing::Instrument;

use crate::adapter::ManifestAdapter;
use crate::affinity::AffinitySynthesizer;
use crate::cluster::{
    involved_object_selector, job_name_selector, ClusterClient, DeleteOptions, PodDescriptor,
    PodMetricsSource,
};
use crate::config::EngineConfig;
use crate::error::{EngineError, ExecuteFailure};
use crate::manager::StateManager;
use crate::queue::{QueueManager, RunReceipt};
use crate::resources::ResourcePlanner;
use crate::run::{Definition, PodEvent, PodEventList, Run};
use crate::telemetry::{self, Outcome};

/// Hours a previously seen job may sit with no pods before reconciliation
/// declares it dangling and terminates it.
const DANGLING_JOB_HOURS: i64 = 24;

/// Event reason fragment marking an autoscaler scale-up.
const SCALE_UP_REASON: &str = "TriggeredScaleUp";

/// Capability set shared by execution engine variants.
///
/// Engines that cannot perform an operation return
/// [`EngineError::Unsupported`] rather than omitting the method, so callers
/// can hold any variant behind this trait.
#[async_trait]
pub trait ExecutionEngine: Send + Sync {
    /// Submit a run to the backing infrastructure.
    ///
    /// Duplicate submissions of the same run are success: the job name is
    /// the run id, so the cluster reports a collision and the engine treats
    /// the run as already submitted.
    async fn execute(&self, definition: &Definition, run: Run) -> Result<Run, ExecuteFailure>;

    /// Tear down a run's workload, best effort on dependent objects.
    async fn terminate(&self, run: &Run) -> Result<(), EngineError>;

    /// Publish a run onto the engine's work queue.
    async fn enqueue(&self, run: &Run) -> Result<(), EngineError>;

    /// Receive queued runs, at most one receipt per call.
    async fn poll_runs(&self) -> Result<Vec<RunReceipt>, EngineError>;

    /// Receive pushed status updates. Engines whose backends do not emit
    /// status events return an empty receipt.
    async fn poll_status(&self) -> Result<RunReceipt, EngineError>;

    /// Fetch authoritative job state once and fold it into the run.
    async fn get(&self, run: Run) -> Result<Run, EngineError>;

    /// Full reconciliation pass: job state, pod discovery, usage
    /// watermarks, event merge, dangling-job handling.
    async fn fetch_update_status(&self, run: Run) -> Result<Run, EngineError>;

    /// Fetch current pod usage and advance the run's watermarks.
    async fn fetch_pod_metrics(&self, run: Run) -> Result<Run, EngineError>;

    /// Fetch the events recorded against the run's pod.
    async fn get_events(&self, run: &Run) -> Result<PodEventList, EngineError>;

    /// Register a reusable task definition with the backend.
    async fn define(&self, definition: Definition) -> Result<Definition, EngineError>;

    /// Remove a reusable task definition from the backend.
    async fn deregister(&self, definition: &Definition) -> Result<(), EngineError>;
}

/// Execution engine submitting runs as jobs to a Kubernetes cluster.
///
/// All client handles are externally owned and injected once; the engine
/// never mutates them after initialization, and holds no locks: concurrent
/// calls for different runs are safe, and callers serialize reconciliation
/// per run.
pub struct KubeExecutionEngine<C, P, Q, M> {
    cluster: C,
    metrics_source: P,
    queue: Q,
    manager: M,
    adapter: ManifestAdapter,
    job_queue: String,
    namespace: String,
    service_account: String,
    scheduler_name: String,
    ara_enabled: bool,
}

impl<C, P, Q, M> KubeExecutionEngine<C, P, Q, M>
where
    C: ClusterClient,
    P: PodMetricsSource,
    Q: QueueManager,
    M: StateManager,
{
    /// One-shot setup from configuration plus externally owned client
    /// handles.
    ///
    /// Outside test mode the base64 kubeconfig, when configured, is
    /// materialized to disk for the caller's cluster client construction.
    pub fn initialize(
        config: &EngineConfig,
        cluster: C,
        metrics_source: P,
        queue: Q,
        manager: M,
    ) -> Result<Self, EngineError> {
        if !config.is_test() {
            config.materialize_kubeconfig()?;
        }

        let planner = ResourcePlanner::new(config.bounds);
        let affinity = AffinitySynthesizer::new(config.affinity.clone());
        let adapter = ManifestAdapter::new(planner, affinity, config.effective_job_policy());

        Ok(Self {
            cluster,
            metrics_source,
            queue,
            manager,
            adapter,
            job_queue: config.job_queue.clone(),
            namespace: config.job_namespace.clone(),
            service_account: config.service_account.clone(),
            scheduler_name: config.scheduler_name().to_string(),
            ara_enabled: config.adaptive_resource_allocation,
        })
    }

    /// Best-effort pod lookup after a successful submit, populating
    /// placement fields and the granted resources read back from the
    /// container's limits.
    async fn populate_pod_placement(&self, mut run: Run) -> Run {
        let selector = job_name_selector(&run.run_id);
        let Ok(pods) = self.cluster.list_pods(&self.namespace, &selector).await else {
            return run;
        };
        let Some(pod) = pods.last() else {
            return run;
        };

        run.pod_name = Some(pod.name.clone());
        run.namespace = Some(pod.namespace.clone());
        fill_instance_details(&mut run, pod);
        if let Some(container) = pod.containers.last() {
            run.container_name = Some(container.name.clone());
            if let Some(cpu) = container.resources.limits.cpu_millis {
                run.cpu = Some(cpu);
            }
            if let Some(memory) = container.resources.limits.memory_mib {
                run.memory = Some(memory);
            }
            tracing::info!(
                run_id = %run.run_id,
                pod_name = %pod.name,
                cpu = ?run.cpu,
                memory = ?run.memory,
                "pod placed"
            );
        }
        run
    }
}

#[async_trait]
impl<C, P, Q, M> ExecutionEngine for KubeExecutionEngine<C, P, Q, M>
where
    C: ClusterClient,
    P: PodMetricsSource,
    Q: QueueManager,
    M: StateManager,
{
    async fn execute(&self, definition: &Definition, run: Run) -> Result<Run, ExecuteFailure> {
        let span = telemetry::submit_span(&run.run_id);
        async move {
            let (manifest, run) = self
                .adapter
                .to_job_manifest(
                    definition,
                    run,
                    &self.service_account,
                    &self.scheduler_name,
                    &self.manager,
                    self.ara_enabled,
                )
                .await;

            let job = match self.cluster.create_job(&self.namespace, &manifest).await {
                Ok(job) => job,
                // Job is already submitted, don't retry.
                Err(error) if error.is_already_exists() => {
                    tracing::info!(run_id = %run.run_id, "job already exists");
                    return Ok(run);
                }
                // Job manifest is invalid, don't retry.
                Err(error) if error.is_invalid() => {
                    let mut run = run;
                    let message = error.to_string();
                    run.exit_reason = Some(message.clone());
                    return Err(ExecuteFailure {
                        run,
                        retryable: false,
                        error: EngineError::InvalidManifest(message),
                    });
                }
                // Legitimate submit error, retryable.
                Err(error) => {
                    telemetry::record_execute(Outcome::Failure);
                    return Err(ExecuteFailure {
                        run,
                        retryable: true,
                        error: error.into(),
                    });
                }
            };

            telemetry::record_execute(Outcome::Success);
            let run = self.populate_pod_placement(run).await;
            Ok(self.adapter.to_run(&job.status, run, None))
        }
        .instrument(span)
        .await
    }

    async fn terminate(&self, run: &Run) -> Result<(), EngineError> {
        tracing::info!(run_id = %run.run_id, "terminating run");
        let options = DeleteOptions::immediate();
        let job_result = self
            .cluster
            .delete_job(&self.namespace, &run.run_id, &options)
            .await;

        // The pod is deleted regardless; its failure never fails the call.
        if let Some(pod_name) = &run.pod_name {
            if let Err(error) = self
                .cluster
                .delete_pod(&self.namespace, pod_name, &options)
                .await
            {
                tracing::warn!(
                    run_id = %run.run_id,
                    pod_name = %pod_name,
                    error = %error,
                    "pod delete failed during termination"
                );
            }
        }

        match job_result {
            Ok(()) => {
                telemetry::record_terminate(Outcome::Success);
                Ok(())
            }
            Err(error) => {
                telemetry::record_terminate(Outcome::Failure);
                Err(error.into())
            }
        }
    }

    async fn enqueue(&self, run: &Run) -> Result<(), EngineError> {
        let qurl = match self.queue.qurl_for(&self.job_queue, false).await {
            Ok(qurl) => qurl,
            Err(source) => {
                telemetry::record_enqueue(Outcome::Failure);
                return Err(EngineError::Queue {
                    context: format!("problem getting queue url for [{}]", run.cluster_name),
                    source,
                });
            }
        };

        if let Err(source) = self.queue.enqueue(&qurl, run).await {
            telemetry::record_enqueue(Outcome::Failure);
            return Err(EngineError::Queue {
                context: format!("problem enqueueing run [{}] to queue [{qurl}]", run.run_id),
                source,
            });
        }

        telemetry::record_enqueue(Outcome::Success);
        Ok(())
    }

    async fn poll_runs(&self) -> Result<Vec<RunReceipt>, EngineError> {
        let qurl = self
            .queue
            .qurl_for(&self.job_queue, false)
            .await
            .map_err(|source| EngineError::Queue {
                context: "problem listing queues to poll".to_string(),
                source,
            })?;

        let receipt = self
            .queue
            .receive_run(&qurl)
            .await
            .map_err(|source| EngineError::Queue {
                context: format!("problem receiving run from queue url [{qurl}]"),
                source,
            })?;

        if receipt.is_empty() {
            return Ok(Vec::new());
        }
        Ok(vec![receipt])
    }

    async fn poll_status(&self) -> Result<RunReceipt, EngineError> {
        // The cluster does not emit status change events; status is polled
        // through reconciliation instead.
        Ok(RunReceipt::empty())
    }

    async fn get(&self, run: Run) -> Result<Run, EngineError> {
        let job = self.cluster.get_job(&self.namespace, &run.run_id).await?;
        Ok(self.adapter.to_run(&job.status, run, None))
    }

    async fn fetch_update_status(&self, run: Run) -> Result<Run, EngineError> {
        let span = telemetry::reconcile_span(&run.run_id);
        async move {
            let mut run = run;
            let mut job = self.cluster.get_job(&self.namespace, &run.run_id).await?;

            let selector = job_name_selector(&run.run_id);
            let pods = self.cluster.list_pods(&self.namespace, &selector).await;

            let mut most_recent = None;
            if let Ok(pods) = &pods {
                most_recent = most_recent_pod(pods).cloned();
            }

            if let Some(pod) = &most_recent {
                let previous = run.pod_name.clone();
                match previous.as_deref() {
                    Some(previous) if previous != pod.name => {
                        telemetry::record_podname_change(&run.run_id, previous, &pod.name);
                        run.pod_name = Some(pod.name.clone());
                        fill_instance_details(&mut run, pod);
                    }
                    None => {
                        run.pod_name = Some(pod.name.clone());
                        fill_instance_details(&mut run, pod);
                    }
                    _ => {}
                }

                // Pod didn't change, but instance details may still be
                // missing from an earlier pass.
                if run.instance_dns_name.as_deref().unwrap_or("").is_empty() {
                    fill_instance_details(&mut run, pod);
                }

                if let Some(container) = pod.containers.last() {
                    run.container_name = Some(container.name.clone());
                    if let Some(cpu) = container.resources.limits.cpu_millis {
                        run.cpu = Some(cpu);
                    }
                    if let Some(memory) = container.resources.limits.memory_mib {
                        run.memory = Some(memory);
                    }
                }
            }

            let fallback = run.clone();
            run = self.fetch_pod_metrics(run).await.unwrap_or(fallback);

            if let Ok(events) = self.get_events(&run).await {
                run.merge_pod_events(&events.pod_events);
            }

            // Dangling job: the run had a pod, the pods are gone, and the
            // run has been around for over a day. Terminate and synthesize
            // a failure so the adapter lands it in a terminal state.
            if let Ok(pods) = &pods {
                let stale = run
                    .queued_at
                    .is_some_and(|queued| queued < Utc::now() - Duration::hours(DANGLING_JOB_HOURS));
                if pods.is_empty() && run.pod_name.is_some() && stale {
                    tracing::warn!(run_id = %run.run_id, "dangling job, terminating");
                    if self.terminate(&run).await.is_ok() {
                        job.status.failed = 1;
                        most_recent = None;
                    }
                }
            }

            Ok(self.adapter.to_run(&job.status, run, most_recent.as_ref()))
        }
        .instrument(span)
        .await
    }

    async fn fetch_pod_metrics(&self, mut run: Run) -> Result<Run, EngineError> {
        let Some(pod_name) = run.pod_name.clone() else {
            return Err(EngineError::NoPod(run.run_id));
        };

        let metrics = self
            .metrics_source
            .pod_metrics(&self.namespace, &pod_name)
            .await?;
        if let Some(container) = metrics.containers.first() {
            run.observe_usage(container.cpu_millis, container.memory_mib);
        }
        Ok(run)
    }

    async fn get_events(&self, run: &Run) -> Result<PodEventList, EngineError> {
        let Some(pod_name) = &run.pod_name else {
            return Ok(PodEventList::default());
        };

        let selector = involved_object_selector(pod_name);
        let events = self.cluster.list_events(&self.namespace, &selector).await?;
        tracing::info!(run_id = %run.run_id, events = events.len(), "fetched pod events");

        let pod_events = events
            .into_iter()
            .map(|event| {
                if event.reason.contains(SCALE_UP_REASON) {
                    telemetry::record_node_scale_up(&event.object_name);
                }
                PodEvent {
                    message: event.message,
                    timestamp: event.first_timestamp,
                    event_type: event.event_type,
                    reason: event.reason,
                    source_object: event.object_name,
                }
            })
            .collect();

        Ok(PodEventList::new(pod_events))
    }

    async fn define(&self, _definition: Definition) -> Result<Definition, EngineError> {
        Err(EngineError::Unsupported("define"))
    }

    async fn deregister(&self, _definition: &Definition) -> Result<(), EngineError> {
        Err(EngineError::Unsupported("deregister"))
    }
}

/// Copy node placement off a pod onto the run, when the pod is scheduled.
fn fill_instance_details(run: &mut Run, pod: &PodDescriptor) {
    if let Some(node) = pod.node_name.as_deref().filter(|node| !node.is_empty()) {
        run.instance_dns_name = Some(node.to_string());
    }
}

/// Pick the pod with the latest creation timestamp; a single pod wins
/// unconditionally, and exact timestamp ties break lexicographically by
/// name for determinism.
fn most_recent_pod(pods: &[PodDescriptor]) -> Option<&PodDescriptor> {
    if pods.len() == 1 {
        return pods.first();
    }
    pods.iter().max_by(|a, b| {
        a.created_at
            .cmp(&b.created_at)
            .then_with(|| a.name.cmp(&b.name))
    })
}
