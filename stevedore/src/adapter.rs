use chrono::Utc;
use std::collections::BTreeMap;

use crate::affinity::AffinitySynthesizer;
use crate::cluster::{ContainerSpec, JobManifest, JobStatus, PodDescriptor, RestartPolicy};
use crate::config::JobPolicy;
use crate::manager::StateManager;
use crate::resources::ResourcePlanner;
use crate::run::{Definition, EnvVar, Run, RunStatus};

/// Autoscaler annotation keeping run pods off the eviction path.
pub const SAFE_TO_EVICT_ANNOTATION: &str = "cluster-autoscaler.kubernetes.io/safe-to-evict";

/// Wrap a user script for container execution: a login shell, echoing,
/// exit-on-error. Everything after the first three elements is the user's
/// original script.
pub fn wrap_command(command: &str) -> Vec<String> {
    vec![
        "bash".to_string(),
        "-l".to_string(),
        "-cex".to_string(),
        command.to_string(),
    ]
}

/// Translates between the run model and the cluster's job/pod objects.
///
/// The forward direction plans resources, synthesizes affinity, and builds
/// a submittable manifest; the reverse direction folds an observed job (and
/// optionally its pod) back into the run.
#[derive(Clone, Debug, Default)]
pub struct ManifestAdapter {
    planner: ResourcePlanner,
    affinity: AffinitySynthesizer,
    job_policy: JobPolicy,
}

impl ManifestAdapter {
    /// Create an adapter from its collaborators.
    pub fn new(
        planner: ResourcePlanner,
        affinity: AffinitySynthesizer,
        job_policy: JobPolicy,
    ) -> Self {
        Self {
            planner,
            affinity,
            job_policy,
        }
    }

    /// Build a job manifest for a run, returning the run with the granted
    /// resources fed back into it.
    ///
    /// The stored command is rewritten to the user-visible part of the
    /// wrapped slice, keeping display symmetry with the reverse direction.
    pub async fn to_job_manifest<M>(
        &self,
        definition: &Definition,
        mut run: Run,
        service_account: &str,
        scheduler_name: &str,
        manager: &M,
        ara_enabled: bool,
    ) -> (JobManifest, Run)
    where
        M: StateManager + ?Sized,
    {
        let command = wrap_command(run.command.as_deref().unwrap_or(""));
        run.command = Some(command[3..].join("\n"));

        let (resources, mut run) = self.planner.plan(definition, run, manager, ara_enabled).await;
        let affinity = self.affinity.synthesize(definition, &run);

        let container = ContainerSpec {
            name: run.run_id.clone(),
            image: run.image.clone(),
            command,
            env: merged_env(definition, &run),
            ports: definition.ports.clone(),
            resources,
        };

        let mut annotations = BTreeMap::new();
        annotations.insert(SAFE_TO_EVICT_ANNOTATION.to_string(), "false".to_string());

        let lifecycle = run.node_lifecycle.unwrap_or_default();
        let manifest = JobManifest {
            name: run.run_id.clone(),
            ttl_seconds_after_finished: self.job_policy.ttl_seconds_after_finished,
            active_deadline_seconds: self.job_policy.active_deadline_seconds(lifecycle),
            backoff_limit: self.job_policy.backoff_limit,
            annotations,
            scheduler_name: scheduler_name.to_string(),
            service_account_name: service_account.to_string(),
            restart_policy: RestartPolicy::Never,
            affinity: Some(affinity),
            container,
        };
        if run.node_lifecycle.is_none() {
            run.node_lifecycle = Some(lifecycle);
        }

        (manifest, run)
    }

    /// Fold an observed job status, and optionally its pod, into the run.
    ///
    /// Status only ever moves forward; a terminal run is never reopened.
    /// `finished_at` is written once, on the terminal transition: the job's
    /// completion time when the cluster reported one, the current time
    /// otherwise.
    pub fn to_run(&self, status: &JobStatus, run: Run, pod: Option<&PodDescriptor>) -> Run {
        let mut updated = run;

        if !updated.status.is_terminal() {
            if status.active == 1 && status.completion_time.is_none() {
                updated.status = RunStatus::Running;
            } else if status.succeeded == 1 {
                updated.status = RunStatus::Stopped;
                updated.exit_code = Some(0);
            } else if status.failed == 1 {
                updated.status = RunStatus::Stopped;
                let mut exit_code = 1;
                if let Some(terminated) = pod
                    .and_then(|p| p.container_statuses.last())
                    .and_then(|s| s.terminated.as_ref())
                {
                    updated.exit_reason = Some(terminated.reason.clone());
                    exit_code = terminated.exit_code;
                }
                updated.exit_code = Some(exit_code);
            }
        }

        // The first three command elements are the shell wrapper; the rest
        // is the user's script.
        if let Some(container) = pod.and_then(|p| p.containers.first()) {
            if container.command.len() > 3 {
                updated.command = Some(container.command[3..].join("\n"));
            }
        }

        if let Some(start) = status.start_time {
            updated.started_at = Some(start);
        }

        if updated.status.is_terminal() && updated.finished_at.is_none() {
            updated.finished_at = Some(status.completion_time.unwrap_or_else(Utc::now));
        }

        updated
    }
}

/// Merge definition and run environments, run-level winning on collision,
/// names sanitized, empty names dropped. Order is deterministic (sorted by
/// name).
fn merged_env(definition: &Definition, run: &Run) -> Vec<EnvVar> {
    let mut pairs = BTreeMap::new();
    for source in [&definition.env, &run.env] {
        for var in source {
            let name = sanitize_env_name(&var.name);
            if !name.is_empty() {
                pairs.insert(name, var.value.clone());
            }
        }
    }
    pairs
        .into_iter()
        .map(|(name, value)| EnvVar { name, value })
        .collect()
}

/// Environment names can't start with `$` or contain spaces.
fn sanitize_env_name(name: &str) -> String {
    let name = name.strip_prefix('$').unwrap_or(name);
    name.replace(' ', "")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::ContainerStatus;
    use crate::cluster::TerminatedState;
    use crate::manager::{ResourceEstimate, RunPage, RunQuery};
    use crate::run::NodeLifecycle;
    use anyhow::bail;
    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};

    /// Manager that has no history and no estimates.
    struct NullManager;

    #[async_trait]
    impl StateManager for NullManager {
        async fn list_runs(&self, _query: &RunQuery) -> anyhow::Result<RunPage> {
            Ok(RunPage::default())
        }

        async fn estimate_run_resources(
            &self,
            _definition_id: &str,
            _run_id: &str,
        ) -> anyhow::Result<ResourceEstimate> {
            bail!("no estimates")
        }
    }

    fn adapter() -> ManifestAdapter {
        ManifestAdapter::default()
    }

    fn definition() -> Definition {
        Definition {
            definition_id: "A".to_string(),
            image: "repo/image:1".to_string(),
            cpu: Some(1000),
            memory: Some(2048),
            ports: vec![8080],
            ..Definition::default()
        }
    }

    fn run() -> Run {
        Run {
            run_id: "run-1".to_string(),
            definition_id: "A".to_string(),
            image: "repo/image:1".to_string(),
            command: Some("echo one\necho two".to_string()),
            ..Run::default()
        }
    }

    #[tokio::test]
    async fn forward_builds_a_submittable_manifest() {
        let (manifest, updated) = adapter()
            .to_job_manifest(&definition(), run(), "runner-sa", "default-scheduler", &NullManager, false)
            .await;

        assert_eq!(manifest.name, "run-1");
        assert_eq!(manifest.container.name, "run-1");
        assert_eq!(manifest.container.image, "repo/image:1");
        assert_eq!(
            manifest.container.command,
            vec!["bash", "-l", "-cex", "echo one\necho two"]
        );
        assert_eq!(manifest.container.ports, vec![8080]);
        assert_eq!(manifest.service_account_name, "runner-sa");
        assert_eq!(manifest.scheduler_name, "default-scheduler");
        assert_eq!(manifest.restart_policy, RestartPolicy::Never);
        assert_eq!(
            manifest.annotations.get(SAFE_TO_EVICT_ANNOTATION),
            Some(&"false".to_string())
        );
        let policy = JobPolicy::default();
        assert_eq!(manifest.backoff_limit, policy.backoff_limit);
        assert_eq!(
            manifest.ttl_seconds_after_finished,
            policy.ttl_seconds_after_finished
        );
        assert_eq!(
            manifest.active_deadline_seconds,
            policy.spot_active_deadline_seconds
        );
        assert!(manifest.affinity.is_some());

        // The stored command is the user-visible script, and granted
        // resources are fed back.
        assert_eq!(updated.command, Some("echo one\necho two".to_string()));
        assert_eq!(updated.cpu, Some(1000));
        assert_eq!(updated.memory, Some(2048));
        assert_eq!(updated.node_lifecycle, Some(NodeLifecycle::Spot));
    }

    #[tokio::test]
    async fn forward_uses_ondemand_deadline_for_gpu_runs() {
        let gpu_definition = Definition {
            gpu: Some(1),
            ..definition()
        };
        let (manifest, updated) = adapter()
            .to_job_manifest(&gpu_definition, run(), "sa", "default-scheduler", &NullManager, false)
            .await;

        assert_eq!(updated.node_lifecycle, Some(NodeLifecycle::Ondemand));
        assert_eq!(
            manifest.active_deadline_seconds,
            JobPolicy::default().ondemand_active_deadline_seconds
        );
        assert_eq!(manifest.container.resources.limits.gpu, Some(1));
    }

    #[tokio::test]
    async fn env_merge_prefers_run_level_and_sanitizes() {
        let mut def = definition();
        def.env = vec![
            EnvVar::new("$PATH_PREFIX", "/opt"),
            EnvVar::new("SHARED", "from-definition"),
            EnvVar::new("  ", "dropped"),
        ];
        let mut r = run();
        r.env = vec![
            EnvVar::new("SHARED", "from-run"),
            EnvVar::new("WITH SPACES", "kept"),
        ];

        let (manifest, _) = adapter()
            .to_job_manifest(&def, r, "sa", "default-scheduler", &NullManager, false)
            .await;

        let env = &manifest.container.env;
        let names: Vec<&str> = env.iter().map(|v| v.name.as_str()).collect();
        assert_eq!(names, vec!["PATH_PREFIX", "SHARED", "WITHSPACES"]);
        for var in env {
            assert!(!var.name.starts_with('$'));
            assert!(!var.name.contains(' '));
            assert!(!var.name.is_empty());
        }
        let shared = env.iter().find(|v| v.name == "SHARED").unwrap();
        assert_eq!(shared.value, "from-run");
    }

    #[test]
    fn reverse_marks_active_jobs_running() {
        let status = JobStatus {
            active: 1,
            ..JobStatus::default()
        };
        let updated = adapter().to_run(&status, run(), None);
        assert_eq!(updated.status, RunStatus::Running);
        assert_eq!(updated.exit_code, None);
        assert_eq!(updated.finished_at, None);
    }

    #[test]
    fn reverse_marks_succeeded_jobs_stopped_with_zero_exit() {
        let completed = Utc.with_ymd_and_hms(2024, 5, 1, 13, 0, 0).unwrap();
        let status = JobStatus {
            succeeded: 1,
            start_time: Some(Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()),
            completion_time: Some(completed),
            ..JobStatus::default()
        };
        let updated = adapter().to_run(&status, run(), None);

        assert_eq!(updated.status, RunStatus::Stopped);
        assert_eq!(updated.exit_code, Some(0));
        assert_eq!(updated.finished_at, Some(completed));
        assert!(updated.started_at.is_some());
    }

    #[test]
    fn reverse_takes_failure_details_from_the_pod() {
        let status = JobStatus {
            failed: 1,
            ..JobStatus::default()
        };
        let pod = PodDescriptor {
            name: "run-1-abc".to_string(),
            container_statuses: vec![ContainerStatus {
                name: "run-1".to_string(),
                terminated: Some(TerminatedState {
                    exit_code: 137,
                    reason: "OOMKilled".to_string(),
                }),
            }],
            ..PodDescriptor::default()
        };

        let updated = adapter().to_run(&status, run(), Some(&pod));
        assert_eq!(updated.status, RunStatus::Stopped);
        assert_eq!(updated.exit_code, Some(137));
        assert_eq!(updated.exit_reason, Some("OOMKilled".to_string()));
    }

    #[test]
    fn reverse_defaults_failures_without_a_pod_to_exit_one() {
        let status = JobStatus {
            failed: 1,
            ..JobStatus::default()
        };
        let updated = adapter().to_run(&status, run(), None);

        assert_eq!(updated.status, RunStatus::Stopped);
        assert_eq!(updated.exit_code, Some(1));
        assert_eq!(updated.exit_reason, None);
        // No completion time on a failed job: finished now.
        assert!(updated.finished_at.is_some());
    }

    #[test]
    fn reverse_never_reopens_a_terminal_run() {
        let stopped = Run {
            status: RunStatus::Stopped,
            exit_code: Some(0),
            finished_at: Some(Utc.with_ymd_and_hms(2024, 5, 1, 13, 0, 0).unwrap()),
            ..run()
        };
        let status = JobStatus {
            active: 1,
            ..JobStatus::default()
        };
        let updated = adapter().to_run(&status, stopped.clone(), None);

        assert_eq!(updated.status, RunStatus::Stopped);
        assert_eq!(updated.exit_code, Some(0));
        assert_eq!(updated.finished_at, stopped.finished_at);
    }

    #[test]
    fn reverse_rewrites_command_from_the_pod() {
        let pod = PodDescriptor {
            containers: vec![ContainerSpec {
                command: wrap_command("echo one\necho two"),
                ..ContainerSpec::default()
            }],
            ..PodDescriptor::default()
        };
        let updated = adapter().to_run(&JobStatus::default(), run(), Some(&pod));
        assert_eq!(updated.command, Some("echo one\necho two".to_string()));

        // A short command slice leaves the stored command alone.
        let bare_pod = PodDescriptor {
            containers: vec![ContainerSpec {
                command: vec!["bash".to_string()],
                ..ContainerSpec::default()
            }],
            ..PodDescriptor::default()
        };
        let untouched = adapter().to_run(&JobStatus::default(), run(), Some(&bare_pod));
        assert_eq!(untouched.command, run().command);
    }

    #[test]
    fn finished_at_is_written_once() {
        let first_finish = Utc.with_ymd_and_hms(2024, 5, 1, 13, 0, 0).unwrap();
        let stopped = Run {
            status: RunStatus::Stopped,
            exit_code: Some(0),
            finished_at: Some(first_finish),
            ..run()
        };
        let status = JobStatus {
            succeeded: 1,
            completion_time: Some(Utc.with_ymd_and_hms(2024, 5, 2, 9, 0, 0).unwrap()),
            ..JobStatus::default()
        };
        let updated = adapter().to_run(&status, stopped, None);
        assert_eq!(updated.finished_at, Some(first_finish));
    }
}
