use base64::Engine as _;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::affinity::AffinityConfig;
use crate::error::ConfigError;
use crate::run::NodeLifecycle;

/// Scheduler used when the configuration names none.
pub const DEFAULT_SCHEDULER: &str = "default-scheduler";

/// Lines returned per paginated log read when the configuration names no
/// other cap.
pub const DEFAULT_MAX_LOG_LINES: i64 = 256;

/// Global CPU/memory bounds every granted request and limit is clamped into.
///
/// Loaded once at initialization and treated as immutable afterwards.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct ResourceBounds {
    /// Smallest grantable CPU, millicores.
    pub min_cpu_millis: i64,
    /// Largest grantable CPU, millicores.
    pub max_cpu_millis: i64,
    /// Smallest grantable memory, MiB.
    pub min_memory_mib: i64,
    /// Largest grantable memory, MiB.
    pub max_memory_mib: i64,
}

impl Default for ResourceBounds {
    fn default() -> Self {
        Self {
            min_cpu_millis: 256,
            max_cpu_millis: 51200,
            min_memory_mib: 512,
            max_memory_mib: 131072,
        }
    }
}

impl ResourceBounds {
    /// Clamp a CPU value into the grantable range.
    pub fn clamp_cpu(&self, cpu_millis: i64) -> i64 {
        cpu_millis.clamp(self.min_cpu_millis, self.max_cpu_millis)
    }

    /// Clamp a memory value into the grantable range.
    pub fn clamp_memory(&self, memory_mib: i64) -> i64 {
        memory_mib.clamp(self.min_memory_mib, self.max_memory_mib)
    }
}

/// Job-level knobs stamped onto every submitted manifest.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct JobPolicy {
    /// Wall-clock ceiling for spot runs, seconds.
    pub spot_active_deadline_seconds: i64,
    /// Wall-clock ceiling for on-demand runs, seconds.
    pub ondemand_active_deadline_seconds: i64,
    /// Pod retry budget before the job is marked failed.
    pub backoff_limit: i32,
    /// Seconds a finished job lingers before the cluster reaps it.
    pub ttl_seconds_after_finished: i32,
}

impl Default for JobPolicy {
    fn default() -> Self {
        Self {
            spot_active_deadline_seconds: 86_400,
            ondemand_active_deadline_seconds: 172_800,
            backoff_limit: 4,
            ttl_seconds_after_finished: 3_600,
        }
    }
}

impl JobPolicy {
    /// Active deadline for a run, keyed by its lifecycle class.
    pub fn active_deadline_seconds(&self, lifecycle: NodeLifecycle) -> i64 {
        match lifecycle {
            NodeLifecycle::Spot => self.spot_active_deadline_seconds,
            NodeLifecycle::Ondemand => self.ondemand_active_deadline_seconds,
        }
    }
}

/// Operating mode. In test mode the engine skips everything that touches
/// the outside world during initialization (kubeconfig materialization,
/// real client construction).
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineMode {
    /// Normal operation.
    #[default]
    Normal,
    /// Test mode.
    Test,
}

/// Engine configuration, the `eks.*` option subtree plus process-wide
/// settings it depends on.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Base64-encoded kubeconfig, materialized to `kubeconfig_path` at
    /// initialization.
    pub kubeconfig: Option<String>,
    /// Path the decoded kubeconfig is written to.
    pub kubeconfig_path: Option<PathBuf>,
    /// Queue name runs for this engine are published to.
    pub job_queue: String,
    /// Cluster namespace jobs are submitted into.
    pub job_namespace: String,
    /// Finished-job TTL override, seconds.
    pub job_ttl: Option<i32>,
    /// Service account submitted pods run under.
    pub service_account: String,
    /// Scheduler name; defaults to [`DEFAULT_SCHEDULER`].
    pub scheduler_name: Option<String>,
    /// Fallback region for externally constructed AWS clients.
    pub aws_default_region: Option<String>,
    /// Whether historical usage may size runs (adaptive resource
    /// allocation). Definitions opt in individually on top of this.
    #[serde(default)]
    pub adaptive_resource_allocation: bool,
    /// Operating mode.
    #[serde(default)]
    pub mode: EngineMode,
    /// Global resource bounds.
    #[serde(default)]
    pub bounds: ResourceBounds,
    /// Job-level policy knobs.
    #[serde(default)]
    pub job_policy: JobPolicy,
    /// Instance-class lists for affinity synthesis.
    #[serde(default)]
    pub affinity: AffinityConfig,
}

impl EngineConfig {
    /// Effective scheduler name.
    pub fn scheduler_name(&self) -> &str {
        self.scheduler_name.as_deref().unwrap_or(DEFAULT_SCHEDULER)
    }

    /// Effective job policy, with the TTL override applied.
    pub fn effective_job_policy(&self) -> JobPolicy {
        let mut policy = self.job_policy;
        if let Some(ttl) = self.job_ttl {
            policy.ttl_seconds_after_finished = ttl;
        }
        policy
    }

    /// Whether the engine is running in test mode.
    pub fn is_test(&self) -> bool {
        self.mode == EngineMode::Test
    }

    /// Decode the base64 kubeconfig and write it to the configured path.
    ///
    /// Returns the path written, or `None` when no kubeconfig payload was
    /// configured. A payload without a destination path is an error.
    pub fn materialize_kubeconfig(&self) -> Result<Option<PathBuf>, ConfigError> {
        let Some(encoded) = self.kubeconfig.as_deref() else {
            return Ok(None);
        };
        let path = self
            .kubeconfig_path
            .clone()
            .ok_or(ConfigError::MissingOption("eks.kubeconfig_path"))?;
        let decoded = base64::engine::general_purpose::STANDARD.decode(encoded)?;
        std::fs::write(&path, decoded).map_err(|source| ConfigError::WriteKubeconfig {
            path: path.clone(),
            source,
        })?;
        Ok(Some(path))
    }
}

/// Configuration for the S3-backed log store, the
/// `k8s.log.driver.options.*` subtree.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct LogStoreConfig {
    /// Bucket holding the log objects.
    #[serde(rename = "s3_bucket_name")]
    pub bucket_name: String,
    /// Key prefix under which run directories live.
    #[serde(rename = "s3_bucket_root_dir")]
    pub root_dir: String,
    /// Region override for the logs client; falls back to the process-wide
    /// default region.
    #[serde(rename = "awslogs-region")]
    pub region: Option<String>,
    /// Lines returned per paginated read.
    #[serde(default = "default_max_log_lines")]
    pub max_log_lines: i64,
}

fn default_max_log_lines() -> i64 {
    DEFAULT_MAX_LOG_LINES
}

impl LogStoreConfig {
    /// Validate required options and resolve the effective region.
    ///
    /// The region must come from either the explicit override or the
    /// process-wide default; bucket and root dir are always required.
    pub fn validate(&self, default_region: Option<&str>) -> Result<String, ConfigError> {
        let region = self
            .region
            .as_deref()
            .filter(|r| !r.is_empty())
            .or(default_region.filter(|r| !r.is_empty()))
            .ok_or(ConfigError::MissingOption(
                "k8s.log.driver.options.awslogs-region",
            ))?;
        if self.bucket_name.is_empty() {
            return Err(ConfigError::MissingOption(
                "k8s.log.driver.options.s3_bucket_name",
            ));
        }
        if self.root_dir.is_empty() {
            return Err(ConfigError::MissingOption(
                "k8s.log.driver.options.s3_bucket_root_dir",
            ));
        }
        Ok(region.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bounds_clamp_both_axes() {
        let bounds = ResourceBounds::default();
        assert_eq!(bounds.clamp_cpu(1), 256);
        assert_eq!(bounds.clamp_cpu(1_000_000), 51200);
        assert_eq!(bounds.clamp_cpu(1024), 1024);
        assert_eq!(bounds.clamp_memory(1), 512);
        assert_eq!(bounds.clamp_memory(9_000_000), 131072);
    }

    #[test]
    fn job_policy_deadline_follows_lifecycle() {
        let policy = JobPolicy::default();
        assert_eq!(
            policy.active_deadline_seconds(NodeLifecycle::Spot),
            policy.spot_active_deadline_seconds
        );
        assert_eq!(
            policy.active_deadline_seconds(NodeLifecycle::Ondemand),
            policy.ondemand_active_deadline_seconds
        );
    }

    #[test]
    fn ttl_override_applies() {
        let config = EngineConfig {
            job_ttl: Some(600),
            ..EngineConfig::default()
        };
        assert_eq!(config.effective_job_policy().ttl_seconds_after_finished, 600);
        assert_eq!(
            EngineConfig::default()
                .effective_job_policy()
                .ttl_seconds_after_finished,
            JobPolicy::default().ttl_seconds_after_finished
        );
    }

    #[test]
    fn scheduler_name_defaults() {
        assert_eq!(EngineConfig::default().scheduler_name(), DEFAULT_SCHEDULER);
        let named = EngineConfig {
            scheduler_name: Some("bin-packer".to_string()),
            ..EngineConfig::default()
        };
        assert_eq!(named.scheduler_name(), "bin-packer");
    }

    #[test]
    fn kubeconfig_materializes_to_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kubeconfig");
        let payload = "apiVersion: v1\nkind: Config\n";
        let config = EngineConfig {
            kubeconfig: Some(base64::engine::general_purpose::STANDARD.encode(payload)),
            kubeconfig_path: Some(path.clone()),
            ..EngineConfig::default()
        };

        let written = config.materialize_kubeconfig().unwrap();
        assert_eq!(written, Some(path.clone()));
        assert_eq!(std::fs::read_to_string(path).unwrap(), payload);
    }

    #[test]
    fn kubeconfig_without_path_is_rejected() {
        let config = EngineConfig {
            kubeconfig: Some("Zm9v".to_string()),
            ..EngineConfig::default()
        };
        assert!(matches!(
            config.materialize_kubeconfig(),
            Err(ConfigError::MissingOption("eks.kubeconfig_path"))
        ));
    }

    #[test]
    fn invalid_base64_kubeconfig_is_rejected() {
        let config = EngineConfig {
            kubeconfig: Some("not!!base64".to_string()),
            kubeconfig_path: Some("/tmp/unused".into()),
            ..EngineConfig::default()
        };
        assert!(matches!(
            config.materialize_kubeconfig(),
            Err(ConfigError::InvalidKubeconfig(_))
        ));
    }

    #[test]
    fn log_store_region_falls_back_to_default() {
        let config = LogStoreConfig {
            bucket_name: "logs".to_string(),
            root_dir: "runs".to_string(),
            region: None,
            max_log_lines: DEFAULT_MAX_LOG_LINES,
        };
        assert_eq!(config.validate(Some("us-east-1")).unwrap(), "us-east-1");

        let overridden = LogStoreConfig {
            region: Some("eu-west-1".to_string()),
            ..config.clone()
        };
        assert_eq!(overridden.validate(Some("us-east-1")).unwrap(), "eu-west-1");

        assert!(matches!(
            config.validate(None),
            Err(ConfigError::MissingOption(
                "k8s.log.driver.options.awslogs-region"
            ))
        ));
    }

    #[test]
    fn log_store_requires_bucket_and_root() {
        let missing_bucket = LogStoreConfig {
            root_dir: "runs".to_string(),
            ..LogStoreConfig::default()
        };
        assert!(matches!(
            missing_bucket.validate(Some("us-east-1")),
            Err(ConfigError::MissingOption(
                "k8s.log.driver.options.s3_bucket_name"
            ))
        ));

        let missing_root = LogStoreConfig {
            bucket_name: "logs".to_string(),
            ..LogStoreConfig::default()
        };
        assert!(matches!(
            missing_root.validate(Some("us-east-1")),
            Err(ConfigError::MissingOption(
                "k8s.log.driver.options.s3_bucket_root_dir"
            ))
        ));
    }
}
