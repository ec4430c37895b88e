//! Stevedore - Kubernetes-backed run execution.
//!
//! A crate providing the execution engine for container runs on a managed
//! Kubernetes cluster: manifest adaptation, adaptive resource planning,
//! scheduling affinity synthesis, polled status reconciliation, queue
//! bridging, and S3-backed log tailing.
//!
//! # Core Concepts
//!
//! - **Run**: The unit of work. A [`Run`] is one scheduled instance of a
//!   [`Definition`]; its id doubles as the cluster job name, which makes
//!   submission idempotent.
//!
//! - **Engine**: The [`ExecutionEngine`] trait is the capability set shared
//!   by engine variants; [`KubeExecutionEngine`] is the cluster-backed
//!   variant. Operations a variant cannot perform return a dedicated
//!   unsupported-operation error instead of being absent.
//!
//! - **Adapter**: The [`ManifestAdapter`] translates forward (definition +
//!   run into a submittable [`JobManifest`]) and in reverse (observed job
//!   and pod state back into run updates).
//!
//! - **Planner**: The [`ResourcePlanner`] sizes CPU/memory from defaults,
//!   overrides, and the definition's history, growing memory after OOM
//!   kills while distrusting the OOM run's CPU signal.
//!
//! - **Tailer**: The [`LogTailer`] selects the newest log object written
//!   for a run and pages through its JSON-line framing behind an opaque
//!   cursor.
//!
//! # Feature Flags
//!
//! - `metrics` - Prometheus counters for engine operations
//!
//! # Seams
//!
//! The cluster, pod-metrics, queue, state-store, and object-store clients
//! are consumed through traits ([`ClusterClient`], [`PodMetricsSource`],
//! [`QueueManager`], [`StateManager`], [`ObjectStore`]) and injected at
//! initialization. The `stevedore-testkit` crate provides in-memory
//! implementations of all five for tests.
//!
//! # Quick Start
//!
//! ```ignore
//! use stevedore::{EngineConfig, ExecutionEngine, KubeExecutionEngine};
//! use stevedore_testkit::{
//!     InMemoryCluster, InMemoryMetricsSource, InMemoryQueueManager, RecordingManager,
//! };
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = EngineConfig {
//!         job_queue: "runs".to_string(),
//!         job_namespace: "jobs".to_string(),
//!         ..EngineConfig::default()
//!     };
//!     let cluster = InMemoryCluster::new();
//!     let engine = KubeExecutionEngine::initialize(
//!         &config,
//!         cluster.clone(),
//!         InMemoryMetricsSource::new(),
//!         InMemoryQueueManager::new(),
//!         RecordingManager::new(),
//!     )?;
//!
//!     // let run = engine.execute(&definition, run).await?;
//!     Ok(())
//! }
//! ```

/// Bidirectional translation between runs and cluster job objects.
///
/// The `adapter` module provides [`ManifestAdapter`] for building job
/// manifests from definitions and runs, and for folding observed job and
/// pod state back into runs. Also provides [`wrap_command`] for the shell
/// wrapping applied to user scripts.
pub mod adapter;

/// Node-affinity synthesis from run shape.
///
/// The `affinity` module provides [`AffinitySynthesizer`] and its
/// [`AffinityConfig`] instance-class lists, mapping resource shape and
/// lifecycle class onto required node-selector constraints.
pub mod affinity;

/// Cluster client seam and typed cluster object model.
///
/// The `cluster` module defines the [`ClusterClient`] and
/// [`PodMetricsSource`] traits plus the job, pod, event, and metrics types
/// they speak ([`JobManifest`], [`PodDescriptor`], [`ClusterEvent`],
/// [`PodMetrics`]).
pub mod cluster;

/// Configuration structures and process-wide constants.
///
/// The `config` module defines [`EngineConfig`], [`LogStoreConfig`], the
/// [`ResourceBounds`] grants are clamped into, and the [`JobPolicy`]
/// stamped onto manifests.
pub mod config;

/// Engine capability trait and the Kubernetes-backed implementation.
///
/// The `engine` module defines [`ExecutionEngine`] and
/// [`KubeExecutionEngine`]: submission with duplicate/invalid/transient
/// error classification, termination, queue bridging, metrics watermarks,
/// event merging, and the reconciliation loop with dangling-job handling.
pub mod engine;

/// Typed errors for the engine surface.
///
/// The `error` module defines [`EngineError`], [`ExecuteFailure`] (the
/// run-carrying submission failure with its retryable flag), [`LogsError`],
/// and [`ConfigError`].
pub mod error;

/// S3-backed log enumeration and pagination.
///
/// The `logs` module defines the [`ObjectStore`] trait and the
/// [`LogTailer`] that selects the newest log object for a run and pages
/// through its JSON-line framing.
pub mod logs;

/// Consumed state-store interface.
///
/// The `manager` module defines the [`StateManager`] trait along with
/// [`RunQuery`], [`RunPage`], and [`ResourceEstimate`].
pub mod manager;

/// Consumed queue-manager interface.
///
/// The `queue` module defines the [`QueueManager`] trait and the
/// [`RunReceipt`] wrapper dispensed by polling.
pub mod queue;

/// Adaptive CPU/memory planning.
///
/// The `resources` module defines the [`ResourcePlanner`] blending
/// defaults, overrides, historical estimates, and OOM feedback into
/// requests and limits.
pub mod resources;

/// Run, definition, and pod-event data model.
///
/// The `run` module defines [`Run`], [`Definition`], [`RunStatus`],
/// [`NodeLifecycle`], [`EnvVar`], [`PodEvent`], and [`PodEventList`].
pub mod run;

#[cfg(feature = "metrics")]
/// Prometheus metrics instrumentation.
///
/// The `metrics` module provides the engine's operation counters when the
/// `metrics` feature is enabled.
pub mod metrics;

/// Tracing and telemetry instrumentation.
///
/// The `telemetry` module provides span helpers and fire-and-forget
/// counter recording around engine operations.
pub mod telemetry;

pub use adapter::*;
pub use affinity::*;
pub use cluster::*;
pub use config::*;
pub use engine::*;
pub use error::*;
pub use logs::*;
pub use manager::*;
pub use queue::*;
pub use resources::*;
pub use run::*;
