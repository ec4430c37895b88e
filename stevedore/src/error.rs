use std::path::PathBuf;
use thiserror::Error;

use crate::cluster::ClusterError;
use crate::run::Run;

/// Errors surfaced by the execution engine.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The cluster rejected the manifest as invalid. Not retryable; the
    /// server's message is stamped onto the run's exit reason.
    #[error("invalid job manifest: {0}")]
    InvalidManifest(String),
    /// A cluster API call failed.
    #[error(transparent)]
    Cluster(#[from] ClusterError),
    /// A queue operation failed; `context` names the queue or run involved.
    #[error("{context}")]
    Queue {
        /// What the engine was doing when the queue call failed.
        context: String,
        /// The underlying queue-manager error.
        #[source]
        source: anyhow::Error,
    },
    /// A state-manager call failed.
    #[error("state manager error")]
    Manager(#[source] anyhow::Error),
    /// No pod has been observed for the run yet.
    #[error("no pod associated with run {0}")]
    NoPod(String),
    /// Engine configuration was missing or malformed.
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// The operation is not part of this engine variant's capability set.
    #[error("{0} is not supported by the kubernetes engine")]
    Unsupported(&'static str),
}

/// A failed submission, carrying the run back to the caller.
///
/// `retryable` tells the caller whether requeueing the run can succeed:
/// transient cluster failures are retryable, manifest rejections are not.
#[derive(Debug, Error)]
#[error("submitting run {} failed (retryable: {retryable})", run.run_id)]
pub struct ExecuteFailure {
    /// The run, including any mutations made before the failure.
    pub run: Run,
    /// Whether resubmitting the same run may succeed.
    pub retryable: bool,
    /// The underlying failure.
    #[source]
    pub error: EngineError,
}

/// Errors from the log tailer.
#[derive(Debug, Error)]
pub enum LogsError {
    /// No pod recorded yet, no matching object, or an empty listing.
    /// Upstream layers map this to a not-found response.
    #[error("no logs for run {0}")]
    NoLogs(String),
    /// The object store failed.
    #[error("object store error")]
    Store(#[source] anyhow::Error),
    /// A log line failed to parse. Only the full-stream variant surfaces
    /// this; the paginated read skips malformed lines.
    #[error("malformed log line")]
    Malformed(#[from] serde_json::Error),
    /// Reading the object body or writing to the caller's sink failed.
    #[error("log i/o error")]
    Io(#[from] std::io::Error),
}

/// Errors raised while loading or materializing engine configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The base64 kubeconfig payload failed to decode.
    #[error("kubeconfig is not valid base64")]
    InvalidKubeconfig(#[from] base64::DecodeError),
    /// The decoded kubeconfig could not be written to disk.
    #[error("failed writing kubeconfig to {path}")]
    WriteKubeconfig {
        /// Destination path.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },
    /// A required option was absent.
    #[error("missing required option [{0}]")]
    MissingOption(&'static str),
}
