use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::run::Run;

/// Sort order for historical run queries.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    /// Oldest first.
    Asc,
    /// Newest first.
    #[default]
    Desc,
}

impl SortOrder {
    /// Get the string representation of this sort order.
    pub fn as_str(&self) -> &'static str {
        match self {
            SortOrder::Asc => "asc",
            SortOrder::Desc => "desc",
        }
    }
}

/// A query against the state store's historical runs.
///
/// Filter keys follow the store's vocabulary: `queued_at_since`, `status`,
/// `command`, `definition_id`. The engines list restricts results to runs
/// executed by the named engine variants.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RunQuery {
    /// Maximum number of runs to return.
    pub limit: usize,
    /// Offset into the sorted result set.
    pub offset: usize,
    /// Column the results are sorted by.
    pub sort_by: String,
    /// Sort direction.
    pub order: SortOrder,
    /// Filter predicates, each key matched against any of its values.
    pub filters: BTreeMap<String, Vec<String>>,
    /// Optional grouping column.
    pub group_by: Option<String>,
    /// Engine variants to include.
    pub engines: Vec<String>,
}

/// One page of historical runs.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RunPage {
    /// The runs, in query order.
    pub runs: Vec<Run>,
    /// Total matching runs, across all pages.
    pub total: usize,
}

/// A CPU/memory estimate derived from a definition's successful runs.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct ResourceEstimate {
    /// Estimated CPU in millicores.
    pub cpu: i64,
    /// Estimated memory in MiB.
    pub memory: i64,
}

/// The persistent state store holding run and definition records.
///
/// Consumed, never implemented here: the surrounding service owns the
/// store and injects a handle. The store is expected to serialize writes
/// per run.
#[async_trait]
pub trait StateManager: Send + Sync {
    /// Query historical runs.
    async fn list_runs(&self, query: &RunQuery) -> anyhow::Result<RunPage>;

    /// Estimate resources for a run from the definition's history.
    async fn estimate_run_resources(
        &self,
        definition_id: &str,
        run_id: &str,
    ) -> anyhow::Result<ResourceEstimate>;
}
