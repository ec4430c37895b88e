use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;

use stevedore::{ResourceEstimate, Run, RunPage, RunQuery, StateManager};

#[derive(Default)]
struct ManagerState {
    last_run: Option<Run>,
    estimate: Option<ResourceEstimate>,
    queries: Vec<RunQuery>,
}

/// State-manager fake with a scripted history page and estimate, recording
/// every query it answers.
#[derive(Clone, Default)]
pub struct RecordingManager {
    state: Arc<Mutex<ManagerState>>,
}

impl RecordingManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Script the single historical run every history query returns.
    pub fn set_last_run(&self, run: Run) {
        self.state.lock().last_run = Some(run);
    }

    /// Script the resource estimate. Without one, estimation fails.
    pub fn set_estimate(&self, estimate: ResourceEstimate) {
        self.state.lock().estimate = Some(estimate);
    }

    /// Queries answered so far, in call order.
    pub fn queries(&self) -> Vec<RunQuery> {
        self.state.lock().queries.clone()
    }
}

#[async_trait]
impl StateManager for RecordingManager {
    async fn list_runs(&self, query: &RunQuery) -> anyhow::Result<RunPage> {
        let mut state = self.state.lock();
        state.queries.push(query.clone());
        let runs: Vec<Run> = state.last_run.iter().cloned().collect();
        let total = runs.len();
        Ok(RunPage { runs, total })
    }

    async fn estimate_run_resources(
        &self,
        _definition_id: &str,
        _run_id: &str,
    ) -> anyhow::Result<ResourceEstimate> {
        match self.state.lock().estimate {
            Some(estimate) => Ok(estimate),
            None => anyhow::bail!("no estimate available"),
        }
    }
}
