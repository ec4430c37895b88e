use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use uuid::Uuid;

use stevedore::{QueueManager, Run, RunReceipt};

#[derive(Default)]
struct QueueState {
    queues: HashMap<String, VecDeque<Run>>,
    failing: bool,
}

/// In-memory queue manager. Queue urls are `mem://<name>`; receipts carry
/// a freshly minted handle.
#[derive(Clone, Default)]
pub struct InMemoryQueueManager {
    state: Arc<Mutex<QueueState>>,
}

impl InMemoryQueueManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every queue operation fail until reset.
    pub fn set_failing(&self, failing: bool) {
        self.state.lock().failing = failing;
    }

    /// Number of runs waiting on a queue url.
    pub fn depth(&self, queue_url: &str) -> usize {
        self.state
            .lock()
            .queues
            .get(queue_url)
            .map_or(0, VecDeque::len)
    }
}

#[async_trait]
impl QueueManager for InMemoryQueueManager {
    async fn qurl_for(&self, queue_name: &str, _create: bool) -> anyhow::Result<String> {
        if self.state.lock().failing {
            anyhow::bail!("queue backend unavailable");
        }
        Ok(format!("mem://{queue_name}"))
    }

    async fn enqueue(&self, queue_url: &str, run: &Run) -> anyhow::Result<()> {
        let mut state = self.state.lock();
        if state.failing {
            anyhow::bail!("queue backend unavailable");
        }
        state
            .queues
            .entry(queue_url.to_string())
            .or_default()
            .push_back(run.clone());
        Ok(())
    }

    async fn receive_run(&self, queue_url: &str) -> anyhow::Result<RunReceipt> {
        let mut state = self.state.lock();
        if state.failing {
            anyhow::bail!("queue backend unavailable");
        }
        let run = state
            .queues
            .get_mut(queue_url)
            .and_then(VecDeque::pop_front);
        Ok(match run {
            Some(run) => RunReceipt {
                run: Some(run),
                receipt_handle: Some(Uuid::new_v4().to_string()),
            },
            None => RunReceipt::empty(),
        })
    }
}
