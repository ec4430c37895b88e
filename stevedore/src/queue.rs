use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::run::Run;

/// A dequeued run plus the handle needed to acknowledge it later.
///
/// An empty receipt (no run) means the queue had nothing to dispense. The
/// handle stays opaque; only the queue manager that issued it can redeem it.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RunReceipt {
    /// The dequeued run, when one was available.
    pub run: Option<Run>,
    /// Acknowledgment handle for deleting the message after processing.
    pub receipt_handle: Option<String>,
}

impl RunReceipt {
    /// A receipt dispensing nothing.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Whether this receipt carries a run.
    pub fn is_empty(&self) -> bool {
        self.run.is_none()
    }
}

/// The durable message queue runs travel through between acceptance and
/// execution.
///
/// Consumed, never implemented here: the surrounding service owns the
/// queue and injects a handle.
#[async_trait]
pub trait QueueManager: Send + Sync {
    /// Resolve the url for a named queue, optionally creating it.
    async fn qurl_for(&self, queue_name: &str, create: bool) -> anyhow::Result<String>;

    /// Publish a run onto a queue.
    async fn enqueue(&self, queue_url: &str, run: &Run) -> anyhow::Result<()>;

    /// Receive at most one run from a queue.
    async fn receive_run(&self, queue_url: &str) -> anyhow::Result<RunReceipt>;
}
