//! Staged pipeline engine.
//!
//! This module contains the moving parts of a run:
//! - **queue**: bounded MPMC queues between stages (the only backpressure)
//! - **retry**: bounded retries with exponential backoff
//! - **stage**: worker pools and the sentinel shutdown protocol
//! - **source**: enumerates work and feeds the first queue
//! - **orchestrator**: builds the queue chain and manages the lifecycle

pub mod orchestrator;
pub mod queue;
pub mod retry;
pub mod source;
pub mod stage;

pub use orchestrator::{
    Completion, Pipeline, PipelineBuilder, PipelineOutput, ShutdownHandle, ShutdownReport,
};
pub use queue::BoundedQueue;
pub use retry::{backoff_duration, RetryPolicy};
pub use source::{DirectorySource, IterSource, Source};
pub use stage::{SentinelPlan, StageSpec};

use tokio::sync::watch;

/// Resolve once a stop has been requested.
///
/// If the signalling side is gone without ever requesting a stop, this
/// never resolves; detached workers then run to their natural end.
pub(crate) async fn stop_requested(shutdown: &mut watch::Receiver<bool>) {
    if shutdown.wait_for(|stop| *stop).await.is_err() {
        std::future::pending::<()>().await;
    }
}

/// Push into `queue` unless a stop is requested first.
///
/// Once stopping, only a non-blocking attempt is made so a full queue can
/// never hold up shutdown. Returns whether the item was enqueued.
pub(crate) async fn push_unless_stopped<T>(
    queue: &BoundedQueue<T>,
    item: T,
    shutdown: &mut watch::Receiver<bool>,
) -> bool {
    if *shutdown.borrow() {
        return queue.try_push(item).is_ok();
    }
    tokio::select! {
        biased;
        _ = stop_requested(shutdown) => false,
        pushed = queue.push(item) => pushed.is_ok(),
    }
}
