//! Stage worker pools.
//!
//! Every stage runs a fixed number of worker tasks that share one input
//! queue. A worker pops an envelope, skips it if the dedup store says the
//! stage already ran, otherwise runs the transform under the retry policy
//! and forwards the result. Items that exhaust their retries are
//! dead-lettered and dropped; they never stop the stage.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::Instrument;

use crate::dedup::DedupStore;
use crate::dlq::DeadLetterSink;
use crate::envelope::{Envelope, EnvelopeId, Packet};
use crate::metrics::MetricsCollector;
use crate::transform::Transform;

use super::queue::BoundedQueue;
use super::retry::{self, RetryPolicy};
use super::{push_unless_stopped, stop_requested};

/// Declarative description of one pipeline stage.
pub struct StageSpec {
    pub(crate) name: String,
    pub(crate) transform: Arc<dyn Transform>,
    pub(crate) workers: usize,
    pub(crate) queue_capacity: usize,
    pub(crate) retry: RetryPolicy,
}

impl StageSpec {
    /// A single-worker stage with an input queue of 8 and default retries.
    pub fn new(name: impl Into<String>, transform: impl Transform + 'static) -> Self {
        Self::from_arc(name, Arc::new(transform))
    }

    pub fn from_arc(name: impl Into<String>, transform: Arc<dyn Transform>) -> Self {
        Self {
            name: name.into(),
            transform,
            workers: 1,
            queue_capacity: 8,
            retry: RetryPolicy::default(),
        }
    }

    /// Size of the worker pool.
    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    /// Capacity of this stage's input queue.
    pub fn queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    pub fn retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = policy;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// How many sentinels a stage receives and how many it sends on.
///
/// Each worker consumes exactly one of the `expected` sentinels. The last
/// worker to exit emits `emit` sentinels, one per consumer of the output
/// queue, after every item of this stage has been handed off.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SentinelPlan {
    pub expected: usize,
    pub emit: usize,
}

/// Shared state of a running stage.
pub(crate) struct StageRuntime {
    pub index: usize,
    pub name: String,
    pub transform: Arc<dyn Transform>,
    pub retry: RetryPolicy,
    pub input: BoundedQueue<Packet>,
    pub output: BoundedQueue<Packet>,
    pub plan: SentinelPlan,
    pub is_terminal: bool,
    pub dedup: Option<Arc<dyn DedupStore>>,
    pub dead_letters: Option<Arc<dyn DeadLetterSink>>,
    pub metrics: Arc<MetricsCollector>,
    remaining: AtomicUsize,
}

impl StageRuntime {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        index: usize,
        spec: StageSpec,
        input: BoundedQueue<Packet>,
        output: BoundedQueue<Packet>,
        plan: SentinelPlan,
        is_terminal: bool,
        dedup: Option<Arc<dyn DedupStore>>,
        dead_letters: Option<Arc<dyn DeadLetterSink>>,
        metrics: Arc<MetricsCollector>,
    ) -> Self {
        Self {
            index,
            name: spec.name,
            transform: spec.transform,
            retry: spec.retry,
            input,
            output,
            plan,
            is_terminal,
            dedup,
            dead_letters,
            metrics,
            remaining: AtomicUsize::new(plan.expected),
        }
    }

    /// Spawn one task per planned worker.
    pub fn spawn_workers(
        self: &Arc<Self>,
        shutdown: &watch::Receiver<bool>,
    ) -> Vec<JoinHandle<()>> {
        (0..self.plan.expected)
            .map(|worker| {
                let span = tracing::debug_span!("worker", stage = %self.name, worker);
                tokio::spawn(run_worker(self.clone(), shutdown.clone()).instrument(span))
            })
            .collect()
    }

    async fn already_completed(&self, id: &EnvelopeId) -> bool {
        let Some(dedup) = self.dedup.clone() else {
            return false;
        };
        let (key, stage) = (id.clone(), self.name.clone());
        match on_blocking_pool(move || dedup.has_completed(&key, &stage)).await {
            Some(Ok(done)) => done,
            Some(Err(e)) => {
                tracing::warn!("Dedup lookup failed for {}: {}", id.short(12), e);
                false
            }
            None => false,
        }
    }

    async fn mark_completed(&self, id: &EnvelopeId) {
        let Some(dedup) = self.dedup.clone() else {
            return;
        };
        let (key, stage) = (id.clone(), self.name.clone());
        if let Some(Err(e)) = on_blocking_pool(move || dedup.mark_completed(&key, &stage)).await {
            tracing::warn!("Failed to record completion of {}: {}", id.short(12), e);
        }
    }

    async fn handle(&self, mut envelope: Box<Envelope>, shutdown: &mut watch::Receiver<bool>) {
        let id = envelope.id().clone();

        if self.already_completed(&id).await {
            tracing::debug!("SKIP {} (already completed)", id.short(12));
            self.metrics.record_skip(self.index);
            self.forward(envelope, shutdown).await;
            return;
        }

        envelope.meta_mut().enter_stage(self.index);
        let start = Instant::now();
        tracing::debug!("START {}", id.short(12));

        match retry::execute(&self.name, self.transform.as_ref(), &mut envelope, &self.retry).await
        {
            Ok(()) => {
                envelope.meta_mut().complete_stage(self.index);
                self.metrics.record_success(self.index, start.elapsed());
                self.mark_completed(&id).await;
                tracing::debug!("DONE {} in {:?}", id.short(12), start.elapsed());
                self.forward(envelope, shutdown).await;
            }
            Err(failure) => {
                self.metrics.record_error(self.index);
                match self.dead_letters.clone() {
                    Some(sink) => {
                        let stage_index = self.index;
                        on_blocking_pool(move || sink.record(&envelope, stage_index, &failure))
                            .await;
                    }
                    None => tracing::error!("Dropped {}: {}", id.short(12), failure),
                }
            }
        }
    }

    async fn forward(&self, envelope: Box<Envelope>, shutdown: &mut watch::Receiver<bool>) {
        let id = envelope.id().clone();
        if push_unless_stopped(&self.output, Packet::Item(envelope), shutdown).await {
            if self.is_terminal {
                self.metrics.record_completed();
            }
        } else {
            tracing::debug!("Abandoned {} during shutdown", id.short(12));
        }
    }

    /// Count this worker out; the last one emits the downstream sentinels.
    async fn finish_worker(&self, shutdown: &mut watch::Receiver<bool>) {
        if self.remaining.fetch_sub(1, Ordering::AcqRel) != 1 {
            return;
        }
        tracing::debug!("Stage drained, emitting {} sentinel(s)", self.plan.emit);
        for _ in 0..self.plan.emit {
            if !push_unless_stopped(&self.output, Packet::Sentinel, shutdown).await {
                break;
            }
        }
    }
}

/// Run a dedup or dead-letter store call off the async workers.
///
/// Returns `None` if the call panicked; the panic is logged here.
async fn on_blocking_pool<T, F>(f: F) -> Option<T>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    let span = tracing::Span::current();
    match tokio::task::spawn_blocking(move || span.in_scope(f)).await {
        Ok(value) => Some(value),
        Err(e) => {
            tracing::error!("Store call failed: {}", e);
            None
        }
    }
}

async fn run_worker(stage: Arc<StageRuntime>, mut shutdown: watch::Receiver<bool>) {
    tracing::trace!("worker started");

    loop {
        let packet = tokio::select! {
            biased;
            _ = stop_requested(&mut shutdown) => None,
            packet = stage.input.pop() => packet,
        };

        match packet {
            Some(Packet::Item(envelope)) => {
                stage.handle(envelope, &mut shutdown).await;
                stage.input.task_done();
            }
            Some(Packet::Sentinel) => {
                stage.finish_worker(&mut shutdown).await;
                stage.input.task_done();
                tracing::trace!("worker finished");
                return;
            }
            None => break,
        }
    }

    stage.finish_worker(&mut shutdown).await;
    tracing::trace!("worker stopped");
}
