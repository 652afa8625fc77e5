//! Pipeline assembly and lifecycle.
//!
//! A pipeline of N stages owns N+1 bounded queues: queue `k` is the input
//! of stage `k` and queue `N` is the egress fed by the terminal stage.
//! The source feeds queue 0 and ends the stream with sentinels; every stage
//! passes the end of stream on once its own pool has drained.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{self, Stream, StreamExt};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::Instrument;

use crate::dedup::DedupStore;
use crate::dlq::DeadLetterSink;
use crate::envelope::{Envelope, Packet};
use crate::error::PipelineError;
use crate::metrics::{self, MetricsCollector};

use super::queue::BoundedQueue;
use super::source::{run_source, Source};
use super::stage::{SentinelPlan, StageRuntime, StageSpec};
use super::stop_requested;

/// Outcome of [`Pipeline::wait_for_completion`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// Every queue drained and every task exited
    Drained,
    /// A stop was requested before the pipeline drained
    Stopped,
    /// The timeout expired first; the pipeline keeps running
    TimedOut,
}

/// Outcome of [`Pipeline::stop`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    /// The timeout expired before every task exited
    pub timed_out: bool,
    /// Tasks that had not exited when `stop` returned
    pub still_running: usize,
}

/// Cloneable trigger for a cooperative stop, e.g. from a signal handler.
#[derive(Clone)]
pub struct ShutdownHandle {
    signal: Arc<watch::Sender<bool>>,
    injections: Arc<Vec<(BoundedQueue<Packet>, usize)>>,
}

impl ShutdownHandle {
    /// Raise the stop signal and push end markers into every queue.
    ///
    /// Never blocks: markers that do not fit are skipped, since the signal
    /// alone wakes every blocked worker. Calling it again has no effect.
    pub fn request_stop(&self) {
        if self.signal.send_replace(true) {
            return;
        }
        tracing::info!("Stop requested, signalling all workers");
        for (queue, count) in self.injections.iter() {
            for _ in 0..*count {
                if queue.try_push(Packet::Sentinel).is_err() {
                    break;
                }
            }
        }
    }

    pub fn is_stopping(&self) -> bool {
        *self.signal.borrow()
    }
}

/// Builder for [`Pipeline`]. Validation happens in [`build`](Self::build).
pub struct PipelineBuilder {
    source: Option<Box<dyn Source>>,
    stages: Vec<StageSpec>,
    dedup: Option<Arc<dyn DedupStore>>,
    dead_letters: Option<Arc<dyn DeadLetterSink>>,
    report_interval: Option<Duration>,
    output_capacity: usize,
}

impl Default for PipelineBuilder {
    fn default() -> Self {
        Self {
            source: None,
            stages: Vec::new(),
            dedup: None,
            dead_letters: None,
            report_interval: None,
            output_capacity: 8,
        }
    }
}

impl PipelineBuilder {
    pub fn source(self, source: impl Source) -> Self {
        self.boxed_source(Box::new(source))
    }

    pub fn boxed_source(mut self, source: Box<dyn Source>) -> Self {
        self.source = Some(source);
        self
    }

    /// Append a stage after the ones already added.
    pub fn stage(mut self, spec: StageSpec) -> Self {
        self.stages.push(spec);
        self
    }

    pub fn dedup(mut self, store: Arc<dyn DedupStore>) -> Self {
        self.dedup = Some(store);
        self
    }

    pub fn dead_letters(mut self, sink: Arc<dyn DeadLetterSink>) -> Self {
        self.dead_letters = Some(sink);
        self
    }

    /// Log a metrics snapshot at this interval while running.
    pub fn report_interval(mut self, interval: Duration) -> Self {
        self.report_interval = Some(interval);
        self
    }

    /// Capacity of the egress queue after the terminal stage.
    pub fn output_capacity(mut self, capacity: usize) -> Self {
        self.output_capacity = capacity;
        self
    }

    /// Validate the configuration and wire up queues and stages.
    pub fn build(self) -> Result<Pipeline, PipelineError> {
        validate(&self.stages, self.output_capacity)?;
        if self.report_interval == Some(Duration::ZERO) {
            return Err(PipelineError::ZeroReportInterval);
        }
        let source = self.source.ok_or(PipelineError::NoSource)?;

        let worker_counts: Vec<usize> = self.stages.iter().map(|s| s.workers).collect();
        let names: Vec<String> = self.stages.iter().map(|s| s.name.clone()).collect();
        let metrics = Arc::new(MetricsCollector::new(names));

        let mut queues: Vec<BoundedQueue<Packet>> = self
            .stages
            .iter()
            .map(|s| BoundedQueue::new(s.queue_capacity))
            .collect();
        queues.push(BoundedQueue::new(self.output_capacity));

        let count = self.stages.len();
        let stages: Vec<Arc<StageRuntime>> = self
            .stages
            .into_iter()
            .enumerate()
            .map(|(index, spec)| {
                let plan = SentinelPlan {
                    expected: worker_counts[index],
                    emit: worker_counts.get(index + 1).copied().unwrap_or(1),
                };
                Arc::new(StageRuntime::new(
                    index,
                    spec,
                    queues[index].clone(),
                    queues[index + 1].clone(),
                    plan,
                    index + 1 == count,
                    self.dedup.clone(),
                    self.dead_letters.clone(),
                    metrics.clone(),
                ))
            })
            .collect();

        let injections: Vec<(BoundedQueue<Packet>, usize)> = queues
            .iter()
            .cloned()
            .zip(worker_counts.iter().copied().chain(std::iter::once(1)))
            .collect();
        let (signal, shutdown_rx) = watch::channel(false);

        Ok(Pipeline {
            stages,
            queues,
            source: Some(source),
            metrics,
            report_interval: self.report_interval,
            shutdown: ShutdownHandle {
                signal: Arc::new(signal),
                injections: Arc::new(injections),
            },
            shutdown_rx,
            output_taken: false,
            started: false,
            source_task: None,
            workers: Vec::new(),
            drain_task: None,
            reporter_task: None,
        })
    }
}

fn validate(stages: &[StageSpec], output_capacity: usize) -> Result<(), PipelineError> {
    if stages.is_empty() {
        return Err(PipelineError::NoStages);
    }

    let mut seen = HashSet::new();
    for spec in stages {
        if spec.name.trim().is_empty() || spec.name.contains(',') {
            return Err(PipelineError::InvalidStageName(spec.name.clone()));
        }
        if !seen.insert(spec.name.as_str()) {
            return Err(PipelineError::DuplicateStage(spec.name.clone()));
        }
        if spec.workers == 0 {
            return Err(PipelineError::ZeroWorkers {
                stage: spec.name.clone(),
            });
        }
        if spec.queue_capacity == 0 {
            return Err(PipelineError::ZeroCapacity {
                stage: spec.name.clone(),
            });
        }
        if spec.retry.max_attempts == 0 {
            return Err(PipelineError::ZeroAttempts {
                stage: spec.name.clone(),
            });
        }
    }

    if output_capacity == 0 {
        return Err(PipelineError::ZeroCapacity {
            stage: "output".to_string(),
        });
    }
    Ok(())
}

/// Caller-owned stream of envelopes leaving the terminal stage.
pub struct PipelineOutput {
    queue: BoundedQueue<Packet>,
    shutdown: watch::Receiver<bool>,
    finished: bool,
}

impl PipelineOutput {
    /// Next finished envelope, or `None` once the stream has ended.
    ///
    /// After a stop, buffered envelopes are still returned, then the
    /// stream ends without waiting for more.
    pub async fn next(&mut self) -> Option<Envelope> {
        if self.finished {
            return None;
        }
        let packet = tokio::select! {
            biased;
            packet = self.queue.pop() => packet,
            _ = stop_requested(&mut self.shutdown) => None,
        };
        match packet {
            Some(Packet::Item(envelope)) => {
                self.queue.task_done();
                Some(*envelope)
            }
            Some(Packet::Sentinel) => {
                self.queue.task_done();
                self.finished = true;
                None
            }
            None => {
                self.finished = true;
                None
            }
        }
    }

    /// Adapt into a [`Stream`] of finished envelopes.
    pub fn into_stream(self) -> impl Stream<Item = Envelope> + Send {
        stream::unfold(self, |mut output| async move {
            output.next().await.map(|envelope| (envelope, output))
        })
    }

    /// Consume the rest of the stream.
    pub async fn collect(self) -> Vec<Envelope> {
        self.into_stream().collect().await
    }
}

/// A configured pipeline. Create with [`Pipeline::builder`].
pub struct Pipeline {
    stages: Vec<Arc<StageRuntime>>,
    queues: Vec<BoundedQueue<Packet>>,
    source: Option<Box<dyn Source>>,
    metrics: Arc<MetricsCollector>,
    report_interval: Option<Duration>,
    shutdown: ShutdownHandle,
    shutdown_rx: watch::Receiver<bool>,
    output_taken: bool,
    started: bool,
    source_task: Option<JoinHandle<usize>>,
    workers: Vec<JoinHandle<()>>,
    drain_task: Option<JoinHandle<()>>,
    reporter_task: Option<JoinHandle<()>>,
}

impl Pipeline {
    pub fn builder() -> PipelineBuilder {
        PipelineBuilder::default()
    }

    pub fn metrics(&self) -> Arc<MetricsCollector> {
        self.metrics.clone()
    }

    pub fn stage_names(&self) -> Vec<&str> {
        self.stages.iter().map(|s| s.name.as_str()).collect()
    }

    /// Sentinels each stage expects and emits, in stage order.
    pub fn sentinel_plans(&self) -> Vec<SentinelPlan> {
        self.stages.iter().map(|s| s.plan).collect()
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    /// Claim the egress stream. Must be called before [`start`](Self::start);
    /// otherwise finished envelopes are discarded after being counted.
    pub fn take_output(&mut self) -> Option<PipelineOutput> {
        if self.started || self.output_taken {
            return None;
        }
        self.output_taken = true;
        Some(PipelineOutput {
            queue: self.egress().clone(),
            shutdown: self.shutdown_rx.clone(),
            finished: false,
        })
    }

    fn egress(&self) -> &BoundedQueue<Packet> {
        &self.queues[self.stages.len()]
    }

    /// Launch every worker pool and the source, then return.
    pub fn start(&mut self) -> Result<(), PipelineError> {
        if self.started {
            return Err(PipelineError::AlreadyStarted);
        }
        let source = self.source.take().ok_or(PipelineError::NoSource)?;
        self.started = true;

        for stage in &self.stages {
            self.workers.extend(stage.spawn_workers(&self.shutdown_rx));
        }

        if !self.output_taken {
            self.drain_task = Some(tokio::spawn(discard_output(
                self.egress().clone(),
                self.shutdown_rx.clone(),
            )));
        }

        if let Some(interval) = self.report_interval {
            self.reporter_task = Some(metrics::spawn_reporter(
                self.metrics.clone(),
                interval,
                self.shutdown_rx.clone(),
            ));
        }

        self.source_task = Some(tokio::spawn(
            run_source(
                source,
                self.queues[0].clone(),
                self.stages[0].plan.expected,
                self.metrics.clone(),
                self.shutdown_rx.clone(),
            )
            .instrument(tracing::info_span!("source")),
        ));

        tracing::info!(
            "Pipeline started: {} stage(s), {} worker(s)",
            self.stages.len(),
            self.workers.len()
        );
        Ok(())
    }

    /// Wait until the source has finished, every inter-stage queue has been
    /// drained and acknowledged in order, and every worker has exited.
    ///
    /// With a caller-owned output stream, the caller must keep consuming
    /// it or the terminal stage stalls on a full egress queue.
    pub async fn wait_for_completion(
        &mut self,
        timeout: Duration,
    ) -> Result<Completion, PipelineError> {
        if !self.started {
            return Err(PipelineError::NotStarted);
        }

        let mut shutdown = self.shutdown_rx.clone();
        let stages = &self.stages;
        let queues = &self.queues;
        let source_task = &mut self.source_task;
        let workers = &mut self.workers;
        let drain_task = &mut self.drain_task;

        let drained = async {
            reap(source_task, "source").await;
            for (stage, queue) in stages.iter().zip(queues) {
                queue.join().await;
                tracing::debug!("Stage '{}' drained", stage.name);
            }
            reap_all(workers).await;
            reap(drain_task, "output drain").await;
        };

        let completion = tokio::select! {
            biased;
            _ = stop_requested(&mut shutdown) => Completion::Stopped,
            result = tokio::time::timeout(timeout, drained) => match result {
                Ok(()) => Completion::Drained,
                Err(_) => Completion::TimedOut,
            },
        };

        match completion {
            Completion::Drained => {
                // Nothing left to stop but the reporter.
                self.shutdown.signal.send_replace(true);
                reap(&mut self.reporter_task, "metrics reporter").await;
                let snapshot = self.metrics.snapshot();
                tracing::info!(
                    "Pipeline drained: {} ingested, {} completed, {} error(s) in {:.1}s",
                    snapshot.ingested,
                    snapshot.completed,
                    snapshot.total_errors(),
                    snapshot.elapsed.as_secs_f64()
                );
            }
            Completion::TimedOut => {
                tracing::warn!("Pipeline did not drain within {:?}", timeout);
            }
            Completion::Stopped => {}
        }
        Ok(completion)
    }

    /// Stop cooperatively and wait up to `timeout` for every task to exit.
    ///
    /// In-flight transforms run to completion. Tasks still running at the
    /// deadline are reported, not aborted.
    pub async fn stop(&mut self, timeout: Duration) -> ShutdownReport {
        self.shutdown.request_stop();
        if !self.started {
            return ShutdownReport::default();
        }

        let source_task = &mut self.source_task;
        let workers = &mut self.workers;
        let drain_task = &mut self.drain_task;
        let reporter_task = &mut self.reporter_task;
        let finished = tokio::time::timeout(timeout, async {
            reap(source_task, "source").await;
            reap_all(workers).await;
            reap(drain_task, "output drain").await;
            reap(reporter_task, "metrics reporter").await;
        })
        .await
        .is_ok();

        let still_running = self.workers.iter().filter(|h| !h.is_finished()).count()
            + running(&self.source_task)
            + running(&self.drain_task)
            + running(&self.reporter_task);

        if finished {
            tracing::info!("Pipeline stopped");
        } else {
            tracing::warn!(
                "Stop timed out after {:?}; {} task(s) still running",
                timeout,
                still_running
            );
        }

        ShutdownReport {
            timed_out: !finished,
            still_running,
        }
    }
}

fn running<T>(handle: &Option<JoinHandle<T>>) -> usize {
    handle.as_ref().map_or(0, |h| usize::from(!h.is_finished()))
}

/// Await a task once; the handle is cleared after it resolves.
async fn reap<T>(handle: &mut Option<JoinHandle<T>>, what: &str) {
    if let Some(task) = handle.as_mut() {
        if let Err(e) = task.await {
            tracing::error!("{} task failed: {}", what, e);
        }
        *handle = None;
    }
}

async fn reap_all(handles: &mut Vec<JoinHandle<()>>) {
    while let Some(task) = handles.last_mut() {
        if let Err(e) = task.await {
            tracing::error!("Worker task failed: {}", e);
        }
        handles.pop();
    }
}

async fn discard_output(egress: BoundedQueue<Packet>, mut shutdown: watch::Receiver<bool>) {
    loop {
        let packet = tokio::select! {
            biased;
            _ = stop_requested(&mut shutdown) => break,
            packet = egress.pop() => packet,
        };
        match packet {
            Some(Packet::Item(envelope)) => {
                tracing::trace!("Finished {}", envelope.id().short(12));
                egress.task_done();
            }
            Some(Packet::Sentinel) => {
                egress.task_done();
                break;
            }
            None => break,
        }
    }
}
