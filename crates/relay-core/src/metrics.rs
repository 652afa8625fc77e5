//! Per-stage throughput and error counters.
//!
//! Workers from every stage report into one [`MetricsCollector`]; readers
//! take point-in-time [`MetricsSnapshot`]s for progress display and the
//! final summary.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Default)]
struct StageTotals {
    processed: u64,
    errors: u64,
    skipped: u64,
    total_time: Duration,
}

#[derive(Debug)]
struct Totals {
    stages: Vec<StageTotals>,
    ingested: u64,
    completed: u64,
    started: Instant,
}

/// Thread-safe per-stage counters.
///
/// Every update takes the same lock, so a snapshot is consistent across
/// all counters. Stage indices outside the pipeline are ignored.
#[derive(Debug)]
pub struct MetricsCollector {
    names: Vec<String>,
    totals: Mutex<Totals>,
}

impl MetricsCollector {
    pub fn new<S: Into<String>>(stage_names: impl IntoIterator<Item = S>) -> Self {
        let names: Vec<String> = stage_names.into_iter().map(Into::into).collect();
        let totals = Totals {
            stages: vec![StageTotals::default(); names.len()],
            ingested: 0,
            completed: 0,
            started: Instant::now(),
        };
        Self {
            names,
            totals: Mutex::new(totals),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Totals> {
        self.totals.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn with_stage(&self, stage: usize, f: impl FnOnce(&mut StageTotals)) {
        if let Some(totals) = self.lock().stages.get_mut(stage) {
            f(totals);
        }
    }

    pub fn record_success(&self, stage: usize, elapsed: Duration) {
        self.with_stage(stage, |t| {
            t.processed += 1;
            t.total_time += elapsed;
        });
    }

    pub fn record_error(&self, stage: usize) {
        self.with_stage(stage, |t| t.errors += 1);
    }

    /// An item passed through `stage` without running its transform.
    pub fn record_skip(&self, stage: usize) {
        self.with_stage(stage, |t| t.skipped += 1);
    }

    /// The source handed an item to the first stage.
    pub fn record_ingested(&self) {
        self.lock().ingested += 1;
    }

    /// An item left the terminal stage.
    pub fn record_completed(&self) {
        self.lock().completed += 1;
    }

    pub fn stage_count(&self) -> usize {
        self.names.len()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let totals = self.lock();
        let elapsed = totals.started.elapsed();
        let secs = elapsed.as_secs_f64();

        let stages = totals
            .stages
            .iter()
            .enumerate()
            .map(|(index, t)| {
                let avg_latency = average(t.total_time, t.processed);
                StageSnapshot {
                    index,
                    name: self.names[index].clone(),
                    processed: t.processed,
                    errors: t.errors,
                    skipped: t.skipped,
                    total_time: t.total_time,
                    avg_latency,
                    throughput: if secs > 0.0 {
                        t.processed as f64 / secs
                    } else {
                        0.0
                    },
                }
            })
            .collect();

        MetricsSnapshot {
            elapsed,
            ingested: totals.ingested,
            completed: totals.completed,
            stages,
        }
    }

    /// Zero every counter and restart the throughput clock.
    pub fn reset(&self) {
        let mut totals = self.lock();
        totals.stages = vec![StageTotals::default(); self.names.len()];
        totals.ingested = 0;
        totals.completed = 0;
        totals.started = Instant::now();
    }
}

/// Mean of `count` samples adding up to `total`, zero for no samples.
fn average(total: Duration, count: u64) -> Duration {
    if count == 0 {
        return Duration::ZERO;
    }
    let nanos = total.as_nanos() / u128::from(count);
    Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX))
}

/// Counters for one stage at a point in time.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StageSnapshot {
    pub index: usize,
    pub name: String,
    pub processed: u64,
    pub errors: u64,
    pub skipped: u64,
    #[serde(serialize_with = "as_secs_f64")]
    pub total_time: Duration,
    #[serde(serialize_with = "as_secs_f64")]
    pub avg_latency: Duration,
    /// Successful items per second since the collector started
    pub throughput: f64,
}

/// Pipeline-wide counters at a point in time.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    #[serde(serialize_with = "as_secs_f64")]
    pub elapsed: Duration,
    pub ingested: u64,
    pub completed: u64,
    pub stages: Vec<StageSnapshot>,
}

fn as_secs_f64<S: serde::Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_f64(d.as_secs_f64())
}

impl MetricsSnapshot {
    pub fn total_errors(&self) -> u64 {
        self.stages.iter().map(|s| s.errors).sum()
    }

    pub fn total_processed(&self) -> u64 {
        self.stages.iter().map(|s| s.processed).sum()
    }

    /// Items that left the terminal stage per second.
    pub fn completion_rate(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            self.completed as f64 / secs
        } else {
            0.0
        }
    }
}

impl fmt::Display for MetricsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{:<4} {:<20} {:>10} {:>8} {:>8} {:>12} {:>10}",
            "#", "stage", "processed", "errors", "skipped", "avg (ms)", "items/s"
        )?;
        for s in &self.stages {
            writeln!(
                f,
                "{:<4} {:<20} {:>10} {:>8} {:>8} {:>12.2} {:>10.1}",
                s.index,
                s.name,
                s.processed,
                s.errors,
                s.skipped,
                s.avg_latency.as_secs_f64() * 1000.0,
                s.throughput
            )?;
        }
        write!(
            f,
            "ingested {} | completed {} | errors {} | {:.1}s",
            self.ingested,
            self.completed,
            self.total_errors(),
            self.elapsed.as_secs_f64()
        )
    }
}

/// Log a snapshot every `interval` until `shutdown` flips to `true`.
pub fn spawn_reporter(
    metrics: Arc<MetricsCollector>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await; // first tick is immediate
        loop {
            tokio::select! {
                _ = shutdown.wait_for(|stop| *stop) => break,
                _ = ticker.tick() => {
                    let snap = metrics.snapshot();
                    for s in &snap.stages {
                        tracing::info!(
                            stage = %s.name,
                            processed = s.processed,
                            errors = s.errors,
                            skipped = s.skipped,
                            avg_ms = s.avg_latency.as_millis() as u64,
                            "{:.1} items/s",
                            s.throughput
                        );
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_averages_latency() {
        let m = MetricsCollector::new(["load", "save"]);
        m.record_success(0, Duration::from_millis(10));
        m.record_success(0, Duration::from_millis(30));
        m.record_error(0);
        m.record_skip(1);

        let snap = m.snapshot();
        assert_eq!(snap.stages[0].processed, 2);
        assert_eq!(snap.stages[0].errors, 1);
        assert_eq!(snap.stages[0].avg_latency, Duration::from_millis(20));
        assert_eq!(snap.stages[0].total_time, Duration::from_millis(40));
        assert_eq!(snap.stages[1].skipped, 1);
        assert_eq!(snap.stages[1].avg_latency, Duration::ZERO);
    }

    #[test]
    fn test_average_handles_counts_beyond_u32() {
        let count = 1u64 << 32;
        let total = Duration::from_secs(count);
        assert_eq!(average(total, count), Duration::from_secs(1));
        assert_eq!(average(total, count + 1), Duration::from_nanos(999_999_999));
        assert_eq!(average(Duration::from_secs(5), 0), Duration::ZERO);
    }

    #[test]
    fn test_out_of_range_stage_is_ignored() {
        let m = MetricsCollector::new(["only"]);
        m.record_success(5, Duration::from_millis(1));
        m.record_error(5);
        let snap = m.snapshot();
        assert_eq!(snap.total_processed(), 0);
        assert_eq!(snap.total_errors(), 0);
    }

    #[test]
    fn test_reset() {
        let m = MetricsCollector::new(["a"]);
        m.record_success(0, Duration::from_millis(1));
        m.record_ingested();
        m.record_completed();
        m.reset();
        let snap = m.snapshot();
        assert_eq!(snap.stages[0].processed, 0);
        assert_eq!(snap.ingested, 0);
        assert_eq!(snap.completed, 0);
    }

    #[test]
    fn test_concurrent_updates_are_not_lost() {
        let m = Arc::new(MetricsCollector::new(["a", "b"]));
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let m = m.clone();
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        m.record_success(i % 2, Duration::from_micros(1));
                        m.record_error(i % 2);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        let snap = m.snapshot();
        assert_eq!(snap.stages[0].processed, 4000);
        assert_eq!(snap.stages[1].errors, 4000);
    }

    #[test]
    fn test_display_lists_every_stage() {
        let m = MetricsCollector::new(["load", "resize"]);
        m.record_success(1, Duration::from_millis(5));
        let table = m.snapshot().to_string();
        assert!(table.contains("load"));
        assert!(table.contains("resize"));
        assert!(table.contains("completed 0"));
    }

    #[test]
    fn test_snapshot_serializes_durations_as_seconds() {
        let m = MetricsCollector::new(["a"]);
        m.record_success(0, Duration::from_millis(500));
        let json = serde_json::to_value(m.snapshot()).unwrap();
        assert_eq!(json["stages"][0]["total_time"], 0.5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reporter_stops_on_shutdown() {
        let m = Arc::new(MetricsCollector::new(["a"]));
        let (tx, rx) = watch::channel(false);
        let handle = spawn_reporter(m, Duration::from_millis(10), rx);
        tokio::time::sleep(Duration::from_millis(35)).await;
        tx.send(true).unwrap();
        handle.await.unwrap();
    }
}
