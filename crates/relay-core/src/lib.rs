//! Relay Core - concurrent staged processing pipeline.
//!
//! Work items travel as [`Envelope`]s through a fixed sequence of stages.
//! Each stage owns a pool of workers and a bounded input queue; a full
//! queue stalls the stage in front of it, which is the only flow control.
//!
//! # Architecture
//!
//! ```text
//! Source → [q0] → Stage 0 (N workers) → [q1] → ... → Stage k → [egress]
//!                      │                                │
//!                      ├── retry with backoff           ├── dedup skip
//!                      └── dead letters                 └── metrics
//! ```
//!
//! A failing item is retried inside its stage, then recorded as a dead
//! letter and dropped; it never stops the pipeline. Stages an item has
//! completed are recorded in a dedup store so a re-run skips them.
//!
//! # Usage
//!
//! ```rust,ignore
//! use relay_core::{Config, Relay};
//!
//! #[tokio::main]
//! async fn main() -> relay_core::Result<()> {
//!     let relay = Relay::new(Config::load()?);
//!     let mut pipeline = relay.build_pipeline()?;
//!     pipeline.start()?;
//!     pipeline.wait_for_completion(relay.config().completion_timeout()).await?;
//!     println!("{}", pipeline.metrics().snapshot());
//!     Ok(())
//! }
//! ```

// Module declarations
pub mod config;
pub mod dedup;
pub mod dlq;
pub mod envelope;
pub mod error;
pub mod filters;
pub mod metrics;
pub mod pipeline;
pub mod transform;

use std::sync::Arc;
use std::time::Duration;

// Re-exports for convenient access
pub use config::Config;
pub use dedup::{DedupStore, FileDedupStore, MemoryDedupStore};
pub use dlq::{
    DeadLetterRecord, DeadLetterSink, DirectoryDeadLetterSink, MemoryDeadLetterSink,
};
pub use envelope::{Envelope, EnvelopeId, EnvelopeMeta, Payload};
pub use error::{
    ConfigError, PersistenceError, PipelineError, RelayError, Result, RetryExhausted,
    SourceError, TransformError,
};
pub use filters::FilterSpec;
pub use metrics::{MetricsCollector, MetricsSnapshot, StageSnapshot};
pub use pipeline::{
    Completion, DirectorySource, IterSource, Pipeline, PipelineOutput, RetryPolicy,
    ShutdownHandle, ShutdownReport, Source, StageSpec,
};
pub use transform::{from_fn, Transform};

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Turns a [`Config`] into runnable pipelines.
pub struct Relay {
    config: Config,
}

impl Relay {
    pub fn new(config: Config) -> Self {
        tracing::debug!("Initializing Relay v{}", VERSION);
        Self { config }
    }

    /// Get a reference to the current configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Stage specs in execution order, with pipeline defaults filled in.
    pub fn stage_specs(&self) -> Vec<StageSpec> {
        let defaults = &self.config.pipeline;
        let output_dir = self.config.output_dir();

        self.config
            .stages
            .iter()
            .map(|stage| {
                let mut retry = RetryPolicy {
                    max_attempts: stage.max_attempts.unwrap_or(defaults.max_attempts),
                    base_backoff: Duration::from_millis(
                        stage.base_backoff_ms.unwrap_or(defaults.base_backoff_ms),
                    ),
                    max_backoff: Duration::from_millis(defaults.max_backoff_ms),
                    jitter: defaults.jitter,
                    timeout: None,
                };
                if let Some(ms) = stage.timeout_ms {
                    retry = retry.with_timeout(Duration::from_millis(ms));
                }

                StageSpec::from_arc(stage.display_name(), stage.filter.build(&output_dir))
                    .workers(stage.workers.unwrap_or(defaults.workers))
                    .queue_capacity(stage.queue_capacity.unwrap_or(defaults.queue_capacity))
                    .retry(retry)
            })
            .collect()
    }

    /// Build a pipeline over the configured input directory.
    pub fn build_pipeline(&self) -> Result<Pipeline> {
        let source = DirectorySource::new(self.config.input_dir())
            .with_extensions(self.config.source.extensions.iter().cloned())
            .recursive(self.config.source.recursive);
        self.build_pipeline_with(source)
    }

    /// Build a pipeline over an arbitrary source, with the configured
    /// stages, dedup store, and dead-letter sink.
    pub fn build_pipeline_with(&self, source: impl Source) -> Result<Pipeline> {
        let mut builder = Pipeline::builder()
            .source(source)
            .output_capacity(self.config.pipeline.queue_capacity);

        for spec in self.stage_specs() {
            builder = builder.stage(spec);
        }

        if self.config.dedup.enabled {
            let store = FileDedupStore::open(self.config.dedup_path())?
                .with_sync_writes(self.config.dedup.sync_writes);
            tracing::debug!("Dedup log: {:?} ({} ids)", store.path(), store.len());
            builder = builder.dedup(Arc::new(store));
        }

        if self.config.dead_letter.enabled {
            let sink = DirectoryDeadLetterSink::new(self.config.dead_letter_dir())?;
            tracing::debug!("Dead letters: {:?}", sink.dir());
            builder = builder.dead_letters(Arc::new(sink));
        }

        if self.config.metrics.report_interval_ms > 0 {
            builder = builder.report_interval(Duration::from_millis(
                self.config.metrics.report_interval_ms,
            ));
        }

        Ok(builder.build()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::DynamicImage;

    fn config_in(dir: &std::path::Path) -> Config {
        let mut config = Config::default();
        config.general.data_dir = dir.to_path_buf();
        config.pipeline.base_backoff_ms = 1;
        config.metrics.report_interval_ms = 0;
        config
    }

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }

    #[test]
    fn test_stage_specs_apply_defaults_and_overrides() {
        let mut config = Config::default();
        config.pipeline.workers = 3;
        config.stages[1].workers = Some(7);
        config.stages[1].name = Some("shrink".into());

        let specs = Relay::new(config).stage_specs();
        let names: Vec<&str> = specs.iter().map(|s| s.name()).collect();
        assert_eq!(names, vec!["load", "shrink", "flip_horizontal", "save"]);
        assert_eq!(specs[0].workers, 3);
        assert_eq!(specs[1].workers, 7);
    }

    #[tokio::test]
    async fn test_default_job_processes_directory() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(dir.path());
        let input = config.input_dir();
        std::fs::create_dir_all(&input).unwrap();
        DynamicImage::new_rgb8(1000, 800).save(input.join("a.png")).unwrap();
        DynamicImage::new_rgb8(40, 40).save(input.join("b.jpg")).unwrap();
        std::fs::write(input.join("broken.png"), b"garbage").unwrap();

        let relay = Relay::new(config);
        let mut pipeline = relay.build_pipeline().unwrap();
        pipeline.start().unwrap();
        let completion = pipeline
            .wait_for_completion(Duration::from_secs(30))
            .await
            .unwrap();
        assert_eq!(completion, Completion::Drained);

        let out = relay.config().output_dir();
        let resized = image::open(out.join("a.png")).unwrap();
        assert_eq!((resized.width(), resized.height()), (500, 400));
        assert!(out.join("b.jpg").exists());

        let snap = pipeline.metrics().snapshot();
        assert_eq!(snap.ingested, 3);
        assert_eq!(snap.completed, 2);
        assert_eq!(snap.stages[0].errors, 1);

        let dlq = DirectoryDeadLetterSink::new(relay.config().dead_letter_dir()).unwrap();
        let records = dlq.list().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].stage, "load");
        assert_eq!(records[0].meta.file_name(), Some("broken.png"));
    }

    #[tokio::test]
    async fn test_rerun_skips_completed_stages() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(dir.path());
        let input = config.input_dir();
        std::fs::create_dir_all(&input).unwrap();
        DynamicImage::new_rgb8(10, 10).save(input.join("a.png")).unwrap();

        for run in 0..2 {
            let relay = Relay::new(config.clone());
            let mut pipeline = relay.build_pipeline().unwrap();
            pipeline.start().unwrap();
            pipeline
                .wait_for_completion(Duration::from_secs(30))
                .await
                .unwrap();

            let snap = pipeline.metrics().snapshot();
            if run == 0 {
                assert_eq!(snap.total_processed(), 4);
            } else {
                assert_eq!(snap.total_processed(), 0);
                assert!(snap.stages.iter().all(|s| s.skipped == 1));
            }
        }

        let store = FileDedupStore::open(config.dedup_path()).unwrap();
        assert_eq!(store.len(), 1);
    }
}
