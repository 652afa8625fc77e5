//! The `relay run` command.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Args;
use indicatif::{ProgressBar, ProgressStyle};
use relay_core::{Completion, Config, MetricsCollector, MetricsSnapshot, Relay};

/// Arguments for the `run` command.
#[derive(Args, Debug, Default)]
pub struct RunArgs {
    /// Image file or directory to read (defaults to the configured input directory)
    pub input: Option<PathBuf>,

    /// Directory for saved images (defaults to the configured output directory)
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Config file to use instead of the default location
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Workers per stage (stages with their own setting keep it)
    #[arg(short, long)]
    pub workers: Option<usize>,

    /// Input queue capacity per stage
    #[arg(long)]
    pub queue_capacity: Option<usize>,

    /// Attempts per item and stage before dead-lettering
    #[arg(long)]
    pub max_attempts: Option<u32>,

    /// Walk subdirectories of the input directory
    #[arg(short, long)]
    pub recursive: bool,

    /// Process every stage even if the dedup log says it already ran
    #[arg(long)]
    pub no_dedup: bool,

    /// Do not write dead-letter records
    #[arg(long)]
    pub no_dead_letter: bool,

    /// Hide the progress bar
    #[arg(long)]
    pub no_progress: bool,

    /// Print the final metrics as JSON instead of a table
    #[arg(long)]
    pub json: bool,
}

/// Execute the run command.
pub async fn execute(args: RunArgs) -> anyhow::Result<()> {
    let config = setup_config(&args)?;

    let input = config.input_dir();
    if !input.exists() {
        anyhow::bail!(
            "Input path does not exist: {:?}\n\n  \
             Hint: pass a directory or set source.input_dir in the config.",
            input
        );
    }
    tracing::info!("Input: {:?}", input);
    tracing::info!("Output: {:?}", config.output_dir());

    let relay = Relay::new(config);
    let mut pipeline = relay.build_pipeline()?;
    tracing::info!("Stages: {}", pipeline.stage_names().join(" -> "));

    let metrics = pipeline.metrics();
    let shutdown = pipeline.shutdown_handle();
    pipeline.start()?;

    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupt received, stopping after in-flight items...");
            shutdown.request_stop();
        }
    });

    let progress = if args.no_progress {
        None
    } else {
        let bar = create_progress_bar()?;
        let task = tokio::spawn(track_progress(bar.clone(), metrics.clone()));
        Some((bar, task))
    };

    let completion = pipeline
        .wait_for_completion(relay.config().completion_timeout())
        .await?;

    if completion != Completion::Drained {
        let report = pipeline.stop(relay.config().stop_timeout()).await;
        if report.timed_out {
            tracing::warn!(
                "{} task(s) still running after {:?}",
                report.still_running,
                relay.config().stop_timeout()
            );
        }
    }
    interrupt.abort();

    let snapshot = metrics.snapshot();
    if let Some((bar, task)) = progress {
        task.abort();
        update_progress(&bar, &snapshot);
        bar.finish_and_clear();
    }

    if args.json {
        println!("{}", serde_json::to_string_pretty(&snapshot)?);
    } else {
        println!("{snapshot}");
    }

    if snapshot.total_errors() > 0 && relay.config().dead_letter.enabled {
        println!(
            "{} item(s) dead-lettered in {} (see `relay dlq list`)",
            snapshot.total_errors(),
            relay.config().dead_letter_dir().display()
        );
    }

    match completion {
        Completion::Drained => Ok(()),
        Completion::Stopped => {
            tracing::warn!("Run stopped before the input was exhausted");
            Ok(())
        }
        Completion::TimedOut => anyhow::bail!(
            "Pipeline did not finish within {:?}",
            relay.config().completion_timeout()
        ),
    }
}

/// Load the config and apply command-line overrides.
fn setup_config(args: &RunArgs) -> anyhow::Result<Config> {
    let mut config = super::load_config(args.config.as_deref())?;

    if let Some(input) = &args.input {
        config.source.input_dir = Some(super::expand(input));
    }
    if let Some(output) = &args.output {
        config.general.output_dir = Some(super::expand(output));
    }
    if let Some(workers) = args.workers {
        config.pipeline.workers = workers;
    }
    if let Some(capacity) = args.queue_capacity {
        config.pipeline.queue_capacity = capacity;
    }
    if let Some(attempts) = args.max_attempts {
        config.pipeline.max_attempts = attempts;
    }
    if args.recursive {
        config.source.recursive = true;
    }
    if args.no_dedup {
        config.dedup.enabled = false;
    }
    if args.no_dead_letter {
        config.dead_letter.enabled = false;
    }

    config.validate()?;
    Ok(config)
}

fn create_progress_bar() -> anyhow::Result<ProgressBar> {
    let pb = ProgressBar::new(0);
    pb.set_style(
        ProgressStyle::default_bar()
            .template(
                "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({percent}%) {msg}",
            )?
            .progress_chars("##-"),
    );
    pb.set_message("starting...");
    Ok(pb)
}

/// Mirror the collector onto the bar until aborted.
async fn track_progress(bar: ProgressBar, metrics: Arc<MetricsCollector>) {
    let mut ticker = tokio::time::interval(Duration::from_millis(200));
    loop {
        ticker.tick().await;
        update_progress(&bar, &metrics.snapshot());
    }
}

/// An item is finished once it completed or was dead-lettered.
fn finished(snapshot: &MetricsSnapshot) -> u64 {
    snapshot.completed + snapshot.total_errors()
}

fn update_progress(bar: &ProgressBar, snapshot: &MetricsSnapshot) {
    bar.set_length(snapshot.ingested);
    bar.set_position(finished(snapshot).min(snapshot.ingested));
    bar.set_message(format!(
        "{:.1} img/sec, {} failed",
        snapshot.completion_rate(),
        snapshot.total_errors()
    ));
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_core::DirectoryDeadLetterSink;

    fn write_config(dir: &std::path::Path) -> PathBuf {
        let path = dir.join("config.toml");
        let toml = format!(
            "[general]\ndata_dir = {:?}\n\n\
             [pipeline]\nbase_backoff_ms = 1\n\n\
             [metrics]\nreport_interval_ms = 0\n",
            dir.join("data")
        );
        std::fs::write(&path, toml).unwrap();
        path
    }

    #[test]
    fn test_overrides_apply_to_config() {
        let dir = tempfile::tempdir().unwrap();
        let args = RunArgs {
            input: Some(dir.path().join("in")),
            output: Some(dir.path().join("out")),
            config: Some(write_config(dir.path())),
            workers: Some(5),
            max_attempts: Some(1),
            no_dedup: true,
            ..Default::default()
        };

        let config = setup_config(&args).unwrap();
        assert_eq!(config.input_dir(), dir.path().join("in"));
        assert_eq!(config.output_dir(), dir.path().join("out"));
        assert_eq!(config.pipeline.workers, 5);
        assert_eq!(config.pipeline.max_attempts, 1);
        assert_eq!(config.pipeline.base_backoff_ms, 1);
        assert!(!config.dedup.enabled);
        assert!(config.dead_letter.enabled);
    }

    #[test]
    fn test_invalid_override_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let args = RunArgs {
            config: Some(write_config(dir.path())),
            workers: Some(0),
            ..Default::default()
        };
        let err = setup_config(&args).unwrap_err();
        assert!(err.to_string().contains("pipeline.workers"));
    }

    #[test]
    fn test_missing_config_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let args = RunArgs {
            config: Some(dir.path().join("nope.toml")),
            ..Default::default()
        };
        assert!(setup_config(&args).is_err());
    }

    #[test]
    fn test_finished_counts_dead_letters() {
        let metrics = MetricsCollector::new(["a"]);
        metrics.record_ingested();
        metrics.record_ingested();
        metrics.record_error(0);
        metrics.record_completed();
        assert_eq!(finished(&metrics.snapshot()), 2);
    }

    #[tokio::test]
    async fn test_run_processes_directory() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("in");
        std::fs::create_dir_all(&input).unwrap();
        image::DynamicImage::new_rgb8(20, 10)
            .save(input.join("a.png"))
            .unwrap();
        std::fs::write(input.join("bad.jpg"), b"not an image").unwrap();

        let args = RunArgs {
            input: Some(input),
            output: Some(dir.path().join("out")),
            config: Some(write_config(dir.path())),
            workers: Some(2),
            no_progress: true,
            ..Default::default()
        };
        execute(args).await.unwrap();

        assert!(dir.path().join("out").join("a.png").exists());
        let dlq = DirectoryDeadLetterSink::new(dir.path().join("data").join("dlq")).unwrap();
        assert_eq!(dlq.list().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_run_rejects_missing_input() {
        let dir = tempfile::tempdir().unwrap();
        let args = RunArgs {
            input: Some(dir.path().join("missing")),
            config: Some(write_config(dir.path())),
            no_progress: true,
            ..Default::default()
        };
        let err = execute(args).await.unwrap_err();
        assert!(err.to_string().contains("does not exist"));
    }
}
