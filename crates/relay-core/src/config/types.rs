//! Sub-configuration structs with their defaults.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::filters::FilterSpec;

/// General settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Base directory for inputs, outputs, and run state
    pub data_dir: PathBuf,

    /// Where `save` stages write; defaults to `<data_dir>/output`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_dir: Option<PathBuf>,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("~/.relay"),
            output_dir: None,
        }
    }
}

/// Where work items come from.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    /// Directory to enumerate; defaults to `<data_dir>/input`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_dir: Option<PathBuf>,

    /// Accepted file extensions (case-insensitive)
    pub extensions: Vec<String>,

    /// Descend into subdirectories
    pub recursive: bool,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            input_dir: None,
            extensions: crate::pipeline::source::DEFAULT_EXTENSIONS
                .iter()
                .map(|s| s.to_string())
                .collect(),
            recursive: false,
        }
    }
}

/// Pipeline-wide defaults; every stage may override them.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Workers per stage
    pub workers: usize,

    /// Max items buffered in front of each stage
    pub queue_capacity: usize,

    /// Transform invocations before an item is dead-lettered
    pub max_attempts: u32,

    /// Delay after the first failed attempt in milliseconds
    pub base_backoff_ms: u64,

    /// Upper bound on any backoff delay in milliseconds
    pub max_backoff_ms: u64,

    /// Randomize backoff delays
    pub jitter: bool,

    /// How long `stop` waits for workers in milliseconds
    pub stop_timeout_ms: u64,

    /// How long a run may take before it is stopped, in milliseconds
    pub completion_timeout_ms: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            queue_capacity: 8,
            max_attempts: 3,
            base_backoff_ms: 200,
            max_backoff_ms: 30_000,
            jitter: false,
            stop_timeout_ms: 10_000,
            completion_timeout_ms: 3_600_000,
        }
    }
}

/// One `[[stages]]` entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageConfig {
    /// Unique stage name; defaults to the filter kind
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workers: Option<usize>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue_capacity: Option<usize>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_attempts: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_backoff_ms: Option<u64>,

    /// Per-attempt deadline in milliseconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,

    /// What the stage does
    pub filter: FilterSpec,
}

impl StageConfig {
    pub fn new(filter: FilterSpec) -> Self {
        Self {
            name: None,
            workers: None,
            queue_capacity: None,
            max_attempts: None,
            base_backoff_ms: None,
            timeout_ms: None,
            filter,
        }
    }

    /// Configured name, or the filter kind.
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or_else(|| self.filter.kind())
    }
}

/// Stages used when the config file defines none: load, resize to fit
/// 500x500, mirror, save.
pub fn default_stages() -> Vec<StageConfig> {
    vec![
        StageConfig::new(FilterSpec::Load),
        StageConfig::new(FilterSpec::Resize {
            width: Some(500),
            height: Some(500),
            keep_aspect_ratio: true,
        }),
        StageConfig::new(FilterSpec::FlipHorizontal),
        StageConfig::new(FilterSpec::Save {
            output_dir: None,
            format: None,
        }),
    ]
}

/// Idempotent-skip settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DedupConfig {
    /// Skip stages an item already completed in an earlier run
    pub enabled: bool,

    /// Log file; defaults to `<data_dir>/dedup.jsonl`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,

    /// Flush every mark to disk before continuing
    pub sync_writes: bool,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: None,
            sync_writes: false,
        }
    }
}

/// Dead-letter settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeadLetterConfig {
    pub enabled: bool,

    /// Record directory; defaults to `<data_dir>/dlq`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dir: Option<PathBuf>,
}

impl Default for DeadLetterConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            dir: None,
        }
    }
}

/// Periodic metrics logging.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Interval between snapshots in milliseconds; 0 disables reporting
    pub report_interval_ms: u64,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            report_interval_ms: 5_000,
        }
    }
}

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: error, warn, info, debug, trace
    pub level: String,

    /// Log format: "pretty" or "json"
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}
