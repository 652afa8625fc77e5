//! Configuration management for Relay.
//!
//! Configuration is loaded from the platform config directory with defaults
//! for every section, so an empty file (or none at all) describes a working
//! four-stage image job.

mod types;
mod validate;

pub use types::*;

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Root configuration structure for Relay.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// General settings
    pub general: GeneralConfig,

    /// Input enumeration
    pub source: SourceConfig,

    /// Defaults shared by all stages
    pub pipeline: PipelineConfig,

    /// Idempotent skip on re-runs
    pub dedup: DedupConfig,

    /// Records for items that exhausted their retries
    pub dead_letter: DeadLetterConfig,

    /// Periodic metrics logging
    pub metrics: MetricsConfig,

    /// Logging settings
    pub logging: LoggingConfig,

    /// Stages in execution order
    pub stages: Vec<StageConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            general: GeneralConfig::default(),
            source: SourceConfig::default(),
            pipeline: PipelineConfig::default(),
            dedup: DedupConfig::default(),
            dead_letter: DeadLetterConfig::default(),
            metrics: MetricsConfig::default(),
            logging: LoggingConfig::default(),
            stages: default_stages(),
        }
    }
}

impl Config {
    /// Load configuration from the default location.
    ///
    /// Returns default configuration if the file doesn't exist.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load configuration from a specific file path.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse and validate a TOML document.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let mut config: Config = toml::from_str(content)?;
        if config.stages.is_empty() {
            config.stages = default_stages();
        }
        config.validate()?;
        Ok(config)
    }

    /// Get the default config file path.
    ///
    /// Uses platform-appropriate directories:
    /// - macOS: ~/Library/Application Support/com.relay.relay/config.toml
    /// - Linux: ~/.config/relay/config.toml
    /// - Windows: C:\Users\<User>\AppData\Roaming\relay\config\config.toml
    ///
    /// Falls back to ~/.relay/config.toml if directory detection fails.
    pub fn default_path() -> PathBuf {
        directories::ProjectDirs::from("com", "relay", "relay")
            .map(|dirs| dirs.config_dir().to_path_buf().join("config.toml"))
            .unwrap_or_else(|| {
                let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
                PathBuf::from(home).join(".relay").join("config.toml")
            })
    }

    /// Resolved data directory (with ~ expansion).
    pub fn data_dir(&self) -> PathBuf {
        expand(&self.general.data_dir)
    }

    pub fn input_dir(&self) -> PathBuf {
        self.source
            .input_dir
            .as_deref()
            .map(expand)
            .unwrap_or_else(|| self.data_dir().join("input"))
    }

    pub fn output_dir(&self) -> PathBuf {
        self.general
            .output_dir
            .as_deref()
            .map(expand)
            .unwrap_or_else(|| self.data_dir().join("output"))
    }

    pub fn dedup_path(&self) -> PathBuf {
        self.dedup
            .path
            .as_deref()
            .map(expand)
            .unwrap_or_else(|| self.data_dir().join("dedup.jsonl"))
    }

    pub fn dead_letter_dir(&self) -> PathBuf {
        self.dead_letter
            .dir
            .as_deref()
            .map(expand)
            .unwrap_or_else(|| self.data_dir().join("dlq"))
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.pipeline.stop_timeout_ms)
    }

    pub fn completion_timeout(&self) -> Duration {
        Duration::from_millis(self.pipeline.completion_timeout_ms)
    }

    /// Serialize the config to a pretty TOML string.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::ValidationError(e.to_string()))
    }
}

fn expand(path: &Path) -> PathBuf {
    let path_str = path.to_string_lossy();
    let expanded = shellexpand::tilde(&path_str);
    PathBuf::from(expanded.into_owned())
}
