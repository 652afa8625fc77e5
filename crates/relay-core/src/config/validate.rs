//! Configuration validation with range checks.

use std::collections::HashSet;

use crate::error::ConfigError;
use crate::filters::FilterSpec;

use super::Config;

impl Config {
    /// Validate configuration values are within acceptable ranges.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pipeline.workers == 0 {
            return Err(ConfigError::ValidationError(
                "pipeline.workers must be > 0".into(),
            ));
        }
        if self.pipeline.queue_capacity == 0 {
            return Err(ConfigError::ValidationError(
                "pipeline.queue_capacity must be > 0".into(),
            ));
        }
        if self.pipeline.max_attempts == 0 {
            return Err(ConfigError::ValidationError(
                "pipeline.max_attempts must be > 0".into(),
            ));
        }
        if self.pipeline.max_backoff_ms < self.pipeline.base_backoff_ms {
            return Err(ConfigError::ValidationError(
                "pipeline.max_backoff_ms must be >= pipeline.base_backoff_ms".into(),
            ));
        }
        if self.pipeline.stop_timeout_ms == 0 {
            return Err(ConfigError::ValidationError(
                "pipeline.stop_timeout_ms must be > 0".into(),
            ));
        }
        if self.pipeline.completion_timeout_ms == 0 {
            return Err(ConfigError::ValidationError(
                "pipeline.completion_timeout_ms must be > 0".into(),
            ));
        }
        if self.source.extensions.is_empty() {
            return Err(ConfigError::ValidationError(
                "source.extensions must not be empty".into(),
            ));
        }
        if !matches!(self.logging.format.as_str(), "pretty" | "json") {
            return Err(ConfigError::ValidationError(format!(
                "logging.format must be \"pretty\" or \"json\", got \"{}\"",
                self.logging.format
            )));
        }

        let mut names = HashSet::new();
        for (i, stage) in self.stages.iter().enumerate() {
            let name = stage.display_name();
            if name.trim().is_empty() || name.contains(',') {
                return Err(ConfigError::ValidationError(format!(
                    "stages[{i}].name \"{name}\" must be non-empty and contain no commas"
                )));
            }
            if !names.insert(name) {
                return Err(ConfigError::ValidationError(format!(
                    "stages[{i}].name \"{name}\" is used by more than one stage"
                )));
            }
            if stage.workers == Some(0) {
                return Err(ConfigError::ValidationError(format!(
                    "stages[{i}].workers must be > 0"
                )));
            }
            if stage.queue_capacity == Some(0) {
                return Err(ConfigError::ValidationError(format!(
                    "stages[{i}].queue_capacity must be > 0"
                )));
            }
            if stage.max_attempts == Some(0) {
                return Err(ConfigError::ValidationError(format!(
                    "stages[{i}].max_attempts must be > 0"
                )));
            }
            if stage.timeout_ms == Some(0) {
                return Err(ConfigError::ValidationError(format!(
                    "stages[{i}].timeout_ms must be > 0"
                )));
            }
            match &stage.filter {
                FilterSpec::Blur { sigma } if sigma.is_nan() || *sigma <= 0.0 => {
                    return Err(ConfigError::ValidationError(format!(
                        "stages[{i}].filter.sigma must be > 0"
                    )));
                }
                FilterSpec::Resize {
                    width: Some(0), ..
                }
                | FilterSpec::Resize {
                    height: Some(0), ..
                } => {
                    return Err(ConfigError::ValidationError(format!(
                        "stages[{i}].filter width and height must be > 0"
                    )));
                }
                _ => {}
            }
        }
        Ok(())
    }
}
