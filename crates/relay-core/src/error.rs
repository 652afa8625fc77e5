//! Error types for the Relay processing pipeline.
//!
//! Errors are split by how far they are allowed to travel:
//! - [`ConfigError`] and [`PipelineError`] are construction-time and fatal.
//! - [`TransformError`] is a single failed attempt and gets retried.
//! - [`RetryExhausted`] is a terminal per-item failure and gets dead-lettered.
//! - [`SourceError`] and [`PersistenceError`] are reported and contained.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Top-level error type for Relay operations.
#[derive(Error, Debug)]
pub enum RelayError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Pipeline construction errors
    #[error("Pipeline error: {0}")]
    Pipeline(#[from] PipelineError),

    /// Source enumeration errors
    #[error("Source error: {0}")]
    Source(#[from] SourceError),

    /// Dedup or dead-letter persistence errors
    #[error("Persistence error: {0}")]
    Persistence(#[from] PersistenceError),

    /// General I/O errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Configuration-specific errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Failed to read the config file from disk
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    /// Failed to parse TOML configuration
    #[error("Failed to parse config: {0}")]
    ParseError(#[from] toml::de::Error),

    /// Configuration values are invalid
    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

/// Pipeline construction and lifecycle errors.
///
/// These are the only errors that abort a run; everything that happens to
/// an individual item is contained inside its stage worker.
#[derive(Error, Debug)]
pub enum PipelineError {
    /// No stages were configured
    #[error("pipeline has no stages")]
    NoStages,

    /// No source was configured
    #[error("pipeline has no source")]
    NoSource,

    /// A stage was configured with an empty worker pool
    #[error("stage '{stage}' must have at least one worker")]
    ZeroWorkers { stage: String },

    /// A queue was configured with zero capacity
    #[error("queue for stage '{stage}' must have a capacity > 0")]
    ZeroCapacity { stage: String },

    /// A stage would never invoke its transform
    #[error("stage '{stage}' must allow at least one attempt")]
    ZeroAttempts { stage: String },

    /// The metrics reporter would tick continuously
    #[error("metrics report interval must be > 0")]
    ZeroReportInterval,

    /// Two stages share a name, which would alias their dedup records
    #[error("duplicate stage name '{0}'")]
    DuplicateStage(String),

    /// A stage name cannot be stored in the dedup log
    #[error("invalid stage name '{0}': must be non-empty and contain no commas")]
    InvalidStageName(String),

    /// `start()` was called twice
    #[error("pipeline already started")]
    AlreadyStarted,

    /// An operation that needs running workers was called before `start()`
    #[error("pipeline not started")]
    NotStarted,
}

/// A single failed transform attempt.
#[derive(Error, Debug)]
pub enum TransformError {
    /// The envelope carried a payload variant the transform cannot handle
    #[error("expected {expected} payload, found {found}")]
    UnexpectedPayload {
        expected: &'static str,
        found: &'static str,
    },

    /// Image decoding failed
    #[error("Decode error for {path}: {message}")]
    Decode { path: PathBuf, message: String },

    /// Image encoding or writing failed
    #[error("Encode error for {path}: {message}")]
    Encode { path: PathBuf, message: String },

    /// The attempt exceeded the stage timeout
    #[error("Timeout in {stage} stage after {}ms", .timeout.as_millis())]
    Timeout { stage: String, timeout: Duration },

    /// The envelope arrived with its attempt budget already used up
    #[error("no attempts left: {attempts} of {max_attempts} already used")]
    AttemptsSpent { attempts: u32, max_attempts: u32 },

    /// A blocking task panicked or was cancelled
    #[error("Task join error: {0}")]
    Join(String),

    /// General I/O errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Free-form failure raised by a transform
    #[error("{0}")]
    Failed(String),
}

impl TransformError {
    /// Convenience constructor for ad-hoc failures.
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }
}

/// Terminal per-item failure: every attempt a stage allowed has failed.
#[derive(Error, Debug)]
#[error("stage '{stage}' gave up after {attempts} attempt(s): {last}")]
pub struct RetryExhausted {
    /// Name of the stage that gave up
    pub stage: String,
    /// Attempts made during this invocation
    pub attempts: u32,
    /// Cause of the final attempt's failure
    #[source]
    pub last: TransformError,
    /// Error text of every attempt, oldest first
    pub history: Vec<String>,
}

/// Source enumeration errors.
#[derive(Error, Debug)]
pub enum SourceError {
    /// Input location does not exist
    #[error("Input not found: {0}")]
    NotFound(PathBuf),

    /// Enumeration failed part-way
    #[error("Failed to enumerate {path}: {message}")]
    Enumerate { path: PathBuf, message: String },

    /// The blocking enumeration task panicked
    #[error("Source task failed: {0}")]
    Join(String),
}

/// Dedup store and dead-letter sink persistence errors.
#[derive(Error, Debug)]
pub enum PersistenceError {
    /// Filesystem failure against a specific path
    #[error("IO error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Record could not be (de)serialized
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A requested record does not exist
    #[error("Record not found: {0}")]
    NotFound(String),
}

impl PersistenceError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Convenience type alias for Relay results.
pub type Result<T> = std::result::Result<T, RelayError>;

/// Convenience type alias for transform results.
pub type TransformResult<T> = std::result::Result<T, TransformError>;
