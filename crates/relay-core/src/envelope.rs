//! The unit of work that flows between pipeline stages.
//!
//! An [`Envelope`] carries an opaque [`Payload`] plus identity and progress
//! metadata. Ownership moves with each queue hand-off, so a stage can never
//! observe a payload after passing it downstream.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use image::DynamicImage;
use serde::{Deserialize, Serialize};

/// Stable identifier of a work item for its whole journey.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EnvelopeId(String);

impl EnvelopeId {
    /// Wrap an existing identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Derive an identifier from a path and its modification signature.
    ///
    /// Hashes `path|size|mtime` so an edited file gets a fresh identity and
    /// an untouched one keeps its dedup history across runs. Files that
    /// cannot be stat'ed fall back to `path|file_name`.
    pub fn for_path(path: &Path) -> Self {
        let signature = match std::fs::metadata(path) {
            Ok(meta) => {
                let mtime = meta
                    .modified()
                    .ok()
                    .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                    .map(|d| d.as_secs())
                    .unwrap_or(0);
                format!("{}|{}|{}", path.display(), meta.len(), mtime)
            }
            Err(_) => {
                let name = path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default();
                format!("{}|{}", path.display(), name)
            }
        };
        Self(blake3::hash(signature.as_bytes()).to_hex().to_string())
    }

    /// Generate a random identifier for items with no natural identity.
    pub fn random() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First `n` characters, for file names and log lines.
    pub fn short(&self, n: usize) -> &str {
        let end = self
            .0
            .char_indices()
            .nth(n)
            .map(|(i, _)| i)
            .unwrap_or(self.0.len());
        &self.0[..end]
    }
}

impl fmt::Display for EnvelopeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EnvelopeId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Payload carried by an envelope; the variant changes as stages transform it.
#[derive(Debug, Clone, Default)]
pub enum Payload {
    #[default]
    Empty,
    Path(PathBuf),
    Image(DynamicImage),
    Bytes(Vec<u8>),
    Text(String),
    Json(serde_json::Value),
}

impl Payload {
    /// Name of the variant, used in type-mismatch errors.
    pub fn kind(&self) -> &'static str {
        match self {
            Payload::Empty => "empty",
            Payload::Path(_) => "path",
            Payload::Image(_) => "image",
            Payload::Bytes(_) => "bytes",
            Payload::Text(_) => "text",
            Payload::Json(_) => "json",
        }
    }

    /// Human-readable description that never includes binary content.
    pub fn summary(&self) -> String {
        match self {
            Payload::Empty => "empty".to_string(),
            Payload::Path(p) => format!("path {}", p.display()),
            Payload::Image(img) => format!(
                "image {}x{} {}",
                img.width(),
                img.height(),
                color_name(img)
            ),
            Payload::Bytes(b) => format!("bytes len={}", b.len()),
            Payload::Text(t) => {
                let preview: String = t.chars().take(64).collect();
                if preview.len() < t.len() {
                    format!("text len={} \"{}...\"", t.len(), preview)
                } else {
                    format!("text len={} \"{}\"", t.len(), preview)
                }
            }
            Payload::Json(v) => {
                let kind = match v {
                    serde_json::Value::Object(m) => format!("object keys={}", m.len()),
                    serde_json::Value::Array(a) => format!("array len={}", a.len()),
                    _ => "scalar".to_string(),
                };
                format!("json {kind}")
            }
        }
    }
}

fn color_name(img: &DynamicImage) -> &'static str {
    match img {
        DynamicImage::ImageLuma8(_) => "luma8",
        DynamicImage::ImageLumaA8(_) => "luma_a8",
        DynamicImage::ImageRgb8(_) => "rgb8",
        DynamicImage::ImageRgba8(_) => "rgba8",
        DynamicImage::ImageLuma16(_) => "luma16",
        DynamicImage::ImageLumaA16(_) => "luma_a16",
        DynamicImage::ImageRgb16(_) => "rgb16",
        DynamicImage::ImageRgba16(_) => "rgba16",
        DynamicImage::ImageRgb32F(_) => "rgb32f",
        DynamicImage::ImageRgba32F(_) => "rgba32f",
        _ => "other",
    }
}

/// Identity and progress metadata attached to every envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvelopeMeta {
    /// Attempts made at the stage named by `attempt_stage`
    pub(crate) attempts: u32,

    /// Index of the last stage that processed this envelope successfully
    pub(crate) stage: Option<usize>,

    /// Stage index the `attempts` counter belongs to
    pub(crate) attempt_stage: Option<usize>,

    /// Source path, if the item was ingested from the filesystem
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) orig_path: Option<PathBuf>,

    /// File name used when the item is written back out
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) file_name: Option<String>,

    /// When the item entered the pipeline
    pub(crate) ingested_at: DateTime<Utc>,

    /// Free-form annotations added by transforms
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
}

impl EnvelopeMeta {
    fn new(orig_path: Option<PathBuf>) -> Self {
        let file_name = orig_path
            .as_deref()
            .and_then(Path::file_name)
            .map(|n| n.to_string_lossy().into_owned());
        Self {
            attempts: 0,
            stage: None,
            attempt_stage: None,
            orig_path,
            file_name,
            ingested_at: Utc::now(),
            labels: BTreeMap::new(),
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn stage(&self) -> Option<usize> {
        self.stage
    }

    pub fn attempt_stage(&self) -> Option<usize> {
        self.attempt_stage
    }

    pub fn orig_path(&self) -> Option<&Path> {
        self.orig_path.as_deref()
    }

    pub fn file_name(&self) -> Option<&str> {
        self.file_name.as_deref()
    }

    pub fn ingested_at(&self) -> DateTime<Utc> {
        self.ingested_at
    }

    /// Point the attempt counter at `stage`.
    ///
    /// The count resets when it belongs to a different stage. A count with
    /// no stage attached is adopted as-is.
    pub(crate) fn enter_stage(&mut self, stage: usize) {
        match self.attempt_stage {
            Some(current) if current == stage => {}
            Some(_) => {
                self.attempt_stage = Some(stage);
                self.attempts = 0;
            }
            None => self.attempt_stage = Some(stage),
        }
    }

    /// Record a successful pass through `stage`. Never moves backwards.
    pub(crate) fn complete_stage(&mut self, stage: usize) {
        self.stage = Some(self.stage.map_or(stage, |s| s.max(stage)));
    }
}

/// A unit of work: stable id, owned payload, and metadata.
#[derive(Debug, Clone)]
pub struct Envelope {
    id: EnvelopeId,
    payload: Payload,
    meta: EnvelopeMeta,
}

impl Envelope {
    /// Create an envelope with an explicit id.
    pub fn new(id: impl Into<EnvelopeId>, payload: Payload) -> Self {
        Self {
            id: id.into(),
            payload,
            meta: EnvelopeMeta::new(None),
        }
    }

    /// Create an envelope for a file, deriving its id from the file signature.
    pub fn from_path(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        Self {
            id: EnvelopeId::for_path(&path),
            meta: EnvelopeMeta::new(Some(path.clone())),
            payload: Payload::Path(path),
        }
    }

    /// Create an envelope with a random id.
    pub fn with_random_id(payload: Payload) -> Self {
        Self::new(EnvelopeId::random(), payload)
    }

    /// Restore an envelope from persisted metadata, e.g. when replaying a
    /// dead letter. The attempt counter resumes where it stopped.
    pub fn resume(id: EnvelopeId, payload: Payload, meta: EnvelopeMeta) -> Self {
        Self { id, payload, meta }
    }

    /// Carry over `attempts` already spent at stage index `stage`, so the
    /// retry budget there continues instead of starting over.
    pub fn with_attempts(mut self, stage: usize, attempts: u32) -> Self {
        self.meta.attempt_stage = Some(stage);
        self.meta.attempts = attempts;
        self
    }

    pub fn id(&self) -> &EnvelopeId {
        &self.id
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn payload_mut(&mut self) -> &mut Payload {
        &mut self.payload
    }

    /// Replace the payload, returning the previous one.
    pub fn set_payload(&mut self, payload: Payload) -> Payload {
        std::mem::replace(&mut self.payload, payload)
    }

    /// Move the payload out, leaving [`Payload::Empty`].
    pub fn take_payload(&mut self) -> Payload {
        std::mem::take(&mut self.payload)
    }

    pub fn meta(&self) -> &EnvelopeMeta {
        &self.meta
    }

    pub(crate) fn meta_mut(&mut self) -> &mut EnvelopeMeta {
        &mut self.meta
    }

    pub fn labels_mut(&mut self) -> &mut BTreeMap<String, String> {
        &mut self.meta.labels
    }

    /// Non-binary summary of the payload, safe to persist.
    pub fn summary(&self) -> String {
        self.payload.summary()
    }
}

/// What travels through a queue: a real envelope or the end-of-stream marker.
#[derive(Debug)]
pub(crate) enum Packet {
    Item(Box<Envelope>),
    Sentinel,
}
