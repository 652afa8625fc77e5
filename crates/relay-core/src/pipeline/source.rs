//! Sources enumerate the work items and feed the first stage.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::watch;
use walkdir::WalkDir;

use crate::envelope::{Envelope, Packet};
use crate::error::SourceError;
use crate::metrics::MetricsCollector;

use super::push_unless_stopped;
use super::queue::BoundedQueue;

/// Produces the envelopes for one run.
///
/// `enumerate` is called exactly once, on a blocking thread.
pub trait Source: Send + 'static {
    fn enumerate(&mut self) -> Result<Vec<Envelope>, SourceError>;

    /// Short description for log lines.
    fn describe(&self) -> String {
        "source".to_string()
    }
}

/// Extensions picked up when none are configured.
pub const DEFAULT_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "bmp"];

/// Emits one envelope per supported file in a directory.
#[derive(Debug, Clone)]
pub struct DirectorySource {
    dir: PathBuf,
    extensions: Vec<String>,
    recursive: bool,
}

impl DirectorySource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            extensions: DEFAULT_EXTENSIONS.iter().map(|s| s.to_string()).collect(),
            recursive: false,
        }
    }

    /// Replace the accepted extensions (matched case-insensitively, without the dot).
    pub fn with_extensions<S: Into<String>>(
        mut self,
        extensions: impl IntoIterator<Item = S>,
    ) -> Self {
        self.extensions = extensions
            .into_iter()
            .map(|e| e.into().trim_start_matches('.').to_lowercase())
            .collect();
        self
    }

    /// Descend into subdirectories.
    pub fn recursive(mut self, recursive: bool) -> Self {
        self.recursive = recursive;
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// All supported files, sorted by path.
    ///
    /// A file path yields itself if supported. Unreadable entries below the
    /// root are skipped with a warning.
    pub fn discover(&self) -> Result<Vec<PathBuf>, SourceError> {
        if !self.dir.exists() {
            return Err(SourceError::NotFound(self.dir.clone()));
        }
        if self.dir.is_file() {
            return Ok(if self.is_supported(&self.dir) {
                vec![self.dir.clone()]
            } else {
                vec![]
            });
        }

        let mut walker = WalkDir::new(&self.dir).follow_links(true).min_depth(1);
        if !self.recursive {
            walker = walker.max_depth(1);
        }

        let mut files = Vec::new();
        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) if e.depth() == 0 => {
                    return Err(SourceError::Enumerate {
                        path: self.dir.clone(),
                        message: e.to_string(),
                    })
                }
                Err(e) => {
                    tracing::warn!("Skipping unreadable entry: {}", e);
                    continue;
                }
            };
            let path = entry.path();
            if path.is_file() && self.is_supported(path) {
                files.push(path.to_path_buf());
            }
        }

        files.sort();
        Ok(files)
    }

    fn is_supported(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| {
                let ext = ext.to_lowercase();
                self.extensions.iter().any(|e| *e == ext)
            })
            .unwrap_or(false)
    }
}

impl Source for DirectorySource {
    fn enumerate(&mut self) -> Result<Vec<Envelope>, SourceError> {
        Ok(self.discover()?.into_iter().map(Envelope::from_path).collect())
    }

    fn describe(&self) -> String {
        format!("directory {}", self.dir.display())
    }
}

/// Emits a prepared list of envelopes.
#[derive(Debug, Default)]
pub struct IterSource {
    items: Vec<Envelope>,
}

impl IterSource {
    pub fn new(items: impl IntoIterator<Item = Envelope>) -> Self {
        Self {
            items: items.into_iter().collect(),
        }
    }
}

impl Source for IterSource {
    fn enumerate(&mut self) -> Result<Vec<Envelope>, SourceError> {
        Ok(std::mem::take(&mut self.items))
    }

    fn describe(&self) -> String {
        format!("{} prepared item(s)", self.items.len())
    }
}

/// Feed `queue` from `source`, then close the stream with `sentinels`
/// end markers. The markers are sent even when enumeration fails.
///
/// Returns the number of envelopes handed to the first stage.
pub(crate) async fn run_source(
    mut source: Box<dyn Source>,
    queue: BoundedQueue<Packet>,
    sentinels: usize,
    metrics: Arc<MetricsCollector>,
    mut shutdown: watch::Receiver<bool>,
) -> usize {
    let description = source.describe();
    let enumerated = tokio::task::spawn_blocking(move || source.enumerate())
        .await
        .unwrap_or_else(|e| Err(SourceError::Join(e.to_string())));

    let mut sent = 0;
    match enumerated {
        Ok(items) => {
            tracing::info!("Source {} produced {} item(s)", description, items.len());
            for envelope in items {
                if !push_unless_stopped(&queue, Packet::Item(Box::new(envelope)), &mut shutdown)
                    .await
                {
                    tracing::debug!("Source stopped after {} item(s)", sent);
                    break;
                }
                metrics.record_ingested();
                sent += 1;
            }
        }
        Err(e) => tracing::error!("Source {} failed: {}", description, e),
    }

    for _ in 0..sentinels {
        if !push_unless_stopped(&queue, Packet::Sentinel, &mut shutdown).await {
            break;
        }
    }
    sent
}
