//! Persistent record of which stages each item has completed.
//!
//! Workers consult the store before running a transform so that a batch
//! interrupted part-way can be re-run without redoing finished work.

use std::collections::{BTreeSet, HashMap};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};

use crate::envelope::EnvelopeId;
use crate::error::PersistenceError;

/// Idempotent-skip bookkeeping shared by every worker of every stage.
pub trait DedupStore: Send + Sync {
    /// Whether `id` has already completed `stage`.
    fn has_completed(&self, id: &EnvelopeId, stage: &str) -> Result<bool, PersistenceError>;

    /// Record that `id` completed `stage`. Marking twice has no further effect.
    fn mark_completed(&self, id: &EnvelopeId, stage: &str) -> Result<(), PersistenceError>;

    /// Every stage `id` has completed.
    fn completed_stages(&self, id: &EnvelopeId) -> Result<BTreeSet<String>, PersistenceError>;
}

/// One line of the dedup log.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct DedupLine {
    id: String,
    /// Comma-separated, sorted stage names
    stages: String,
    /// Unix seconds of the last update
    last_ts: i64,
}

#[derive(Debug, Default)]
struct Entry {
    stages: BTreeSet<String>,
    last_ts: i64,
}

impl Entry {
    fn to_line(&self, id: &str) -> DedupLine {
        DedupLine {
            id: id.to_string(),
            stages: self.stages.iter().cloned().collect::<Vec<_>>().join(","),
            last_ts: self.last_ts,
        }
    }
}

fn parse_stages(encoded: &str) -> BTreeSet<String> {
    encoded
        .split(',')
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

struct LogState {
    entries: HashMap<String, Entry>,
    file: File,
    lines: usize,
}

/// Durable dedup store backed by an append-only JSON-lines log.
///
/// Each mark appends the full, updated stage set for that id, so replaying
/// the log top to bottom and keeping the last line per id reconstructs the
/// state. A torn final line from a crash is skipped on load.
pub struct FileDedupStore {
    path: PathBuf,
    sync_writes: bool,
    state: Mutex<LogState>,
}

impl FileDedupStore {
    /// Open (or create) the log at `path` and replay it.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, PersistenceError> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| PersistenceError::io(parent, e))?;
        }

        let (entries, lines) = if path.exists() {
            Self::replay(&path)?
        } else {
            (HashMap::new(), 0)
        };

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| PersistenceError::io(&path, e))?;

        tracing::debug!(
            "Dedup store {:?}: {} id(s) from {} line(s)",
            path,
            entries.len(),
            lines
        );

        Ok(Self {
            path,
            sync_writes: false,
            state: Mutex::new(LogState {
                entries,
                file,
                lines,
            }),
        })
    }

    /// Call `sync_data` after every append.
    pub fn with_sync_writes(mut self, sync: bool) -> Self {
        self.sync_writes = sync;
        self
    }

    fn replay(path: &Path) -> Result<(HashMap<String, Entry>, usize), PersistenceError> {
        let file = File::open(path).map_err(|e| PersistenceError::io(path, e))?;
        let mut entries = HashMap::new();
        let mut lines = 0usize;

        for (n, line) in BufReader::new(file).lines().enumerate() {
            let line = line.map_err(|e| PersistenceError::io(path, e))?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<DedupLine>(&line) {
                Ok(record) => {
                    entries.insert(
                        record.id,
                        Entry {
                            stages: parse_stages(&record.stages),
                            last_ts: record.last_ts,
                        },
                    );
                    lines += 1;
                }
                Err(e) => {
                    tracing::warn!("Skipping unreadable dedup line {} in {:?}: {}", n + 1, path, e);
                }
            }
        }

        Ok((entries, lines))
    }

    fn lock(&self) -> MutexGuard<'_, LogState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of ids with at least one completed stage.
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Rewrite the log with exactly one line per id.
    ///
    /// Writes to a sibling temp file and renames it over the log, so a
    /// crash mid-compaction leaves the old log intact.
    pub fn compact(&self) -> Result<usize, PersistenceError> {
        let mut state = self.lock();
        let tmp = self.path.with_extension("compact.tmp");

        {
            let mut out = File::create(&tmp).map_err(|e| PersistenceError::io(&tmp, e))?;
            let mut ids: Vec<&String> = state.entries.keys().collect();
            ids.sort();
            for id in ids {
                let line = serde_json::to_string(&state.entries[id].to_line(id))?;
                writeln!(out, "{line}").map_err(|e| PersistenceError::io(&tmp, e))?;
            }
            out.sync_all().map_err(|e| PersistenceError::io(&tmp, e))?;
        }

        std::fs::rename(&tmp, &self.path).map_err(|e| PersistenceError::io(&self.path, e))?;
        state.file = OpenOptions::new()
            .append(true)
            .open(&self.path)
            .map_err(|e| PersistenceError::io(&self.path, e))?;

        let removed = state.lines.saturating_sub(state.entries.len());
        state.lines = state.entries.len();
        tracing::info!("Compacted dedup log {:?}: dropped {} stale line(s)", self.path, removed);
        Ok(removed)
    }
}

impl DedupStore for FileDedupStore {
    fn has_completed(&self, id: &EnvelopeId, stage: &str) -> Result<bool, PersistenceError> {
        Ok(self
            .lock()
            .entries
            .get(id.as_str())
            .is_some_and(|e| e.stages.contains(stage)))
    }

    fn mark_completed(&self, id: &EnvelopeId, stage: &str) -> Result<(), PersistenceError> {
        let mut state = self.lock();
        let state = &mut *state;

        if state
            .entries
            .get(id.as_str())
            .is_some_and(|e| e.stages.contains(stage))
        {
            return Ok(());
        }

        // Build the new line before touching memory so a failed write
        // leaves the in-memory view matching the log.
        let mut stages = state
            .entries
            .get(id.as_str())
            .map(|e| e.stages.clone())
            .unwrap_or_default();
        stages.insert(stage.to_string());
        let entry = Entry {
            stages,
            last_ts: chrono::Utc::now().timestamp(),
        };
        let line = serde_json::to_string(&entry.to_line(id.as_str()))?;

        writeln!(state.file, "{line}").map_err(|e| PersistenceError::io(&self.path, e))?;
        if self.sync_writes {
            state
                .file
                .sync_data()
                .map_err(|e| PersistenceError::io(&self.path, e))?;
        }

        state.entries.insert(id.as_str().to_string(), entry);
        state.lines += 1;
        Ok(())
    }

    fn completed_stages(&self, id: &EnvelopeId) -> Result<BTreeSet<String>, PersistenceError> {
        Ok(self
            .lock()
            .entries
            .get(id.as_str())
            .map(|e| e.stages.clone())
            .unwrap_or_default())
    }
}

/// Non-durable dedup store; same semantics, forgotten on exit.
#[derive(Debug, Default)]
pub struct MemoryDedupStore {
    entries: Mutex<HashMap<String, BTreeSet<String>>>,
}

impl MemoryDedupStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, BTreeSet<String>>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl DedupStore for MemoryDedupStore {
    fn has_completed(&self, id: &EnvelopeId, stage: &str) -> Result<bool, PersistenceError> {
        Ok(self
            .lock()
            .get(id.as_str())
            .is_some_and(|s| s.contains(stage)))
    }

    fn mark_completed(&self, id: &EnvelopeId, stage: &str) -> Result<(), PersistenceError> {
        self.lock()
            .entry(id.as_str().to_string())
            .or_default()
            .insert(stage.to_string());
        Ok(())
    }

    fn completed_stages(&self, id: &EnvelopeId) -> Result<BTreeSet<String>, PersistenceError> {
        Ok(self.lock().get(id.as_str()).cloned().unwrap_or_default())
    }
}
