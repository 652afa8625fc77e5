//! Dead Letter Queue for items that exhausted their retries.
//!
//! Each failure becomes one immutable JSON record holding the envelope's
//! identity and metadata, the error, the per-attempt trace, and a text
//! summary of the payload. Records are for later inspection and replay;
//! writing one is best-effort and never fails the calling worker.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::envelope::{Envelope, EnvelopeId, EnvelopeMeta, Payload};
use crate::error::{PersistenceError, RetryExhausted};

/// A persisted failure. Written once, never updated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetterRecord {
    /// Unique id of this record
    pub record_id: Uuid,
    /// Id of the failed envelope
    pub envelope_id: EnvelopeId,
    /// Name of the stage that gave up
    pub stage: String,
    /// Position of that stage in the pipeline
    pub stage_index: usize,
    /// Envelope metadata at the time of failure
    pub meta: EnvelopeMeta,
    /// Final error message
    pub error: String,
    /// Error message of every attempt, oldest first
    pub trace: Vec<String>,
    /// When the record was written
    pub timestamp: DateTime<Utc>,
    /// Text description of the payload (never the payload itself)
    pub payload_summary: String,
}

impl DeadLetterRecord {
    /// Snapshot a failed envelope.
    pub fn new(envelope: &Envelope, stage_index: usize, failure: &RetryExhausted) -> Self {
        Self {
            record_id: Uuid::new_v4(),
            envelope_id: envelope.id().clone(),
            stage: failure.stage.clone(),
            stage_index,
            meta: envelope.meta().clone(),
            error: failure.to_string(),
            trace: failure.history.clone(),
            timestamp: Utc::now(),
            payload_summary: envelope.summary(),
        }
    }
}

impl DeadLetterRecord {
    /// Rebuild the failed envelope around `payload` for a replay.
    ///
    /// Metadata, including the attempt count at the failing stage, is
    /// restored, so the replay only gets the attempts that stage has left.
    pub fn into_envelope(self, payload: Payload) -> Envelope {
        Envelope::resume(self.envelope_id, payload, self.meta)
    }
}

/// Destination for items that exhausted their retries.
pub trait DeadLetterSink: Send + Sync {
    /// Persist a record. Must never overwrite an existing one.
    fn write(&self, record: &DeadLetterRecord) -> Result<(), PersistenceError>;

    /// Build and persist a record for `envelope`.
    ///
    /// Returns the new record id, or `None` if persisting failed; the
    /// failure is logged here and never reaches the caller.
    fn record(
        &self,
        envelope: &Envelope,
        stage_index: usize,
        failure: &RetryExhausted,
    ) -> Option<Uuid> {
        let record = DeadLetterRecord::new(envelope, stage_index, failure);
        match self.write(&record) {
            Ok(()) => {
                tracing::error!(
                    "Dead-lettered {} at stage '{}' after {} attempt(s): {} (record {})",
                    envelope.id().short(12),
                    failure.stage,
                    failure.attempts,
                    failure.last,
                    record.record_id
                );
                Some(record.record_id)
            }
            Err(e) => {
                tracing::error!(
                    "Failed to write dead letter for {} at stage '{}': {}",
                    envelope.id().short(12),
                    failure.stage,
                    e
                );
                None
            }
        }
    }
}

/// Writes one pretty-printed JSON file per record into a directory.
pub struct DirectoryDeadLetterSink {
    dir: PathBuf,
}

impl DirectoryDeadLetterSink {
    /// Use `dir` for records, creating it if needed.
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, PersistenceError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir).map_err(|e| PersistenceError::io(&dir, e))?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// `{timestamp}-{id prefix}-{record id}.json`. Ids are free-form, so
    /// the prefix keeps only ASCII alphanumerics, `-` and `_`.
    fn file_name(record: &DeadLetterRecord) -> String {
        let prefix: String = record
            .envelope_id
            .short(12)
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        format!(
            "{}-{}-{}.json",
            record.timestamp.format("%Y%m%dT%H%M%S%.3fZ"),
            prefix,
            record.record_id.simple()
        )
    }

    /// Load every record in the directory, oldest first.
    ///
    /// Unreadable files are skipped with a warning.
    pub fn list(&self) -> Result<Vec<DeadLetterRecord>, PersistenceError> {
        let mut records = Vec::new();
        let entries = std::fs::read_dir(&self.dir).map_err(|e| PersistenceError::io(&self.dir, e))?;

        for entry in entries.filter_map(|e| e.ok()) {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match Self::read(&path) {
                Ok(record) => records.push(record),
                Err(e) => tracing::warn!("Skipping unreadable dead letter {:?}: {}", path, e),
            }
        }

        records.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
        Ok(records)
    }

    /// Load the record with the given id.
    pub fn find(&self, record_id: Uuid) -> Result<DeadLetterRecord, PersistenceError> {
        let suffix = format!("-{}.json", record_id.simple());
        let entries = std::fs::read_dir(&self.dir).map_err(|e| PersistenceError::io(&self.dir, e))?;
        for entry in entries.filter_map(|e| e.ok()) {
            let name = entry.file_name();
            if name.to_string_lossy().ends_with(&suffix) {
                return Self::read(&entry.path());
            }
        }
        Err(PersistenceError::NotFound(record_id.to_string()))
    }

    fn read(path: &Path) -> Result<DeadLetterRecord, PersistenceError> {
        let content = std::fs::read_to_string(path).map_err(|e| PersistenceError::io(path, e))?;
        Ok(serde_json::from_str(&content)?)
    }
}

impl DeadLetterSink for DirectoryDeadLetterSink {
    fn write(&self, record: &DeadLetterRecord) -> Result<(), PersistenceError> {
        let path = self.dir.join(Self::file_name(record));
        let json = serde_json::to_string_pretty(record)?;

        // create_new: an existing record is never replaced
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .map_err(|e| PersistenceError::io(&path, e))?;
        file.write_all(json.as_bytes())
            .and_then(|()| file.write_all(b"\n"))
            .map_err(|e| PersistenceError::io(&path, e))?;
        Ok(())
    }
}

/// Keeps records in memory. Useful in tests and embedding scenarios.
#[derive(Debug, Default)]
pub struct MemoryDeadLetterSink {
    records: Mutex<Vec<DeadLetterRecord>>,
}

impl MemoryDeadLetterSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of everything recorded so far.
    pub fn records(&self) -> Vec<DeadLetterRecord> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn len(&self) -> usize {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl DeadLetterSink for MemoryDeadLetterSink {
    fn write(&self, record: &DeadLetterRecord) -> Result<(), PersistenceError> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(record.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransformError;

    fn failure(stage: &str) -> RetryExhausted {
        RetryExhausted {
            stage: stage.to_string(),
            attempts: 2,
            last: TransformError::failed("cannot read image"),
            history: vec!["cannot read image".into(), "cannot read image".into()],
        }
    }

    #[test]
    fn test_record_snapshot_excludes_payload_bytes() {
        let env = Envelope::new("abc", Payload::Bytes(vec![0xde, 0xad, 0xbe, 0xef]));
        let record = DeadLetterRecord::new(&env, 1, &failure("load"));

        assert_eq!(record.envelope_id.as_str(), "abc");
        assert_eq!(record.stage, "load");
        assert_eq!(record.stage_index, 1);
        assert_eq!(record.trace.len(), 2);
        assert_eq!(record.payload_summary, "bytes len=4");

        let json = serde_json::to_string(&record).unwrap();
        assert!(!json.contains("\"payload\""));
    }

    #[test]
    fn test_directory_sink_writes_one_file_per_record() {
        let dir = tempfile::tempdir().unwrap();
        let sink = DirectoryDeadLetterSink::new(dir.path().join("dlq")).unwrap();
        let env = Envelope::from_path("/in/a.png");

        let first = sink.record(&env, 0, &failure("load")).unwrap();
        let second = sink.record(&env, 0, &failure("load")).unwrap();
        assert_ne!(first, second);

        let files = std::fs::read_dir(sink.dir()).unwrap().count();
        assert_eq!(files, 2);

        let records = sink.list().unwrap();
        assert_eq!(records.len(), 2);
        assert!(records.iter().all(|r| r.meta.file_name() == Some("a.png")));
    }

    #[test]
    fn test_ids_with_path_separators_are_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let sink = DirectoryDeadLetterSink::new(dir.path().join("dlq")).unwrap();

        for id in ["jobs/42", "../escape", "a\\b:c"] {
            let env = Envelope::new(id, Payload::Empty);
            assert!(sink.record(&env, 0, &failure("load")).is_some(), "{id}");
        }

        let records = sink.list().unwrap();
        assert_eq!(records.len(), 3);
        assert!(records.iter().any(|r| r.envelope_id.as_str() == "jobs/42"));
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn test_into_envelope_restores_identity_and_attempts() {
        let mut env = Envelope::new("jobs/7", Payload::Text("x".into())).with_attempts(1, 3);
        env.labels_mut().insert("tenant".into(), "acme".into());
        let record = DeadLetterRecord::new(&env, 1, &failure("resize"));

        let replay = record.into_envelope(Payload::Text("x".into()));
        assert_eq!(replay.id().as_str(), "jobs/7");
        assert_eq!(replay.meta().attempts(), 3);
        assert_eq!(replay.meta().attempt_stage(), Some(1));
        assert_eq!(replay.meta().labels.get("tenant").map(String::as_str), Some("acme"));
    }

    #[test]
    fn test_directory_sink_never_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        let sink = DirectoryDeadLetterSink::new(dir.path()).unwrap();
        let env = Envelope::new("x", Payload::Empty);
        let record = DeadLetterRecord::new(&env, 0, &failure("s"));

        sink.write(&record).unwrap();
        assert!(sink.write(&record).is_err());
    }

    #[test]
    fn test_find_by_record_id() {
        let dir = tempfile::tempdir().unwrap();
        let sink = DirectoryDeadLetterSink::new(dir.path()).unwrap();
        let env = Envelope::new("x", Payload::Text("hello".into()));
        let id = sink.record(&env, 3, &failure("flip")).unwrap();

        let found = sink.find(id).unwrap();
        assert_eq!(found.stage_index, 3);
        assert_eq!(found.error, failure("flip").to_string());
        assert!(matches!(
            sink.find(Uuid::new_v4()),
            Err(PersistenceError::NotFound(_))
        ));
    }

    #[test]
    fn test_record_swallows_write_errors() {
        struct Broken;
        impl DeadLetterSink for Broken {
            fn write(&self, _: &DeadLetterRecord) -> Result<(), PersistenceError> {
                Err(PersistenceError::NotFound("disk".into()))
            }
        }

        let env = Envelope::new("x", Payload::Empty);
        assert!(Broken.record(&env, 0, &failure("s")).is_none());
    }

    #[test]
    fn test_memory_sink() {
        let sink = MemoryDeadLetterSink::new();
        let env = Envelope::new("x", Payload::Empty);
        sink.record(&env, 0, &failure("s"));
        assert_eq!(sink.len(), 1);
        assert_eq!(sink.records()[0].envelope_id.as_str(), "x");
    }
}
