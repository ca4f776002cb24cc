use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

// Result store abstractions.
//
// One JSON document on disk maps every RecordKey to the outcome of its most
// recent analysis attempt. Presence of a key — Success or Failed alike —
// marks the record reconciled; only an explicit force-refresh overwrites it.

/// Stable identifier for one source record within a feed snapshot.
pub type RecordKey = String;

/// Terminal outcome of a single analysis attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AnalysisOutcome {
    Success,
    Failed { reason: String },
}

impl AnalysisOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, AnalysisOutcome::Success)
    }
}

/// Persisted result of one analysis attempt. The vendor document is kept as
/// an opaque JSON value; its shape is not contractually guaranteed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisReport {
    pub key: RecordKey,
    #[serde(flatten)]
    pub outcome: AnalysisOutcome,
    pub document: Value,
    pub produced_at: DateTime<Utc>,
}

/// Errors emitted by the result store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("result store unavailable: {0}")]
    Unavailable(#[from] std::io::Error),

    #[error("result store at {path} is not valid JSON: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to serialize result store: {0}")]
    Serialize(#[source] serde_json::Error),
}

/// File-backed RecordKey → AnalysisReport store with read-after-write
/// consistency.
///
/// Write strategy:
/// - Serialize the full map, stream it into a temp file in the same
///   directory, then atomically persist over the live file. An interrupted
///   write leaves the prior fully-written version on disk.
/// - The in-memory map is updated only after the file write succeeds, so
///   `exists`/`get` observe a `put` exactly when it is durable.
#[derive(Debug)]
pub struct ReportStore {
    path: PathBuf,
    reports: RwLock<BTreeMap<RecordKey, AnalysisReport>>,
}

impl ReportStore {
    /// Open (or create) the store backed by `path`. A missing file yields an
    /// empty store; an unparseable file is surfaced as `Corrupt` rather than
    /// silently replaced.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        debug_assert!(!path.as_os_str().is_empty());

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }

        let reports = match std::fs::read(&path) {
            Ok(bytes) => {
                serde_json::from_slice(&bytes).map_err(|source| StoreError::Corrupt {
                    path: path.clone(),
                    source,
                })?
            }
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(error) => return Err(StoreError::Unavailable(error)),
        };

        Ok(Self {
            path,
            reports: RwLock::new(reports),
        })
    }

    /// Whether a terminal result is recorded for `key`. No side effects.
    pub fn exists(&self, key: &str) -> bool {
        self.read_guard().contains_key(key)
    }

    pub fn get(&self, key: &str) -> Option<AnalysisReport> {
        self.read_guard().get(key).cloned()
    }

    /// Upsert `report` under its key. Last write wins. The write is durable
    /// before this returns; a failure leaves both the file and the in-memory
    /// view at the prior state.
    pub fn put(&self, report: AnalysisReport) -> Result<(), StoreError> {
        debug_assert!(!report.key.is_empty());

        let mut guard = self.write_guard();
        let mut next = guard.clone();
        next.insert(report.key.clone(), report);
        self.write_snapshot(&next)?;
        *guard = next;
        Ok(())
    }

    /// Remove the report stored under `key`, durably. Returns whether a
    /// report was present.
    pub fn remove(&self, key: &str) -> Result<bool, StoreError> {
        let mut guard = self.write_guard();
        if !guard.contains_key(key) {
            return Ok(false);
        }
        let mut next = guard.clone();
        next.remove(key);
        self.write_snapshot(&next)?;
        *guard = next;
        Ok(true)
    }

    /// Snapshot of every stored report, consistent at call time.
    pub fn list_all(&self) -> BTreeMap<RecordKey, AnalysisReport> {
        self.read_guard().clone()
    }

    pub fn len(&self) -> usize {
        self.read_guard().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read_guard().is_empty()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write_snapshot(&self, snapshot: &BTreeMap<RecordKey, AnalysisReport>) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec_pretty(snapshot).map_err(StoreError::Serialize)?;

        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        let mut temp = tempfile::NamedTempFile::new_in(dir)?;
        temp.write_all(&bytes)?;
        temp.as_file().sync_all()?;
        temp.persist(&self.path).map_err(|error| StoreError::Unavailable(error.error))?;
        Ok(())
    }

    fn read_guard(&self) -> std::sync::RwLockReadGuard<'_, BTreeMap<RecordKey, AnalysisReport>> {
        self.reports.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write_guard(&self) -> std::sync::RwLockWriteGuard<'_, BTreeMap<RecordKey, AnalysisReport>> {
        self.reports.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
