//! Checkpoint for resumable ingestion
//!
//! `IngestProgress` is the durable state of one run. It is saved after the
//! schema is ensured, after splitting, after every committed batch and at the
//! terminal state. Batch commits only ever move forward.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{IngestEvent, RunStatus};
use crate::error::CheckpointError;

/// Identity of a run: the same file into the same table.
///
/// A redelivered copy of an event maps to the same key.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunKey(String);

impl RunKey {
    pub fn new(table_name: &str, file_name: &str) -> Self {
        Self(format!("{}/{}", table_name, file_name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Injective, filesystem-safe encoding of the key.
    pub fn file_stem(&self) -> String {
        let mut out = String::with_capacity(self.0.len());
        for byte in self.0.bytes() {
            if byte.is_ascii_alphanumeric() || byte == b'-' || byte == b'_' {
                out.push(byte as char);
            } else {
                out.push_str(&format!("~{:02x}", byte));
            }
        }
        out
    }
}

impl From<&str> for RunKey {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for RunKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Durable progress of one ingestion run.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct IngestProgress {
    pub run_key: RunKey,
    pub file_name: String,
    pub table_name: String,
    /// Batch size the boundaries were computed with.
    pub batch_size: usize,
    pub schema_ensured: bool,
    pub total_batches: Option<usize>,
    /// Last batch whose sub-batches all succeeded.
    pub last_committed: Option<usize>,
    pub rows_written: u64,
    pub status: RunStatus,
    pub updated_at: DateTime<Utc>,
}

impl IngestProgress {
    pub fn new(event: &IngestEvent, batch_size: usize) -> Self {
        Self {
            run_key: event.run_key(),
            file_name: event.file_name.clone(),
            table_name: event.table_name.clone(),
            batch_size,
            schema_ensured: false,
            total_batches: None,
            last_committed: None,
            rows_written: 0,
            status: RunStatus::Received,
            updated_at: Utc::now(),
        }
    }

    /// Index of the first batch not yet committed.
    pub fn next_batch(&self) -> usize {
        self.last_committed.map_or(0, |i| i + 1)
    }

    /// Record batch `index` as committed. Only the next batch in order can be
    /// committed; anything else leaves the progress untouched.
    pub fn record_commit(&mut self, index: usize, rows: u64) -> bool {
        if index != self.next_batch() {
            return false;
        }
        self.last_committed = Some(index);
        self.rows_written += rows;
        self.status = RunStatus::BatchCommitted { batch: index };
        self.updated_at = Utc::now();
        true
    }

    pub fn set_status(&mut self, status: RunStatus) {
        self.status = status;
        self.updated_at = Utc::now();
    }
}

/// Persistence of run progress.
///
/// Implementations:
/// - MemoryCheckpointStore: process-local, for dry runs and tests
/// - FileCheckpointStore: one JSON document per run in a directory
/// - PgCheckpointStore: a table in the destination database
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn load(&self, run_key: &RunKey) -> Result<Option<IngestProgress>, CheckpointError>;

    async fn save(&self, progress: &IngestProgress) -> Result<(), CheckpointError>;

    async fn list(&self) -> Result<Vec<IngestProgress>, CheckpointError>;
}

/// Checkpoints kept in process memory.
#[derive(Debug, Default)]
pub struct MemoryCheckpointStore {
    entries: Mutex<HashMap<RunKey, IngestProgress>>,
    saves: AtomicUsize,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of `save` calls so far.
    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }

    fn lock_entries(&self) -> std::sync::MutexGuard<'_, HashMap<RunKey, IngestProgress>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn load(&self, run_key: &RunKey) -> Result<Option<IngestProgress>, CheckpointError> {
        Ok(self.lock_entries().get(run_key).cloned())
    }

    async fn save(&self, progress: &IngestProgress) -> Result<(), CheckpointError> {
        self.saves.fetch_add(1, Ordering::SeqCst);
        self.lock_entries()
            .insert(progress.run_key.clone(), progress.clone());
        Ok(())
    }

    async fn list(&self) -> Result<Vec<IngestProgress>, CheckpointError> {
        let mut all: Vec<_> = self.lock_entries().values().cloned().collect();
        all.sort_by(|a, b| a.run_key.cmp(&b.run_key));
        Ok(all)
    }
}

/// Checkpoints stored as JSON files, one per run.
///
/// Writes go to a temporary file that is renamed over the previous
/// checkpoint, so a crash never leaves a half-written document behind.
#[derive(Debug, Clone)]
pub struct FileCheckpointStore {
    dir: PathBuf,
}

impl FileCheckpointStore {
    pub async fn open(dir: impl AsRef<Path>) -> Result<Self, CheckpointError> {
        let dir = dir.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Self { dir })
    }

    fn path_for(&self, run_key: &RunKey) -> PathBuf {
        self.dir.join(format!("{}.json", run_key.file_stem()))
    }
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn load(&self, run_key: &RunKey) -> Result<Option<IngestProgress>, CheckpointError> {
        let path = self.path_for(run_key);
        match tokio::fs::read_to_string(&path).await {
            Ok(content) => Ok(Some(serde_json::from_str(&content)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn save(&self, progress: &IngestProgress) -> Result<(), CheckpointError> {
        let path = self.path_for(&progress.run_key);
        let tmp = path.with_extension("json.tmp");
        let content = serde_json::to_string_pretty(progress)?;

        tokio::fs::write(&tmp, content).await?;
        tokio::fs::rename(&tmp, &path).await?;
        debug!(run_key = %progress.run_key, path = %path.display(), "Checkpoint saved");
        Ok(())
    }

    async fn list(&self) -> Result<Vec<IngestProgress>, CheckpointError> {
        let mut all = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let content = tokio::fs::read_to_string(&path).await?;
            all.push(serde_json::from_str::<IngestProgress>(&content)?);
        }
        all.sort_by(|a, b| a.run_key.cmp(&b.run_key));
        Ok(all)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingestion::RowSource;

    fn event() -> IngestEvent {
        IngestEvent {
            file_name: "Batting.csv".to_string(),
            table_name: "batting_csv".to_string(),
            header: vec!["playerid".to_string()],
            description: None,
            rows: RowSource::Remote("file:///tmp/Batting.csv".to_string()),
        }
    }

    #[test]
    fn test_run_key_file_stem_is_filesystem_safe() {
        let key = RunKey::new("batting_csv", "Batting.csv");
        assert_eq!(key.as_str(), "batting_csv/Batting.csv");
        assert_eq!(key.file_stem(), "batting_csv~2fBatting~2ecsv");
        assert_ne!(
            RunKey::new("a_b", "c").file_stem(),
            RunKey::new("a.b", "c").file_stem()
        );
    }

    #[test]
    fn test_commits_only_advance_in_order() {
        let mut progress = IngestProgress::new(&event(), 1000);
        assert_eq!(progress.next_batch(), 0);

        assert!(!progress.record_commit(1, 10));
        assert!(progress.record_commit(0, 1000));
        assert!(progress.record_commit(1, 500));
        assert!(!progress.record_commit(1, 500));

        assert_eq!(progress.last_committed, Some(1));
        assert_eq!(progress.rows_written, 1500);
        assert_eq!(progress.next_batch(), 2);
    }

    #[tokio::test]
    async fn test_file_store_round_trip_and_list() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = FileCheckpointStore::open(dir.path()).await.unwrap();

        let mut progress = IngestProgress::new(&event(), 1000);
        assert!(store.load(&progress.run_key).await.unwrap().is_none());

        progress.record_commit(0, 1000);
        store.save(&progress).await.unwrap();

        let loaded = store.load(&progress.run_key).await.unwrap().unwrap();
        assert_eq!(loaded, progress);
        assert_eq!(store.list().await.unwrap().len(), 1);

        // No temporary file is left next to the checkpoint.
        let leftovers = std::fs::read_dir(dir.path())
            .unwrap()
            .filter(|e| {
                e.as_ref()
                    .unwrap()
                    .path()
                    .to_string_lossy()
                    .ends_with(".tmp")
            })
            .count();
        assert_eq!(leftovers, 0);
    }
}
