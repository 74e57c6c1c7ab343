//! Run record persistence.
//!
//! All records live in one JSON document (`experiments.json`) inside the
//! configured store directory, keyed by run id. The document is loaded once
//! by [`RunStore::init`] and rewritten in full by every [`RunStore::save_run`].
//!
//! Cross-process exclusion is advisory and best-effort: a writer creates
//! `experiments.json.lock` exclusively. If the lock already exists it waits
//! [`LOCK_RETRY_DELAY`] and writes once anyway, without re-acquiring. The
//! lock file is removed after every write attempt, including ones that did
//! not create it. Two writers that both outlast the retry window can still
//! interleave; the last rename wins. Each write goes through its own
//! uniquely named temp file, so interleaved writers never tear the document.
//!
//! [`RunStore::save_run`] blocks the calling thread during the retry delay.
//! Async callers use [`RunStore::save_run_async`], which waits on the tokio
//! timer instead.

use std::{
    collections::BTreeMap,
    fs::{self, OpenOptions},
    io::{self, BufWriter, Write},
    path::{Path, PathBuf},
    time::Duration,
};

use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;

const DOCUMENT_NAME: &str = "experiments.json";

/// Delay before the single unlocked retry on lock contention.
pub const LOCK_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Status of a run. Only `Running` is non-terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
    /// Stopped by the timebox.
    Timeboxed,
    /// Stopped by a caller.
    Stopped,
}

impl RunStatus {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Running)
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Timeboxed => "timeboxed",
            Self::Stopped => "stopped",
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Persisted state of one logical training run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunRecord {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub script_path: String,
    pub status: RunStatus,
    /// Epoch milliseconds.
    pub start_time: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_step: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_loss: Option<f64>,
    /// Append-only, oldest first. The last entry is the resume point.
    #[serde(default)]
    pub checkpoints: Vec<String>,
    /// Single-checkpoint field from older documents.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_checkpoint: Option<String>,
}

impl RunRecord {
    /// A fresh record in `Running` state, started now.
    #[must_use]
    pub fn new(id: impl Into<String>, name: Option<String>, script_path: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name,
            script_path: script_path.into(),
            status: RunStatus::Running,
            start_time: now_millis(),
            end_time: None,
            last_step: None,
            last_loss: None,
            checkpoints: Vec::new(),
            last_checkpoint: None,
        }
    }

    /// Re-enter `Running` for a new attempt of an existing run. Checkpoints
    /// and progress are kept so the attempt can resume.
    pub fn begin_attempt(&mut self) {
        self.status = RunStatus::Running;
        self.start_time = now_millis();
        self.end_time = None;
    }

    pub fn append_checkpoint(&mut self, path: impl Into<String>) {
        self.checkpoints.push(path.into());
    }

    /// Last appended checkpoint, falling back to the legacy field.
    #[must_use]
    pub fn latest_checkpoint(&self) -> Option<&str> {
        self.checkpoints
            .last()
            .or(self.last_checkpoint.as_ref())
            .map(String::as_str)
    }

    /// Move to a terminal status and stamp the end time.
    pub fn finish(&mut self, status: RunStatus) {
        debug_assert!(status.is_terminal());
        self.status = status;
        self.end_time = Some(now_millis());
    }

    /// Wall-clock duration of the latest attempt, if it has ended.
    #[must_use]
    pub fn duration_ms(&self) -> Option<i64> {
        self.end_time.map(|end| end - self.start_time)
    }
}

/// File-backed map from run id to [`RunRecord`].
///
/// Not designed for concurrent callers within one process; the owner
/// serializes access.
#[derive(Debug)]
pub struct RunStore {
    dir: PathBuf,
    runs: BTreeMap<String, RunRecord>,
}

impl RunStore {
    /// Store rooted at `dir`. Nothing is read until [`init`](Self::init).
    #[must_use]
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
            runs: BTreeMap::new(),
        }
    }

    /// Path of the JSON document.
    #[must_use]
    pub fn path(&self) -> PathBuf {
        self.dir.join(DOCUMENT_NAME)
    }

    fn lock_path(&self) -> PathBuf {
        self.dir.join(format!("{DOCUMENT_NAME}.lock"))
    }

    /// Load the document.
    ///
    /// A missing document is a first run. A corrupt one is logged and
    /// replaced by an empty store on the next save. Other read errors are
    /// returned.
    pub fn init(&mut self) -> Result<(), StoreError> {
        let path = self.path();
        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "no run store yet, starting empty");
                self.runs.clear();
                return Ok(());
            }
            Err(e) => return Err(StoreError::Io(path, e)),
        };

        self.runs = match serde_json::from_str(&content) {
            Ok(runs) => runs,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "run store is corrupt, starting empty");
                BTreeMap::new()
            }
        };
        Ok(())
    }

    /// Insert or overwrite `record` and flush the whole document.
    ///
    /// On lock contention this sleeps the current thread for
    /// [`LOCK_RETRY_DELAY`]; prefer [`save_run_async`](Self::save_run_async)
    /// on a runtime.
    pub fn save_run(&mut self, record: &RunRecord) -> Result<(), StoreError> {
        self.runs.insert(record.id.clone(), record.clone());
        let lock = self.lock()?;
        if lock.contended {
            std::thread::sleep(LOCK_RETRY_DELAY);
        }
        self.write_document()
    }

    /// [`save_run`](Self::save_run) that yields to the runtime during the
    /// lock retry delay. The write itself is a short synchronous call.
    pub async fn save_run_async(&mut self, record: &RunRecord) -> Result<(), StoreError> {
        self.runs.insert(record.id.clone(), record.clone());
        let lock = self.lock()?;
        if lock.contended {
            tokio::time::sleep(LOCK_RETRY_DELAY).await;
        }
        self.write_document()
    }

    #[must_use]
    pub fn get_run(&self, id: &str) -> Option<&RunRecord> {
        self.runs.get(id)
    }

    #[must_use]
    pub fn get_latest_checkpoint(&self, id: &str) -> Option<&str> {
        self.runs.get(id)?.latest_checkpoint()
    }

    /// All records, most recently started first.
    #[must_use]
    pub fn list_experiments(&self) -> Vec<&RunRecord> {
        let mut runs: Vec<&RunRecord> = self.runs.values().collect();
        runs.sort_by(|a, b| b.start_time.cmp(&a.start_time));
        runs
    }

    /// Both records, or `None` if either id is unknown.
    #[must_use]
    pub fn compare(&self, a: &str, b: &str) -> Option<(&RunRecord, &RunRecord)> {
        Some((self.runs.get(a)?, self.runs.get(b)?))
    }

    /// Try to create the lock file. The returned guard removes it on drop
    /// whether or not this writer created it.
    fn lock(&self) -> Result<LockFile, StoreError> {
        fs::create_dir_all(&self.dir).map_err(|e| StoreError::Io(self.dir.clone(), e))?;

        let path = self.lock_path();
        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(_) => Ok(LockFile {
                path,
                contended: false,
            }),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                tracing::warn!(
                    lock = %path.display(),
                    "run store is locked, retrying once after {LOCK_RETRY_DELAY:?}"
                );
                Ok(LockFile {
                    path,
                    contended: true,
                })
            }
            Err(e) => Err(StoreError::Io(path, e)),
        }
    }

    /// Write to a fresh temp file in the store directory, then rename it over
    /// the document.
    fn write_document(&self) -> Result<(), StoreError> {
        let mut tmp =
            NamedTempFile::new_in(&self.dir).map_err(|e| StoreError::Io(self.dir.clone(), e))?;
        let tmp_path = tmp.path().to_path_buf();

        let mut writer = BufWriter::new(tmp.as_file_mut());
        serde_json::to_writer_pretty(&mut writer, &self.runs)
            .map_err(|e| StoreError::Serialize(tmp_path.clone(), e))?;
        writer
            .flush()
            .map_err(|e| StoreError::Io(tmp_path.clone(), e))?;
        drop(writer);

        let path = self.path();
        tmp.persist(&path)
            .map(|_| ())
            .map_err(|e| StoreError::Io(path, e.error))
    }
}

/// Removes the lock file when dropped, whoever created it.
struct LockFile {
    path: PathBuf,
    /// Another writer held the lock when this one arrived.
    contended: bool,
}

impl Drop for LockFile {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path)
            && e.kind() != io::ErrorKind::NotFound
        {
            tracing::warn!(lock = %self.path.display(), error = %e, "failed to remove run store lock");
        }
    }
}

/// Current time as epoch milliseconds.
#[must_use]
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Errors that can occur persisting run records.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("failed to read/write run store {0}: {1}")]
    Io(PathBuf, io::Error),
    #[error("failed to serialize run store {0}: {1}")]
    Serialize(PathBuf, serde_json::Error),
}
