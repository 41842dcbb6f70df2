// 💾 Checkpoint Store - durable, resumable run progress
//
// NOT_STARTED → IN_PROGRESS → FILE_COMPLETE → COMPLETE, with IN_PROGRESS
// re-entered for every file. All mutation goes through one store object that
// holds the state behind a mutex and persists it after every change. Writes
// go to a temp file in the same directory and are renamed into place, under
// an advisory lock file shared with other processes.

use crate::error::{ConsolidationError, Result};
use crate::period::Period;
use chrono::{DateTime, Utc};
use fd_lock::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

/// History entries kept in the checkpoint file
pub const HISTORY_LIMIT: usize = 50;

/// Read attempts before a corrupt checkpoint is reported
pub const MAX_LOAD_ATTEMPTS: u32 = 3;

// ============================================================================
// STATE
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CheckpointStatus {
    #[default]
    NotStarted,
    InProgress,
    FileComplete,
    Complete,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub timestamp: DateTime<Utc>,
    pub event: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    pub offset: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointState {
    pub current_file: Option<String>,
    pub current_offset: usize,
    pub status: CheckpointStatus,
    pub processed: usize,
    pub errors: usize,
    pub completed_periods: BTreeSet<Period>,
    #[serde(default)]
    pub completed_files: BTreeSet<String>,
    #[serde(default)]
    pub history: Vec<HistoryEntry>,
    #[serde(default)]
    pub run_id: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl Default for CheckpointState {
    fn default() -> Self {
        CheckpointState {
            current_file: None,
            current_offset: 0,
            status: CheckpointStatus::NotStarted,
            processed: 0,
            errors: 0,
            completed_periods: BTreeSet::new(),
            completed_files: BTreeSet::new(),
            history: Vec::new(),
            run_id: None,
            updated_at: Utc::now(),
        }
    }
}

impl CheckpointState {
    fn log(&mut self, event: &str, file: Option<&str>, offset: usize) {
        self.updated_at = Utc::now();
        self.history.push(HistoryEntry {
            timestamp: self.updated_at,
            event: event.to_string(),
            file: file.map(str::to_string),
            offset,
        });
        if self.history.len() > HISTORY_LIMIT {
            let excess = self.history.len() - HISTORY_LIMIT;
            self.history.drain(..excess);
        }
    }
}

/// Final counts recorded when a run completes
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct RunTotals {
    pub processed: usize,
    pub errors: usize,
}

/// Where a save landed. Saving never fails the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveOutcome {
    Primary,
    Fallback,
    Lost,
}

// ============================================================================
// STORE
// ============================================================================

pub struct CheckpointStore {
    path: PathBuf,
    fallback_path: PathBuf,
    state: Mutex<CheckpointState>,
}

impl CheckpointStore {
    pub fn new(path: impl Into<PathBuf>, fallback_path: impl Into<PathBuf>) -> Self {
        CheckpointStore {
            path: path.into(),
            fallback_path: fallback_path.into(),
            state: Mutex::new(CheckpointState::default()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn guard(&self) -> MutexGuard<'_, CheckpointState> {
        // A panic in another holder leaves the state itself intact
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Copy of the current in-memory state
    pub fn snapshot(&self) -> CheckpointState {
        self.guard().clone()
    }

    // ------------------------------------------------------------------------
    // load
    // ------------------------------------------------------------------------

    /// Read persisted state into memory.
    ///
    /// A malformed file is discarded and reinitialized to NOT_STARTED, then
    /// read again. After MAX_LOAD_ATTEMPTS the error is returned and the
    /// store keeps a fresh state, so the caller can log and carry on.
    pub fn load(&self) -> Result<CheckpointState> {
        let source = if !self.path.exists() && self.fallback_path.exists() {
            info!(path = %self.fallback_path.display(), "Primary checkpoint missing, reading fallback");
            self.fallback_path.clone()
        } else {
            self.path.clone()
        };

        let mut last_reason = String::new();
        for attempt in 1..=MAX_LOAD_ATTEMPTS {
            match read_state(&source) {
                Ok(Some(state)) => {
                    debug!(status = ?state.status, offset = state.current_offset, "Checkpoint loaded");
                    *self.guard() = state.clone();
                    return Ok(state);
                }
                Ok(None) => {
                    let state = CheckpointState::default();
                    *self.guard() = state.clone();
                    return Ok(state);
                }
                Err(reason) => {
                    warn!(
                        path = %source.display(),
                        attempt,
                        "Corrupt checkpoint discarded: {}",
                        reason
                    );
                    last_reason = reason;
                    let _ = fs::remove_file(&source);
                    let fresh = serde_json::to_vec_pretty(&CheckpointState::default())?;
                    if let Err(e) = write_atomic(&source, &fresh) {
                        warn!(path = %source.display(), "Could not reinitialize checkpoint: {}", e);
                    }
                }
            }
        }

        *self.guard() = CheckpointState::default();
        Err(ConsolidationError::CheckpointCorruption {
            path: source.display().to_string(),
            attempts: MAX_LOAD_ATTEMPTS,
            reason: last_reason,
        })
    }

    // ------------------------------------------------------------------------
    // save
    // ------------------------------------------------------------------------

    /// Persist the given state, primary location first then the fallback.
    pub fn save(&self, state: &CheckpointState) -> SaveOutcome {
        let bytes = match serde_json::to_vec_pretty(state) {
            Ok(b) => b,
            Err(e) => {
                warn!("Checkpoint serialization failed: {}", e);
                return SaveOutcome::Lost;
            }
        };

        match write_atomic(&self.path, &bytes) {
            Ok(()) => SaveOutcome::Primary,
            Err(primary_err) => {
                warn!(path = %self.path.display(), "Checkpoint write failed: {}", primary_err);
                match write_atomic(&self.fallback_path, &bytes) {
                    Ok(()) => {
                        warn!(path = %self.fallback_path.display(), "Checkpoint saved to fallback location");
                        SaveOutcome::Fallback
                    }
                    Err(fallback_err) => {
                        warn!("Checkpoint not persisted: {}", fallback_err);
                        SaveOutcome::Lost
                    }
                }
            }
        }
    }

    fn mutate<F>(&self, f: F) -> SaveOutcome
    where
        F: FnOnce(&mut CheckpointState),
    {
        let mut state = self.guard();
        f(&mut state);
        self.save(&state)
    }

    // ------------------------------------------------------------------------
    // transitions
    // ------------------------------------------------------------------------

    /// Record a confirmed batch. Only the batch loader calls this.
    pub fn advance(&self, file: &str, offset: usize, processed_delta: usize, error_delta: usize) -> SaveOutcome {
        self.mutate(|s| {
            s.status = CheckpointStatus::InProgress;
            s.current_file = Some(file.to_string());
            s.current_offset = offset;
            s.processed += processed_delta;
            s.errors += error_delta;
            s.log("batch", Some(file), offset);
        })
    }

    pub fn mark_file_complete(&self, file: &str) -> SaveOutcome {
        self.mutate(|s| {
            s.status = CheckpointStatus::FileComplete;
            s.current_file = Some(file.to_string());
            s.completed_files.insert(file.to_string());
            let offset = s.current_offset;
            s.log("file_complete", Some(file), offset);
        })
    }

    /// Returns false when the period was already recorded
    pub fn mark_period_processed(&self, period: Period) -> bool {
        let mut state = self.guard();
        if state.completed_periods.contains(&period) {
            return false;
        }
        state.completed_periods.insert(period);
        state.log(&format!("period_processed {}", period), None, 0);
        self.save(&state);
        true
    }

    pub fn mark_run_complete(&self, totals: RunTotals) -> SaveOutcome {
        self.mutate(|s| {
            s.status = CheckpointStatus::Complete;
            s.current_file = None;
            s.current_offset = 0;
            s.processed = totals.processed;
            s.errors = totals.errors;
            s.log("run_complete", None, 0);
        })
    }

    /// Clear everything before a full reprocessing pass
    pub fn reset(&self) -> SaveOutcome {
        info!(path = %self.path.display(), "Checkpoint reset");
        self.mutate(|s| {
            *s = CheckpointState::default();
            s.log("reset", None, 0);
        })
    }

    pub fn set_run_id(&self, run_id: &str) -> SaveOutcome {
        self.mutate(|s| s.run_id = Some(run_id.to_string()))
    }

    // ------------------------------------------------------------------------
    // queries
    // ------------------------------------------------------------------------

    /// Offset to resume `file` from; zero unless that file was interrupted
    pub fn resume_offset(&self, file: &str) -> usize {
        let s = self.guard();
        match (&s.status, &s.current_file) {
            (CheckpointStatus::InProgress, Some(current)) if current == file => s.current_offset,
            _ => 0,
        }
    }

    pub fn is_file_complete(&self, file: &str) -> bool {
        self.guard().completed_files.contains(file)
    }

    pub fn is_period_processed(&self, period: Period) -> bool {
        self.guard().completed_periods.contains(&period)
    }

    /// Human-readable progress summary for the `status` command
    pub fn status_report(&self) -> String {
        let s = self.guard();
        let periods: Vec<String> = s.completed_periods.iter().map(|p| p.marker()).collect();
        let mut out = String::new();
        out.push_str(&format!("Status:            {:?}\n", s.status));
        out.push_str(&format!(
            "Current file:      {}\n",
            s.current_file.as_deref().unwrap_or("-")
        ));
        out.push_str(&format!("Current offset:    {}\n", s.current_offset));
        out.push_str(&format!("Processed records: {}\n", s.processed));
        out.push_str(&format!("Errors:            {}\n", s.errors));
        out.push_str(&format!("Completed periods: {}\n", periods.join(", ")));
        out.push_str(&format!("Completed files:   {}\n", s.completed_files.len()));
        out.push_str(&format!("Last update:       {}\n", s.updated_at.to_rfc3339()));
        if let Some(last) = s.history.last() {
            out.push_str(&format!("Last event:        {} ({})\n", last.event, last.timestamp.to_rfc3339()));
        }
        out
    }
}

// ============================================================================
// FILE IO
// ============================================================================

/// Ok(None) when no file exists, Err(reason) when it cannot be used
fn read_state(path: &Path) -> std::result::Result<Option<CheckpointState>, String> {
    let bytes = match fs::read(path) {
        Ok(b) => b,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.to_string()),
    };
    serde_json::from_slice(&bytes)
        .map(Some)
        .map_err(|e| e.to_string())
}

fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&dir)?;

    let lock_file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path.with_extension("lock"))?;
    let mut lock = RwLock::new(lock_file);
    let _held = lock.write()?;

    let mut tmp = NamedTempFile::new_in(&dir)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}
