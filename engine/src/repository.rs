//! Persistence seam for file snapshots and run records.
//!
//! The engine only talks to [`BackupRepository`]. Two implementations ship
//! with the crate: [`MemoryRepository`] for tests and embedding, and
//! [`JsonFileRepository`], which keeps the same state in a single JSON file
//! rewritten after every change.

use crate::error::{EngineError, Result};
use crate::model::{BackupRun, BackupRunEntry, FileSnapshot, PairId, ProfileId};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

/// Storage for snapshots and runs.
///
/// Implementations are shared between concurrent runs of different profiles,
/// hence `Send + Sync` and `&self` methods.
pub trait BackupRepository: Send + Sync {
    /// Current snapshot set of one pair (empty if never backed up).
    fn load_snapshots(&self, profile_id: ProfileId, pair_id: PairId) -> Result<Vec<FileSnapshot>>;

    /// Replace the snapshot set of one pair.
    fn save_snapshots(&self, profile_id: ProfileId, pair_id: PairId, snapshots: &[FileSnapshot]) -> Result<()>;

    /// Record a new run in `Running` state.
    fn create_run(&self, run: &BackupRun) -> Result<()>;

    /// Append entries to a created run.
    fn append_entries(&self, run_id: Uuid, entries: &[BackupRunEntry]) -> Result<()>;

    /// Store the final counters, status and timestamps of a run.
    fn finalize_run(&self, run: &BackupRun) -> Result<()>;

    /// Most recent runs first, optionally for one profile.
    fn recent_runs(&self, profile_id: Option<ProfileId>, limit: usize) -> Result<Vec<BackupRun>>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SnapshotSet {
    profile_id: ProfileId,
    pair_id: PairId,
    files: Vec<FileSnapshot>,
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
struct StoreState {
    #[serde(default)]
    snapshots: Vec<SnapshotSet>,
    #[serde(default)]
    runs: Vec<BackupRun>,
}

impl StoreState {
    fn load_snapshots(&self, profile_id: ProfileId, pair_id: PairId) -> Vec<FileSnapshot> {
        self.snapshots
            .iter()
            .find(|s| s.profile_id == profile_id && s.pair_id == pair_id)
            .map(|s| s.files.clone())
            .unwrap_or_default()
    }

    fn save_snapshots(&mut self, profile_id: ProfileId, pair_id: PairId, files: &[FileSnapshot]) {
        match self
            .snapshots
            .iter_mut()
            .find(|s| s.profile_id == profile_id && s.pair_id == pair_id)
        {
            Some(set) => set.files = files.to_vec(),
            None => self.snapshots.push(SnapshotSet {
                profile_id,
                pair_id,
                files: files.to_vec(),
            }),
        }
    }

    fn create_run(&mut self, run: &BackupRun) -> Result<()> {
        if self.runs.iter().any(|r| r.id == run.id) {
            return Err(EngineError::Repository(format!("run {} already exists", run.id)));
        }
        let mut stored = run.clone();
        stored.entries.clear();
        self.runs.push(stored);
        Ok(())
    }

    fn run_mut(&mut self, run_id: Uuid) -> Result<&mut BackupRun> {
        self.runs
            .iter_mut()
            .find(|r| r.id == run_id)
            .ok_or_else(|| EngineError::Repository(format!("unknown run {}", run_id)))
    }

    fn append_entries(&mut self, run_id: Uuid, entries: &[BackupRunEntry]) -> Result<()> {
        self.run_mut(run_id)?.entries.extend_from_slice(entries);
        Ok(())
    }

    fn finalize_run(&mut self, run: &BackupRun) -> Result<()> {
        let stored = self.run_mut(run.id)?;
        if stored.status.is_terminal() {
            return Err(EngineError::Repository(format!("run {} already finalized", run.id)));
        }
        let entries = std::mem::take(&mut stored.entries);
        *stored = BackupRun {
            entries,
            ..run.clone()
        };
        Ok(())
    }

    fn recent_runs(&self, profile_id: Option<ProfileId>, limit: usize) -> Vec<BackupRun> {
        let mut runs: Vec<BackupRun> = self
            .runs
            .iter()
            .filter(|r| profile_id.map_or(true, |id| r.profile_id == id))
            .cloned()
            .collect();
        runs.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        runs.truncate(limit);
        runs
    }
}

fn lock(state: &Mutex<StoreState>) -> Result<MutexGuard<'_, StoreState>> {
    state
        .lock()
        .map_err(|_| EngineError::Repository("store lock poisoned".to_string()))
}

/// Repository holding everything in memory.
#[derive(Debug, Default)]
pub struct MemoryRepository {
    state: Mutex<StoreState>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

impl BackupRepository for MemoryRepository {
    fn load_snapshots(&self, profile_id: ProfileId, pair_id: PairId) -> Result<Vec<FileSnapshot>> {
        Ok(lock(&self.state)?.load_snapshots(profile_id, pair_id))
    }

    fn save_snapshots(&self, profile_id: ProfileId, pair_id: PairId, snapshots: &[FileSnapshot]) -> Result<()> {
        lock(&self.state)?.save_snapshots(profile_id, pair_id, snapshots);
        Ok(())
    }

    fn create_run(&self, run: &BackupRun) -> Result<()> {
        lock(&self.state)?.create_run(run)
    }

    fn append_entries(&self, run_id: Uuid, entries: &[BackupRunEntry]) -> Result<()> {
        lock(&self.state)?.append_entries(run_id, entries)
    }

    fn finalize_run(&self, run: &BackupRun) -> Result<()> {
        lock(&self.state)?.finalize_run(run)
    }

    fn recent_runs(&self, profile_id: Option<ProfileId>, limit: usize) -> Result<Vec<BackupRun>> {
        Ok(lock(&self.state)?.recent_runs(profile_id, limit))
    }
}

/// Repository persisted to one JSON file.
///
/// The file is rewritten (via a temporary sibling and a rename) after every
/// mutation, so a crash leaves either the old or the new state on disk.
#[derive(Debug)]
pub struct JsonFileRepository {
    path: PathBuf,
    state: Mutex<StoreState>,
}

impl JsonFileRepository {
    /// Open the store at `path`, starting empty if the file does not exist.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let state = match fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => StoreState::default(),
            Err(e) => {
                return Err(EngineError::Repository(format!(
                    "cannot read {}: {}",
                    path.display(),
                    e
                )))
            }
        };
        Ok(JsonFileRepository {
            path,
            state: Mutex::new(state),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn mutate<T>(&self, f: impl FnOnce(&mut StoreState) -> Result<T>) -> Result<T> {
        let mut state = lock(&self.state)?;
        let mut next = state.clone();
        let value = f(&mut next)?;
        self.write(&next)?;
        *state = next;
        Ok(value)
    }

    fn write(&self, state: &StoreState) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(state)?;
        let store_error = |e: std::io::Error| {
            EngineError::Repository(format!("cannot write {}: {}", self.path.display(), e))
        };
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(store_error)?;
        }
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, bytes).map_err(store_error)?;
        fs::rename(&tmp, &self.path).map_err(store_error)?;
        Ok(())
    }
}

impl BackupRepository for JsonFileRepository {
    fn load_snapshots(&self, profile_id: ProfileId, pair_id: PairId) -> Result<Vec<FileSnapshot>> {
        Ok(lock(&self.state)?.load_snapshots(profile_id, pair_id))
    }

    fn save_snapshots(&self, profile_id: ProfileId, pair_id: PairId, snapshots: &[FileSnapshot]) -> Result<()> {
        self.mutate(|s| {
            s.save_snapshots(profile_id, pair_id, snapshots);
            Ok(())
        })
    }

    fn create_run(&self, run: &BackupRun) -> Result<()> {
        self.mutate(|s| s.create_run(run))
    }

    fn append_entries(&self, run_id: Uuid, entries: &[BackupRunEntry]) -> Result<()> {
        self.mutate(|s| s.append_entries(run_id, entries))
    }

    fn finalize_run(&self, run: &BackupRun) -> Result<()> {
        self.mutate(|s| s.finalize_run(run))
    }

    fn recent_runs(&self, profile_id: Option<ProfileId>, limit: usize) -> Result<Vec<BackupRun>> {
        Ok(lock(&self.state)?.recent_runs(profile_id, limit))
    }
}
