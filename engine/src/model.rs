//! Core data model for backup profiles and runs.
//!
//! This module defines:
//! - BackupProfile / BackupPair: what to back up and how
//! - FileSnapshot: last known backed-up state of one file
//! - BackupRun / BackupRunEntry: the record of one execution
//! - DriveDescriptor: identity of an inserted destination drive

use crate::checksums::ChecksumAlgorithm;
use crate::glob;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use uuid::Uuid;

pub type ProfileId = i64;
pub type PairId = i64;

/// Policy for handling files that disappeared from the source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackupStrategy {
    /// Deletions are propagated to the destination
    #[default]
    Mirror,
    /// Deleted files are moved into a dated recycle folder on the destination
    RecycleBin,
    /// Deletions are never propagated
    Additive,
}

impl std::fmt::Display for BackupStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackupStrategy::Mirror => write!(f, "Mirror"),
            BackupStrategy::RecycleBin => write!(f, "RecycleBin"),
            BackupStrategy::Additive => write!(f, "Additive"),
        }
    }
}

/// A named backup configuration bound to one removable volume.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupProfile {
    pub id: ProfileId,

    /// Display name, e.g. "Samsung T7"
    #[serde(default)]
    pub name: String,

    /// Stable volume identifier of the destination drive (survives reinsertion)
    pub volume_id: String,

    /// Volume label at profile creation (informational)
    #[serde(default)]
    pub disk_label: Option<String>,

    /// Physical disk serial number (informational)
    #[serde(default)]
    pub disk_serial: Option<String>,

    #[serde(default = "default_true")]
    pub is_active: bool,

    #[serde(default)]
    pub strategy: BackupStrategy,

    /// Days a dated recycle folder is kept (RecycleBin only)
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,

    /// Re-hash source and destination after each copy
    #[serde(default)]
    pub verify_hash: bool,

    #[serde(default)]
    pub hash_algorithm: ChecksumAlgorithm,

    /// Read sources through a point-in-time volume snapshot when available
    #[serde(default = "default_true")]
    pub use_volume_snapshot: bool,

    /// Seconds to wait after drive insertion before starting
    #[serde(default = "default_insertion_delay")]
    pub insertion_delay_secs: u64,

    /// Start without asking for confirmation
    #[serde(default = "default_true")]
    pub auto_start: bool,

    #[serde(default)]
    pub pairs: Vec<BackupPair>,
}

fn default_true() -> bool {
    true
}

fn default_retention_days() -> u32 {
    30
}

fn default_insertion_delay() -> u64 {
    3
}

impl BackupProfile {
    /// Create a profile with default settings and no pairs.
    pub fn new(id: ProfileId, name: impl Into<String>, volume_id: impl Into<String>) -> Self {
        BackupProfile {
            id,
            name: name.into(),
            volume_id: volume_id.into(),
            disk_label: None,
            disk_serial: None,
            is_active: true,
            strategy: BackupStrategy::default(),
            retention_days: default_retention_days(),
            verify_hash: false,
            hash_algorithm: ChecksumAlgorithm::default(),
            use_volume_snapshot: true,
            insertion_delay_secs: default_insertion_delay(),
            auto_start: true,
            pairs: Vec::new(),
        }
    }

    pub fn active_pairs(&self) -> impl Iterator<Item = &BackupPair> {
        self.pairs.iter().filter(|p| p.is_active)
    }
}

/// One source directory mapped to a destination sub-path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupPair {
    pub id: PairId,

    /// Absolute source directory, e.g. `C:\Users\me\Documents`
    pub source_path: PathBuf,

    /// Destination path relative to the drive root, e.g. `Documents`
    #[serde(default)]
    pub dest_relative_path: PathBuf,

    /// Glob patterns (`*`, `?`) tested against file names and relative paths
    #[serde(default)]
    pub exclude_patterns: Vec<String>,

    #[serde(default = "default_true")]
    pub is_active: bool,
}

impl BackupPair {
    pub fn new(id: PairId, source_path: impl Into<PathBuf>, dest_relative_path: impl Into<PathBuf>) -> Self {
        BackupPair {
            id,
            source_path: source_path.into(),
            dest_relative_path: dest_relative_path.into(),
            exclude_patterns: Vec::new(),
            is_active: true,
        }
    }

    pub fn with_excludes<I, S>(mut self, patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.exclude_patterns = patterns.into_iter().map(Into::into).collect();
        self
    }

    /// Destination directory of this pair under a drive root.
    pub fn destination_in(&self, destination_root: &Path) -> PathBuf {
        destination_root.join(&self.dest_relative_path)
    }

    /// True if `relative_path` or its final component matches an exclude pattern.
    pub fn is_excluded(&self, relative_path: &str) -> bool {
        if self.exclude_patterns.is_empty() {
            return false;
        }

        let file_name = Path::new(relative_path)
            .file_name()
            .map(|n| n.to_string_lossy())
            .unwrap_or_else(|| relative_path.into());

        self.exclude_patterns.iter().any(|pattern| {
            glob::matches(&file_name, pattern) || glob::matches(relative_path, pattern)
        })
    }
}

/// Last known backed-up state of one file of a pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileSnapshot {
    pub profile_id: ProfileId,
    pub pair_id: PairId,

    /// Path relative to the pair's source directory, original casing
    pub relative_path: String,

    pub size: u64,
    pub last_modified: DateTime<Utc>,

    /// Content digest, when verification computed one
    #[serde(default)]
    pub hash: Option<String>,
}

impl FileSnapshot {
    /// Case-insensitive lookup key for `relative_path`.
    pub fn key(&self) -> String {
        path_key(&self.relative_path)
    }
}

/// Snapshot lookups compare relative paths case-insensitively.
pub fn path_key(relative_path: &str) -> String {
    relative_path.to_lowercase()
}

/// Outcome of a backup run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunStatus {
    Running,
    Success,
    PartialSuccess,
    Cancelled,
    Error,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunStatus::Running)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunStatus::Running => write!(f, "Running"),
            RunStatus::Success => write!(f, "Success"),
            RunStatus::PartialSuccess => write!(f, "PartialSuccess"),
            RunStatus::Cancelled => write!(f, "Cancelled"),
            RunStatus::Error => write!(f, "Error"),
        }
    }
}

/// What happened to one file during a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryAction {
    Added,
    Modified,
    Deleted,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupRunEntry {
    pub action: EntryAction,
    pub relative_path: String,
    #[serde(default)]
    pub error_detail: Option<String>,
}

/// One execution of the backup pipeline for a profile.
///
/// Entries are append-only. `finish` stamps the end time and the final
/// status; it is called once, from the engine's cleanup path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupRun {
    pub id: Uuid,
    pub profile_id: ProfileId,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,

    pub files_added: u32,
    pub files_modified: u32,
    pub files_deleted: u32,
    pub files_errored: u32,
    pub bytes_transferred: u64,

    pub status: RunStatus,
    pub error_message: Option<String>,

    /// Nothing was written to the destination
    pub is_dry_run: bool,

    pub entries: Vec<BackupRunEntry>,
}

impl BackupRun {
    pub fn start(profile_id: ProfileId, is_dry_run: bool) -> Self {
        BackupRun {
            id: Uuid::new_v4(),
            profile_id,
            started_at: Utc::now(),
            finished_at: None,
            files_added: 0,
            files_modified: 0,
            files_deleted: 0,
            files_errored: 0,
            bytes_transferred: 0,
            status: RunStatus::Running,
            error_message: None,
            is_dry_run,
            entries: Vec::new(),
        }
    }

    /// Added + modified + deleted; unchanged and errored files are not counted.
    pub fn total_files(&self) -> u32 {
        self.files_added + self.files_modified + self.files_deleted
    }

    /// `None` until the run is finished.
    pub fn duration(&self) -> Option<chrono::Duration> {
        self.finished_at.map(|end| end - self.started_at)
    }

    /// Append an entry and bump the matching counter.
    pub fn record(&mut self, action: EntryAction, relative_path: &str, error_detail: Option<String>) {
        match action {
            EntryAction::Added => self.files_added += 1,
            EntryAction::Modified => self.files_modified += 1,
            EntryAction::Deleted => self.files_deleted += 1,
            EntryAction::Error => self.files_errored += 1,
        }
        self.entries.push(BackupRunEntry {
            action,
            relative_path: relative_path.to_string(),
            error_detail,
        });
    }

    pub(crate) fn finish(&mut self, status: RunStatus, error_message: Option<String>) {
        debug_assert!(!self.status.is_terminal(), "run finished twice");
        self.status = status;
        self.error_message = error_message;
        self.finished_at = Some(Utc::now());
    }
}

/// A resolved destination drive, supplied by the drive-identification layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriveDescriptor {
    /// Stable volume identifier, e.g. `{0b2c...}`
    pub volume_id: String,
    /// Where the drive is currently mounted, e.g. `E:\`
    pub mount_path: PathBuf,
    pub label: Option<String>,
    pub serial_number: Option<String>,
}
