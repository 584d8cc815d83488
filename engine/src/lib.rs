//! # WinBack Engine - Incremental Removable-Drive Backup
//!
//! A headless backup core: when a known drive shows up, the engine compares
//! each configured source tree against what it backed up last time and
//! replicates only the differences to the drive.
//! Designed as the foundation for multiple shells (CLI, tray, automation).
//!
//! ## Overview
//!
//! The engine features:
//! - Incremental diffs against persisted per-file snapshots (size + mtime)
//! - Three deletion strategies: Mirror, RecycleBin (dated, with retention), Additive
//! - Optional point-in-time volume snapshots for copying locked files
//! - Per-file error isolation and cooperative cancellation
//! - Progress reporting through a sink (decoupled from UI technology)
//! - Optional post-copy hash verification
//!
//! ## Basic Usage
//!
//! ```no_run
//! use std::path::Path;
//! use std::sync::Arc;
//! use winback_engine::{
//!     BackupEngine, BackupPair, BackupProfile, CancelToken, JsonFileRepository, RunOptions,
//! };
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let repository = Arc::new(JsonFileRepository::open("winback-state.json")?);
//! let engine = BackupEngine::new(repository);
//!
//! let mut profile = BackupProfile::new(1, "Samsung T7", "{6f1c...}");
//! profile.pairs.push(BackupPair::new(1, "C:\\Users\\me\\Documents", "Documents"));
//!
//! let run = engine.run(&profile, Path::new("E:\\"), RunOptions::default(), None, &CancelToken::new());
//! println!("{}: {} added, {} modified", run.status, run.files_added, run.files_modified);
//! # Ok(())
//! # }
//! ```
//!
//! ## Modules
//!
//! - **model**: Profiles, pairs, file snapshots, runs
//! - **error**: Error types and handling
//! - **diff**: Source tree vs. snapshot comparison
//! - **engine**: The per-run pipeline
//! - **coordinator**: One-run-per-profile gate and drive insertion handling
//! - **vss**: Volume snapshot session and providers
//! - **repository**: Snapshot and run persistence
//! - **fs_ops**: Low-level filesystem operations
//! - **checksums**: Hash computation and copy verification
//! - **progress**: Progress sink trait

pub mod cancel;
pub mod checksums;
pub mod coordinator;
pub mod diff;
pub mod engine;
pub mod error;
pub mod fs_ops;
pub mod glob;
pub mod model;
pub mod progress;
pub mod repository;
pub mod vss;

// Re-export main types and functions
pub use cancel::CancelToken;
pub use checksums::{compute_file_checksum, ChecksumAlgorithm, ChecksumValue};
pub use coordinator::{BackupCoordinator, InsertionOutcome};
pub use diff::DiffResult;
pub use engine::{BackupEngine, RunOptions};
pub use error::{EngineError, Result};
pub use model::{
    BackupPair, BackupProfile, BackupRun, BackupRunEntry, BackupStrategy, DriveDescriptor,
    EntryAction, FileSnapshot, PairId, ProfileId, RunStatus,
};
pub use progress::{BackupPhase, BackupProgress, ChannelProgress, ProgressSink};
pub use repository::{BackupRepository, JsonFileRepository, MemoryRepository};
pub use vss::{SnapshotProvider, VolumeSnapshot, VssSession};
