//! Error types for the backup engine.
//!
//! `EngineError` covers both the per-file failures raised inside the copy and
//! delete steps and the pipeline-level faults that end a run. Per-file errors
//! never leave the engine: they are caught at the file boundary and recorded as
//! `Error` entries on the run. Only `Cancelled` and pipeline faults (repository
//! failures, unexpected I/O) reach the run boundary.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    /// Failed to open or read a source file
    #[error("Failed to read file: {}: {source}", path.display())]
    ReadError { path: PathBuf, source: io::Error },

    /// Failed to create or write a destination file
    #[error("Failed to write file: {}: {source}", path.display())]
    WriteError { path: PathBuf, source: io::Error },

    /// Failed to create a directory
    #[error("Failed to create directory: {}: {source}", path.display())]
    DirectoryCreationFailed { path: PathBuf, source: io::Error },

    /// Failed to remove or move a destination file
    #[error("Failed to remove file: {}: {source}", path.display())]
    DeleteFailed { path: PathBuf, source: io::Error },

    /// Source and destination digests differ after a copy
    #[error("Integrity check failed: {}", path.display())]
    VerificationFailed { path: PathBuf },

    /// The persistence collaborator rejected an operation
    #[error("Repository error: {0}")]
    Repository(String),

    /// Invalid profile or settings
    #[error("Configuration error: {0}")]
    Config(String),

    /// The run was cancelled cooperatively
    #[error("Backup cancelled")]
    Cancelled,

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl EngineError {
    /// Extract the OS error code from this error, if available.
    pub fn raw_os_error(&self) -> Option<i32> {
        match self {
            Self::ReadError { source, .. }
            | Self::WriteError { source, .. }
            | Self::DirectoryCreationFailed { source, .. }
            | Self::DeleteFailed { source, .. } => source.raw_os_error(),
            Self::Io(source) => source.raw_os_error(),
            _ => None,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        EngineError::Repository(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
