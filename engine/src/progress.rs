//! Progress reporting.
//!
//! The engine reports a stream of [`BackupProgress`] values to an optional
//! [`ProgressSink`]. Reporting is fire-and-forget: a sink cannot influence the
//! backup, and a sink that fails (e.g. a closed channel) is ignored.

use crossbeam_channel::Sender;
use serde::Serialize;

/// Pipeline step a progress report belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum BackupPhase {
    Scanning,
    Copying,
    Deleting,
    Verifying,
    Done,
}

/// One progress report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackupProgress {
    /// Relative path of the file being processed, or a step label
    pub current_item: String,
    /// Files processed so far in the current pair
    pub files_processed: usize,
    /// Files to process in the current pair
    pub total_files: usize,
    /// Bytes transferred so far in the run
    pub bytes_transferred: u64,
    pub phase: BackupPhase,
}

/// Receiver of progress reports.
///
/// Called synchronously from the engine thread; implementations should return quickly.
pub trait ProgressSink: Send + Sync {
    fn report(&self, progress: &BackupProgress);
}

/// A ProgressSink that forwards reports over a channel, e.g. to a UI thread.
pub struct ChannelProgress {
    sender: Sender<BackupProgress>,
}

impl ChannelProgress {
    pub fn new(sender: Sender<BackupProgress>) -> Self {
        ChannelProgress { sender }
    }
}

impl ProgressSink for ChannelProgress {
    fn report(&self, progress: &BackupProgress) {
        // A dropped receiver just means nobody is watching.
        let _ = self.sender.send(progress.clone());
    }
}
