//! Backup run orchestration.
//!
//! [`BackupEngine::run`] executes one profile against one destination root:
//! - creates the run record (Running) before touching any pair
//! - processes active pairs one after another: scan, copy, delete, purge, persist
//! - finalizes the run exactly once, whatever the outcome
//!
//! Per-file failures are recorded as `Error` entries and never stop the run.
//! Only cancellation and pipeline faults (e.g. the repository failing) end it
//! early.

use crate::cancel::CancelToken;
use crate::checksums;
use crate::diff::{self, DiffResult};
use crate::error::{EngineError, Result};
use crate::fs_ops;
use crate::model::{
    path_key, BackupPair, BackupProfile, BackupRun, BackupStrategy, EntryAction, FileSnapshot,
    PairId, ProfileId, RunStatus,
};
use crate::progress::{BackupPhase, BackupProgress, ProgressSink};
use crate::repository::BackupRepository;
use crate::vss::{self, SnapshotProvider, VolumeSnapshot, VssSession};
use chrono::{DateTime, Local, NaiveDate, Utc};
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Per-run switches.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunOptions {
    /// Compute everything, write nothing to the destination or the snapshot store
    pub dry_run: bool,
}

/// The incremental backup pipeline.
pub struct BackupEngine {
    repository: Arc<dyn BackupRepository>,
    snapshot_provider: Arc<dyn SnapshotProvider>,
}

impl BackupEngine {
    /// Engine using the platform's volume snapshot provider.
    pub fn new(repository: Arc<dyn BackupRepository>) -> Self {
        BackupEngine {
            repository,
            snapshot_provider: vss::default_provider(),
        }
    }

    pub fn with_snapshot_provider(mut self, provider: Arc<dyn SnapshotProvider>) -> Self {
        self.snapshot_provider = provider;
        self
    }

    pub fn repository(&self) -> &Arc<dyn BackupRepository> {
        &self.repository
    }

    /// Whether volume snapshots can be offered at all.
    pub fn snapshots_available(&self) -> bool {
        self.snapshot_provider.probe()
    }

    /// Pending changes of every active pair whose source exists.
    pub fn preview(&self, profile: &BackupProfile) -> Result<Vec<(PairId, DiffResult)>> {
        profile
            .active_pairs()
            .filter(|pair| pair.source_path.is_dir())
            .map(|pair| {
                let snapshots = self.repository.load_snapshots(profile.id, pair.id)?;
                Ok((pair.id, diff::compute(&pair.source_path, &snapshots, pair)))
            })
            .collect()
    }

    /// Run `profile` against `destination_root`.
    ///
    /// Always returns the finished run; its status tells how it went.
    pub fn run(
        &self,
        profile: &BackupProfile,
        destination_root: &Path,
        options: RunOptions,
        progress: Option<&dyn ProgressSink>,
        cancel: &CancelToken,
    ) -> BackupRun {
        let mut state = RunState {
            run: BackupRun::start(profile.id, options.dry_run),
            flushed: 0,
            session: None,
        };

        if let Err(e) = self.repository.create_run(&state.run) {
            error!(profile = %profile.name, error = %e, "cannot record backup run");
            state.run.finish(RunStatus::Error, Some(e.to_string()));
            return state.run;
        }

        info!(
            profile = %profile.name,
            run = %state.run.id,
            dry_run = options.dry_run,
            destination = %destination_root.display(),
            "backup started"
        );

        // A dry run reads nothing, so it never needs a frozen image.
        if profile.use_volume_snapshot && !options.dry_run {
            state.session = Some(VssSession::new(self.snapshot_provider.clone()));
        }
        let reporter = Reporter { sink: progress };

        let outcome = profile.active_pairs().try_for_each(|pair| {
            cancel.check()?;
            self.process_pair(&mut state, profile, pair, destination_root, options, &reporter, cancel)
        });

        // Snapshots are released before the run is finalized, on every path.
        state.session = None;

        let (status, message) = match outcome {
            Ok(()) if state.run.files_errored > 0 => (RunStatus::PartialSuccess, None),
            Ok(()) => (RunStatus::Success, None),
            Err(EngineError::Cancelled) => {
                warn!(profile = %profile.name, "backup cancelled");
                (RunStatus::Cancelled, None)
            }
            Err(e) => {
                error!(profile = %profile.name, error = %e, "backup failed");
                (RunStatus::Error, Some(e.to_string()))
            }
        };
        self.finalize(&mut state, status, message);

        let run = state.run;
        reporter.report(
            BackupPhase::Done,
            "",
            run.total_files() as usize,
            run.total_files() as usize,
            run.bytes_transferred,
        );
        info!(
            profile = %profile.name,
            status = %run.status,
            added = run.files_added,
            modified = run.files_modified,
            deleted = run.files_deleted,
            errors = run.files_errored,
            bytes = run.bytes_transferred,
            "backup finished"
        );
        run
    }

    fn finalize(&self, state: &mut RunState, status: RunStatus, message: Option<String>) {
        if let Err(e) = state.flush_entries(self.repository.as_ref()) {
            error!(run = %state.run.id, error = %e, "cannot store run entries");
        }
        state.run.finish(status, message);
        if let Err(e) = self.repository.finalize_run(&state.run) {
            error!(run = %state.run.id, error = %e, "cannot finalize run record");
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn process_pair(
        &self,
        state: &mut RunState,
        profile: &BackupProfile,
        pair: &BackupPair,
        destination_root: &Path,
        options: RunOptions,
        reporter: &Reporter<'_>,
        cancel: &CancelToken,
    ) -> Result<()> {
        let source = pair.source_path.as_path();
        if !source.is_dir() {
            warn!(pair = pair.id, source = %source.display(), "source directory not found, skipping pair");
            return Ok(());
        }

        let snapshots = self.repository.load_snapshots(profile.id, pair.id)?;

        reporter.report(
            BackupPhase::Scanning,
            &format!("Scanning {}", source.display()),
            0,
            0,
            state.run.bytes_transferred,
        );
        let diff = diff::compute(source, &snapshots, pair);
        info!(
            pair = pair.id,
            added = diff.added.len(),
            modified = diff.modified.len(),
            deleted = diff.deleted.len(),
            "diff computed"
        );

        if !diff.has_changes() && !snapshots.is_empty() {
            debug!(source = %source.display(), "no changes");
            return Ok(());
        }

        let pair_root = pair.destination_in(destination_root);
        if !options.dry_run {
            fs_ops::ensure_dir_exists(&pair_root)?;
        }

        let ctx = PairContext {
            profile,
            pair,
            pair_root,
            dry_run: options.dry_run,
            total: diff.total_changes(),
            reporter,
            cancel,
        };
        let mut tracker = SnapshotTracker::new(profile.id, pair.id, snapshots);
        let mut processed = 0usize;

        let mut outcome = self.copy_changed(state, &ctx, &diff, &mut tracker, &mut processed);
        if outcome.is_ok() {
            outcome = self.apply_deletions(state, &ctx, &diff, &mut tracker, &mut processed);
        }

        // Whatever happened above, keep the work already done.
        let saved = if options.dry_run {
            Ok(())
        } else {
            self.repository
                .save_snapshots(profile.id, pair.id, &tracker.snapshots())
        };
        let flushed = state.flush_entries(self.repository.as_ref());

        outcome.and(saved).and(flushed)
    }

    fn copy_changed(
        &self,
        state: &mut RunState,
        ctx: &PairContext<'_>,
        diff: &DiffResult,
        tracker: &mut SnapshotTracker,
        processed: &mut usize,
    ) -> Result<()> {
        let source_root = ctx.pair.source_path.as_path();
        let volume_root = fs_ops::volume_root(source_root);
        let mut frozen: Option<Option<VolumeSnapshot>> = None;

        let work = diff
            .added
            .iter()
            .map(|p| (p, EntryAction::Added))
            .chain(diff.modified.iter().map(|p| (p, EntryAction::Modified)));

        for (relative, action) in work {
            ctx.cancel.check()?;
            *processed += 1;
            ctx.reporter.report(
                BackupPhase::Copying,
                relative,
                *processed,
                ctx.total,
                state.run.bytes_transferred,
            );

            let snapshot = frozen.get_or_insert_with(|| {
                state
                    .session
                    .as_mut()
                    .and_then(|session| session.get_or_create(&volume_root).cloned())
            });

            let live = source_root.join(relative);
            let read_from = match snapshot.as_ref() {
                Some(s) => s.translate_path(&live, &volume_root),
                None => live.clone(),
            };
            let dest = ctx.pair_root.join(relative);

            match self.copy_one(ctx, relative, &live, &read_from, &dest, *processed, state.run.bytes_transferred) {
                Ok(copied) => {
                    // Counted from the live file even when the frozen image was read.
                    state.run.bytes_transferred += copied.size;
                    tracker.upsert(relative, copied.size, copied.modified, copied.hash);
                    state.run.record(action, relative, None);
                }
                Err(e) => {
                    warn!(file = %relative, error = %e, "copy failed");
                    state.run.record(EntryAction::Error, relative, Some(e.to_string()));
                }
            }
        }

        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn copy_one(
        &self,
        ctx: &PairContext<'_>,
        relative: &str,
        live: &Path,
        read_from: &Path,
        dest: &Path,
        processed: usize,
        bytes_so_far: u64,
    ) -> Result<CopiedFile> {
        let mut hash = None;

        if !ctx.dry_run {
            fs_ops::copy_file_with_metadata(read_from, dest)?;

            if ctx.profile.verify_hash {
                ctx.reporter.report(BackupPhase::Verifying, relative, processed, ctx.total, bytes_so_far);
                let digest = checksums::verify_copy(read_from, dest, ctx.profile.hash_algorithm)?;
                hash = Some(digest.hex().to_string());
            }
        }

        let (size, modified) = diff::read_size_and_mtime(live).unwrap_or((0, Utc::now()));
        Ok(CopiedFile { size, modified, hash })
    }

    fn apply_deletions(
        &self,
        state: &mut RunState,
        ctx: &PairContext<'_>,
        diff: &DiffResult,
        tracker: &mut SnapshotTracker,
        processed: &mut usize,
    ) -> Result<()> {
        if !diff.deleted.is_empty() {
            ctx.reporter.report(
                BackupPhase::Deleting,
                "Processing deletions",
                *processed,
                ctx.total,
                state.run.bytes_transferred,
            );
        }

        let today = Local::now().date_naive();

        for relative in &diff.deleted {
            ctx.cancel.check()?;
            *processed += 1;
            ctx.reporter.report(
                BackupPhase::Deleting,
                relative,
                *processed,
                ctx.total,
                state.run.bytes_transferred,
            );

            if !ctx.dry_run {
                if let Err(e) = remove_destination(ctx, relative, today) {
                    warn!(file = %relative, error = %e, "delete failed");
                    state.run.record(EntryAction::Error, relative, Some(e.to_string()));
                }
            }

            tracker.remove(relative);
            state.run.record(EntryAction::Deleted, relative, None);
        }

        if !ctx.dry_run && ctx.profile.strategy == BackupStrategy::RecycleBin {
            let purged = fs_ops::purge_recycle_bin(
                &ctx.pair_root,
                ctx.profile.retention_days,
                Local::now().naive_local(),
            );
            if purged > 0 {
                debug!(purged, pair = ctx.pair.id, "recycle bin folders purged");
            }
        }

        Ok(())
    }
}

fn remove_destination(ctx: &PairContext<'_>, relative: &str, today: NaiveDate) -> Result<()> {
    let dest = ctx.pair_root.join(relative);
    match ctx.profile.strategy {
        BackupStrategy::Mirror => fs_ops::remove_and_prune(&ctx.pair_root, &dest),
        BackupStrategy::RecycleBin => {
            fs_ops::move_to_recycle_bin(&ctx.pair_root, &dest, relative, today).map(|_| ())
        }
        BackupStrategy::Additive => Ok(()),
    }
}

struct RunState {
    run: BackupRun,
    /// Entries already handed to the repository
    flushed: usize,
    session: Option<VssSession>,
}

impl RunState {
    fn flush_entries(&mut self, repository: &dyn BackupRepository) -> Result<()> {
        if self.flushed < self.run.entries.len() {
            repository.append_entries(self.run.id, &self.run.entries[self.flushed..])?;
            self.flushed = self.run.entries.len();
        }
        Ok(())
    }
}

struct PairContext<'a> {
    profile: &'a BackupProfile,
    pair: &'a BackupPair,
    pair_root: PathBuf,
    dry_run: bool,
    total: usize,
    reporter: &'a Reporter<'a>,
    cancel: &'a CancelToken,
}

struct CopiedFile {
    size: u64,
    modified: DateTime<Utc>,
    hash: Option<String>,
}

struct Reporter<'a> {
    sink: Option<&'a dyn ProgressSink>,
}

impl Reporter<'_> {
    fn report(&self, phase: BackupPhase, item: &str, processed: usize, total: usize, bytes: u64) {
        let Some(sink) = self.sink else { return };
        let progress = BackupProgress {
            current_item: item.to_string(),
            files_processed: processed,
            total_files: total,
            bytes_transferred: bytes,
            phase,
        };
        // A misbehaving observer must not take the backup down with it.
        if panic::catch_unwind(AssertUnwindSafe(|| sink.report(&progress))).is_err() {
            debug!("progress sink panicked, report dropped");
        }
    }
}

/// Working copy of one pair's snapshot set.
struct SnapshotTracker {
    profile_id: ProfileId,
    pair_id: PairId,
    files: HashMap<String, FileSnapshot>,
}

impl SnapshotTracker {
    fn new(profile_id: ProfileId, pair_id: PairId, snapshots: Vec<FileSnapshot>) -> Self {
        SnapshotTracker {
            profile_id,
            pair_id,
            files: snapshots.into_iter().map(|s| (s.key(), s)).collect(),
        }
    }

    fn upsert(&mut self, relative: &str, size: u64, modified: DateTime<Utc>, hash: Option<String>) {
        let (profile_id, pair_id) = (self.profile_id, self.pair_id);
        let snapshot = self
            .files
            .entry(path_key(relative))
            .or_insert_with(|| FileSnapshot {
                profile_id,
                pair_id,
                relative_path: relative.to_string(),
                size,
                last_modified: modified,
                hash: None,
            });
        snapshot.relative_path = relative.to_string();
        snapshot.size = size;
        snapshot.last_modified = modified;
        snapshot.hash = hash;
    }

    fn remove(&mut self, relative: &str) {
        self.files.remove(&path_key(relative));
    }

    fn snapshots(&self) -> Vec<FileSnapshot> {
        let mut all: Vec<FileSnapshot> = self.files.values().cloned().collect();
        all.sort_by(|a, b| a.relative_path.cmp(&b.relative_path));
        all
    }
}
