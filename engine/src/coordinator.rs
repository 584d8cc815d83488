//! Run coordination.
//!
//! [`BackupCoordinator`] is the gate in front of the engine: it admits at most
//! one run per profile, keeps the cancel token of every run in flight, and
//! turns a drive insertion into a run for the matching profile.

use crate::cancel::CancelToken;
use crate::engine::{BackupEngine, RunOptions};
use crate::model::{BackupProfile, BackupRun, DriveDescriptor, ProfileId};
use crate::progress::ProgressSink;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// What happened after a drive was reported.
#[derive(Debug)]
pub enum InsertionOutcome {
    /// No active profile is bound to the volume
    UnknownDrive,
    /// The profile does not auto-start and the insertion was not confirmed
    NeedsConfirmation(ProfileId),
    /// A run for the profile is already in flight
    AlreadyRunning(ProfileId),
    /// Cancelled during the insertion delay, before any run was recorded
    Cancelled(ProfileId),
    Completed(BackupRun),
}

pub struct BackupCoordinator {
    engine: Arc<BackupEngine>,
    active: DashMap<ProfileId, CancelToken>,
}

impl BackupCoordinator {
    pub fn new(engine: Arc<BackupEngine>) -> Self {
        BackupCoordinator {
            engine,
            active: DashMap::new(),
        }
    }

    pub fn engine(&self) -> &Arc<BackupEngine> {
        &self.engine
    }

    pub fn is_running(&self, profile_id: ProfileId) -> bool {
        self.active.contains_key(&profile_id)
    }

    pub fn running_profiles(&self) -> Vec<ProfileId> {
        self.active.iter().map(|entry| *entry.key()).collect()
    }

    /// Request cancellation of the profile's run. Returns false if none is in flight.
    pub fn cancel(&self, profile_id: ProfileId) -> bool {
        match self.active.get(&profile_id) {
            Some(token) => {
                token.cancel();
                info!(profile = profile_id, "cancellation requested");
                true
            }
            None => false,
        }
    }

    /// Run `profile` now, on the calling thread.
    ///
    /// Returns `None` without doing anything if the profile is already running.
    pub fn start(
        &self,
        profile: &BackupProfile,
        destination_root: &Path,
        options: RunOptions,
        progress: Option<&dyn ProgressSink>,
    ) -> Option<BackupRun> {
        let slot = self.register(profile.id)?;
        Some(
            self.engine
                .run(profile, destination_root, options, progress, &slot.token),
        )
    }

    /// React to a drive arriving at `drive.mount_path`.
    ///
    /// The matching profile's insertion delay is waited out first; a cancel
    /// request during the wait ends it without recording a run.
    pub fn on_drive_inserted(
        &self,
        drive: &DriveDescriptor,
        profiles: &[BackupProfile],
        confirmed: bool,
        progress: Option<&dyn ProgressSink>,
    ) -> InsertionOutcome {
        let Some(profile) = profiles
            .iter()
            .find(|p| p.is_active && p.volume_id == drive.volume_id)
        else {
            debug!(volume = %drive.volume_id, "no profile for drive");
            return InsertionOutcome::UnknownDrive;
        };

        if !profile.auto_start && !confirmed {
            info!(profile = %profile.name, "drive recognized, waiting for confirmation");
            return InsertionOutcome::NeedsConfirmation(profile.id);
        }

        let Some(slot) = self.register(profile.id) else {
            return InsertionOutcome::AlreadyRunning(profile.id);
        };

        info!(
            profile = %profile.name,
            mount = %drive.mount_path.display(),
            delay_secs = profile.insertion_delay_secs,
            "drive recognized"
        );
        if slot
            .token
            .sleep(Duration::from_secs(profile.insertion_delay_secs))
            .is_err()
        {
            warn!(profile = %profile.name, "cancelled before start");
            return InsertionOutcome::Cancelled(profile.id);
        }

        let run = self.engine.run(
            profile,
            &drive.mount_path,
            RunOptions::default(),
            progress,
            &slot.token,
        );
        InsertionOutcome::Completed(run)
    }

    fn register(&self, profile_id: ProfileId) -> Option<ActiveRun<'_>> {
        match self.active.entry(profile_id) {
            Entry::Occupied(_) => {
                warn!(profile = profile_id, "backup already running, start ignored");
                None
            }
            Entry::Vacant(slot) => {
                let token = CancelToken::new();
                slot.insert(token.clone());
                Some(ActiveRun {
                    active: &self.active,
                    profile_id,
                    token,
                })
            }
        }
    }
}

/// Registration of a run in flight; deregisters on drop.
struct ActiveRun<'a> {
    active: &'a DashMap<ProfileId, CancelToken>,
    profile_id: ProfileId,
    token: CancelToken,
}

impl Drop for ActiveRun<'_> {
    fn drop(&mut self) {
        self.active.remove(&self.profile_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{BackupPair, RunStatus};
    use crate::progress::{BackupPhase, ChannelProgress};
    use crossbeam_channel::unbounded;
    use crate::repository::MemoryRepository;
    use crate::vss::NoSnapshots;
    use std::fs;
    use std::thread;
    use std::time::Instant;
    use tempfile::TempDir;

    fn coordinator() -> Arc<BackupCoordinator> {
        let engine = BackupEngine::new(Arc::new(MemoryRepository::new()))
            .with_snapshot_provider(Arc::new(NoSnapshots));
        Arc::new(BackupCoordinator::new(Arc::new(engine)))
    }

    fn setup() -> (TempDir, BackupProfile, DriveDescriptor) {
        let temp = tempfile::tempdir().expect("Failed to create temp dir");
        let source = temp.path().join("src");
        let mount = temp.path().join("drive");
        fs::create_dir_all(&source).unwrap();
        fs::create_dir_all(&mount).unwrap();
        fs::write(source.join("a.txt"), b"alpha").unwrap();

        let mut profile = BackupProfile::new(7, "Stick", "vol-7");
        profile.insertion_delay_secs = 0;
        profile.pairs.push(BackupPair::new(1, &source, "Backup"));

        let drive = DriveDescriptor {
            volume_id: "vol-7".into(),
            mount_path: mount,
            label: Some("STICK".into()),
            serial_number: None,
        };
        (temp, profile, drive)
    }

    #[test]
    fn test_start_runs_and_deregisters() {
        let (_temp, profile, drive) = setup();
        let coord = coordinator();

        let run = coord
            .start(&profile, &drive.mount_path, RunOptions::default(), None)
            .unwrap();
        assert_eq!(run.status, RunStatus::Success);
        assert!(!coord.is_running(profile.id));
        assert!(drive.mount_path.join("Backup").join("a.txt").exists());
    }

    #[test]
    fn test_second_start_is_rejected() {
        let coord = coordinator();
        let slot = coord.register(3).unwrap();
        assert!(coord.is_running(3));
        assert!(coord.register(3).is_none());
        assert_eq!(coord.running_profiles(), vec![3]);

        drop(slot);
        assert!(!coord.is_running(3));
        assert!(coord.register(3).is_some());
    }

    #[test]
    fn test_cancel_unknown_profile() {
        assert!(!coordinator().cancel(42));
    }

    #[test]
    fn test_unknown_drive() {
        let (_temp, profile, mut drive) = setup();
        drive.volume_id = "someone-else".into();

        let outcome = coordinator().on_drive_inserted(&drive, &[profile], false, None);
        assert!(matches!(outcome, InsertionOutcome::UnknownDrive));
    }

    #[test]
    fn test_inactive_profile_is_not_matched() {
        let (_temp, mut profile, drive) = setup();
        profile.is_active = false;

        let outcome = coordinator().on_drive_inserted(&drive, &[profile], true, None);
        assert!(matches!(outcome, InsertionOutcome::UnknownDrive));
    }

    #[test]
    fn test_manual_profile_needs_confirmation() {
        let (_temp, mut profile, drive) = setup();
        profile.auto_start = false;
        let coord = coordinator();

        let outcome = coord.on_drive_inserted(&drive, std::slice::from_ref(&profile), false, None);
        assert!(matches!(outcome, InsertionOutcome::NeedsConfirmation(7)));

        let outcome = coord.on_drive_inserted(&drive, &[profile], true, None);
        assert!(matches!(outcome, InsertionOutcome::Completed(ref run) if run.status == RunStatus::Success));
    }

    #[test]
    fn test_insertion_uses_mount_path() {
        let (_temp, profile, drive) = setup();

        let outcome = coordinator().on_drive_inserted(&drive, &[profile], false, None);
        match outcome {
            InsertionOutcome::Completed(run) => assert_eq!(run.files_added, 1),
            other => panic!("unexpected outcome: {:?}", other),
        }
        assert_eq!(
            fs::read(drive.mount_path.join("Backup").join("a.txt")).unwrap(),
            b"alpha"
        );
    }

    #[test]
    fn test_insertion_while_running() {
        let (_temp, profile, drive) = setup();
        let coord = coordinator();
        let _slot = coord.register(profile.id).unwrap();

        let outcome = coord.on_drive_inserted(&drive, &[profile], false, None);
        assert!(matches!(outcome, InsertionOutcome::AlreadyRunning(7)));
    }

    #[test]
    fn test_cancel_during_insertion_delay() {
        let (_temp, mut profile, drive) = setup();
        profile.insertion_delay_secs = 30;
        let coord = coordinator();

        let worker = {
            let coord = coord.clone();
            let drive = drive.clone();
            thread::spawn(move || coord.on_drive_inserted(&drive, &[profile], false, None))
        };

        let started = Instant::now();
        while !coord.is_running(7) {
            assert!(started.elapsed() < Duration::from_secs(5));
            thread::sleep(Duration::from_millis(10));
        }
        assert!(coord.cancel(7));

        let outcome = worker.join().unwrap();
        assert!(matches!(outcome, InsertionOutcome::Cancelled(7)));
        assert!(started.elapsed() < Duration::from_secs(10));
        assert!(!coord.is_running(7));
        assert!(!drive.mount_path.join("Backup").exists());
    }

    #[test]
    fn test_cancel_from_another_thread_mid_run() {
        let (_temp, profile, drive) = setup();
        let source = profile.pairs[0].source_path.clone();
        for i in 0..20 {
            fs::write(source.join(format!("f{:02}.txt", i)), vec![b'x'; 4096]).unwrap();
        }
        let coord = coordinator();
        let (tx, rx) = unbounded();

        let worker = {
            let coord = coord.clone();
            let profile = profile.clone();
            let mount = drive.mount_path.clone();
            thread::spawn(move || {
                let sink = ChannelProgress::new(tx);
                coord.start(&profile, &mount, RunOptions::default(), Some(&sink))
            })
        };

        for progress in rx.iter() {
            if progress.phase == BackupPhase::Copying {
                coord.cancel(profile.id);
                break;
            }
        }

        // The worker may finish before the request lands.
        let run = worker.join().unwrap().unwrap();
        assert!(matches!(run.status, RunStatus::Cancelled | RunStatus::Success));
        assert_eq!(run.files_errored, 0);
        assert!(!coord.is_running(profile.id));
    }
}
