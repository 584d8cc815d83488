//! WinBack - Command-line interface for the backup engine.
//!
//! A thin shell over the engine for running profiles from a TOML config file,
//! simulating drive insertions, and inspecting pending changes and run history.

mod config;
mod logger;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use config::Config;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use winback_engine::{
    BackupCoordinator, BackupEngine, BackupPhase, BackupProgress, BackupRepository, BackupRun,
    DriveDescriptor, EntryAction, InsertionOutcome, JsonFileRepository, ProfileId, ProgressSink,
    RunOptions, RunStatus,
};

/// WinBack - incremental backups to removable drives
#[derive(Parser, Debug)]
#[command(name = "winback")]
#[command(version = "0.1.0")]
#[command(about = "Incremental backups to removable drives")]
struct Args {
    /// Configuration file
    #[arg(long, value_name = "FILE", default_value = "winback.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run one profile against a destination directory
    Run {
        #[arg(long, value_name = "ID")]
        profile: ProfileId,

        /// Destination root, usually the drive's mount point
        #[arg(long, value_name = "DIR")]
        dest: PathBuf,

        /// Compute and report changes without writing anything
        #[arg(long)]
        dry_run: bool,

        /// Print every processed file
        #[arg(long)]
        verbose: bool,
    },

    /// Handle a drive insertion as the tray shell would
    Insert {
        /// Stable volume identifier of the drive
        #[arg(long, value_name = "ID")]
        volume: String,

        /// Where the drive is mounted
        #[arg(long, value_name = "DIR")]
        mount: PathBuf,

        #[arg(long)]
        label: Option<String>,

        /// Start even if the profile does not auto-start
        #[arg(long)]
        yes: bool,
    },

    /// Show pending changes of a profile without running it
    Diff {
        #[arg(long, value_name = "ID")]
        profile: ProfileId,
    },

    /// List recorded runs, newest first
    History {
        #[arg(long, value_name = "ID")]
        profile: Option<ProfileId>,

        #[arg(long, default_value_t = 10)]
        limit: usize,
    },

    /// Report whether volume snapshots are available
    Probe,
}

/// CLI implementation of ProgressSink for displaying backup progress
struct CliProgress {
    verbose: bool,
    start_time: Instant,
    last_progress_update: Mutex<Instant>,
}

impl CliProgress {
    fn new(verbose: bool) -> Self {
        let now = Instant::now();
        CliProgress {
            verbose,
            start_time: now,
            last_progress_update: Mutex::new(now),
        }
    }

    fn format_bytes(bytes: u64) -> String {
        const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
        let mut size = bytes as f64;
        let mut unit_idx = 0;

        while size >= 1024.0 && unit_idx < UNITS.len() - 1 {
            size /= 1024.0;
            unit_idx += 1;
        }

        format!("{:.2} {}", size, UNITS[unit_idx])
    }

    fn format_duration(elapsed: Duration) -> String {
        let secs = elapsed.as_secs();
        let hours = secs / 3600;
        let mins = (secs % 3600) / 60;
        let secs = secs % 60;

        if hours > 0 {
            format!("{}h {}m {}s", hours, mins, secs)
        } else if mins > 0 {
            format!("{}m {}s", mins, secs)
        } else {
            format!("{}s", secs)
        }
    }

    fn print_progress_bar(percent: u32) -> String {
        let filled = (percent.min(100) / 5) as usize;
        let empty = 20 - filled;
        format!("[{}{}] {}%", "=".repeat(filled), " ".repeat(empty), percent)
    }

    /// True at most once per 200ms.
    fn should_redraw(&self) -> bool {
        let Ok(mut last) = self.last_progress_update.lock() else {
            return false;
        };
        if last.elapsed().as_millis() < 200 {
            return false;
        }
        *last = Instant::now();
        true
    }
}

impl ProgressSink for CliProgress {
    fn report(&self, progress: &BackupProgress) {
        match progress.phase {
            BackupPhase::Scanning => eprintln!("{}", progress.current_item),
            BackupPhase::Copying | BackupPhase::Deleting if self.verbose => {
                let verb = if progress.phase == BackupPhase::Copying { "Copy" } else { "Delete" };
                eprintln!(
                    "[{:>4}/{}] {}: {}",
                    progress.files_processed, progress.total_files, verb, progress.current_item
                );
            }
            BackupPhase::Copying | BackupPhase::Deleting => {
                if !self.should_redraw() {
                    return;
                }
                let total = progress.total_files.max(1);
                let percent = (progress.files_processed as f64 / total as f64 * 100.0) as u32;
                eprint!(
                    "\rProgress: {} | {}/{} files | {}",
                    Self::print_progress_bar(percent),
                    progress.files_processed,
                    progress.total_files,
                    Self::format_bytes(progress.bytes_transferred)
                );
                let _ = std::io::Write::flush(&mut std::io::stderr());
            }
            BackupPhase::Verifying => {
                if self.verbose {
                    eprintln!("           Verify: {}", progress.current_item);
                }
            }
            BackupPhase::Done => eprintln!(),
        }
    }
}

/// Parse arguments, load the config, then run the command
fn main() {
    let args = Args::parse();

    let exit_code = match Config::from_file(&args.config) {
        Ok(config) => {
            if let Err(e) = logger::init(&config.log.level) {
                eprintln!("Warning: logging not initialized: {}", e);
            }
            match run_cli(&args, &config) {
                Ok(code) => code,
                Err(e) => {
                    eprintln!("Error: {:#}", e);
                    2
                }
            }
        }
        Err(e) => {
            eprintln!("Error: {:#}", e);
            2
        }
    };

    std::process::exit(exit_code);
}

/// Main CLI logic - separated for testability. Returns the process exit code.
fn run_cli(args: &Args, config: &Config) -> anyhow::Result<i32> {
    let repository: Arc<dyn BackupRepository> = Arc::new(
        JsonFileRepository::open(&config.state_file)
            .with_context(|| format!("cannot open state file {}", config.state_file.display()))?,
    );
    let engine = Arc::new(BackupEngine::new(repository.clone()));

    match &args.command {
        Command::Run {
            profile,
            dest,
            dry_run,
            verbose,
        } => {
            let profile = config.profile(*profile)?;
            ensure_dir(dest)?;

            let coordinator = BackupCoordinator::new(engine);
            let progress = CliProgress::new(*verbose);
            let options = RunOptions { dry_run: *dry_run };

            let run = coordinator
                .start(profile, dest, options, Some(&progress))
                .with_context(|| format!("profile {} is already running", profile.id))?;
            print_summary(&run, progress.start_time.elapsed());
            Ok(exit_code(run.status))
        }

        Command::Insert {
            volume,
            mount,
            label,
            yes,
        } => {
            ensure_dir(mount)?;
            let drive = DriveDescriptor {
                volume_id: volume.clone(),
                mount_path: mount.clone(),
                label: label.clone(),
                serial_number: None,
            };

            let coordinator = BackupCoordinator::new(engine);
            let progress = CliProgress::new(false);

            match coordinator.on_drive_inserted(&drive, &config.profiles, *yes, Some(&progress)) {
                InsertionOutcome::Completed(run) => {
                    print_summary(&run, progress.start_time.elapsed());
                    Ok(exit_code(run.status))
                }
                InsertionOutcome::UnknownDrive => {
                    println!("No active profile for volume {}", drive.volume_id);
                    Ok(1)
                }
                InsertionOutcome::NeedsConfirmation(id) => {
                    println!("Profile {} does not auto-start; pass --yes to run it", id);
                    Ok(1)
                }
                InsertionOutcome::AlreadyRunning(id) => {
                    println!("Profile {} is already running", id);
                    Ok(1)
                }
                InsertionOutcome::Cancelled(id) => {
                    println!("Profile {} cancelled before start", id);
                    Ok(1)
                }
            }
        }

        Command::Diff { profile } => {
            let profile = config.profile(*profile)?;
            let previews = engine.preview(profile)?;

            for pair in profile.active_pairs() {
                let Some((_, diff)) = previews.iter().find(|(id, _)| *id == pair.id) else {
                    println!("{} -> {}: source not found", pair.source_path.display(), pair.dest_relative_path.display());
                    continue;
                };
                println!(
                    "{} -> {}: {} added, {} modified, {} deleted",
                    pair.source_path.display(),
                    pair.dest_relative_path.display(),
                    diff.added.len(),
                    diff.modified.len(),
                    diff.deleted.len()
                );
                for path in &diff.added {
                    println!("  + {}", path);
                }
                for path in &diff.modified {
                    println!("  ~ {}", path);
                }
                for path in &diff.deleted {
                    println!("  - {}", path);
                }
            }
            Ok(0)
        }

        Command::History { profile, limit } => {
            let runs = repository.recent_runs(*profile, *limit)?;
            if runs.is_empty() {
                println!("No runs recorded");
            }
            for run in &runs {
                println!(
                    "{}  profile {}  {:<14} +{} ~{} -{} !{}  {}{}",
                    run.started_at
                        .with_timezone(&chrono::Local)
                        .format("%Y-%m-%d %H:%M:%S"),
                    run.profile_id,
                    run.status.to_string(),
                    run.files_added,
                    run.files_modified,
                    run.files_deleted,
                    run.files_errored,
                    CliProgress::format_bytes(run.bytes_transferred),
                    if run.is_dry_run { "  (dry run)" } else { "" }
                );
            }
            Ok(0)
        }

        Command::Probe => {
            if engine.snapshots_available() {
                println!("Volume snapshots: available");
            } else {
                println!("Volume snapshots: unavailable (files are read live)");
            }
            Ok(0)
        }
    }
}

fn ensure_dir(path: &Path) -> anyhow::Result<()> {
    if !path.exists() {
        bail!("Directory does not exist: {}", path.display());
    }
    if !path.is_dir() {
        bail!("Not a directory: {}", path.display());
    }
    Ok(())
}

fn exit_code(status: RunStatus) -> i32 {
    match status {
        RunStatus::Success => 0,
        RunStatus::PartialSuccess | RunStatus::Cancelled => 1,
        RunStatus::Error | RunStatus::Running => 2,
    }
}

fn print_summary(run: &BackupRun, elapsed: Duration) {
    eprintln!();
    eprintln!("Backup {}{}", run.status, if run.is_dry_run { " (dry run)" } else { "" });
    eprintln!(
        "Summary: {} added, {} modified, {} deleted, {} failed",
        run.files_added, run.files_modified, run.files_deleted, run.files_errored
    );
    eprintln!("Bytes copied: {}", CliProgress::format_bytes(run.bytes_transferred));
    eprintln!("Elapsed: {}", CliProgress::format_duration(elapsed));

    if let Some(ref msg) = run.error_message {
        eprintln!("Error: {}", msg);
    }

    if run.files_errored > 0 {
        eprintln!();
        eprintln!("Failed files:");
        for entry in run.entries.iter().filter(|e| e.action == EntryAction::Error) {
            eprintln!(
                "  {}: {}",
                entry.relative_path,
                entry.error_detail.as_deref().unwrap_or("(unknown error)")
            );
        }
    }
}
