//! Incremental diff between a source tree and its last known snapshot set.
//!
//! A file is classified by relative path (case-insensitive):
//! - not in the snapshot set: added
//! - in the set with a different size, or a modification time more than
//!   two seconds away from the recorded one: modified
//! - in the set but not found on disk: deleted
//!
//! Unreadable entries never abort the scan. A directory that cannot be listed
//! only loses its own subtree; a file whose metadata cannot be read is left
//! out of the lists but still counts as present.

use crate::checksums::{self, ChecksumAlgorithm};
use crate::error::Result;
use crate::model::{path_key, BackupPair, FileSnapshot};
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::Path;
use tracing::debug;
use walkdir::{DirEntry, WalkDir};

/// Timestamps closer than this are considered equal (FAT/exFAT have 2 s granularity).
pub const MTIME_TOLERANCE_MS: i64 = 2000;

/// Changes found in one pair's source tree. Lists keep scan order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiffResult {
    pub added: Vec<String>,
    pub modified: Vec<String>,
    pub deleted: Vec<String>,
}

impl DiffResult {
    pub fn total_changes(&self) -> usize {
        self.added.len() + self.modified.len() + self.deleted.len()
    }

    pub fn has_changes(&self) -> bool {
        self.total_changes() > 0
    }
}

/// Compare `source_root` against `snapshots` for `pair`.
pub fn compute(source_root: &Path, snapshots: &[FileSnapshot], pair: &BackupPair) -> DiffResult {
    let mut diff = DiffResult::default();

    if !source_root.is_dir() {
        diff.deleted = snapshots.iter().map(|s| s.relative_path.clone()).collect();
        return diff;
    }

    let index: HashMap<String, &FileSnapshot> = snapshots.iter().map(|s| (s.key(), s)).collect();
    let mut found: HashSet<String> = HashSet::new();

    let walker = WalkDir::new(source_root)
        .follow_links(false)
        .min_depth(1)
        .into_iter()
        .filter_entry(|entry| !is_entry_excluded(source_root, entry, pair));

    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                debug!(error = %e, "skipping unreadable entry");
                continue;
            }
        };
        if entry.file_type().is_dir() {
            continue;
        }

        let relative = relative_path(source_root, entry.path());

        if entry.file_type().is_symlink() {
            // Only links to regular files are backed up, as the file they point to.
            match fs::metadata(entry.path()) {
                Ok(target) if target.is_file() => {}
                _ => continue,
            }
        }

        found.insert(path_key(&relative));

        let Some((size, modified)) = read_size_and_mtime(entry.path()) else {
            debug!(path = %relative, "cannot read metadata, leaving file as is");
            continue;
        };

        match index.get(&path_key(&relative)) {
            None => diff.added.push(relative),
            Some(snapshot) if is_changed(snapshot, size, modified) => diff.modified.push(relative),
            Some(_) => {}
        }
    }

    diff.deleted = snapshots
        .iter()
        .filter(|s| !found.contains(&s.key()))
        .filter(|s| !is_path_excluded(pair, &s.relative_path))
        .map(|s| s.relative_path.clone())
        .collect();

    diff
}

/// Has a file changed relative to its snapshot?
pub fn is_changed(snapshot: &FileSnapshot, size: u64, modified: DateTime<Utc>) -> bool {
    size != snapshot.size
        || (modified - snapshot.last_modified).num_milliseconds().abs() > MTIME_TOLERANCE_MS
}

/// Streamed digest of a file's full contents, as lowercase hex.
pub fn content_hash(path: &Path, algorithm: ChecksumAlgorithm) -> Result<String> {
    Ok(checksums::compute_file_checksum(path, algorithm)?.hex().to_string())
}

/// Size and modification time of the file at `path` (links followed).
pub fn read_size_and_mtime(path: &Path) -> Option<(u64, DateTime<Utc>)> {
    let metadata = fs::metadata(path).ok()?;
    let modified = metadata.modified().ok()?;
    Some((metadata.len(), DateTime::<Utc>::from(modified)))
}

fn relative_path(root: &Path, path: &Path) -> String {
    path.strip_prefix(root)
        .unwrap_or(path)
        .to_string_lossy()
        .into_owned()
}

fn is_entry_excluded(root: &Path, entry: &DirEntry, pair: &BackupPair) -> bool {
    let relative = relative_path(root, entry.path());
    !relative.is_empty() && pair.is_excluded(&relative)
}

// A tracked path is excluded if it, or any directory above it, matches.
fn is_path_excluded(pair: &BackupPair, relative_path: &str) -> bool {
    let mut prefix = std::path::PathBuf::new();
    Path::new(relative_path).components().any(|component| {
        prefix.push(component);
        pair.is_excluded(&prefix.to_string_lossy())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, SystemTime};

    fn pair() -> BackupPair {
        BackupPair::new(1, "/unused", "dst")
    }

    fn snapshot_of(root: &Path, relative: &str) -> FileSnapshot {
        let (size, modified) = read_size_and_mtime(&root.join(relative)).expect("metadata");
        FileSnapshot {
            profile_id: 1,
            pair_id: 1,
            relative_path: relative.to_string(),
            size,
            last_modified: modified,
            hash: None,
        }
    }

    fn set_mtime(path: &Path, time: SystemTime) {
        filetime::set_file_mtime(path, filetime::FileTime::from_system_time(time)).unwrap();
    }

    #[test]
    fn test_first_scan_with_exclusion() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let src = temp_dir.path();
        fs::write(src.join("a.txt"), vec![b'a'; 100]).unwrap();
        fs::write(src.join("b.tmp"), vec![b'b'; 50]).unwrap();

        let pair = pair().with_excludes(["*.tmp"]);
        let diff = compute(src, &[], &pair);

        assert_eq!(diff.added, vec!["a.txt".to_string()]);
        assert!(diff.modified.is_empty());
        assert!(diff.deleted.is_empty());
    }

    #[test]
    fn test_missing_source_deletes_everything() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let snapshots = vec![
            FileSnapshot {
                profile_id: 1,
                pair_id: 1,
                relative_path: "x.txt".into(),
                size: 1,
                last_modified: Utc::now(),
                hash: None,
            },
            FileSnapshot {
                profile_id: 1,
                pair_id: 1,
                relative_path: "sub/y.txt".into(),
                size: 2,
                last_modified: Utc::now(),
                hash: None,
            },
        ];

        let diff = compute(&temp_dir.path().join("gone"), &snapshots, &pair());
        assert!(diff.added.is_empty());
        assert_eq!(diff.deleted, vec!["x.txt".to_string(), "sub/y.txt".to_string()]);
    }

    #[test]
    fn test_unchanged_files_produce_no_entries() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let src = temp_dir.path();
        fs::create_dir(src.join("sub")).unwrap();
        fs::write(src.join("a.txt"), b"one").unwrap();
        fs::write(src.join("sub").join("b.txt"), b"two").unwrap();

        let rel_b = Path::new("sub").join("b.txt").to_string_lossy().into_owned();
        let snapshots = vec![snapshot_of(src, "a.txt"), snapshot_of(src, &rel_b)];

        let diff = compute(src, &snapshots, &pair());
        assert!(!diff.has_changes(), "unexpected diff: {:?}", diff);
    }

    #[test]
    fn test_size_change_is_modified() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let src = temp_dir.path();
        fs::write(src.join("a.txt"), b"short").unwrap();
        let snapshots = vec![snapshot_of(src, "a.txt")];

        let mtime = fs::metadata(src.join("a.txt")).unwrap().modified().unwrap();
        fs::write(src.join("a.txt"), b"much longer now").unwrap();
        set_mtime(&src.join("a.txt"), mtime);

        let diff = compute(src, &snapshots, &pair());
        assert_eq!(diff.modified, vec!["a.txt".to_string()]);
    }

    #[test]
    fn test_mtime_tolerance() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let src = temp_dir.path();
        let file = src.join("a.txt");
        fs::write(&file, b"same size").unwrap();
        let base = SystemTime::now() - Duration::from_secs(600);
        set_mtime(&file, base);
        let snapshots = vec![snapshot_of(src, "a.txt")];

        set_mtime(&file, base + Duration::from_millis(1500));
        assert!(!compute(src, &snapshots, &pair()).has_changes());

        set_mtime(&file, base + Duration::from_secs(3));
        assert_eq!(compute(src, &snapshots, &pair()).modified, vec!["a.txt".to_string()]);
    }

    #[test]
    fn test_removed_file_is_deleted() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let src = temp_dir.path();
        fs::write(src.join("keep.txt"), b"k").unwrap();
        fs::write(src.join("drop.txt"), b"d").unwrap();
        let snapshots = vec![snapshot_of(src, "keep.txt"), snapshot_of(src, "drop.txt")];
        fs::remove_file(src.join("drop.txt")).unwrap();

        let diff = compute(src, &snapshots, &pair());
        assert_eq!(diff.deleted, vec!["drop.txt".to_string()]);
        assert!(diff.added.is_empty());
    }

    #[test]
    fn test_lookup_is_case_insensitive() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let src = temp_dir.path();
        fs::write(src.join("Report.PDF"), b"pdf").unwrap();
        let mut snapshot = snapshot_of(src, "Report.PDF");
        snapshot.relative_path = "report.pdf".into();

        let diff = compute(src, &[snapshot], &pair());
        assert!(!diff.has_changes(), "unexpected diff: {:?}", diff);
    }

    #[test]
    fn test_excluded_directory_is_pruned() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let src = temp_dir.path();
        fs::create_dir_all(src.join("node_modules").join("pkg")).unwrap();
        fs::write(src.join("node_modules").join("pkg").join("index.js"), b"js").unwrap();
        fs::write(src.join("main.rs"), b"fn main() {}").unwrap();

        let pair = pair().with_excludes(["node_modules"]);
        let diff = compute(src, &[], &pair);
        assert_eq!(diff.added, vec!["main.rs".to_string()]);
    }

    #[test]
    fn test_excluded_snapshot_is_never_deleted() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let src = temp_dir.path();
        fs::write(src.join("b.tmp"), b"tmp").unwrap();
        let snapshots = vec![snapshot_of(src, "b.tmp")];
        fs::remove_file(src.join("b.tmp")).unwrap();

        let diff = compute(src, &snapshots, &pair().with_excludes(["*.TMP"]));
        assert!(!diff.has_changes());
    }

    #[test]
    fn test_empty_source_has_no_changes() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let diff = compute(temp_dir.path(), &[], &pair());
        assert_eq!(diff, DiffResult::default());
    }

    #[cfg(unix)]
    #[test]
    fn test_unreadable_directory_only_skips_its_subtree() {
        use std::os::unix::fs::PermissionsExt;

        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let src = temp_dir.path();
        let locked = src.join("locked");
        fs::create_dir(&locked).unwrap();
        fs::write(locked.join("secret.txt"), b"s").unwrap();
        fs::write(src.join("open.txt"), b"o").unwrap();
        fs::set_permissions(&locked, fs::Permissions::from_mode(0o000)).unwrap();

        // Privileged users read through mode 000; nothing to exercise then.
        if fs::read_dir(&locked).is_ok() {
            fs::set_permissions(&locked, fs::Permissions::from_mode(0o755)).unwrap();
            return;
        }

        let diff = compute(src, &[], &pair());
        fs::set_permissions(&locked, fs::Permissions::from_mode(0o755)).unwrap();

        assert_eq!(diff.added, vec!["open.txt".to_string()]);
        assert!(!diff.added.iter().any(|p| p.contains("secret.txt")));
    }

    #[test]
    fn test_content_hash_is_md5_hex() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let file = temp_dir.path().join("h.txt");
        fs::write(&file, b"hello").unwrap();
        assert_eq!(
            content_hash(&file, ChecksumAlgorithm::Md5).unwrap(),
            "5d41402abc4b2a76b9719d911017c592"
        );
    }
}
