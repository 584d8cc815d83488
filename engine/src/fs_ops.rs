//! Filesystem operations module.
//!
//! This module provides low-level operations for:
//! - Streaming file copies with shared-read sources and modification time preservation
//! - Mirror deletion with empty-directory pruning
//! - The dated recycle bin (`.winback_recycle/<yyyy-MM-dd>/...`) and its retention purge
//! - Volume root resolution for snapshot translation

use crate::error::{EngineError, Result};
use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Component, Path, PathBuf};
use tracing::debug;

/// Name of the recycle folder inside a pair's destination directory.
pub const RECYCLE_DIR_NAME: &str = ".winback_recycle";

/// Date format of the per-day recycle folders.
pub const RECYCLE_DATE_FORMAT: &str = "%Y-%m-%d";

const COPY_BUFFER: usize = 1024 * 1024;

#[cfg(windows)]
const FILE_SHARE_READ: u32 = 0x0000_0001;
#[cfg(windows)]
const FILE_SHARE_WRITE: u32 = 0x0000_0002;

/// Open a file for reading while letting other processes keep reading and writing it.
pub fn open_shared_read(path: &Path) -> io::Result<File> {
    let mut options = OpenOptions::new();
    options.read(true);
    #[cfg(windows)]
    {
        use std::os::windows::fs::OpenOptionsExt;
        options.share_mode(FILE_SHARE_READ | FILE_SHARE_WRITE);
    }
    options.open(path)
}

/// Create (or truncate) a file with exclusive access for the duration of the write.
pub fn create_exclusive_write(path: &Path) -> io::Result<File> {
    let mut options = OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(windows)]
    {
        use std::os::windows::fs::OpenOptionsExt;
        options.share_mode(0);
    }
    options.open(path)
}

/// Copy a file from source to destination, preserving its modification time.
///
/// The copy is streamed through a 1 MB buffer. The parent directory of `dst`
/// is created if needed.
///
/// # Returns
/// Number of bytes copied
pub fn copy_file_with_metadata(src: &Path, dst: &Path) -> Result<u64> {
    ensure_parent_dir_exists(dst)?;

    let src_file = open_shared_read(src).map_err(|e| EngineError::ReadError {
        path: src.to_path_buf(),
        source: e,
    })?;
    let src_mtime = src_file.metadata().and_then(|m| m.modified()).ok();

    let dst_file = create_exclusive_write(dst).map_err(|e| EngineError::WriteError {
        path: dst.to_path_buf(),
        source: e,
    })?;

    let mut reader = BufReader::with_capacity(COPY_BUFFER, src_file);
    let mut writer = BufWriter::with_capacity(COPY_BUFFER, dst_file);

    let bytes_copied = io::copy(&mut reader, &mut writer).map_err(|e| {
        if e.kind() == io::ErrorKind::PermissionDenied {
            EngineError::WriteError {
                path: dst.to_path_buf(),
                source: e,
            }
        } else {
            EngineError::ReadError {
                path: src.to_path_buf(),
                source: e,
            }
        }
    })?;

    writer.flush().map_err(|e| EngineError::WriteError {
        path: dst.to_path_buf(),
        source: e,
    })?;
    drop(writer);

    if let Some(mtime) = src_mtime {
        if let Err(e) = filetime::set_file_mtime(dst, filetime::FileTime::from_system_time(mtime)) {
            debug!(path = %dst.display(), error = %e, "could not preserve modification time");
        }
    }

    Ok(bytes_copied)
}

/// Ensure the parent directory of a path exists, creating it if necessary.
pub fn ensure_parent_dir_exists(path: &Path) -> Result<()> {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => ensure_dir_exists(parent),
        _ => Ok(()),
    }
}

/// Ensure a directory exists, creating it and all of its ancestors if necessary.
pub fn ensure_dir_exists(dir: &Path) -> Result<()> {
    match fs::metadata(dir) {
        Ok(metadata) if metadata.is_dir() => Ok(()),
        Ok(_) => Err(EngineError::DirectoryCreationFailed {
            path: dir.to_path_buf(),
            source: io::Error::new(
                io::ErrorKind::InvalidInput,
                "Path exists but is not a directory",
            ),
        }),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            fs::create_dir_all(dir).map_err(|e| EngineError::DirectoryCreationFailed {
                path: dir.to_path_buf(),
                source: e,
            })
        }
        Err(e) => Err(EngineError::DirectoryCreationFailed {
            path: dir.to_path_buf(),
            source: e,
        }),
    }
}

/// Delete `file` if present, then remove empty ancestors up to (excluding) `root`.
pub fn remove_and_prune(root: &Path, file: &Path) -> Result<()> {
    if !file.exists() {
        return Ok(());
    }

    fs::remove_file(file).map_err(|e| EngineError::DeleteFailed {
        path: file.to_path_buf(),
        source: e,
    })?;

    if let Some(parent) = file.parent() {
        prune_empty_dirs(root, parent);
    }
    Ok(())
}

/// Remove `dir` and its ancestors while they are empty, stopping at `root`.
///
/// Best effort: stops at the first directory that is non-empty or cannot be removed.
pub fn prune_empty_dirs(root: &Path, dir: &Path) {
    let mut current = dir.to_path_buf();

    while current != root && current.starts_with(root) {
        let is_empty = match fs::read_dir(&current) {
            Ok(mut entries) => entries.next().is_none(),
            Err(_) => false,
        };
        if !is_empty || fs::remove_dir(&current).is_err() {
            break;
        }
        match current.parent() {
            Some(parent) => current = parent.to_path_buf(),
            None => break,
        }
    }
}

/// Location a deleted file is moved to under the recycle bin.
pub fn recycle_path(pair_root: &Path, relative_path: &str, date: NaiveDate) -> PathBuf {
    pair_root
        .join(RECYCLE_DIR_NAME)
        .join(date.format(RECYCLE_DATE_FORMAT).to_string())
        .join(relative_path)
}

/// Move a destination file into the dated recycle folder, replacing any same-named entry.
///
/// Does nothing if `file` does not exist. Returns the recycle path when a move happened.
pub fn move_to_recycle_bin(
    pair_root: &Path,
    file: &Path,
    relative_path: &str,
    date: NaiveDate,
) -> Result<Option<PathBuf>> {
    if !file.exists() {
        return Ok(None);
    }

    let target = recycle_path(pair_root, relative_path, date);
    ensure_parent_dir_exists(&target)?;

    if target.is_file() {
        fs::remove_file(&target).map_err(|e| EngineError::DeleteFailed {
            path: target.clone(),
            source: e,
        })?;
    }

    fs::rename(file, &target).map_err(|e| EngineError::DeleteFailed {
        path: file.to_path_buf(),
        source: e,
    })?;

    Ok(Some(target))
}

/// Delete dated recycle folders older than `retention_days` before `now`.
///
/// Folders whose name does not parse as a date are left alone, as are folders
/// that fail to delete. Returns the number of folders removed.
pub fn purge_recycle_bin(pair_root: &Path, retention_days: u32, now: NaiveDateTime) -> usize {
    let recycle_root = pair_root.join(RECYCLE_DIR_NAME);
    let entries = match fs::read_dir(&recycle_root) {
        Ok(entries) => entries,
        Err(_) => return 0,
    };

    // A retention reaching past the earliest representable date keeps everything.
    let Some(cutoff) = chrono::Duration::try_days(i64::from(retention_days))
        .and_then(|retention| now.checked_sub_signed(retention))
    else {
        return 0;
    };
    let mut purged = 0;

    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        let name = entry.file_name();
        let Ok(date) = NaiveDate::parse_from_str(&name.to_string_lossy(), RECYCLE_DATE_FORMAT) else {
            continue;
        };

        if date.and_time(NaiveTime::MIN) < cutoff {
            match fs::remove_dir_all(&path) {
                Ok(()) => purged += 1,
                Err(e) => debug!(path = %path.display(), error = %e, "recycle purge skipped folder"),
            }
        }
    }

    purged
}

/// Root of the volume holding `path`: `C:\` on Windows, `/` on Unix.
///
/// Falls back to `path` itself when it has no prefix or root.
pub fn volume_root(path: &Path) -> PathBuf {
    let mut root = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Prefix(prefix) => root.push(prefix.as_os_str()),
            Component::RootDir => {
                root.push(component.as_os_str());
                return root;
            }
            _ => break,
        }
    }

    if root.as_os_str().is_empty() {
        path.to_path_buf()
    } else {
        root
    }
}
