//! Point-in-time volume snapshots for reading files held open by other processes.
//!
//! Snapshots are a soft capability: a provider may be missing, lack privileges,
//! or fail for any reason, and every such case becomes "unavailable" (`None`).
//! Callers then read from the live path instead.
//!
//! A [`VssSession`] lives for exactly one backup run. It creates at most one
//! snapshot per volume, lazily, and releases all of them when dropped.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

/// A frozen image of one volume.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeSnapshot {
    id: String,
    device_root: PathBuf,
}

impl VolumeSnapshot {
    pub fn new(id: impl Into<String>, device_root: impl Into<PathBuf>) -> Self {
        VolumeSnapshot {
            id: id.into(),
            device_root: device_root.into(),
        }
    }

    /// Provider-level identifier, used for release.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Root of the frozen image, e.g. `\\?\GLOBALROOT\Device\HarddiskVolumeShadowCopy3\`.
    pub fn device_root(&self) -> &Path {
        &self.device_root
    }

    /// Map a live absolute path to the same file inside the frozen image.
    ///
    /// Paths outside `volume_root` are returned unchanged.
    pub fn translate_path(&self, live_path: &Path, volume_root: &Path) -> PathBuf {
        match live_path.strip_prefix(volume_root) {
            Ok(relative) => self.device_root.join(relative),
            Err(_) => live_path.to_path_buf(),
        }
    }
}

/// A source of volume snapshots.
///
/// Implementations must never panic and never report failure other than by
/// returning `false` / `None`.
pub trait SnapshotProvider: Send + Sync {
    /// Whether the snapshot service is usable at all on this system.
    fn probe(&self) -> bool;

    /// Create a snapshot of the volume mounted at `volume_root`.
    fn create(&self, volume_root: &Path) -> Option<VolumeSnapshot>;

    /// Tear a snapshot down. Errors are swallowed.
    fn release(&self, snapshot: &VolumeSnapshot);
}

/// Provider for systems without a snapshot service.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoSnapshots;

impl SnapshotProvider for NoSnapshots {
    fn probe(&self) -> bool {
        false
    }

    fn create(&self, _volume_root: &Path) -> Option<VolumeSnapshot> {
        None
    }

    fn release(&self, _snapshot: &VolumeSnapshot) {}
}

/// The platform's snapshot provider.
pub fn default_provider() -> Arc<dyn SnapshotProvider> {
    #[cfg(windows)]
    {
        Arc::new(shadow_copy::ShadowCopyProvider::default())
    }
    #[cfg(not(windows))]
    {
        Arc::new(NoSnapshots)
    }
}

/// Per-run cache of volume snapshots.
pub struct VssSession {
    provider: Arc<dyn SnapshotProvider>,
    snapshots: HashMap<String, Option<VolumeSnapshot>>,
}

impl VssSession {
    pub fn new(provider: Arc<dyn SnapshotProvider>) -> Self {
        VssSession {
            provider,
            snapshots: HashMap::new(),
        }
    }

    /// Snapshot for `volume_root`, creating it on first request.
    ///
    /// An unavailable result is cached too: the provider is asked once per volume.
    pub fn get_or_create(&mut self, volume_root: &Path) -> Option<&VolumeSnapshot> {
        let key = volume_key(volume_root);
        let provider = &self.provider;
        self.snapshots
            .entry(key)
            .or_insert_with(|| {
                let snapshot = provider.create(volume_root);
                match &snapshot {
                    Some(s) => debug!(volume = %volume_root.display(), id = s.id(), "volume snapshot created"),
                    None => warn!(volume = %volume_root.display(), "volume snapshot unavailable, copying live files"),
                }
                snapshot
            })
            .as_ref()
    }

    /// Number of snapshots actually created (unavailable volumes excluded).
    pub fn created_count(&self) -> usize {
        self.snapshots.values().filter(|s| s.is_some()).count()
    }
}

impl Drop for VssSession {
    fn drop(&mut self) {
        for snapshot in self.snapshots.drain().filter_map(|(_, s)| s) {
            debug!(id = snapshot.id(), "releasing volume snapshot");
            self.provider.release(&snapshot);
        }
    }
}

fn volume_key(volume_root: &Path) -> String {
    volume_root
        .to_string_lossy()
        .trim_end_matches(['\\', '/'])
        .to_uppercase()
}

#[cfg(windows)]
pub mod shadow_copy {
    //! Volume Shadow Copy through the `Win32_ShadowCopy` WMI class.
    //!
    //! Requires administrator rights; without them `create` returns `None`.

    use super::{SnapshotProvider, VolumeSnapshot};
    use std::path::{Path, PathBuf};
    use std::process::{Command, Stdio};
    use tracing::debug;

    #[derive(Debug, Default, Clone, Copy)]
    pub struct ShadowCopyProvider;

    fn powershell(script: &str) -> Option<String> {
        let output = Command::new("powershell")
            .args(["-NoProfile", "-NonInteractive", "-Command", script])
            .stdin(Stdio::null())
            .output()
            .ok()?;
        if !output.status.success() {
            debug!(stderr = %String::from_utf8_lossy(&output.stderr), "powershell failed");
            return None;
        }
        Some(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    // Shadow ids are GUIDs; anything else is refused before it reaches a script.
    fn is_shadow_id(id: &str) -> bool {
        !id.is_empty() && id.chars().all(|c| c.is_ascii_hexdigit() || matches!(c, '{' | '}' | '-'))
    }

    impl SnapshotProvider for ShadowCopyProvider {
        fn probe(&self) -> bool {
            powershell("Get-WmiObject Win32_ShadowCopy | Out-Null").is_some()
        }

        fn create(&self, volume_root: &Path) -> Option<VolumeSnapshot> {
            let volume = format!("{}\\", volume_root.to_string_lossy().trim_end_matches('\\'));
            if volume.contains('\'') {
                return None;
            }
            let script = format!(
                "$r = ([WMICLASS]'root\\cimv2:Win32_ShadowCopy').Create('{volume}', 'ClientAccessible'); \
                 if ($r.ReturnValue -ne 0) {{ exit 1 }}; \
                 $s = Get-WmiObject Win32_ShadowCopy | Where-Object {{ $_.ID -eq $r.ShadowID }}; \
                 Write-Output $r.ShadowID; Write-Output $s.DeviceObject"
            );

            let stdout = powershell(&script)?;
            let mut lines = stdout.lines().map(str::trim).filter(|l| !l.is_empty());
            let id = lines.next()?.to_string();
            let device = lines.next()?;
            if !is_shadow_id(&id) || device.is_empty() {
                return None;
            }

            let device_root = PathBuf::from(format!("{}\\", device.trim_end_matches('\\')));
            Some(VolumeSnapshot::new(id, device_root))
        }

        fn release(&self, snapshot: &VolumeSnapshot) {
            if !is_shadow_id(snapshot.id()) {
                return;
            }
            let script = format!(
                "Get-WmiObject Win32_ShadowCopy | Where-Object {{ $_.ID -eq '{}' }} | ForEach-Object {{ $_.Delete() }}",
                snapshot.id()
            );
            let _ = powershell(&script);
        }
    }
}
