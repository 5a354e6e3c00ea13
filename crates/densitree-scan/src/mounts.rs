//! Mount-table lookup for cross-filesystem checks.

use std::path::{Path, PathBuf};

use sysinfo::Disks;
use tracing::debug;

use crate::sysutil::path_is_prefix_of;

/// One mounted filesystem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountPoint {
    /// Where the filesystem is mounted.
    pub path: PathBuf,
    /// Device string, e.g. `/dev/sda2` or `host:/export`.
    pub device: String,
}

/// A snapshot of the system's mount table.
///
/// The device *strings* found here complement the stat `dev` field:
/// two directories can report different `dev` ids yet sit on the same
/// device string (bind mounts, btrfs subvolumes), in which case the
/// boundary is not treated as a filesystem crossing.
#[derive(Debug, Clone, Default)]
pub struct MountTable {
    entries: Vec<MountPoint>,
}

impl MountTable {
    /// Read the current mount table from the system.
    pub fn from_system() -> Self {
        let disks = Disks::new_with_refreshed_list();
        let entries = disks
            .iter()
            .map(|d| MountPoint {
                path: d.mount_point().to_path_buf(),
                device: d.name().to_string_lossy().into_owned(),
            })
            .collect();
        let table = Self { entries };
        debug!("Mount table: {} entries", table.entries.len());
        table
    }

    /// Build a table from explicit entries.
    pub fn from_entries(entries: Vec<MountPoint>) -> Self {
        Self { entries }
    }

    /// The mount point holding `path`: the entry with the longest
    /// mount-path prefix of `path`.
    pub fn find_by_path(&self, path: &Path) -> Option<&MountPoint> {
        self.entries
            .iter()
            .filter(|m| path_is_prefix_of(&m.path, path))
            .max_by_key(|m| m.path.as_os_str().len())
    }

    /// Device string of the filesystem holding `path`.
    pub fn device_for(&self, path: &Path) -> Option<&str> {
        self.find_by_path(path).map(|m| m.device.as_str())
    }
}
