//! Local directory read jobs.

use std::ffi::OsString;
use std::fs::{self, Metadata};
use std::os::unix::fs::{DirEntryExt, MetadataExt};
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use densitree_core::{Node, NodeId, ReadState, ScanError, Tree};

use crate::cache::{CacheReadJob, CacheReader, DEFAULT_CACHE_NAME};
use crate::job::{finish_reading, JobKind, JobOutcome};
use crate::mounts::MountTable;
use crate::queue::JobQueue;

/// Build a node from lstat results.
pub(crate) fn node_from_metadata(name: &str, meta: &Metadata) -> Node {
    let node = if meta.is_dir() {
        Node::dir(name)
    } else {
        Node::file(name)
    };
    node.with_stat(
        meta.len(),
        meta.mtime(),
        meta.mode(),
        meta.uid(),
        meta.gid(),
        meta.dev(),
        meta.ino(),
        meta.nlink(),
    )
}

/// Reads one directory: stat every entry, enqueue child directory jobs,
/// watch for an embedded cache file.
#[derive(Debug)]
pub(crate) struct LocalDirJob {
    dir: NodeId,
    dir_name: PathBuf,
    apply_file_child_excludes: bool,
}

impl LocalDirJob {
    /// Create a job for `dir`; registers it in the pending-job chain.
    pub(crate) fn new(tree: &mut Tree, dir: NodeId, apply_file_child_excludes: bool) -> Self {
        tree.read_job_added(dir);
        Self {
            dir,
            dir_name: tree.url_of(dir),
            apply_file_child_excludes,
        }
    }

    pub(crate) fn dir(&self) -> NodeId {
        self.dir
    }

    /// Read the whole directory in one tick.
    pub(crate) fn run(&mut self, queue: &mut JobQueue, tree: &mut Tree) -> JobOutcome {
        let entries = match self.enumerate() {
            Ok(entries) => entries,
            Err(e) => {
                warn!("Cannot read directory {}: {e}", self.dir_name.display());
                finish_reading(tree, self.dir, ReadState::Error);
                return JobOutcome::Finished;
            }
        };

        tree.set_read_state(self.dir, ReadState::Reading);

        for (_ino, os_name) in entries {
            let name = os_name.to_string_lossy().into_owned();
            let full_path = self.dir_name.join(&os_name);

            let meta = match fs::symlink_metadata(&full_path) {
                Ok(meta) => meta,
                Err(e) => {
                    self.handle_stat_error(tree, &name, &e);
                    continue;
                }
            };

            if meta.is_dir() {
                let child = tree.insert_child(self.dir, node_from_metadata(&name, &meta));
                self.process_sub_dir(queue, tree, child);
            } else {
                if name == DEFAULT_CACHE_NAME {
                    debug!("Found cache file {}", full_path.display());
                    // On success the subtree was handed over to a cache
                    // job and this job no longer owns anything.
                    if let Some(outcome) = self.read_cache_file(queue, tree, &full_path) {
                        return outcome;
                    }
                }
                tree.insert_child(self.dir, node_from_metadata(&name, &meta));
            }
        }

        let mut read_state = ReadState::Finished;

        // Checked once per directory rather than per entry: with no
        // file-children rules configured this is a single cheap call.
        if self.apply_file_child_excludes && self.matches_file_child_rules(queue, tree) {
            self.exclude_dir_late(queue, tree);
            read_state = ReadState::OnRequestOnly;
        }

        finish_reading(tree, self.dir, read_state);
        JobOutcome::Finished
    }

    /// Collect the directory's entries, sorted by inode number.
    ///
    /// Filesystems lay inodes out roughly by number, so reading in
    /// i-number order minimizes seek cost on rotational media. Inode
    /// numbers repeat when a file is hard-linked twice into the same
    /// directory; the stable sort on a plain vector keeps every
    /// occurrence, where a map keyed by inode would silently drop them.
    fn enumerate(&self) -> Result<Vec<(u64, OsString)>, std::io::Error> {
        let mut entries: Vec<(u64, OsString)> = Vec::new();
        for entry in fs::read_dir(&self.dir_name)? {
            match entry {
                Ok(entry) => entries.push((entry.ino(), entry.file_name())),
                Err(e) => warn!("readdir in {}: {e}", self.dir_name.display()),
            }
        }
        entries.sort_by_key(|&(ino, _)| ino);
        Ok(entries)
    }

    /// Handle a freshly discovered subdirectory: exclude, recurse, or
    /// stop at the filesystem boundary.
    fn process_sub_dir(&mut self, queue: &mut JobQueue, tree: &mut Tree, child: NodeId) {
        let Some(node) = tree.node(child) else {
            return;
        };
        let name = node.name.clone();
        let full_path = tree.url_of(child);

        if queue.rules().match_path(&full_path.to_string_lossy(), &name) {
            debug!("Excluding {}", full_path.display());
            set_excluded(tree, child);
            finish_reading(tree, child, ReadState::OnRequestOnly);
        } else if !crossing_file_systems(tree, queue.mounts(), self.dir, child) {
            let job = LocalDirJob::new(tree, child, true);
            queue.enqueue_kind(tree, JobKind::Local(job));
        } else {
            // The subdirectory we just found is a mount point.
            set_mount_point(tree, child);

            if queue.options().cross_filesystems {
                let job = LocalDirJob::new(tree, child, true);
                queue.enqueue_kind(tree, JobKind::Local(job));
            } else {
                finish_reading(tree, child, ReadState::OnRequestOnly);
            }
        }
    }

    /// Try to replace this directory's scan with an embedded cache file.
    ///
    /// Returns `Some(Preempted)` when the cache matched: this job's
    /// subtree has been handed over (or the whole tree replaced) and its
    /// accounting is settled. `None` means: keep reading normally.
    fn read_cache_file(
        &self,
        queue: &mut JobQueue,
        tree: &mut Tree,
        cache_path: &Path,
    ) -> Option<JobOutcome> {
        let mut reader = match CacheReader::open(cache_path) {
            Ok(reader) => reader,
            Err(e) => {
                warn!("{e}");
                return None;
            }
        };

        if reader.first_dir().as_deref() != Some(self.dir_name.as_path()) {
            warn!(
                "NOT using cache file {} for {}",
                cache_path.display(),
                self.dir_name.display()
            );
            return None;
        }

        // first_dir() moved the read offset.
        if reader.rewind().is_err() {
            return None;
        }

        debug!(
            "Using cache file {} for {}",
            cache_path.display(),
            self.dir_name.display()
        );

        if tree.is_top_level(self.dir) {
            // Cache wins at the top level: partially read siblings go
            // with the rest of the tree.
            warn!("Replacing the whole tree from {}", cache_path.display());
            queue.clear_jobs(tree);
            tree.clear();
            let root = tree.root();
            let job = CacheReadJob::new(tree, root, reader);
            queue.enqueue_kind(tree, JobKind::Cache(job));
        } else {
            let parent = tree.parent(self.dir)?;
            let job = CacheReadJob::new(tree, parent, reader);
            queue.enqueue_kind(tree, JobKind::Cache(job));
            tree.set_read_state(parent, ReadState::Reading);

            // Clean up the partially read directory content. This job's
            // own pending count settles here; the queue must not touch
            // it again.
            queue.kill_all(tree, self.dir);
            tree.read_job_finished(self.dir);
            tree.delete_subtree(self.dir);
        }

        Some(JobOutcome::Preempted)
    }

    fn matches_file_child_rules(&self, queue: &JobQueue, tree: &Tree) -> bool {
        let rules = queue.rules();
        if rules.is_empty() {
            return false;
        }
        let names: Vec<&str> = tree
            .children(self.dir)
            .iter()
            .filter_map(|&c| tree.node(c))
            .filter(|n| !n.is_dir())
            .map(|n| n.name.as_str())
            .collect();
        rules.match_direct_children(&names)
    }

    /// A file-children rule fired: drop everything read so far.
    fn exclude_dir_late(&self, queue: &mut JobQueue, tree: &mut Tree) {
        debug!("Excluding dir {}", self.dir_name.display());
        queue.kill_all(tree, self.dir);
        tree.clear_subtree(self.dir);
        set_excluded(tree, self.dir);
    }

    /// Insert an almost empty placeholder so the entry still shows up.
    fn handle_stat_error(&self, tree: &mut Tree, name: &str, err: &std::io::Error) {
        warn!("lstat({}) failed: {err}", self.dir_name.join(name).display());

        let mut child = Node::dir(name);
        child.set_read_state(ReadState::Error);
        tree.insert_child(self.dir, child);
    }
}

fn set_excluded(tree: &mut Tree, dir: NodeId) {
    if let Some(d) = tree.node_mut(dir).and_then(|n| n.dir_mut()) {
        d.excluded = true;
    }
}

fn set_mount_point(tree: &mut Tree, dir: NodeId) {
    if let Some(d) = tree.node_mut(dir).and_then(|n| n.dir_mut()) {
        d.mount_point = true;
    }
}

/// Check if `child` lies on a different filesystem than `parent`.
///
/// The stat `dev` fields decide the common case. When they differ, the
/// mount-table device strings get the last word: a bind mount or btrfs
/// subvolume reports a new `dev` but the same underlying device, and
/// that is not a boundary worth stopping at.
pub(crate) fn crossing_file_systems(
    tree: &Tree,
    mounts: &MountTable,
    parent: NodeId,
    child: NodeId,
) -> bool {
    let parent_dev = tree.node(parent).map(|n| n.device).unwrap_or(0);
    let child_dev = tree.node(child).map(|n| n.device).unwrap_or(0);
    if parent_dev == child_dev {
        return false;
    }

    let child_url = tree.url_of(child);
    let child_device = mounts.device_for(&child_url).map(str::to_string);
    let parent_device = nearest_mount_point(tree, parent)
        .and_then(|id| mounts.device_for(&tree.url_of(id)).map(str::to_string))
        .or_else(|| tree.device_name().map(str::to_string));

    let crossing = match (&parent_device, &child_device) {
        (Some(p), Some(c)) => p != c,
        _ => true,
    };

    if crossing {
        info!(
            "File system boundary at mount point {} on device {}",
            child_url.display(),
            child_device.as_deref().unwrap_or("<unknown>")
        );
    } else {
        info!(
            "Mount point {} is still on the same device {}",
            child_url.display(),
            child_device.as_deref().unwrap_or("")
        );
    }

    crossing
}

/// Walk up from `start` to the closest node flagged as a mount point,
/// stopping at the top level.
fn nearest_mount_point(tree: &Tree, start: NodeId) -> Option<NodeId> {
    let mut current = start;
    loop {
        let node = tree.node(current)?;
        let is_mount = node.as_dir().is_some_and(|d| d.mount_point);
        if is_mount || tree.is_top_level(current) || current == tree.root() {
            return Some(current);
        }
        current = tree.parent(current)?;
    }
}

/// lstat a path and insert the result under `parent`.
///
/// Directories become `Dir` nodes, everything else `File`. A
/// non-top-level directory on a different device than its (non-package)
/// parent is flagged as a mount point. The caller decides whether a
/// failed lstat is fatal: queue-internal callers log and recover,
/// synchronous entry points propagate with `?`.
pub fn stat_and_insert(tree: &mut Tree, parent: NodeId, url: &Path) -> Result<NodeId, ScanError> {
    let meta = fs::symlink_metadata(url).map_err(|e| ScanError::sys_call("lstat", url, e))?;

    let name = if parent == tree.root() {
        url.to_string_lossy().into_owned()
    } else {
        url.file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| url.to_string_lossy().into_owned())
    };

    let id = tree.insert_child(parent, node_from_metadata(&name, &meta));

    if meta.is_dir() && !tree.is_top_level(id) {
        let parent_is_pkg = tree.node(parent).is_some_and(|n| n.is_pkg());
        let parent_dev = tree.node(parent).map(|n| n.device).unwrap_or(0);
        if !parent_is_pkg && meta.dev() != parent_dev {
            debug!("{} is a mount point", url.display());
            set_mount_point(tree, id);
        }
    }

    Ok(id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mounts::MountPoint;

    fn two_device_tree() -> (Tree, NodeId, NodeId) {
        let mut tree = Tree::new();
        let top = tree.insert_child(
            tree.root(),
            Node::dir("/t").with_stat(0, 0, 0, 0, 0, 100, 1, 1),
        );
        let child = tree.insert_child(top, Node::dir("m").with_stat(0, 0, 0, 0, 0, 200, 2, 1));
        tree.set_root_location(PathBuf::from("/t"), 100, Some("/dev/sda1".to_string()));
        (tree, top, child)
    }

    #[test]
    fn test_same_device_is_not_crossing() {
        let mut tree = Tree::new();
        let top = tree.insert_child(
            tree.root(),
            Node::dir("/t").with_stat(0, 0, 0, 0, 0, 100, 1, 1),
        );
        let child = tree.insert_child(top, Node::dir("a").with_stat(0, 0, 0, 0, 0, 100, 2, 1));
        assert!(!crossing_file_systems(
            &tree,
            &MountTable::default(),
            top,
            child
        ));
    }

    #[test]
    fn test_different_device_crosses() {
        let (tree, top, child) = two_device_tree();
        let mounts = MountTable::from_entries(vec![
            MountPoint {
                path: PathBuf::from("/t"),
                device: "/dev/sda1".to_string(),
            },
            MountPoint {
                path: PathBuf::from("/t/m"),
                device: "/dev/sdb1".to_string(),
            },
        ]);
        assert!(crossing_file_systems(&tree, &mounts, top, child));
    }

    #[test]
    fn test_same_device_string_is_a_bind_alias() {
        // dev ids differ but the mount table names the same device:
        // btrfs subvolume or bind mount, not a real boundary.
        let (tree, top, child) = two_device_tree();
        let mounts = MountTable::from_entries(vec![
            MountPoint {
                path: PathBuf::from("/t"),
                device: "/dev/sda1".to_string(),
            },
            MountPoint {
                path: PathBuf::from("/t/m"),
                device: "/dev/sda1".to_string(),
            },
        ]);
        assert!(!crossing_file_systems(&tree, &mounts, top, child));
    }

    #[test]
    fn test_unknown_devices_count_as_crossing() {
        let (tree, top, child) = two_device_tree();
        assert!(crossing_file_systems(
            &tree,
            &MountTable::default(),
            top,
            child
        ));
    }

    #[test]
    fn test_stat_and_insert_file_and_dir() {
        let temp = tempfile::tempdir().unwrap();
        std::fs::write(temp.path().join("f"), "data").unwrap();
        std::fs::create_dir(temp.path().join("d")).unwrap();

        let mut tree = Tree::new();
        let top = tree.insert_child(
            tree.root(),
            Node::dir(temp.path().to_string_lossy().as_ref()),
        );

        let file = stat_and_insert(&mut tree, top, &temp.path().join("f")).unwrap();
        assert!(tree.node(file).unwrap().is_file());
        assert_eq!(tree.node(file).unwrap().size, 4);
        assert_eq!(tree.node(file).unwrap().name, "f");

        let dir = stat_and_insert(&mut tree, top, &temp.path().join("d")).unwrap();
        assert!(tree.node(dir).unwrap().is_dir());
    }

    #[test]
    fn test_stat_and_insert_missing_path() {
        let mut tree = Tree::new();
        let top = tree.insert_child(tree.root(), Node::dir("/t"));
        let err = stat_and_insert(&mut tree, top, Path::new("/no/such/path")).unwrap_err();
        assert!(matches!(err, ScanError::SysCallFailed { call: "lstat", .. }));
    }
}
