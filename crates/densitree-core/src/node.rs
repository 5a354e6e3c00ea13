//! File, directory, and package node types.

use compact_str::CompactString;
use serde::{Deserialize, Serialize};

/// Stable identifier for a node within a [`Tree`](crate::Tree) arena.
///
/// Slots are never reused while a tree is alive, so a stale `NodeId` can
/// never alias a different node; it simply resolves to nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeId(pub u64);

impl NodeId {
    /// Create a new NodeId from a u64.
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
}

/// Read state of a directory-like node.
///
/// `Queued` and `Reading` are transient; the other four are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReadState {
    /// A read job exists for this directory but has not run yet.
    Queued,
    /// A read job is currently populating this directory.
    Reading,
    /// Fully read.
    Finished,
    /// Deliberately not read (excluded, or a mount point with
    /// cross-filesystem reading disabled). Reading it again is an
    /// explicit user request.
    OnRequestOnly,
    /// Reading failed; children may be partial.
    Error,
    /// Reading was cancelled; children inserted before the abort remain.
    Aborted,
}

impl ReadState {
    /// Check if no further transition will happen without outside action.
    pub fn is_terminal(self) -> bool {
        !matches!(self, ReadState::Queued | ReadState::Reading)
    }
}

/// Directory payload: child links and read bookkeeping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirNode {
    /// Children in insertion order.
    pub children: Vec<NodeId>,
    /// Current read state.
    pub read_state: ReadState,
    /// Outstanding read jobs in this subtree, self included.
    pub pending_read_jobs: u32,
    /// Device id differs from the parent's.
    pub mount_point: bool,
    /// An exclude rule matched this directory.
    pub excluded: bool,
}

impl DirNode {
    fn new() -> Self {
        Self {
            children: Vec::new(),
            read_state: ReadState::Queued,
            pending_read_jobs: 0,
            mount_point: false,
            excluded: false,
        }
    }
}

impl Default for DirNode {
    fn default() -> Self {
        Self::new()
    }
}

/// Package identity attached to a `Pkg` node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PkgMeta {
    /// Name as known to the package manager.
    pub base_name: CompactString,
    /// Package version (may include the release part).
    pub version: CompactString,
    /// Target architecture; empty for arch-independent packages.
    pub arch: CompactString,
    /// Installed in more than one version.
    pub multi_version: bool,
    /// Installed for more than one architecture.
    pub multi_arch: bool,
}

/// Type of node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum NodeKind {
    /// Any non-directory: regular file, symlink, device, socket.
    File,
    /// Directory.
    Dir(DirNode),
    /// Synthetic directory representing an installed package.
    Pkg(DirNode, PkgMeta),
}

impl NodeKind {
    /// Check if this is a directory-like node (`Dir` or `Pkg`).
    pub fn is_dir(&self) -> bool {
        matches!(self, NodeKind::Dir(_) | NodeKind::Pkg(..))
    }

    /// Check if this is a plain file node.
    pub fn is_file(&self) -> bool {
        matches!(self, NodeKind::File)
    }

    /// Check if this is a package node.
    pub fn is_pkg(&self) -> bool {
        matches!(self, NodeKind::Pkg(..))
    }
}

/// A single node in the tree.
///
/// Every node carries the full stat-derived metadata set; nodes loaded
/// from a cache file or synthesized as error placeholders leave the
/// fields they cannot know at zero.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    /// Entry name. The top-level node's name is the full root path.
    pub name: CompactString,

    /// Node type and directory payload.
    pub kind: NodeKind,

    /// Size in bytes (own size, not a subtree aggregate).
    pub size: u64,

    /// Modification time, seconds since the epoch.
    pub mtime: i64,

    /// Permission bits and file type, as in `st_mode`.
    pub mode: u32,

    /// Owning user id.
    pub uid: u32,

    /// Owning group id.
    pub gid: u32,

    /// Device id of the filesystem holding this node.
    pub device: u64,

    /// Inode number.
    pub inode: u64,

    /// Hard link count.
    pub links: u64,

    pub(crate) parent: NodeId,
}

impl Node {
    /// Create a file node with zeroed metadata.
    pub fn file(name: impl Into<CompactString>) -> Self {
        Self::with_kind(name, NodeKind::File)
    }

    /// Create a directory node with zeroed metadata, state `Queued`.
    pub fn dir(name: impl Into<CompactString>) -> Self {
        Self::with_kind(name, NodeKind::Dir(DirNode::new()))
    }

    /// Create a package node; state `Queued` until its read job runs.
    pub fn pkg(name: impl Into<CompactString>, meta: PkgMeta) -> Self {
        Self::with_kind(name, NodeKind::Pkg(DirNode::new(), meta))
    }

    fn with_kind(name: impl Into<CompactString>, kind: NodeKind) -> Self {
        Self {
            name: name.into(),
            kind,
            size: 0,
            mtime: 0,
            mode: 0,
            uid: 0,
            gid: 0,
            device: 0,
            inode: 0,
            links: 0,
            parent: NodeId::new(0),
        }
    }

    /// Set the stat metadata in one go.
    pub fn with_stat(
        mut self,
        size: u64,
        mtime: i64,
        mode: u32,
        uid: u32,
        gid: u32,
        device: u64,
        inode: u64,
        links: u64,
    ) -> Self {
        self.size = size;
        self.mtime = mtime;
        self.mode = mode;
        self.uid = uid;
        self.gid = gid;
        self.device = device;
        self.inode = inode;
        self.links = links;
        self
    }

    /// Check if this node is directory-like.
    pub fn is_dir(&self) -> bool {
        self.kind.is_dir()
    }

    /// Check if this node is a plain file.
    pub fn is_file(&self) -> bool {
        self.kind.is_file()
    }

    /// Check if this node is a package.
    pub fn is_pkg(&self) -> bool {
        self.kind.is_pkg()
    }

    /// Directory payload, if any.
    pub fn as_dir(&self) -> Option<&DirNode> {
        match &self.kind {
            NodeKind::Dir(d) | NodeKind::Pkg(d, _) => Some(d),
            NodeKind::File => None,
        }
    }

    /// Mutable directory payload, if any.
    pub fn dir_mut(&mut self) -> Option<&mut DirNode> {
        match &mut self.kind {
            NodeKind::Dir(d) | NodeKind::Pkg(d, _) => Some(d),
            NodeKind::File => None,
        }
    }

    /// Package metadata, if any.
    pub fn pkg_meta(&self) -> Option<&PkgMeta> {
        match &self.kind {
            NodeKind::Pkg(_, m) => Some(m),
            _ => None,
        }
    }

    /// Read state; `None` for plain files.
    pub fn read_state(&self) -> Option<ReadState> {
        self.as_dir().map(|d| d.read_state)
    }

    /// Set the read state.
    ///
    /// `Aborted` has higher priority than `Finished`: a directory whose
    /// read was cancelled stays `Aborted` even if a late job completion
    /// tries to finish it.
    pub fn set_read_state(&mut self, new_state: ReadState) {
        if let Some(dir) = self.dir_mut() {
            if dir.read_state == ReadState::Aborted && new_state == ReadState::Finished {
                return;
            }
            dir.read_state = new_state;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_kind_discrimination() {
        assert!(Node::file("f").is_file());
        assert!(!Node::file("f").is_dir());
        assert!(Node::dir("d").is_dir());
        assert!(!Node::dir("d").is_file());

        let meta = PkgMeta {
            base_name: "foo".into(),
            version: "1.0".into(),
            arch: "amd64".into(),
            multi_version: false,
            multi_arch: false,
        };
        let pkg = Node::pkg("foo", meta);
        assert!(pkg.is_dir());
        assert!(pkg.is_pkg());
        assert_eq!(pkg.pkg_meta().unwrap().base_name, "foo");
    }

    #[test]
    fn test_with_stat() {
        let node = Node::file("f").with_stat(1024, 1_700_000_000, 0o100644, 1000, 1000, 42, 7, 2);
        assert_eq!(node.size, 1024);
        assert_eq!(node.mtime, 1_700_000_000);
        assert_eq!(node.mode, 0o100644);
        assert_eq!(node.device, 42);
        assert_eq!(node.inode, 7);
        assert_eq!(node.links, 2);
    }

    #[test]
    fn test_aborted_beats_finished() {
        let mut dir = Node::dir("d");
        dir.set_read_state(ReadState::Aborted);
        dir.set_read_state(ReadState::Finished);
        assert_eq!(dir.read_state(), Some(ReadState::Aborted));

        // Any other transition out of Aborted is allowed.
        dir.set_read_state(ReadState::Reading);
        assert_eq!(dir.read_state(), Some(ReadState::Reading));
    }

    #[test]
    fn test_terminal_states() {
        assert!(!ReadState::Queued.is_terminal());
        assert!(!ReadState::Reading.is_terminal());
        assert!(ReadState::Finished.is_terminal());
        assert!(ReadState::OnRequestOnly.is_terminal());
        assert!(ReadState::Error.is_terminal());
        assert!(ReadState::Aborted.is_terminal());
    }
}
