//! Arena-backed file tree.

use std::path::PathBuf;

use crossbeam_channel::Receiver;
use tracing::{debug, error};

use crate::event::{EventHub, TreeEvent};
use crate::node::{Node, NodeId, ReadState};

/// The in-memory tree of scanned nodes.
///
/// The tree exclusively owns all nodes; read jobs and subscribers refer
/// to them by [`NodeId`]. The root is a virtual directory that is its
/// own parent; the first real node under it (the *top level*) carries
/// the full root path as its name.
#[derive(Debug)]
pub struct Tree {
    nodes: Vec<Option<Node>>,
    url: PathBuf,
    device: u64,
    device_name: Option<String>,
    events: EventHub,
}

impl Default for Tree {
    fn default() -> Self {
        Self::new()
    }
}

impl Tree {
    /// Create an empty tree containing only the virtual root.
    pub fn new() -> Self {
        let mut tree = Self {
            nodes: Vec::new(),
            url: PathBuf::new(),
            device: 0,
            device_name: None,
            events: EventHub::default(),
        };
        tree.reset_root();
        tree
    }

    fn reset_root(&mut self) {
        let mut root = Node::dir("");
        root.set_read_state(ReadState::Finished);
        self.nodes.clear();
        self.nodes.push(Some(root));
    }

    /// The virtual root.
    pub fn root(&self) -> NodeId {
        NodeId::new(0)
    }

    /// Subscribe to change notifications.
    pub fn subscribe(&mut self) -> Receiver<TreeEvent> {
        self.events.subscribe()
    }

    /// Emit an event to all subscribers.
    pub fn emit(&mut self, event: TreeEvent) {
        self.events.emit(event);
    }

    /// Root path of the current scan.
    pub fn url(&self) -> &PathBuf {
        &self.url
    }

    /// Record the root path and its device identity.
    pub fn set_root_location(&mut self, url: PathBuf, device: u64, device_name: Option<String>) {
        self.url = url;
        self.device = device;
        self.device_name = device_name;
    }

    /// Device id of the scan root.
    pub fn device(&self) -> u64 {
        self.device
    }

    /// Mount-table device string of the scan root, when known.
    pub fn device_name(&self) -> Option<&str> {
        self.device_name.as_deref()
    }

    /// Look up a node.
    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(id.index()).and_then(|slot| slot.as_ref())
    }

    /// Look up a node mutably.
    pub fn node_mut(&mut self, id: NodeId) -> Option<&mut Node> {
        self.nodes.get_mut(id.index()).and_then(|slot| slot.as_mut())
    }

    /// Number of live nodes, the virtual root included.
    pub fn node_count(&self) -> usize {
        self.nodes.iter().filter(|slot| slot.is_some()).count()
    }

    /// Parent of a node. The root is its own parent.
    pub fn parent(&self, id: NodeId) -> Option<NodeId> {
        self.node(id).map(|n| n.parent)
    }

    /// Children of a node, in insertion order. Empty for files.
    pub fn children(&self, id: NodeId) -> &[NodeId] {
        self.node(id)
            .and_then(|n| n.as_dir())
            .map(|d| d.children.as_slice())
            .unwrap_or(&[])
    }

    /// Find a direct child by name.
    pub fn find_child(&self, parent: NodeId, name: &str) -> Option<NodeId> {
        self.children(parent)
            .iter()
            .copied()
            .find(|&c| self.node(c).is_some_and(|n| n.name == name))
    }

    /// First child of the virtual root, if any.
    pub fn first_toplevel(&self) -> Option<NodeId> {
        self.children(self.root()).first().copied()
    }

    /// Check if a node sits directly under the virtual root.
    pub fn is_top_level(&self, id: NodeId) -> bool {
        id != self.root() && self.parent(id) == Some(self.root())
    }

    /// Check if `id` is `ancestor` or inside its subtree.
    pub fn is_in_subtree(&self, id: NodeId, ancestor: NodeId) -> bool {
        let mut current = id;
        loop {
            if current == ancestor {
                return true;
            }
            match self.parent(current) {
                Some(p) if p != current => current = p,
                _ => return false,
            }
        }
    }

    /// Full path of a node, assembled from the name chain.
    ///
    /// The top-level node carries the root path as its name, so joining
    /// the chain reproduces absolute paths; package trees yield paths
    /// under `Pkg:`.
    pub fn url_of(&self, id: NodeId) -> PathBuf {
        let mut names: Vec<&str> = Vec::new();
        let mut current = id;
        while current != self.root() {
            let Some(node) = self.node(current) else {
                break;
            };
            names.push(node.name.as_str());
            match self.parent(current) {
                Some(p) if p != current => current = p,
                _ => break,
            }
        }
        let mut path = PathBuf::new();
        for name in names.iter().rev() {
            path.push(name);
        }
        path
    }

    /// Insert `node` as the last child of `parent`.
    ///
    /// Emits `ChildAdded`. The child list keeps insertion order; a local
    /// directory read inserts in inode order, so that order is what
    /// subscribers observe.
    pub fn insert_child(&mut self, parent: NodeId, mut node: Node) -> NodeId {
        node.parent = parent;
        let id = self.alloc(node);
        match self.node_mut(parent).and_then(|n| n.dir_mut()) {
            Some(dir) => dir.children.push(id),
            None => error!(?parent, "insert_child: parent is not a directory"),
        }
        self.emit(TreeEvent::ChildAdded(id));
        id
    }

    fn alloc(&mut self, node: Node) -> NodeId {
        let id = NodeId::new(self.nodes.len() as u64);
        self.nodes.push(Some(node));
        id
    }

    /// Read state of a directory-like node.
    pub fn read_state(&self, id: NodeId) -> Option<ReadState> {
        self.node(id).and_then(|n| n.read_state())
    }

    /// Set the read state of a directory-like node.
    pub fn set_read_state(&mut self, id: NodeId, state: ReadState) {
        if let Some(node) = self.node_mut(id) {
            node.set_read_state(state);
        }
    }

    /// Register a new read job rooted at `dir`: bump the pending-job
    /// count of `dir` and every ancestor.
    pub fn read_job_added(&mut self, dir: NodeId) {
        self.for_each_ancestor(dir, |node| {
            if let Some(d) = node.dir_mut() {
                d.pending_read_jobs += 1;
            }
        });
    }

    /// Account for a disposed read job rooted at `dir`.
    pub fn read_job_finished(&mut self, dir: NodeId) {
        self.for_each_ancestor(dir, |node| {
            if let Some(d) = node.dir_mut() {
                if d.pending_read_jobs == 0 {
                    debug!("pending read job count underflow");
                } else {
                    d.pending_read_jobs -= 1;
                }
            }
        });
    }

    /// Mark `dir` and every ancestor `Aborted`.
    pub fn read_job_aborted(&mut self, dir: NodeId) {
        self.for_each_ancestor(dir, |node| {
            if let Some(d) = node.dir_mut() {
                d.read_state = ReadState::Aborted;
            }
        });
    }

    fn for_each_ancestor(&mut self, start: NodeId, mut f: impl FnMut(&mut Node)) {
        let mut current = start;
        loop {
            let Some(node) = self.node_mut(current) else {
                return;
            };
            f(node);
            let parent = node.parent;
            if parent == current {
                return;
            }
            current = parent;
        }
    }

    /// Outstanding read jobs in the subtree of `dir`.
    pub fn pending_read_jobs(&self, dir: NodeId) -> u32 {
        self.node(dir)
            .and_then(|n| n.as_dir())
            .map(|d| d.pending_read_jobs)
            .unwrap_or(0)
    }

    /// Check if reading is still going on in the subtree of `dir`.
    pub fn is_busy(&self, dir: NodeId) -> bool {
        let Some(d) = self.node(dir).and_then(|n| n.as_dir()) else {
            return false;
        };
        if d.pending_read_jobs > 0 && d.read_state != ReadState::Aborted {
            return true;
        }
        matches!(d.read_state, ReadState::Reading | ReadState::Queued)
    }

    /// Emit `FinalizeLocal` for a directory about to go terminal.
    pub fn send_finalize_local(&mut self, dir: NodeId) {
        self.emit(TreeEvent::FinalizeLocal(dir));
    }

    /// Emit `ReadJobFinished` for a directory that just went terminal.
    pub fn send_read_job_finished(&mut self, dir: NodeId) {
        self.emit(TreeEvent::ReadJobFinished(dir));
    }

    /// Ids of the subtree rooted at `id`, depth first, `id` included.
    pub fn subtree_ids(&self, id: NodeId) -> Vec<NodeId> {
        let mut result = Vec::new();
        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            if self.node(current).is_none() {
                continue;
            }
            result.push(current);
            for &child in self.children(current).iter().rev() {
                stack.push(child);
            }
        }
        result
    }

    /// Total byte size of the subtree, the node's own size included.
    pub fn total_size(&self, id: NodeId) -> u64 {
        self.subtree_ids(id)
            .iter()
            .filter_map(|&n| self.node(n))
            .map(|n| n.size)
            .sum()
    }

    /// Number of items in the subtree, the node itself excluded.
    pub fn total_items(&self, id: NodeId) -> usize {
        self.subtree_ids(id).len().saturating_sub(1)
    }

    /// Number of plain files in the subtree.
    pub fn total_files(&self, id: NodeId) -> usize {
        self.subtree_ids(id)
            .iter()
            .filter_map(|&n| self.node(n))
            .filter(|n| n.is_file())
            .count()
    }

    /// Number of directories in the subtree, the node itself excluded.
    pub fn total_subdirs(&self, id: NodeId) -> usize {
        self.subtree_ids(id)
            .iter()
            .skip(1)
            .filter_map(|&n| self.node(n))
            .filter(|n| n.is_dir())
            .count()
    }

    /// Delete the subtree rooted at `id`.
    ///
    /// Emits `DeletingChild(id)` first; all read jobs bound inside the
    /// subtree must have been killed before this is called.
    pub fn delete_subtree(&mut self, id: NodeId) {
        if id == self.root() || self.node(id).is_none() {
            return;
        }
        self.emit(TreeEvent::DeletingChild(id));

        if let Some(parent) = self.parent(id) {
            if let Some(dir) = self.node_mut(parent).and_then(|n| n.dir_mut()) {
                dir.children.retain(|&c| c != id);
            }
        }
        for node_id in self.subtree_ids(id) {
            self.nodes[node_id.index()] = None;
        }
    }

    /// Delete all children of `dir`, keeping `dir` itself.
    pub fn clear_subtree(&mut self, dir: NodeId) {
        let children: Vec<NodeId> = self.children(dir).to_vec();
        for child in children {
            self.delete_subtree(child);
        }
    }

    /// Drop everything and start over with a fresh virtual root.
    ///
    /// Subscribers stay attached; the recorded root location stays.
    pub fn clear(&mut self) {
        self.emit(TreeEvent::Clearing);
        self.reset_root();
    }
}
