//! Shadow tree of access observations for proof construction.

use std::sync::{Arc, Mutex, Weak};

use super::{Cell, CellImpl, HashBytes, MAX_REF_COUNT};
use crate::error::Error;

/// Usage tree builder mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsageTreeMode {
    /// A cell is marked as used when it is dereferenced.
    OnLoad,
    /// A cell is marked as used only when its data is accessed.
    OnDataAccess,
}

type NodeId = u32;

struct UsageTreeNode {
    loaded: bool,
    children: [Option<NodeId>; MAX_REF_COUNT],
}

impl UsageTreeNode {
    fn new() -> Self {
        Self {
            loaded: false,
            children: [None; MAX_REF_COUNT],
        }
    }
}

pub(crate) struct UsageTreeState {
    mode: UsageTreeMode,
    nodes: Mutex<Vec<UsageTreeNode>>,
    visited: Mutex<ahash::HashSet<HashBytes>>,
}

impl UsageTreeState {
    fn mark_loaded(&self, node_id: NodeId, hash: &HashBytes) {
        {
            let mut nodes = self.nodes.lock().unwrap_or_else(|e| e.into_inner());
            let node = &mut nodes[node_id as usize];
            if node.loaded {
                return;
            }
            node.loaded = true;
        }
        let mut visited = self.visited.lock().unwrap_or_else(|e| e.into_inner());
        visited.insert(*hash);
    }

    /// Returns the child slot of the node, allocating it on first access.
    fn child(&self, parent: NodeId, index: u8) -> NodeId {
        let mut nodes = self.nodes.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(id) = nodes[parent as usize].children[index as usize] {
            return id;
        }
        let id = nodes.len() as NodeId;
        nodes.push(UsageTreeNode::new());
        nodes[parent as usize].children[index as usize] = Some(id);
        id
    }

    fn contains(&self, hash: &HashBytes) -> bool {
        let visited = self.visited.lock().unwrap_or_else(|e| e.into_inner());
        visited.contains(hash)
    }
}

/// Usage tree for a subset of cells.
///
/// Observes a single read-only traversal driven through the cell
/// returned by [`UsageTree::track`]; the set of loaded cells then
/// decides which subtrees a Merkle proof must retain. Independent
/// traversals of the same source DAG must each own a fresh tree.
pub struct UsageTree {
    state: Arc<UsageTreeState>,
    root: NodeId,
}

impl UsageTree {
    /// Creates an empty usage tree with the specified tracking mode.
    pub fn new(mode: UsageTreeMode) -> Self {
        Self {
            state: Arc::new(UsageTreeState {
                mode,
                nodes: Mutex::new(vec![UsageTreeNode::new()]),
                visited: Mutex::new(Default::default()),
            }),
            root: 0,
        }
    }

    /// Wraps the cell in a tracked cell whose dereferences are logged
    /// against the root node of this tree.
    pub fn track(&self, cell: &Cell) -> Cell {
        if self.state.mode == UsageTreeMode::OnLoad {
            self.state.mark_loaded(self.root, cell.repr_hash());
        }
        Cell::new(CellImpl::Usage(UsageCell {
            inner: cell.clone(),
            usage: Arc::downgrade(&self.state),
            node: self.root,
        }))
    }

    /// Returns whether the cell with the specified representation hash
    /// was loaded through this tree.
    pub fn contains(&self, hash: &HashBytes) -> bool {
        self.state.contains(hash)
    }
}

/// View which logs access events against a usage tree node.
pub(crate) struct UsageCell {
    inner: Cell,
    usage: Weak<UsageTreeState>,
    node: NodeId,
}

impl UsageCell {
    #[inline]
    pub(crate) fn inner(&self) -> &Cell {
        &self.inner
    }

    pub(crate) fn on_data_access(&self) {
        if let Some(state) = self.usage.upgrade() {
            state.mark_loaded(self.node, self.inner.repr_hash());
        }
    }

    pub(crate) fn reference(&self, index: u8) -> Result<Cell, Error> {
        let child = ok!(self.inner.reference(index));
        match self.usage.upgrade() {
            Some(state) => {
                let node = state.child(self.node, index);
                if state.mode == UsageTreeMode::OnLoad {
                    state.mark_loaded(node, child.repr_hash());
                }
                Ok(Cell::new(CellImpl::Usage(UsageCell {
                    inner: child,
                    usage: self.usage.clone(),
                    node,
                })))
            }
            // The tree is gone, degrade to a pass-through
            None => Ok(child),
        }
    }
}
