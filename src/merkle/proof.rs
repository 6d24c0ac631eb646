//! Merkle proof construction and verification.

use super::{make_pruned_branch, FilterAction, MerkleFilter};
use crate::cell::{
    Cell, CellBuilder, CellSlice, CellType, HashBytes, UsageTree, VirtualizationParams,
    EMPTY_CELL_HASH,
};
use crate::error::Error;

/// Parsed Merkle proof representation.
///
/// NOTE: Serialized into a `MerkleProof` cell.
#[derive(Debug, Clone)]
pub struct MerkleProof {
    /// Representation hash of the original cell.
    pub hash: HashBytes,
    /// Representation depth of the original cell.
    pub depth: u16,
    /// Partially pruned tree with the contents of the original cell.
    pub cell: Cell,
}

impl Eq for MerkleProof {}

impl PartialEq for MerkleProof {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash && self.depth == other.depth && self.cell == other.cell
    }
}

impl Default for MerkleProof {
    fn default() -> Self {
        Self {
            hash: *EMPTY_CELL_HASH,
            depth: 0,
            cell: Cell::empty_cell(),
        }
    }
}

impl MerkleProof {
    /// The number of data bits that the Merkle proof occupies.
    pub const BITS: u16 = 8 + 256 + 16;
    /// The number of references that the Merkle proof occupies.
    pub const REFS: u8 = 1;

    /// Starts building a Merkle proof for the specified root,
    /// using cells determined by filter.
    pub fn create<'a, F>(root: &'a Cell, f: F) -> MerkleProofBuilder<'a, F>
    where
        F: MerkleFilter + 'a,
    {
        MerkleProofBuilder::new(root, f)
    }

    /// Starts building a Merkle proof for the specified root,
    /// keeping the cells loaded through the usage tree.
    pub fn create_from_usage<'a>(
        root: &'a Cell,
        usage_tree: &'a UsageTree,
    ) -> MerkleProofBuilder<'a, &'a UsageTree> {
        MerkleProofBuilder::new(root, usage_tree)
    }

    /// Creates a Merkle proof for the single cell with the specified
    /// representation hash.
    ///
    /// Only ancestors of the first occurrence are included in the proof.
    ///
    /// Proof creation will fail if the specified child is not found.
    pub fn create_for_cell<'a>(
        root: &'a Cell,
        child_hash: &'a HashBytes,
    ) -> MerkleProofBuilder<'a, impl MerkleFilter + 'a> {
        struct RootOrChild<'a> {
            cells: ahash::HashSet<HashBytes>,
            child_hash: &'a HashBytes,
        }

        impl MerkleFilter for RootOrChild<'_> {
            fn check(&self, cell: &HashBytes) -> FilterAction {
                if self.cells.contains(cell) || cell == self.child_hash {
                    FilterAction::Include
                } else {
                    FilterAction::Skip
                }
            }
        }

        let mut stack: Vec<(Cell, u8)> = vec![(root.clone(), 0)];
        while let Some(last) = stack.last_mut() {
            let index = last.1;
            if index >= last.0.reference_count() {
                stack.pop();
                continue;
            }
            last.1 += 1;
            let child = match last.0.reference(index) {
                Ok(child) => child,
                Err(_) => continue,
            };
            if child.repr_hash() == child_hash {
                break;
            }
            stack.push((child, 0));
        }

        let mut cells = ahash::HashSet::with_capacity_and_hasher(stack.len(), Default::default());
        for (cell, _) in stack {
            cells.insert(*cell.repr_hash());
        }

        MerkleProofBuilder::new(root, RootOrChild { cells, child_hash })
    }

    /// Unpacks a Merkle proof cell and returns a virtualized view
    /// of the tree it carries.
    ///
    /// The view is logically identical to the original tree; descending
    /// into a pruned region fails with [`Error::PrunedBranchAccess`]
    /// carrying the specified virtualization counter.
    pub fn virtualize(proof_cell: &Cell, virtualization: u8) -> Result<Cell, Error> {
        let inner = ok!(unpack_proof(proof_cell));
        Ok(inner.virtualize(VirtualizationParams {
            level: 0,
            virtualization,
        }))
    }

    /// Loads a parsed proof from a Merkle proof cell slice.
    pub fn load_from(s: &mut CellSlice<'_>) -> Result<Self, Error> {
        if !s.has_remaining(Self::BITS, Self::REFS) {
            return Err(Error::CellUnderflow);
        }

        if ok!(s.get_u8(0)) != CellType::MerkleProof.to_byte() {
            return Err(Error::ProofUnpackError);
        }

        let res = Self {
            hash: ok!(s.get_u256(8)),
            depth: ok!(s.get_u16(8 + 256)),
            cell: ok!(s.get_reference(0)),
        };
        if res.cell.hash(0) == &res.hash
            && res.cell.depth(0) == res.depth
            && s.try_advance(Self::BITS, Self::REFS)
        {
            Ok(res)
        } else {
            Err(Error::ProofUnpackError)
        }
    }

    /// Packs the parsed proof into the builder as a Merkle proof cell.
    pub fn store_into(&self, b: &mut CellBuilder) -> Result<(), Error> {
        if !b.has_capacity(Self::BITS, Self::REFS) {
            return Err(Error::CellOverflow);
        }

        b.set_exotic(true);
        ok!(b.store_u8(CellType::MerkleProof.to_byte()));
        ok!(b.store_u256(&self.hash));
        ok!(b.store_u16(self.depth));
        b.store_reference(self.cell.clone())
    }

    /// Builds a Merkle proof cell from the parsed proof.
    pub fn build_cell(&self) -> Result<Cell, Error> {
        let mut builder = CellBuilder::new();
        ok!(self.store_into(&mut builder));
        builder.build()
    }
}

/// Unpacks the child tree of a Merkle proof cell.
pub(crate) fn unpack_proof(cell: &Cell) -> Result<Cell, Error> {
    if cell.level() != 0 {
        return Err(Error::InvalidRootLevel);
    }
    if cell.cell_type() != CellType::MerkleProof {
        return Err(Error::ProofUnpackError);
    }
    match cell.reference(0) {
        Ok(inner) => Ok(inner),
        Err(_) => Err(Error::ProofUnpackError),
    }
}

/// Helper struct to build a Merkle proof.
pub struct MerkleProofBuilder<'a, F> {
    root: &'a Cell,
    filter: F,
    allow_different_root: bool,
}

impl<'a, F> MerkleProofBuilder<'a, F>
where
    F: MerkleFilter,
{
    /// Creates a new Merkle proof builder for the tree with the specified
    /// root, using cells determined by filter.
    pub fn new(root: &'a Cell, f: F) -> Self {
        Self {
            root,
            filter: f,
            allow_different_root: false,
        }
    }

    /// Allows the root cell to be rejected by the filter.
    ///
    /// Used for raw proof trees whose root is not the proof target.
    pub fn allow_different_root(mut self, allow: bool) -> Self {
        self.allow_different_root = allow;
        self
    }

    /// Extends the builder to additionally save all hashes
    /// of cells not included in the Merkle proof.
    pub fn track_pruned_branches(self) -> MerkleProofExtBuilder<'a, F> {
        MerkleProofExtBuilder {
            root: self.root,
            filter: self.filter,
            allow_different_root: self.allow_different_root,
        }
    }

    /// Builds a Merkle proof, wrapping the pruned tree together with
    /// the root hash and depth.
    ///
    /// Fails with [`Error::InvalidRootLevel`] when the root cell has
    /// a non-zero level: a proof can only attach to a plain cell.
    pub fn build(self) -> Result<MerkleProof, Error> {
        let root = self.root;
        if root.level() != 0 {
            return Err(Error::InvalidRootLevel);
        }
        let hash = *root.repr_hash();
        let depth = root.repr_depth();
        let cell = ok!(self.build_raw());
        Ok(MerkleProof { hash, depth, cell })
    }

    /// Builds the raw pruned tree without the Merkle proof wrapper.
    pub fn build_raw(self) -> Result<Cell, Error> {
        let mut builder = BuilderImpl {
            filter: &self.filter,
            allow_different_root: self.allow_different_root,
            cells: Default::default(),
            pruned_branches: None,
        };
        builder.build(self.root)
    }
}

/// Helper struct to build a Merkle proof and keep track of all pruned cells.
pub struct MerkleProofExtBuilder<'a, F> {
    root: &'a Cell,
    filter: F,
    allow_different_root: bool,
}

impl<'a, F> MerkleProofExtBuilder<'a, F>
where
    F: MerkleFilter,
{
    /// Allows the root cell to be rejected by the filter.
    pub fn allow_different_root(mut self, allow: bool) -> Self {
        self.allow_different_root = allow;
        self
    }

    /// Builds the raw pruned tree, returning the hashes of all cells
    /// replaced by pruned branches.
    pub fn build_raw_ext(self) -> Result<(Cell, ahash::HashMap<HashBytes, bool>), Error> {
        let mut pruned_branches = Default::default();
        let mut builder = BuilderImpl {
            filter: &self.filter,
            allow_different_root: self.allow_different_root,
            cells: Default::default(),
            pruned_branches: Some(&mut pruned_branches),
        };
        let cell = ok!(builder.build(self.root));
        Ok((cell, pruned_branches))
    }
}

struct BuilderImpl<'b> {
    filter: &'b dyn MerkleFilter,
    allow_different_root: bool,
    /// Results are memoized per `(hash, merkle depth)` pair, which keeps
    /// the traversal linear in the number of distinct cells.
    cells: ahash::HashMap<(HashBytes, u8), Cell>,
    pruned_branches: Option<&'b mut ahash::HashMap<HashBytes, bool>>,
}

impl BuilderImpl<'_> {
    fn build(&mut self, root: &Cell) -> Result<Cell, Error> {
        let root_action = self.filter.check(root.repr_hash());
        if root_action == FilterAction::Skip && !self.allow_different_root {
            return Err(Error::EmptyProof);
        }

        // Starting at the root level keeps the level accounting correct
        // when the caller wraps the result in a Merkle proof cell
        self.fill(root, root.level(), true)
    }

    fn fill(&mut self, cell: &Cell, merkle_depth: u8, is_root: bool) -> Result<Cell, Error> {
        let key = (*cell.repr_hash(), merkle_depth);
        if let Some(existing) = self.cells.get(&key) {
            return Ok(existing.clone());
        }

        let action = match self.filter.check(cell.repr_hash()) {
            // The root is always physically present
            FilterAction::Skip if is_root => FilterAction::Include,
            action => action,
        };

        let result = match action {
            FilterAction::Skip => {
                let pruned = ok!(make_pruned_branch(cell, merkle_depth));
                if let Some(pruned_branches) = &mut self.pruned_branches {
                    pruned_branches.insert(*cell.repr_hash(), false);
                }
                pruned
            }
            // Included subtrees are used as is
            FilterAction::IncludeSubtree => cell.clone(),
            FilterAction::Include => {
                let child_merkle_depth = merkle_depth.saturating_add(cell.cell_type().is_merkle() as u8);

                let mut builder = CellBuilder::new();
                builder.set_exotic(cell.is_exotic());
                ok!(builder.store_cell_data(cell));
                for index in 0..cell.reference_count() {
                    let child = ok!(cell.reference(index));
                    let child = ok!(self.fill(&child, child_merkle_depth, false));
                    ok!(builder.store_reference(child));
                }
                ok!(builder.build())
            }
        };

        self.cells.insert(key, result.clone());
        Ok(result)
    }
}
