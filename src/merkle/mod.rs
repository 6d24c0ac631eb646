//! Merkle proofs and Merkle updates over trees of cells.

use std::hash::BuildHasher;

use crate::cell::{Cell, CellBuilder, CellType, HashBytes, LevelMask, UsageTree};
use crate::error::Error;

pub use self::proof::{MerkleProof, MerkleProofBuilder, MerkleProofExtBuilder};
pub use self::update::{MerkleUpdate, MerkleUpdateBuilder};

mod combine;
mod proof;
mod update;

/// A cell tree filter for Merkle structures.
pub trait MerkleFilter {
    /// Returns how the cell with the specified representation hash
    /// is treated by the proof builder.
    fn check(&self, cell: &HashBytes) -> FilterAction;
}

/// Proof builder action.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum FilterAction {
    /// Replace the cell with a pruned branch.
    Skip,
    /// Include the cell and filter its children.
    Include,
    /// Include the cell and the whole subtree below it.
    IncludeSubtree,
}

impl<T: MerkleFilter + ?Sized> MerkleFilter for &T {
    #[inline]
    fn check(&self, cell: &HashBytes) -> FilterAction {
        T::check(self, cell)
    }
}

impl<S: BuildHasher> MerkleFilter for std::collections::HashSet<HashBytes, S> {
    fn check(&self, cell: &HashBytes) -> FilterAction {
        if self.contains(cell) {
            FilterAction::Include
        } else {
            FilterAction::Skip
        }
    }
}

impl<S: BuildHasher> MerkleFilter for std::collections::HashSet<&HashBytes, S> {
    fn check(&self, cell: &HashBytes) -> FilterAction {
        if self.contains(cell) {
            FilterAction::Include
        } else {
            FilterAction::Skip
        }
    }
}

impl MerkleFilter for UsageTree {
    fn check(&self, cell: &HashBytes) -> FilterAction {
        if self.contains(cell) {
            FilterAction::Include
        } else {
            FilterAction::Skip
        }
    }
}

/// Creates a pruned branch which replaces the specified cell
/// at the specified Merkle depth.
///
/// The stub carries one `(hash, depth)` pair for each level the original
/// cell publishes, so the hashes of every ancestor are preserved.
pub fn make_pruned_branch(cell: &Cell, merkle_depth: u8) -> Result<Cell, Error> {
    make_pruned_branch_ext(cell, merkle_depth, LevelMask::MAX_LEVEL)
}

/// As [`make_pruned_branch`], but with the levels of the replaced cell
/// capped at `virt_level`.
pub(crate) fn make_pruned_branch_ext(
    cell: &Cell,
    merkle_depth: u8,
    virt_level: u8,
) -> Result<Cell, Error> {
    if merkle_depth >= LevelMask::MAX_LEVEL {
        return Err(Error::InvalidData);
    }

    let level_mask = cell.level_mask().apply(virt_level) | LevelMask::from_level(merkle_depth + 1);
    let level = level_mask.level();

    let mut builder = CellBuilder::new();
    builder.set_exotic(true);
    ok!(builder.store_u8(CellType::PrunedBranch.to_byte()));
    ok!(builder.store_u8(level_mask.to_byte()));

    let stored = level_mask.apply(level - 1);
    for level_i in 0..level {
        if stored.contains(level_i) {
            ok!(builder.store_u256(cell.hash(level_i)));
        }
    }
    for level_i in 0..level {
        if stored.contains(level_i) {
            ok!(builder.store_u16(cell.depth(level_i)));
        }
    }

    builder.build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prelude::*;

    #[test]
    fn pruned_branch_publishes_hashes() {
        let mut builder = CellBuilder::new();
        builder.store_u64(0x1122_3344_5566_7788).unwrap();
        let child = builder.build().unwrap();

        let mut builder = CellBuilder::new();
        builder.store_u8(9).unwrap();
        builder.store_reference(child).unwrap();
        let cell = builder.build().unwrap();

        let pruned = make_pruned_branch(&cell, 0).unwrap();
        assert_eq!(pruned.cell_type(), CellType::PrunedBranch);
        assert_eq!(pruned.level(), 1);
        assert_eq!(pruned.hash(0), cell.hash(0));
        assert_eq!(pruned.depth(0), cell.depth(0));
        // Its own identity differs from the replaced subtree
        assert_ne!(pruned.repr_hash(), cell.repr_hash());
        assert_eq!(pruned.repr_depth(), 0);
    }

    #[test]
    fn pruned_branch_of_pruned_branch() {
        let mut builder = CellBuilder::new();
        builder.store_u8(1).unwrap();
        let cell = builder.build().unwrap();

        let level1 = make_pruned_branch(&cell, 0).unwrap();
        let level2 = make_pruned_branch(&level1, 1).unwrap();

        assert_eq!(level2.level(), 2);
        assert_eq!(level2.level_mask(), LevelMask::new(0b011));
        assert_eq!(level2.hash(0), cell.hash(0));
        assert_eq!(level2.hash(1), level1.repr_hash());

        // Merkle depth past the max level cannot be pruned further
        let level3 = make_pruned_branch(&level2, 2).unwrap();
        assert_eq!(level3.level(), 3);
        assert_eq!(
            make_pruned_branch(&level3, 3),
            Err(Error::InvalidData),
        );
    }

    #[test]
    fn usage_tree_as_filter() {
        let mut builder = CellBuilder::new();
        builder.store_u8(1).unwrap();
        let child = builder.build().unwrap();

        let mut builder = CellBuilder::new();
        builder.store_u8(0).unwrap();
        builder.store_reference(child.clone()).unwrap();
        let root = builder.build().unwrap();

        let usage_tree = UsageTree::new(UsageTreeMode::OnLoad);
        let tracked = usage_tree.track(&root);
        tracked.as_slice().unwrap();

        assert_eq!(usage_tree.check(root.repr_hash()), FilterAction::Include);
        assert_eq!(usage_tree.check(child.repr_hash()), FilterAction::Skip);
    }
}
