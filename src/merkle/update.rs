//! Merkle update construction and application.

use super::{make_pruned_branch, FilterAction, MerkleFilter, MerkleProofBuilder};
use crate::cell::{Cell, CellBuilder, CellSlice, CellType, HashBytes, EMPTY_CELL_HASH};
use crate::error::Error;

/// Parsed Merkle update representation.
///
/// NOTE: Serialized into a `MerkleUpdate` cell.
#[derive(Debug, Clone)]
pub struct MerkleUpdate {
    /// Representation hash of the original cell.
    pub old_hash: HashBytes,
    /// Representation hash of the updated cell.
    pub new_hash: HashBytes,
    /// Representation depth of the original cell.
    pub old_depth: u16,
    /// Representation depth of the updated cell.
    pub new_depth: u16,
    /// Partially pruned tree with unchanged cells of the origin cell.
    pub old: Cell,
    /// Partially pruned tree with all cells that are not in the original cell.
    pub new: Cell,
}

impl Eq for MerkleUpdate {}

impl PartialEq for MerkleUpdate {
    fn eq(&self, other: &Self) -> bool {
        self.old_hash == other.old_hash
            && self.new_hash == other.new_hash
            && self.old_depth == other.old_depth
            && self.new_depth == other.new_depth
            && self.old == other.old
            && self.new == other.new
    }
}

impl Default for MerkleUpdate {
    fn default() -> Self {
        let empty_cell = Cell::empty_cell();
        Self {
            old_hash: *EMPTY_CELL_HASH,
            new_hash: *EMPTY_CELL_HASH,
            old_depth: 0,
            new_depth: 0,
            old: empty_cell.clone(),
            new: empty_cell,
        }
    }
}

impl MerkleUpdate {
    /// The number of data bits that the Merkle update occupies.
    pub const BITS: u16 = 8 + (256 + 16) * 2;
    /// The number of references that the Merkle update occupies.
    pub const REFS: u8 = 2;

    /// Starts building a Merkle update between the specified cells,
    /// using old cells determined by filter.
    pub fn create<'a, F>(old: &'a Cell, new: &'a Cell, f: F) -> MerkleUpdateBuilder<'a, F>
    where
        F: MerkleFilter + 'a,
    {
        MerkleUpdateBuilder::new(old, new, f)
    }

    /// Loads a parsed update from a Merkle update cell slice.
    pub fn load_from(s: &mut CellSlice<'_>) -> Result<Self, Error> {
        if !s.has_remaining(Self::BITS, Self::REFS) {
            return Err(Error::CellUnderflow);
        }

        if ok!(s.get_u8(0)) != CellType::MerkleUpdate.to_byte() {
            return Err(Error::InvalidData);
        }

        let res = Self {
            old_hash: ok!(s.get_u256(8)),
            new_hash: ok!(s.get_u256(8 + 256)),
            old_depth: ok!(s.get_u16(8 + 256 * 2)),
            new_depth: ok!(s.get_u16(8 + 256 * 2 + 16)),
            old: ok!(s.get_reference(0)),
            new: ok!(s.get_reference(1)),
        };
        if res.old.hash(0) == &res.old_hash
            && res.old.depth(0) == res.old_depth
            && res.new.hash(0) == &res.new_hash
            && res.new.depth(0) == res.new_depth
            && s.try_advance(Self::BITS, Self::REFS)
        {
            Ok(res)
        } else {
            Err(Error::InvalidData)
        }
    }

    /// Packs the parsed update into the builder as a Merkle update cell.
    pub fn store_into(&self, b: &mut CellBuilder) -> Result<(), Error> {
        if !b.has_capacity(Self::BITS, Self::REFS) {
            return Err(Error::CellOverflow);
        }

        b.set_exotic(true);
        ok!(b.store_u8(CellType::MerkleUpdate.to_byte()));
        ok!(b.store_u256(&self.old_hash));
        ok!(b.store_u256(&self.new_hash));
        ok!(b.store_u32(((self.old_depth as u32) << 16) | self.new_depth as u32));
        ok!(b.store_reference(self.old.clone()));
        b.store_reference(self.new.clone())
    }

    /// Builds a Merkle update cell from the parsed update.
    pub fn build_cell(&self) -> Result<Cell, Error> {
        let mut builder = CellBuilder::new();
        ok!(self.store_into(&mut builder));
        builder.build()
    }

    /// Tries to apply this Merkle update to the specified cell,
    /// producing a new cell.
    pub fn apply(&self, old: &Cell) -> Result<Cell, Error> {
        if old.repr_hash() != &self.old_hash {
            return Err(Error::InvalidData);
        }

        if self.old_hash == self.new_hash {
            return Ok(old.clone());
        }

        // Collect owned unchanged cells, keyed by their hash
        // at the original Merkle depth
        let old_cells = {
            let old_cell_hashes = ok!(self.find_old_cells());

            let mut visited = ahash::HashSet::default();
            let mut old_cells = ahash::HashMap::default();
            collect_old_cells(old, 0, &old_cell_hashes, &mut visited, &mut old_cells);
            old_cells
        };

        // Rebuild the new tree, replacing unbounded pruned branches
        // with the collected cells
        let mut applier = Applier {
            old_cells,
            new_cells: Default::default(),
        };
        let new = ok!(applier.run(&self.new, 0));

        if new.repr_hash() == &self.new_hash {
            Ok(new)
        } else {
            Err(Error::InvalidData)
        }
    }

    /// Returns the hashes of unchanged cells, checking that every
    /// pruned branch of the new tree is bounded by the old tree.
    fn find_old_cells(&self) -> Result<ahash::HashSet<HashBytes>, Error> {
        let mut visited = ahash::HashSet::default();
        let mut old_cells = ahash::HashSet::default();
        collect_old_hashes(&self.old, 0, &mut visited, &mut old_cells);

        visited.clear();
        ok!(validate_new_tree(&self.new, 0, &mut visited, &old_cells));

        Ok(old_cells)
    }
}

fn collect_old_hashes(
    cell: &Cell,
    merkle_depth: u8,
    visited: &mut ahash::HashSet<HashBytes>,
    old_cells: &mut ahash::HashSet<HashBytes>,
) {
    if !visited.insert(*cell.repr_hash()) {
        return;
    }

    // Store the cell with its original Merkle depth
    old_cells.insert(*cell.hash(merkle_depth));

    // Pruned branches have no content to descend into
    if cell.cell_type().is_pruned_branch() {
        return;
    }

    let child_merkle_depth = merkle_depth.saturating_add(cell.cell_type().is_merkle() as u8);
    for child in cell.references() {
        collect_old_hashes(&child, child_merkle_depth, visited, old_cells);
    }
}

/// Unchanged cells of the new tree (as pruned branches) must be
/// present in the old tree.
fn validate_new_tree(
    cell: &Cell,
    merkle_depth: u8,
    visited: &mut ahash::HashSet<HashBytes>,
    old_cells: &ahash::HashSet<HashBytes>,
) -> Result<(), Error> {
    if !visited.insert(*cell.repr_hash()) {
        return Ok(());
    }

    if cell.cell_type().is_pruned_branch() {
        if cell.level() == merkle_depth.saturating_add(1)
            && !old_cells.contains(cell.hash(merkle_depth))
        {
            return Err(Error::InvalidData);
        }
        return Ok(());
    }

    let child_merkle_depth = merkle_depth.saturating_add(cell.cell_type().is_merkle() as u8);
    for child in cell.references() {
        ok!(validate_new_tree(
            &child,
            child_merkle_depth,
            visited,
            old_cells
        ));
    }
    Ok(())
}

fn collect_old_cells(
    cell: &Cell,
    merkle_depth: u8,
    old_cell_hashes: &ahash::HashSet<HashBytes>,
    visited: &mut ahash::HashSet<HashBytes>,
    old_cells: &mut ahash::HashMap<HashBytes, Cell>,
) {
    if !visited.insert(*cell.repr_hash()) {
        return;
    }

    let hash = *cell.hash(merkle_depth);
    if !old_cell_hashes.contains(&hash) {
        // Skip subtrees the update does not reuse
        return;
    }
    old_cells.insert(hash, cell.clone());

    let child_merkle_depth = merkle_depth.saturating_add(cell.cell_type().is_merkle() as u8);
    for child in cell.references() {
        collect_old_cells(&child, child_merkle_depth, old_cell_hashes, visited, old_cells);
    }
}

struct Applier {
    old_cells: ahash::HashMap<HashBytes, Cell>,
    new_cells: ahash::HashMap<HashBytes, Cell>,
}

impl Applier {
    fn run(&mut self, cell: &Cell, merkle_depth: u8) -> Result<Cell, Error> {
        let child_merkle_depth = merkle_depth.saturating_add(cell.cell_type().is_merkle() as u8);

        let mut result = CellBuilder::new();
        result.set_exotic(cell.is_exotic());

        for index in 0..cell.reference_count() {
            let child = ok!(cell.reference(index));

            let child = if child.cell_type().is_pruned_branch() {
                let mask = child.level_mask();
                if mask.contains(child_merkle_depth.saturating_add(1)) {
                    // An unbounded pruned branch stands for an old cell
                    let child_hash = child.hash(mask.level() - 1);
                    match self.old_cells.get(child_hash) {
                        Some(cell) => cell.clone(),
                        None => return Err(Error::InvalidData),
                    }
                } else {
                    child
                }
            } else {
                let child_hash = *child.hash(child_merkle_depth);
                if let Some(child) = self.new_cells.get(&child_hash) {
                    child.clone()
                } else {
                    let child = ok!(self.run(&child, child_merkle_depth));
                    self.new_cells.insert(child_hash, child.clone());
                    child
                }
            };

            ok!(result.store_reference(child));
        }

        ok!(result.store_cell_data(cell));
        result.build()
    }
}

/// Helper struct to build a Merkle update.
pub struct MerkleUpdateBuilder<'a, F> {
    old: &'a Cell,
    new: &'a Cell,
    filter: F,
}

impl<'a, F> MerkleUpdateBuilder<'a, F>
where
    F: MerkleFilter,
{
    /// Creates a new Merkle update between the specified cells,
    /// using old cells determined by filter.
    pub fn new(old: &'a Cell, new: &'a Cell, f: F) -> Self {
        Self {
            old,
            new,
            filter: f,
        }
    }

    /// Builds a Merkle update.
    pub fn build(self) -> Result<MerkleUpdate, Error> {
        BuilderImpl {
            old: self.old,
            new: self.new,
            filter: &self.filter,
        }
        .build()
    }
}

struct BuilderImpl<'a, 'b> {
    old: &'a Cell,
    new: &'a Cell,
    filter: &'b dyn MerkleFilter,
}

impl BuilderImpl<'_, '_> {
    fn build(self) -> Result<MerkleUpdate, Error> {
        struct Resolver<'b> {
            pruned_branches: ahash::HashMap<HashBytes, bool>,
            visited: ahash::HashSet<HashBytes>,
            filter: &'b dyn MerkleFilter,
            changed_cells: ahash::HashSet<HashBytes>,
        }

        impl Resolver<'_> {
            fn fill(&mut self, cell: &Cell, mut skip_filter: bool) -> bool {
                let repr_hash = *cell.repr_hash();

                // Skip visited cells
                if !self.visited.insert(repr_hash) {
                    return false;
                }

                let is_pruned = match self.pruned_branches.get_mut(&repr_hash) {
                    Some(true) => return false,
                    Some(visited) => {
                        *visited = true;
                        true
                    }
                    None => false,
                };

                let process_children = if skip_filter {
                    true
                } else {
                    match self.filter.check(&repr_hash) {
                        FilterAction::Skip => false,
                        FilterAction::Include => true,
                        FilterAction::IncludeSubtree => {
                            skip_filter = true;
                            true
                        }
                    }
                };

                let mut result = false;
                if process_children {
                    for child in cell.references() {
                        result |= self.fill(&child, skip_filter);
                    }

                    if result {
                        self.changed_cells.insert(repr_hash);
                    }
                }

                result | is_pruned
            }
        }

        struct InvertedFilter<F>(F);

        impl<F: MerkleFilter> MerkleFilter for InvertedFilter<F> {
            #[inline]
            fn check(&self, cell: &HashBytes) -> FilterAction {
                if self.0.check(cell) == FilterAction::Skip {
                    FilterAction::Include
                } else {
                    FilterAction::Skip
                }
            }
        }

        let old_hash = *self.old.repr_hash();
        let old_depth = self.old.repr_depth();
        let new_hash = *self.new.repr_hash();
        let new_depth = self.new.repr_depth();

        // Handle the simplest case with an empty Merkle update
        if old_hash == new_hash {
            let pruned = ok!(make_pruned_branch(self.old, 0));
            return Ok(MerkleUpdate {
                old_hash,
                new_hash: old_hash,
                old_depth,
                new_depth: old_depth,
                old: pruned.clone(),
                new: pruned,
            });
        }

        // Create a raw proof tree which contains only new cells
        let (new, pruned_branches) = ok! {
            MerkleProofBuilder::new(self.new, InvertedFilter(self.filter))
                .track_pruned_branches()
                .allow_different_root(true)
                .build_raw_ext()
        };

        // Prepare the cell diff resolver
        let mut resolver = Resolver {
            pruned_branches,
            visited: Default::default(),
            filter: self.filter,
            changed_cells: Default::default(),
        };

        // Find all changed cells in the old cell tree
        if resolver.fill(self.old, false) {
            resolver.changed_cells.insert(old_hash);
        }

        // Create a raw proof tree which contains only changed cells
        let old = ok! {
            MerkleProofBuilder::new(self.old, resolver.changed_cells)
                .allow_different_root(true)
                .build_raw()
        };

        Ok(MerkleUpdate {
            old_hash,
            new_hash,
            old_depth,
            new_depth,
            old,
            new,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prelude::*;

    fn visit_all_cells(cell: &Cell) -> ahash::HashSet<HashBytes> {
        let mut result = ahash::HashSet::default();

        let mut stack = vec![cell.clone()];
        while let Some(cell) = stack.pop() {
            if !result.insert(*cell.repr_hash()) {
                continue;
            }
            for child in cell.references() {
                stack.push(child);
            }
        }

        result
    }

    fn leaf(payload: u64) -> Cell {
        let mut builder = CellBuilder::new();
        builder.store_u64(payload).unwrap();
        builder.build().unwrap()
    }

    fn branch(tag: u8, children: &[&Cell]) -> Cell {
        let mut builder = CellBuilder::new();
        builder.store_u8(tag).unwrap();
        for child in children {
            builder.store_reference((*child).clone()).unwrap();
        }
        builder.build().unwrap()
    }

    #[test]
    fn correct_store_load() {
        let default = MerkleUpdate::default();

        let cell = default.build_cell().unwrap();
        assert_eq!(cell.cell_type(), CellType::MerkleUpdate);

        let parsed = MerkleUpdate::load_from(&mut cell.as_slice().unwrap()).unwrap();
        assert_eq!(default, parsed);
    }

    #[test]
    fn create_and_apply() {
        let shared = leaf(111);
        let old_left = branch(1, &[&shared, &leaf(222)]);
        let old = branch(0, &[&old_left, &leaf(333)]);

        // The right leaf changes, the left subtree is reused
        let new = branch(0, &[&old_left, &leaf(444)]);
        assert_ne!(old, new);

        let old_hashes = visit_all_cells(&old);
        let merkle_update = MerkleUpdate::create(&old, &new, old_hashes)
            .build()
            .unwrap();

        assert_eq!(merkle_update.old_hash, *old.repr_hash());
        assert_eq!(merkle_update.new_hash, *new.repr_hash());

        // The serialized form is a valid exotic cell
        merkle_update.build_cell().unwrap();

        let after_apply = merkle_update.apply(&old).unwrap();
        assert_eq!(after_apply, new);
    }

    #[test]
    fn create_with_usage_tree() {
        let old = branch(0, &[&branch(1, &[&leaf(1), &leaf(2)]), &leaf(3)]);

        let usage_tree = UsageTree::new(UsageTreeMode::OnLoad);
        let tracked = usage_tree.track(&old);

        // Visit the whole old tree through the tracked root
        let mut stack = vec![tracked];
        while let Some(cell) = stack.pop() {
            cell.as_slice().unwrap();
            for child in cell.references() {
                stack.push(child);
            }
        }

        let new = branch(0, &[&branch(1, &[&leaf(1), &leaf(2)]), &leaf(5)]);

        let merkle_update = MerkleUpdate::create(&old, &new, usage_tree).build().unwrap();
        let after_apply = merkle_update.apply(&old).unwrap();
        assert_eq!(after_apply, new);
    }

    #[test]
    fn apply_rejects_wrong_root() {
        let old = branch(0, &[&leaf(1)]);
        let new = branch(0, &[&leaf(2)]);

        let merkle_update = MerkleUpdate::create(&old, &new, visit_all_cells(&old))
            .build()
            .unwrap();

        let other = branch(7, &[&leaf(1)]);
        assert_eq!(merkle_update.apply(&other), Err(Error::InvalidData));
    }

    #[test]
    fn empty_update_round_trip() {
        let old = branch(0, &[&leaf(1), &leaf(2)]);

        let merkle_update = MerkleUpdate::create(&old, &old, visit_all_cells(&old))
            .build()
            .unwrap();
        assert_eq!(merkle_update.old_hash, merkle_update.new_hash);
        assert_eq!(merkle_update.old.cell_type(), CellType::PrunedBranch);

        let after_apply = merkle_update.apply(&old).unwrap();
        assert_eq!(after_apply, old);
    }
}
