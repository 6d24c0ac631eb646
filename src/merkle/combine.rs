//! Union of two Merkle proofs over the same root.

use super::make_pruned_branch_ext;
use super::proof::{unpack_proof, MerkleProof};
use crate::cell::{Cell, CellBuilder, CellType, HashBytes, LevelMask};
use crate::error::Error;

impl MerkleProof {
    /// Merges two Merkle proof cells of the same root into a proof
    /// covering the union of their unpruned regions.
    ///
    /// Fails with [`Error::ProofUnpackError`] when either input is not
    /// a Merkle proof cell, and with [`Error::RootMismatch`] when the
    /// carried trees attach to different roots.
    pub fn combine(a: &Cell, b: &Cell) -> Result<Cell, Error> {
        let a = ok!(unpack_proof(a));
        let b = ok!(unpack_proof(b));
        if a.hash(0) != b.hash(0) {
            return Err(Error::RootMismatch);
        }

        let mut combiner = CombineImpl::default();
        ok!(combiner.index(&a, 0));
        ok!(combiner.index(&b, 0));
        let merged = ok!(combiner.create_a(&a, 0, 0));

        MerkleProof {
            hash: *merged.hash(0),
            depth: merged.depth(0),
            cell: merged,
        }
        .build_cell()
    }
}

/// All variants of one original cell seen across both proofs.
#[derive(Default, Clone)]
struct Info {
    /// Any non-pruned variant, when one was seen.
    cell: Option<Cell>,
    /// Pruned variants cached by level minus one, to be reused
    /// at the matching Merkle depth.
    pruned: [Option<Cell>; LevelMask::MAX_LEVEL as usize],
}

impl Info {
    fn get_pruned(&self, merkle_depth: u8) -> Option<Cell> {
        match self.pruned.get(merkle_depth as usize) {
            Some(cell) => cell.clone(),
            None => None,
        }
    }

    fn get_any(&self) -> Option<&Cell> {
        match &self.cell {
            Some(cell) => Some(cell),
            None => self.pruned.iter().flatten().next(),
        }
    }
}

#[derive(Default)]
struct CombineImpl {
    /// Cells of both trees indexed by their hash at the visit depth.
    cells: ahash::HashMap<HashBytes, Info>,
    visited: ahash::HashSet<(HashBytes, u8)>,
    /// Rebuilt cells memoized by `(hash, depth in the rebuilt tree)`,
    /// which keeps the merge linear in the size of the union.
    results: ahash::HashMap<(HashBytes, u8), Cell>,
}

impl CombineImpl {
    fn index(&mut self, cell: &Cell, merkle_depth: u8) -> Result<(), Error> {
        if !self.visited.insert((*cell.repr_hash(), merkle_depth)) {
            return Ok(());
        }

        let info = self.cells.entry(*cell.hash(merkle_depth)).or_default();
        if cell.cell_type() == CellType::PrunedBranch && cell.level() > merkle_depth {
            info.pruned[(cell.level() - 1) as usize] = Some(cell.clone());
            return Ok(());
        }
        // Bounded pruned branches are ordinary content here
        info.cell = Some(cell.clone());

        let child_merkle_depth = merkle_depth.saturating_add(cell.cell_type().is_merkle() as u8);
        for index in 0..cell.reference_count() {
            let child = ok!(cell.reference(index));
            ok!(self.index(&child, child_merkle_depth));
        }
        Ok(())
    }

    fn create_a(
        &mut self,
        cell: &Cell,
        merkle_depth: u8,
        a_merkle_depth: u8,
    ) -> Result<Cell, Error> {
        let merkle_depth = cell.level_mask().apply(merkle_depth).level();
        let key = (*cell.hash(merkle_depth), a_merkle_depth);
        if let Some(existing) = self.results.get(&key) {
            return Ok(existing.clone());
        }

        let result = ok!(self.do_create_a(cell, merkle_depth, a_merkle_depth));
        self.results.insert(key, result.clone());
        Ok(result)
    }

    fn do_create_a(
        &mut self,
        cell: &Cell,
        merkle_depth: u8,
        a_merkle_depth: u8,
    ) -> Result<Cell, Error> {
        let info = match self.cells.get(cell.hash(merkle_depth)) {
            Some(info) => info.clone(),
            None => return Err(Error::InvalidData),
        };

        let Some(source) = info.cell else {
            // Only pruned variants were seen, reuse one of the right
            // level or derive a fresh stub from any of them
            if let Some(pruned) = info.get_pruned(a_merkle_depth) {
                return Ok(pruned);
            }
            return match info.get_any() {
                Some(any) => make_pruned_branch_ext(any, a_merkle_depth, merkle_depth),
                None => Err(Error::InvalidData),
            };
        };

        // An unpruned leaf is reachable as is
        if source.reference_count() == 0 {
            return Ok(source);
        }

        let is_merkle = source.cell_type().is_merkle() as u8;
        let child_merkle_depth = merkle_depth.saturating_add(is_merkle);
        let child_a_merkle_depth = a_merkle_depth.saturating_add(is_merkle);

        let mut builder = CellBuilder::new();
        builder.set_exotic(source.is_exotic());
        ok!(builder.store_cell_data(&source));
        for index in 0..source.reference_count() {
            let child = ok!(source.reference(index));
            let child = ok!(self.create_a(&child, child_merkle_depth, child_a_merkle_depth));
            ok!(builder.store_reference(child));
        }
        builder.build()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prelude::*;

    fn make_balanced_tree(depth: u32) -> Cell {
        fn fill(depth: u32, counter: &mut u32) -> Cell {
            let index = *counter;
            *counter += 1;

            let mut builder = CellBuilder::new();
            let payload = format!("hash-test-{index}");
            builder
                .store_raw(payload.as_bytes(), payload.len() as u16 * 8)
                .unwrap();
            if depth > 1 {
                builder.store_reference(fill(depth - 1, counter)).unwrap();
                builder.store_reference(fill(depth - 1, counter)).unwrap();
            }
            builder.build().unwrap()
        }

        let mut counter = 0;
        fill(depth, &mut counter)
    }

    fn spine(root: &Cell, direction: u8) -> ahash::HashSet<HashBytes> {
        let mut cells = ahash::HashSet::default();
        let mut cell = root.clone();
        cells.insert(*cell.repr_hash());
        while cell.reference_count() > 0 {
            cell = cell.reference(direction).unwrap();
            cells.insert(*cell.repr_hash());
        }
        cells
    }

    fn proof_cell(root: &Cell, filter: ahash::HashSet<HashBytes>) -> Cell {
        MerkleProof::create(root, filter)
            .build()
            .unwrap()
            .build_cell()
            .unwrap()
    }

    /// Hashes of all unpruned cells carried by a proof cell.
    fn covered(proof_cell: &Cell) -> ahash::HashSet<HashBytes> {
        fn fill(cell: &Cell, covered: &mut ahash::HashSet<HashBytes>) {
            if cell.cell_type() == CellType::PrunedBranch {
                return;
            }
            covered.insert(*cell.hash(0));
            for child in cell.references() {
                fill(&child, covered);
            }
        }

        let inner = unpack_proof(proof_cell).unwrap();
        let mut cells = ahash::HashSet::default();
        fill(&inner, &mut cells);
        cells
    }

    #[test]
    fn combine_covers_the_union() {
        let root = make_balanced_tree(4);
        let left = proof_cell(&root, spine(&root, 0));
        let right = proof_cell(&root, spine(&root, 1));

        let combined = MerkleProof::combine(&left, &right).unwrap();
        assert_eq!(combined.cell_type(), CellType::MerkleProof);

        let virtualized = MerkleProof::virtualize(&combined, 1).unwrap();
        assert_eq!(virtualized.repr_hash(), root.repr_hash());

        // Both spines replay through the combined proof, down to
        // the unpruned leaves
        for direction in 0..2 {
            let mut cell = virtualized.clone();
            let mut original = root.clone();
            loop {
                assert_eq!(cell.repr_hash(), original.repr_hash());
                let slice = cell.as_slice().unwrap();
                assert_eq!(slice.size_bits(), original.bit_len());
                if cell.reference_count() == 0 {
                    break;
                }
                cell = cell.reference(direction).unwrap();
                original = original.reference(direction).unwrap();
            }
        }

        // Cells outside both spines stay pruned
        let left_child = virtualized.reference(0).unwrap();
        assert_eq!(left_child.reference(1), Err(Error::PrunedBranchAccess(1)));

        // The covered set is exactly the union
        let mut expected = spine(&root, 0);
        expected.extend(spine(&root, 1));
        assert_eq!(covered(&combined), expected);
    }

    #[test]
    fn combine_is_idempotent() {
        let root = make_balanced_tree(3);
        let proof = proof_cell(&root, spine(&root, 0));

        let combined = MerkleProof::combine(&proof, &proof).unwrap();
        assert_eq!(covered(&combined), covered(&proof));

        let original = unpack_proof(&proof).unwrap();
        let merged = unpack_proof(&combined).unwrap();
        assert_eq!(merged.repr_hash(), original.repr_hash());
    }

    #[test]
    fn combine_rejects_different_roots() {
        let first = make_balanced_tree(3);
        let second = make_balanced_tree(4);

        let a = proof_cell(&first, spine(&first, 0));
        let b = proof_cell(&second, spine(&second, 0));
        assert_eq!(MerkleProof::combine(&a, &b), Err(Error::RootMismatch));
    }

    #[test]
    fn combine_rejects_non_proof_cells() {
        let root = make_balanced_tree(3);
        let proof = proof_cell(&root, spine(&root, 0));
        assert_eq!(
            MerkleProof::combine(&proof, &root),
            Err(Error::ProofUnpackError)
        );
        assert_eq!(
            MerkleProof::combine(&root, &proof),
            Err(Error::ProofUnpackError)
        );
    }

    #[test]
    fn combined_leaf_stays_reachable() {
        // The deepest cells of both spines are unpruned leaves;
        // they must survive the merge verbatim
        let root = make_balanced_tree(4);
        let left = proof_cell(&root, spine(&root, 0));
        let right = proof_cell(&root, spine(&root, 1));
        let combined = MerkleProof::combine(&left, &right).unwrap();

        let virtualized = MerkleProof::virtualize(&combined, 1).unwrap();
        let mut cell = virtualized;
        let mut original = root.clone();
        while original.reference_count() > 0 {
            cell = cell.reference(1).unwrap();
            original = original.reference(1).unwrap();
        }
        assert_eq!(cell.repr_hash(), original.repr_hash());

        let mut slice = cell.as_slice().unwrap();
        let mut buffer = [0u8; 16];
        let bits = slice.size_bits();
        slice.load_raw(&mut buffer, bits).unwrap();
        assert!(buffer.starts_with(b"hash-test-"));
    }
}
