//! The crate prelude.

pub use crate::boc::Boc;
pub use crate::cell::{
    Cell, CellBuilder, CellDescriptor, CellSlice, CellType, HashBytes, LevelMask, UsageTree,
    UsageTreeMode, VirtualizationParams, EMPTY_CELL_HASH, MAX_BIT_LEN, MAX_DEPTH, MAX_REF_COUNT,
};
pub use crate::error::Error;
pub use crate::merkle::{
    make_pruned_branch, FilterAction, MerkleFilter, MerkleProof, MerkleProofBuilder, MerkleUpdate,
    MerkleUpdateBuilder,
};
