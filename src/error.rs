//! Error types for cell construction, traversal and Merkle operations.

/// Error type for cell related errors.
#[derive(Debug, Clone, Copy, Eq, PartialEq, thiserror::Error)]
pub enum Error {
    /// There were not enough bits or refs in the cell slice.
    #[error("cell underflow")]
    CellUnderflow,
    /// There were not enough bits or refs capacity in the cell builder.
    #[error("cell overflow")]
    CellOverflow,
    /// The leading bytes of a special cell do not match its declared kind,
    /// or the special cell layout is malformed.
    #[error("invalid special cell header")]
    InvalidSpecialHeader,
    /// The tree of cells is too deep.
    #[error("cell depth overflow")]
    DepthOverflow,
    /// A Merkle proof can only be built on top of a zero-level root.
    #[error("proof root must have zero level")]
    InvalidRootLevel,
    /// The two Merkle proofs attach to different roots.
    #[error("proofs have different roots")]
    RootMismatch,
    /// The cell is not a well-formed Merkle proof wrapper.
    #[error("failed to unpack Merkle proof cell")]
    ProofUnpackError,
    /// The proof filter rejected the root cell.
    #[error("proof contains no cells")]
    EmptyProof,
    /// Malformed input data (BOC or cell layout).
    #[error("invalid data")]
    InvalidData,
    /// Descended into a pruned branch through a virtualized view.
    ///
    /// Signals that the proof is insufficient for the query rather than
    /// invalid. Carries the virtualization counter of the view.
    #[error("pruned branch access (virtualization {0})")]
    PrunedBranchAccess(u8),
}

impl Error {
    /// Returns `true` for the distinguished "proof insufficient" failure.
    pub const fn is_pruned_branch_access(&self) -> bool {
        matches!(self, Self::PrunedBranchAccess(_))
    }
}
