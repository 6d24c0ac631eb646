#![warn(missing_docs)]

//! Content-addressed cell DAG with Merkle proof machinery.
//!
//! The [`Cell`] is the core data structure of this crate: an immutable
//! node of a directed acyclic graph with **up to 1023 bits** of data and
//! **up to 4 references**, identified by a set of representation hashes
//! which are computed once when the cell is finalized.
//!
//! ## `Cell` vs `CellSlice` vs `CellBuilder`
//!
//! - [`Cell`] is a cheap shared handle to an immutable tree and provides
//!   only basic methods for accessing nodes and some meta info.
//!
//! - [`CellSlice`] is a read-only cursor over a part of some cell. It can
//!   only be obtained from an existing cell. The minimal data unit is one
//!   bit, so a slice is similar to a couple of ranges (bit range and refs
//!   range). All reads are total and report underflow as an error.
//!
//! - [`CellBuilder`] is used to create a new cell. It is an append-only
//!   structure and the only way to produce a finalized cell.
//!
//! ## Merkle stuff
//!
//! - A pruned branch is the "building block" of Merkle structures. A single
//!   pruned branch cell replaces a whole subtree and carries just the
//!   hashes and depths of its root.
//!
//! - [`MerkleProof`] contains a subset of the original tree of cells.
//!   In most cases it is created from the [`UsageTree`] of some visited
//!   cells: wrap a root with [`UsageTree::track`], drive a read-only query
//!   through the wrapper, and every inspected cell is kept while the rest
//!   collapses into pruned branches. A verifier applies
//!   [`MerkleProof::virtualize`] to see the proof as the original tree;
//!   descending into a pruned region fails with a distinguished
//!   [`PrunedBranchAccess`] error, which callers translate into a
//!   "proof insufficient" response.
//!
//! - [`MerkleProof::combine`] merges two proofs of the same root into
//!   one covering the union of their unpruned regions.
//!
//! - [`MerkleUpdate`] describes a difference between two trees of cells.
//!   It can be applied to the old cell to create the new cell.
//!
//! ## BOC
//!
//! BOC (Bag Of Cells) is a format for representing a tree of cells as
//! bytes. The [`Boc`] type converts between the two, with an optional
//! CRC-32C checksum on the wire.
//!
//! [`Cell`]: cell::Cell
//! [`CellSlice`]: cell::CellSlice
//! [`CellBuilder`]: cell::CellBuilder
//! [`UsageTree`]: cell::UsageTree
//! [`UsageTree::track`]: cell::UsageTree::track
//! [`MerkleProof`]: merkle::MerkleProof
//! [`MerkleProof::virtualize`]: merkle::MerkleProof::virtualize
//! [`MerkleProof::combine`]: merkle::MerkleProof::combine
//! [`MerkleUpdate`]: merkle::MerkleUpdate
//! [`PrunedBranchAccess`]: error::Error::PrunedBranchAccess
//! [`Boc`]: boc::Boc

/// Prevents using `From::from` for plain error conversion.
macro_rules! ok {
    ($e:expr $(,)?) => {
        match $e {
            core::result::Result::Ok(val) => val,
            core::result::Result::Err(err) => return core::result::Result::Err(err),
        }
    };
}

pub mod boc;
pub mod cell;
pub mod error;
pub mod merkle;
pub mod prelude;
