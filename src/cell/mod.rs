//! Cell model: immutable DAG nodes, level masks and virtualized views.

use std::fmt;
use std::sync::{Arc, OnceLock};

use smallvec::SmallVec;

use crate::error::Error;

pub use self::builder::CellBuilder;
pub use self::slice::CellSlice;
pub use self::usage_tree::{UsageTree, UsageTreeMode};

use self::usage_tree::UsageCell;

pub mod builder;
pub mod slice;
pub mod usage_tree;

/// Maximum number of data bits in a cell.
pub const MAX_BIT_LEN: u16 = 1023;
/// Maximum number of child references in a cell.
pub const MAX_REF_COUNT: usize = 4;
/// Maximum depth of a tree of cells.
pub const MAX_DEPTH: u16 = 1024;

/// Representation hash of the cell with no data and no references.
pub static EMPTY_CELL_HASH: &HashBytes = &HashBytes([
    0x96, 0xa2, 0x96, 0xd2, 0x24, 0xf2, 0x85, 0xc6, 0x7b, 0xee, 0x93, 0xc3, 0x0f, 0x8a, 0x30, 0x91,
    0x57, 0xf0, 0xda, 0xa3, 0x5d, 0xc5, 0xb8, 0x7e, 0x41, 0x0b, 0x78, 0x63, 0x0a, 0x09, 0xcf, 0xc7,
]);

/// 256-bit cell identity.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct HashBytes(pub [u8; 32]);

impl HashBytes {
    /// A hash with all bytes set to zero.
    pub const ZERO: Self = Self([0; 32]);

    /// Returns the underlying byte array.
    #[inline]
    pub const fn as_array(&self) -> &[u8; 32] {
        &self.0
    }

    /// Returns a byte slice of the hash.
    #[inline]
    pub const fn as_slice(&self) -> &[u8] {
        self.0.as_slice()
    }
}

impl From<[u8; 32]> for HashBytes {
    #[inline]
    fn from(value: [u8; 32]) -> Self {
        Self(value)
    }
}

impl AsRef<[u8]> for HashBytes {
    #[inline]
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for HashBytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut output = [0u8; 64];
        hex::encode_to_slice(self.0, &mut output).ok();
        // Hex output is always ASCII
        f.write_str(std::str::from_utf8(&output).unwrap_or_default())
    }
}

impl fmt::Debug for HashBytes {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// Cell kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CellType {
    /// Cell of this type just stores data and references.
    Ordinary,
    /// Exotic cell which was pruned from the original tree of cells
    /// when a Merkle proof was created. Keeps only the hashes and depths
    /// of the removed subtree.
    PrunedBranch,
    /// Exotic cell with a reference to some library cell.
    LibraryReference,
    /// Exotic cell with a Merkle proof as its only child.
    MerkleProof,
    /// Exotic cell with the Merkle difference between two trees of cells.
    MerkleUpdate,
}

impl CellType {
    /// Returns whether this cell type is Merkle proof or Merkle update.
    #[inline]
    pub const fn is_merkle(self) -> bool {
        matches!(self, Self::MerkleProof | Self::MerkleUpdate)
    }

    /// Returns whether the cell is not ordinary.
    #[inline]
    pub const fn is_exotic(self) -> bool {
        !matches!(self, Self::Ordinary)
    }

    /// Returns whether the cell is a pruned branch.
    #[inline]
    pub const fn is_pruned_branch(self) -> bool {
        matches!(self, Self::PrunedBranch)
    }

    /// Encodes the cell type as the leading byte of the cell data.
    pub const fn to_byte(self) -> u8 {
        match self {
            Self::Ordinary => 0xff,
            Self::PrunedBranch => 1,
            Self::LibraryReference => 2,
            Self::MerkleProof => 3,
            Self::MerkleUpdate => 4,
        }
    }

    /// Decodes a cell type from the leading byte of the cell data.
    pub const fn from_byte_exotic(byte: u8) -> Option<Self> {
        match byte {
            1 => Some(Self::PrunedBranch),
            2 => Some(Self::LibraryReference),
            3 => Some(Self::MerkleProof),
            4 => Some(Self::MerkleUpdate),
            _ => None,
        }
    }
}

/// Tightly packed level info of a cell.
///
/// A level `l` (`1..=3`) is present when bit `l - 1` is set; level 0
/// is always present. The level of the mask is the highest present level.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct LevelMask(u8);

impl LevelMask {
    /// Mask with no levels above zero.
    pub const EMPTY: Self = Self(0);
    /// Max cell level.
    pub const MAX_LEVEL: u8 = 3;

    /// Constructs a new level mask, truncating extra bits.
    #[inline]
    pub const fn new(mask: u8) -> Self {
        Self(mask & 0b111)
    }

    /// Creates a mask with only the specified level present.
    #[inline]
    pub const fn from_level(level: u8) -> Self {
        if level == 0 {
            Self::EMPTY
        } else {
            Self::new(1 << (level - 1))
        }
    }

    /// Returns the raw mask byte.
    #[inline]
    pub const fn to_byte(self) -> u8 {
        self.0
    }

    /// Returns the highest present level.
    #[inline]
    pub const fn level(self) -> u8 {
        (8 - self.0.leading_zeros()) as u8
    }

    /// Removes all levels above the specified one.
    #[inline]
    pub const fn apply(self, level: u8) -> Self {
        let level = if level > Self::MAX_LEVEL {
            Self::MAX_LEVEL
        } else {
            level
        };
        Self(self.0 & ((1 << level) - 1))
    }

    /// Shifts the mask down by the specified offset.
    #[inline]
    pub const fn virtualize(self, offset: u8) -> Self {
        if offset >= 8 {
            Self::EMPTY
        } else {
            Self(self.0 >> offset)
        }
    }

    /// Returns whether the specified level is present in the mask.
    #[inline]
    pub const fn contains(self, level: u8) -> bool {
        level == 0 || (level <= Self::MAX_LEVEL && self.0 & (1 << (level - 1)) != 0)
    }

    /// Returns the index of the hash for the specified level.
    #[inline]
    pub const fn hash_index(self, level: u8) -> u8 {
        self.apply(level).0.count_ones() as u8
    }

    /// Returns the number of hashes a cell with this mask carries.
    #[inline]
    pub const fn hash_count(self) -> u8 {
        self.0.count_ones() as u8 + 1
    }
}

impl std::ops::BitOr for LevelMask {
    type Output = Self;

    #[inline]
    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl std::ops::BitOrAssign for LevelMask {
    #[inline]
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for LevelMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:03b}", self.0)
    }
}

impl fmt::Display for LevelMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Two descriptor bytes of a cell: reference count with flags,
/// and the data length info.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct CellDescriptor {
    /// First descriptor byte with a generic info about cell.
    pub d1: u8,
    /// Second descriptor byte with a packed data size.
    pub d2: u8,
}

impl CellDescriptor {
    /// Bit mask of the reference count part of `d1`.
    pub const REF_COUNT_MASK: u8 = 0b0000_0111;
    /// Bit of `d1` which is set for exotic cells.
    pub const IS_EXOTIC_MASK: u8 = 0b0000_1000;
    /// Bit of `d1` which is set when hashes are stored alongside the cell.
    pub const STORE_HASHES_MASK: u8 = 0b0001_0000;
    /// Bit mask of the level part of `d1`.
    pub const LEVEL_MASK: u8 = 0b1110_0000;

    /// Constructs a descriptor from two raw bytes.
    #[inline]
    pub const fn new(bytes: [u8; 2]) -> Self {
        Self {
            d1: bytes[0],
            d2: bytes[1],
        }
    }

    /// Computes a descriptor for a cell with the specified info.
    pub const fn compute(refs: u8, is_exotic: bool, level_mask: LevelMask, bit_len: u16) -> Self {
        let d1 = refs
            | if is_exotic { Self::IS_EXOTIC_MASK } else { 0 }
            | (level_mask.to_byte() << 5);
        let d2 = ((bit_len / 8) + ((bit_len + 7) / 8)) as u8;
        Self { d1, d2 }
    }

    /// Returns the number of child references.
    #[inline]
    pub const fn reference_count(self) -> u8 {
        self.d1 & Self::REF_COUNT_MASK
    }

    /// Returns whether the cell is not ordinary.
    #[inline]
    pub const fn is_exotic(self) -> bool {
        self.d1 & Self::IS_EXOTIC_MASK != 0
    }

    /// Returns the level mask encoded in the descriptor.
    #[inline]
    pub const fn level_mask(self) -> LevelMask {
        LevelMask::new(self.d1 >> 5)
    }

    /// Returns the length of the cell data in bytes, padding included.
    #[inline]
    pub const fn byte_len(self) -> u8 {
        (self.d2 & 1) + (self.d2 >> 1)
    }

    /// Returns whether the cell data is byte aligned.
    #[inline]
    pub const fn is_aligned(self) -> bool {
        self.d2 & 1 == 0
    }
}

impl fmt::Debug for CellDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CellDescriptor")
            .field("d1", &format_args!("{:#04x}", self.d1))
            .field("d2", &format_args!("{:#04x}", self.d2))
            .finish()
    }
}

/// Parameters of a virtualized cell view.
///
/// `level` caps the effective level of the viewed cell; `virtualization`
/// is a monotone counter which disambiguates nested virtualizations and
/// is carried by [`Error::PrunedBranchAccess`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct VirtualizationParams {
    /// Effective level cap.
    pub level: u8,
    /// Virtualization counter.
    pub virtualization: u8,
}

/// Shared handle to an immutable cell.
///
/// Cheap to clone; all parts of the tree are shared between clones.
#[derive(Clone)]
pub struct Cell(Arc<CellImpl>);

pub(crate) enum CellImpl {
    /// Finalized cell with computed representation hashes.
    Plain(DataCell),
    /// View which records access events against a usage tree.
    Usage(UsageCell),
    /// View with the effective level capped by virtualization params.
    Virtual(VirtualCell),
}

pub(crate) struct DataCell {
    pub(crate) cell_type: CellType,
    pub(crate) descriptor: CellDescriptor,
    pub(crate) bit_len: u16,
    /// Cell data, byte padded with the completion tag when unaligned.
    pub(crate) data: Vec<u8>,
    pub(crate) references: SmallVec<[Cell; MAX_REF_COUNT]>,
    /// One `(hash, depth)` pair per hash index of the level mask.
    pub(crate) hashes: Vec<(HashBytes, u16)>,
    pub(crate) virtualization: u8,
}

pub(crate) struct VirtualCell {
    pub(crate) inner: Cell,
    pub(crate) params: VirtualizationParams,
}

impl VirtualCell {
    /// Fails when the view would expose the content of a pruned branch
    /// past the level cap.
    fn check_access(&self) -> Result<(), Error> {
        if self.inner.cell_type() == CellType::PrunedBranch
            && self.inner.level() > self.params.level
        {
            Err(Error::PrunedBranchAccess(self.params.virtualization))
        } else {
            Ok(())
        }
    }

    fn fix_level(&self, level: u8) -> u8 {
        self.level_mask().apply(level).level()
    }

    fn level_mask(&self) -> LevelMask {
        self.inner.level_mask().apply(self.params.level)
    }
}

impl Cell {
    pub(crate) fn new(inner: CellImpl) -> Self {
        Self(Arc::new(inner))
    }

    /// Returns the cell with no data and no references.
    pub fn empty_cell() -> Cell {
        static EMPTY: OnceLock<Cell> = OnceLock::new();
        EMPTY
            .get_or_init(|| match CellBuilder::new().build() {
                Ok(cell) => cell,
                Err(_) => unreachable!("an empty builder always finalizes"),
            })
            .clone()
    }

    /// Returns the cell kind.
    pub fn cell_type(&self) -> CellType {
        match &*self.0 {
            CellImpl::Plain(cell) => cell.cell_type,
            CellImpl::Usage(cell) => cell.inner().cell_type(),
            CellImpl::Virtual(cell) => cell.inner.cell_type(),
        }
    }

    /// Returns whether the cell is not ordinary.
    #[inline]
    pub fn is_exotic(&self) -> bool {
        self.cell_type().is_exotic()
    }

    /// Returns the descriptor bytes reflecting the effective level mask.
    pub fn descriptor(&self) -> CellDescriptor {
        match &*self.0 {
            CellImpl::Plain(cell) => cell.descriptor,
            CellImpl::Usage(cell) => cell.inner().descriptor(),
            CellImpl::Virtual(cell) => CellDescriptor::compute(
                cell.inner.reference_count(),
                cell.inner.is_exotic(),
                cell.level_mask(),
                cell.inner.bit_len(),
            ),
        }
    }

    /// Returns the cell data, byte padded with the completion tag.
    pub fn data(&self) -> &[u8] {
        match &*self.0 {
            CellImpl::Plain(cell) => &cell.data,
            CellImpl::Usage(cell) => cell.inner().data(),
            CellImpl::Virtual(cell) => cell.inner.data(),
        }
    }

    /// Returns the length of the cell data in bits.
    pub fn bit_len(&self) -> u16 {
        match &*self.0 {
            CellImpl::Plain(cell) => cell.bit_len,
            CellImpl::Usage(cell) => cell.inner().bit_len(),
            CellImpl::Virtual(cell) => cell.inner.bit_len(),
        }
    }

    /// Returns the number of child references.
    pub fn reference_count(&self) -> u8 {
        match &*self.0 {
            CellImpl::Plain(cell) => cell.references.len() as u8,
            CellImpl::Usage(cell) => cell.inner().reference_count(),
            CellImpl::Virtual(cell) => cell.inner.reference_count(),
        }
    }

    /// Returns the child cell at the specified index.
    ///
    /// Through a virtualized view a pruned branch past the level cap
    /// fails with [`Error::PrunedBranchAccess`]; an out of range index
    /// fails with [`Error::CellUnderflow`].
    pub fn reference(&self, index: u8) -> Result<Cell, Error> {
        match &*self.0 {
            CellImpl::Plain(cell) => match cell.references.get(index as usize) {
                Some(child) => Ok(child.clone()),
                None => Err(Error::CellUnderflow),
            },
            CellImpl::Usage(cell) => cell.reference(index),
            CellImpl::Virtual(cell) => {
                ok!(cell.check_access());
                let child = ok!(cell.inner.reference(index));
                let level = cell.params.level + cell.inner.cell_type().is_merkle() as u8;
                let child = VirtualCell {
                    inner: child,
                    params: VirtualizationParams {
                        level,
                        virtualization: cell.params.virtualization,
                    },
                };
                // Dereferencing a pruned branch past the level cap is
                // the distinguished "proof insufficient" signal
                ok!(child.check_access());
                Ok(Cell::new(CellImpl::Virtual(child)))
            }
        }
    }

    /// Returns an iterator over the child cells.
    pub fn references(&self) -> RefsIter<'_> {
        RefsIter {
            cell: self,
            len: self.reference_count(),
            index: 0,
        }
    }

    /// Returns the effective level mask.
    pub fn level_mask(&self) -> LevelMask {
        match &*self.0 {
            CellImpl::Plain(cell) => cell.descriptor.level_mask(),
            CellImpl::Usage(cell) => cell.inner().level_mask(),
            CellImpl::Virtual(cell) => cell.level_mask(),
        }
    }

    /// Returns the effective cell level.
    #[inline]
    pub fn level(&self) -> u8 {
        self.level_mask().level()
    }

    /// Returns the hash of the cell as seen from the specified level.
    pub fn hash(&self, level: u8) -> &HashBytes {
        match &*self.0 {
            CellImpl::Plain(cell) => cell.hash(level),
            CellImpl::Usage(cell) => cell.inner().hash(level),
            CellImpl::Virtual(cell) => cell.inner.hash(cell.fix_level(level)),
        }
    }

    /// Returns the depth of the cell as seen from the specified level.
    pub fn depth(&self, level: u8) -> u16 {
        match &*self.0 {
            CellImpl::Plain(cell) => cell.depth(level),
            CellImpl::Usage(cell) => cell.inner().depth(level),
            CellImpl::Virtual(cell) => cell.inner.depth(cell.fix_level(level)),
        }
    }

    /// Returns the representation hash of the cell.
    #[inline]
    pub fn repr_hash(&self) -> &HashBytes {
        self.hash(LevelMask::MAX_LEVEL)
    }

    /// Returns the representation depth of the cell.
    #[inline]
    pub fn repr_depth(&self) -> u16 {
        self.depth(LevelMask::MAX_LEVEL)
    }

    /// Returns the virtualization counter of the deepest view in the cell.
    pub fn virtualization(&self) -> u8 {
        match &*self.0 {
            CellImpl::Plain(cell) => cell.virtualization,
            CellImpl::Usage(cell) => cell.inner().virtualization(),
            CellImpl::Virtual(cell) => {
                std::cmp::max(cell.params.virtualization, cell.inner.virtualization())
            }
        }
    }

    /// Returns a read cursor over the cell data and references.
    ///
    /// Reading a tracked cell marks it as loaded on its usage tree.
    /// Reading the content of a pruned branch past the virtualization
    /// level cap fails with [`Error::PrunedBranchAccess`].
    pub fn as_slice(&self) -> Result<CellSlice<'_>, Error> {
        match &*self.0 {
            CellImpl::Plain(_) => {}
            CellImpl::Usage(cell) => cell.on_data_access(),
            CellImpl::Virtual(cell) => ok!(cell.check_access()),
        }
        Ok(CellSlice::new(self))
    }

    /// Returns a view of this cell with the effective level capped
    /// by the virtualization params.
    pub fn virtualize(&self, params: VirtualizationParams) -> Cell {
        Cell::new(CellImpl::Virtual(VirtualCell {
            inner: self.clone(),
            params,
        }))
    }

    /// Returns a multi-line listing of the whole subtree.
    pub fn display_tree(&self) -> DisplayCellTree<'_> {
        DisplayCellTree(self)
    }
}

impl Eq for Cell {}

impl PartialEq for Cell {
    #[inline]
    fn eq(&self, other: &Self) -> bool {
        self.repr_hash() == other.repr_hash()
    }
}

impl fmt::Debug for Cell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cell")
            .field("ty", &self.cell_type())
            .field("bit_len", &self.bit_len())
            .field("refs", &self.reference_count())
            .field("repr_hash", self.repr_hash())
            .finish()
    }
}

impl DataCell {
    fn hash(&self, level: u8) -> &HashBytes {
        let index = self.descriptor.level_mask().hash_index(level) as usize;
        let index = std::cmp::min(index, self.hashes.len() - 1);
        &self.hashes[index].0
    }

    fn depth(&self, level: u8) -> u16 {
        let index = self.descriptor.level_mask().hash_index(level) as usize;
        let index = std::cmp::min(index, self.hashes.len() - 1);
        self.hashes[index].1
    }
}

/// Iterator over the child cells.
///
/// Yields owned handles since tracked and virtualized parents
/// wrap their children on the fly.
#[derive(Clone)]
pub struct RefsIter<'a> {
    cell: &'a Cell,
    len: u8,
    index: u8,
}

impl<'a> RefsIter<'a> {
    /// Returns the cell whose references are iterated.
    #[inline]
    pub fn cell(&self) -> &'a Cell {
        self.cell
    }

    /// Returns the next child without advancing the iterator.
    pub fn peek(&self) -> Option<Cell> {
        if self.index < self.len {
            self.cell.reference(self.index).ok()
        } else {
            None
        }
    }
}

impl Iterator for RefsIter<'_> {
    type Item = Cell;

    fn next(&mut self) -> Option<Self::Item> {
        if self.index < self.len {
            let child = self.cell.reference(self.index);
            self.index += 1;
            debug_assert!(child.is_ok() || self.cell.virtualization() != 0);
            child.ok()
        } else {
            None
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = (self.len - self.index) as usize;
        (remaining, Some(remaining))
    }
}

/// Multi-line cell tree listing.
pub struct DisplayCellTree<'a>(&'a Cell);

impl fmt::Display for DisplayCellTree<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn write_cell(f: &mut fmt::Formatter<'_>, cell: &Cell, indent: usize) -> fmt::Result {
            writeln!(
                f,
                "{:indent$}{:?} bits={} refs={} {}",
                "",
                cell.cell_type(),
                cell.bit_len(),
                cell.reference_count(),
                cell.repr_hash(),
            )?;
            for index in 0..cell.reference_count() {
                if let Ok(child) = cell.reference(index) {
                    write_cell(f, &child, indent + 2)?;
                }
            }
            Ok(())
        }

        write_cell(f, self.0, 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_mask_levels() {
        assert_eq!(LevelMask::EMPTY.level(), 0);
        assert_eq!(LevelMask::new(0b001).level(), 1);
        assert_eq!(LevelMask::new(0b010).level(), 2);
        assert_eq!(LevelMask::new(0b011).level(), 2);
        assert_eq!(LevelMask::new(0b100).level(), 3);
        assert_eq!(LevelMask::new(0b111).level(), 3);

        assert_eq!(LevelMask::from_level(0), LevelMask::EMPTY);
        assert_eq!(LevelMask::from_level(2), LevelMask::new(0b010));
    }

    #[test]
    fn level_mask_apply_and_virtualize() {
        let mask = LevelMask::new(0b101);
        assert_eq!(mask.apply(0), LevelMask::EMPTY);
        assert_eq!(mask.apply(1), LevelMask::new(0b001));
        assert_eq!(mask.apply(2), LevelMask::new(0b001));
        assert_eq!(mask.apply(3), mask);
        assert_eq!(mask.apply(200), mask);

        assert_eq!(mask.virtualize(1), LevelMask::new(0b010));
        assert_eq!(mask.virtualize(2), LevelMask::new(0b001));
        assert_eq!(mask.virtualize(200), LevelMask::EMPTY);
    }

    #[test]
    fn level_mask_hash_indices() {
        let mask = LevelMask::new(0b101);
        assert_eq!(mask.hash_index(0), 0);
        assert_eq!(mask.hash_index(1), 1);
        assert_eq!(mask.hash_index(2), 1);
        assert_eq!(mask.hash_index(3), 2);
        assert_eq!(mask.hash_count(), 3);

        assert_eq!(LevelMask::EMPTY.hash_count(), 1);
    }

    #[test]
    fn descriptor_layout() {
        let descriptor = CellDescriptor::compute(3, true, LevelMask::new(0b010), 12);
        assert_eq!(descriptor.reference_count(), 3);
        assert!(descriptor.is_exotic());
        assert_eq!(descriptor.level_mask(), LevelMask::new(0b010));
        assert_eq!(descriptor.byte_len(), 2);
        assert!(!descriptor.is_aligned());

        let aligned = CellDescriptor::compute(0, false, LevelMask::EMPTY, 16);
        assert_eq!(aligned.byte_len(), 2);
        assert!(aligned.is_aligned());
    }

    #[test]
    fn empty_cell_hash() {
        let cell = Cell::empty_cell();
        assert_eq!(cell.repr_hash(), EMPTY_CELL_HASH);
        assert_eq!(cell.repr_depth(), 0);
        assert_eq!(cell.level(), 0);
    }

    #[test]
    fn virtualized_pruned_branch_access() {
        // Pruned branch at level 2 with two canned (hash, depth) pairs
        let mut builder = CellBuilder::new();
        builder.set_exotic(true);
        builder.store_u8(CellType::PrunedBranch.to_byte()).unwrap();
        builder.store_u8(0b011).unwrap();
        builder.store_u256(&HashBytes([0xab; 32])).unwrap();
        builder.store_u256(&HashBytes([0xcd; 32])).unwrap();
        builder.store_u16(12).unwrap();
        builder.store_u16(34).unwrap();
        let pruned = builder.build().unwrap();
        assert_eq!(pruned.cell_type(), CellType::PrunedBranch);
        assert_eq!(pruned.level(), 2);
        assert_eq!(pruned.hash(0), &HashBytes([0xab; 32]));
        assert_eq!(pruned.hash(1), &HashBytes([0xcd; 32]));
        assert_eq!(pruned.depth(0), 12);
        assert_eq!(pruned.depth(1), 34);

        let view = pruned.virtualize(VirtualizationParams {
            level: 1,
            virtualization: 7,
        });
        assert_eq!(view.level(), 1);
        assert_eq!(view.hash(3), &HashBytes([0xcd; 32]));
        assert_eq!(
            view.as_slice().map(|_| ()),
            Err(Error::PrunedBranchAccess(7))
        );
        assert_eq!(view.reference(0), Err(Error::PrunedBranchAccess(7)));

        // Within the level cap the content stays readable
        let view = pruned.virtualize(VirtualizationParams {
            level: 2,
            virtualization: 7,
        });
        assert!(view.as_slice().is_ok());
    }

    #[test]
    fn virtualized_ordinary_cell_stays_readable() {
        let mut builder = CellBuilder::new();
        builder.store_u32(0xf00d_f00d).unwrap();
        let cell = builder.build().unwrap();

        let view = cell.virtualize(VirtualizationParams {
            level: 0,
            virtualization: 3,
        });
        assert_eq!(view.level(), 0);
        assert_eq!(view.repr_hash(), cell.repr_hash());
        let mut slice = view.as_slice().unwrap();
        assert_eq!(slice.load_u32().unwrap(), 0xf00d_f00d);
    }
}
