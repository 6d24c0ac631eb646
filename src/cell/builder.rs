//! Append-only cell construction and finalization.

use sha2::{Digest, Sha256};
use smallvec::SmallVec;

use super::{
    Cell, CellDescriptor, CellImpl, CellSlice, CellType, DataCell, HashBytes, LevelMask,
    MAX_BIT_LEN, MAX_DEPTH, MAX_REF_COUNT,
};
use crate::error::Error;

const PRUNED_BRANCH_MIN_BITS: u16 = 16;
const LIBRARY_REFERENCE_BITS: u16 = 8 + 256;
const MERKLE_PROOF_DATA_BITS: u16 = 8 + 256 + 16;
const MERKLE_UPDATE_DATA_BITS: u16 = 8 + (256 + 16) * 2;

/// Builder for constructing cells with densely packed data.
pub struct CellBuilder {
    data: [u8; 128],
    bit_len: u16,
    is_exotic: bool,
    references: SmallVec<[Cell; MAX_REF_COUNT]>,
}

impl Default for CellBuilder {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

impl CellBuilder {
    /// Creates an empty cell builder.
    pub fn new() -> Self {
        Self {
            data: [0; 128],
            bit_len: 0,
            is_exotic: false,
            references: SmallVec::new(),
        }
    }

    /// Returns the number of bits stored so far.
    #[inline]
    pub const fn bit_len(&self) -> u16 {
        self.bit_len
    }

    /// Returns the number of references stored so far.
    #[inline]
    pub fn reference_count(&self) -> u8 {
        self.references.len() as u8
    }

    /// Returns whether the builder can fit the specified bits and refs.
    pub fn has_capacity(&self, bits: u16, refs: u8) -> bool {
        self.bit_len + bits <= MAX_BIT_LEN
            && self.references.len() + refs as usize <= MAX_REF_COUNT
    }

    /// Marks the cell under construction as exotic.
    ///
    /// The kind is resolved from the leading data byte at build time.
    pub fn set_exotic(&mut self, is_exotic: bool) {
        self.is_exotic = is_exotic;
    }

    /// Appends the first `bits` bits of `data`.
    pub fn store_raw(&mut self, data: &[u8], bits: u16) -> Result<(), Error> {
        if bits == 0 {
            return Ok(());
        }
        if (data.len() as u64) * 8 < bits as u64 {
            return Err(Error::CellUnderflow);
        }
        if self.bit_len + bits > MAX_BIT_LEN {
            return Err(Error::CellOverflow);
        }

        let offset = self.bit_len as usize;
        let rem = (offset % 8) as u8;
        let pos = offset / 8;
        let tail_bits = (bits % 8) as u8;
        let src_bytes = (bits as usize + 7) / 8;

        for i in 0..src_bytes {
            let mut byte = data[i];
            if i + 1 == src_bytes && tail_bits != 0 {
                byte &= 0xff << (8 - tail_bits);
            }
            if rem == 0 {
                self.data[pos + i] |= byte;
            } else {
                self.data[pos + i] |= byte >> rem;
                let spill = byte << (8 - rem);
                if pos + i + 1 < self.data.len() {
                    self.data[pos + i + 1] |= spill;
                }
            }
        }

        self.bit_len += bits;
        Ok(())
    }

    /// Appends one zero bit.
    pub fn store_bit_zero(&mut self) -> Result<(), Error> {
        self.store_zeros(1)
    }

    /// Appends one bit set to one.
    pub fn store_bit_one(&mut self) -> Result<(), Error> {
        self.store_bit(true)
    }

    /// Appends one bit.
    pub fn store_bit(&mut self, bit: bool) -> Result<(), Error> {
        if self.bit_len >= MAX_BIT_LEN {
            return Err(Error::CellOverflow);
        }
        if bit {
            let offset = self.bit_len as usize;
            self.data[offset / 8] |= 0x80 >> (offset % 8);
        }
        self.bit_len += 1;
        Ok(())
    }

    /// Appends the specified number of zero bits.
    pub fn store_zeros(&mut self, bits: u16) -> Result<(), Error> {
        if self.bit_len + bits > MAX_BIT_LEN {
            return Err(Error::CellOverflow);
        }
        self.bit_len += bits;
        Ok(())
    }

    /// Appends the low `bits` bits (at most 8) of the value.
    pub fn store_small_uint(&mut self, value: u8, bits: u16) -> Result<(), Error> {
        if bits == 0 {
            return Ok(());
        }
        if bits > 8 {
            return Err(Error::CellOverflow);
        }
        self.store_raw(&[value << (8 - bits)], bits)
    }

    /// Appends one byte.
    pub fn store_u8(&mut self, value: u8) -> Result<(), Error> {
        self.store_raw(&[value], 8)
    }

    /// Appends a big-endian `u16`.
    pub fn store_u16(&mut self, value: u16) -> Result<(), Error> {
        self.store_raw(&value.to_be_bytes(), 16)
    }

    /// Appends a big-endian `u32`.
    pub fn store_u32(&mut self, value: u32) -> Result<(), Error> {
        self.store_raw(&value.to_be_bytes(), 32)
    }

    /// Appends a big-endian `u64`.
    pub fn store_u64(&mut self, value: u64) -> Result<(), Error> {
        self.store_raw(&value.to_be_bytes(), 64)
    }

    /// Appends a big-endian `u128`.
    pub fn store_u128(&mut self, value: u128) -> Result<(), Error> {
        self.store_raw(&value.to_be_bytes(), 128)
    }

    /// Appends 32 bytes.
    pub fn store_u256(&mut self, value: &HashBytes) -> Result<(), Error> {
        self.store_raw(value.as_slice(), 256)
    }

    /// Appends the remaining data bits and references of the slice.
    pub fn store_slice(&mut self, slice: &CellSlice<'_>) -> Result<(), Error> {
        let bits = slice.size_bits();
        let refs = slice.size_refs();
        if !self.has_capacity(bits, refs) {
            return Err(Error::CellOverflow);
        }
        let mut buffer = [0u8; 128];
        ok!(slice.get_raw(0, &mut buffer, bits));
        ok!(self.store_raw(&buffer, bits));
        for index in 0..refs {
            ok!(self.store_reference(ok!(slice.get_reference(index))));
        }
        Ok(())
    }

    /// Appends all data bits of the specified cell.
    pub fn store_cell_data(&mut self, cell: &Cell) -> Result<(), Error> {
        self.store_raw(cell.data(), cell.bit_len())
    }

    /// Appends a child reference.
    pub fn store_reference(&mut self, cell: Cell) -> Result<(), Error> {
        if self.references.len() >= MAX_REF_COUNT {
            return Err(Error::CellOverflow);
        }
        self.references.push(cell);
        Ok(())
    }

    /// Finalizes the cell, computing all representation hashes.
    pub fn build(self) -> Result<Cell, Error> {
        let bit_len = self.bit_len;
        let byte_len = ((bit_len + 7) / 8) as usize;
        let mut data = self.data[..byte_len].to_vec();
        if bit_len % 8 != 0 {
            // Completion tag, so that the data is self delimiting
            data[byte_len - 1] |= 0x80 >> (bit_len % 8);
        }

        let refs = self.references.len() as u8;
        let (cell_type, level_mask) = if self.is_exotic {
            ok!(resolve_exotic(&data, bit_len, &self.references))
        } else {
            let mut mask = LevelMask::EMPTY;
            for child in &self.references {
                mask |= child.level_mask();
            }
            (CellType::Ordinary, mask)
        };

        let descriptor = CellDescriptor::compute(refs, self.is_exotic, level_mask, bit_len);
        let is_merkle = cell_type.is_merkle();
        let is_pruned = cell_type.is_pruned_branch();
        let level = level_mask.level();

        let mut hashes = Vec::<(HashBytes, u16)>::with_capacity(level_mask.hash_count() as usize);

        if is_pruned {
            // Lower levels are answered from the stored pairs
            let stored_count = level_mask.apply(level - 1).hash_count() as usize;
            let depths_offset = 2 + stored_count * 32;
            for index in 0..stored_count {
                let mut hash = [0u8; 32];
                hash.copy_from_slice(&data[2 + index * 32..2 + (index + 1) * 32]);
                let depth = u16::from_be_bytes([
                    data[depths_offset + index * 2],
                    data[depths_offset + index * 2 + 1],
                ]);
                hashes.push((HashBytes(hash), depth));
            }
        }

        let mut computed = 0usize;
        for level_i in 0..=level {
            if !level_mask.contains(level_i) {
                continue;
            }
            // A pruned branch computes only its topmost hash
            if is_pruned && level_i != level {
                continue;
            }

            let applied = level_mask.apply(level_i);
            let d1 = CellDescriptor::compute(refs, self.is_exotic, applied, bit_len).d1;

            let mut hasher = Sha256::new();
            hasher.update([d1, descriptor.d2]);
            if computed == 0 {
                hasher.update(&data);
            } else {
                hasher.update(hashes[hashes.len() - 1].0.as_slice());
            }

            let child_level = level_i + is_merkle as u8;
            let mut depth = 0u16;
            for child in &self.references {
                let child_depth = child.depth(child_level);
                if child_depth >= MAX_DEPTH {
                    return Err(Error::DepthOverflow);
                }
                depth = std::cmp::max(depth, child_depth + 1);
                hasher.update(child_depth.to_be_bytes());
            }
            for child in &self.references {
                hasher.update(child.hash(child_level).as_slice());
            }

            hashes.push((HashBytes(hasher.finalize().into()), depth));
            computed += 1;
        }

        let mut virtualization = 0u8;
        for child in &self.references {
            virtualization = std::cmp::max(virtualization, child.virtualization());
        }

        Ok(Cell::new(CellImpl::Plain(DataCell {
            cell_type,
            descriptor,
            bit_len,
            data,
            references: self.references,
            hashes,
            virtualization,
        })))
    }
}

/// Resolves the kind and level mask of an exotic cell,
/// validating its layout.
fn resolve_exotic(
    data: &[u8],
    bit_len: u16,
    references: &[Cell],
) -> Result<(CellType, LevelMask), Error> {
    if bit_len < 8 {
        return Err(Error::InvalidSpecialHeader);
    }
    let Some(cell_type) = CellType::from_byte_exotic(data[0]) else {
        return Err(Error::InvalidSpecialHeader);
    };

    match cell_type {
        CellType::PrunedBranch => {
            if !references.is_empty() || bit_len < PRUNED_BRANCH_MIN_BITS {
                return Err(Error::InvalidSpecialHeader);
            }
            let level_mask = LevelMask::new(data[1]);
            if level_mask.to_byte() != data[1] || level_mask == LevelMask::EMPTY {
                return Err(Error::InvalidSpecialHeader);
            }
            let stored_count = level_mask.apply(level_mask.level() - 1).hash_count() as u16;
            if bit_len != PRUNED_BRANCH_MIN_BITS + stored_count * (256 + 16) {
                return Err(Error::InvalidSpecialHeader);
            }
            Ok((cell_type, level_mask))
        }
        CellType::LibraryReference => {
            if !references.is_empty() || bit_len != LIBRARY_REFERENCE_BITS {
                return Err(Error::InvalidSpecialHeader);
            }
            Ok((cell_type, LevelMask::EMPTY))
        }
        CellType::MerkleProof => {
            if references.len() != 1 || bit_len != MERKLE_PROOF_DATA_BITS {
                return Err(Error::InvalidSpecialHeader);
            }
            let child = &references[0];
            let stored_depth = u16::from_be_bytes([data[33], data[34]]);
            if data[1..33] != child.hash(0).0 || stored_depth != child.depth(0) {
                return Err(Error::InvalidSpecialHeader);
            }
            Ok((cell_type, child.level_mask().virtualize(1)))
        }
        CellType::MerkleUpdate => {
            if references.len() != 2 || bit_len != MERKLE_UPDATE_DATA_BITS {
                return Err(Error::InvalidSpecialHeader);
            }
            let old = &references[0];
            let new = &references[1];
            let old_depth = u16::from_be_bytes([data[65], data[66]]);
            let new_depth = u16::from_be_bytes([data[67], data[68]]);
            if data[1..33] != old.hash(0).0
                || data[33..65] != new.hash(0).0
                || old_depth != old.depth(0)
                || new_depth != new.depth(0)
            {
                return Err(Error::InvalidSpecialHeader);
            }
            Ok((
                cell_type,
                (old.level_mask() | new.level_mask()).virtualize(1),
            ))
        }
        CellType::Ordinary => Err(Error::InvalidSpecialHeader),
    }
}
