//! BOC deserializer.

use smallvec::SmallVec;

use super::{BOC_MAGIC, HAS_CACHE_BITS_FLAG, HAS_CRC_FLAG, HAS_INDEX_FLAG, REF_SIZE_MASK};
use crate::cell::{Cell, CellBuilder, CellDescriptor, MAX_REF_COUNT};
use crate::error::Error;

struct ByteReader<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> ByteReader<'a> {
    fn read_bytes(&mut self, len: usize) -> Result<&'a [u8], Error> {
        match self.data.get(self.offset..self.offset + len) {
            Some(bytes) => {
                self.offset += len;
                Ok(bytes)
            }
            None => Err(Error::InvalidData),
        }
    }

    fn read_u8(&mut self) -> Result<u8, Error> {
        let bytes = ok!(self.read_bytes(1));
        Ok(bytes[0])
    }

    fn read_number(&mut self, size: usize) -> Result<u64, Error> {
        let bytes = ok!(self.read_bytes(size));
        let mut value = 0u64;
        for byte in bytes {
            value = (value << 8) | *byte as u64;
        }
        Ok(value)
    }
}

struct RawCell<'a> {
    descriptor: CellDescriptor,
    data: &'a [u8],
    bit_len: u16,
    references: SmallVec<[u32; MAX_REF_COUNT]>,
}

pub(crate) fn deserialize(data: &[u8]) -> Result<Cell, Error> {
    let mut reader = ByteReader { data, offset: 0 };

    if ok!(reader.read_bytes(4)) != BOC_MAGIC {
        return Err(Error::InvalidData);
    }

    let flags = ok!(reader.read_u8());
    let has_index = flags & HAS_INDEX_FLAG != 0;
    let has_crc = flags & HAS_CRC_FLAG != 0;
    let has_cache_bits = flags & HAS_CACHE_BITS_FLAG != 0;
    let ref_size = (flags & REF_SIZE_MASK) as usize;
    if has_cache_bits || flags & 0b0001_1000 != 0 || ref_size == 0 || ref_size > 4 {
        return Err(Error::InvalidData);
    }

    let offset_size = ok!(reader.read_u8()) as usize;
    if offset_size == 0 || offset_size > 8 {
        return Err(Error::InvalidData);
    }

    let cell_count = ok!(reader.read_number(ref_size)) as usize;
    let root_count = ok!(reader.read_number(ref_size));
    let absent_count = ok!(reader.read_number(ref_size));
    let total_cells_size = ok!(reader.read_number(offset_size));

    // A single-root bag is expected
    if root_count != 1 || absent_count != 0 {
        return Err(Error::InvalidData);
    }

    let root_index = ok!(reader.read_number(ref_size)) as usize;
    if root_index >= cell_count {
        return Err(Error::InvalidData);
    }

    if has_index {
        ok!(reader.read_bytes(cell_count * offset_size));
    }

    // Each cell record is at least two descriptor bytes long
    if cell_count > data.len().saturating_sub(reader.offset) / 2 {
        return Err(Error::InvalidData);
    }

    let cells_start = reader.offset;
    let mut raw_cells = Vec::with_capacity(cell_count);
    for cell_index in 0..cell_count {
        let descriptor = CellDescriptor::new([ok!(reader.read_u8()), ok!(reader.read_u8())]);
        if descriptor.d1 & CellDescriptor::STORE_HASHES_MASK != 0
            || descriptor.reference_count() as usize > MAX_REF_COUNT
        {
            return Err(Error::InvalidData);
        }

        let byte_len = descriptor.byte_len() as usize;
        let cell_data = ok!(reader.read_bytes(byte_len));

        let bit_len = if descriptor.is_aligned() {
            byte_len as u16 * 8
        } else {
            // The completion tag delimits the data
            let last = cell_data[byte_len - 1];
            let trailing = last.trailing_zeros() as u16;
            if trailing >= 8 {
                return Err(Error::InvalidData);
            }
            byte_len as u16 * 8 - trailing - 1
        };

        let mut references = SmallVec::new();
        for _ in 0..descriptor.reference_count() {
            let index = ok!(reader.read_number(ref_size)) as usize;
            // References must point forward
            if index <= cell_index || index >= cell_count {
                return Err(Error::InvalidData);
            }
            references.push(index as u32);
        }

        raw_cells.push(RawCell {
            descriptor,
            data: cell_data,
            bit_len,
            references,
        });
    }

    if (reader.offset - cells_start) as u64 != total_cells_size {
        return Err(Error::InvalidData);
    }

    if has_crc {
        let checksum_offset = reader.offset;
        let bytes = ok!(reader.read_bytes(4));
        let stored = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        if crc32c::crc32c(&data[..checksum_offset]) != stored {
            return Err(Error::InvalidData);
        }
    }

    if reader.offset != data.len() {
        return Err(Error::InvalidData);
    }

    // Rebuild cells from the last record up, so that children
    // are always finalized before their parents
    let mut cells: Vec<Option<Cell>> = vec![None; cell_count];
    for cell_index in (0..cell_count).rev() {
        let raw = &raw_cells[cell_index];

        let mut builder = CellBuilder::new();
        builder.set_exotic(raw.descriptor.is_exotic());
        ok!(builder.store_raw(raw.data, raw.bit_len));
        for reference in &raw.references {
            match &cells[*reference as usize] {
                Some(child) => ok!(builder.store_reference(child.clone())),
                None => return Err(Error::InvalidData),
            }
        }

        let cell = ok!(builder.build());
        // The advertised level must match the reconstructed one
        if cell.descriptor() != raw.descriptor {
            return Err(Error::InvalidData);
        }
        cells[cell_index] = Some(cell);
    }

    match cells[root_index].take() {
        Some(root) => Ok(root),
        None => Err(Error::InvalidData),
    }
}
