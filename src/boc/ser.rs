//! BOC serializer.

use super::{BOC_MAGIC, HAS_CRC_FLAG};
use crate::cell::Cell;
use crate::error::Error;

pub(crate) fn serialize(root: &Cell, include_crc: bool) -> Result<Vec<u8>, Error> {
    // Virtualized views publish adjusted hashes and cannot be
    // reconstructed from their raw data
    if root.virtualization() != 0 {
        return Err(Error::InvalidData);
    }

    let cells = ok!(collect_cells(root));

    let mut indices =
        ahash::HashMap::with_capacity_and_hasher(cells.len(), Default::default());
    for (index, cell) in cells.iter().enumerate() {
        indices.insert(*cell.repr_hash(), index as u64);
    }

    let cell_count = cells.len() as u64;
    let ref_size = number_size(cell_count);

    let mut total_cells_size = 0u64;
    for cell in &cells {
        total_cells_size += 2
            + cell.descriptor().byte_len() as u64
            + cell.reference_count() as u64 * ref_size as u64;
    }
    let offset_size = number_size(total_cells_size);

    let mut output = Vec::with_capacity(
        4 + 2 + (ref_size as usize) * 4 + offset_size as usize + total_cells_size as usize + 4,
    );

    output.extend_from_slice(&BOC_MAGIC);
    output.push(if include_crc { HAS_CRC_FLAG } else { 0 } | ref_size);
    output.push(offset_size);
    write_number(&mut output, cell_count, ref_size);
    write_number(&mut output, 1, ref_size); // root count
    write_number(&mut output, 0, ref_size); // absent count
    write_number(&mut output, total_cells_size, offset_size);
    write_number(&mut output, 0, ref_size); // root index

    for cell in &cells {
        let descriptor = cell.descriptor();
        output.push(descriptor.d1);
        output.push(descriptor.d2);
        output.extend_from_slice(cell.data());
        for child in cell.references() {
            match indices.get(child.repr_hash()) {
                Some(index) => write_number(&mut output, *index, ref_size),
                None => return Err(Error::InvalidData),
            }
        }
    }

    if include_crc {
        let checksum = crc32c::crc32c(&output);
        output.extend_from_slice(&checksum.to_le_bytes());
    }

    Ok(output)
}

/// Collects the distinct cells of the tree in reverse post-order,
/// so that every reference points forward.
fn collect_cells(root: &Cell) -> Result<Vec<Cell>, Error> {
    let mut visited = ahash::HashSet::default();
    let mut post_order = Vec::new();

    visited.insert(*root.repr_hash());
    let mut stack: Vec<(Cell, u8)> = vec![(root.clone(), 0)];

    while let Some(last) = stack.last_mut() {
        if last.1 < last.0.reference_count() {
            let index = last.1;
            last.1 += 1;
            let child = ok!(last.0.reference(index));
            if visited.insert(*child.repr_hash()) {
                stack.push((child, 0));
            }
        } else if let Some((cell, _)) = stack.pop() {
            post_order.push(cell);
        }
    }

    post_order.reverse();
    Ok(post_order)
}

/// Returns the minimal number of bytes needed to store the value.
pub(crate) fn number_size(value: u64) -> u8 {
    let bits = 64 - value.leading_zeros() as u8;
    std::cmp::max(1, (bits + 7) / 8)
}

pub(crate) fn write_number(output: &mut Vec<u8>, value: u64, size: u8) {
    output.extend_from_slice(&value.to_be_bytes()[8 - size as usize..]);
}
