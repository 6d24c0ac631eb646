//! BOC (Bag Of Cells) binary cell exchange format.

use crate::cell::Cell;
use crate::error::Error;

mod de;
mod ser;

pub(crate) const BOC_MAGIC: [u8; 4] = [0xb5, 0xee, 0x9c, 0x72];

pub(crate) const HAS_INDEX_FLAG: u8 = 0b1000_0000;
pub(crate) const HAS_CRC_FLAG: u8 = 0b0100_0000;
pub(crate) const HAS_CACHE_BITS_FLAG: u8 = 0b0010_0000;
pub(crate) const REF_SIZE_MASK: u8 = 0b0000_0111;

/// Converter between cell trees and the BOC bytes.
pub struct Boc;

impl Boc {
    /// Encodes the cell tree into bytes.
    ///
    /// Virtualized views cannot be serialized and fail with
    /// [`Error::InvalidData`].
    pub fn encode(root: &Cell) -> Result<Vec<u8>, Error> {
        ser::serialize(root, false)
    }

    /// Encodes the cell tree into bytes with a trailing CRC-32C checksum.
    pub fn encode_with_crc(root: &Cell) -> Result<Vec<u8>, Error> {
        ser::serialize(root, true)
    }

    /// Decodes a single root cell from the bytes, verifying the
    /// checksum when one is present.
    ///
    /// Every cell is rebuilt and re-finalized, so all structural
    /// invariants of the tree are re-validated on the way in.
    pub fn decode<T: AsRef<[u8]>>(data: T) -> Result<Cell, Error> {
        de::deserialize(data.as_ref())
    }

    /// Encodes the cell tree into a base64 string.
    #[cfg(feature = "base64")]
    pub fn encode_base64(root: &Cell) -> Result<String, Error> {
        use base64::Engine as _;
        let boc = ok!(Self::encode(root));
        Ok(base64::engine::general_purpose::STANDARD.encode(boc))
    }

    /// Decodes a single root cell from a base64 string.
    #[cfg(feature = "base64")]
    pub fn decode_base64<T: AsRef<[u8]>>(data: T) -> Result<Cell, Error> {
        use base64::Engine as _;
        match base64::engine::general_purpose::STANDARD.decode(data) {
            Ok(data) => Self::decode(data),
            Err(_) => Err(Error::InvalidData),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prelude::*;

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
    fn round_trip_preserves_hashes() -> anyhow::Result<()> {
        let shared = leaf(0x55aa);
        let left = branch(1, &[&shared]);
        let right = branch(2, &[&shared, &leaf(7)]);
        let root = branch(0, &[&left, &right]);

        for encoded in [Boc::encode(&root)?, Boc::encode_with_crc(&root)?] {
            let decoded = Boc::decode(&encoded)?;
            assert_eq!(decoded, root);
            assert_eq!(decoded.repr_depth(), root.repr_depth());
            // Bit-exact re-encoding
            assert_eq!(Boc::encode(&decoded)?, Boc::encode(&root)?);
        }
        Ok(())
    }

    #[test]
    fn shared_subtrees_are_deduplicated() {
        let shared = leaf(42);
        let root = branch(0, &[&shared, &shared, &shared, &shared]);

        let encoded = Boc::encode(&root).unwrap();
        // magic + header(1 + 1 + 3 * 1 + 1 + 1) + root cell (2 + 1 + 4) + leaf (2 + 8)
        let leaf_record = 2 + 8;
        let root_record = 2 + 1 + 4;
        assert_eq!(encoded.len(), 4 + 7 + root_record + leaf_record);

        let decoded = Boc::decode(encoded).unwrap();
        assert_eq!(decoded, root);
    }

    #[test]
    fn exotic_cells_survive_the_round_trip() {
        let root = branch(0, &[&branch(1, &[&leaf(1), &leaf(2)]), &leaf(3)]);

        let mut cells = ahash::HashSet::default();
        cells.insert(*root.repr_hash());
        cells.insert(*root.reference(1).unwrap().repr_hash());

        let proof_cell = MerkleProof::create(&root, cells)
            .build()
            .unwrap()
            .build_cell()
            .unwrap();

        let encoded = Boc::encode_with_crc(&proof_cell).unwrap();
        let decoded = Boc::decode(encoded).unwrap();
        assert_eq!(decoded, proof_cell);
        assert_eq!(decoded.cell_type(), CellType::MerkleProof);

        let virtualized = MerkleProof::virtualize(&decoded, 1).unwrap();
        assert_eq!(virtualized.repr_hash(), root.repr_hash());
    }

    #[test]
    fn corrupted_body_fails_crc() {
        let root = branch(0, &[&leaf(0xdead), &leaf(0xbeef)]);
        let mut encoded = Boc::encode_with_crc(&root).unwrap();
        let original_hash = *root.repr_hash();

        // Flip one byte inside a cell record
        let target = encoded.len() - 10;
        encoded[target] ^= 0xff;
        assert!(Boc::decode(&encoded).is_err());

        // Flip it back
        encoded[target] ^= 0xff;
        let decoded = Boc::decode(&encoded).unwrap();
        assert_eq!(*decoded.repr_hash(), original_hash);
    }

    #[test]
    fn malformed_inputs_are_rejected() {
        assert_eq!(Boc::decode([]), Err(Error::InvalidData));
        assert_eq!(Boc::decode([0xb5, 0xee, 0x9c]), Err(Error::InvalidData));
        assert_eq!(
            Boc::decode([0xff, 0xee, 0x9c, 0x72, 0x01, 0x01, 0x00]),
            Err(Error::InvalidData)
        );

        let root = leaf(1);
        let encoded = Boc::encode(&root).unwrap();

        // Truncated input
        assert!(Boc::decode(&encoded[..encoded.len() - 1]).is_err());

        // Root count other than one
        let mut patched = encoded.clone();
        patched[7] = 2;
        assert_eq!(Boc::decode(patched), Err(Error::InvalidData));

        // Trailing garbage
        let mut patched = encoded;
        patched.push(0);
        assert_eq!(Boc::decode(patched), Err(Error::InvalidData));
    }

    #[cfg(feature = "base64")]
    #[test]
    fn base64_round_trip() {
        let root = branch(7, &[&leaf(1), &leaf(2)]);
        let encoded = Boc::encode_base64(&root).unwrap();
        let decoded = Boc::decode_base64(encoded).unwrap();
        assert_eq!(decoded, root);

        assert_eq!(Boc::decode_base64("not base64!"), Err(Error::InvalidData));
    }

    #[test]
    fn virtualized_views_are_rejected() {
        let root = leaf(3);
        let view = root.virtualize(VirtualizationParams {
            level: 0,
            virtualization: 1,
        });
        assert_eq!(Boc::encode(&view), Err(Error::InvalidData));
    }
}
