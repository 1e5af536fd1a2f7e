// Copyright (c) 2024-present, vdo-core contributors
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Volume geometry: the fixed layout constants shared by every component
//! (spec §2 "Volume geometry", §3 "Slab", §6 "Geometry block").

use crate::coding::{Decode, DecodeError, Encode, EncodeError};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Read, Write};

/// Size in bytes of one physical block, fixed throughout the core.
pub const BLOCK_SIZE: usize = 4096;

/// Size in bytes of one on-disk sector (spec §6, reference-block format).
pub const SECTOR_SIZE: usize = 512;

/// Number of sectors packed into one 4 KiB block.
pub const SECTORS_PER_BLOCK: usize = BLOCK_SIZE / SECTOR_SIZE;

/// Bytes of sector-header overhead per sector (packed journal point).
const SECTOR_HEADER_SIZE: usize = 8;

/// Number of one-byte reference counters that fit in one sector, after
/// the packed journal point header.
pub const COUNTS_PER_SECTOR: usize = SECTOR_SIZE - SECTOR_HEADER_SIZE;

/// Number of reference counters packed into one 4 KiB reference block.
pub const COUNTS_PER_BLOCK: usize = COUNTS_PER_SECTOR * SECTORS_PER_BLOCK;

/// Size in bytes of one block-map page header (spec §6).
pub const BLOCK_MAP_PAGE_HEADER_SIZE: usize = 8 + 8 + 8 + 8;

/// Size in bytes of one packed block-map entry (36-bit PBN + 4-bit state,
/// byte-aligned to 5 bytes; see spec §3 "Block-map page").
pub const BLOCK_MAP_ENTRY_SIZE: usize = 5;

/// Number of entries that fit in one block-map page after the header.
pub const ENTRIES_PER_PAGE: usize =
    (BLOCK_SIZE - BLOCK_MAP_PAGE_HEADER_SIZE) / BLOCK_MAP_ENTRY_SIZE;

/// Height of the block-map tree (spec §3 "Block-map tree"). Leaves sit at
/// height 0; the root forest sits at height `TREE_HEIGHT`.
pub const TREE_HEIGHT: u32 = 5;

const GEOMETRY_MAGIC: [u8; 4] = *b"VDOG";
const GEOMETRY_VERSION: u32 = 1;

/// Fixed, validated layout of one volume (spec §6 item 1, "Geometry
/// block"). Shared read-only by every zone once the volume is open.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Geometry {
    /// Random per-volume value stored in the geometry block and echoed
    /// into every block-map page header, to detect stale writes from a
    /// previous incarnation of the device.
    pub nonce: u64,

    /// Total number of logical zones (== number of block-map tree roots
    /// and summary shards).
    pub zone_count: u32,

    /// `log2` of the number of PBNs in one slab. `slab_size() == 1 <<
    /// slab_size_shift`.
    pub slab_size_shift: u32,

    /// PBN of the first slab's origin.
    pub slab_origin: u64,

    /// Number of slabs in the volume.
    pub slab_count: u64,

    /// Quantization shift for the slab-summary free-block hint (spec §3
    /// "Slab summary entry").
    pub hint_shift: u32,

    /// PBN of each logical zone's block-map tree root, in zone order
    /// (spec §6 "Geometry block"). Empty until a volume's forest has
    /// actually been built; [`Self::with_block_map_roots`] fills it in.
    pub block_map_roots: Vec<u64>,
}

impl Geometry {
    /// Builds a new geometry, deriving `slab_count` from `block_count`;
    /// the derived layout is validated by [`Self::validate`].
    #[must_use]
    pub fn new(
        nonce: u64,
        zone_count: u32,
        slab_size_shift: u32,
        slab_origin: u64,
        slab_count: u64,
        hint_shift: u32,
    ) -> Self {
        Self {
            nonce,
            zone_count,
            slab_size_shift,
            slab_origin,
            slab_count,
            hint_shift,
            block_map_roots: Vec::new(),
        }
    }

    /// Records each zone's block-map tree root PBN, in zone order (spec
    /// §6 "Geometry block"). Called once a volume's forest has been built
    /// or loaded.
    #[must_use]
    pub fn with_block_map_roots(mut self, roots: Vec<u64>) -> Self {
        self.block_map_roots = roots;
        self
    }

    /// Total number of PBNs in one slab (`D + R + J`, spec §3 "Slab").
    #[must_use]
    pub fn slab_size(&self) -> u64 {
        1u64 << self.slab_size_shift
    }

    /// Number of reference counters one reference block holds; also the
    /// number of data blocks one reference block "covers" on disk.
    #[must_use]
    pub fn counts_per_block(&self) -> u64 {
        COUNTS_PER_BLOCK as u64
    }

    /// Splits a slab's total PBN span into `(data_blocks, ref_blocks,
    /// journal_blocks)`, maintaining `D + R + J == slab_size()`.
    ///
    /// The reference-block count is derived from how many counters `D`
    /// data blocks need; `journal_blocks` is a fixed small tail (spec
    /// leaves the exact journal sizing to the implementation — this
    /// crate reserves a conservative fixed count sufficient to batch a
    /// full reference block's worth of entries several times over).
    #[must_use]
    pub fn slab_layout(&self) -> SlabLayout {
        const JOURNAL_BLOCKS: u64 = 8;

        let total = self.slab_size();
        // Solve D such that ceil(D / COUNTS_PER_BLOCK) + D + JOURNAL_BLOCKS == total.
        // Start from an estimate and correct; COUNTS_PER_BLOCK is large relative
        // to typical slab sizes so one correction step suffices.
        let counts_per_block = self.counts_per_block();
        let mut data = total.saturating_sub(JOURNAL_BLOCKS);
        loop {
            let ref_blocks = data.div_ceil(counts_per_block).max(1);
            if data + ref_blocks + JOURNAL_BLOCKS <= total {
                break;
            }
            data = data.saturating_sub(1);
        }
        let ref_blocks = data.div_ceil(counts_per_block).max(1);

        SlabLayout {
            data_blocks: data,
            ref_blocks,
            journal_blocks: JOURNAL_BLOCKS,
        }
    }

    /// PBN of the origin of slab `index` (0-based).
    #[must_use]
    pub fn slab_origin_pbn(&self, index: u64) -> u64 {
        self.slab_origin + index * self.slab_size()
    }

    /// Returns `Some(slab_index)` if `pbn` falls inside any slab's span.
    #[must_use]
    pub fn slab_index_for_pbn(&self, pbn: u64) -> Option<u64> {
        if pbn < self.slab_origin {
            return None;
        }
        let offset = pbn - self.slab_origin;
        let index = offset >> self.slab_size_shift;
        if index < self.slab_count {
            Some(index)
        } else {
            None
        }
    }

    /// Validates that the layout is internally consistent (nonzero slab
    /// count, at least one zone, slab big enough to hold its own
    /// metadata).
    pub fn validate(&self) -> crate::error::Result<()> {
        if self.zone_count == 0 || self.slab_count == 0 {
            return Err(crate::error::Error::CorruptComponent);
        }
        let layout = self.slab_layout();
        if layout.data_blocks == 0 {
            return Err(crate::error::Error::CorruptComponent);
        }
        Ok(())
    }
}

/// The `{D, R, J}` split of one slab's PBN span (spec §3 "Slab").
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SlabLayout {
    /// Number of data blocks (`D`).
    pub data_blocks: u64,
    /// Number of reference-count blocks (`R`).
    pub ref_blocks: u64,
    /// Number of slab-journal blocks (`J`).
    pub journal_blocks: u64,
}

impl Encode for Geometry {
    fn encode_into<W: Write>(&self, writer: &mut W) -> Result<(), EncodeError> {
        writer.write_all(&GEOMETRY_MAGIC)?;
        writer.write_u32::<LittleEndian>(GEOMETRY_VERSION)?;
        writer.write_u64::<LittleEndian>(self.nonce)?;
        writer.write_u32::<LittleEndian>(self.zone_count)?;
        writer.write_u32::<LittleEndian>(self.slab_size_shift)?;
        writer.write_u64::<LittleEndian>(self.slab_origin)?;
        writer.write_u64::<LittleEndian>(self.slab_count)?;
        writer.write_u32::<LittleEndian>(self.hint_shift)?;

        writer.write_u32::<LittleEndian>(self.block_map_roots.len() as u32)?;
        for &root in &self.block_map_roots {
            writer.write_u64::<LittleEndian>(root)?;
        }
        Ok(())
    }
}

impl Decode for Geometry {
    fn decode_from<R: Read>(reader: &mut R) -> Result<Self, DecodeError> {
        let mut magic = [0u8; 4];
        reader.read_exact(&mut magic)?;
        if magic != GEOMETRY_MAGIC {
            return Err(DecodeError::InvalidMagic);
        }

        let version = reader.read_u32::<LittleEndian>()?;
        if version != GEOMETRY_VERSION {
            return Err(DecodeError::InvalidTag(("GeometryVersion", version as u8)));
        }

        let nonce = reader.read_u64::<LittleEndian>()?;
        let zone_count = reader.read_u32::<LittleEndian>()?;
        let slab_size_shift = reader.read_u32::<LittleEndian>()?;
        let slab_origin = reader.read_u64::<LittleEndian>()?;
        let slab_count = reader.read_u64::<LittleEndian>()?;
        let hint_shift = reader.read_u32::<LittleEndian>()?;

        let root_count = reader.read_u32::<LittleEndian>()?;
        let mut block_map_roots = Vec::with_capacity(root_count as usize);
        for _ in 0..root_count {
            block_map_roots.push(reader.read_u64::<LittleEndian>()?);
        }

        Ok(Self {
            nonce,
            zone_count,
            slab_size_shift,
            slab_origin,
            slab_count,
            hint_shift,
            block_map_roots,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Geometry {
        Geometry::new(0xDEAD_BEEF, 2, 13, 64, 4, 4)
    }

    #[test]
    fn encode_decode_roundtrip() {
        let geo = sample();
        let bytes = geo.encode_into_vec();
        let mut cursor = std::io::Cursor::new(bytes);
        let decoded = Geometry::decode_from(&mut cursor).expect("decode");
        assert_eq!(geo, decoded);
    }

    #[test]
    fn rejects_bad_magic() {
        let bytes = vec![0u8; 64];
        let mut cursor = std::io::Cursor::new(bytes);
        assert!(matches!(
            Geometry::decode_from(&mut cursor),
            Err(DecodeError::InvalidMagic)
        ));
    }

    #[test]
    fn slab_layout_sums_to_slab_size() {
        let geo = sample();
        let layout = geo.slab_layout();
        assert_eq!(
            layout.data_blocks + layout.ref_blocks + layout.journal_blocks,
            geo.slab_size()
        );
    }

    #[test]
    fn slab_lookup_by_pbn() {
        let geo = sample();
        let slab_size = geo.slab_size();
        assert_eq!(geo.slab_index_for_pbn(geo.slab_origin), Some(0));
        assert_eq!(geo.slab_index_for_pbn(geo.slab_origin + slab_size), Some(1));
        assert_eq!(geo.slab_index_for_pbn(geo.slab_origin - 1), None);
        assert_eq!(
            geo.slab_index_for_pbn(geo.slab_origin + geo.slab_count * slab_size),
            None
        );
    }

    #[test]
    fn block_map_roots_round_trip() {
        let geo = sample().with_block_map_roots(vec![100, 200, 300]);
        let bytes = geo.encode_into_vec();
        let mut cursor = std::io::Cursor::new(bytes);
        let decoded = Geometry::decode_from(&mut cursor).expect("decode");
        assert_eq!(decoded.block_map_roots, vec![100, 200, 300]);
    }

    #[test]
    fn validate_rejects_zero_counts() {
        let mut geo = sample();
        geo.slab_count = 0;
        assert!(geo.validate().is_err());
    }
}
