// Copyright (c) 2024-present, vdo-core contributors
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! On-disk format of one block-map page (spec §6 "Block-map page"): a
//! fixed header followed by a packed array of 5-byte entries.

use crate::coding::{Decode, DecodeError, Encode, EncodeError};
use crate::geometry::{BLOCK_MAP_PAGE_HEADER_SIZE, BLOCK_SIZE, ENTRIES_PER_PAGE};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Read, Write};

/// 36-bit PBN mask used when packing a [`BlockMapEntry`] into 5 bytes.
const PBN_MASK: u64 = (1u64 << 36) - 1;

/// The state a block-map entry's target is in (spec glossary "Mapping
/// state"). Packed into the 4 high bits of the entry's 40-bit word.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum MappingState {
    /// No target; the entry's PBN field is meaningless.
    #[default]
    Unmapped,
    /// Points at a live target (a child block-map page, or — at height 0
    /// — a whole uncompressed data block).
    Mapped,
    /// Points at a target that is one fragment of a compressed block.
    Compressed,
}

impl MappingState {
    fn to_u8(self) -> u8 {
        match self {
            Self::Unmapped => 0,
            Self::Mapped => 1,
            Self::Compressed => 2,
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Mapped,
            2 => Self::Compressed,
            _ => Self::Unmapped,
        }
    }
}

/// One block-map entry: a 36-bit PBN and a 4-bit mapping state, packed
/// into 5 bytes on disk (spec §6, `BLOCK_MAP_ENTRY_SIZE`).
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct BlockMapEntry {
    /// Target PBN (a child page for interior entries, or a data/compressed
    /// block for leaf entries). Meaningless when `state` is `Unmapped`.
    pub pbn: u64,
    /// This entry's mapping state.
    pub state: MappingState,
}

impl BlockMapEntry {
    fn pack(self) -> [u8; 5] {
        let word = (self.pbn & PBN_MASK) | (u64::from(self.state.to_u8()) << 36);
        let bytes = word.to_le_bytes();
        let mut out = [0u8; 5];
        out.copy_from_slice(&bytes[..5]);
        out
    }

    fn unpack(bytes: [u8; 5]) -> Self {
        let mut buf = [0u8; 8];
        buf[..5].copy_from_slice(&bytes);
        let word = u64::from_le_bytes(buf);
        Self {
            pbn: word & PBN_MASK,
            state: MappingState::from_u8(((word >> 36) & 0xF) as u8),
        }
    }
}

/// The fixed 32-byte header of a block-map page (spec §6).
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct BlockMapPageHeader {
    /// This page's own PBN.
    pub pbn: u64,
    /// Volume nonce, echoed here to detect stale pages from a previous
    /// incarnation of the device.
    pub nonce: u64,
    /// Recovery-journal sequence number as of this page's last write.
    pub recovery_journal_seq: u64,
    /// Generation counter, bumped each time this page is rewritten.
    pub generation: u64,
}

/// One 4 KiB block-map page: header plus `ENTRIES_PER_PAGE` packed
/// entries (spec §3 "Block-map page", §6).
#[derive(Clone, Debug)]
pub struct BlockMapPage {
    pub header: BlockMapPageHeader,
    pub entries: Vec<BlockMapEntry>,
    pub dirty: bool,
}

impl BlockMapPage {
    /// Builds a fresh, all-`Unmapped` page at `pbn`.
    #[must_use]
    pub fn new(pbn: u64, nonce: u64, recovery_journal_seq: u64, generation: u64) -> Self {
        Self {
            header: BlockMapPageHeader {
                pbn,
                nonce,
                recovery_journal_seq,
                generation,
            },
            entries: vec![BlockMapEntry::default(); ENTRIES_PER_PAGE],
            dirty: true,
        }
    }
}

impl Encode for BlockMapPage {
    fn encode_into<W: Write>(&self, writer: &mut W) -> Result<(), EncodeError> {
        writer.write_u64::<LittleEndian>(self.header.pbn)?;
        writer.write_u64::<LittleEndian>(self.header.nonce)?;
        writer.write_u64::<LittleEndian>(self.header.recovery_journal_seq)?;
        writer.write_u64::<LittleEndian>(self.header.generation)?;

        for entry in &self.entries {
            writer.write_all(&entry.pack())?;
        }

        let used = BLOCK_MAP_PAGE_HEADER_SIZE + self.entries.len() * 5;
        for _ in used..BLOCK_SIZE {
            writer.write_u8(0)?;
        }
        Ok(())
    }
}

impl Decode for BlockMapPage {
    fn decode_from<R: Read>(reader: &mut R) -> Result<Self, DecodeError> {
        let pbn = reader.read_u64::<LittleEndian>()?;
        let nonce = reader.read_u64::<LittleEndian>()?;
        let recovery_journal_seq = reader.read_u64::<LittleEndian>()?;
        let generation = reader.read_u64::<LittleEndian>()?;

        let mut entries = Vec::with_capacity(ENTRIES_PER_PAGE);
        for _ in 0..ENTRIES_PER_PAGE {
            let mut buf = [0u8; 5];
            reader.read_exact(&mut buf)?;
            entries.push(BlockMapEntry::unpack(buf));
        }

        let used = BLOCK_MAP_PAGE_HEADER_SIZE + entries.len() * 5;
        let mut padding = vec![0u8; BLOCK_SIZE - used];
        reader.read_exact(&mut padding)?;

        Ok(Self {
            header: BlockMapPageHeader {
                pbn,
                nonce,
                recovery_journal_seq,
                generation,
            },
            entries,
            dirty: false,
        })
    }
}
