// Copyright (c) 2024-present, vdo-core contributors
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Journal points: the total-order commit tokens emitted by slab journals
//! and the recovery journal. See spec §3 "Journal point".

use crate::coding::{Decode, DecodeError, Encode, EncodeError};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Read, Write};

/// A `(sequence_number, entry_count)` pair with a total lexicographic
/// order, used to order slab-journal and recovery-journal entries.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct JournalPoint {
    /// Monotonically increasing sequence number of the journal block.
    pub sequence_number: u64,

    /// Index of the entry within its journal block.
    pub entry_count: u16,
}

impl JournalPoint {
    /// The point before any entry has ever been written.
    pub const ZERO: Self = Self {
        sequence_number: 0,
        entry_count: 0,
    };

    /// Creates a new journal point.
    #[must_use]
    pub fn new(sequence_number: u64, entry_count: u16) -> Self {
        Self {
            sequence_number,
            entry_count,
        }
    }

    /// Packs `self` into the wire representation used inside a reference
    /// block sector header: `(sequence_number << 16) | entry_count`.
    ///
    /// `entry_count` is limited to 16 bits in the wire format (it never
    /// needs to exceed `COUNTS_PER_BLOCK` in practice), so this packs into
    /// a single `u64` for the low 48 + 16 bits rather than needing 80
    /// bits total.
    #[must_use]
    pub fn pack(self) -> u64 {
        (self.sequence_number << 16) | u64::from(self.entry_count)
    }

    /// Unpacks a journal point from its wire representation.
    #[must_use]
    pub fn unpack(packed: u64) -> Self {
        Self {
            sequence_number: packed >> 16,
            entry_count: (packed & 0xFFFF) as u16,
        }
    }
}

impl Encode for JournalPoint {
    fn encode_into<W: Write>(&self, writer: &mut W) -> Result<(), EncodeError> {
        writer.write_u64::<LittleEndian>(self.pack())?;
        Ok(())
    }
}

impl Decode for JournalPoint {
    fn decode_from<R: Read>(reader: &mut R) -> Result<Self, DecodeError> {
        let packed = reader.read_u64::<LittleEndian>()?;
        Ok(Self::unpack(packed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn total_order() {
        let a = JournalPoint::new(1, 0);
        let b = JournalPoint::new(1, 1);
        let c = JournalPoint::new(2, 0);

        assert!(a < b);
        assert!(b < c);
        assert!(a < c);
    }

    #[test]
    fn pack_roundtrip() {
        let p = JournalPoint::new(0xABCD_EF01, 42);
        assert_eq!(p, JournalPoint::unpack(p.pack()));
    }

    #[test]
    fn encode_decode_roundtrip() {
        let p = JournalPoint::new(7, 3);
        let bytes = p.encode_into_vec();
        let mut cursor = std::io::Cursor::new(bytes);
        let decoded = JournalPoint::decode_from(&mut cursor).expect("decode");
        assert_eq!(p, decoded);
    }

    #[test]
    fn zero_is_smallest() {
        let p = JournalPoint::new(0, 1);
        assert!(JournalPoint::ZERO < p);
    }
}
