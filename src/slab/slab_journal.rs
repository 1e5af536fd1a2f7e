// Copyright (c) 2024-present, vdo-core contributors
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Slab journal: the ordered, append-only adjustment log that makes
//! reference-count mutations crash-recoverable (spec §4.2).
//!
//! Entries are batched into fixed-capacity blocks. Once a reference block
//! is dirtied by an entry, the owning journal block acquires a lock (its
//! sequence number); the lock is released only when every reference block
//! that depends on it has been flushed, which is what lets the journal
//! reclaim space (spec §4.2 "Locking").

use crate::coding::{Decode, DecodeError, Encode, EncodeError};
use crate::error::{Error, Result};
use crate::journal_point::JournalPoint;
use crate::slab::reference_counts::AdjustOperation;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::collections::BTreeMap;
use std::io::{Read, Write};

/// The three operation codes a slab journal entry can carry on disk.
/// Unlike [`AdjustOperation`], this carries no lock-possession bit: replay
/// never has a live PBN lock, so `DataDecrement` is always replayed as if
/// unlocked (spec §4.1 `replay`).
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum JournalOperationCode {
    DataIncrement = 0,
    DataDecrement = 1,
    BlockMapIncrement = 2,
}

impl JournalOperationCode {
    fn from_u8(value: u8) -> Result<Self, DecodeError> {
        match value {
            0 => Ok(Self::DataIncrement),
            1 => Ok(Self::DataDecrement),
            2 => Ok(Self::BlockMapIncrement),
            other => Err(DecodeError::InvalidTag(("JournalOperationCode", other))),
        }
    }

    /// The replay-mode adjustment this code drives (no live lock).
    #[must_use]
    pub fn as_adjust_operation(self) -> AdjustOperation {
        match self {
            Self::DataIncrement => AdjustOperation::DataIncrement,
            Self::DataDecrement => AdjustOperation::DataDecrement { lock_held: false },
            Self::BlockMapIncrement => AdjustOperation::BlockMapIncrement,
        }
    }
}

/// One journal entry: a slab-relative block number plus the operation
/// applied to its reference counter.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct SlabJournalEntry {
    /// Slab block number (0-based, within this slab's data region).
    pub sbn: u64,
    /// The adjustment this entry records.
    pub operation: JournalOperationCode,
}

impl Encode for SlabJournalEntry {
    fn encode_into<W: Write>(&self, writer: &mut W) -> Result<(), EncodeError> {
        writer.write_u64::<LittleEndian>(self.sbn)?;
        writer.write_u8(self.operation as u8)?;
        Ok(())
    }
}

impl Decode for SlabJournalEntry {
    fn decode_from<R: Read>(reader: &mut R) -> Result<Self, DecodeError> {
        let sbn = reader.read_u64::<LittleEndian>()?;
        let operation = JournalOperationCode::from_u8(reader.read_u8()?)?;
        Ok(Self { sbn, operation })
    }
}

/// One committed (or currently open) journal block: its sequence number
/// and the entries batched into it, in order.
#[derive(Clone, Debug, Default)]
pub struct JournalBlock {
    pub sequence_number: u64,
    pub entries: Vec<SlabJournalEntry>,
}

impl Encode for JournalBlock {
    fn encode_into<W: Write>(&self, writer: &mut W) -> Result<(), EncodeError> {
        writer.write_u64::<LittleEndian>(self.sequence_number)?;
        writer.write_u16::<LittleEndian>(self.entries.len() as u16)?;
        for entry in &self.entries {
            entry.encode_into(writer)?;
        }
        Ok(())
    }
}

impl Decode for JournalBlock {
    fn decode_from<R: Read>(reader: &mut R) -> Result<Self, DecodeError> {
        let sequence_number = reader.read_u64::<LittleEndian>()?;
        let count = reader.read_u16::<LittleEndian>()?;
        let mut entries = Vec::with_capacity(count as usize);
        for _ in 0..count {
            entries.push(SlabJournalEntry::decode_from(reader)?);
        }
        Ok(Self {
            sequence_number,
            entries,
        })
    }
}

/// The ordered adjustment log for one slab (spec §4.2).
pub struct SlabJournal {
    /// Maximum entries batched into one journal block before it commits
    /// and a new one opens.
    entries_per_block: usize,

    /// Every block produced so far, oldest first. In a full implementation
    /// these would be reclaimed once fully unlocked and flushed; this core
    /// keeps them all in memory, relying on `reapable_head` to tell the
    /// caller which prefix is safe to recycle on disk.
    blocks: Vec<JournalBlock>,

    /// Outstanding "reference blocks still depend on this sequence number"
    /// counts (spec §4.2 "Locking"). A sequence number with no entry here
    /// (or a zero count) is unlocked.
    locks: BTreeMap<u64, u32>,
}

impl SlabJournal {
    /// Builds an empty journal; `entries_per_block` bounds how many
    /// entries each journal block may batch.
    #[must_use]
    pub fn new(entries_per_block: usize) -> Self {
        assert!(entries_per_block > 0, "a journal block must hold at least one entry");
        Self {
            entries_per_block,
            blocks: vec![JournalBlock {
                sequence_number: 1,
                entries: vec![],
            }],
            locks: BTreeMap::new(),
        }
    }

    fn current_block_mut(&mut self) -> &mut JournalBlock {
        self.blocks.last_mut().expect("journal always has an open block")
    }

    /// Appends an entry, opening a new block if the current one is full.
    /// Returns the `JournalPoint` assigned to the entry.
    pub fn add_entry(&mut self, sbn: u64, operation: JournalOperationCode) -> JournalPoint {
        if self.current_block_mut().entries.len() >= self.entries_per_block {
            let next_sequence = self.blocks.last().unwrap().sequence_number + 1;
            self.blocks.push(JournalBlock {
                sequence_number: next_sequence,
                entries: vec![],
            });
        }

        let block = self.current_block_mut();
        let entry_count = block.entries.len() as u16;
        block.entries.push(SlabJournalEntry { sbn, operation });

        JournalPoint::new(block.sequence_number, entry_count)
    }

    /// Sequence number of the currently open (not-yet-full) block.
    #[must_use]
    pub fn current_sequence_number(&self) -> u64 {
        self.blocks.last().unwrap().sequence_number
    }

    /// Couples a reference block's dirtying to a slab-journal sequence
    /// number: `delta` is `+1` when a reference block is dirtied by an
    /// entry at `point` and has not yet acquired a lock, `-1` when that
    /// reference block is flushed (spec §4.2 "Locking",
    /// `adjust_slab_journal_block_reference`).
    pub fn adjust_slab_journal_block_reference(&mut self, point: JournalPoint, delta: i32) {
        let count = self.locks.entry(point.sequence_number).or_insert(0);
        let updated = i64::from(*count) + i64::from(delta);
        assert!(updated >= 0, "slab journal lock count for {point:?} went negative");
        *count = updated as u32;
        if *count == 0 {
            self.locks.remove(&point.sequence_number);
        }
    }

    /// Oldest sequence number still locked by an unflushed reference
    /// block, or the current open block's sequence number if nothing is
    /// locked (i.e. the whole journal could be reclaimed).
    #[must_use]
    pub fn reapable_head(&self) -> u64 {
        self.locks
            .keys()
            .next()
            .copied()
            .unwrap_or_else(|| self.current_sequence_number())
    }

    /// Whether `sequence_number` is still locked by at least one
    /// unflushed reference block.
    #[must_use]
    pub fn is_locked(&self, sequence_number: u64) -> bool {
        self.locks.get(&sequence_number).is_some_and(|&c| c > 0)
    }

    /// All committed blocks with `sequence_number >= from`, in order; used
    /// to drive replay after a crash (spec §4.1 `replay`, §5
    /// "Recovering").
    #[must_use]
    pub fn blocks_from(&self, from: u64) -> impl Iterator<Item = &JournalBlock> {
        self.blocks.iter().filter(move |b| b.sequence_number >= from)
    }

    /// Replays every entry from every block with `sequence_number >= from`
    /// against `apply`, in journal order, assigning each entry its
    /// original `JournalPoint`.
    pub fn replay_from(
        &self,
        from: u64,
        mut apply: impl FnMut(u64, AdjustOperation, JournalPoint) -> Result<()>,
    ) -> Result<()> {
        for block in self.blocks_from(from) {
            for (entry_count, entry) in block.entries.iter().enumerate() {
                let point = JournalPoint::new(block.sequence_number, entry_count as u16);
                apply(entry.sbn, entry.operation.as_adjust_operation(), point)?;
            }
        }
        Ok(())
    }
}
