// Copyright (c) 2024-present, vdo-core contributors
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Per-slab reference-counting allocator (spec §4.1). The hardest single
//! piece of this core: a byte array of reference counts, the allocation
//! cursor that scans it, and the crash-safe persistence format.
//!
//! # Numeric semantics (spec §3, §4.1, and the worked scenarios in §8)
//!
//! Reading spec §3 and §4.1's transition table together, and resolving
//! them against scenarios S3/S6, fixes the byte semantics precisely:
//!
//! - `0` = FREE.
//! - `1..=253` = an exact SHARED/SINGLE data reference count.
//! - `254` reached via `DATA_INCREMENT` from `253`, or produced by
//!   `allocate`/`provisional_reference`, is an overloaded sentinel (spec
//!   §9 "Provisional reference as a magic count value"): it means
//!   PROVISIONAL if some [`crate::pbn_lock::PbnLock`] currently owns it,
//!   or "saturated data count" otherwise. This core tracks which case
//!   applies with an explicit side array (`provisional`) rather than
//!   trusting the byte alone, so `available_references` and `adjust` can
//!   both reason about it without aliasing.
//! - `255` is reserved exclusively for BLOCK_MAP_INCREMENT targets
//!   (interior block-map tree pages, which must never dedupe — spec
//!   invariant I2). It is never reached by a DATA operation.
//!
//! This resolution is recorded as an Open Question decision in
//! `DESIGN.md`.

use crate::coding::{Decode, DecodeError, Encode, EncodeError};
use crate::error::{Error, Result};
use crate::journal_point::JournalPoint;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Read, Write};

pub use crate::geometry::{COUNTS_PER_BLOCK, COUNTS_PER_SECTOR, SECTORS_PER_BLOCK};

/// Stored-byte value meaning PROVISIONAL-or-saturated (spec §3).
pub const PROVISIONAL_BYTE: u8 = 254;

/// Stored-byte value meaning "interior block-map tree page" (spec §3).
pub const MAXIMUM_BYTE: u8 = 255;

/// Ceiling a plain DATA reference count can reach before `DATA_INCREMENT`
/// starts returning [`Error::RefCountInvalid`] (scenario S6).
const DATA_COUNT_CEILING: u8 = PROVISIONAL_BYTE;

/// Coarse classification of one counter's stored byte, exactly as spec
/// §4.1 defines the status classifier: "0→FREE, 1→SINGLE, 254→
/// PROVISIONAL, else→SHARED". This is a reporting-only view — it does
/// not know whether a `254` is actually confirmed-saturated vs.
/// genuinely provisional; see the module docs for that distinction.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RefCountStatus {
    /// Stored byte 0.
    Free,
    /// Stored byte 1.
    Single,
    /// Stored byte 254.
    Provisional,
    /// Any other nonzero byte (2..=253, or 255).
    Shared,
}

/// Classifies a raw stored byte per the spec §4.1 status classifier.
#[must_use]
pub fn classify_byte(byte: u8) -> RefCountStatus {
    match byte {
        0 => RefCountStatus::Free,
        1 => RefCountStatus::Single,
        PROVISIONAL_BYTE => RefCountStatus::Provisional,
        _ => RefCountStatus::Shared,
    }
}

/// The kind of adjustment `ReferenceCounts::adjust` applies (spec §4.1).
/// `replay`-mode BLOCK_MAP_INCREMENT is handled by
/// [`ReferenceCounts::replay`] instead, since it has materially different
/// semantics from the live path (see the transition table).
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum AdjustOperation {
    /// A live write confirms or grows a data reference.
    DataIncrement,
    /// A live write releases a data reference.
    DataDecrement {
        /// Whether the caller currently holds the PBN lock governing a
        /// provisional reference on this counter (spec §4.1: the
        /// DATA_DECREMENT column differs depending on lock possession).
        lock_held: bool,
    },
    /// A new block-map interior page claims this block.
    BlockMapIncrement,
}

/// One 4 KiB reference block: a contiguous run of reference counters plus
/// the torn-write-detection metadata for its `SECTORS_PER_BLOCK` sectors
/// (spec §3 "Reference block", §6 wire format).
#[derive(Clone, Debug)]
pub struct ReferenceBlock {
    /// Raw one-byte counters, `counts.len() <= COUNTS_PER_BLOCK` (the
    /// final "runt" block of a slab may hold fewer).
    pub counts: Vec<u8>,

    /// Number of non-FREE counters this block owns; lets `allocate` skip
    /// a fully-allocated block in one check (spec §4.1 allocation step 1).
    pub allocated_count: u32,

    /// Highest commit point seen per sector, for torn-write detection
    /// (spec §4.1 "Persistence").
    pub sector_commit_points: [JournalPoint; SECTORS_PER_BLOCK],

    /// Whether this block has mutations not yet flushed to disk.
    pub dirty: bool,

    /// Sequence number of the slab-journal entry this block's next write
    /// must wait on, or `None` if the block is clean (spec §4.1
    /// "Persistence", §4.2 "Adjustment coupling").
    pub slab_journal_lock: Option<u64>,

    /// Set when this block is re-dirtied while a write of it is already
    /// in flight; the writeback completion handler re-enqueues the block
    /// instead of issuing a second concurrent write (spec §9, replacing
    /// the source's re-enqueue-by-list-position trick with an explicit
    /// flag).
    pub pending_redirty: bool,
}

impl ReferenceBlock {
    fn new(capacity: usize) -> Self {
        Self {
            counts: vec![0; capacity],
            allocated_count: 0,
            sector_commit_points: [JournalPoint::ZERO; SECTORS_PER_BLOCK],
            dirty: false,
            slab_journal_lock: None,
            pending_redirty: false,
        }
    }

    /// The highest sector commit point in this block (the block's overall
    /// journal point, for ordering against a slab journal).
    #[must_use]
    pub fn journal_point(&self) -> JournalPoint {
        self.sector_commit_points
            .iter()
            .copied()
            .max()
            .unwrap_or(JournalPoint::ZERO)
    }
}

impl Encode for ReferenceBlock {
    fn encode_into<W: Write>(&self, writer: &mut W) -> Result<(), EncodeError> {
        for (sector_idx, commit_point) in self.sector_commit_points.iter().enumerate() {
            writer.write_u64::<LittleEndian>(commit_point.pack())?;

            let start = sector_idx * COUNTS_PER_SECTOR;
            for i in 0..COUNTS_PER_SECTOR {
                let byte = self.counts.get(start + i).copied().unwrap_or(0);
                writer.write_u8(byte)?;
            }
        }
        Ok(())
    }
}

impl Decode for ReferenceBlock {
    fn decode_from<R: Read>(reader: &mut R) -> Result<Self, DecodeError> {
        let mut block = Self::new(COUNTS_PER_BLOCK);
        let mut highest = JournalPoint::ZERO;
        let mut mismatch = false;

        for (sector_idx, slot) in block.sector_commit_points.iter_mut().enumerate() {
            let packed = reader.read_u64::<LittleEndian>()?;
            let point = JournalPoint::unpack(packed);
            *slot = point;

            if sector_idx > 0 && point != highest {
                mismatch = true;
            }
            if point > highest {
                highest = point;
            }

            let start = sector_idx * COUNTS_PER_SECTOR;
            for i in 0..COUNTS_PER_SECTOR {
                let byte = reader.read_u8()?;
                block.counts[start + i] = byte;
            }
        }

        if mismatch {
            log::warn!(
                "torn write detected in reference block: sector commit points disagree, \
                 adopting highest point {highest:?}"
            );
            for slot in &mut block.sector_commit_points {
                *slot = highest;
            }
        }

        // PROVISIONAL counters found on disk were never confirmed; reset
        // to FREE (spec §4.1 "Persistence").
        for byte in &mut block.counts {
            if *byte == PROVISIONAL_BYTE {
                *byte = 0;
            }
        }

        block.allocated_count = block.counts.iter().filter(|&&b| b != 0).count() as u32;

        Ok(block)
    }
}

/// Per-slab reference-counting allocator state (spec §4.1).
pub struct ReferenceCounts {
    data_blocks: u64,
    blocks: Vec<ReferenceBlock>,
    /// Side table of which counters currently hold a live provisional
    /// pin, indexed by SBN. See the module docs for why this can't be
    /// derived from the stored byte alone.
    provisional: Vec<bool>,
    free_blocks: u64,
    /// Search cursor retained across `allocate` calls (spec §4.1).
    search_cursor: u64,
}

impl ReferenceCounts {
    /// Builds a fresh (all-FREE) reference-counts object for a slab with
    /// `data_blocks` data blocks.
    #[must_use]
    pub fn new(data_blocks: u64) -> Self {
        let full_blocks = (data_blocks / COUNTS_PER_BLOCK as u64) as usize;
        let remainder = (data_blocks % COUNTS_PER_BLOCK as u64) as usize;

        let mut blocks = Vec::with_capacity(full_blocks + usize::from(remainder > 0));
        for _ in 0..full_blocks {
            blocks.push(ReferenceBlock::new(COUNTS_PER_BLOCK));
        }
        if remainder > 0 {
            blocks.push(ReferenceBlock::new(remainder));
        }

        Self {
            data_blocks,
            blocks,
            provisional: vec![false; data_blocks as usize],
            free_blocks: data_blocks,
            search_cursor: 0,
        }
    }

    /// Number of data blocks this object tracks.
    #[must_use]
    pub fn data_block_count(&self) -> u64 {
        self.data_blocks
    }

    /// Current free-block count (invariant I6: always equal to the
    /// number of FREE counters).
    #[must_use]
    pub fn free_blocks(&self) -> u64 {
        self.free_blocks
    }

    /// Read-only access to the underlying reference blocks, e.g. for
    /// persistence or the audit tool.
    #[must_use]
    pub fn blocks(&self) -> &[ReferenceBlock] {
        &self.blocks
    }

    /// Reassembles a loaded `ReferenceCounts` from its reference blocks
    /// (e.g. the blocks `vdo-audit` just decoded off disk), recomputing
    /// `free_blocks` from the loaded bytes. The `provisional` side table
    /// starts all-`false`: a loaded PROVISIONAL byte was already reset to
    /// FREE by [`ReferenceBlock::decode_from`].
    #[must_use]
    pub fn from_blocks(data_blocks: u64, blocks: Vec<ReferenceBlock>) -> Self {
        let free_blocks = blocks
            .iter()
            .flat_map(|b| b.counts.iter())
            .filter(|&&byte| byte == 0)
            .count() as u64;
        Self {
            data_blocks,
            blocks,
            provisional: vec![false; data_blocks as usize],
            free_blocks,
            search_cursor: 0,
        }
    }

    fn block_and_offset(&self, sbn: u64) -> (usize, usize) {
        (
            (sbn / COUNTS_PER_BLOCK as u64) as usize,
            (sbn % COUNTS_PER_BLOCK as u64) as usize,
        )
    }

    /// Raw stored byte for `sbn`.
    #[must_use]
    pub fn raw_count(&self, sbn: u64) -> u8 {
        let (block_idx, offset) = self.block_and_offset(sbn);
        self.blocks[block_idx].counts[offset]
    }

    /// Whether `sbn` currently holds a live provisional pin (as opposed to
    /// a confirmed, saturated `254`).
    #[must_use]
    pub fn is_provisional(&self, sbn: u64) -> bool {
        self.provisional[sbn as usize]
    }

    /// How many more increments the counter for `sbn` can absorb before
    /// `adjust` would return [`Error::RefCountInvalid`] (spec §4.1
    /// `available_references`). A PROVISIONAL counter is treated as if it
    /// held a single reference.
    #[must_use]
    pub fn available_references(&self, sbn: u64) -> u8 {
        let byte = self.raw_count(sbn);
        let effective = if self.provisional[sbn as usize] { 1 } else { byte };
        DATA_COUNT_CEILING.saturating_sub(effective)
    }

    /// Number of FREE counters in `[start, end)`.
    #[must_use]
    pub fn count_unreferenced(&self, start: u64, end: u64) -> u64 {
        (start..end).filter(|&sbn| self.raw_count(sbn) == 0).count() as u64
    }

    fn set_byte(&mut self, sbn: u64, new_byte: u8) {
        let (block_idx, offset) = self.block_and_offset(sbn);
        let block = &mut self.blocks[block_idx];
        let was_free = block.counts[offset] == 0;
        let is_free = new_byte == 0;

        block.counts[offset] = new_byte;
        block.dirty = true;

        if was_free && !is_free {
            block.allocated_count += 1;
        } else if !was_free && is_free {
            block.allocated_count -= 1;
        }
    }

    /// Applies one live adjustment (spec §4.1 transition table, normal
    /// mode). Returns whether the counter's FREE/non-FREE status changed
    /// (i.e. whether `free_blocks` moved).
    pub fn adjust(&mut self, sbn: u64, op: AdjustOperation, _journal_point: JournalPoint) -> Result<bool> {
        if sbn >= self.data_blocks {
            return Err(Error::OutOfRange);
        }

        let byte = self.raw_count(sbn);
        let provisional = self.provisional[sbn as usize];

        let (new_byte, new_provisional, free_delta): (u8, bool, i64) = match (byte, provisional, op) {
            // FREE
            (0, _, AdjustOperation::DataIncrement) => (1, false, -1),
            (0, _, AdjustOperation::DataDecrement { .. }) => return Err(Error::RefCountInvalid),
            (0, _, AdjustOperation::BlockMapIncrement) => return Err(Error::RefCountInvalid),

            // PROVISIONAL (254, lock-owned)
            (PROVISIONAL_BYTE, true, AdjustOperation::DataIncrement) => (1, false, 0),
            (PROVISIONAL_BYTE, true, AdjustOperation::DataDecrement { lock_held: false }) => {
                (0, false, 1)
            }
            (PROVISIONAL_BYTE, true, AdjustOperation::DataDecrement { lock_held: true }) => {
                (PROVISIONAL_BYTE, true, 0)
            }
            (PROVISIONAL_BYTE, true, AdjustOperation::BlockMapIncrement) => (MAXIMUM_BYTE, false, 0),

            // Saturated confirmed data max (254, no lock)
            (PROVISIONAL_BYTE, false, AdjustOperation::DataIncrement) => {
                return Err(Error::RefCountInvalid)
            }
            (PROVISIONAL_BYTE, false, AdjustOperation::DataDecrement { .. }) => {
                (DATA_COUNT_CEILING - 1, false, 0)
            }
            (PROVISIONAL_BYTE, false, AdjustOperation::BlockMapIncrement) => {
                return Err(Error::RefCountInvalid)
            }

            // MAXIMUM (255, tree page)
            (MAXIMUM_BYTE, _, _) => return Err(Error::RefCountInvalid),

            // Plain SHARED/SINGLE range
            (n, false, AdjustOperation::DataIncrement) if (1..DATA_COUNT_CEILING).contains(&n) => {
                (n + 1, false, 0)
            }
            (n, false, AdjustOperation::DataDecrement { .. }) if (1..=DATA_COUNT_CEILING - 1).contains(&n) => {
                if n == 1 {
                    (0, false, 1)
                } else {
                    (n - 1, false, 0)
                }
            }
            (n, false, AdjustOperation::BlockMapIncrement) if (1..=DATA_COUNT_CEILING - 1).contains(&n) => {
                return Err(Error::RefCountInvalid)
            }

            _ => return Err(Error::RefCountInvalid),
        };

        self.set_byte(sbn, new_byte);
        self.provisional[sbn as usize] = new_provisional;

        match free_delta {
            -1 => self.free_blocks -= 1,
            1 => self.free_blocks += 1,
            _ => {}
        }

        Ok(free_delta != 0)
    }

    /// Idempotently applies a slab-journal entry during crash recovery
    /// (spec §4.1 `replay`). Skipped if the owning sector's commit point
    /// is already `>= entry_point`.
    pub fn replay(&mut self, sbn: u64, op: AdjustOperation, entry_point: JournalPoint) -> Result<()> {
        if sbn >= self.data_blocks {
            return Err(Error::OutOfRange);
        }

        let (block_idx, offset) = self.block_and_offset(sbn);
        let sector = offset / COUNTS_PER_SECTOR;

        if self.blocks[block_idx].sector_commit_points[sector] >= entry_point {
            log::trace!(
                "replay: skipping sbn={sbn} at entry_point={entry_point:?}, \
                 sector already at {:?}",
                self.blocks[block_idx].sector_commit_points[sector]
            );
            return Ok(());
        }

        match op {
            AdjustOperation::BlockMapIncrement => {
                let byte = self.raw_count(sbn);
                if byte != 0 {
                    return Err(Error::RefCountInvalid);
                }
                self.set_byte(sbn, MAXIMUM_BYTE);
                self.provisional[sbn as usize] = false;
                self.free_blocks -= 1;
            }
            // DATA ops replay with the same transition rules as the
            // no-lock live path (replay never has a live PbnLock).
            other => {
                self.adjust(sbn, other, entry_point)?;
            }
        }

        self.blocks[block_idx].sector_commit_points[sector] = entry_point;
        self.blocks[block_idx].dirty = true;
        Ok(())
    }

    /// Finds a FREE counter, transitions it to PROVISIONAL, and returns
    /// its SBN (spec §4.1 allocation algorithm). Honors the retained
    /// search cursor and the `allocated_count`-based whole-block skip.
    pub fn allocate(&mut self) -> Result<u64> {
        if self.data_blocks == 0 {
            return Err(Error::NoSpace);
        }

        let mut scanned = 0u64;
        let mut cursor = self.search_cursor % self.data_blocks;

        while scanned < self.data_blocks {
            let (block_idx, offset) = self.block_and_offset(cursor);
            let block_len = self.blocks[block_idx].counts.len() as u64;

            if u64::from(self.blocks[block_idx].allocated_count) == block_len {
                // Whole block is allocated; skip past it in one step
                // (spec §4.1 step 1).
                let remaining_in_block = block_len - offset as u64;
                scanned += remaining_in_block;
                let next_block_start = (cursor - offset as u64) + block_len;
                cursor = if next_block_start >= self.data_blocks {
                    0
                } else {
                    next_block_start
                };
                continue;
            }

            if self.blocks[block_idx].counts[offset] == 0 {
                self.set_byte(cursor, PROVISIONAL_BYTE);
                self.provisional[cursor as usize] = true;
                self.free_blocks -= 1;

                self.search_cursor = (cursor + 1) % self.data_blocks;
                return Ok(cursor);
            }

            cursor = (cursor + 1) % self.data_blocks;
            scanned += 1;
        }

        Err(Error::NoSpace)
    }

    /// If `sbn` is FREE, transitions it to PROVISIONAL; otherwise a no-op
    /// (spec §4.1 `provisional_reference`).
    pub fn provisional_reference(&mut self, sbn: u64) -> Result<()> {
        if sbn >= self.data_blocks {
            return Err(Error::OutOfRange);
        }
        if self.raw_count(sbn) == 0 {
            self.set_byte(sbn, PROVISIONAL_BYTE);
            self.provisional[sbn as usize] = true;
            self.free_blocks -= 1;
        }
        Ok(())
    }

    /// Marks every dirty block clean, returning the indices that were
    /// flushed. Used by `save_all`/`drain`; callers are responsible for
    /// actually persisting the bytes (e.g. via `Encode`) before calling
    /// this.
    fn mark_clean(&mut self, indices: impl IntoIterator<Item = usize>) -> Vec<usize> {
        let mut flushed = vec![];
        for idx in indices {
            if self.blocks[idx].dirty {
                if self.blocks[idx].pending_redirty {
                    // A mutation raced the in-flight write; leave it
                    // dirty so the next flush pass picks it up (spec §9
                    // "pending re-dirty flag").
                    self.blocks[idx].pending_redirty = false;
                } else {
                    self.blocks[idx].dirty = false;
                    self.blocks[idx].slab_journal_lock = None;
                }
                flushed.push(idx);
            }
        }
        flushed
    }

    /// Flushes roughly `1/divisor` of the currently dirty blocks (spec
    /// §4.1 `save_several`), in ascending block-index order.
    pub fn save_several(&mut self, divisor: usize) -> Vec<usize> {
        let divisor = divisor.max(1);
        let dirty: Vec<usize> = self
            .blocks
            .iter()
            .enumerate()
            .filter(|(_, b)| b.dirty)
            .map(|(i, _)| i)
            .collect();

        let take = dirty.len().div_ceil(divisor);
        self.mark_clean(dirty.into_iter().take(take))
    }

    /// Flushes every dirty block (spec §4.1 `save_all`).
    pub fn save_all(&mut self) -> Vec<usize> {
        let dirty: Vec<usize> = self
            .blocks
            .iter()
            .enumerate()
            .filter(|(_, b)| b.dirty)
            .map(|(i, _)| i)
            .collect();
        self.mark_clean(dirty)
    }

    /// Flushes all dirty state as part of a drain to `state` (spec §5:
    /// SUSPENDING/SAVING initiate a full flush).
    pub fn drain(&mut self, state: crate::admin_state::AdminStateCode) -> Vec<usize> {
        log::info!("reference-counts drain requested for admin state {state:?}");
        self.save_all()
    }

    /// Marks a block re-dirtied while its write is in flight (spec §9
    /// "pending re-dirty").
    pub fn note_redirty_during_writeback(&mut self, block_index: usize) {
        self.blocks[block_index].pending_redirty = true;
        self.blocks[block_index].dirty = true;
    }
}
