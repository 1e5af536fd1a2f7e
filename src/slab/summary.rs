// Copyright (c) 2024-present, vdo-core contributors
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Slab summary: a compact, per-zone-sharded index of every slab's
//! recovery hints, read eagerly at startup so the scrubber and allocator
//! don't need to load every slab's full reference-count blocks up front
//! (spec §4.3).

use crate::coding::{Decode, DecodeError, Encode, EncodeError};
use crate::geometry::SECTOR_SIZE;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Read, Write};

/// Wire size of one packed [`SlabSummaryEntry`]: 8-byte tail offset, 1
/// flags byte (bit 0 = `must_load`, bit 1 = `is_clean`), 1 quantized hint
/// byte.
const ENTRY_SIZE: usize = 10;

/// Number of summary entries packed into one 512-byte sector.
pub const ENTRIES_PER_SECTOR: usize = SECTOR_SIZE / ENTRY_SIZE;

const MUST_LOAD_BIT: u8 = 0b01;
const IS_CLEAN_BIT: u8 = 0b10;

/// One slab's recovery hint (spec §4.3 "Slab summary entry").
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct SlabSummaryEntry {
    /// Offset of the slab journal's tail block at the time this entry was
    /// last written.
    pub tail_block_offset: u64,

    /// Set when the slab was dirty (not cleanly saved) at the time this
    /// entry was written; tells the scrubber it must replay this slab's
    /// journal before trusting its reference counts.
    pub must_load: bool,

    /// Whether the slab had no outstanding work when this entry was
    /// written.
    pub is_clean: bool,

    /// `free_blocks >> hint_shift` at the time this entry was written — a
    /// coarse, quantized hint for the allocator's slab-selection heuristic
    /// (exact free counts come from the slab's own reference counts once
    /// loaded).
    pub free_block_hint: u8,
}

impl SlabSummaryEntry {
    /// Builds an entry from a slab's live state, quantizing `free_blocks`
    /// by `hint_shift` (spec §4.3, geometry `hint_shift`).
    #[must_use]
    pub fn quantize(tail_block_offset: u64, is_clean: bool, free_blocks: u64, hint_shift: u32) -> Self {
        let hint = (free_blocks >> hint_shift).min(u64::from(u8::MAX)) as u8;
        Self {
            tail_block_offset,
            must_load: !is_clean,
            is_clean,
            free_block_hint: hint,
        }
    }
}

impl Encode for SlabSummaryEntry {
    fn encode_into<W: Write>(&self, writer: &mut W) -> Result<(), EncodeError> {
        writer.write_u64::<LittleEndian>(self.tail_block_offset)?;
        let mut flags = 0u8;
        if self.must_load {
            flags |= MUST_LOAD_BIT;
        }
        if self.is_clean {
            flags |= IS_CLEAN_BIT;
        }
        writer.write_u8(flags)?;
        writer.write_u8(self.free_block_hint)?;
        Ok(())
    }
}

impl Decode for SlabSummaryEntry {
    fn decode_from<R: Read>(reader: &mut R) -> Result<Self, DecodeError> {
        let tail_block_offset = reader.read_u64::<LittleEndian>()?;
        let flags = reader.read_u8()?;
        let free_block_hint = reader.read_u8()?;
        Ok(Self {
            tail_block_offset,
            must_load: flags & MUST_LOAD_BIT != 0,
            is_clean: flags & IS_CLEAN_BIT != 0,
            free_block_hint,
        })
    }
}

/// One zone's shard of the slab summary: the entries for the slabs
/// assigned to it (spec §4.3: slabs are sharded round-robin across logical
/// zones so each zone's summary writer only ever touches its own slabs).
pub struct SlabSummaryZone {
    zone_index: u32,
    zone_count: u32,
    entries: Vec<SlabSummaryEntry>,
    dirty: Vec<bool>,
}

impl SlabSummaryZone {
    /// Builds a shard covering `slab_count` slabs total, owning the
    /// entries for every `slab_index` with `slab_index % zone_count ==
    /// zone_index`.
    #[must_use]
    pub fn new(zone_index: u32, zone_count: u32, slab_count: u64) -> Self {
        assert!(zone_count > 0);
        let owned = (slab_count as usize).div_ceil(zone_count as usize).max(1);
        Self {
            zone_index,
            zone_count,
            entries: vec![SlabSummaryEntry::default(); owned],
            dirty: vec![false; owned],
        }
    }

    fn local_index(&self, slab_index: u64) -> Option<usize> {
        if slab_index as u32 % self.zone_count != self.zone_index {
            return None;
        }
        Some((slab_index / u64::from(self.zone_count)) as usize)
    }

    /// Reads the entry for `slab_index`, if this shard owns it.
    #[must_use]
    pub fn entry(&self, slab_index: u64) -> Option<SlabSummaryEntry> {
        let local = self.local_index(slab_index)?;
        self.entries.get(local).copied()
    }

    /// Updates the entry for `slab_index`, if this shard owns it, marking
    /// it dirty for the next flush.
    pub fn update(&mut self, slab_index: u64, entry: SlabSummaryEntry) {
        if let Some(local) = self.local_index(slab_index) {
            self.entries[local] = entry;
            self.dirty[local] = true;
        }
    }

    /// Indices (local to this shard) with unflushed updates.
    #[must_use]
    pub fn dirty_indices(&self) -> Vec<usize> {
        self.dirty
            .iter()
            .enumerate()
            .filter(|(_, &d)| d)
            .map(|(i, _)| i)
            .collect()
    }

    /// Marks every entry clean (spec §4.3 flush).
    pub fn flush(&mut self) {
        self.dirty.iter_mut().for_each(|d| *d = false);
    }
}

/// The full slab summary: one shard per logical zone (spec §4.3).
pub struct SlabSummary {
    zones: Vec<SlabSummaryZone>,
}

impl SlabSummary {
    /// Builds a summary with `zone_count` shards covering `slab_count`
    /// slabs.
    #[must_use]
    pub fn new(zone_count: u32, slab_count: u64) -> Self {
        let zones = (0..zone_count)
            .map(|zone_index| SlabSummaryZone::new(zone_index, zone_count, slab_count))
            .collect();
        Self { zones }
    }

    /// The shard owning `slab_index`.
    #[must_use]
    pub fn zone_for_slab(&self, slab_index: u64, zone_count: u32) -> &SlabSummaryZone {
        &self.zones[(slab_index % u64::from(zone_count)) as usize]
    }

    /// Mutable access to shard `zone_index`.
    pub fn zone_mut(&mut self, zone_index: u32) -> &mut SlabSummaryZone {
        &mut self.zones[zone_index as usize]
    }

    /// Read-only access to shard `zone_index`.
    #[must_use]
    pub fn zone(&self, zone_index: u32) -> &SlabSummaryZone {
        &self.zones[zone_index as usize]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_format_roundtrip() {
        let entry = SlabSummaryEntry::quantize(1234, false, 900, 4);
        assert_eq!(entry.free_block_hint, 900 >> 4);
        assert!(entry.must_load);

        let bytes = entry.encode_into_vec();
        assert_eq!(bytes.len(), ENTRY_SIZE);
        let mut cursor = std::io::Cursor::new(bytes);
        let decoded = SlabSummaryEntry::decode_from(&mut cursor).expect("decode");
        assert_eq!(entry, decoded);
    }

    #[test]
    fn sector_packs_expected_entry_count() {
        assert_eq!(ENTRIES_PER_SECTOR, SECTOR_SIZE / ENTRY_SIZE);
        assert!(ENTRIES_PER_SECTOR * ENTRY_SIZE <= SECTOR_SIZE);
    }

    #[test]
    fn zone_sharding_round_robins_by_slab_index() {
        let mut summary = SlabSummary::new(3, 10);
        let entry = SlabSummaryEntry::quantize(1, true, 50, 0);

        summary.zone_mut(1).update(4, entry); // 4 % 3 == 1
        assert_eq!(summary.zone(1).entry(4), Some(entry));
        assert_eq!(summary.zone(0).entry(4), None, "wrong shard must not see it");
    }

    #[test]
    fn flush_clears_dirty_set() {
        let mut zone = SlabSummaryZone::new(0, 1, 4);
        zone.update(0, SlabSummaryEntry::quantize(5, true, 10, 0));
        assert_eq!(zone.dirty_indices(), vec![0]);
        zone.flush();
        assert!(zone.dirty_indices().is_empty());
    }

    #[test]
    fn clean_entry_never_requires_must_load() {
        let entry = SlabSummaryEntry::quantize(0, true, 100, 0);
        assert!(!entry.must_load);
    }
}
