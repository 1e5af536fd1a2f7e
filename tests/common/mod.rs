// Copyright (c) 2024-present, vdo-core contributors
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Builds a synthetic on-disk volume file following `vdo-audit`'s layout
//! convention (see `src/bin/vdo_audit.rs`'s module docs), so integration
//! tests can exercise the same file-based reconciliation path the CLI
//! drives, without needing a real block device.

use std::fs::File;
use std::io::{Seek, SeekFrom, Write};

use vdo_core::block_map::BlockMapForest;
use vdo_core::coding::Encode;
use vdo_core::geometry::{Geometry, BLOCK_SIZE};
use vdo_core::slab::reference_counts::ReferenceCounts;

/// Writes `geometry`'s block (expected to already carry `forest`'s root
/// PBNs via [`Geometry::with_block_map_roots`]), `logical_blocks_used`,
/// every slab's reference blocks, and every block-map page in `forest`
/// into `file`.
pub fn write_volume_file(
    file: &mut File,
    geometry: &Geometry,
    slabs: &[ReferenceCounts],
    forest: &BlockMapForest,
    logical_blocks_used: u64,
) -> std::io::Result<()> {
    write_block_at(file, 0, &geometry.encode_into_vec())?;

    let mut used_block = vec![0u8; BLOCK_SIZE];
    used_block[..8].copy_from_slice(&logical_blocks_used.to_le_bytes());
    write_block_at(file, 1, &used_block)?;

    let layout = geometry.slab_layout();
    for (index, rc) in slabs.iter().enumerate() {
        let ref_region_start = geometry.slab_origin_pbn(index as u64) + layout.data_blocks;
        for (i, block) in rc.blocks().iter().enumerate() {
            write_block_at(file, ref_region_start + i as u64, &block.encode_into_vec())?;
        }
    }

    for page in forest.pages() {
        write_block_at(file, page.header.pbn, &page.encode_into_vec())?;
    }

    Ok(())
}

fn write_block_at(file: &mut File, pbn: u64, bytes: &[u8]) -> std::io::Result<()> {
    file.seek(SeekFrom::Start(pbn * BLOCK_SIZE as u64))?;
    file.write_all(bytes)?;
    Ok(())
}
