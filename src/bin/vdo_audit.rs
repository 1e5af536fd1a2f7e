// Copyright (c) 2024-present, vdo-core contributors
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! `vdo-audit`: an offline reconciliation tool that opens an unmounted
//! volume file, walks its block map, and compares the reference counts
//! it implies against what is actually stored in each slab (spec §6
//! "Audit CLI", §4.7 "examine").
//!
//! # On-disk layout this tool expects
//!
//! This crate's algorithms are agnostic to where bytes physically live
//! (every structure just knows how to `Encode`/`Decode` itself); the file
//! layout below is `vdo-audit`'s own convention for locating those
//! structures inside one flat volume file, addressed PBN-first the same
//! way the rest of the core does:
//!
//! - PBN 0: the geometry block ([`Geometry`], carrying each zone's
//!   block-map root PBN in its own wire format).
//! - PBN 1: one little-endian `u64`, `logical_blocks_used` — the one
//!   recovery-journal-owned scalar this offline tool needs (spec §4.7's
//!   LBN-count cross-check), without pulling in journal replay itself.
//! - Every other PBN is addressed as `pbn * BLOCK_SIZE` bytes into the
//!   file: a slab's reference blocks starting at
//!   `geometry.slab_origin_pbn(i) + data_blocks`, and block-map pages at
//!   their own PBN (reserved, by convention, outside every slab's data
//!   span).

use clap::Parser;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::PathBuf;
use std::process::ExitCode;

use vdo_core::audit::{reconcile, AuditReport, AuditVerbosity};
use vdo_core::block_map::{BlockMapPage, MappingState};
use vdo_core::coding::Decode;
use vdo_core::geometry::{Geometry, BLOCK_SIZE, TREE_HEIGHT};
use vdo_core::slab::reference_counts::{ReferenceBlock, ReferenceCounts};
use vdo_core::Result;

#[derive(Parser)]
#[command(
    name = "vdoAudit",
    version,
    about = "Reconciles a vdo-core volume's block map against its stored reference counts"
)]
struct Args {
    /// One line per slab with a nonzero mismatch count (the default).
    #[arg(long, conflicts_with = "verbose")]
    summary: bool,

    /// Every individual mismatch, with its error delta.
    #[arg(long)]
    verbose: bool,

    /// Path to the volume file to audit.
    filename: PathBuf,
}

impl Args {
    fn verbosity(&self) -> AuditVerbosity {
        if self.verbose {
            AuditVerbosity::Verbose
        } else {
            AuditVerbosity::Summary
        }
    }
}

fn main() -> ExitCode {
    env_logger::init();
    let args = Args::parse();

    match run(&args) {
        Ok(report) => {
            print_report(&report, args.verbosity());
            if report.passed {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            }
        }
        Err(e) => {
            eprintln!("vdoAudit: {e}");
            ExitCode::FAILURE
        }
    }
}

fn run(args: &Args) -> Result<AuditReport> {
    let mut file = File::open(&args.filename)?;

    let geometry = read_block(&mut file, 0, Geometry::decode_from)?;
    geometry.validate()?;
    log::info!(
        "loaded geometry: {} slab(s), {} zone(s)",
        geometry.slab_count,
        geometry.zone_count
    );

    let logical_blocks_used = read_block(&mut file, 1, |r| {
        use byteorder::{LittleEndian, ReadBytesExt};
        r.read_u64::<LittleEndian>().map_err(vdo_core::coding::DecodeError::from)
    })?;

    let layout = geometry.slab_layout();
    let mut slabs = Vec::with_capacity(geometry.slab_count as usize);
    for index in 0..geometry.slab_count {
        slabs.push(load_slab(&mut file, &geometry, index, layout.data_blocks, layout.ref_blocks)?);
    }

    let report = reconcile(&geometry, &slabs, logical_blocks_used, |visit| {
        for &root_pbn in &geometry.block_map_roots {
            if let Err(e) = walk_subtree(&mut file, root_pbn, TREE_HEIGHT - 1, visit) {
                log::error!("failed walking block-map subtree rooted at pbn {root_pbn}: {e}");
            }
        }
    });

    Ok(report)
}

/// Reads the `BLOCK_SIZE`-sized block at PBN `pbn` and decodes it with `decode`.
fn read_block<T>(file: &mut File, pbn: u64, decode: impl FnOnce(&mut &[u8]) -> std::result::Result<T, vdo_core::coding::DecodeError>) -> Result<T> {
    let mut buf = vec![0u8; BLOCK_SIZE];
    file.seek(SeekFrom::Start(pbn * BLOCK_SIZE as u64))?;
    file.read_exact(&mut buf)?;
    let mut slice = buf.as_slice();
    Ok(decode(&mut slice)?)
}

fn load_slab(
    file: &mut File,
    geometry: &Geometry,
    index: u64,
    data_blocks: u64,
    ref_blocks: u64,
) -> Result<ReferenceCounts> {
    let ref_region_start = geometry.slab_origin_pbn(index) + data_blocks;
    let mut blocks = Vec::with_capacity(ref_blocks as usize);
    for i in 0..ref_blocks {
        let block = read_block(file, ref_region_start + i, ReferenceBlock::decode_from)?;
        blocks.push(block);
    }
    Ok(ReferenceCounts::from_blocks(data_blocks, blocks))
}

/// Recursively walks the page rooted at `pbn` (at tree `height`),
/// invoking `visit(pbn, true)` for every block-map page encountered and
/// `visit(pbn, false)` for every live leaf-level data mapping — the same
/// contract as [`vdo_core::block_map::BlockMapForest::examine_block_map_entries`],
/// driven from file bytes instead of an in-memory forest.
fn walk_subtree(file: &mut File, pbn: u64, height: u32, visit: &mut dyn FnMut(u64, bool)) -> Result<()> {
    visit(pbn, true);
    let page = read_block(file, pbn, BlockMapPage::decode_from)?;

    if height == 0 {
        for entry in &page.entries {
            if entry.state != MappingState::Unmapped {
                visit(entry.pbn, false);
            }
        }
        return Ok(());
    }

    for entry in &page.entries {
        if entry.state != MappingState::Unmapped {
            walk_subtree(file, entry.pbn, height - 1, visit)?;
        }
    }
    Ok(())
}

fn print_report(report: &AuditReport, verbosity: AuditVerbosity) {
    let scanned_bytes = report.lbn_count * BLOCK_SIZE as u64;
    println!(
        "vdoAudit: {} LBN(s) walked ({}), expected {}, {} bad block mapping(s)",
        report.lbn_count,
        humansize::format_size(scanned_bytes, humansize::BINARY),
        report.logical_blocks_used,
        report.bad_block_mappings
    );

    match verbosity {
        AuditVerbosity::Summary => {
            let mut by_slab: std::collections::BTreeMap<u64, usize> = std::collections::BTreeMap::new();
            for mismatch in &report.mismatches {
                *by_slab.entry(mismatch.slab_index).or_default() += 1;
            }
            for (slab_index, count) in by_slab {
                println!("slab {slab_index}: {count} reference-count mismatch(es)");
            }
        }
        AuditVerbosity::Verbose => {
            for mismatch in &report.mismatches {
                println!(
                    "slab {} sbn {}: expected {}, stored {} (delta {})",
                    mismatch.slab_index,
                    mismatch.sbn,
                    mismatch.expected,
                    mismatch.stored,
                    mismatch.error_delta()
                );
            }
        }
    }

    if report.passed {
        println!("vdoAudit: PASSED");
    } else {
        println!("vdoAudit: FAILED");
    }
}
