//! Pointer index builder
//!
//! Walks the addressable range at the configured alignment, reads each word out
//! of the snapshot and keeps the non-null ones whose value lands back inside the
//! addressable range. The range is cut into fixed batches that are scanned in
//! parallel; progress and cancellation are observed once per batch.

use std::cmp::min;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Instant;

use log::{debug, info, log_enabled, Level};
use rayon::prelude::*;
use rustc_hash::FxHashMap;

use crate::pointer_scan::error::{Result, ScanError};
use crate::pointer_scan::index::PointerIndex;
use crate::pointer_scan::snapshot::MemorySnapshot;
use crate::pointer_scan::types::{IndexParams, PointerIndexEntry};

/// Words examined per batch
pub const BATCH_WORDS: u64 = 1 << 18;

/// Report progress every this many finished batches
const PROGRESS_INTERVAL: usize = 16;

/// Scan a snapshot for pointers and build the value-sorted index.
///
/// `progress_callback` receives `(batches_done, batches_total, pointers_found)`.
/// Nothing is returned but `ScanError::Cancelled` once `check_cancelled` fires.
pub fn build_pointer_index<F, C>(
    snapshot: &MemorySnapshot,
    params: IndexParams,
    snapshot_generation: u64,
    progress_callback: F,
    check_cancelled: C,
) -> Result<PointerIndex>
where
    F: Fn(usize, usize, usize) + Sync,
    C: Fn() -> bool + Sync,
{
    params.validate()?;

    let timer = Instant::now();
    let start = params.addressable_base as u64;
    let end = params.addressable_end();
    let step = params.alignment as u64;
    let total_words = if end > start { (end - start).div_ceil(step) } else { 0 };

    info!(
        "Building pointer index: range=0x{:08X}..0x{:X}, align={}, snapshot=0x{:08X}+0x{:X}",
        start,
        end,
        step,
        snapshot.base_address(),
        snapshot.length()
    );

    if total_words == 0 {
        progress_callback(0, 0, 0);
        return Ok(PointerIndex::empty(params, snapshot_generation));
    }

    let total_batches = total_words.div_ceil(BATCH_WORDS) as usize;
    let completed = AtomicUsize::new(0);
    let total_found = AtomicUsize::new(0);
    let cancelled = AtomicBool::new(false);

    let batches: Vec<Vec<PointerIndexEntry>> = (0..total_batches)
        .into_par_iter()
        .map(|batch| {
            if cancelled.load(Ordering::Relaxed) || check_cancelled() {
                cancelled.store(true, Ordering::Relaxed);
                return Vec::new();
            }

            let first_word = batch as u64 * BATCH_WORDS;
            let word_count = min(BATCH_WORDS, total_words - first_word);
            let pointers = scan_batch(snapshot, &params, start + first_word * step, word_count, step);

            let count = pointers.len();
            let found = total_found.fetch_add(count, Ordering::Relaxed) + count;
            let done = completed.fetch_add(1, Ordering::Relaxed) + 1;
            if done % PROGRESS_INTERVAL == 0 || done == total_batches {
                progress_callback(done, total_batches, found);
            }

            pointers
        })
        .collect();

    if cancelled.load(Ordering::Relaxed) {
        info!("Pointer index build cancelled");
        return Err(ScanError::Cancelled);
    }

    // Batches come back in address order
    let total: usize = batches.iter().map(|b| b.len()).sum();
    let mut entries: Vec<PointerIndexEntry> = Vec::with_capacity(total);
    for mut batch in batches {
        entries.append(&mut batch);
    }

    if log_enabled!(Level::Debug) {
        debug!("Collected {} pointers in {:.3}s", entries.len(), timer.elapsed().as_secs_f64());
    }

    let mut by_address = FxHashMap::with_capacity_and_hasher(entries.len(), Default::default());
    by_address.extend(entries.iter().map(|e| (e.address, e.value)));

    // Stable sort keeps equal values in address order
    entries.par_sort_by_key(|e| e.value);

    if check_cancelled() {
        info!("Pointer index build cancelled after sorting");
        return Err(ScanError::Cancelled);
    }

    info!(
        "Pointer index built: {} pointers, {:.3}s",
        entries.len(),
        timer.elapsed().as_secs_f64()
    );

    Ok(PointerIndex::from_parts(entries, by_address, params, snapshot_generation))
}

/// Scan `word_count` aligned words starting at `first_address`.
fn scan_batch(
    snapshot: &MemorySnapshot,
    params: &IndexParams,
    first_address: u64,
    word_count: u64,
    step: u64,
) -> Vec<PointerIndexEntry> {
    let mut pointers = Vec::new();
    for k in 0..word_count {
        // Below addressable_end, which never exceeds 2^32
        let address = (first_address + k * step) as u32;
        if let Some(value) = snapshot.read_u32(address) {
            // Null words are never pointers, even when 0 is addressable
            if value != 0 && params.contains(value) {
                pointers.push(PointerIndexEntry::new(address, value));
            }
        }
    }
    pointers
}
