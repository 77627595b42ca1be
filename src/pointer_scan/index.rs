//! The pointer index: every aligned location whose stored word points back into
//! the addressable range, sorted by that word for offset-window queries.

use rustc_hash::FxHashMap;

use crate::pointer_scan::error::{Result, ScanError};
use crate::pointer_scan::types::{IndexParams, PointerIndexEntry, ScanConfig};

pub struct PointerIndex {
    /// Sorted by value; equal values keep ascending address order
    entries: Vec<PointerIndexEntry>,
    /// Address to value, for dereferencing during search
    by_address: FxHashMap<u32, u32>,
    params: IndexParams,
    snapshot_generation: u64,
}

impl PointerIndex {
    /// Wrap entries that are already in ascending address order.
    pub fn from_address_ordered(
        mut entries: Vec<PointerIndexEntry>,
        params: IndexParams,
        snapshot_generation: u64,
    ) -> Self {
        let mut by_address = FxHashMap::with_capacity_and_hasher(entries.len(), Default::default());
        by_address.extend(entries.iter().map(|e| (e.address, e.value)));

        // Stable, so ties stay in address order
        entries.sort_by_key(|e| e.value);

        Self {
            entries,
            by_address,
            params,
            snapshot_generation,
        }
    }

    pub fn empty(params: IndexParams, snapshot_generation: u64) -> Self {
        Self::from_address_ordered(Vec::new(), params, snapshot_generation)
    }

    pub(crate) fn from_parts(
        entries: Vec<PointerIndexEntry>,
        by_address: FxHashMap<u32, u32>,
        params: IndexParams,
        snapshot_generation: u64,
    ) -> Self {
        debug_assert!(entries.windows(2).all(|w| w[0].value <= w[1].value));
        Self {
            entries,
            by_address,
            params,
            snapshot_generation,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries in value order.
    pub fn entries(&self) -> &[PointerIndexEntry] {
        &self.entries
    }

    pub fn params(&self) -> IndexParams {
        self.params
    }

    pub fn snapshot_generation(&self) -> u64 {
        self.snapshot_generation
    }

    /// Whether this index can serve a search configured with `config` against
    /// the snapshot identified by `snapshot_generation`.
    pub fn is_valid_for(&self, config: &ScanConfig, snapshot_generation: u64) -> bool {
        self.params == config.index_params() && self.snapshot_generation == snapshot_generation
    }

    /// O(1) dereference of an indexed pointer.
    #[inline]
    pub fn value_at(&self, address: u32) -> Option<u32> {
        self.by_address.get(&address).copied()
    }

    /// All entries `e` with `e.value + offset == target` for some offset in
    /// `[min_offset, max_offset]`, in value order.
    ///
    /// Address arithmetic wraps at 32 bits, so a window that crosses zero
    /// matches values at both ends of the address space.
    pub fn find_pointers_to(&self, target: u32, min_offset: i32, max_offset: i32) -> Result<Vec<PointerIndexEntry>> {
        if min_offset > max_offset {
            return Err(ScanError::invalid_config(format!(
                "minimum offset {:#X} exceeds maximum offset {:#X}",
                min_offset, max_offset
            )));
        }

        let mut matches = Vec::new();
        for (low, high) in value_segments(target, min_offset, max_offset).into_iter().flatten() {
            matches.extend_from_slice(self.value_range(low, high));
        }
        Ok(matches)
    }

    /// Entries whose value lies in `[low, high]`.
    #[inline]
    fn value_range(&self, low: u32, high: u32) -> &[PointerIndexEntry] {
        let start = self.entries.partition_point(|e| e.value < low);
        let end = self.entries.partition_point(|e| e.value <= high);
        if start >= end {
            return &[];
        }
        &self.entries[start..end]
    }
}

/// Split the value window `[target - max_offset, target - min_offset]` into at
/// most two non-wrapping segments, lowest values first.
fn value_segments(target: u32, min_offset: i32, max_offset: i32) -> [Option<(u32, u32)>; 2] {
    const SPACE: i64 = 1 << 32;
    let low = target as i64 - max_offset as i64;
    let high = target as i64 - min_offset as i64;

    // The window is narrower than the address space, so it wraps at one end at most
    if low < 0 && high < 0 {
        [Some(((low + SPACE) as u32, (high + SPACE) as u32)), None]
    } else if low < 0 {
        [Some((0, high as u32)), Some(((low + SPACE) as u32, u32::MAX))]
    } else if high >= SPACE && low >= SPACE {
        [Some(((low - SPACE) as u32, (high - SPACE) as u32)), None]
    } else if high >= SPACE {
        [Some((0, (high - SPACE) as u32)), Some((low as u32, u32::MAX))]
    } else {
        [Some((low as u32, high as u32)), None]
    }
}
