use std::collections::VecDeque;
use std::mem;

use log::{debug, error, info, log_enabled, warn, Level};
use rustc_hash::FxHashSet;
use tokio_util::sync::CancellationToken;

use crate::pointer_scan::error::Result;
use crate::pointer_scan::index::PointerIndex;
use crate::pointer_scan::types::{PointerChainResult, PointerIndexEntry, ScanConfig};

/// Default maximum number of nodes kept for one level, to bound memory
pub const MAX_CANDIDATES_PER_LAYER: usize = 5_000_000;

/// A chain that may still be extended towards a new base.
struct PathNode {
    /// Current base address; the next level searches for pointers to it
    base_address: u32,
    /// Offsets from `base_address` to the search address
    offsets: Vec<i32>,
    /// Bases already used on this branch, for cycle detection
    visited_addresses: Vec<u32>,
}

impl PathNode {
    /// Linear scan; branches are at most `max_depth` long
    fn is_visited(&self, address: u32) -> bool {
        self.visited_addresses.contains(&address)
    }

    fn parent_of(&self, ptr_address: u32, offset: i32) -> Self {
        let mut offsets = Vec::with_capacity(self.offsets.len() + 1);
        offsets.push(offset);
        offsets.extend_from_slice(&self.offsets);

        let mut visited_addresses = Vec::with_capacity(self.visited_addresses.len() + 1);
        visited_addresses.extend_from_slice(&self.visited_addresses);
        visited_addresses.push(ptr_address);

        Self {
            base_address: ptr_address,
            offsets,
            visited_addresses,
        }
    }
}

/// Breadth-first backward walk from the search address, yielding every chain
/// as soon as it is found.
///
/// Level 0 looks for pointers whose value is within the primary window below
/// the search address. Every later level looks for pointers to the previous
/// level's bases within the secondary window and prepends the new offset.
/// Each yielded chain with fewer than `max_depth` offsets is queued for the
/// next level.
///
/// The walk is deterministic: level by level, within a level in frontier order,
/// and within one node in the index's value order. A cancellation token, when
/// attached, is checked before each node is expanded; once it fires the
/// iterator ends and whatever was already yielded stays valid.
///
/// A level holds at most `max_candidates` nodes. Chains found past that limit
/// are still yielded but not extended, and [`ChainSearch::was_truncated`]
/// reports that deeper results may be missing.
pub struct ChainSearch<'a> {
    index: &'a PointerIndex,
    config: ScanConfig,
    cancel_token: Option<CancellationToken>,
    /// 0 is the hop nearest the search address
    level: usize,
    current_layer: VecDeque<PathNode>,
    next_layer: Vec<PathNode>,
    pending: VecDeque<PointerChainResult>,
    emitted: FxHashSet<PointerChainResult>,
    max_candidates: usize,
    layer_truncated: bool,
    /// Set once any level dropped nodes
    truncated: bool,
    started: bool,
    finished: bool,
    cancelled: bool,
}

impl<'a> ChainSearch<'a> {
    pub fn new(index: &'a PointerIndex, config: &ScanConfig) -> Result<Self> {
        config.validate()?;

        info!(
            "Building pointer chains (layered BFS) target=0x{:08X}, depth={}, offsets=[{:#X}, {:#X}]/[{:#X}, {:#X}], pointers={}",
            config.search_address,
            config.max_depth,
            config.minimum_offset,
            config.primary_maximum_offset,
            config.minimum_offset,
            config.secondary_maximum_offset,
            index.len()
        );

        Ok(Self {
            index,
            config: config.clone(),
            cancel_token: None,
            level: 0,
            current_layer: VecDeque::new(),
            next_layer: Vec::new(),
            pending: VecDeque::new(),
            emitted: FxHashSet::default(),
            max_candidates: MAX_CANDIDATES_PER_LAYER,
            layer_truncated: false,
            truncated: false,
            started: false,
            finished: false,
            cancelled: false,
        })
    }

    pub fn with_cancel_token(mut self, token: CancellationToken) -> Self {
        self.cancel_token = Some(token);
        self
    }

    /// Cap the number of nodes kept for one level (at least 1).
    pub fn with_max_candidates(mut self, max_candidates: usize) -> Self {
        self.max_candidates = max_candidates.max(1);
        self
    }

    /// Level currently being produced; 0 is the hop nearest the search address.
    pub fn current_level(&self) -> usize {
        self.level
    }

    pub fn max_depth(&self) -> usize {
        self.config.max_depth as usize
    }

    /// Number of chains produced so far, including any not yet yielded.
    pub fn results_found(&self) -> usize {
        self.emitted.len()
    }

    /// Nodes still waiting to be expanded at the current level.
    pub fn frontier_len(&self) -> usize {
        self.current_layer.len()
    }

    pub fn was_cancelled(&self) -> bool {
        self.cancelled
    }

    /// Whether some level hit the candidate cap and dropped nodes.
    pub fn was_truncated(&self) -> bool {
        self.truncated
    }

    pub fn is_finished(&self) -> bool {
        self.finished && self.pending.is_empty()
    }

    fn check_cancelled(&mut self) -> bool {
        if self.cancel_token.as_ref().is_some_and(|t| t.is_cancelled()) {
            if !self.cancelled {
                info!("Chain search cancelled at level {} after {} chains", self.level, self.emitted.len());
            }
            self.cancelled = true;
            self.finished = true;
        }
        self.cancelled
    }

    /// Record a chain and queue it for yielding. Returns false for duplicates.
    fn emit(&mut self, chain: PointerChainResult) -> bool {
        if !self.emitted.insert(chain.clone()) {
            return false;
        }
        self.pending.push_back(chain);
        true
    }

    fn enqueue(&mut self, node: PathNode) {
        if node.offsets.len() >= self.max_depth() {
            return;
        }
        if self.next_layer.len() >= self.max_candidates {
            if !self.layer_truncated {
                warn!(
                    "[candidate pruning] level {} reached {} nodes, dropping the rest",
                    self.level + 1,
                    self.max_candidates
                );
                self.layer_truncated = true;
                self.truncated = true;
            }
            return;
        }
        self.next_layer.push(node);
    }

    fn expand_root(&mut self) {
        let target = self.config.search_address;
        let Some(matches) = self.query(target, self.config.primary_maximum_offset) else {
            return;
        };

        if log_enabled!(Level::Debug) {
            debug!("Level 0: {} pointers reach 0x{:08X}", matches.len(), target);
        }

        for entry in matches {
            let offset = entry.offset_to(target);
            if self.emit(PointerChainResult::new(entry.address, vec![offset])) {
                self.enqueue(PathNode {
                    base_address: entry.address,
                    offsets: vec![offset],
                    visited_addresses: vec![entry.address],
                });
            }
        }
    }

    fn expand_node(&mut self, node: PathNode) {
        let Some(matches) = self.query(node.base_address, self.config.secondary_maximum_offset) else {
            return;
        };

        for entry in matches {
            if node.is_visited(entry.address) {
                continue;
            }
            let parent = node.parent_of(entry.address, entry.offset_to(node.base_address));
            if self.emit(PointerChainResult::new(parent.base_address, parent.offsets.clone())) {
                self.enqueue(parent);
            }
        }
    }

    /// Pointers reaching `target` from `[minimum_offset, max_offset]`.
    ///
    /// A rejected window ends the search instead of passing for an empty level.
    fn query(&mut self, target: u32, max_offset: i32) -> Option<Vec<PointerIndexEntry>> {
        match self.index.find_pointers_to(target, self.config.minimum_offset, max_offset) {
            Ok(matches) => Some(matches),
            Err(e) => {
                error!("Chain search stopped at level {}: {}", self.level, e);
                self.finish();
                None
            },
        }
    }

    /// Move the queued nodes of the next level into the frontier.
    fn descend(&mut self) {
        self.level += 1;
        self.layer_truncated = false;
        self.current_layer = mem::take(&mut self.next_layer).into();

        if self.current_layer.is_empty() {
            debug!("No more candidates at level {}", self.level);
            self.finish();
        } else if log_enabled!(Level::Debug) {
            debug!("Processing level {}, {} nodes", self.level, self.current_layer.len());
        }
    }

    fn finish(&mut self) {
        if !self.finished {
            self.finished = true;
            info!("Pointer chain search complete. Found {} chains", self.emitted.len());
        }
    }

    /// Do one unit of work: the root query, one node expansion, or a level change.
    fn step(&mut self) {
        if self.check_cancelled() {
            return;
        }

        if !self.started {
            self.started = true;
            self.expand_root();
            return;
        }

        if let Some(node) = self.current_layer.pop_front() {
            self.expand_node(node);
            return;
        }

        self.descend();
    }
}

impl Iterator for ChainSearch<'_> {
    type Item = PointerChainResult;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(chain) = self.pending.pop_front() {
                return Some(chain);
            }
            if self.finished {
                return None;
            }
            self.step();
        }
    }
}

/// Start a chain search over `index`. The returned iterator does no work until
/// it is polled, and calling this again restarts the search from scratch.
pub fn search<'a>(index: &'a PointerIndex, config: &ScanConfig) -> Result<ChainSearch<'a>> {
    ChainSearch::new(index, config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pointer_scan::types::IndexParams;

    fn index_of(entries: &[(u32, u32)]) -> PointerIndex {
        let mut entries: Vec<PointerIndexEntry> = entries.iter().map(|&(a, v)| PointerIndexEntry::new(a, v)).collect();
        entries.sort_by_key(|e| e.address);
        PointerIndex::from_address_ordered(
            entries,
            IndexParams {
                addressable_base: 0x1000,
                addressable_length: 0x2000,
                alignment: 4,
            },
            0,
        )
    }

    fn config(target: u32) -> ScanConfig {
        ScanConfig::new(target).with_addressable_range(0x1000, 0x2000)
    }

    #[test]
    fn test_results_are_breadth_first() {
        // 0x1100 -> 0x1200 -> 0x1300 -> target 0x1400
        let index = index_of(&[(0x1100, 0x1200), (0x1200, 0x1300), (0x1300, 0x1400), (0x1104, 0x1400)]);
        let results: Vec<_> = search(&index, &config(0x1400).with_depth(3).with_offsets(0, 0, 0))
            .unwrap()
            .collect();

        let depths: Vec<usize> = results.iter().map(|r| r.depth()).collect();
        assert_eq!(depths, vec![1, 1, 2, 3]);
        assert_eq!(results[3], PointerChainResult::new(0x1100, vec![0, 0, 0]));
    }

    #[test]
    fn test_cycle_does_not_revisit_branch_addresses() {
        // 0x1100 and 0x1200 point at each other; 0x1200 also points at the target
        let index = index_of(&[(0x1100, 0x1200), (0x1200, 0x1100), (0x1204, 0x1300)]);
        let cfg = config(0x1300).with_depth(8).with_offsets(0, 4, 0x100);
        let results: Vec<_> = search(&index, &cfg).unwrap().collect();

        for chain in &results {
            assert!(chain.depth() <= 8);
        }
        assert_eq!(results[0], PointerChainResult::new(0x1204, vec![0]));
        // the 0x1100 <-> 0x1200 loop is walked once per branch, never repeated
        assert!(results.iter().all(|c| {
            let mut seen = Vec::new();
            let mut cursor = c.base_address;
            for &off in &c.offsets[..c.offsets.len() - 1] {
                if seen.contains(&cursor) {
                    return false;
                }
                seen.push(cursor);
                cursor = index.value_at(cursor).unwrap().wrapping_add(off as u32);
            }
            true
        }));
    }

    #[test]
    fn test_cancelled_token_stops_before_work() {
        let index = index_of(&[(0x1100, 0x1400)]);
        let token = CancellationToken::new();
        token.cancel();
        let mut search = search(&index, &config(0x1400).with_offsets(0, 0, 0))
            .unwrap()
            .with_cancel_token(token);
        assert!(search.next().is_none());
        assert!(search.was_cancelled());
    }

    #[test]
    fn test_cancellation_keeps_yielded_results() {
        let index = index_of(&[(0x1100, 0x1200), (0x1200, 0x1400), (0x1204, 0x1400)]);
        let token = CancellationToken::new();
        let mut search = search(&index, &config(0x1400).with_depth(4).with_offsets(0, 0, 0))
            .unwrap()
            .with_cancel_token(token.clone());

        let first = search.next().unwrap();
        assert_eq!(first.depth(), 1);
        token.cancel();

        // level 0 was already produced in one step, so its remaining chain still drains
        let rest: Vec<_> = search.by_ref().collect();
        assert!(rest.iter().all(|c| c.depth() == 1));
        assert!(search.was_cancelled());
    }

    #[test]
    fn test_candidate_cap_marks_search_truncated() {
        // three direct pointers to the target, each with its own predecessor
        let index = index_of(&[
            (0x1100, 0x1400),
            (0x1104, 0x1400),
            (0x1108, 0x1400),
            (0x1200, 0x1100),
            (0x1204, 0x1104),
            (0x1208, 0x1108),
        ]);
        let cfg = config(0x1400).with_depth(2).with_offsets(0, 0, 0);

        let mut capped = search(&index, &cfg).unwrap().with_max_candidates(1);
        let results: Vec<_> = capped.by_ref().collect();
        assert!(capped.was_truncated());
        assert_eq!(results.iter().filter(|r| r.depth() == 1).count(), 3);
        assert_eq!(results.iter().filter(|r| r.depth() == 2).count(), 1);
        assert!(results.contains(&PointerChainResult::new(0x1200, vec![0, 0])));

        let mut full = search(&index, &cfg).unwrap();
        assert_eq!(full.by_ref().count(), 6);
        assert!(!full.was_truncated());
    }

    #[test]
    fn test_invalid_config_is_rejected_up_front() {
        let index = index_of(&[]);
        let result = search(&index, &config(0x1400).with_offsets(8, 4, 4));
        assert!(result.is_err());
    }

    #[test]
    fn test_negative_minimum_offset() {
        // pointer value sits 8 bytes above the target
        let index = index_of(&[(0x1100, 0x1408)]);
        let results: Vec<_> = search(&index, &config(0x1400).with_depth(1).with_offsets(-0x10, 0, 0))
            .unwrap()
            .collect();
        assert_eq!(results, vec![PointerChainResult::new(0x1100, vec![-8])]);
    }
}
