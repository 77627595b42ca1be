//! Progress record shared between a running scan operation and its observers.
//!
//! Writers are the background workers; readers poll [`ScanProgress::report`]
//! from whatever thread drives the UI. All fields are independent atomics, so a
//! report is a best-effort view rather than a consistent snapshot.

use std::sync::atomic::{AtomicI32, AtomicI64, AtomicU32, Ordering};

use crate::pointer_scan::types::{ScanErrorCode, ScanPhase};

/// Progress value meaning "no fraction available".
pub const PROGRESS_INDETERMINATE: i32 = -1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgressReport {
    pub phase: ScanPhase,
    /// 0-100, or [`PROGRESS_INDETERMINATE`]
    pub progress: i32,
    pub pointers_found: i64,
    pub chains_found: i64,
    pub current_depth: i32,
    pub heartbeat: u32,
    pub error_code: ScanErrorCode,
}

impl ProgressReport {
    pub fn is_indeterminate(&self) -> bool {
        self.progress == PROGRESS_INDETERMINATE
    }

    /// Progress as a fraction in `[0, 1]`, if one is known.
    pub fn fraction(&self) -> Option<f64> {
        if self.is_indeterminate() {
            None
        } else {
            Some(self.progress as f64 / 100.0)
        }
    }
}

#[derive(Debug, Default)]
pub struct ScanProgress {
    phase: AtomicI32,
    progress: AtomicI32,
    pointers_found: AtomicI64,
    chains_found: AtomicI64,
    current_depth: AtomicI32,
    heartbeat: AtomicU32,
    error_code: AtomicI32,
}

impl ScanProgress {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reset every counter, keeping nothing from the previous operation.
    pub fn reset(&self) {
        self.phase.store(ScanPhase::Idle as i32, Ordering::Relaxed);
        self.progress.store(0, Ordering::Relaxed);
        self.pointers_found.store(0, Ordering::Relaxed);
        self.chains_found.store(0, Ordering::Relaxed);
        self.current_depth.store(0, Ordering::Relaxed);
        self.error_code.store(ScanErrorCode::None as i32, Ordering::Relaxed);
    }

    pub fn write_phase(&self, phase: ScanPhase) {
        self.phase.store(phase as i32, Ordering::Release);
    }

    pub fn phase(&self) -> ScanPhase {
        ScanPhase::from(self.phase.load(Ordering::Acquire))
    }

    /// Write the progress percentage (0-100).
    pub fn write_progress(&self, progress: i32) {
        self.progress.store(progress.clamp(0, 100), Ordering::Relaxed);
    }

    pub fn write_indeterminate(&self) {
        self.progress.store(PROGRESS_INDETERMINATE, Ordering::Relaxed);
    }

    pub fn write_pointers_found(&self, count: i64) {
        self.pointers_found.store(count, Ordering::Relaxed);
    }

    pub fn write_chains_found(&self, count: i64) {
        self.chains_found.store(count, Ordering::Relaxed);
    }

    pub fn write_error_code(&self, code: ScanErrorCode) {
        self.error_code.store(code as i32, Ordering::Relaxed);
    }

    pub fn update_heartbeat(&self) {
        self.heartbeat.fetch_add(1, Ordering::Relaxed);
    }

    /// Update progress while the pointer index is being built.
    pub fn update_indexing_progress(&self, batches_done: usize, total_batches: usize, pointers_found: usize) {
        let progress = if total_batches > 0 {
            (batches_done as f64 / total_batches as f64 * 100.0) as i32
        } else {
            100
        };
        // Batches finish out of order, so never move backwards
        self.progress.fetch_max(progress.clamp(0, 100), Ordering::Relaxed);
        self.pointers_found.fetch_max(pointers_found as i64, Ordering::Relaxed);
        self.update_heartbeat();
    }

    /// Update progress while chains are being searched.
    pub fn update_search_progress(&self, current_depth: u32, max_depth: u32, chains_found: usize) {
        let progress = if max_depth > 0 {
            (current_depth as f64 / max_depth as f64 * 100.0) as i32
        } else {
            0
        };
        self.write_progress(progress);
        self.current_depth.store(current_depth as i32, Ordering::Relaxed);
        self.write_chains_found(chains_found as i64);
        self.update_heartbeat();
    }

    pub fn report(&self) -> ProgressReport {
        ProgressReport {
            phase: self.phase(),
            progress: self.progress.load(Ordering::Relaxed),
            pointers_found: self.pointers_found.load(Ordering::Relaxed),
            chains_found: self.chains_found.load(Ordering::Relaxed),
            current_depth: self.current_depth.load(Ordering::Relaxed),
            heartbeat: self.heartbeat.load(Ordering::Relaxed),
            error_code: ScanErrorCode::from(self.error_code.load(Ordering::Relaxed)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_indexing_progress_percentages() {
        let progress = ScanProgress::new();
        progress.write_phase(ScanPhase::BuildingIndex);
        progress.update_indexing_progress(1, 4, 12);

        let report = progress.report();
        assert_eq!(report.phase, ScanPhase::BuildingIndex);
        assert_eq!(report.progress, 25);
        assert_eq!(report.pointers_found, 12);
        assert_eq!(report.fraction(), Some(0.25));
        assert_eq!(report.heartbeat, 1);
    }

    #[test]
    fn test_indexing_progress_never_moves_backwards() {
        let progress = ScanProgress::new();
        progress.update_indexing_progress(3, 4, 30);
        progress.update_indexing_progress(1, 4, 10);

        let report = progress.report();
        assert_eq!(report.progress, 75);
        assert_eq!(report.pointers_found, 30);
        assert_eq!(report.heartbeat, 2);
    }

    #[test]
    fn test_indeterminate_and_reset() {
        let progress = ScanProgress::new();
        progress.write_phase(ScanPhase::LoadingSnapshot);
        progress.write_indeterminate();
        assert!(progress.report().is_indeterminate());
        assert_eq!(progress.report().fraction(), None);

        progress.write_error_code(ScanErrorCode::IoFailed);
        progress.reset();
        let report = progress.report();
        assert_eq!(report.phase, ScanPhase::Idle);
        assert_eq!(report.progress, 0);
        assert_eq!(report.error_code, ScanErrorCode::None);
    }

    #[test]
    fn test_search_progress_tracks_depth() {
        let progress = ScanProgress::new();
        progress.update_search_progress(2, 4, 7);
        let report = progress.report();
        assert_eq!(report.progress, 50);
        assert_eq!(report.current_depth, 2);
        assert_eq!(report.chains_found, 7);
    }
}
