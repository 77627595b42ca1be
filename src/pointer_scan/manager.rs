//! Scan Session
//!
//! Owns the snapshot and pointer index for one scanning workflow and runs the
//! long operations (load, capture, index build, chain search) in the
//! background. One operation runs at a time; the caller polls progress, reads
//! streamed results and may cancel at any point.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, SendTimeoutError, TryRecvError};
use log::{error, info, log_enabled, warn, Level};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::core::globals::TOKIO_RUNTIME;
use crate::pointer_scan::chain_builder::ChainSearch;
use crate::pointer_scan::error::{Result, ScanError};
use crate::pointer_scan::index::PointerIndex;
use crate::pointer_scan::progress::{ProgressReport, ScanProgress};
use crate::pointer_scan::scanner;
use crate::pointer_scan::snapshot::{MemorySnapshot, MemorySource};
use crate::pointer_scan::types::{PointerChainResult, ScanConfig, ScanPhase};

/// Search progress is republished every this many results
const SEARCH_PROGRESS_INTERVAL: usize = 1024;

/// Results buffered ahead of a slow consumer
pub const RESULT_CHANNEL_CAPACITY: usize = 4096;

/// How often a blocked send rechecks the cancellation token
const SEND_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// How a background operation ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationOutcome {
    Loaded { length: u32 },
    Indexed { pointers: usize },
    /// `truncated` is set when a level hit the candidate cap, so deeper chains
    /// may be missing.
    Searched { results: usize, truncated: bool },
    Cancelled,
}

#[derive(Default)]
struct SessionState {
    snapshot: Option<Arc<MemorySnapshot>>,
    /// Bumped every time a snapshot is installed
    snapshot_generation: u64,
    index: Option<Arc<PointerIndex>>,
    /// Results streamed by the last search, complete or not
    last_results: Option<usize>,
    outcome: Option<Result<OperationOutcome>>,
}

impl SessionState {
    fn install_snapshot(&mut self, snapshot: MemorySnapshot) {
        self.snapshot = Some(Arc::new(snapshot));
        self.snapshot_generation += 1;
        self.index = None;
        self.last_results = None;
    }
}

/// Results of a running chain search, in emission order.
///
/// Iterating blocks until the next result arrives or the search ends. Dropping
/// the stream stops the search.
pub struct ResultStream {
    receiver: Receiver<PointerChainResult>,
}

impl ResultStream {
    /// Next result if one is already waiting.
    ///
    /// `Empty` means the search is still running; `Disconnected` means it
    /// ended and every result has been read.
    pub fn try_next(&self) -> std::result::Result<PointerChainResult, TryRecvError> {
        self.receiver.try_recv()
    }

    /// Wait up to `timeout` for the next result.
    pub fn next_timeout(&self, timeout: Duration) -> std::result::Result<PointerChainResult, RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }
}

impl Iterator for ResultStream {
    type Item = PointerChainResult;

    fn next(&mut self) -> Option<Self::Item> {
        self.receiver.recv().ok()
    }
}

/// One scanning workflow: a snapshot, its pointer index and the operation
/// currently running against them.
pub struct ScanSession {
    state: Arc<RwLock<SessionState>>,
    progress: Arc<ScanProgress>,
    running: Arc<AtomicBool>,
    /// Cancellation token for the current operation
    cancel_token: Option<CancellationToken>,
    /// Handle to the background task
    scan_handle: Option<JoinHandle<()>>,
}

impl ScanSession {
    pub fn new() -> Self {
        Self {
            state: Arc::new(RwLock::new(SessionState::default())),
            progress: Arc::new(ScanProgress::new()),
            running: Arc::new(AtomicBool::new(false)),
            cancel_token: None,
            scan_handle: None,
        }
    }

    /// Whether a background operation is in flight.
    ///
    /// True from the moment a start call returns `Ok` until the operation has
    /// published its final state.
    pub fn is_scan_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn phase(&self) -> ScanPhase {
        self.progress.phase()
    }

    pub fn progress(&self) -> ProgressReport {
        self.progress.report()
    }

    pub fn has_snapshot(&self) -> bool {
        self.read_state(|state| state.snapshot.is_some())
    }

    pub fn snapshot(&self) -> Option<Arc<MemorySnapshot>> {
        self.read_state(|state| state.snapshot.clone())
    }

    pub fn has_pointer_map(&self) -> bool {
        self.read_state(|state| state.index.is_some())
    }

    pub fn index(&self) -> Option<Arc<PointerIndex>> {
        self.read_state(|state| state.index.clone())
    }

    pub fn pointer_count(&self) -> usize {
        self.read_state(|state| state.index.as_ref().map_or(0, |index| index.len()))
    }

    /// Whether the current index can not serve a search with `config`.
    pub fn is_index_stale(&self, config: &ScanConfig) -> bool {
        self.read_state(|state| match &state.index {
            Some(index) => !index.is_valid_for(config, state.snapshot_generation),
            None => true,
        })
    }

    /// One-line summary for a status bar.
    pub fn status_text(&self) -> String {
        if self.is_scan_running() && self.phase() == ScanPhase::Searching {
            return format!("{} results found", self.progress.report().chains_found);
        }
        self.read_state(|state| match (state.last_results, &state.index) {
            (Some(results), _) => format!("{} results found", results),
            (None, Some(index)) => format!("{} pointers indexed", index.len()),
            (None, None) => "No pointer map loaded".to_string(),
        })
    }

    /// Install an in-memory snapshot, replacing the current one and dropping
    /// the index built from it.
    pub fn install_snapshot(&self, snapshot: MemorySnapshot) -> Result<()> {
        self.ensure_idle()?;
        self.write_state(|state| state.install_snapshot(snapshot))
    }

    /// Drop the index and the last search results; the snapshot stays.
    pub fn clear(&self) -> Result<()> {
        self.ensure_idle()?;
        self.progress.reset();
        self.write_state(|state| {
            state.index = None;
            state.last_results = None;
            state.outcome = None;
        })
    }

    /// Drop the snapshot together with everything derived from it.
    pub fn dispose_snapshot(&self) -> Result<()> {
        self.ensure_idle()?;
        self.progress.reset();
        self.write_state(|state| {
            state.snapshot = None;
            state.index = None;
            state.last_results = None;
            state.outcome = None;
        })
    }

    /// Start loading a memory dump file in the background.
    ///
    /// On success the new snapshot replaces the current one and the index is
    /// dropped. A failed or cancelled load leaves the session untouched.
    pub fn load_snapshot(&mut self, path: impl Into<PathBuf>, base_address: u32, little_endian: bool) -> Result<()> {
        let path = path.into();
        let cancel_token = self.begin_operation(ScanPhase::LoadingSnapshot)?;
        self.progress.write_indeterminate();

        if log_enabled!(Level::Debug) {
            info!("Loading memory dump {:?} at 0x{:08X}", path, base_address);
        }

        let state = self.state.clone();
        self.spawn_operation(cancel_token, move |token| {
            let snapshot = MemorySnapshot::load(&path, base_address, little_endian, || token.is_cancelled())?;
            let length = snapshot.length();
            store_snapshot(&state, snapshot)?;
            Ok(OperationOutcome::Loaded { length })
        });
        Ok(())
    }

    /// Start capturing `length` bytes at `base_address` from a live source.
    pub fn capture_snapshot<S>(&mut self, source: Arc<S>, base_address: u32, length: u32, little_endian: bool) -> Result<()>
    where
        S: MemorySource + Send + Sync + ?Sized + 'static,
    {
        let cancel_token = self.begin_operation(ScanPhase::LoadingSnapshot)?;
        self.progress.write_indeterminate();

        let state = self.state.clone();
        self.spawn_operation(cancel_token, move |token| {
            let snapshot = MemorySnapshot::capture(&*source, base_address, length, little_endian, || token.is_cancelled())?;
            store_snapshot(&state, snapshot)?;
            Ok(OperationOutcome::Loaded { length })
        });
        Ok(())
    }

    /// Start building the pointer index for the addressable range in `config`.
    ///
    /// The previous index stays in place until the new one is complete.
    pub fn generate_index(&mut self, config: &ScanConfig) -> Result<()> {
        let params = config.index_params();
        params.validate()?;

        let (snapshot, generation) = self.read_state(|state| (state.snapshot.clone(), state.snapshot_generation));
        let snapshot = snapshot.ok_or_else(|| ScanError::invalid_state("no memory dump loaded"))?;

        let cancel_token = self.begin_operation(ScanPhase::BuildingIndex)?;

        let state = self.state.clone();
        let progress = self.progress.clone();
        self.spawn_operation(cancel_token, move |token| {
            let index = scanner::build_pointer_index(
                &snapshot,
                params,
                generation,
                |done, total, found| progress.update_indexing_progress(done, total, found),
                || token.is_cancelled(),
            )?;

            let pointers = index.len();
            progress.write_pointers_found(pointers as i64);
            let mut state = state
                .write()
                .map_err(|_| ScanError::Internal("session state poisoned".to_string()))?;
            if state.snapshot_generation != generation {
                return Err(ScanError::invalid_state("snapshot replaced while indexing"));
            }
            state.index = Some(Arc::new(index));
            state.last_results = None;
            Ok(OperationOutcome::Indexed { pointers })
        });
        Ok(())
    }

    /// Start a chain search and return the stream its results arrive on.
    ///
    /// Requires an index built from the current snapshot with the same
    /// addressable range and alignment as `config`.
    pub fn run(&mut self, config: &ScanConfig) -> Result<ResultStream> {
        config.validate()?;

        let index = self.read_state(|state| match &state.index {
            None => Err(ScanError::invalid_state("no pointer map loaded")),
            Some(index) if !index.is_valid_for(config, state.snapshot_generation) => Err(ScanError::invalid_state(
                "pointer map is stale, regenerate it for this configuration",
            )),
            Some(index) => Ok(index.clone()),
        })?;

        let cancel_token = self.begin_operation(ScanPhase::Searching)?;
        if let Ok(mut state) = self.state.write() {
            state.last_results = None;
        }

        if log_enabled!(Level::Debug) {
            info!(
                "Starting pointer scan: target=0x{:08X}, depth={}, offsets=[{:#X}, {:#X}/{:#X}], pointers={}",
                config.search_address,
                config.max_depth,
                config.minimum_offset,
                config.primary_maximum_offset,
                config.secondary_maximum_offset,
                index.len()
            );
        }

        let (sender, receiver) = crossbeam_channel::bounded(RESULT_CHANNEL_CAPACITY);
        let config = config.clone();
        let state = self.state.clone();
        let progress = self.progress.clone();
        self.spawn_operation(cancel_token, move |token| {
            let mut search = ChainSearch::new(&index, &config)?.with_cancel_token(token.clone());
            let max_depth = search.max_depth() as u32;
            let mut results = 0usize;
            let mut stream_closed = false;

            'search: while let Some(mut chain) = search.next() {
                loop {
                    match sender.send_timeout(chain, SEND_POLL_INTERVAL) {
                        Ok(()) => break,
                        Err(SendTimeoutError::Timeout(unsent)) => {
                            if token.is_cancelled() {
                                break 'search;
                            }
                            chain = unsent;
                        },
                        Err(SendTimeoutError::Disconnected(_)) => {
                            info!("Result stream dropped, stopping search");
                            stream_closed = true;
                            break 'search;
                        },
                    }
                }
                results += 1;
                if results % SEARCH_PROGRESS_INTERVAL == 0 {
                    progress.update_search_progress(reported_depth(&search), max_depth, results);
                }
            }
            progress.update_search_progress(reported_depth(&search), max_depth, results);

            if let Ok(mut state) = state.write() {
                state.last_results = Some(results);
            }

            if stream_closed || search.was_cancelled() || token.is_cancelled() {
                return Err(ScanError::Cancelled);
            }
            let truncated = search.was_truncated();
            if truncated {
                warn!("Search hit the per-level candidate cap, deeper chains may be missing");
            }
            Ok(OperationOutcome::Searched { results, truncated })
        });

        Ok(ResultStream { receiver })
    }

    /// Request cancellation and wait for the operation to unwind.
    ///
    /// Whatever the operation produced before it noticed stays in place.
    pub async fn cancel(&mut self) {
        if let Some(ref token) = self.cancel_token {
            token.cancel();
        }
        if let Some(handle) = self.scan_handle.take() {
            if let Err(e) = handle.await {
                error!("Scan task failed while cancelling: {}", e);
            }
        }
    }

    /// Wait for the current operation and return how it ended.
    pub async fn wait(&mut self) -> Result<OperationOutcome> {
        if let Some(handle) = self.scan_handle.take() {
            handle
                .await
                .map_err(|e| ScanError::Internal(format!("scan task failed: {}", e)))?;
        }
        self.state
            .write()
            .map_err(|_| ScanError::Internal("session state poisoned".to_string()))?
            .outcome
            .take()
            .unwrap_or_else(|| Err(ScanError::invalid_state("no operation has run")))
    }

    fn ensure_idle(&self) -> Result<()> {
        if self.is_scan_running() {
            return Err(ScanError::invalid_state("an operation is already in progress"));
        }
        Ok(())
    }

    /// Claim the session for a new operation and publish its phase.
    fn begin_operation(&mut self, phase: ScanPhase) -> Result<CancellationToken> {
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(ScanError::invalid_state("an operation is already in progress"));
        }

        // Previous task already published; only its handle is left
        self.scan_handle = None;
        if let Ok(mut state) = self.state.write() {
            state.outcome = None;
        }

        self.progress.reset();
        self.progress.write_phase(phase);

        let cancel_token = CancellationToken::new();
        self.cancel_token = Some(cancel_token.clone());
        Ok(cancel_token)
    }

    fn spawn_operation<F>(&mut self, cancel_token: CancellationToken, operation: F)
    where
        F: FnOnce(CancellationToken) -> Result<OperationOutcome> + Send + 'static,
    {
        let state = self.state.clone();
        let progress = self.progress.clone();
        let running = self.running.clone();

        let handle = TOKIO_RUNTIME.spawn(async move {
            let result = tokio::task::spawn_blocking(move || operation(cancel_token)).await;

            let outcome = match result {
                Ok(Ok(outcome)) => {
                    progress.write_progress(100);
                    progress.write_phase(ScanPhase::Completed);
                    Ok(outcome)
                },
                Ok(Err(ScanError::Cancelled)) => {
                    info!("Operation cancelled");
                    progress.write_phase(ScanPhase::Cancelled);
                    Ok(OperationOutcome::Cancelled)
                },
                Ok(Err(e)) => {
                    error!("Operation failed: {}", e);
                    progress.write_error_code(e.code());
                    progress.write_phase(ScanPhase::Error);
                    Err(e)
                },
                Err(e) => {
                    error!("Operation task panicked: {}", e);
                    let e = ScanError::Internal(e.to_string());
                    progress.write_error_code(e.code());
                    progress.write_phase(ScanPhase::Error);
                    Err(e)
                },
            };

            match state.write() {
                Ok(mut state) => state.outcome = Some(outcome),
                Err(_) => warn!("Session state poisoned, dropping operation outcome"),
            }
            running.store(false, Ordering::Release);
        });

        self.scan_handle = Some(handle);
    }

    fn read_state<T>(&self, f: impl FnOnce(&SessionState) -> T) -> T {
        match self.state.read() {
            Ok(state) => f(&*state),
            Err(poisoned) => f(&*poisoned.into_inner()),
        }
    }

    fn write_state<T>(&self, f: impl FnOnce(&mut SessionState) -> T) -> Result<T> {
        let mut state = self
            .state
            .write()
            .map_err(|_| ScanError::Internal("session state poisoned".to_string()))?;
        Ok(f(&mut state))
    }
}

impl Default for ScanSession {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ScanSession {
    fn drop(&mut self) {
        if let Some(ref token) = self.cancel_token {
            token.cancel();
        }
    }
}

/// Depth being produced, 1-based. A finished search has already stepped past
/// its last level.
fn reported_depth(search: &ChainSearch<'_>) -> u32 {
    (search.current_level() + 1).min(search.max_depth()) as u32
}

fn store_snapshot(state: &RwLock<SessionState>, snapshot: MemorySnapshot) -> Result<()> {
    let mut state = state
        .write()
        .map_err(|_| ScanError::Internal("session state poisoned".to_string()))?;
    state.install_snapshot(snapshot);
    Ok(())
}
