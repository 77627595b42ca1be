//! Pointer Scan Module
//!
//! Finds pointer chains that lead from stable locations in a 32-bit memory
//! snapshot to a target address, so the target can be found again after the
//! program moves its data around.
//!
//! # Architecture
//!
//! - `types`: Core data structures (PointerIndexEntry, PointerChainResult, ScanConfig, etc.)
//! - `snapshot`: Memory snapshots loaded from dump files or captured from a live source
//! - `scanner`: Phase 1 - Scan the snapshot for valid pointers
//! - `index`: Value-sorted pointer index with wrapping offset-window queries
//! - `chain_builder`: Phase 2 - Build pointer chains backwards from the target address
//!   - `layer_bfs`: lazy layer-by-layer breadth-first search
//! - `progress`: Progress record shared with observers
//! - `manager`: Background execution and session state
//!
//! # Usage
//!
//! ```ignore
//! use ptrscan_core::pointer_scan::{ScanConfig, ScanSession};
//!
//! let config = ScanConfig::new(0x8262_AA00).with_addressable_range(0x8000_0000, 0x0400_0000);
//! let mut session = ScanSession::new();
//!
//! session.load_snapshot("ram.bin", 0x8000_0000, false)?;
//! session.wait().await?;
//! session.generate_index(&config)?;
//! session.wait().await?;
//!
//! for chain in session.run(&config)? {
//!     println!("{}", chain);
//! }
//! ```

pub mod chain_builder;
pub mod error;
pub mod index;
pub mod manager;
pub mod progress;
pub mod scanner;
pub mod snapshot;
pub mod types;

#[cfg(test)]
pub mod tests;

// Re-export commonly used types
pub use error::{Result, ScanError};
pub use index::PointerIndex;
pub use manager::{OperationOutcome, ResultStream, ScanSession};
pub use progress::{ProgressReport, ScanProgress};
pub use snapshot::{MemorySnapshot, MemorySource};
pub use types::*;
