//! Pointer chain scanning for 32-bit memory snapshots.

pub mod core;
pub mod pointer_scan;

pub use pointer_scan::{
    MemorySnapshot, MemorySource, OperationOutcome, PointerChainResult, PointerIndex, ResultStream, ScanConfig,
    ScanError, ScanSession,
};
