use std::fmt;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::pointer_scan::error::{Result, ScanError};
use crate::pointer_scan::snapshot::MemorySnapshot;

/// An aligned address whose stored word points back into the addressable range.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Hash)]
pub struct PointerIndexEntry {
    /// The address where this pointer is located in memory
    pub address: u32,
    /// The value this pointer points to (target address)
    pub value: u32,
}

impl PointerIndexEntry {
    pub fn new(address: u32, value: u32) -> Self {
        Self { address, value }
    }

    /// Offset that must be added to this pointer's value to land on `target`.
    #[inline]
    pub fn offset_to(&self, target: u32) -> i32 {
        target.wrapping_sub(self.value) as i32
    }
}

/// A static base address plus the offsets that lead from it to the search address.
///
/// Every offset but the last is applied after a dereference and produces the
/// next cursor; the last offset is added to the final dereferenced value without
/// reading memory again.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PointerChainResult {
    pub base_address: u32,
    pub offsets: Vec<i32>,
}

impl PointerChainResult {
    pub fn new(base_address: u32, offsets: Vec<i32>) -> Self {
        Self { base_address, offsets }
    }

    pub fn depth(&self) -> usize {
        self.offsets.len()
    }

    /// Replay the chain against a snapshot.
    ///
    /// Returns `None` when any dereference leaves the snapshot or the chain has
    /// no offsets.
    pub fn resolve(&self, snapshot: &MemorySnapshot) -> Option<u32> {
        let (last, hops) = self.offsets.split_last()?;
        let mut cursor = self.base_address;
        for &offset in hops {
            cursor = snapshot.read_u32(cursor)?.wrapping_add(offset as u32);
        }
        Some(snapshot.read_u32(cursor)?.wrapping_add(*last as u32))
    }
}

impl fmt::Display for PointerChainResult {
    /// Formats the chain like "8262AA00->+0xFC->-0x20"
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08X}", self.base_address)?;
        for &offset in &self.offsets {
            if offset >= 0 {
                write!(f, "->+0x{:X}", offset)?;
            } else {
                write!(f, "->-0x{:X}", offset.unsigned_abs())?;
            }
        }
        Ok(())
    }
}

/// The part of [`ScanConfig`] that determines which pointers get indexed.
///
/// Any change to these fields makes a previously built index stale.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexParams {
    pub addressable_base: u32,
    pub addressable_length: u32,
    pub alignment: u32,
}

impl IndexParams {
    /// Exclusive end of the addressable range, clamped to the 32-bit space.
    pub fn addressable_end(&self) -> u64 {
        (self.addressable_base as u64 + self.addressable_length as u64).min(1 << 32)
    }

    #[inline]
    pub fn contains(&self, value: u32) -> bool {
        let value = value as u64;
        value >= self.addressable_base as u64 && value < self.addressable_end()
    }

    pub fn validate(&self) -> Result<()> {
        if self.alignment == 0 || !self.alignment.is_power_of_two() {
            return Err(ScanError::invalid_config(format!(
                "alignment must be a non-zero power of two, got {}",
                self.alignment
            )));
        }
        Ok(())
    }
}

/// Configuration for pointer scanning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ScanConfig {
    /// Smallest value a pointer can have
    pub addressable_base: u32,
    /// Number of bytes above `addressable_base` that pointers may point into
    pub addressable_length: u32,
    /// The address we want to reach, e.g. the address of an ammo count
    pub search_address: u32,
    /// Maximum number of offsets in a chain (default: 6)
    pub max_depth: u8,
    /// Lower offset bound applied to every hop (default: 4)
    pub minimum_offset: i32,
    /// Upper offset bound for the hop nearest the search address (default: 0x4000)
    pub primary_maximum_offset: i32,
    /// Upper offset bound for every other hop (default: 0x4000)
    pub secondary_maximum_offset: i32,
    /// Pointer alignment in bytes (default: 4)
    pub alignment: u32,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            addressable_base: 0,
            addressable_length: 0,
            search_address: 0,
            max_depth: 6,
            // 4 rather than 0 keeps linked-list self references out of the results
            minimum_offset: 4,
            primary_maximum_offset: 0x4000,
            secondary_maximum_offset: 0x4000,
            alignment: 4,
        }
    }
}

impl ScanConfig {
    pub fn new(search_address: u32) -> Self {
        Self {
            search_address,
            ..Default::default()
        }
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|source| ScanError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(serde_json::from_str(&contents)?)
    }

    pub fn with_addressable_range(mut self, base: u32, length: u32) -> Self {
        self.addressable_base = base;
        self.addressable_length = length;
        self
    }

    pub fn with_depth(mut self, depth: u8) -> Self {
        self.max_depth = depth;
        self
    }

    pub fn with_offsets(mut self, minimum: i32, primary_maximum: i32, secondary_maximum: i32) -> Self {
        self.minimum_offset = minimum;
        self.primary_maximum_offset = primary_maximum;
        self.secondary_maximum_offset = secondary_maximum;
        self
    }

    pub fn with_align(mut self, align: u32) -> Self {
        self.alignment = align;
        self
    }

    pub fn index_params(&self) -> IndexParams {
        IndexParams {
            addressable_base: self.addressable_base,
            addressable_length: self.addressable_length,
            alignment: self.alignment,
        }
    }

    /// Reject configurations that cannot produce a meaningful search.
    pub fn validate(&self) -> Result<()> {
        let params = self.index_params();
        params.validate()?;

        if self.max_depth == 0 {
            return Err(ScanError::invalid_config("max depth must be at least 1"));
        }
        if self.minimum_offset > self.primary_maximum_offset {
            return Err(ScanError::invalid_config(format!(
                "minimum offset {:#X} exceeds primary maximum offset {:#X}",
                self.minimum_offset, self.primary_maximum_offset
            )));
        }
        if self.max_depth > 1 && self.minimum_offset > self.secondary_maximum_offset {
            return Err(ScanError::invalid_config(format!(
                "minimum offset {:#X} exceeds secondary maximum offset {:#X}",
                self.minimum_offset, self.secondary_maximum_offset
            )));
        }
        if !params.contains(self.search_address) {
            return Err(ScanError::invalid_config(format!(
                "search address 0x{:08X} is outside the addressable range 0x{:08X}..0x{:X}",
                self.search_address,
                self.addressable_base,
                params.addressable_end()
            )));
        }
        Ok(())
    }
}

/// Scan phase enumeration for progress tracking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ScanPhase {
    /// No operation in progress
    Idle = 0,
    /// Reading a snapshot from a file or a live source
    LoadingSnapshot = 1,
    /// Scanning the snapshot for valid pointers
    BuildingIndex = 2,
    /// Walking pointer chains back from the search address
    Searching = 3,
    /// Last operation completed successfully
    Completed = 4,
    /// Last operation was cancelled by the caller
    Cancelled = 5,
    /// Last operation failed
    Error = 6,
}

impl From<i32> for ScanPhase {
    fn from(value: i32) -> Self {
        match value {
            0 => ScanPhase::Idle,
            1 => ScanPhase::LoadingSnapshot,
            2 => ScanPhase::BuildingIndex,
            3 => ScanPhase::Searching,
            4 => ScanPhase::Completed,
            5 => ScanPhase::Cancelled,
            6 => ScanPhase::Error,
            _ => ScanPhase::Idle,
        }
    }
}

/// Error codes for pointer scanning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ScanErrorCode {
    /// No error
    None = 0,
    /// Snapshot file could not be read
    IoFailed = 1,
    /// Live memory read failed
    MemoryReadFailed = 2,
    /// Configuration rejected before starting
    InvalidConfig = 3,
    /// Operation not allowed in the current session state
    InvalidState = 4,
    /// Background task panicked
    InternalError = 5,
}

impl From<i32> for ScanErrorCode {
    fn from(value: i32) -> Self {
        match value {
            1 => ScanErrorCode::IoFailed,
            2 => ScanErrorCode::MemoryReadFailed,
            3 => ScanErrorCode::InvalidConfig,
            4 => ScanErrorCode::InvalidState,
            5 => ScanErrorCode::InternalError,
            _ => ScanErrorCode::None,
        }
    }
}
