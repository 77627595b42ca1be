//! Memory snapshots: a contiguous copy of target memory at a known base address.
//!
//! A snapshot is either read from a dump file or captured through a
//! [`MemorySource`] (typically a live console connection owned by the caller).
//! Both paths read in fixed-size chunks so that cancellation is observed
//! without waiting for the whole range.

use std::cmp::min;
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::sync::Arc;

use log::{debug, info, log_enabled, Level};

use crate::pointer_scan::error::{Result, ScanError};

/// Read granularity for both file loads and live captures.
const CHUNK_SIZE: usize = 0x10000;

/// Size of the 32-bit address space.
const ADDRESS_SPACE: u64 = 1 << 32;

/// Something that can hand out raw bytes for an address range.
///
/// Implementations backed by a live connection expect the caller to hold the
/// connection's busy token for as long as the capture runs.
pub trait MemorySource {
    fn read_memory(&self, address: u32, buf: &mut [u8]) -> anyhow::Result<()>;
}

/// Immutable copy of a contiguous region of target memory.
#[derive(Debug, Clone)]
pub struct MemorySnapshot {
    data: Arc<[u8]>,
    base_address: u32,
    little_endian: bool,
}

impl MemorySnapshot {
    pub fn from_bytes(data: impl Into<Arc<[u8]>>, base_address: u32, little_endian: bool) -> Result<Self> {
        let data = data.into();
        check_fits(base_address, data.len() as u64)?;
        Ok(Self {
            data,
            base_address,
            little_endian,
        })
    }

    /// Read a memory dump file fully into memory.
    pub fn load<C>(path: impl AsRef<Path>, base_address: u32, little_endian: bool, check_cancelled: C) -> Result<Self>
    where
        C: Fn() -> bool,
    {
        let path = path.as_ref();
        let io_err = |source| ScanError::Io {
            path: path.to_path_buf(),
            source,
        };

        let mut file = File::open(path).map_err(io_err)?;
        let file_len = file.metadata().map_err(io_err)?.len();
        check_fits(base_address, file_len)?;

        info!(
            "Loading memory dump {:?}: {} bytes at 0x{:08X} ({})",
            path,
            file_len,
            base_address,
            if little_endian { "little endian" } else { "big endian" }
        );

        let mut data = Vec::with_capacity(file_len as usize);
        let mut chunk = vec![0u8; CHUNK_SIZE];
        loop {
            if check_cancelled() {
                return Err(ScanError::Cancelled);
            }
            let read = file.read(&mut chunk).map_err(io_err)?;
            if read == 0 {
                break;
            }
            data.extend_from_slice(&chunk[..read]);
        }

        // The file may have grown while we were reading it
        check_fits(base_address, data.len() as u64)?;

        if log_enabled!(Level::Debug) {
            debug!("Memory dump loaded: {} bytes", data.len());
        }

        Self::from_bytes(data, base_address, little_endian)
    }

    /// Copy `length` bytes starting at `base_address` out of a live source.
    pub fn capture<S, C>(source: &S, base_address: u32, length: u32, little_endian: bool, check_cancelled: C) -> Result<Self>
    where
        S: MemorySource + ?Sized,
        C: Fn() -> bool,
    {
        check_fits(base_address, length as u64)?;
        info!("Capturing {} bytes at 0x{:08X}", length, base_address);

        let mut data = vec![0u8; length as usize];
        let mut done = 0usize;
        while done < data.len() {
            if check_cancelled() {
                return Err(ScanError::Cancelled);
            }
            let read_size = min(CHUNK_SIZE, data.len() - done);
            let address = base_address.wrapping_add(done as u32);
            source
                .read_memory(address, &mut data[done..done + read_size])
                .map_err(|e| ScanError::Capture {
                    address,
                    message: e.to_string(),
                })?;
            done += read_size;
        }

        Self::from_bytes(data, base_address, little_endian)
    }

    #[inline]
    pub fn base_address(&self) -> u32 {
        self.base_address
    }

    #[inline]
    pub fn length(&self) -> u32 {
        // check_fits caps the length at 2^32 - base, which only reaches 2^32 for base 0
        self.data.len().min(u32::MAX as usize) as u32
    }

    #[inline]
    pub fn is_little_endian(&self) -> bool {
        self.little_endian
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Read the word stored at a virtual address, or `None` if the 4 bytes are
    /// not entirely inside the snapshot.
    #[inline]
    pub fn read_u32(&self, address: u32) -> Option<u32> {
        let offset = address.checked_sub(self.base_address)? as usize;
        let bytes: [u8; 4] = self.data.get(offset..offset.checked_add(4)?)?.try_into().ok()?;
        Some(if self.little_endian {
            u32::from_le_bytes(bytes)
        } else {
            u32::from_be_bytes(bytes)
        })
    }
}

fn check_fits(base_address: u32, length: u64) -> Result<()> {
    if base_address as u64 + length > ADDRESS_SPACE {
        return Err(ScanError::invalid_config(format!(
            "{} bytes at 0x{:08X} do not fit in the 32-bit address space",
            length, base_address
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct PatternSource;

    impl MemorySource for PatternSource {
        fn read_memory(&self, address: u32, buf: &mut [u8]) -> anyhow::Result<()> {
            for (i, byte) in buf.iter_mut().enumerate() {
                *byte = (address as usize + i) as u8;
            }
            Ok(())
        }
    }

    struct FailingSource;

    impl MemorySource for FailingSource {
        fn read_memory(&self, _address: u32, _buf: &mut [u8]) -> anyhow::Result<()> {
            anyhow::bail!("connection lost")
        }
    }

    #[test]
    fn test_read_u32_honours_endianness() {
        let bytes = vec![0x82, 0x60, 0x00, 0x10, 0xAA, 0xBB];
        let big = MemorySnapshot::from_bytes(bytes.clone(), 0x1000, false).unwrap();
        let little = MemorySnapshot::from_bytes(bytes, 0x1000, true).unwrap();

        assert_eq!(big.read_u32(0x1000), Some(0x8260_0010));
        assert_eq!(little.read_u32(0x1000), Some(0x1000_6082));
        // unaligned reads are allowed as long as the word is inside the buffer
        assert_eq!(big.read_u32(0x1002), Some(0x0010_AABB));
        assert_eq!(big.read_u32(0x1003), None);
        assert_eq!(big.read_u32(0x0FFF), None);
    }

    #[test]
    fn test_rejects_snapshot_past_address_space() {
        let result = MemorySnapshot::from_bytes(vec![0u8; 0x20], 0xFFFF_FFF0, true);
        assert!(matches!(result, Err(ScanError::InvalidConfig(_))));
    }

    #[test]
    fn test_load_reads_whole_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        let payload: Vec<u8> = (0..(CHUNK_SIZE * 2 + 17)).map(|i| i as u8).collect();
        file.write_all(&payload).unwrap();
        file.flush().unwrap();

        let snapshot = MemorySnapshot::load(file.path(), 0x8200_0000, false, || false).unwrap();
        assert_eq!(snapshot.length() as usize, payload.len());
        assert_eq!(snapshot.base_address(), 0x8200_0000);
        assert_eq!(snapshot.as_bytes(), payload.as_slice());
    }

    #[test]
    fn test_load_missing_file_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let result = MemorySnapshot::load(dir.path().join("missing.bin"), 0, true, || false);
        assert!(matches!(result, Err(ScanError::Io { .. })));
    }

    #[test]
    fn test_load_observes_cancellation_per_chunk() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&vec![0u8; CHUNK_SIZE * 4]).unwrap();
        file.flush().unwrap();

        let checks = AtomicUsize::new(0);
        let result = MemorySnapshot::load(file.path(), 0, true, || checks.fetch_add(1, Ordering::Relaxed) >= 2);
        assert!(matches!(result, Err(ScanError::Cancelled)));
        assert_eq!(checks.load(Ordering::Relaxed), 3);
    }

    #[test]
    fn test_capture_reads_through_source() {
        let length = (CHUNK_SIZE + 8) as u32;
        let snapshot = MemorySnapshot::capture(&PatternSource, 0x4000, length, true, || false).unwrap();
        assert_eq!(snapshot.length(), length);
        assert_eq!(snapshot.as_bytes()[0], 0x00);
        assert_eq!(snapshot.as_bytes()[CHUNK_SIZE + 1], 0x01);
    }

    #[test]
    fn test_capture_failure_reports_address() {
        let result = MemorySnapshot::capture(&FailingSource, 0x8000, 0x100, false, || false);
        match result {
            Err(ScanError::Capture { address, message }) => {
                assert_eq!(address, 0x8000);
                assert!(message.contains("connection lost"));
            },
            other => panic!("unexpected result: {:?}", other),
        }
    }
}
