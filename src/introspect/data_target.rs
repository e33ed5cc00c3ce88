//! Memory sources for out-of-band inspection.

use serde::{Deserialize, Serialize};
use std::fmt;

use super::MemoryRegion;
use crate::Pcode;

/// A range that could not be read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadError {
    pub addr: Pcode,
    pub len: usize,
}

impl fmt::Display for ReadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cannot read {} bytes at {:#x}", self.len, self.addr)
    }
}

impl std::error::Error for ReadError {}

/// Readable memory of a (possibly different) process.
pub trait DataTarget {
    fn read(&self, addr: Pcode, buf: &mut [u8]) -> Result<(), ReadError>;

    fn read_usize(&self, addr: Pcode) -> Result<usize, ReadError> {
        let mut buf = [0u8; size_of::<usize>()];
        self.read(addr, &mut buf)?;
        Ok(usize::from_le_bytes(buf))
    }

    fn read_u64(&self, addr: Pcode) -> Result<u64, ReadError> {
        let mut buf = [0u8; 8];
        self.read(addr, &mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }
}

/// The current process.
pub struct LiveProcess {
    _private: (),
}

impl LiveProcess {
    /// # Safety
    /// Reads copy memory directly: every non-null address passed to
    /// [`DataTarget::read`] must be mapped and readable for the length read.
    pub unsafe fn new() -> Self {
        LiveProcess { _private: () }
    }
}

impl DataTarget for LiveProcess {
    fn read(&self, addr: Pcode, buf: &mut [u8]) -> Result<(), ReadError> {
        if addr == 0 || addr.checked_add(buf.len()).is_none() {
            return Err(ReadError { addr, len: buf.len() });
        }
        // SAFETY: guaranteed by the contract of `LiveProcess::new`.
        unsafe { std::ptr::copy_nonoverlapping(addr as *const u8, buf.as_mut_ptr(), buf.len()) };
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotRegion {
    pub start: Pcode,
    pub bytes: Vec<u8>,
}

/// Captured memory regions. Reads outside them fail.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemorySnapshot {
    pub regions: Vec<SnapshotRegion>,
}

impl MemorySnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy `regions` out of `source`.
    pub fn capture(
        source: &dyn DataTarget,
        regions: impl IntoIterator<Item = MemoryRegion>,
    ) -> Result<Self, ReadError> {
        let mut snapshot = MemorySnapshot::new();
        for region in regions {
            let mut bytes = vec![0u8; region.size];
            source.read(region.start, &mut bytes)?;
            snapshot.regions.push(SnapshotRegion {
                start: region.start,
                bytes,
            });
        }
        Ok(snapshot)
    }

    pub fn add_region(&mut self, start: Pcode, bytes: Vec<u8>) {
        self.regions.push(SnapshotRegion { start, bytes });
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

impl DataTarget for MemorySnapshot {
    fn read(&self, addr: Pcode, buf: &mut [u8]) -> Result<(), ReadError> {
        let err = ReadError { addr, len: buf.len() };
        let end = addr.checked_add(buf.len()).ok_or(err)?;
        let region = self
            .regions
            .iter()
            .find(|r| r.start <= addr && end <= r.start + r.bytes.len())
            .ok_or(err)?;
        let offset = addr - region.start;
        buf.copy_from_slice(&region.bytes[offset..offset + buf.len()]);
        Ok(())
    }
}
