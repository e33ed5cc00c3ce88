//! Bump-allocating arena for precode memory.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::ptr::NonNull;
use std::sync::Arc;

use super::memory::{CodeRegion, Protection};
use super::{JumpStubCache, LoaderAllocator, Trampolines};
use crate::Pcode;
use crate::error::PrecodeError;
use crate::precode::x86_64::rel32_reaches;

/// Arena settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoaderHeapConfig {
    /// Size of each mapped block. Larger requests get a dedicated block.
    pub block_size: usize,
    /// Map blocks read-write-execute so stubs can run.
    pub executable: bool,
}

impl Default for LoaderHeapConfig {
    fn default() -> Self {
        Self {
            block_size: 64 * 1024,
            executable: false,
        }
    }
}

struct Block {
    region: CodeRegion,
    used: usize,
}

impl Block {
    /// Offset where an allocation of `size`/`align` would start, if it fits.
    fn fit(&self, size: usize, align: usize) -> Option<usize> {
        let start = (self.region.base() + self.used).next_multiple_of(align) - self.region.base();
        let end = start.checked_add(size)?;
        (end <= self.region.size()).then_some(start)
    }
}

/// The loader heap: owns all precode, jump stub and chunk memory of one
/// loader allocator. Nothing is freed individually; blocks are unmapped
/// when the heap is dropped.
pub struct LoaderHeap {
    config: LoaderHeapConfig,
    trampolines: Trampolines,
    blocks: RwLock<Vec<Block>>,
    jump_stubs: JumpStubCache,
}

impl LoaderHeap {
    pub fn new(trampolines: Trampolines, config: LoaderHeapConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            trampolines,
            blocks: RwLock::new(Vec::new()),
            jump_stubs: JumpStubCache::new(),
        })
    }

    pub fn with_defaults(trampolines: Trampolines) -> Arc<Self> {
        Self::new(trampolines, LoaderHeapConfig::default())
    }

    pub fn config(&self) -> &LoaderHeapConfig {
        &self.config
    }

    /// Total bytes handed out, including alignment padding.
    pub fn bytes_allocated(&self) -> usize {
        self.blocks.read().iter().map(|b| b.used).sum()
    }

    pub fn block_count(&self) -> usize {
        self.blocks.read().len()
    }

    fn protection(&self) -> Protection {
        if self.config.executable {
            Protection::ReadWriteExecute
        } else {
            Protection::ReadWrite
        }
    }

    fn bump(block: &mut Block, start: usize, size: usize) -> NonNull<u8> {
        block.used = start + size;
        // SAFETY: `fit` checked that `start + size` lies inside the region.
        unsafe { NonNull::new_unchecked(block.region.as_ptr().add(start)) }
    }

    fn alloc_in<F>(
        &self,
        size: usize,
        align: usize,
        mut accept: F,
    ) -> Result<NonNull<u8>, PrecodeError>
    where
        F: FnMut(&Block, usize) -> bool,
    {
        if size == 0 || !align.is_power_of_two() {
            return Err(PrecodeError::OutOfMemory { size, align });
        }

        let mut blocks = self.blocks.write();
        for block in blocks.iter_mut().rev() {
            if let Some(start) = block.fit(size, align) {
                if accept(block, start) {
                    return Ok(Self::bump(block, start, size));
                }
            }
        }

        let block_size = self.config.block_size.max(size + align);
        let region = CodeRegion::new(block_size, self.protection()).map_err(|e| {
            log::warn!("loader heap: mapping {} bytes failed: {}", block_size, e);
            PrecodeError::OutOfMemory { size, align }
        })?;
        log::trace!(
            "loader heap: mapped block [{:#x}, {:#x})",
            region.base(),
            region.base() + region.size()
        );
        let mut block = Block { region, used: 0 };
        let start = block
            .fit(size, align)
            .ok_or(PrecodeError::OutOfMemory { size, align })?;
        let ptr = Self::bump(&mut block, start, size);
        blocks.push(block);
        Ok(ptr)
    }
}

impl LoaderAllocator for LoaderHeap {
    fn alloc_aligned_mem(&self, size: usize, align: usize) -> Result<NonNull<u8>, PrecodeError> {
        self.alloc_in(size, align, |_, _| true)
    }

    fn alloc_aligned_mem_near(
        &self,
        size: usize,
        align: usize,
        near: Pcode,
    ) -> Result<NonNull<u8>, PrecodeError> {
        // Prefer a block within rel32 reach of `near`; a fresh block is
        // usually mapped next to the previous ones.
        self.alloc_in(size, align, |block, start| {
            let addr = block.region.base() + start;
            rel32_reaches(near, addr) && rel32_reaches(addr, near)
        })
    }

    fn trampolines(&self) -> &Trampolines {
        &self.trampolines
    }

    fn jump_stubs(&self) -> &JumpStubCache {
        &self.jump_stubs
    }

    fn contains(&self, addr: Pcode) -> bool {
        self.blocks.read().iter().any(|b| b.region.contains(addr))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn heap(block_size: usize) -> Arc<LoaderHeap> {
        LoaderHeap::new(
            Trampolines::for_tests(),
            LoaderHeapConfig {
                block_size,
                executable: false,
            },
        )
    }

    #[test]
    fn test_aligned_allocations() {
        let heap = heap(4096);
        let a = heap.alloc_aligned_mem(3, 1).unwrap();
        let b = heap.alloc_aligned_mem(32, 8).unwrap();
        assert_eq!(b.as_ptr() as usize % 8, 0);
        assert!(b.as_ptr() as usize >= a.as_ptr() as usize + 3);
        assert!(heap.contains(a.as_ptr() as usize));
        assert!(!heap.contains(0x10));
        assert_eq!(heap.block_count(), 1);
    }

    #[test]
    fn test_grows_with_new_blocks() {
        let heap = heap(4096);
        for _ in 0..10 {
            heap.alloc_aligned_mem(1024, 8).unwrap();
        }
        assert!(heap.block_count() >= 3);
        assert!(heap.bytes_allocated() >= 10 * 1024);
    }

    #[test]
    fn test_oversized_request_gets_own_block() {
        let heap = heap(4096);
        let p = heap.alloc_aligned_mem(3 * 4096, 16).unwrap();
        assert!(heap.contains(p.as_ptr() as usize + 3 * 4096 - 1));
    }

    #[test]
    fn test_memory_is_zeroed() {
        let heap = heap(4096);
        let p = heap.alloc_aligned_mem(64, 8).unwrap();
        let bytes = unsafe { std::slice::from_raw_parts(p.as_ptr(), 64) };
        assert!(bytes.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_near_allocation_is_reachable() {
        let heap = heap(4096);
        let a = heap.alloc_aligned_mem(8, 8).unwrap().as_ptr() as usize;
        let b = heap.alloc_aligned_mem_near(16, 8, a).unwrap().as_ptr() as usize;
        assert!(rel32_reaches(a, b));
    }

    #[test]
    fn test_invalid_alignment() {
        let heap = heap(4096);
        assert!(matches!(
            heap.alloc_aligned_mem(8, 3),
            Err(PrecodeError::OutOfMemory { .. })
        ));
    }
}
