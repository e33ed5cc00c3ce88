//! Memory ownership for precodes.
//!
//! Precodes never own memory: they are carved out of a loader allocator,
//! which also provides the runtime trampolines and the jump stubs used when
//! a relative branch cannot reach its target.

mod heap;
mod jump_stub;
pub mod memory;
mod trampolines;

use std::ptr::NonNull;

use crate::Pcode;
use crate::error::PrecodeError;

pub use heap::{LoaderHeap, LoaderHeapConfig};
pub use jump_stub::JumpStubCache;
pub use memory::{CodeRegion, MemoryError, Protection};
pub use trampolines::{TrampolineKind, Trampolines};

/// An arena that owns code and data for a set of methods.
///
/// Memory handed out lives as long as the allocator and is zero-filled.
pub trait LoaderAllocator: Send + Sync {
    /// Allocate `size` bytes aligned to `align` (a power of two).
    fn alloc_aligned_mem(&self, size: usize, align: usize) -> Result<NonNull<u8>, PrecodeError>;

    /// Like [`alloc_aligned_mem`](Self::alloc_aligned_mem), preferring
    /// memory within rel32 reach of `near`.
    fn alloc_aligned_mem_near(
        &self,
        size: usize,
        align: usize,
        near: Pcode,
    ) -> Result<NonNull<u8>, PrecodeError> {
        let _ = near;
        self.alloc_aligned_mem(size, align)
    }

    fn trampolines(&self) -> &Trampolines;

    fn jump_stubs(&self) -> &JumpStubCache;

    /// Whether `addr` lies in memory owned by this allocator.
    fn contains(&self, addr: Pcode) -> bool;
}
