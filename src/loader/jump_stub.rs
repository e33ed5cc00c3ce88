//! Jump stubs for rel32 targets out of reach.
//!
//! A jump stub is a 16-byte absolute indirect jump allocated near the code
//! that needs it. Stubs are shared per target and never freed.
//!
//! Stubs are carved from blocks requested from the owning allocator. Every
//! block starts with a stub-sized header linking it to the previous block
//! and counting the stubs published so far, so ownership checks walk the
//! chain without taking a lock. Writers serialize on a mutex that is never
//! held while the allocator grows.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use super::LoaderAllocator;
use crate::Pcode;
use crate::error::PrecodeError;
use crate::precode::icache::flush_instruction_cache;
use crate::precode::x86_64::{self, JUMP_STUB_ALIGN, JUMP_STUB_SIZE};

/// Stubs per block; slot 0 holds the header.
const STUBS_PER_BLOCK: usize = 63;
const BLOCK_SIZE: usize = (STUBS_PER_BLOCK + 1) * JUMP_STUB_SIZE;

#[repr(C)]
struct BlockHeader {
    /// Previously linked block, or 0.
    next: AtomicUsize,
    /// Stubs published in this block.
    used: AtomicUsize,
}

/// # Safety
/// `block` must be a block linked into (or about to be linked into) a cache
/// whose owning allocator is still alive.
unsafe fn header<'a>(block: Pcode) -> &'a BlockHeader {
    unsafe { &*(block as *const BlockHeader) }
}

/// Per-allocator cache of jump stubs.
///
/// Every block must come from the allocator that owns the cache, so blocks
/// stay mapped for as long as the cache can be reached.
#[derive(Default)]
pub struct JumpStubCache {
    /// Most recently linked block.
    head: AtomicUsize,
    by_target: Mutex<HashMap<Pcode, Vec<Pcode>>>,
}

impl JumpStubCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return a jump stub to `target` that a rel32 operand ending at `from`
    /// can reach, allocating one from `allocator` if none exists.
    pub fn get_or_create(
        &self,
        allocator: &dyn LoaderAllocator,
        target: Pcode,
        from: Pcode,
    ) -> Result<Pcode, PrecodeError> {
        {
            let mut by_target = self.by_target.lock();
            if let Some(existing) = Self::find(&by_target, target, from) {
                return Ok(existing);
            }
            if let Some(stub) = self.carve(target, from) {
                by_target.entry(target).or_default().push(stub);
                return Ok(stub);
            }
        }

        // Growing the arena may block; readers and other writers proceed.
        let ptr = allocator.alloc_aligned_mem_near(BLOCK_SIZE, JUMP_STUB_ALIGN, from)?;
        let block = ptr.as_ptr() as Pcode;

        let mut by_target = self.by_target.lock();
        self.link(block);
        if let Some(existing) = Self::find(&by_target, target, from) {
            return Ok(existing);
        }
        let stub = self
            .carve(target, from)
            .ok_or(PrecodeError::TargetOutOfRange { from, target })?;
        by_target.entry(target).or_default().push(stub);
        Ok(stub)
    }

    fn find(by_target: &HashMap<Pcode, Vec<Pcode>>, target: Pcode, from: Pcode) -> Option<Pcode> {
        by_target
            .get(&target)
            .and_then(|list| list.iter().copied().find(|&s| x86_64::rel32_reaches(from, s)))
    }

    /// Emit a stub in the first block with a free slot reachable from
    /// `from`. Callers hold the writer mutex.
    fn carve(&self, target: Pcode, from: Pcode) -> Option<Pcode> {
        let (block, index) = self.blocks().find_map(|block| {
            // SAFETY: linked blocks live as long as the owning allocator.
            let index = unsafe { header(block) }.used.load(Ordering::Relaxed) + 1;
            let slot = block + index * JUMP_STUB_SIZE;
            let free = index <= STUBS_PER_BLOCK && x86_64::rel32_reaches(from, slot);
            free.then_some((block, index))
        })?;
        let stub = block + index * JUMP_STUB_SIZE;

        // SAFETY: the slot is past `used`, so no reader inspects it yet.
        unsafe { x86_64::emit_jump_stub(stub as *mut u8, target) };
        flush_instruction_cache(stub, JUMP_STUB_SIZE);
        unsafe { header(block) }.used.store(index, Ordering::Release);
        log::trace!("jump stub {:#x} -> {:#x}", stub, target);
        Some(stub)
    }

    /// Publish a zero-filled block. Callers hold the writer mutex.
    fn link(&self, block: Pcode) {
        // SAFETY: the allocator hands out zeroed memory of at least BLOCK_SIZE.
        let linked = unsafe { header(block) };
        linked.next.store(self.head.load(Ordering::Relaxed), Ordering::Relaxed);
        self.head.store(block, Ordering::Release);
        log::trace!("jump stub block {:#x}", block);
    }

    fn blocks(&self) -> impl Iterator<Item = Pcode> + '_ {
        let mut next = self.head.load(Ordering::Acquire);
        std::iter::from_fn(move || {
            let block = next;
            if block == 0 {
                return None;
            }
            // SAFETY: linked blocks live as long as the owning allocator.
            next = unsafe { header(block) }.next.load(Ordering::Acquire);
            Some(block)
        })
    }

    /// Whether `addr` is a jump stub handed out by this cache. Never blocks.
    pub fn contains(&self, addr: Pcode) -> bool {
        self.blocks().any(|block| {
            let offset = addr.wrapping_sub(block);
            if offset < JUMP_STUB_SIZE || offset >= BLOCK_SIZE || offset % JUMP_STUB_SIZE != 0 {
                return false;
            }
            // SAFETY: linked blocks live as long as the owning allocator.
            offset / JUMP_STUB_SIZE <= unsafe { header(block) }.used.load(Ordering::Acquire)
        })
    }

    pub fn len(&self) -> usize {
        self.blocks()
            // SAFETY: linked blocks live as long as the owning allocator.
            .map(|block| unsafe { header(block) }.used.load(Ordering::Acquire))
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
