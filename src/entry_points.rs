//! Temporary entry points for a method desc chunk.
//!
//! All methods of a chunk get their first callable address from one
//! allocation holding one precode each. The allocator picks the densest
//! precode kind the whole chunk can use.

use serde::Serialize;
use std::ptr::NonNull;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::Pcode;
use crate::error::PrecodeError;
use crate::method::{MethodDescChunk, MethodFlags};
use crate::precode::caps::FixupLayout;
use crate::precode::icache::flush_instruction_cache;
use crate::precode::{Precode, PrecodeCapabilities, PrecodeKind, x86_64};

/// The layout decision for one chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct EntryPointPlan {
    pub kind: PrecodeKind,
    pub count: usize,
    pub preallocate_jump_stubs: bool,
    /// Bytes of the single allocation.
    pub total_size: usize,
    pub alignment: usize,
    /// Some member needs a real precode, so compact entry points are out.
    pub forced: bool,
    /// Size of the compact encoding, where the ISA has one.
    pub compact_size: Option<usize>,
}

impl EntryPointPlan {
    /// Whether no precodes should be allocated at all.
    pub fn uses_compact(&self) -> bool {
        !self.forced && self.compact_size.is_some_and(|compact| self.total_size > compact)
    }

    /// Bytes taken by the members themselves.
    pub fn members_size(&self, caps: &PrecodeCapabilities) -> usize {
        self.count * caps.size_of(self.kind).unwrap_or(0)
    }
}

/// Outcome of [`TemporaryEntryPointAllocator::allocate`].
#[derive(Debug)]
pub enum AllocatedEntryPoints {
    Precodes(TemporaryEntryPoints),
    /// Compact entry points are smaller; no precodes were allocated.
    Compact,
}

impl AllocatedEntryPoints {
    pub fn is_compact(&self) -> bool {
        matches!(self, AllocatedEntryPoints::Compact)
    }

    pub fn into_precodes(self) -> Option<TemporaryEntryPoints> {
        match self {
            AllocatedEntryPoints::Precodes(entry_points) => Some(entry_points),
            AllocatedEntryPoints::Compact => None,
        }
    }
}

/// Chooses and allocates temporary entry points.
#[derive(Debug, Clone, Copy)]
pub struct TemporaryEntryPointAllocator {
    caps: &'static PrecodeCapabilities,
}

impl TemporaryEntryPointAllocator {
    pub fn new(caps: &'static PrecodeCapabilities) -> Self {
        Self { caps }
    }

    pub fn host() -> Self {
        Self::new(PrecodeCapabilities::host())
    }

    pub fn capabilities(&self) -> &'static PrecodeCapabilities {
        self.caps
    }

    /// Decide the layout for methods with `flags`.
    pub fn plan(&self, flags: &[MethodFlags]) -> Result<EntryPointPlan, PrecodeError> {
        let count = flags.len();
        if count == 0 {
            return Err(PrecodeError::EmptyChunk);
        }

        let needs_md_cc = flags.iter().any(|f| f.requires_md_calling_convention);
        let any_dynamic = flags.iter().any(|f| f.is_dynamic);

        let mut kind = PrecodeKind::Stub;
        let mut preallocate_jump_stubs = false;
        if let Some(fixup) = &self.caps.fixup {
            if !needs_md_cc && count <= FixupLayout::MAX_CHUNK_COUNT {
                kind = PrecodeKind::Fixup;
                preallocate_jump_stubs = any_dynamic && fixup.dynamic_jump_stub_size.is_some();
            }
        }

        let total_size = self
            .caps
            .size_of_temporary_entry_points(kind, preallocate_jump_stubs, count)
            .ok_or(PrecodeError::UnsupportedKind {
                kind,
                isa: self.caps.isa,
            })?;

        let compact = self.caps.compact_entry_points;
        let forced = flags.iter().any(|f| f.requires_stable_entry_point)
            || needs_md_cc
            || compact.is_some_and(|c| count >= c.max_count);

        Ok(EntryPointPlan {
            kind,
            count,
            preallocate_jump_stubs,
            total_size,
            alignment: self.caps.align_of(kind),
            forced,
            compact_size: compact.map(|c| c.size_of(count)),
        })
    }

    /// Allocate and initialize one precode per method of `chunk`.
    pub fn allocate(
        &self,
        chunk: &Arc<MethodDescChunk>,
    ) -> Result<AllocatedEntryPoints, PrecodeError> {
        let flags: Vec<MethodFlags> = chunk.iter().map(|md| md.flags()).collect();
        let plan = self.plan(&flags)?;
        if plan.uses_compact() {
            log::debug!(
                "chunk of {} methods uses compact entry points ({} < {} bytes)",
                plan.count,
                plan.compact_size.unwrap_or(0),
                plan.total_size
            );
            return Ok(AllocatedEntryPoints::Compact);
        }

        let base = chunk
            .allocator()
            .alloc_aligned_mem(plan.total_size, plan.alignment)?;
        let entry_points = TemporaryEntryPoints {
            base,
            plan,
            chunk: chunk.clone(),
            caps: self.caps,
        };
        entry_points.initialize()?;
        Ok(AllocatedEntryPoints::Precodes(entry_points))
    }
}

/// One allocation holding a precode per method of a chunk.
pub struct TemporaryEntryPoints {
    base: NonNull<u8>,
    plan: EntryPointPlan,
    chunk: Arc<MethodDescChunk>,
    caps: &'static PrecodeCapabilities,
}

// The memory is owned by the chunk's allocator, kept alive through `chunk`.
unsafe impl Send for TemporaryEntryPoints {}
unsafe impl Sync for TemporaryEntryPoints {}

impl TemporaryEntryPoints {
    fn member_size(&self) -> usize {
        self.caps.size_of(self.plan.kind).unwrap_or(0)
    }

    fn initialize(&self) -> Result<(), PrecodeError> {
        let count = self.plan.count;
        let member_size = self.member_size();

        if self.plan.kind == PrecodeKind::Fixup {
            let shared = self.shared_slot().unwrap_or(0);
            // SAFETY: the shared slot and stub reservation lie inside our
            // allocation, which nobody else sees yet.
            unsafe {
                (*(shared as *const AtomicUsize)).store(self.chunk[0].address(), Ordering::Release);
                if let Some((start, stub_size)) = self.jump_stub_reservation() {
                    for i in 0..count {
                        x86_64::emit_jump_stub((start + i * stub_size) as *mut u8, 0);
                    }
                }
            }
            for (i, md) in self.chunk.iter().enumerate() {
                let precode = self.precode_at(i);
                unsafe { precode.init_fixup(md, md.chunk_index() as u8, (count - 1 - i) as u8)? };
            }
        } else {
            for (i, md) in self.chunk.iter().enumerate() {
                unsafe { self.precode_at(i).init_slot(self.plan.kind, md) };
            }
        }

        flush_instruction_cache(self.base(), count * member_size);
        log::debug!(
            target: "precode::perfmap",
            "{:#x} {:#x} TemporaryEntryPoints {} x{}",
            self.base(),
            count * member_size,
            self.plan.kind,
            count
        );
        Ok(())
    }

    fn precode_at(&self, index: usize) -> Precode<'_> {
        // SAFETY: in bounds, and the memory lives as long as `self.chunk`.
        unsafe { Precode::from_entry_point(self.caps, self.base() + index * self.member_size()) }
    }

    /// Precode of method `index`.
    pub fn get(&self, index: usize) -> Option<Precode<'_>> {
        (index < self.plan.count).then(|| self.precode_at(index))
    }

    pub fn iter(&self) -> impl Iterator<Item = Precode<'_>> + '_ {
        (0..self.plan.count).map(move |i| self.precode_at(i))
    }

    /// Index of the method whose precode starts at `entry`.
    pub fn index_of(&self, entry: Pcode) -> Option<usize> {
        let offset = entry.checked_sub(self.base())?;
        let size = self.member_size();
        (offset % size == 0 && offset / size < self.plan.count).then_some(offset / size)
    }

    pub fn base(&self) -> Pcode {
        self.base.as_ptr() as Pcode
    }

    pub fn size_in_bytes(&self) -> usize {
        self.plan.total_size
    }

    pub fn kind(&self) -> PrecodeKind {
        self.plan.kind
    }

    pub fn len(&self) -> usize {
        self.plan.count
    }

    pub fn is_empty(&self) -> bool {
        self.plan.count == 0
    }

    pub fn plan(&self) -> &EntryPointPlan {
        &self.plan
    }

    pub fn chunk(&self) -> &Arc<MethodDescChunk> {
        &self.chunk
    }

    pub fn capabilities(&self) -> &'static PrecodeCapabilities {
        self.caps
    }

    /// Address of the shared method desc slot of a fixup chunk.
    pub fn shared_slot(&self) -> Option<Pcode> {
        (self.plan.kind == PrecodeKind::Fixup)
            .then(|| self.base() + self.plan.members_size(self.caps))
    }

    /// Start and per-member size of the reserved jump stubs.
    pub fn jump_stub_reservation(&self) -> Option<(Pcode, usize)> {
        if !self.plan.preallocate_jump_stubs {
            return None;
        }
        let stub_size = self.caps.fixup.as_ref()?.dynamic_jump_stub_size?;
        Some((self.shared_slot()? + size_of::<usize>(), stub_size))
    }
}

impl std::fmt::Debug for TemporaryEntryPoints {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TemporaryEntryPoints")
            .field("base", &format_args!("{:#x}", self.base()))
            .field("plan", &self.plan)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::{LoaderHeap, Trampolines};
    use crate::method::MethodDef;
    use crate::precode::CompactEntryPoints;

    static COMPACT_X86_64: PrecodeCapabilities = PrecodeCapabilities {
        compact_entry_points: Some(CompactEntryPoints::THUMB2),
        ..PrecodeCapabilities::X86_64
    };

    fn chunk_with(flags: &[MethodFlags]) -> Arc<MethodDescChunk> {
        let heap = LoaderHeap::with_defaults(Trampolines::for_tests());
        MethodDescChunk::new(
            heap,
            flags
                .iter()
                .enumerate()
                .map(|(i, f)| {
                    MethodDef::new(format!("M{}", i), 0x0600_0001 + i as u32).with_flags(*f)
                }),
        )
    }

    fn plain(n: usize) -> Arc<MethodDescChunk> {
        chunk_with(&vec![MethodFlags::default(); n])
    }

    #[test]
    fn test_three_plain_methods_use_fixup() {
        let chunk = plain(3);
        let allocator = TemporaryEntryPointAllocator::new(&PrecodeCapabilities::X86_64);
        let entry_points = allocator.allocate(&chunk).unwrap().into_precodes().unwrap();

        assert_eq!(entry_points.kind(), PrecodeKind::Fixup);
        assert_eq!(entry_points.size_in_bytes(), 3 * 8 + 8);
        assert_eq!(entry_points.get(1).unwrap().entry_point(), entry_points.base() + 8);
        assert!(entry_points.get(3).is_none());

        for (i, precode) in entry_points.iter().enumerate() {
            assert_eq!(precode.kind(), PrecodeKind::Fixup);
            assert_eq!(precode.method_desc().as_ptr(), chunk[i].as_ptr());
            assert_eq!(precode.target(), chunk[i].trampolines().fixup_thunk);
            assert_eq!(entry_points.index_of(precode.entry_point()), Some(i));
        }
        assert_eq!(entry_points.index_of(entry_points.base() + 4), None);
    }

    #[test]
    fn test_md_calling_convention_forces_stub() {
        let mut flags = vec![MethodFlags::default(); 4];
        flags[2].requires_md_calling_convention = true;
        let chunk = chunk_with(&flags);
        let allocator = TemporaryEntryPointAllocator::new(&PrecodeCapabilities::X86_64);
        let entry_points = allocator.allocate(&chunk).unwrap().into_precodes().unwrap();

        assert_eq!(entry_points.kind(), PrecodeKind::Stub);
        assert_eq!(entry_points.size_in_bytes(), 4 * 32);
        for (i, precode) in entry_points.iter().enumerate() {
            assert_eq!(precode.entry_point(), entry_points.base() + i * 32);
            assert_eq!(precode.method_desc().as_ptr(), chunk[i].as_ptr());
            assert_eq!(precode.target(), chunk[i].trampolines().prestub);
        }
    }

    #[test]
    fn test_large_chunk_falls_back_to_stub() {
        let allocator = TemporaryEntryPointAllocator::new(&PrecodeCapabilities::X86_64);
        let plan = allocator.plan(&vec![MethodFlags::default(); 256]).unwrap();
        assert_eq!(plan.kind, PrecodeKind::Fixup);
        let plan = allocator.plan(&vec![MethodFlags::default(); 257]).unwrap();
        assert_eq!(plan.kind, PrecodeKind::Stub);
        assert_eq!(plan.total_size, 257 * 32);
    }

    #[test]
    fn test_full_fixup_chunk_resolves_every_member() {
        let chunk = plain(256);
        let allocator = TemporaryEntryPointAllocator::new(&PrecodeCapabilities::X86_64);
        let entry_points = allocator.allocate(&chunk).unwrap().into_precodes().unwrap();
        let first = entry_points.get(0).unwrap();
        let last = entry_points.get(255).unwrap();
        assert_eq!(first.method_desc().as_ptr(), chunk[0].as_ptr());
        assert_eq!(last.method_desc().as_ptr(), chunk[255].as_ptr());
    }

    #[test]
    fn test_dynamic_methods_reserve_jump_stubs() {
        let flags = vec![
            MethodFlags {
                is_dynamic: true,
                ..MethodFlags::default()
            };
            3
        ];
        let chunk = chunk_with(&flags);
        let allocator = TemporaryEntryPointAllocator::new(&PrecodeCapabilities::X86_64);
        let entry_points = allocator.allocate(&chunk).unwrap().into_precodes().unwrap();

        assert!(entry_points.plan().preallocate_jump_stubs);
        assert_eq!(entry_points.size_in_bytes(), 3 * 8 + 8 + 3 * 16);
        let (start, size) = entry_points.jump_stub_reservation().unwrap();
        assert_eq!(start, entry_points.base() + 32);
        assert_eq!(size, 16);
        for precode in entry_points.iter() {
            assert!(precode.set_target_interlocked(0x3333_0000, true).unwrap());
            assert_eq!(precode.target(), 0x3333_0000);
        }
        assert!(chunk.allocator().jump_stubs().is_empty());
    }

    #[test]
    fn test_aarch64_has_no_jump_stub_reservation() {
        let flags = vec![
            MethodFlags {
                is_dynamic: true,
                ..MethodFlags::default()
            };
            2
        ];
        let allocator = TemporaryEntryPointAllocator::new(&PrecodeCapabilities::AARCH64);
        let plan = allocator.plan(&flags).unwrap();
        assert_eq!(plan.kind, PrecodeKind::Fixup);
        assert!(!plan.preallocate_jump_stubs);
        assert_eq!(plan.total_size, 2 * 24 + 8);
    }

    #[test]
    fn test_compact_entry_points_both_ways() {
        let allocator = TemporaryEntryPointAllocator::new(&COMPACT_X86_64);

        // One method: 16 bytes of fixup beat 19 bytes of compact code
        let single = plain(1);
        let result = allocator.allocate(&single).unwrap();
        assert!(!result.is_compact());

        // Three methods: 32 bytes of fixup lose to 27
        let three = plain(3);
        assert!(allocator.allocate(&three).unwrap().is_compact());

        // A stable entry point requirement forces precodes
        let mut flags = vec![MethodFlags::default(); 3];
        flags[0].requires_stable_entry_point = true;
        let forced = chunk_with(&flags);
        assert!(!allocator.allocate(&forced).unwrap().is_compact());

        let plan = allocator.plan(&vec![MethodFlags::default(); 60]).unwrap();
        assert!(plan.forced);
    }

    #[test]
    fn test_empty_chunk_is_rejected() {
        let chunk = plain(0);
        let allocator = TemporaryEntryPointAllocator::new(&PrecodeCapabilities::X86_64);
        assert!(matches!(allocator.allocate(&chunk), Err(PrecodeError::EmptyChunk)));
    }

    #[test]
    fn test_stable_entry_after_compact() {
        let three = plain(3);
        let allocator = TemporaryEntryPointAllocator::new(&COMPACT_X86_64);
        assert!(allocator.allocate(&three).unwrap().is_compact());

        let precode = Precode::allocate(&COMPACT_X86_64, PrecodeKind::Fixup, &three[1]).unwrap();
        assert_eq!(precode.method_desc().as_ptr(), three[1].as_ptr());
    }
}
