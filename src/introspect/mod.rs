//! Diagnostics: which memory precodes occupy, and decoding a precode from
//! raw bytes without executing or trusting it.

mod data_target;

use serde::{Deserialize, Serialize};

pub use data_target::{DataTarget, LiveProcess, MemorySnapshot, ReadError, SnapshotRegion};

use crate::Pcode;
use crate::entry_points::TemporaryEntryPoints;
use crate::method::MethodDesc;
use crate::precode::caps::FixupEncoding;
use crate::precode::x86_64::{FixupWord, JUMP_STUB_SIZE};
use crate::precode::{Precode, PrecodeCapabilities, PrecodeKind};

/// How much memory a dump should include.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MemoryEnumFlags {
    #[default]
    Default,
    Heap,
    Mini,
    Triage,
}

impl MemoryEnumFlags {
    /// Small dumps skip memory not needed to identify methods.
    pub fn is_minimal(self) -> bool {
        matches!(self, MemoryEnumFlags::Mini | MemoryEnumFlags::Triage)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryRegion {
    pub start: Pcode,
    pub size: usize,
}

impl TemporaryEntryPoints {
    /// Report the memory of this chunk's precodes.
    pub fn enum_memory_regions(&self, flags: MemoryEnumFlags, mut sink: impl FnMut(MemoryRegion)) {
        if self.is_empty() {
            return;
        }
        if self.kind() == PrecodeKind::Fixup {
            let members = self.plan().members_size(self.capabilities()) + size_of::<usize>();
            sink(MemoryRegion {
                start: self.base(),
                size: members,
            });
            if let Some((start, stub_size)) = self.jump_stub_reservation() {
                if !flags.is_minimal() {
                    sink(MemoryRegion {
                        start,
                        size: stub_size * self.len(),
                    });
                }
            }
            return;
        }
        for precode in self.iter() {
            precode.enum_memory_regions(flags, &mut sink);
        }
    }
}

impl Precode<'_> {
    /// Report the memory of this precode: the record, plus the shared
    /// method desc slot of a fixup member.
    pub fn enum_memory_regions(&self, _flags: MemoryEnumFlags, mut sink: impl FnMut(MemoryRegion)) {
        sink(MemoryRegion {
            start: self.entry_point(),
            size: self.size(),
        });
        if let Some(shared) = self.fixup_shared_slot() {
            sink(MemoryRegion {
                start: shared,
                size: size_of::<usize>(),
            });
        }
    }
}

/// A precode decoded from raw memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PrecodeInfo {
    pub kind: PrecodeKind,
    /// Target as encoded. Jump stubs are not followed; see
    /// [`read_jump_stub`].
    pub target: Pcode,
    /// Address of the owning method desc; `None` when the back-reference
    /// is unset or unreadable.
    pub method_desc: Option<Pcode>,
}

/// Decode the precode at `addr` from `target`'s memory. Returns `Ok(None)`
/// when the bytes are not a precode.
pub fn inspect_precode(
    target: &dyn DataTarget,
    caps: &PrecodeCapabilities,
    addr: Pcode,
) -> Result<Option<PrecodeInfo>, ReadError> {
    let leading = target.read_u64(addr)?.to_le_bytes();
    let Some(kind) = caps.classify(&leading) else {
        return Ok(None);
    };

    if kind != PrecodeKind::Fixup {
        let Some(layout) = caps.slot_layout(kind) else {
            return Ok(None);
        };
        let method_desc = match target.read_usize(addr + layout.method_desc_offset)? {
            0 => None,
            md => Some(md),
        };
        let stub_target = target.read_usize(addr + layout.target_offset)?;
        return Ok(Some(PrecodeInfo {
            kind,
            target: stub_target,
            method_desc,
        }));
    }

    let Some(fixup) = caps.fixup.as_ref() else {
        return Ok(None);
    };
    let (md_index, precode_index, raw_target) = match fixup.encoding {
        FixupEncoding::Rel32 => match FixupWord::decode(u64::from_le_bytes(leading)) {
            Some(word) => (word.method_desc_index, word.precode_index, word.destination(addr)),
            None => return Ok(None),
        },
        FixupEncoding::Slot { target_offset, .. } => {
            let mut indices = [0u8; 1];
            target.read(addr + fixup.method_desc_index_offset, &mut indices)?;
            let md_index = indices[0];
            target.read(addr + fixup.precode_index_offset, &mut indices)?;
            (md_index, indices[0], target.read_usize(addr + target_offset)?)
        }
    };
    let shared = addr + (precode_index as usize + 1) * fixup.size;
    let method_desc = match target.read_usize(shared) {
        Ok(0) | Err(_) => None,
        Ok(base) => Some(base + md_index as usize * size_of::<MethodDesc>()),
    };
    Ok(Some(PrecodeInfo {
        kind,
        target: raw_target,
        method_desc,
    }))
}

/// Decode the jump stub at `addr`, or `None` if the bytes are not one.
pub fn read_jump_stub(target: &dyn DataTarget, addr: Pcode) -> Result<Option<Pcode>, ReadError> {
    let mut stub = [0u8; JUMP_STUB_SIZE];
    target.read(addr, &mut stub)?;
    // SAFETY: `stub` is a local copy of a whole stub.
    Ok(unsafe { crate::precode::x86_64::jump_stub_target(stub.as_ptr()) })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry_points::TemporaryEntryPointAllocator;
    use crate::loader::{LoaderHeap, Trampolines};
    use crate::method::{MethodDef, MethodDescChunk, MethodFlags};
    use std::sync::Arc;

    fn chunk(n: u32, flags: MethodFlags) -> Arc<MethodDescChunk> {
        let heap = LoaderHeap::with_defaults(Trampolines::for_tests());
        MethodDescChunk::new(
            heap,
            (0..n).map(|i| MethodDef::new(format!("M{}", i), 0x0600_0300 + i).with_flags(flags)),
        )
    }

    fn entry_points(chunk: &Arc<MethodDescChunk>) -> TemporaryEntryPoints {
        TemporaryEntryPointAllocator::new(&PrecodeCapabilities::X86_64)
            .allocate(chunk)
            .unwrap()
            .into_precodes()
            .unwrap()
    }

    #[test]
    fn test_fixup_chunk_regions() {
        let chunk = chunk(3, MethodFlags::default());
        let eps = entry_points(&chunk);
        let mut regions = Vec::new();
        eps.enum_memory_regions(MemoryEnumFlags::Default, |r| regions.push(r));
        assert_eq!(
            regions,
            vec![MemoryRegion {
                start: eps.base(),
                size: 3 * 8 + 8
            }]
        );
    }

    #[test]
    fn test_reserved_stubs_skipped_in_minidumps() {
        let chunk = chunk(
            2,
            MethodFlags {
                is_dynamic: true,
                ..MethodFlags::default()
            },
        );
        let eps = entry_points(&chunk);

        let mut full = Vec::new();
        eps.enum_memory_regions(MemoryEnumFlags::Heap, |r| full.push(r));
        assert_eq!(full.len(), 2);
        assert_eq!(full[1].size, 2 * JUMP_STUB_SIZE);

        let mut mini = Vec::new();
        eps.enum_memory_regions(MemoryEnumFlags::Triage, |r| mini.push(r));
        assert_eq!(mini.len(), 1);
    }

    #[test]
    fn test_stub_chunk_regions() {
        let chunk = chunk(
            2,
            MethodFlags {
                requires_md_calling_convention: true,
                ..MethodFlags::default()
            },
        );
        let eps = entry_points(&chunk);
        let mut regions = Vec::new();
        eps.enum_memory_regions(MemoryEnumFlags::Default, |r| regions.push(r));
        assert_eq!(regions.len(), 2);
        assert_eq!(regions[1].start, eps.base() + 32);
        assert!(regions.iter().all(|r| r.size == 32));
    }

    #[test]
    fn test_inspect_snapshot_of_fixup_chunk() {
        let chunk = chunk(3, MethodFlags::default());
        let eps = entry_points(&chunk);
        let live = unsafe { LiveProcess::new() };
        let mut regions = Vec::new();
        eps.enum_memory_regions(MemoryEnumFlags::Default, |r| regions.push(r));
        let snapshot = MemorySnapshot::capture(&live, regions).unwrap();

        for (i, md) in chunk.iter().enumerate() {
            let addr = eps.get(i).unwrap().entry_point();
            let info = inspect_precode(&snapshot, &PrecodeCapabilities::X86_64, addr)
                .unwrap()
                .unwrap();
            assert_eq!(info.kind, PrecodeKind::Fixup);
            assert_eq!(info.method_desc, Some(md.address()));
        }
    }

    #[test]
    fn test_inspect_live_stub() {
        let chunk = chunk(1, MethodFlags::default());
        let md = &chunk[0];
        let precode =
            Precode::allocate(&PrecodeCapabilities::X86_64, PrecodeKind::Remoting, md).unwrap();
        precode.set_target_interlocked(0x5150_0000, false).unwrap();

        let live = unsafe { LiveProcess::new() };
        let info = inspect_precode(&live, &PrecodeCapabilities::X86_64, precode.entry_point())
            .unwrap()
            .unwrap();
        assert_eq!(
            info,
            PrecodeInfo {
                kind: PrecodeKind::Remoting,
                target: 0x5150_0000,
                method_desc: Some(md.address()),
            }
        );
    }

    #[test]
    fn test_read_jump_stub_from_snapshot() {
        let mut stub = vec![0xFF, 0x25, 0x02, 0x00, 0x00, 0x00, 0xCC, 0xCC];
        stub.extend_from_slice(&0x1234_5678usize.to_le_bytes());
        let mut snapshot = MemorySnapshot::new();
        snapshot.add_region(0x8000, stub);
        snapshot.add_region(0x9000, vec![0; 16]);
        assert_eq!(read_jump_stub(&snapshot, 0x8000).unwrap(), Some(0x1234_5678));
        assert_eq!(read_jump_stub(&snapshot, 0x9000).unwrap(), None);
    }

    #[test]
    fn test_inspect_non_precode() {
        let mut snapshot = MemorySnapshot::new();
        snapshot.add_region(0x4000, vec![0x90; 64]);
        assert_eq!(inspect_precode(&snapshot, &PrecodeCapabilities::X86_64, 0x4000).unwrap(), None);
        assert!(inspect_precode(&snapshot, &PrecodeCapabilities::X86_64, 0x9000).is_err());
    }
}
