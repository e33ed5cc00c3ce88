//! Per-ISA capability tables.
//!
//! A table says which precode kinds exist on an ISA, how each is laid out,
//! and which platform policies apply. Everything size-related is derived
//! from it.

use super::{Isa, PrecodeKind, aarch64, x86_64};

/// Layout of a precode that jumps through an absolute target slot.
#[derive(Debug, Clone, Copy)]
pub struct SlotLayout {
    /// Fixed leading code bytes; at least the first 8 identify the kind.
    pub template: &'static [u8],
    pub size: usize,
    pub method_desc_offset: usize,
    pub target_offset: usize,
    /// Slot holding an extra trampoline the stub calls first.
    pub thunk_offset: Option<usize>,
}

/// How a fixup member encodes its target.
#[derive(Debug, Clone, Copy)]
pub enum FixupEncoding {
    /// One 8-byte word: `call`/`jmp rel32`, type byte, indices.
    Rel32,
    /// Fixed code followed by an absolute target slot.
    Slot {
        template: &'static [u8],
        target_offset: usize,
    },
}

/// Layout of one fixup precode member.
#[derive(Debug, Clone, Copy)]
pub struct FixupLayout {
    pub size: usize,
    pub method_desc_index_offset: usize,
    pub precode_index_offset: usize,
    pub encoding: FixupEncoding,
    /// Per-member jump stub bytes reserved for dynamic methods.
    pub dynamic_jump_stub_size: Option<usize>,
}

impl FixupLayout {
    /// Members addressable from one shared method desc slot.
    pub const MAX_CHUNK_COUNT: usize = 256;
}

/// Compact entry point encoding parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompactEntryPoints {
    pub entry_size: usize,
    pub central_jump_size: usize,
    pub max_block_index: usize,
    pub max_count: usize,
}

impl CompactEntryPoints {
    /// Thumb-2 parameters.
    pub const THUMB2: CompactEntryPoints = CompactEntryPoints {
        entry_size: 4,
        central_jump_size: 14,
        max_block_index: 60,
        max_count: 60,
    };

    /// Bytes needed to give `count` methods compact entry points.
    pub fn size_of(&self, count: usize) -> usize {
        let full_blocks = count / self.max_block_index;
        let remainder = count % self.max_block_index;
        1 + full_blocks * (self.max_block_index * self.entry_size + self.central_jump_size)
            + remainder * self.entry_size
            + if remainder != 0 { self.central_jump_size } else { 0 }
    }
}

/// The capability table of one ISA.
#[derive(Debug, Clone, Copy)]
pub struct PrecodeCapabilities {
    pub isa: Isa,
    /// Alignment of every precode record.
    pub alignment: usize,
    pub stub: SlotLayout,
    pub ndirect_import: Option<SlotLayout>,
    pub remoting: Option<SlotLayout>,
    pub this_ptr_ret_buf: Option<SlotLayout>,
    pub fixup: Option<FixupLayout>,
    /// Retargeting rewrites instruction bytes, so caches must be flushed.
    pub retarget_patches_code: bool,
    pub compact_entry_points: Option<CompactEntryPoints>,
}

impl PrecodeCapabilities {
    pub const X86_64: PrecodeCapabilities = PrecodeCapabilities {
        isa: Isa::X86_64,
        alignment: 8,
        stub: x86_64::STUB,
        ndirect_import: Some(x86_64::NDIRECT_IMPORT),
        remoting: Some(x86_64::REMOTING),
        this_ptr_ret_buf: Some(x86_64::THIS_PTR_RET_BUF),
        fixup: Some(x86_64::FIXUP),
        retarget_patches_code: true,
        compact_entry_points: None,
    };

    pub const AARCH64: PrecodeCapabilities = PrecodeCapabilities {
        isa: Isa::Aarch64,
        alignment: 8,
        stub: aarch64::STUB,
        ndirect_import: Some(aarch64::NDIRECT_IMPORT),
        remoting: None,
        this_ptr_ret_buf: Some(aarch64::THIS_PTR_RET_BUF),
        fixup: Some(aarch64::FIXUP),
        retarget_patches_code: false,
        compact_entry_points: None,
    };

    /// Table for the ISA this binary runs on.
    pub fn host() -> &'static PrecodeCapabilities {
        Self::for_isa(Isa::host())
    }

    pub fn for_isa(isa: Isa) -> &'static PrecodeCapabilities {
        match isa {
            Isa::X86_64 => &X86_64_CAPS,
            Isa::Aarch64 => &AARCH64_CAPS,
        }
    }

    pub fn slot_layout(&self, kind: PrecodeKind) -> Option<&SlotLayout> {
        match kind {
            PrecodeKind::Stub => Some(&self.stub),
            PrecodeKind::NDirectImport => self.ndirect_import.as_ref(),
            PrecodeKind::Remoting => self.remoting.as_ref(),
            PrecodeKind::ThisPtrRetBuf => self.this_ptr_ret_buf.as_ref(),
            PrecodeKind::Fixup => None,
        }
    }

    pub fn is_valid_type(&self, kind: PrecodeKind) -> bool {
        match kind {
            PrecodeKind::Fixup => self.fixup.is_some(),
            _ => self.slot_layout(kind).is_some(),
        }
    }

    /// Size of one record of `kind`, or `None` if the ISA lacks it.
    pub fn size_of(&self, kind: PrecodeKind) -> Option<usize> {
        match kind {
            PrecodeKind::Fixup => self.fixup.map(|f| f.size),
            _ => self.slot_layout(kind).map(|l| l.size),
        }
    }

    pub fn align_of(&self, _kind: PrecodeKind) -> usize {
        self.alignment
    }

    /// Size one member of a temporary entry point chunk takes.
    pub fn size_of_temporary_entry_point(&self, kind: PrecodeKind) -> Option<usize> {
        self.size_of(kind)
    }

    /// Bytes needed for `count` temporary entry points of `kind`.
    pub fn size_of_temporary_entry_points(
        &self,
        kind: PrecodeKind,
        preallocate_jump_stubs: bool,
        count: usize,
    ) -> Option<usize> {
        match kind {
            PrecodeKind::Fixup => {
                let fixup = self.fixup?;
                let mut size = count * fixup.size + size_of::<usize>();
                if preallocate_jump_stubs {
                    size += count * fixup.dynamic_jump_stub_size?;
                }
                Some(size)
            }
            _ => Some(count * self.size_of(kind)?),
        }
    }

    /// Recover the kind from a record's leading bytes.
    pub fn classify(&self, bytes: &[u8; 8]) -> Option<PrecodeKind> {
        if let Some(fixup) = &self.fixup {
            let is_fixup = match fixup.encoding {
                FixupEncoding::Rel32 => x86_64::is_fixup(bytes),
                FixupEncoding::Slot { template, .. } => template[..8] == bytes[..],
            };
            if is_fixup {
                return Some(PrecodeKind::Fixup);
            }
        }
        PrecodeKind::ALL
            .into_iter()
            .find(|&kind| self.slot_layout(kind).is_some_and(|l| l.template[..8] == bytes[..]))
    }
}

static X86_64_CAPS: PrecodeCapabilities = PrecodeCapabilities::X86_64;
static AARCH64_CAPS: PrecodeCapabilities = PrecodeCapabilities::AARCH64;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_x86_64_sizes() {
        let caps = &PrecodeCapabilities::X86_64;
        assert_eq!(caps.size_of(PrecodeKind::Stub), Some(32));
        assert_eq!(caps.size_of(PrecodeKind::NDirectImport), Some(32));
        assert_eq!(caps.size_of(PrecodeKind::Remoting), Some(48));
        assert_eq!(caps.size_of(PrecodeKind::ThisPtrRetBuf), Some(32));
        assert_eq!(caps.size_of(PrecodeKind::Fixup), Some(8));
    }

    #[test]
    fn test_aarch64_has_no_remoting() {
        let caps = &PrecodeCapabilities::AARCH64;
        assert!(!caps.is_valid_type(PrecodeKind::Remoting));
        assert_eq!(caps.size_of(PrecodeKind::Remoting), None);
        assert_eq!(caps.size_of(PrecodeKind::ThisPtrRetBuf), Some(40));
        assert_eq!(caps.size_of(PrecodeKind::Fixup), Some(24));
        assert_eq!(
            caps.size_of_temporary_entry_points(PrecodeKind::Fixup, true, 2),
            None
        );
    }

    #[test]
    fn test_temporary_entry_point_sizes() {
        let caps = &PrecodeCapabilities::X86_64;
        assert_eq!(
            caps.size_of_temporary_entry_points(PrecodeKind::Fixup, false, 3),
            Some(3 * 8 + 8)
        );
        assert_eq!(
            caps.size_of_temporary_entry_points(PrecodeKind::Fixup, true, 3),
            Some(3 * 8 + 8 + 3 * 16)
        );
        assert_eq!(caps.size_of_temporary_entry_points(PrecodeKind::Stub, false, 3), Some(96));
    }

    #[test]
    fn test_classify_templates() {
        for caps in [&PrecodeCapabilities::X86_64, &PrecodeCapabilities::AARCH64] {
            for kind in PrecodeKind::ALL {
                if let Some(layout) = caps.slot_layout(kind) {
                    let bytes: [u8; 8] = layout.template[..8].try_into().unwrap();
                    assert_eq!(caps.classify(&bytes), Some(kind), "{} on {}", kind, caps.isa);
                }
            }
            assert_eq!(caps.classify(&[0; 8]), None);
        }
    }

    #[test]
    fn test_classify_fixup() {
        let caps = &PrecodeCapabilities::X86_64;
        assert_eq!(caps.classify(&[0xE8, 0, 0, 0, 0, 0x5E, 0, 0]), Some(PrecodeKind::Fixup));
        assert_eq!(caps.classify(&[0xE9, 1, 2, 3, 4, 0x5F, 9, 9]), Some(PrecodeKind::Fixup));
        assert_eq!(caps.classify(&[0xE9, 1, 2, 3, 4, 0x90, 9, 9]), None);

        let caps = &PrecodeCapabilities::AARCH64;
        let bytes: [u8; 8] = aarch64::FIXUP_TEMPLATE[..8].try_into().unwrap();
        assert_eq!(caps.classify(&bytes), Some(PrecodeKind::Fixup));
    }

    #[test]
    fn test_compact_size_formula() {
        let compact = CompactEntryPoints::THUMB2;
        assert_eq!(compact.size_of(1), 1 + 4 + 14);
        assert_eq!(compact.size_of(3), 1 + 12 + 14);
        assert_eq!(compact.size_of(60), 1 + 60 * 4 + 14);
        assert_eq!(compact.size_of(61), 1 + 60 * 4 + 14 + 4 + 14);
    }
}
