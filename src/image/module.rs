//! Loading a precompiled image into memory.

use std::collections::HashMap;
use std::fmt;
use std::ops::Range;
use std::sync::Arc;

use super::{ImageError, ItemKind, PrecompiledImage, RelocKind, RelocTarget};
use crate::Pcode;
use crate::loader::memory::page_size;
use crate::loader::{CodeRegion, Protection, TrampolineKind, Trampolines};
use crate::method::{MethodDesc, MethodDescChunk, MethodToken};
use crate::precode::icache::flush_instruction_cache;
use crate::precode::x86_64::{self, JUMP_STUB_SIZE};
use crate::precode::{Isa, Precode, PrecodeCapabilities};

/// Live objects an image's relocations resolve against.
#[derive(Default)]
pub struct ImageBinding {
    chunks: Vec<Arc<MethodDescChunk>>,
    code: HashMap<MethodToken, Pcode>,
}

impl ImageBinding {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_chunk(mut self, chunk: Arc<MethodDescChunk>) -> Self {
        self.chunks.push(chunk);
        self
    }

    /// Code address prebound precodes of `token` jump to.
    pub fn with_code(mut self, token: MethodToken, code: Pcode) -> Self {
        self.code.insert(token, code);
        self
    }

    pub fn resolve_method(&self, token: MethodToken) -> Option<&MethodDesc> {
        self.chunks.iter().find_map(|chunk| chunk.find(token))
    }

    fn method(&self, token: MethodToken) -> Result<&MethodDesc, ImageError> {
        self.resolve_method(token).ok_or(ImageError::UnresolvedMethod(token))
    }
}

/// A precompiled image mapped into memory.
///
/// Precodes inside the module are "zapped": they are read-only and may be
/// superseded by their method's stable entry point. The module owns its
/// mapping and keeps the bound chunks alive.
pub struct ZapModule {
    caps: &'static PrecodeCapabilities,
    region: CodeRegion,
    /// Module-local jump stubs, one per trampoline kind.
    jump_stubs: [Pcode; TrampolineKind::ALL.len()],
    sections: Vec<(ItemKind, Range<Pcode>)>,
    aliases: HashMap<MethodToken, Pcode>,
    original_aliases: HashMap<MethodToken, Pcode>,
    binding: ImageBinding,
}

impl ZapModule {
    /// Map `image`, resolve its relocations against `binding` and bind
    /// every method it stands in for to the new module.
    pub fn load(
        image: &PrecompiledImage,
        trampolines: &Trampolines,
        binding: ImageBinding,
        executable: bool,
    ) -> Result<Arc<ZapModule>, ImageError> {
        image.validate()?;
        let page = page_size();

        // Page 0 holds the jump stubs; each section starts on its own page
        // so it can be protected separately.
        let mut offsets = Vec::with_capacity(image.sections.len());
        let mut size = page;
        for section in &image.sections {
            offsets.push(size);
            size += section.bytes.len().next_multiple_of(page);
        }

        let writable = if executable {
            Protection::ReadWriteExecute
        } else {
            Protection::ReadWrite
        };
        let region = CodeRegion::new(size, writable)?;

        let mut jump_stubs = [0; TrampolineKind::ALL.len()];
        for (i, kind) in TrampolineKind::ALL.into_iter().enumerate() {
            let offset = i * JUMP_STUB_SIZE;
            // SAFETY: the first page is ours and unpublished.
            let target = trampolines.address(kind);
            unsafe { x86_64::emit_jump_stub(region.as_ptr().add(offset), target) };
            jump_stubs[i] = region.base() + offset;
        }

        let mut sections = Vec::with_capacity(image.sections.len());
        for (section, &offset) in image.sections.iter().zip(&offsets) {
            region.write(offset, &section.bytes)?;
            let start = region.base() + offset;
            sections.push((section.kind, start..start + section.bytes.len()));
        }
        let section_base = |kind: ItemKind| {
            sections
                .iter()
                .find(|(k, _)| *k == kind)
                .map(|(_, range)| range.start)
        };

        for reloc in &image.relocations {
            let bad = || ImageError::BadRelocation {
                node: reloc.node,
                offset: reloc.offset,
            };
            let node = image.node(reloc.node).ok_or_else(bad)?;
            let field = section_base(node.section).ok_or_else(bad)? + node.offset + reloc.offset;
            let value = match reloc.target {
                RelocTarget::MethodDesc(token) => binding.method(token)?.address(),
                RelocTarget::MethodDescChunk(token) => {
                    binding.method(token)?.chunk_first().address()
                }
                RelocTarget::MethodCode(token) => *binding
                    .code
                    .get(&token)
                    .ok_or(ImageError::UnresolvedCode(token))?,
                RelocTarget::Trampoline(kind) => match reloc.kind {
                    RelocKind::Absolute => trampolines.address(kind),
                    RelocKind::Rel32 => jump_stubs[trampoline_index(kind)],
                },
            };
            let bytes = match reloc.kind {
                RelocKind::Absolute => value.to_le_bytes().to_vec(),
                RelocKind::Rel32 => x86_64::rel32(field + 4, value)
                    .ok_or_else(bad)?
                    .to_le_bytes()
                    .to_vec(),
            };
            region.write(field - region.base(), &bytes)?;
        }

        let read_only = if executable {
            Protection::ReadExecute
        } else {
            Protection::ReadOnly
        };
        region.protect(0, page, read_only)?;
        for ((kind, range), &offset) in sections.iter().zip(&offsets) {
            if !kind.is_writable() {
                let size = (range.end - range.start).next_multiple_of(page);
                region.protect(offset, size, read_only)?;
            }
        }
        if executable {
            flush_instruction_cache(region.base(), region.size());
        }

        let mut aliases = HashMap::new();
        let mut original_aliases = HashMap::new();
        for surrogate in &image.surrogates {
            binding.method(surrogate.method)?;
            let Some(node) = image.node(surrogate.node) else {
                return Err(ImageError::Malformed(format!("missing node {}", surrogate.node.0)));
            };
            let Some(base) = section_base(node.section) else {
                return Err(ImageError::Malformed(format!("missing section {:?}", node.section)));
            };
            let entry = base + node.offset + surrogate.offset;
            if surrogate.original {
                original_aliases.insert(surrogate.method, entry);
            } else {
                aliases.insert(surrogate.method, entry);
            }
        }

        let module = Arc::new(ZapModule {
            caps: PrecodeCapabilities::for_isa(image.isa),
            region,
            jump_stubs,
            sections,
            aliases,
            original_aliases,
            binding,
        });
        module.bind_methods(image);

        log::debug!(
            target: "precode::perfmap",
            "{:#x} {:#x} ZapModule::load",
            module.region.base(),
            module.region.size()
        );
        Ok(module)
    }

    fn bind_methods(self: &Arc<Self>, image: &PrecompiledImage) {
        let referenced = image
            .relocations
            .iter()
            .filter_map(|reloc| match reloc.target {
                RelocTarget::MethodDesc(token) => Some(token),
                _ => None,
            })
            .chain(image.surrogates.iter().map(|s| s.method));
        for token in referenced {
            let Some(md) = self.binding.resolve_method(token) else {
                continue;
            };
            if !md.bind_zap_module(self)
                && !md.zap_module().is_some_and(|m| Arc::ptr_eq(&m, self))
            {
                log::warn!("{} is already bound to another precompiled module", md.name());
            }
        }
        for (&token, &entry) in &self.aliases {
            if let Some(md) = self.binding.resolve_method(token) {
                if md.method_entry_point().is_none() {
                    md.set_method_entry_point(entry);
                }
            }
        }
    }

    pub fn isa(&self) -> Isa {
        self.caps.isa
    }

    pub fn base(&self) -> Pcode {
        self.region.base()
    }

    pub fn size(&self) -> usize {
        self.region.size()
    }

    /// Whether `addr` lies in one of the module's sections.
    pub fn is_zapped_precode(&self, addr: Pcode) -> bool {
        self.sections.iter().any(|(_, range)| range.contains(&addr))
    }

    pub fn owns_jump_stub(&self, addr: Pcode) -> bool {
        self.jump_stubs.contains(&addr)
    }

    /// Module-local stub forwarding to the prestub.
    pub fn prestub_jump_stub(&self) -> Pcode {
        self.jump_stubs[trampoline_index(TrampolineKind::Prestub)]
    }

    /// Module-local stub forwarding to the fixup thunk.
    pub fn fixup_jump_stub(&self) -> Pcode {
        self.jump_stubs[trampoline_index(TrampolineKind::FixupThunk)]
    }

    /// The image precode standing in for `token`.
    pub fn entry_point_for(&self, token: MethodToken) -> Option<Pcode> {
        self.aliases.get(&token).copied()
    }

    /// The image precode registered for `token` as created from metadata.
    pub fn original_entry_point_for(&self, token: MethodToken) -> Option<Pcode> {
        self.original_aliases.get(&token).copied()
    }

    /// The zapped precode at `entry`.
    pub fn precode(&self, entry: Pcode) -> Option<Precode<'_>> {
        if !self.is_zapped_precode(entry) {
            return None;
        }
        // SAFETY: module sections stay mapped for the module's lifetime and
        // the bound chunks are owned by the module.
        unsafe { Precode::try_from_entry_point(self.caps, entry) }
    }

    pub fn section_range(&self, kind: ItemKind) -> Option<Range<Pcode>> {
        self.sections
            .iter()
            .find(|(k, _)| *k == kind)
            .map(|(_, range)| range.clone())
    }
}

fn trampoline_index(kind: TrampolineKind) -> usize {
    match kind {
        TrampolineKind::Prestub => 0,
        TrampolineKind::FixupThunk => 1,
        TrampolineKind::NDirectImportThunk => 2,
        TrampolineKind::RemotingCheckThunk => 3,
    }
}

impl fmt::Debug for ZapModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ZapModule")
            .field("isa", &self.caps.isa)
            .field("base", &format_args!("{:#x}", self.region.base()))
            .field("size", &self.region.size())
            .field("sections", &self.sections)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::{DataImage, SaveChunk};
    use crate::loader::LoaderHeap;
    use crate::method::{MethodDef, PrecodeAccess};
    use crate::precode::PrecodeKind;

    fn chunk(n: u32) -> Arc<MethodDescChunk> {
        let heap = LoaderHeap::with_defaults(Trampolines::for_tests());
        MethodDescChunk::new(
            heap,
            (0..n).map(|i| MethodDef::new(format!("M{}", i), 0x0600_0200 + i)),
        )
    }

    #[test]
    fn test_trampoline_index_matches_all() {
        for (i, kind) in TrampolineKind::ALL.into_iter().enumerate() {
            assert_eq!(trampoline_index(kind), i);
        }
    }

    #[test]
    fn test_load_fixup_chunk() {
        let chunk = chunk(3);
        let mut save = SaveChunk::new();
        for md in chunk.iter() {
            save.add_precode_for_method(md, false);
        }
        let mut image = DataImage::new(&PrecodeCapabilities::X86_64);
        save.save(&mut image).unwrap();
        let image = image.finish();

        let trampolines = Trampolines::for_tests();
        let binding = ImageBinding::new().with_chunk(chunk.clone());
        let module = ZapModule::load(&image, &trampolines, binding, false).unwrap();

        for md in chunk.iter() {
            let entry = module.entry_point_for(md.token()).unwrap();
            assert_eq!(md.method_entry_point(), Some(entry));
            assert!(md.zap_module().is_some());

            let precode = module.precode(entry).unwrap();
            assert_eq!(precode.kind(), PrecodeKind::Fixup);
            assert!(precode.is_zapped());
            assert_eq!(precode.method_desc().as_ptr(), md.as_ptr());
            // Routed through the module's own stub to the fixup thunk
            assert_eq!(precode.target(), trampolines.fixup_thunk);
            assert!(precode.is_pointing_to_prestub());
        }
        assert!(chunk[0].precode_access().read);
    }

    #[test]
    fn test_zapped_target_prefers_stable_entry_point() {
        let chunk = chunk(1);
        let mut save = SaveChunk::new();
        save.add_precode_for_method(&chunk[0], false);
        let mut image = DataImage::new(&PrecodeCapabilities::X86_64);
        save.save(&mut image).unwrap();
        let image = image.finish();

        chunk[0].set_method_entry_point(0x7000_0000);
        let module = ZapModule::load(
            &image,
            &Trampolines::for_tests(),
            ImageBinding::new().with_chunk(chunk.clone()),
            false,
        )
        .unwrap();
        let entry = module.entry_point_for(chunk[0].token()).unwrap();
        assert_eq!(module.precode(entry).unwrap().target(), 0x7000_0000);
    }

    #[test]
    fn test_prebound_remoting_needs_code() {
        let chunk = chunk(1);
        let md = &chunk[0];
        let caps = &PrecodeCapabilities::X86_64;
        let live = Precode::allocate(caps, PrecodeKind::Remoting, md).unwrap();
        let mut image = DataImage::new(caps);
        image.allow_direct_call(md.token());
        image.set_method_profiling(md.token(), PrecodeAccess::WRITE);
        let node = image.store_precode(&live).unwrap();
        let image = image.finish();

        let missing = ZapModule::load(
            &image,
            &Trampolines::for_tests(),
            ImageBinding::new().with_chunk(chunk.clone()),
            false,
        );
        assert!(matches!(missing, Err(ImageError::UnresolvedCode(_))));

        let module = ZapModule::load(
            &image,
            &Trampolines::for_tests(),
            ImageBinding::new().with_chunk(chunk.clone()).with_code(md.token(), 0x7100_0000),
            false,
        )
        .unwrap();
        let stored = image.node(node).unwrap();
        let entry = module.section_range(stored.section).unwrap().start + stored.offset;
        let precode = module.precode(entry).unwrap();
        assert_eq!(precode.kind(), PrecodeKind::Remoting);
        assert_eq!(precode.target(), 0x7100_0000);
    }

    #[test]
    fn test_unresolved_method() {
        let chunk = chunk(1);
        let mut save = SaveChunk::new();
        save.add_precode_for_method(&chunk[0], false);
        let mut image = DataImage::new(&PrecodeCapabilities::X86_64);
        save.save(&mut image).unwrap();
        let result =
            ZapModule::load(&image.finish(), &Trampolines::for_tests(), ImageBinding::new(), false);
        assert!(matches!(result, Err(ImageError::UnresolvedMethod(_))));
    }
}
