//! Saving the temporary entry points of a method chunk into an image.

use super::{
    DataImage, ImageError, ItemKind, NodeId, RelocKind, RelocTarget, fixup_member_bytes,
    fixup_target_relocation,
};
use crate::loader::TrampolineKind;
use crate::method::MethodDesc;
use crate::precode::{FixupLayout, PrecodeKind, unexpected_precode_type};

/// Methods whose temporary entry points are saved together.
///
/// Saved precodes only ever lead to the prestub, which installs a
/// patchable precode of the right kind at runtime, so one kind serves the
/// whole chunk.
#[derive(Debug, Default)]
pub struct SaveChunk<'a> {
    methods: Vec<(&'a MethodDesc, bool)>,
}

impl<'a> SaveChunk<'a> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `md`. With `register_original_alias`, the saved precode also
    /// stands in for the method as created from metadata.
    pub fn add_precode_for_method(&mut self, md: &'a MethodDesc, register_original_alias: bool) {
        self.methods.push((md, register_original_alias));
    }

    pub fn len(&self) -> usize {
        self.methods.len()
    }

    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }

    /// The kind the chunk will be saved as.
    pub fn kind(&self, image: &DataImage) -> PrecodeKind {
        let caps = image.capabilities();
        let Some(first) = self.methods.first() else {
            return PrecodeKind::Stub;
        };
        let base = first.0.chunk_base();
        let fits = caps.fixup.is_some()
            && self.methods.len() <= FixupLayout::MAX_CHUNK_COUNT
            && self
                .methods
                .iter()
                .all(|(md, _)| md.chunk_base() == base && md.chunk_index() <= u8::MAX as usize);
        if fits { PrecodeKind::Fixup } else { PrecodeKind::Stub }
    }

    /// Store the chunk. Returns `None` when there is nothing to save.
    pub fn save(&self, image: &mut DataImage) -> Result<Option<NodeId>, ImageError> {
        if self.methods.is_empty() {
            return Ok(None);
        }
        let bucket = self
            .methods
            .iter()
            .map(|(md, _)| image.precode_item_kind(md, false))
            .min()
            .unwrap_or(ItemKind::Cold);

        let node = match self.kind(image) {
            PrecodeKind::Fixup => self.save_fixup_chunk(image, bucket),
            _ => self.save_stub_chunk(image, bucket),
        };
        log::debug!(
            "saved {} precodes for {} in {:?}",
            self.methods.len(),
            self.methods[0].0.name(),
            bucket
        );
        Ok(Some(node))
    }

    fn register_aliases(&self, image: &mut DataImage, node: NodeId, stride: usize) {
        for (i, (md, original)) in self.methods.iter().enumerate() {
            image.register_surrogate(md.token(), node, i * stride, false);
            if *original {
                image.register_surrogate(md.token(), node, i * stride, true);
            }
        }
    }

    fn save_fixup_chunk(&self, image: &mut DataImage, bucket: ItemKind) -> NodeId {
        let caps = image.capabilities();
        let Some(fixup) = caps.fixup.as_ref() else {
            unexpected_precode_type("SaveChunk::save", PrecodeKind::Fixup);
        };
        let count = self.methods.len();
        let mut bytes = Vec::with_capacity(count * fixup.size + size_of::<usize>());
        for (i, (md, _)) in self.methods.iter().enumerate() {
            bytes.extend(fixup_member_bytes(caps, md.chunk_index() as u8, (count - 1 - i) as u8));
        }
        bytes.resize(count * fixup.size + size_of::<usize>(), 0);

        let node = image.store_structure(&bytes, bucket, caps.alignment);
        for i in 0..count {
            fixup_target_relocation(caps, image, node, i * fixup.size);
        }
        image.add_relocation(
            node,
            count * fixup.size,
            RelocKind::Absolute,
            RelocTarget::MethodDescChunk(self.methods[0].0.token()),
        );
        self.register_aliases(image, node, fixup.size);
        node
    }

    fn save_stub_chunk(&self, image: &mut DataImage, bucket: ItemKind) -> NodeId {
        let caps = image.capabilities();
        let layout = caps.stub;
        let mut bytes = vec![0u8; self.methods.len() * layout.size];
        for record in bytes.chunks_exact_mut(layout.size) {
            record[..layout.template.len()].copy_from_slice(layout.template);
        }

        let node = image.store_structure(&bytes, bucket, caps.alignment);
        for (i, (md, _)) in self.methods.iter().enumerate() {
            let base = i * layout.size;
            image.add_relocation(
                node,
                base + layout.method_desc_offset,
                RelocKind::Absolute,
                RelocTarget::MethodDesc(md.token()),
            );
            image.add_relocation(
                node,
                base + layout.target_offset,
                RelocKind::Absolute,
                RelocTarget::Trampoline(TrampolineKind::Prestub),
            );
        }
        self.register_aliases(image, node, layout.size);
        node
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::{LoaderHeap, Trampolines};
    use crate::method::{MethodDef, MethodDescChunk, PrecodeAccess};
    use crate::precode::PrecodeCapabilities;
    use std::sync::Arc;

    fn chunk(n: u32) -> Arc<MethodDescChunk> {
        let heap = LoaderHeap::with_defaults(Trampolines::for_tests());
        MethodDescChunk::new(
            heap,
            (0..n).map(|i| MethodDef::new(format!("M{}", i), 0x0600_0100 + i)),
        )
    }

    #[test]
    fn test_empty_chunk_saves_nothing() {
        let mut image = DataImage::new(&PrecodeCapabilities::X86_64);
        assert_eq!(SaveChunk::new().save(&mut image).unwrap(), None);
        assert!(image.finish().nodes.is_empty());
    }

    #[test]
    fn test_fixup_chunk_layout() {
        let chunk = chunk(3);
        let mut save = SaveChunk::new();
        for (i, md) in chunk.iter().enumerate() {
            save.add_precode_for_method(md, i == 1);
        }
        let mut image = DataImage::new(&PrecodeCapabilities::X86_64);
        assert_eq!(save.kind(&image), PrecodeKind::Fixup);
        let node = save.save(&mut image).unwrap().unwrap();
        let image = image.finish();

        let stored = image.node(node).unwrap();
        assert_eq!(stored.size, 3 * 8 + 8);
        assert_eq!(stored.section, ItemKind::ColdWritable);
        // One target relocation per member plus the shared slot
        assert_eq!(image.relocations.len(), 4);
        assert_eq!(image.surrogates.len(), 4);
        assert!(image.surrogates.iter().any(|s| s.original && s.offset == 8));

        let bytes = &image.section(ItemKind::ColdWritable).unwrap().bytes[stored.offset..];
        // Reverse precode indices: N-1-i
        assert_eq!(bytes[7], 2);
        assert_eq!(bytes[8 + 7], 1);
        assert_eq!(bytes[16 + 7], 0);
        assert_eq!(bytes[16 + 6], 2);
    }

    #[test]
    fn test_hottest_member_decides_bucket() {
        let chunk = chunk(2);
        let mut save = SaveChunk::new();
        save.add_precode_for_method(&chunk[0], false);
        save.add_precode_for_method(&chunk[1], false);
        let mut image = DataImage::new(&PrecodeCapabilities::X86_64);
        image.set_method_profiling(chunk[1].token(), PrecodeAccess::READ);
        let node = save.save(&mut image).unwrap().unwrap();
        assert_eq!(image.finish().node(node).unwrap().section, ItemKind::Hot);
    }

    #[test]
    fn test_mixed_chunks_fall_back_to_stubs() {
        let a = chunk(1);
        let b = chunk(1);
        let mut save = SaveChunk::new();
        save.add_precode_for_method(&a[0], false);
        save.add_precode_for_method(&b[0], false);
        let mut image = DataImage::new(&PrecodeCapabilities::X86_64);
        assert_eq!(save.kind(&image), PrecodeKind::Stub);
        let node = save.save(&mut image).unwrap().unwrap();
        let image = image.finish();
        assert_eq!(image.node(node).unwrap().size, 2 * 32);
        assert_eq!(image.relocations.len(), 4);
    }

    #[test]
    fn test_oversized_chunk_falls_back_to_stubs() {
        let chunk = chunk(257);
        let mut save = SaveChunk::new();
        for md in chunk.iter() {
            save.add_precode_for_method(md, false);
        }
        let image = DataImage::new(&PrecodeCapabilities::X86_64);
        assert_eq!(save.kind(&image), PrecodeKind::Stub);
    }
}
