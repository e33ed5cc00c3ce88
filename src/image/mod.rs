//! Precompiled images of precodes.
//!
//! A [`DataImage`] collects precodes laid out for persistence, with
//! relocations for every absolute or relative address they contain and
//! surrogate records mapping methods to their image entry points. The
//! finished [`PrecompiledImage`] is a serde blob; [`ZapModule::load`] maps
//! one back into memory and binds it to live method descs.

mod module;
mod save;
mod section;

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::Path;

pub use module::{ImageBinding, ZapModule};
pub use save::SaveChunk;
pub use section::SectionBuffer;

use crate::Pcode;
use crate::loader::{MemoryError, TrampolineKind};
use crate::method::{MethodDesc, MethodToken, PrecodeAccess};
use crate::precode::caps::FixupEncoding;
use crate::precode::x86_64::{FIXUP_REL32_END, FixupWord};
use crate::precode::{Isa, Precode, PrecodeCapabilities, PrecodeKind, unexpected_precode_type};

/// Placement bucket of a stored precode, hottest and most writable first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ItemKind {
    HotWritable,
    Hot,
    ColdWritable,
    Cold,
}

impl ItemKind {
    pub const ALL: [ItemKind; 4] = [
        ItemKind::HotWritable,
        ItemKind::Hot,
        ItemKind::ColdWritable,
        ItemKind::Cold,
    ];

    pub fn is_writable(self) -> bool {
        matches!(self, ItemKind::HotWritable | ItemKind::ColdWritable)
    }

    fn index(self) -> usize {
        self as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub u32);

/// A structure stored in one of the sections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredNode {
    pub section: ItemKind,
    pub offset: usize,
    pub size: usize,
}

/// What a relocation resolves to at load time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "kebab-case")]
pub enum RelocTarget {
    MethodDesc(MethodToken),
    /// First method desc of the chunk containing this method.
    MethodDescChunk(MethodToken),
    Trampoline(TrampolineKind),
    MethodCode(MethodToken),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RelocKind {
    /// Pointer-sized absolute address.
    Absolute,
    /// 32-bit displacement from the end of the field.
    Rel32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Relocation {
    pub node: NodeId,
    pub offset: usize,
    pub kind: RelocKind,
    pub target: RelocTarget,
}

/// An image entry point standing in for a method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Surrogate {
    pub method: MethodToken,
    pub node: NodeId,
    pub offset: usize,
    /// Alias of the method as created from metadata rather than the one
    /// restored from the image.
    pub original: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageSection {
    pub kind: ItemKind,
    pub bytes: Vec<u8>,
}

/// Errors building, reading or loading images.
#[derive(Debug)]
pub enum ImageError {
    Malformed(String),
    Io(std::io::Error),
    UnresolvedMethod(MethodToken),
    UnresolvedCode(MethodToken),
    BadRelocation { node: NodeId, offset: usize },
    NotStored(Pcode),
    IsaMismatch { image: Isa, precode: Isa },
    Memory(MemoryError),
}

impl fmt::Display for ImageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ImageError::Malformed(msg) => write!(f, "malformed image: {}", msg),
            ImageError::Io(e) => write!(f, "image I/O failed: {}", e),
            ImageError::UnresolvedMethod(token) => write!(f, "no method desc bound for {}", token),
            ImageError::UnresolvedCode(token) => write!(f, "no code bound for {}", token),
            ImageError::BadRelocation { node, offset } => {
                write!(f, "relocation at node {} offset {:#x} cannot be applied", node.0, offset)
            }
            ImageError::NotStored(addr) => {
                write!(f, "precode {:#x} was not stored in the image", addr)
            }
            ImageError::IsaMismatch { image, precode } => {
                write!(f, "image targets {} but precode is {}", image, precode)
            }
            ImageError::Memory(e) => write!(f, "mapping image: {}", e),
        }
    }
}

impl std::error::Error for ImageError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ImageError::Io(e) => Some(e),
            ImageError::Memory(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for ImageError {
    fn from(e: std::io::Error) -> Self {
        ImageError::Io(e)
    }
}

impl From<MemoryError> for ImageError {
    fn from(e: MemoryError) -> Self {
        ImageError::Memory(e)
    }
}

/// A finished image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrecompiledImage {
    pub isa: Isa,
    pub sections: Vec<ImageSection>,
    pub nodes: Vec<StoredNode>,
    pub relocations: Vec<Relocation>,
    pub surrogates: Vec<Surrogate>,
}

impl PrecompiledImage {
    pub fn to_bytes(&self) -> Result<Vec<u8>, ImageError> {
        serde_json::to_vec(self).map_err(|e| ImageError::Malformed(e.to_string()))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ImageError> {
        let image: PrecompiledImage =
            serde_json::from_slice(bytes).map_err(|e| ImageError::Malformed(e.to_string()))?;
        image.validate()?;
        Ok(image)
    }

    pub fn save(&self, path: &Path) -> Result<(), ImageError> {
        std::fs::write(path, self.to_bytes()?)?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self, ImageError> {
        Self::from_bytes(&std::fs::read(path)?)
    }

    pub fn section(&self, kind: ItemKind) -> Option<&ImageSection> {
        self.sections.iter().find(|s| s.kind == kind)
    }

    pub fn node(&self, id: NodeId) -> Option<&StoredNode> {
        self.nodes.get(id.0 as usize)
    }

    /// Check that every node and relocation lies inside its section.
    pub fn validate(&self) -> Result<(), ImageError> {
        for (i, node) in self.nodes.iter().enumerate() {
            let len = self.section(node.section).map_or(0, |s| s.bytes.len());
            if node.offset.checked_add(node.size).is_none_or(|end| end > len) {
                return Err(ImageError::Malformed(format!("node {} is outside its section", i)));
            }
        }
        for reloc in &self.relocations {
            let node = self.node(reloc.node).ok_or_else(|| {
                ImageError::Malformed(format!("relocation refers to missing node {}", reloc.node.0))
            })?;
            let width = match reloc.kind {
                RelocKind::Absolute => size_of::<u64>(),
                RelocKind::Rel32 => size_of::<i32>(),
            };
            if reloc.offset + width > node.size {
                return Err(ImageError::BadRelocation {
                    node: reloc.node,
                    offset: reloc.offset,
                });
            }
        }
        for surrogate in &self.surrogates {
            if self.node(surrogate.node).is_none() {
                return Err(ImageError::Malformed(format!(
                    "surrogate for {} refers to missing node {}",
                    surrogate.method, surrogate.node.0
                )));
            }
        }
        Ok(())
    }

    /// Per-bucket counts for reports.
    pub fn summary(&self) -> ImageSummary {
        ImageSummary {
            isa: self.isa,
            sections: self.sections.iter().map(|s| (s.kind, s.bytes.len())).collect(),
            nodes: self.nodes.len(),
            relocations: self.relocations.len(),
            surrogates: self.surrogates.len(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ImageSummary {
    pub isa: Isa,
    pub sections: Vec<(ItemKind, usize)>,
    pub nodes: usize,
    pub relocations: usize,
    pub surrogates: usize,
}

/// Image builder.
pub struct DataImage {
    caps: &'static PrecodeCapabilities,
    sections: [SectionBuffer; 4],
    nodes: Vec<StoredNode>,
    relocations: Vec<Relocation>,
    surrogates: Vec<Surrogate>,
    stored: HashMap<Pcode, NodeId>,
    profiling: HashMap<MethodToken, PrecodeAccess>,
    direct_calls: HashSet<MethodToken>,
    force_instrument: bool,
}

impl DataImage {
    pub fn new(caps: &'static PrecodeCapabilities) -> Self {
        Self {
            caps,
            sections: Default::default(),
            nodes: Vec::new(),
            relocations: Vec::new(),
            surrogates: Vec::new(),
            stored: HashMap::new(),
            profiling: HashMap::new(),
            direct_calls: HashSet::new(),
            force_instrument: false,
        }
    }

    pub fn capabilities(&self) -> &'static PrecodeCapabilities {
        self.caps
    }

    pub fn set_method_profiling(&mut self, token: MethodToken, access: PrecodeAccess) {
        let entry = self.profiling.entry(token).or_default();
        *entry = entry.union(access);
    }

    /// Take over the accesses recorded on `md` at runtime.
    pub fn record_profile(&mut self, md: &MethodDesc) {
        self.set_method_profiling(md.token(), md.precode_access());
    }

    pub fn method_profiling(&self, token: MethodToken) -> PrecodeAccess {
        self.profiling.get(&token).copied().unwrap_or_default()
    }

    /// Allow callers in the image to bind directly to `token`'s code.
    pub fn allow_direct_call(&mut self, token: MethodToken) {
        self.direct_calls.insert(token);
    }

    pub fn can_direct_call(&self, md: &MethodDesc) -> bool {
        self.direct_calls.contains(&md.token())
    }

    /// Keep every precode going through the prestub, for instrumentation.
    pub fn set_force_instrument(&mut self, force: bool) {
        self.force_instrument = force;
    }

    pub fn force_instrument(&self) -> bool {
        self.force_instrument
    }

    /// Placement bucket for `md`'s precode.
    pub fn precode_item_kind(&self, md: &MethodDesc, prebound: bool) -> ItemKind {
        let profile = self.method_profiling(md.token());
        let flags = md.flags();
        if profile.written {
            if prebound { ItemKind::Hot } else { ItemKind::HotWritable }
        } else if profile.read {
            ItemKind::Hot
        } else if prebound || flags.contains_generic_variables || flags.is_interface {
            // Generic definitions and interface methods rarely run through
            // their precode.
            ItemKind::Cold
        } else {
            ItemKind::ColdWritable
        }
    }

    /// Append `bytes` to the `kind` section.
    pub fn store_structure(&mut self, bytes: &[u8], kind: ItemKind, align: usize) -> NodeId {
        let offset = self.sections[kind.index()].emit_aligned(bytes, align);
        let id = NodeId(self.nodes.len() as u32);
        self.nodes.push(StoredNode {
            section: kind,
            offset,
            size: bytes.len(),
        });
        id
    }

    pub fn add_relocation(
        &mut self,
        node: NodeId,
        offset: usize,
        kind: RelocKind,
        target: RelocTarget,
    ) {
        self.relocations.push(Relocation {
            node,
            offset,
            kind,
            target,
        });
    }

    pub fn register_surrogate(
        &mut self,
        method: MethodToken,
        node: NodeId,
        offset: usize,
        original: bool,
    ) {
        self.surrogates.push(Surrogate {
            method,
            node,
            offset,
            original,
        });
    }

    /// Node a live precode was stored as.
    pub fn node_for(&self, precode: Pcode) -> Option<NodeId> {
        self.stored.get(&precode).copied()
    }

    /// Store a copy of a live precode and record its relocations.
    pub fn store_precode(&mut self, precode: &Precode<'_>) -> Result<NodeId, ImageError> {
        let isa = precode.capabilities().isa;
        if isa != self.caps.isa {
            return Err(ImageError::IsaMismatch {
                image: self.caps.isa,
                precode: isa,
            });
        }
        let md = precode.method_desc();
        let kind = precode.kind();
        let prebound = precode.is_prebound(self);
        let bytes = save_bytes(self.caps, kind);
        let item_kind = self.precode_item_kind(md, prebound);
        let node = self.store_structure(&bytes, item_kind, self.caps.alignment);
        self.stored.insert(precode.entry_point(), node);
        precode.fixup(self, md)?;
        Ok(node)
    }

    pub fn finish(self) -> PrecompiledImage {
        let [hot_writable, hot, cold_writable, cold] = self.sections;
        let sections = ItemKind::ALL
            .into_iter()
            .zip([hot_writable, hot, cold_writable, cold])
            .filter(|(_, buf)| !buf.is_empty())
            .map(|(kind, buf)| ImageSection {
                kind,
                bytes: buf.into_bytes(),
            })
            .collect();
        PrecompiledImage {
            isa: self.caps.isa,
            sections,
            nodes: self.nodes,
            relocations: self.relocations,
            surrogates: self.surrogates,
        }
    }
}

/// Image bytes of a single precode of `kind`, with every address left for
/// relocations to fill in. A stored fixup member is followed by its own
/// shared slot and refers to its method at index 0.
fn save_bytes(caps: &PrecodeCapabilities, kind: PrecodeKind) -> Vec<u8> {
    if kind == PrecodeKind::Fixup {
        let Some(fixup) = caps.fixup.as_ref() else {
            unexpected_precode_type("DataImage::store_precode", kind);
        };
        let mut bytes = fixup_member_bytes(caps, 0, 0);
        bytes.resize(fixup.size + size_of::<usize>(), 0);
        return bytes;
    }
    let Some(layout) = caps.slot_layout(kind) else {
        unexpected_precode_type("DataImage::store_precode", kind);
    };
    let mut bytes = vec![0u8; layout.size];
    bytes[..layout.template.len()].copy_from_slice(layout.template);
    bytes
}

/// An unpatched fixup member with a zero displacement.
pub(crate) fn fixup_member_bytes(
    caps: &PrecodeCapabilities,
    method_desc_index: u8,
    precode_index: u8,
) -> Vec<u8> {
    let Some(fixup) = caps.fixup.as_ref() else {
        unexpected_precode_type("fixup_member_bytes", PrecodeKind::Fixup);
    };
    match fixup.encoding {
        FixupEncoding::Rel32 => FixupWord {
            patched: false,
            rel32: 0,
            method_desc_index,
            precode_index,
        }
        .encode()
        .to_le_bytes()
        .to_vec(),
        FixupEncoding::Slot { template, .. } => {
            let mut bytes = vec![0u8; fixup.size];
            bytes[..template.len()].copy_from_slice(template);
            bytes[fixup.method_desc_index_offset] = method_desc_index;
            bytes[fixup.precode_index_offset] = precode_index;
            bytes
        }
    }
}

/// Relocation for a fixup member's target at `member_offset` in `node`.
pub(crate) fn fixup_target_relocation(
    caps: &PrecodeCapabilities,
    image: &mut DataImage,
    node: NodeId,
    member_offset: usize,
) {
    let Some(fixup) = caps.fixup.as_ref() else {
        unexpected_precode_type("fixup_target_relocation", PrecodeKind::Fixup);
    };
    let target = RelocTarget::Trampoline(TrampolineKind::FixupThunk);
    match fixup.encoding {
        FixupEncoding::Rel32 => {
            let offset = member_offset + FIXUP_REL32_END - 4;
            image.add_relocation(node, offset, RelocKind::Rel32, target)
        }
        FixupEncoding::Slot { target_offset, .. } => {
            image.add_relocation(node, member_offset + target_offset, RelocKind::Absolute, target)
        }
    }
}

impl<'a> Precode<'a> {
    /// Whether the image can bind this precode straight to the method's
    /// code. Only remoting precodes are prebound, and never while the
    /// image forces instrumentation.
    pub fn is_prebound(&self, image: &DataImage) -> bool {
        if image.force_instrument() || self.kind() != PrecodeKind::Remoting {
            return false;
        }
        let Some(md) = self.method_desc_speculative() else {
            return false;
        };
        // SAFETY: precodes only reference method descs that outlive them.
        image.can_direct_call(unsafe { md.as_ref() })
    }

    /// Record the relocations of this precode's stored copy.
    pub fn fixup(&self, image: &mut DataImage, md: &MethodDesc) -> Result<(), ImageError> {
        let node = image
            .node_for(self.entry_point())
            .ok_or(ImageError::NotStored(self.entry_point()))?;
        let caps = self.capabilities();
        let kind = self.kind();
        let token = md.token();

        if kind == PrecodeKind::Fixup {
            fixup_target_relocation(caps, image, node, 0);
            let shared = caps.fixup.as_ref().map_or(0, |f| f.size);
            image.add_relocation(node, shared, RelocKind::Absolute, RelocTarget::MethodDesc(token));
            return Ok(());
        }

        let layout = match (kind, caps.slot_layout(kind)) {
            (PrecodeKind::ThisPtrRetBuf, _) | (_, None) => {
                unexpected_precode_type("Precode::fixup", kind)
            }
            (_, Some(layout)) => *layout,
        };
        image.add_relocation(
            node,
            layout.method_desc_offset,
            RelocKind::Absolute,
            RelocTarget::MethodDesc(token),
        );
        let target = if self.is_prebound(image) {
            RelocTarget::MethodCode(token)
        } else if kind == PrecodeKind::NDirectImport {
            RelocTarget::Trampoline(TrampolineKind::NDirectImportThunk)
        } else {
            RelocTarget::Trampoline(TrampolineKind::Prestub)
        };
        image.add_relocation(node, layout.target_offset, RelocKind::Absolute, target);
        if let Some(thunk) = layout.thunk_offset {
            image.add_relocation(
                node,
                thunk,
                RelocKind::Absolute,
                RelocTarget::Trampoline(TrampolineKind::RemotingCheckThunk),
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::{LoaderHeap, Trampolines};
    use crate::method::{MethodDef, MethodDescChunk, MethodFlags};
    use std::sync::Arc;

    fn chunk(flags: MethodFlags) -> Arc<MethodDescChunk> {
        let heap = LoaderHeap::with_defaults(Trampolines::for_tests());
        MethodDescChunk::new(heap, [MethodDef::new("Get", 0x0600_0010).with_flags(flags)])
    }

    #[test]
    fn test_precode_item_kind_buckets() {
        let plain = chunk(MethodFlags::default());
        let generic = chunk(MethodFlags {
            contains_generic_variables: true,
            ..MethodFlags::default()
        });
        let mut image = DataImage::new(&PrecodeCapabilities::X86_64);

        assert_eq!(image.precode_item_kind(&plain[0], false), ItemKind::ColdWritable);
        assert_eq!(image.precode_item_kind(&plain[0], true), ItemKind::Cold);
        assert_eq!(image.precode_item_kind(&generic[0], false), ItemKind::Cold);

        image.set_method_profiling(plain[0].token(), PrecodeAccess::READ);
        assert_eq!(image.precode_item_kind(&plain[0], false), ItemKind::Hot);

        image.set_method_profiling(plain[0].token(), PrecodeAccess::WRITE);
        assert_eq!(image.precode_item_kind(&plain[0], false), ItemKind::HotWritable);
        assert_eq!(image.precode_item_kind(&plain[0], true), ItemKind::Hot);
    }

    #[test]
    fn test_prebinding_rules() {
        let chunk = chunk(MethodFlags::default());
        let md = &chunk[0];
        let caps = &PrecodeCapabilities::X86_64;
        let remoting = Precode::allocate(caps, PrecodeKind::Remoting, md).unwrap();
        let stub = Precode::allocate(caps, PrecodeKind::Stub, md).unwrap();

        let mut image = DataImage::new(caps);
        assert!(!remoting.is_prebound(&image));
        image.allow_direct_call(md.token());
        assert!(remoting.is_prebound(&image));
        assert!(!stub.is_prebound(&image));
        image.set_force_instrument(true);
        assert!(!remoting.is_prebound(&image));
    }

    #[test]
    fn test_store_precode_relocations() {
        let chunk = chunk(MethodFlags::default());
        let md = &chunk[0];
        let caps = &PrecodeCapabilities::X86_64;
        let remoting = Precode::allocate(caps, PrecodeKind::Remoting, md).unwrap();

        let mut image = DataImage::new(caps);
        image.allow_direct_call(md.token());
        let node = image.store_precode(&remoting).unwrap();
        let image = image.finish();

        let node = image.node(node).unwrap();
        assert_eq!(node.section, ItemKind::Cold);
        assert_eq!(node.size, 48);
        let targets: Vec<_> = image.relocations.iter().map(|r| (r.offset, r.target)).collect();
        assert!(targets.contains(&(32, RelocTarget::MethodDesc(md.token()))));
        assert!(targets.contains(&(40, RelocTarget::MethodCode(md.token()))));
        let thunk = RelocTarget::Trampoline(TrampolineKind::RemotingCheckThunk);
        assert!(targets.contains(&(24, thunk)));
    }

    #[test]
    #[should_panic(expected = "unexpected precode type")]
    fn test_this_ptr_ret_buf_cannot_be_stored() {
        let chunk = chunk(MethodFlags::default());
        let caps = &PrecodeCapabilities::X86_64;
        let precode = Precode::allocate(caps, PrecodeKind::ThisPtrRetBuf, &chunk[0]).unwrap();
        let mut image = DataImage::new(caps);
        let _ = image.store_precode(&precode);
    }

    #[test]
    fn test_fixup_of_unstored_precode() {
        let chunk = chunk(MethodFlags::default());
        let caps = &PrecodeCapabilities::X86_64;
        let precode = Precode::allocate(caps, PrecodeKind::Stub, &chunk[0]).unwrap();
        let mut image = DataImage::new(caps);
        assert!(matches!(precode.fixup(&mut image, &chunk[0]), Err(ImageError::NotStored(_))));
    }

    #[test]
    fn test_blob_rejects_bad_relocation() {
        let image = PrecompiledImage {
            isa: Isa::X86_64,
            sections: vec![ImageSection {
                kind: ItemKind::Cold,
                bytes: vec![0; 8],
            }],
            nodes: vec![StoredNode {
                section: ItemKind::Cold,
                offset: 0,
                size: 8,
            }],
            relocations: vec![Relocation {
                node: NodeId(0),
                offset: 4,
                kind: RelocKind::Absolute,
                target: RelocTarget::Trampoline(TrampolineKind::Prestub),
            }],
            surrogates: vec![],
        };
        let bytes = image.to_bytes().unwrap();
        assert!(matches!(
            PrecompiledImage::from_bytes(&bytes),
            Err(ImageError::BadRelocation { .. })
        ));
        assert!(matches!(
            PrecompiledImage::from_bytes(b"not json"),
            Err(ImageError::Malformed(_))
        ));
    }
}
