//! Method descriptors as seen by the precode engine.
//!
//! The runtime owns the real descriptors. This module keeps only what
//! precodes need: identity, calling-convention flags, the index a fixup
//! precode uses to find its method inside the chunk, the owning loader
//! allocator, and the method's stable entry point.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ptr::NonNull;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
#[cfg(feature = "image")]
use std::sync::{OnceLock, Weak};

#[cfg(feature = "image")]
use crate::image::ZapModule;
use crate::loader::{LoaderAllocator, Trampolines};
use crate::Pcode;

/// Metadata token identifying a method across the runtime and images.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MethodToken(pub u32);

impl fmt::Display for MethodToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:08x}", self.0)
    }
}

/// Per-method properties that decide which precode a method can use.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MethodFlags {
    /// The callee expects its descriptor in a scratch register.
    pub requires_md_calling_convention: bool,
    /// Lightweight generated code (dynamic method).
    pub is_dynamic: bool,
    pub requires_stable_entry_point: bool,
    pub contains_generic_variables: bool,
    pub is_interface: bool,
}

/// Precode accesses observed for a method, used for image placement.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrecodeAccess {
    pub read: bool,
    pub written: bool,
}

impl PrecodeAccess {
    pub const READ: PrecodeAccess = PrecodeAccess { read: true, written: false };
    pub const WRITE: PrecodeAccess = PrecodeAccess { read: false, written: true };

    fn bits(self) -> u8 {
        (self.read as u8) | ((self.written as u8) << 1)
    }

    fn from_bits(bits: u8) -> Self {
        PrecodeAccess {
            read: bits & 1 != 0,
            written: bits & 2 != 0,
        }
    }

    pub fn union(self, other: PrecodeAccess) -> PrecodeAccess {
        PrecodeAccess::from_bits(self.bits() | other.bits())
    }
}

/// Definition used to build a [`MethodDescChunk`].
#[derive(Debug, Clone)]
pub struct MethodDef {
    pub name: String,
    pub token: MethodToken,
    pub flags: MethodFlags,
}

impl MethodDef {
    pub fn new(name: impl Into<String>, token: u32) -> Self {
        Self {
            name: name.into(),
            token: MethodToken(token),
            flags: MethodFlags::default(),
        }
    }

    pub fn with_flags(mut self, flags: MethodFlags) -> Self {
        self.flags = flags;
        self
    }
}

/// A method descriptor.
///
/// Descriptors live inside a [`MethodDescChunk`] and never move, so
/// precodes may store raw pointers to them.
pub struct MethodDesc {
    name: String,
    token: MethodToken,
    flags: MethodFlags,
    chunk_index: u32,
    allocator: Arc<dyn LoaderAllocator>,
    /// Stable entry point, 0 while unset
    entry_point: AtomicUsize,
    access: AtomicU8,
    #[cfg(feature = "image")]
    zap_module: OnceLock<Weak<ZapModule>>,
}

impl MethodDesc {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn token(&self) -> MethodToken {
        self.token
    }

    pub fn flags(&self) -> MethodFlags {
        self.flags
    }

    pub fn is_dynamic(&self) -> bool {
        self.flags.is_dynamic
    }

    pub fn requires_md_calling_convention(&self) -> bool {
        self.flags.requires_md_calling_convention
    }

    pub fn requires_stable_entry_point(&self) -> bool {
        self.flags.requires_stable_entry_point
    }

    /// Position of this descriptor inside its chunk.
    pub fn chunk_index(&self) -> usize {
        self.chunk_index as usize
    }

    pub fn allocator(&self) -> &Arc<dyn LoaderAllocator> {
        &self.allocator
    }

    pub fn trampolines(&self) -> &Trampolines {
        self.allocator.trampolines()
    }

    /// Address of this descriptor, the value precodes store as back-reference.
    pub fn as_ptr(&self) -> NonNull<MethodDesc> {
        NonNull::from(self)
    }

    pub fn address(&self) -> Pcode {
        self.as_ptr().as_ptr() as Pcode
    }

    /// Address of the first descriptor of the owning chunk.
    pub(crate) fn chunk_base(&self) -> NonNull<MethodDesc> {
        // SAFETY: descriptors are laid out contiguously in their chunk and
        // `chunk_index` is this descriptor's position in it.
        unsafe { self.as_ptr().sub(self.chunk_index as usize) }
    }

    /// The method's stable entry point, if one has been published.
    pub fn method_entry_point(&self) -> Option<Pcode> {
        match self.entry_point.load(Ordering::Acquire) {
            0 => None,
            addr => Some(addr),
        }
    }

    pub fn set_method_entry_point(&self, entry: Pcode) {
        self.entry_point.store(entry, Ordering::Release);
    }

    /// Record a precode access for image placement.
    pub fn record_precode_access(&self, access: PrecodeAccess) {
        self.access.fetch_or(access.bits(), Ordering::Relaxed);
    }

    pub fn precode_access(&self) -> PrecodeAccess {
        PrecodeAccess::from_bits(self.access.load(Ordering::Relaxed))
    }

    /// The first descriptor of the owning chunk.
    pub fn chunk_first(&self) -> &MethodDesc {
        // SAFETY: the chunk outlives each of its descriptors' borrows.
        unsafe { self.chunk_base().as_ref() }
    }

    /// The precompiled module this method was restored from, while it is
    /// still loaded.
    #[cfg(feature = "image")]
    pub fn zap_module(&self) -> Option<Arc<ZapModule>> {
        self.zap_module.get().and_then(Weak::upgrade)
    }

    /// Bind the method to a precompiled module. Returns false if it was
    /// already bound.
    #[cfg(feature = "image")]
    pub fn bind_zap_module(&self, module: &Arc<ZapModule>) -> bool {
        self.zap_module.set(Arc::downgrade(module)).is_ok()
    }
}

impl fmt::Debug for MethodDesc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MethodDesc")
            .field("name", &self.name)
            .field("token", &self.token)
            .field("flags", &self.flags)
            .field("chunk_index", &self.chunk_index)
            .field("entry_point", &self.method_entry_point())
            .finish()
    }
}

/// A batch of method descriptors allocated together.
///
/// This is the unit temporary entry points are allocated for.
pub struct MethodDescChunk {
    methods: Box<[MethodDesc]>,
    allocator: Arc<dyn LoaderAllocator>,
}

impl MethodDescChunk {
    pub fn new(
        allocator: Arc<dyn LoaderAllocator>,
        defs: impl IntoIterator<Item = MethodDef>,
    ) -> Arc<Self> {
        let methods: Box<[MethodDesc]> = defs
            .into_iter()
            .enumerate()
            .map(|(index, def)| MethodDesc {
                name: def.name,
                token: def.token,
                flags: def.flags,
                chunk_index: index as u32,
                allocator: allocator.clone(),
                entry_point: AtomicUsize::new(0),
                access: AtomicU8::new(0),
                #[cfg(feature = "image")]
                zap_module: OnceLock::new(),
            })
            .collect();
        Arc::new(Self { methods, allocator })
    }

    pub fn len(&self) -> usize {
        self.methods.len()
    }

    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&MethodDesc> {
        self.methods.get(index)
    }

    pub fn methods(&self) -> &[MethodDesc] {
        &self.methods
    }

    pub fn iter(&self) -> std::slice::Iter<'_, MethodDesc> {
        self.methods.iter()
    }

    pub fn find(&self, token: MethodToken) -> Option<&MethodDesc> {
        self.methods.iter().find(|md| md.token == token)
    }

    pub fn allocator(&self) -> &Arc<dyn LoaderAllocator> {
        &self.allocator
    }
}

impl std::ops::Index<usize> for MethodDescChunk {
    type Output = MethodDesc;

    fn index(&self, index: usize) -> &MethodDesc {
        &self.methods[index]
    }
}

impl fmt::Debug for MethodDescChunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.methods.iter()).finish()
    }
}
