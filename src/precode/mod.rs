//! Precodes: small fixed-layout stubs giving each method a stable,
//! retargetable entry point.
//!
//! A precode's kind is never stored separately. It is recovered from the
//! leading eight bytes of the record, which double as executable code.

pub mod aarch64;
pub mod caps;
pub mod icache;
mod retarget;
mod variant;
pub mod x86_64;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::marker::PhantomData;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

pub use caps::{CompactEntryPoints, FixupEncoding, FixupLayout, PrecodeCapabilities, SlotLayout};

use crate::Pcode;
use crate::error::PrecodeError;
use crate::method::{MethodDesc, PrecodeAccess};
use icache::flush_instruction_cache;
use variant::{FixupPrecode, SlotPrecode, Variant};

/// The precode kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum PrecodeKind {
    /// Loads the method desc into a scratch register and jumps to the target.
    Stub,
    /// Like `Stub`, for P/Invoke imports; targets the import thunk.
    NDirectImport,
    /// Calls a remoting check thunk before dispatching.
    Remoting,
    /// Swaps the `this` and return buffer arguments before dispatching.
    ThisPtrRetBuf,
    /// Compact member of a chunk sharing one method desc reference.
    Fixup,
}

impl PrecodeKind {
    pub const ALL: [PrecodeKind; 5] = [
        PrecodeKind::Stub,
        PrecodeKind::NDirectImport,
        PrecodeKind::Remoting,
        PrecodeKind::ThisPtrRetBuf,
        PrecodeKind::Fixup,
    ];

    pub fn name(self) -> &'static str {
        match self {
            PrecodeKind::Stub => "Stub",
            PrecodeKind::NDirectImport => "NDirectImport",
            PrecodeKind::Remoting => "Remoting",
            PrecodeKind::ThisPtrRetBuf => "ThisPtrRetBuf",
            PrecodeKind::Fixup => "Fixup",
        }
    }
}

impl fmt::Display for PrecodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Instruction set a capability table targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Isa {
    #[serde(rename = "x86-64")]
    X86_64,
    #[serde(rename = "aarch64")]
    Aarch64,
}

impl Isa {
    pub fn host() -> Isa {
        #[cfg(target_arch = "aarch64")]
        {
            Isa::Aarch64
        }
        #[cfg(not(target_arch = "aarch64"))]
        {
            Isa::X86_64
        }
    }
}

impl fmt::Display for Isa {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Isa::X86_64 => f.write_str("x86-64"),
            Isa::Aarch64 => f.write_str("aarch64"),
        }
    }
}

/// Abort on a precode that should exist but does not decode.
#[cold]
pub(crate) fn unexpected_precode_type(op: &str, what: impl fmt::Display) -> ! {
    log::error!("{}: unexpected precode type {}", op, what);
    panic!("{}: unexpected precode type {}", op, what);
}

/// Follow a jump stub a rel32 fixup member branches through, when the
/// method's allocator or zapped module owns it.
pub(crate) fn follow_jump_stub(md: &MethodDesc, target: Pcode) -> Pcode {
    let owned = md.allocator().jump_stubs().contains(target) || owned_by_zap_module(md, target);
    if owned {
        // SAFETY: owned jump stubs stay mapped as long as their owner.
        if let Some(next) = unsafe { x86_64::jump_stub_target(target as *const u8) } {
            return next;
        }
    }
    target
}

#[cfg(feature = "image")]
fn owned_by_zap_module(md: &MethodDesc, target: Pcode) -> bool {
    md.zap_module().is_some_and(|m| m.owns_jump_stub(target))
}

#[cfg(not(feature = "image"))]
fn owned_by_zap_module(_md: &MethodDesc, _target: Pcode) -> bool {
    false
}

/// A live precode record.
///
/// This is a handle to memory owned by a loader allocator; `'a` bounds
/// how long that memory and its method descs are known to live.
#[derive(Clone, Copy)]
pub struct Precode<'a> {
    addr: NonNull<u8>,
    caps: &'static PrecodeCapabilities,
    _marker: PhantomData<&'a MethodDesc>,
}

// Precode memory is only read and written through atomics.
unsafe impl Send for Precode<'_> {}
unsafe impl Sync for Precode<'_> {}

impl<'a> Precode<'a> {
    /// View the precode at `entry`.
    ///
    /// # Safety
    /// `entry` must be the start of an initialized precode laid out per
    /// `caps`, which stays valid (with its method desc) for `'a`.
    pub unsafe fn from_entry_point(
        caps: &'static PrecodeCapabilities,
        entry: Pcode,
    ) -> Precode<'a> {
        match NonNull::new(entry as *mut u8) {
            Some(addr) => Precode {
                addr,
                caps,
                _marker: PhantomData,
            },
            None => unexpected_precode_type("Precode::from_entry_point", "at null address"),
        }
    }

    /// Like [`from_entry_point`](Self::from_entry_point), but returns `None`
    /// when the bytes at `entry` are not a precode.
    ///
    /// # Safety
    /// `entry` must be readable for 8 bytes and 8-byte aligned; if it is a
    /// precode, the requirements of `from_entry_point` apply.
    pub unsafe fn try_from_entry_point(
        caps: &'static PrecodeCapabilities,
        entry: Pcode,
    ) -> Option<Precode<'a>> {
        if entry == 0 || entry % caps.alignment != 0 {
            return None;
        }
        let precode = unsafe { Self::from_entry_point(caps, entry) };
        precode.try_kind().map(|_| precode)
    }

    pub fn entry_point(&self) -> Pcode {
        self.addr.as_ptr() as Pcode
    }

    pub fn capabilities(&self) -> &'static PrecodeCapabilities {
        self.caps
    }

    fn leading_bytes(&self) -> [u8; 8] {
        // SAFETY: records are 8-byte aligned and at least 8 bytes long.
        let word = unsafe { &*(self.addr.as_ptr() as *const AtomicU64) };
        word.load(Ordering::Acquire).to_le_bytes()
    }

    /// The kind decoded from the record, or `None` if it is not a precode.
    pub fn try_kind(&self) -> Option<PrecodeKind> {
        self.caps.classify(&self.leading_bytes())
    }

    pub fn kind(&self) -> PrecodeKind {
        match self.try_kind() {
            Some(kind) => kind,
            None => unexpected_precode_type(
                "Precode::kind",
                format_args!("at {:#x}", self.entry_point()),
            ),
        }
    }

    pub fn size(&self) -> usize {
        let kind = self.kind();
        self.caps
            .size_of(kind)
            .unwrap_or_else(|| unexpected_precode_type("Precode::size", kind))
    }

    fn variant_for(&self, kind: PrecodeKind) -> Option<Variant<'a>> {
        let caps: &'static PrecodeCapabilities = self.caps;
        let slot = |layout: &'static Option<SlotLayout>| {
            layout.as_ref().map(|l| SlotPrecode::new(self.addr, l))
        };
        Some(match kind {
            PrecodeKind::Stub => Variant::Stub(SlotPrecode::new(self.addr, &caps.stub)),
            PrecodeKind::NDirectImport => Variant::NDirectImport(slot(&caps.ndirect_import)?),
            PrecodeKind::Remoting => Variant::Remoting(slot(&caps.remoting)?),
            PrecodeKind::ThisPtrRetBuf => Variant::ThisPtrRetBuf(slot(&caps.this_ptr_ret_buf)?),
            PrecodeKind::Fixup => {
                Variant::Fixup(FixupPrecode::new(self.addr, caps.fixup.as_ref()?))
            }
        })
    }

    fn try_variant(&self) -> Option<Variant<'a>> {
        self.variant_for(self.try_kind()?)
    }

    pub(crate) fn variant(&self, op: &str) -> Variant<'a> {
        match self.try_variant() {
            Some(v) => v,
            None => unexpected_precode_type(op, format_args!("at {:#x}", self.entry_point())),
        }
    }

    /// The owning method desc, or `None` when the record is not a precode
    /// or has no back-reference. Never records an access.
    pub fn method_desc_speculative(&self) -> Option<NonNull<MethodDesc>> {
        self.try_variant()?.method_desc_ptr()
    }

    /// The owning method desc. Records a precode read for image placement.
    pub fn method_desc(&self) -> &'a MethodDesc {
        let variant = self.variant("Precode::method_desc");
        let Some(md) = variant.method_desc_ptr() else {
            unexpected_precode_type("Precode::method_desc", variant.kind());
        };
        // SAFETY: precodes only reference method descs that outlive them.
        let md: &'a MethodDesc = unsafe { md.as_ref() };
        md.record_precode_access(PrecodeAccess::READ);
        md
    }

    fn method_desc_quiet(&self, variant: &Variant<'a>, op: &str) -> &'a MethodDesc {
        match variant.method_desc_ptr() {
            // SAFETY: as in `method_desc`.
            Some(md) => unsafe { md.as_ref() },
            None => unexpected_precode_type(op, variant.kind()),
        }
    }

    /// Whether this precode belongs to `md`. Fixup members without a
    /// resolvable shared reference are accepted.
    pub fn is_correct_method_desc(&self, md: &MethodDesc) -> bool {
        match self.method_desc_speculative() {
            Some(found) => found == md.as_ptr(),
            None => self.try_kind() == Some(PrecodeKind::Fixup),
        }
    }

    /// Address of the shared method desc slot, for fixup members.
    pub fn fixup_shared_slot(&self) -> Option<Pcode> {
        match self.try_variant()? {
            Variant::Fixup(p) => Some(p.shared_slot()),
            _ => None,
        }
    }

    /// Whether the precode lives in a loaded precompiled module.
    pub fn is_zapped(&self) -> bool {
        #[cfg(feature = "image")]
        {
            let Some(md) = self.method_desc_speculative() else {
                return false;
            };
            // SAFETY: as in `method_desc`.
            let md = unsafe { md.as_ref() };
            md.zap_module()
                .is_some_and(|m| m.is_zapped_precode(self.entry_point()))
        }
        #[cfg(not(feature = "image"))]
        {
            false
        }
    }

    /// The current target. Jump stubs a rel32 fixup member branches through
    /// are followed; slot targets are returned as stored. For zapped
    /// precodes the method's stable entry point wins when it is set and is
    /// not this precode.
    pub fn target(&self) -> Pcode {
        let variant = self.variant("Precode::target");
        let md = self.method_desc_quiet(&variant, "Precode::target");

        let prefers_entry_point =
            matches!(variant, Variant::Stub(_) | Variant::Remoting(_) | Variant::Fixup(_));
        if prefers_entry_point && self.is_zapped() {
            if let Some(entry) = md.method_entry_point() {
                if entry != self.entry_point() {
                    return entry;
                }
            }
        }

        match variant {
            Variant::Stub(p)
            | Variant::NDirectImport(p)
            | Variant::Remoting(p)
            | Variant::ThisPtrRetBuf(p) => p.target(),
            Variant::Fixup(p) => p.target(md),
        }
    }

    /// Allocate and initialize a single precode of `kind` for `md` from the
    /// method's allocator.
    pub fn allocate(
        caps: &'static PrecodeCapabilities,
        kind: PrecodeKind,
        md: &'a MethodDesc,
    ) -> Result<Precode<'a>, PrecodeError> {
        if !caps.is_valid_type(kind) {
            return Err(PrecodeError::UnsupportedKind { kind, isa: caps.isa });
        }
        let allocator = md.allocator();

        let (size, reserved_stub) = match (kind, caps.fixup) {
            (PrecodeKind::Fixup, Some(fixup)) => {
                let stub = fixup.dynamic_jump_stub_size.filter(|_| md.is_dynamic());
                (fixup.size + size_of::<usize>() + stub.unwrap_or(0), stub.is_some())
            }
            _ => (caps.size_of(kind).unwrap_or(0), false),
        };

        let ptr = allocator.alloc_aligned_mem(size, caps.align_of(kind))?;
        // SAFETY: freshly allocated, zeroed, exclusively ours until returned.
        let precode = unsafe { Self::from_entry_point(caps, ptr.as_ptr() as Pcode) };

        if kind == PrecodeKind::Fixup {
            let fixup = caps.fixup.as_ref().map(|f| f.size).unwrap_or(0);
            let shared = precode.entry_point() + fixup;
            // SAFETY: the shared slot and reserved stub follow the member.
            unsafe {
                (*(shared as *const AtomicUsize)).store(md.address(), Ordering::Release);
                if reserved_stub {
                    x86_64::emit_jump_stub((shared + size_of::<usize>()) as *mut u8, 0);
                }
            }
            // The shared slot points at `md` itself, so its index is 0.
            unsafe { precode.init_fixup(md, 0, 0)? };
        } else {
            unsafe { precode.init_slot(kind, md) };
        }

        flush_instruction_cache(precode.entry_point(), size);
        log::debug!(
            target: "precode::perfmap",
            "{:#x} {:#x} Precode::allocate {}",
            precode.entry_point(),
            size,
            kind
        );
        Ok(precode)
    }

    /// # Safety
    /// The record must be writable and unpublished, sized for `kind`.
    pub(crate) unsafe fn init_slot(&self, kind: PrecodeKind, md: &MethodDesc) {
        let Some(layout) = self.caps.slot_layout(kind) else {
            unexpected_precode_type("Precode::init", kind);
        };
        let trampolines = md.trampolines();
        let thunk = (kind == PrecodeKind::Remoting).then_some(trampolines.remoting_check_thunk);
        let target = trampolines.default_target(kind);
        unsafe { SlotPrecode::new(self.addr, layout).init(md, target, thunk) };
    }

    /// # Safety
    /// The record must be a writable, unpublished fixup member whose shared
    /// slot (and reserved jump stub, if any) is already written.
    pub(crate) unsafe fn init_fixup(
        &self,
        md: &MethodDesc,
        method_desc_index: u8,
        precode_index: u8,
    ) -> Result<(), PrecodeError> {
        let Some(layout) = self.caps.fixup.as_ref() else {
            unexpected_precode_type("Precode::init", PrecodeKind::Fixup);
        };
        let target = md.trampolines().default_target(PrecodeKind::Fixup);
        unsafe {
            FixupPrecode::new(self.addr, layout).init(md, target, method_desc_index, precode_index)
        }
    }
}

impl fmt::Debug for Precode<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Precode")
            .field("addr", &format_args!("{:#x}", self.entry_point()))
            .field("kind", &self.try_kind())
            .finish()
    }
}
