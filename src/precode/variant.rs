//! Per-kind precode primitives.
//!
//! A [`Variant`] is a typed view of one record, built from the kind decoded
//! out of its leading bytes. All mutable words are accessed atomically.

use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};

use super::caps::{FixupEncoding, FixupLayout, SlotLayout};
use super::x86_64::{self, FIXUP_REL32_END, FixupWord};
use super::{PrecodeKind, unexpected_precode_type};
use crate::Pcode;
use crate::error::PrecodeError;
use crate::method::MethodDesc;

/// # Safety
/// `addr` must be pointer aligned and stay valid for `'a`.
unsafe fn slot<'a>(addr: *mut u8) -> &'a AtomicUsize {
    unsafe { &*(addr as *const AtomicUsize) }
}

#[derive(Clone, Copy)]
pub(crate) enum Variant<'a> {
    Stub(SlotPrecode<'a>),
    NDirectImport(SlotPrecode<'a>),
    Remoting(SlotPrecode<'a>),
    ThisPtrRetBuf(SlotPrecode<'a>),
    Fixup(FixupPrecode<'a>),
}

impl<'a> Variant<'a> {
    pub(crate) fn kind(&self) -> PrecodeKind {
        match self {
            Variant::Stub(_) => PrecodeKind::Stub,
            Variant::NDirectImport(_) => PrecodeKind::NDirectImport,
            Variant::Remoting(_) => PrecodeKind::Remoting,
            Variant::ThisPtrRetBuf(_) => PrecodeKind::ThisPtrRetBuf,
            Variant::Fixup(_) => PrecodeKind::Fixup,
        }
    }

    pub(crate) fn method_desc_ptr(&self) -> Option<NonNull<MethodDesc>> {
        match self {
            Variant::Stub(p)
            | Variant::NDirectImport(p)
            | Variant::Remoting(p)
            | Variant::ThisPtrRetBuf(p) => p.method_desc_ptr(),
            Variant::Fixup(p) => p.method_desc_ptr(),
        }
    }
}

/// A precode that jumps through an absolute target slot.
#[derive(Clone, Copy)]
pub(crate) struct SlotPrecode<'a> {
    base: NonNull<u8>,
    layout: &'a SlotLayout,
}

impl<'a> SlotPrecode<'a> {
    pub(crate) fn new(base: NonNull<u8>, layout: &'a SlotLayout) -> Self {
        Self { base, layout }
    }

    fn word(&self, offset: usize) -> &'a AtomicUsize {
        // SAFETY: slot offsets are pointer aligned inside the record.
        unsafe { slot(self.base.as_ptr().add(offset)) }
    }

    /// Write the template and all slots.
    ///
    /// # Safety
    /// The record must be writable and not yet published.
    pub(crate) unsafe fn init(&self, md: &MethodDesc, target: Pcode, thunk: Option<Pcode>) {
        let template = self.layout.template;
        unsafe {
            std::ptr::copy_nonoverlapping(template.as_ptr(), self.base.as_ptr(), template.len());
        }
        self.word(self.layout.method_desc_offset)
            .store(md.address(), Ordering::Relaxed);
        if let (Some(offset), Some(thunk)) = (self.layout.thunk_offset, thunk) {
            self.word(offset).store(thunk, Ordering::Relaxed);
        }
        self.word(self.layout.target_offset)
            .store(target, Ordering::Release);
    }

    pub(crate) fn target(&self) -> Pcode {
        self.word(self.layout.target_offset).load(Ordering::Acquire)
    }

    #[cfg(test)]
    pub(crate) fn thunk(&self) -> Option<Pcode> {
        self.layout
            .thunk_offset
            .map(|offset| self.word(offset).load(Ordering::Acquire))
    }

    pub(crate) fn method_desc_ptr(&self) -> Option<NonNull<MethodDesc>> {
        let md = self.word(self.layout.method_desc_offset).load(Ordering::Acquire);
        NonNull::new(md as *mut MethodDesc)
    }

    pub(crate) fn set_target_interlocked(&self, target: Pcode, expected: Pcode) -> bool {
        self.word(self.layout.target_offset)
            .compare_exchange(expected, target, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub(crate) fn store_target(&self, target: Pcode) {
        self.word(self.layout.target_offset)
            .store(target, Ordering::Release);
    }

    pub(crate) fn swap_target(&self, target: Pcode) -> Pcode {
        self.word(self.layout.target_offset)
            .swap(target, Ordering::AcqRel)
    }
}

/// One member of a fixup precode chunk.
///
/// The owning method is found through a slot shared by the chunk, located
/// `(precode_index + 1)` members past this one.
#[derive(Clone, Copy)]
pub(crate) struct FixupPrecode<'a> {
    base: NonNull<u8>,
    layout: &'a FixupLayout,
}

impl<'a> FixupPrecode<'a> {
    pub(crate) fn new(base: NonNull<u8>, layout: &'a FixupLayout) -> Self {
        Self { base, layout }
    }

    fn addr(&self) -> Pcode {
        self.base.as_ptr() as Pcode
    }

    fn rel32_word(&self) -> &'a std::sync::atomic::AtomicU64 {
        // SAFETY: members are 8-byte aligned.
        unsafe { x86_64::fixup_word(self.base.as_ptr()) }
    }

    fn decode(&self) -> FixupWord {
        match FixupWord::decode(self.rel32_word().load(Ordering::Acquire)) {
            Some(word) => word,
            None => unexpected_precode_type("FixupPrecode::decode", "corrupt fixup word"),
        }
    }

    /// (method desc index, precode index)
    pub(crate) fn indices(&self) -> (u8, u8) {
        match self.layout.encoding {
            FixupEncoding::Rel32 => {
                let word = self.decode();
                (word.method_desc_index, word.precode_index)
            }
            // Index bytes of slot encodings are never rewritten after init.
            FixupEncoding::Slot { .. } => unsafe {
                (
                    *self.base.as_ptr().add(self.layout.method_desc_index_offset),
                    *self.base.as_ptr().add(self.layout.precode_index_offset),
                )
            },
        }
    }

    /// Address of the shared method desc slot.
    pub(crate) fn shared_slot(&self) -> Pcode {
        let (_, precode_index) = self.indices();
        self.addr() + (precode_index as usize + 1) * self.layout.size
    }

    pub(crate) fn method_desc_ptr(&self) -> Option<NonNull<MethodDesc>> {
        let (md_index, _) = self.indices();
        // SAFETY: the shared slot follows the last member and is aligned.
        let base = unsafe { slot(self.shared_slot() as *mut u8) }.load(Ordering::Acquire);
        let base = NonNull::new(base as *mut MethodDesc)?;
        // SAFETY: the shared slot holds the first descriptor of a chunk with
        // at least `md_index + 1` entries.
        Some(unsafe { base.add(md_index as usize) })
    }

    /// The jump stub reserved for this member, if its chunk has them.
    pub(crate) fn own_jump_stub(&self, md: &MethodDesc) -> Option<Pcode> {
        let stub_size = self.layout.dynamic_jump_stub_size?;
        if !md.is_dynamic() {
            return None;
        }
        let (_, precode_index) = self.indices();
        Some(self.shared_slot() + size_of::<usize>() + precode_index as usize * stub_size)
    }

    /// The target as encoded, without following jump stubs.
    pub(crate) fn raw_target(&self) -> Pcode {
        match self.layout.encoding {
            FixupEncoding::Rel32 => self.decode().destination(self.addr()),
            FixupEncoding::Slot { target_offset, .. } => unsafe {
                slot(self.base.as_ptr().add(target_offset)).load(Ordering::Acquire)
            },
        }
    }

    /// Whether the member already jumps to its final target.
    #[cfg(test)]
    pub(crate) fn is_patched(&self) -> bool {
        match self.layout.encoding {
            FixupEncoding::Rel32 => self.decode().patched,
            FixupEncoding::Slot { .. } => false,
        }
    }

    /// The target, following the jump stub a rel32 member branches through.
    /// Slot encodings hold the absolute target.
    pub(crate) fn target(&self, md: &MethodDesc) -> Pcode {
        let raw = self.raw_target();
        if let FixupEncoding::Slot { .. } = self.layout.encoding {
            return raw;
        }
        match self.own_jump_stub(md) {
            // SAFETY: the reserved stub lives in the chunk allocation.
            Some(stub) if stub == raw => {
                unsafe { x86_64::jump_stub_slot(stub as *const u8) }.load(Ordering::Acquire)
            }
            _ => super::follow_jump_stub(md, raw),
        }
    }

    /// Encode a member word branching to `target`, routing through a jump
    /// stub when rel32 cannot reach it.
    fn encode_rel32(
        &self,
        md: &MethodDesc,
        target: Pcode,
        patched: bool,
        indices: (u8, u8),
    ) -> Result<u64, PrecodeError> {
        let from = self.addr() + FIXUP_REL32_END;
        let via = if x86_64::rel32_reaches(from, target) {
            target
        } else if let Some(stub) = self.own_jump_stub(md) {
            // SAFETY: the reserved stub lives in the chunk allocation.
            unsafe { x86_64::jump_stub_slot(stub as *const u8) }.store(target, Ordering::Release);
            stub
        } else {
            let allocator = md.allocator();
            allocator.jump_stubs().get_or_create(allocator.as_ref(), target, from)?
        };
        let rel32 =
            x86_64::rel32(from, via).ok_or(PrecodeError::TargetOutOfRange { from, target })?;
        Ok(FixupWord {
            patched,
            rel32,
            method_desc_index: indices.0,
            precode_index: indices.1,
        }
        .encode())
    }

    /// Write the member.
    ///
    /// # Safety
    /// The record must be writable and not yet published; for dynamic
    /// methods the reserved jump stub must already be emitted.
    pub(crate) unsafe fn init(
        &self,
        md: &MethodDesc,
        target: Pcode,
        method_desc_index: u8,
        precode_index: u8,
    ) -> Result<(), PrecodeError> {
        match self.layout.encoding {
            FixupEncoding::Rel32 => {
                let indices = (method_desc_index, precode_index);
                let word = self.encode_rel32(md, target, false, indices)?;
                self.rel32_word().store(word, Ordering::Release);
            }
            FixupEncoding::Slot { template, target_offset } => unsafe {
                let base = self.base.as_ptr();
                std::ptr::copy_nonoverlapping(template.as_ptr(), base, template.len());
                *base.add(self.layout.method_desc_index_offset) = method_desc_index;
                *base.add(self.layout.precode_index_offset) = precode_index;
                slot(base.add(target_offset)).store(target, Ordering::Release);
            },
        }
        Ok(())
    }

    /// Re-point the member at `target` in place, keeping its indices.
    pub(crate) fn reset_to(&self, md: &MethodDesc, target: Pcode) -> Result<(), PrecodeError> {
        match self.layout.encoding {
            FixupEncoding::Rel32 => {
                if let Some(stub) = self.own_jump_stub(md) {
                    unsafe { x86_64::jump_stub_slot(stub as *const u8) }
                        .store(0, Ordering::Release);
                }
                let word = self.encode_rel32(md, target, false, self.indices())?;
                self.rel32_word().store(word, Ordering::Release);
            }
            FixupEncoding::Slot { target_offset, .. } => unsafe {
                slot(self.base.as_ptr().add(target_offset)).store(target, Ordering::Release);
            },
        }
        Ok(())
    }

    /// Atomically re-point the member at `target` regardless of its
    /// current value.
    pub(crate) fn exchange_target(
        &self,
        md: &MethodDesc,
        target: Pcode,
    ) -> Result<(), PrecodeError> {
        match self.layout.encoding {
            FixupEncoding::Rel32 => {
                let word = self.encode_rel32(md, target, false, self.indices())?;
                let old = self.rel32_word().swap(word, Ordering::AcqRel);
                // Release the reserved stub if the new word no longer uses it.
                if let Some(stub) = self.own_jump_stub(md) {
                    let old_dest = FixupWord::decode(old).map(|w| w.destination(self.addr()));
                    let new_dest = FixupWord::decode(word).map(|w| w.destination(self.addr()));
                    if old_dest == Some(stub) && new_dest != Some(stub) {
                        unsafe { x86_64::jump_stub_slot(stub as *const u8) }
                            .store(0, Ordering::Release);
                    }
                }
            }
            FixupEncoding::Slot { target_offset, .. } => unsafe {
                slot(self.base.as_ptr().add(target_offset)).swap(target, Ordering::AcqRel);
            },
        }
        Ok(())
    }

    /// Compare-and-swap the target. `expected` is the logical target, after
    /// following this member's own jump stub.
    pub(crate) fn set_target_interlocked(
        &self,
        md: &MethodDesc,
        target: Pcode,
        expected: Pcode,
    ) -> Result<bool, PrecodeError> {
        if let FixupEncoding::Slot { target_offset, .. } = self.layout.encoding {
            let word = unsafe { slot(self.base.as_ptr().add(target_offset)) };
            return Ok(word
                .compare_exchange(expected, target, Ordering::AcqRel, Ordering::Acquire)
                .is_ok());
        }

        let word = self.rel32_word();
        let old = word.load(Ordering::Acquire);
        let Some(decoded) = FixupWord::decode(old) else {
            unexpected_precode_type("FixupPrecode::set_target_interlocked", "corrupt fixup word");
        };
        let member = self.addr();
        let from = member + FIXUP_REL32_END;
        let raw = decoded.destination(member);
        let own_stub = self.own_jump_stub(md);

        if let Some(stub) = own_stub.filter(|&stub| stub == raw) {
            // Already routed through the reserved stub: swap its target.
            let stub_slot = unsafe { x86_64::jump_stub_slot(stub as *const u8) };
            if stub_slot
                .compare_exchange(expected, target, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                return Ok(false);
            }
            if !decoded.patched {
                let patched = FixupWord { patched: true, ..decoded }.encode();
                let _ = word.compare_exchange(old, patched, Ordering::AcqRel, Ordering::Acquire);
            }
            return Ok(true);
        }

        if super::follow_jump_stub(md, raw) != expected {
            return Ok(false);
        }

        let new_word = |rel32| FixupWord { patched: true, rel32, ..decoded }.encode();

        if let Some(rel32) = x86_64::rel32(from, target) {
            return Ok(word
                .compare_exchange(old, new_word(rel32), Ordering::AcqRel, Ordering::Acquire)
                .is_ok());
        }

        if let Some(stub) = own_stub {
            // Claim the reserved stub; a non-zero slot means another writer
            // is mid-swap.
            let stub_slot = unsafe { x86_64::jump_stub_slot(stub as *const u8) };
            if stub_slot
                .compare_exchange(0, target, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                return Ok(false);
            }
            let Some(rel32) = x86_64::rel32(from, stub) else {
                stub_slot.store(0, Ordering::Release);
                return Err(PrecodeError::TargetOutOfRange { from, target });
            };
            if word
                .compare_exchange(old, new_word(rel32), Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                stub_slot.store(0, Ordering::Release);
                return Ok(false);
            }
            return Ok(true);
        }

        let allocator = md.allocator();
        let stub = allocator.jump_stubs().get_or_create(allocator.as_ref(), target, from)?;
        let rel32 =
            x86_64::rel32(from, stub).ok_or(PrecodeError::TargetOutOfRange { from, target })?;
        Ok(word
            .compare_exchange(old, new_word(rel32), Ordering::AcqRel, Ordering::Acquire)
            .is_ok())
    }
}
