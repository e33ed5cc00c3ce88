//! Changing the target of a live precode.
//!
//! Writers race with each other and with code executing the stub. Every
//! swap is a single compare-and-swap: at most one writer wins and losers
//! do not retry.

use super::icache::flush_instruction_cache;
use super::variant::Variant;
use super::{Precode, unexpected_precode_type};
use crate::Pcode;
use crate::error::PrecodeError;
use crate::method::PrecodeAccess;

impl<'a> Precode<'a> {
    /// Whether `target` is the prestub or one of its aliases for this
    /// precode's method.
    pub fn is_pointing_to_prestub_target(&self, target: Pcode) -> bool {
        let variant = self.variant("Precode::is_pointing_to_prestub");
        let md = self.method_desc_quiet(&variant, "Precode::is_pointing_to_prestub");
        if md.trampolines().is_prestub_alias(target) {
            return true;
        }
        #[cfg(feature = "image")]
        if let Some(module) = md.zap_module() {
            if target == module.prestub_jump_stub() || target == module.fixup_jump_stub() {
                return true;
            }
        }
        false
    }

    /// Whether the precode currently points at the prestub.
    pub fn is_pointing_to_prestub(&self) -> bool {
        self.is_pointing_to_prestub_target(self.target())
    }

    /// Swap the target to `target`.
    ///
    /// With `only_from_prestub`, the swap happens only while the precode
    /// still points at the prestub or an alias. Returns `Ok(false)` when
    /// that check fails or a concurrent writer won.
    pub fn set_target_interlocked(
        &self,
        target: Pcode,
        only_from_prestub: bool,
    ) -> Result<bool, PrecodeError> {
        debug_assert!(!self.is_zapped(), "zapped precodes are read-only");

        let expected = self.target();
        if only_from_prestub && !self.is_pointing_to_prestub_target(expected) {
            return Ok(false);
        }

        let variant = self.variant("Precode::set_target_interlocked");
        let md = self.method_desc_quiet(&variant, "Precode::set_target_interlocked");
        md.record_precode_access(PrecodeAccess::WRITE);

        let swapped = match variant {
            Variant::Stub(p) | Variant::Remoting(p) | Variant::ThisPtrRetBuf(p) => {
                p.set_target_interlocked(target, expected)
            }
            Variant::Fixup(p) => p.set_target_interlocked(md, target, expected)?,
            Variant::NDirectImport(_) => {
                unexpected_precode_type("Precode::set_target_interlocked", variant.kind())
            }
        };

        if swapped {
            if self.caps.retarget_patches_code {
                flush_instruction_cache(self.entry_point(), self.size());
            }
            log::trace!(
                "precode {:#x} ({}): {:#x} -> {:#x}",
                self.entry_point(),
                variant.kind(),
                expected,
                target
            );
        }

        debug_assert!(
            !swapped || !self.is_pointing_to_prestub() || md.trampolines().is_prestub_alias(target),
            "retargeted precode still points at the prestub"
        );
        Ok(swapped)
    }

    /// Point the precode back at its default trampoline, keeping fixup
    /// indices. Not safe against a concurrent retarget of the same precode.
    pub fn reset(&self) -> Result<(), PrecodeError> {
        debug_assert!(!self.is_zapped(), "zapped precodes are read-only");

        let variant = self.variant("Precode::reset");
        let md = self.method_desc_quiet(&variant, "Precode::reset");
        let target = md.trampolines().default_target(variant.kind());
        match variant {
            Variant::Stub(p)
            | Variant::NDirectImport(p)
            | Variant::Remoting(p)
            | Variant::ThisPtrRetBuf(p) => p.store_target(target),
            Variant::Fixup(p) => p.reset_to(md, target)?,
        }
        flush_instruction_cache(self.entry_point(), self.size());
        Ok(())
    }

    /// Atomically point the precode back at its default trampoline.
    /// Only stub and fixup precodes support this.
    pub fn reset_target_interlocked(&self) -> Result<(), PrecodeError> {
        debug_assert!(!self.is_zapped(), "zapped precodes are read-only");

        let variant = self.variant("Precode::reset_target_interlocked");
        let md = self.method_desc_quiet(&variant, "Precode::reset_target_interlocked");
        let target = md.trampolines().default_target(variant.kind());
        match variant {
            Variant::Stub(p) => {
                p.swap_target(target);
            }
            Variant::Fixup(p) => p.exchange_target(md, target)?,
            _ => unexpected_precode_type("Precode::reset_target_interlocked", variant.kind()),
        }
        if self.caps.retarget_patches_code {
            flush_instruction_cache(self.entry_point(), self.size());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::loader::{LoaderHeap, Trampolines};
    use crate::method::{MethodDef, MethodDescChunk, MethodFlags};
    use crate::precode::{Precode, PrecodeCapabilities, PrecodeKind};
    use std::sync::Arc;

    fn chunk(flags: MethodFlags) -> Arc<MethodDescChunk> {
        let heap = LoaderHeap::with_defaults(Trampolines::for_tests());
        MethodDescChunk::new(heap, [MethodDef::new("Run", 0x0600_0001).with_flags(flags)])
    }

    fn retargetable() -> Vec<(&'static PrecodeCapabilities, PrecodeKind)> {
        let mut all = Vec::new();
        for caps in [&PrecodeCapabilities::X86_64, &PrecodeCapabilities::AARCH64] {
            for kind in [
                PrecodeKind::Stub,
                PrecodeKind::Remoting,
                PrecodeKind::ThisPtrRetBuf,
                PrecodeKind::Fixup,
            ] {
                if caps.is_valid_type(kind) {
                    all.push((caps, kind));
                }
            }
        }
        all
    }

    #[test]
    fn test_retarget_from_prestub() {
        for (caps, kind) in retargetable() {
            let chunk = chunk(MethodFlags::default());
            let md = &chunk[0];
            let precode = Precode::allocate(caps, kind, md).unwrap();
            assert!(precode.is_pointing_to_prestub());

            assert!(precode.set_target_interlocked(0x5555_0000, true).unwrap());
            assert_eq!(precode.target(), 0x5555_0000, "{} on {}", kind, caps.isa);
            assert!(!precode.is_pointing_to_prestub());
            assert!(md.precode_access().written);

            // Guarded retarget no longer applies
            assert!(!precode.set_target_interlocked(0x6666_0000, true).unwrap());
            assert_eq!(precode.target(), 0x5555_0000);

            // Unguarded retarget does
            assert!(precode.set_target_interlocked(0x6666_0000, false).unwrap());
            assert_eq!(precode.target(), 0x6666_0000);
        }
    }

    #[test]
    fn test_reset_restores_default_target() {
        for (caps, kind) in retargetable() {
            let chunk = chunk(MethodFlags::default());
            let md = &chunk[0];
            let precode = Precode::allocate(caps, kind, md).unwrap();
            precode.set_target_interlocked(0x7777_0000, false).unwrap();
            precode.reset().unwrap();
            assert_eq!(precode.target(), md.trampolines().default_target(kind));
            assert_eq!(precode.kind(), kind);
            assert_eq!(precode.method_desc().as_ptr(), md.as_ptr());
        }
    }

    #[test]
    fn test_reset_target_interlocked() {
        for caps in [&PrecodeCapabilities::X86_64, &PrecodeCapabilities::AARCH64] {
            for kind in [PrecodeKind::Stub, PrecodeKind::Fixup] {
                let chunk = chunk(MethodFlags::default());
                let md = &chunk[0];
                let precode = Precode::allocate(caps, kind, md).unwrap();
                precode.set_target_interlocked(0x7777_0000, false).unwrap();
                precode.reset_target_interlocked().unwrap();
                assert!(precode.is_pointing_to_prestub());
            }
        }
    }

    #[test]
    #[should_panic(expected = "unexpected precode type")]
    fn test_ndirect_import_cannot_be_retargeted() {
        let chunk = chunk(MethodFlags::default());
        let caps = &PrecodeCapabilities::X86_64;
        let precode = Precode::allocate(caps, PrecodeKind::NDirectImport, &chunk[0]).unwrap();
        let _ = precode.set_target_interlocked(0x1234, false);
    }

    #[test]
    #[should_panic(expected = "unexpected precode type")]
    fn test_reset_target_interlocked_rejects_remoting() {
        let chunk = chunk(MethodFlags::default());
        let caps = &PrecodeCapabilities::X86_64;
        let precode = Precode::allocate(caps, PrecodeKind::Remoting, &chunk[0]).unwrap();
        let _ = precode.reset_target_interlocked();
    }

    #[test]
    fn test_dynamic_fixup_retarget_through_reserved_stub() {
        let flags = MethodFlags {
            is_dynamic: true,
            ..MethodFlags::default()
        };
        let chunk = chunk(flags);
        let md = &chunk[0];
        let precode =
            Precode::allocate(&PrecodeCapabilities::X86_64, PrecodeKind::Fixup, md).unwrap();

        assert!(precode.set_target_interlocked(0x4444_0000, true).unwrap());
        assert_eq!(precode.target(), 0x4444_0000);
        assert!(precode.set_target_interlocked(0x4545_0000, false).unwrap());
        assert_eq!(precode.target(), 0x4545_0000);
        assert!(md.allocator().jump_stubs().is_empty());

        precode.reset().unwrap();
        assert_eq!(precode.target(), md.trampolines().fixup_thunk);
    }

    #[test]
    fn test_stale_expected_fails() {
        let chunk = chunk(MethodFlags::default());
        let md = &chunk[0];
        let precode =
            Precode::allocate(&PrecodeCapabilities::X86_64, PrecodeKind::Fixup, md).unwrap();
        let Some(layout) = PrecodeCapabilities::X86_64.fixup.as_ref() else {
            unreachable!()
        };
        let member = crate::precode::variant::FixupPrecode::new(
            std::ptr::NonNull::new(precode.entry_point() as *mut u8).unwrap(),
            layout,
        );
        assert!(!member.set_target_interlocked(md, 0x9999_0000, 0xdead).unwrap());
        assert!(!member.is_patched());
        assert!(precode.is_pointing_to_prestub());
    }
}
