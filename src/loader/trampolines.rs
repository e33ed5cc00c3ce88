use serde::{Deserialize, Serialize};

use crate::Pcode;
use crate::precode::PrecodeKind;

/// Well-known runtime entry points a fresh precode can target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TrampolineKind {
    Prestub,
    FixupThunk,
    NDirectImportThunk,
    RemotingCheckThunk,
}

impl TrampolineKind {
    pub const ALL: [TrampolineKind; 4] = [
        TrampolineKind::Prestub,
        TrampolineKind::FixupThunk,
        TrampolineKind::NDirectImportThunk,
        TrampolineKind::RemotingCheckThunk,
    ];
}

/// Addresses of the runtime trampolines, supplied along with the allocator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Trampolines {
    /// Generic "compile then dispatch" entry
    pub prestub: Pcode,
    /// Prestub alias used by fixup precodes; it locates its precode from the
    /// return address pushed by the member's `call`.
    pub fixup_thunk: Pcode,
    pub ndirect_import_thunk: Pcode,
    pub remoting_check_thunk: Pcode,
}

impl Trampolines {
    pub fn address(&self, kind: TrampolineKind) -> Pcode {
        match kind {
            TrampolineKind::Prestub => self.prestub,
            TrampolineKind::FixupThunk => self.fixup_thunk,
            TrampolineKind::NDirectImportThunk => self.ndirect_import_thunk,
            TrampolineKind::RemotingCheckThunk => self.remoting_check_thunk,
        }
    }

    /// Which trampoline, if any, lives at `addr`.
    pub fn kind_of(&self, addr: Pcode) -> Option<TrampolineKind> {
        TrampolineKind::ALL
            .into_iter()
            .find(|&kind| self.address(kind) == addr)
    }

    /// The target a freshly initialized precode of `kind` points at.
    pub fn default_target(&self, kind: PrecodeKind) -> Pcode {
        match kind {
            PrecodeKind::Fixup => self.fixup_thunk,
            PrecodeKind::NDirectImport => self.ndirect_import_thunk,
            PrecodeKind::Stub | PrecodeKind::Remoting | PrecodeKind::ThisPtrRetBuf => self.prestub,
        }
    }

    /// The prestub or one of its known aliases.
    pub fn is_prestub_alias(&self, addr: Pcode) -> bool {
        addr == self.prestub || addr == self.fixup_thunk
    }

    /// Distinct fake addresses for tests that never execute stubs.
    pub fn for_tests() -> Self {
        Trampolines {
            prestub: 0x1000_1000,
            fixup_thunk: 0x1000_2000,
            ndirect_import_thunk: 0x1000_3000,
            remoting_check_thunk: 0x1000_4000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_targets() {
        let t = Trampolines::for_tests();
        assert_eq!(t.default_target(PrecodeKind::Stub), t.prestub);
        assert_eq!(t.default_target(PrecodeKind::Fixup), t.fixup_thunk);
        assert_eq!(t.default_target(PrecodeKind::NDirectImport), t.ndirect_import_thunk);
        assert!(t.is_prestub_alias(t.fixup_thunk));
        assert!(!t.is_prestub_alias(t.ndirect_import_thunk));
    }

    #[test]
    fn test_kind_of() {
        let t = Trampolines::for_tests();
        assert_eq!(t.kind_of(t.remoting_check_thunk), Some(TrampolineKind::RemotingCheckThunk));
        assert_eq!(t.kind_of(0x42), None);
    }
}
