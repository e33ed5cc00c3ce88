//! x86-64 precode templates and encodings.
//!
//! Every slot-based template loads its method descriptor into a scratch
//! register (or shuffles arguments) and jumps through an absolute target
//! slot addressed RIP-relative. Fixup members are a single 8-byte word
//! holding a `call`/`jmp rel32` so retargeting swaps the whole record.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use super::caps::{FixupEncoding, FixupLayout, SlotLayout};
use crate::Pcode;

const INT3: u8 = 0xCC;

/// `mov r10, [rip+9]; jmp [rip+11]; int3 x3; md; target`
pub const STUB_TEMPLATE: [u8; 16] = [
    0x4C, 0x8B, 0x15, 0x09, 0x00, 0x00, 0x00, // mov r10, [rip+9]  -> md
    0xFF, 0x25, 0x0B, 0x00, 0x00, 0x00, // jmp [rip+11]      -> target
    INT3, INT3, INT3,
];

/// `mov r11, [rip+9]; jmp [rip+11]; int3 x3; md; target`
pub const NDIRECT_IMPORT_TEMPLATE: [u8; 16] = [
    0x4C, 0x8B, 0x1D, 0x09, 0x00, 0x00, 0x00, // mov r11, [rip+9]  -> md
    0xFF, 0x25, 0x0B, 0x00, 0x00, 0x00, // jmp [rip+11]      -> target
    INT3, INT3, INT3,
];

/// `call [rip+18]; mov r10, [rip+19]; jmp [rip+21]; int3 x5; thunk; md; target`
pub const REMOTING_TEMPLATE: [u8; 24] = [
    0xFF, 0x15, 0x12, 0x00, 0x00, 0x00, // call [rip+18]     -> thunk
    0x4C, 0x8B, 0x15, 0x13, 0x00, 0x00, 0x00, // mov r10, [rip+19] -> md
    0xFF, 0x25, 0x15, 0x00, 0x00, 0x00, // jmp [rip+21]      -> target
    INT3, INT3, INT3, INT3, INT3,
];

/// Swap `this` (rdi) and the return buffer (rsi), then jump.
pub const THIS_PTR_RET_BUF_TEMPLATE: [u8; 16] = [
    0x48, 0x89, 0xF8, // mov rax, rdi
    0x48, 0x89, 0xF7, // mov rdi, rsi
    0x48, 0x89, 0xC6, // mov rsi, rax
    0xFF, 0x25, 0x09, 0x00, 0x00, 0x00, // jmp [rip+9] -> target
    INT3,
];

pub const STUB: SlotLayout = SlotLayout {
    template: &STUB_TEMPLATE,
    size: 32,
    method_desc_offset: 16,
    target_offset: 24,
    thunk_offset: None,
};

pub const NDIRECT_IMPORT: SlotLayout = SlotLayout {
    template: &NDIRECT_IMPORT_TEMPLATE,
    ..STUB
};

pub const REMOTING: SlotLayout = SlotLayout {
    template: &REMOTING_TEMPLATE,
    size: 48,
    method_desc_offset: 32,
    target_offset: 40,
    thunk_offset: Some(24),
};

pub const THIS_PTR_RET_BUF: SlotLayout = SlotLayout {
    template: &THIS_PTR_RET_BUF_TEMPLATE,
    ..STUB
};

pub const FIXUP: FixupLayout = FixupLayout {
    size: FIXUP_SIZE,
    method_desc_index_offset: 6,
    precode_index_offset: 7,
    encoding: FixupEncoding::Rel32,
    dynamic_jump_stub_size: Some(JUMP_STUB_SIZE),
};

// ==================== Fixup members ====================

pub const FIXUP_SIZE: usize = 8;

const CALL_REL32: u8 = 0xE8;
const JMP_REL32: u8 = 0xE9;

/// Type byte of a member that still calls its thunk (`pop rsi`).
pub const FIXUP_TYPE_PRESTUB: u8 = 0x5E;
/// Type byte of a patched member (`pop rdi`).
pub const FIXUP_TYPE_PATCHED: u8 = 0x5F;

/// Offset of the end of the rel32 operand, the origin of the displacement.
pub const FIXUP_REL32_END: usize = 5;

/// Decoded fixup member word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixupWord {
    pub patched: bool,
    pub rel32: i32,
    pub method_desc_index: u8,
    pub precode_index: u8,
}

impl FixupWord {
    pub fn encode(self) -> u64 {
        let mut bytes = [0u8; 8];
        bytes[0] = if self.patched { JMP_REL32 } else { CALL_REL32 };
        bytes[1..5].copy_from_slice(&self.rel32.to_le_bytes());
        bytes[5] = if self.patched {
            FIXUP_TYPE_PATCHED
        } else {
            FIXUP_TYPE_PRESTUB
        };
        bytes[6] = self.method_desc_index;
        bytes[7] = self.precode_index;
        u64::from_le_bytes(bytes)
    }

    pub fn decode(word: u64) -> Option<FixupWord> {
        let bytes = word.to_le_bytes();
        if !is_fixup(&bytes) {
            return None;
        }
        Some(FixupWord {
            patched: bytes[0] == JMP_REL32,
            rel32: i32::from_le_bytes([bytes[1], bytes[2], bytes[3], bytes[4]]),
            method_desc_index: bytes[6],
            precode_index: bytes[7],
        })
    }

    /// Absolute destination of the branch for a member at `member`.
    pub fn destination(self, member: Pcode) -> Pcode {
        (member + FIXUP_REL32_END).wrapping_add_signed(self.rel32 as isize)
    }
}

/// Whether the leading bytes are a fixup member.
pub fn is_fixup(bytes: &[u8; 8]) -> bool {
    matches!(bytes[0], CALL_REL32 | JMP_REL32)
        && matches!(bytes[5], FIXUP_TYPE_PRESTUB | FIXUP_TYPE_PATCHED)
}

/// Displacement from the end of a rel32 operand at `from` to `target`.
pub fn rel32(from: Pcode, target: Pcode) -> Option<i32> {
    let delta = (target as i64).wrapping_sub(from as i64);
    i32::try_from(delta).ok()
}

/// Whether a rel32 operand ending at `from` can encode `target`.
pub fn rel32_reaches(from: Pcode, target: Pcode) -> bool {
    rel32(from, target).is_some()
}

/// # Safety
/// `member` must point to an 8-byte aligned fixup member.
pub unsafe fn fixup_word<'a>(member: *const u8) -> &'a AtomicU64 {
    unsafe { &*(member as *const AtomicU64) }
}

// ==================== Jump stubs ====================

pub const JUMP_STUB_SIZE: usize = 16;
pub const JUMP_STUB_ALIGN: usize = 8;
const JUMP_STUB_TARGET_OFFSET: usize = 8;

/// `jmp [rip+2]; int3 x2` followed by the aligned target word.
const JUMP_STUB_HEADER: [u8; 8] = [0xFF, 0x25, 0x02, 0x00, 0x00, 0x00, INT3, INT3];

/// Write a jump stub to `target` at `stub`.
///
/// # Safety
/// `stub` must be valid for 16 writable bytes, 8-byte aligned, and not yet
/// visible to other threads.
pub unsafe fn emit_jump_stub(stub: *mut u8, target: Pcode) {
    unsafe {
        std::ptr::copy_nonoverlapping(JUMP_STUB_HEADER.as_ptr(), stub, JUMP_STUB_HEADER.len());
        jump_stub_slot(stub).store(target, Ordering::Release);
    }
}

/// The target word of the jump stub at `stub`.
///
/// # Safety
/// `stub` must point to a jump stub.
pub unsafe fn jump_stub_slot<'a>(stub: *const u8) -> &'a AtomicUsize {
    unsafe { &*(stub.add(JUMP_STUB_TARGET_OFFSET) as *const AtomicUsize) }
}

/// Decode the jump stub at `stub`, or `None` if the bytes are not one.
///
/// # Safety
/// `stub` must be readable for 16 bytes.
pub unsafe fn jump_stub_target(stub: *const u8) -> Option<Pcode> {
    let header = unsafe { std::slice::from_raw_parts(stub, JUMP_STUB_HEADER.len()) };
    if header != JUMP_STUB_HEADER {
        return None;
    }
    Some(unsafe { jump_stub_slot(stub) }.load(Ordering::Acquire))
}
