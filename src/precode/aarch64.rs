//! AArch64 precode templates.
//!
//! The stubs only load absolute slots with PC-relative instructions, so
//! retargeting never rewrites an instruction word.

use super::caps::{FixupEncoding, FixupLayout, SlotLayout};

/// AArch64 registers used by the templates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Reg {
    X0 = 0,
    X1 = 1,
    X9 = 9,
    X10 = 10,
    X11 = 11,
    X12 = 12,
    X16 = 16,
}

impl Reg {
    pub const fn code(self) -> u32 {
        self as u32
    }
}

/// ADR Xd, #imm
pub const fn adr(rd: Reg, imm: u32) -> u32 {
    // 0ii1 0000 iiii iiii iiii iiii iiid dddd
    let immlo = imm & 0x3;
    let immhi = (imm >> 2) & 0x7FFFF;
    0x10000000 | (immlo << 29) | (immhi << 5) | rd.code()
}

/// LDP Xt1, Xt2, [Xn] (signed offset 0)
pub const fn ldp(rt1: Reg, rt2: Reg, rn: Reg) -> u32 {
    // 1010 1001 01ii iiii it2t 2tnn nnnt tttt
    0xA9400000 | (rt2.code() << 10) | (rn.code() << 5) | rt1.code()
}

/// LDR Xt, label (PC-relative literal)
pub const fn ldr_literal(rt: Reg, offset: u32) -> u32 {
    // 0101 1000 iiii iiii iiii iiii iiit tttt
    0x58000000 | (((offset / 4) & 0x7FFFF) << 5) | rt.code()
}

/// MOV Xd, Xn (as ADD Xd, Xn, #0 so SP-safe)
pub const fn mov(rd: Reg, rn: Reg) -> u32 {
    // 1001 0001 00ii iiii iiii iinn nnnd dddd
    0x91000000 | (rn.code() << 5) | rd.code()
}

/// BR Xn
pub const fn br(rn: Reg) -> u32 {
    // 1101 0110 0001 1111 0000 00nn nnn0 0000
    0xD61F0000 | (rn.code() << 5)
}

/// Little-endian bytes of `words`, zero-padded to `N` bytes.
const fn to_bytes<const N: usize, const W: usize>(words: [u32; W]) -> [u8; N] {
    let mut out = [0u8; N];
    let mut i = 0;
    while i < W {
        let b = words[i].to_le_bytes();
        out[i * 4] = b[0];
        out[i * 4 + 1] = b[1];
        out[i * 4 + 2] = b[2];
        out[i * 4 + 3] = b[3];
        i += 1;
    }
    out
}

/// `adr x9, #16; ldp x10, x12, [x9]; br x10; pad; target; md`
pub const STUB_TEMPLATE: [u8; 16] = to_bytes([
    adr(Reg::X9, 16),
    ldp(Reg::X10, Reg::X12, Reg::X9),
    br(Reg::X10),
]);

/// `adr x9, #16; ldp x10, x11, [x9]; br x10; pad; target; md`
pub const NDIRECT_IMPORT_TEMPLATE: [u8; 16] = to_bytes([
    adr(Reg::X9, 16),
    ldp(Reg::X10, Reg::X11, Reg::X9),
    br(Reg::X10),
]);

/// Swap x0 and x1 through x16, then branch through the target slot.
pub const THIS_PTR_RET_BUF_TEMPLATE: [u8; 24] = to_bytes([
    mov(Reg::X16, Reg::X0),
    mov(Reg::X0, Reg::X1),
    mov(Reg::X1, Reg::X16),
    ldr_literal(Reg::X16, 12),
    br(Reg::X16),
]);

/// `adr x12, #0; ldr x11, #12; br x11`, then the index bytes.
pub const FIXUP_TEMPLATE: [u8; 12] = to_bytes([
    adr(Reg::X12, 0),
    ldr_literal(Reg::X11, 12),
    br(Reg::X11),
]);

pub const STUB: SlotLayout = SlotLayout {
    template: &STUB_TEMPLATE,
    size: 32,
    method_desc_offset: 24,
    target_offset: 16,
    thunk_offset: None,
};

pub const NDIRECT_IMPORT: SlotLayout = SlotLayout {
    template: &NDIRECT_IMPORT_TEMPLATE,
    ..STUB
};

pub const THIS_PTR_RET_BUF: SlotLayout = SlotLayout {
    template: &THIS_PTR_RET_BUF_TEMPLATE,
    size: 40,
    method_desc_offset: 32,
    target_offset: 24,
    thunk_offset: None,
};

pub const FIXUP: FixupLayout = FixupLayout {
    size: 24,
    method_desc_index_offset: 12,
    precode_index_offset: 13,
    encoding: FixupEncoding::Slot {
        template: &FIXUP_TEMPLATE,
        target_offset: 16,
    },
    dynamic_jump_stub_size: None,
};
