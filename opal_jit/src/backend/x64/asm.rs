//! x64 assembler.
//!
//! Hand-rolled REX/ModRM/SIB encoding for the instruction selection the
//! emitter uses. Branches take buffer labels and patch forward references
//! through the code buffer's rel32 mechanism.

use crate::backend::code_buffer::{CodeBuffer, Label};
use crate::hir::Cond;
use crate::target::registers::{Gpr, Xmm};

/// A memory operand: `[base + index*scale + disp]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mem {
    pub base: Gpr,
    /// Index register and log2 of the scale.
    pub index: Option<(Gpr, u8)>,
    pub disp: i32,
}

impl Mem {
    /// `[base + disp]`.
    pub const fn base(base: Gpr, disp: i32) -> Mem {
        Mem {
            base,
            index: None,
            disp,
        }
    }

    /// `[base + index*scale + disp]`.
    pub const fn indexed(base: Gpr, index: Gpr, scale_log2: u8, disp: i32) -> Mem {
        Mem {
            base,
            index: Some((index, scale_log2)),
            disp,
        }
    }
}

/// x86 condition-code nibble.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CondCode(pub u8);

impl CondCode {
    pub const E: CondCode = CondCode(0x4);
    pub const NE: CondCode = CondCode(0x5);
    pub const L: CondCode = CondCode(0xC);
    pub const GE: CondCode = CondCode(0xD);
    pub const G: CondCode = CondCode(0xF);
    pub const LE: CondCode = CondCode(0xE);
    pub const B: CondCode = CondCode(0x2);
    pub const AE: CondCode = CondCode(0x3);
    pub const A: CondCode = CondCode(0x7);
    pub const P: CondCode = CondCode(0xA);

    /// Map a branch condition to its signed-compare condition code.
    pub fn from_cond(cond: Cond) -> CondCode {
        match cond {
            Cond::Eq => CondCode::E,
            Cond::Ne => CondCode::NE,
            Cond::Lt => CondCode::L,
            Cond::Le => CondCode::LE,
            Cond::Gt => CondCode::G,
            Cond::Ge => CondCode::GE,
            Cond::Below => CondCode::B,
            Cond::AboveEqual => CondCode::AE,
        }
    }
}

/// The assembler: encoding methods over a [`CodeBuffer`].
pub struct Assembler {
    buf: CodeBuffer,
}

impl Assembler {
    /// Wrap a fresh buffer with the given size limit.
    pub fn new(limit: usize) -> Assembler {
        Assembler {
            buf: CodeBuffer::new(limit),
        }
    }

    /// The underlying buffer.
    #[inline]
    pub fn buf(&mut self) -> &mut CodeBuffer {
        &mut self.buf
    }

    /// Current position.
    #[inline]
    pub fn position(&self) -> u32 {
        self.buf.position()
    }

    /// Finish, returning the buffer for sealing.
    pub fn into_buffer(self) -> CodeBuffer {
        self.buf
    }

    // -------------------------------------------------------------------------
    // Encoding primitives
    // -------------------------------------------------------------------------

    fn rex(&mut self, w: bool, r: u8, x: u8, b: u8) {
        let byte = 0x40
            | (u8::from(w) << 3)
            | ((r >> 3) << 2)
            | ((x >> 3) << 1)
            | (b >> 3);
        if byte != 0x40 || w {
            self.buf.emit_u8(byte);
        }
    }

    fn rex_force(&mut self, w: bool, r: u8, x: u8, b: u8) {
        let byte = 0x40
            | (u8::from(w) << 3)
            | ((r >> 3) << 2)
            | ((x >> 3) << 1)
            | (b >> 3);
        self.buf.emit_u8(byte);
    }

    fn modrm_reg(&mut self, reg: u8, rm: u8) {
        self.buf.emit_u8(0xC0 | ((reg & 7) << 3) | (rm & 7));
    }

    /// ModRM + SIB + displacement for a memory operand.
    fn modrm_mem(&mut self, reg: u8, mem: &Mem) {
        let reg = reg & 7;
        let base = mem.base.low_bits();
        // A displacement of 0 still needs disp8 when base is RBP/R13.
        let (mode, disp8) = if mem.disp == 0 && base != 5 {
            (0u8, false)
        } else if i8::try_from(mem.disp).is_ok() {
            (0x40u8, true)
        } else {
            (0x80u8, false)
        };
        match mem.index {
            None => {
                if base == 4 {
                    // RSP/R12 base requires a SIB byte.
                    self.buf.emit_u8(mode | (reg << 3) | 4);
                    self.buf.emit_u8(0x24);
                } else {
                    self.buf.emit_u8(mode | (reg << 3) | base);
                }
            }
            Some((index, scale)) => {
                assert_ne!(index, Gpr::Rsp, "rsp cannot be an index register");
                self.buf.emit_u8(mode | (reg << 3) | 4);
                self.buf
                    .emit_u8((scale << 6) | (index.low_bits() << 3) | base);
            }
        }
        if mode == 0x40 || (mode == 0 && base == 5) {
            debug_assert!(disp8 || mem.disp == 0);
            self.buf.emit_u8(mem.disp as i8 as u8);
        } else if mode == 0x80 {
            self.buf.emit_u32(mem.disp as u32);
        }
    }

    fn mem_rex_bits(mem: &Mem) -> (u8, u8) {
        let x = mem.index.map(|(i, _)| i.encoding()).unwrap_or(0);
        (x, mem.base.encoding())
    }

    // -------------------------------------------------------------------------
    // Moves
    // -------------------------------------------------------------------------

    /// MOV r, r (32- or 64-bit).
    pub fn mov_rr(&mut self, w: bool, dst: Gpr, src: Gpr) {
        self.rex(w, src.encoding(), 0, dst.encoding());
        self.buf.emit_u8(0x89);
        self.modrm_reg(src.encoding(), dst.encoding());
    }

    /// MOV r64, imm (movabs when out of the sign-extended 32-bit range).
    pub fn mov_ri(&mut self, dst: Gpr, imm: i64) {
        if let Ok(imm32) = i32::try_from(imm) {
            self.rex(true, 0, 0, dst.encoding());
            self.buf.emit_u8(0xC7);
            self.modrm_reg(0, dst.encoding());
            self.buf.emit_u32(imm32 as u32);
        } else {
            self.rex(true, 0, 0, dst.encoding());
            self.buf.emit_u8(0xB8 | dst.low_bits());
            self.buf.emit_u64(imm as u64);
        }
    }

    /// MOV r64, imm64 always in the 10-byte form; returns the offset of the
    /// immediate for data patching.
    pub fn mov_ri64_patchable(&mut self, dst: Gpr, imm: u64) -> u32 {
        self.rex(true, 0, 0, dst.encoding());
        self.buf.emit_u8(0xB8 | dst.low_bits());
        let at = self.buf.position();
        self.buf.emit_u64(imm);
        at
    }

    /// MOV r, [mem] (32- or 64-bit load).
    pub fn mov_rm(&mut self, w: bool, dst: Gpr, mem: &Mem) {
        let (x, b) = Self::mem_rex_bits(mem);
        self.rex(w, dst.encoding(), x, b);
        self.buf.emit_u8(0x8B);
        self.modrm_mem(dst.encoding(), mem);
    }

    /// MOV [mem], r (32- or 64-bit store).
    pub fn mov_mr(&mut self, w: bool, mem: &Mem, src: Gpr) {
        let (x, b) = Self::mem_rex_bits(mem);
        self.rex(w, src.encoding(), x, b);
        self.buf.emit_u8(0x89);
        self.modrm_mem(src.encoding(), mem);
    }

    /// MOV [mem], r8.
    pub fn mov_mr8(&mut self, mem: &Mem, src: Gpr) {
        let (x, b) = Self::mem_rex_bits(mem);
        // A REX prefix keeps SPL/BPL/SIL/DIL addressable.
        self.rex_force(false, src.encoding(), x, b);
        self.buf.emit_u8(0x88);
        self.modrm_mem(src.encoding(), mem);
    }

    /// MOV [mem], r16.
    pub fn mov_mr16(&mut self, mem: &Mem, src: Gpr) {
        self.buf.emit_u8(0x66);
        let (x, b) = Self::mem_rex_bits(mem);
        self.rex(false, src.encoding(), x, b);
        self.buf.emit_u8(0x89);
        self.modrm_mem(src.encoding(), mem);
    }

    /// MOVZX r32, byte [mem].
    pub fn movzx_rm8(&mut self, dst: Gpr, mem: &Mem) {
        let (x, b) = Self::mem_rex_bits(mem);
        self.rex(false, dst.encoding(), x, b);
        self.buf.emit_u8(0x0F);
        self.buf.emit_u8(0xB6);
        self.modrm_mem(dst.encoding(), mem);
    }

    /// MOVSX r32, byte [mem].
    pub fn movsx_rm8(&mut self, dst: Gpr, mem: &Mem) {
        let (x, b) = Self::mem_rex_bits(mem);
        self.rex(false, dst.encoding(), x, b);
        self.buf.emit_u8(0x0F);
        self.buf.emit_u8(0xBE);
        self.modrm_mem(dst.encoding(), mem);
    }

    /// MOVZX r32, word [mem].
    pub fn movzx_rm16(&mut self, dst: Gpr, mem: &Mem) {
        let (x, b) = Self::mem_rex_bits(mem);
        self.rex(false, dst.encoding(), x, b);
        self.buf.emit_u8(0x0F);
        self.buf.emit_u8(0xB7);
        self.modrm_mem(dst.encoding(), mem);
    }

    /// MOVSX r32, word [mem].
    pub fn movsx_rm16(&mut self, dst: Gpr, mem: &Mem) {
        let (x, b) = Self::mem_rex_bits(mem);
        self.rex(false, dst.encoding(), x, b);
        self.buf.emit_u8(0x0F);
        self.buf.emit_u8(0xBF);
        self.modrm_mem(dst.encoding(), mem);
    }

    /// MOVSX r32, r8 (for i2b).
    pub fn movsx_rr8(&mut self, dst: Gpr, src: Gpr) {
        self.rex_force(false, dst.encoding(), 0, src.encoding());
        self.buf.emit_u8(0x0F);
        self.buf.emit_u8(0xBE);
        self.modrm_reg(dst.encoding(), src.encoding());
    }

    /// MOVSX r32, r16 (for i2s).
    pub fn movsx_rr16(&mut self, dst: Gpr, src: Gpr) {
        self.rex(false, dst.encoding(), 0, src.encoding());
        self.buf.emit_u8(0x0F);
        self.buf.emit_u8(0xBF);
        self.modrm_reg(dst.encoding(), src.encoding());
    }

    /// MOVZX r32, r16 (for i2c).
    pub fn movzx_rr16(&mut self, dst: Gpr, src: Gpr) {
        self.rex(false, dst.encoding(), 0, src.encoding());
        self.buf.emit_u8(0x0F);
        self.buf.emit_u8(0xB7);
        self.modrm_reg(dst.encoding(), src.encoding());
    }

    /// MOVZX r32, r8.
    pub fn movzx_rr8(&mut self, dst: Gpr, src: Gpr) {
        self.rex_force(false, dst.encoding(), 0, src.encoding());
        self.buf.emit_u8(0x0F);
        self.buf.emit_u8(0xB6);
        self.modrm_reg(dst.encoding(), src.encoding());
    }

    /// MOVSXD r64, r32 (i2l).
    pub fn movsxd(&mut self, dst: Gpr, src: Gpr) {
        self.rex(true, dst.encoding(), 0, src.encoding());
        self.buf.emit_u8(0x63);
        self.modrm_reg(dst.encoding(), src.encoding());
    }

    /// LEA r64, [mem].
    pub fn lea(&mut self, dst: Gpr, mem: &Mem) {
        let (x, b) = Self::mem_rex_bits(mem);
        self.rex(true, dst.encoding(), x, b);
        self.buf.emit_u8(0x8D);
        self.modrm_mem(dst.encoding(), mem);
    }

    /// LEA r64, [rip + disp32]; returns the offset of the displacement.
    pub fn lea_rip(&mut self, dst: Gpr, disp: i32) -> u32 {
        self.rex(true, dst.encoding(), 0, 0);
        self.buf.emit_u8(0x8D);
        self.buf.emit_u8(((dst.low_bits()) << 3) | 5);
        let at = self.buf.position();
        self.buf.emit_u32(disp as u32);
        at
    }

    // -------------------------------------------------------------------------
    // Integer ALU
    // -------------------------------------------------------------------------

    fn alu_rr(&mut self, opcode: u8, w: bool, dst: Gpr, src: Gpr) {
        self.rex(w, src.encoding(), 0, dst.encoding());
        self.buf.emit_u8(opcode);
        self.modrm_reg(src.encoding(), dst.encoding());
    }

    fn alu_rm(&mut self, opcode: u8, w: bool, dst: Gpr, mem: &Mem) {
        let (x, b) = Self::mem_rex_bits(mem);
        self.rex(w, dst.encoding(), x, b);
        self.buf.emit_u8(opcode);
        self.modrm_mem(dst.encoding(), mem);
    }

    fn alu_mr(&mut self, opcode: u8, w: bool, mem: &Mem, src: Gpr) {
        let (x, b) = Self::mem_rex_bits(mem);
        self.rex(w, src.encoding(), x, b);
        self.buf.emit_u8(opcode);
        self.modrm_mem(src.encoding(), mem);
    }

    fn alu_mi(&mut self, ext: u8, w: bool, mem: &Mem, imm: i32) {
        let (x, b) = Self::mem_rex_bits(mem);
        self.rex(w, 0, x, b);
        if let Ok(imm8) = i8::try_from(imm) {
            self.buf.emit_u8(0x83);
            self.modrm_mem(ext, mem);
            self.buf.emit_u8(imm8 as u8);
        } else {
            self.buf.emit_u8(0x81);
            self.modrm_mem(ext, mem);
            self.buf.emit_u32(imm as u32);
        }
    }

    fn alu_ri(&mut self, ext: u8, w: bool, dst: Gpr, imm: i32) {
        self.rex(w, 0, 0, dst.encoding());
        if let Ok(imm8) = i8::try_from(imm) {
            self.buf.emit_u8(0x83);
            self.modrm_reg(ext, dst.encoding());
            self.buf.emit_u8(imm8 as u8);
        } else {
            self.buf.emit_u8(0x81);
            self.modrm_reg(ext, dst.encoding());
            self.buf.emit_u32(imm as u32);
        }
    }

    pub fn add_rr(&mut self, w: bool, dst: Gpr, src: Gpr) {
        self.alu_rr(0x01, w, dst, src);
    }
    pub fn add_rm(&mut self, w: bool, dst: Gpr, mem: &Mem) {
        self.alu_rm(0x03, w, dst, mem);
    }
    pub fn add_ri(&mut self, w: bool, dst: Gpr, imm: i32) {
        self.alu_ri(0, w, dst, imm);
    }
    pub fn sub_rr(&mut self, w: bool, dst: Gpr, src: Gpr) {
        self.alu_rr(0x29, w, dst, src);
    }
    pub fn sub_rm(&mut self, w: bool, dst: Gpr, mem: &Mem) {
        self.alu_rm(0x2B, w, dst, mem);
    }
    pub fn sub_ri(&mut self, w: bool, dst: Gpr, imm: i32) {
        self.alu_ri(5, w, dst, imm);
    }
    pub fn and_rr(&mut self, w: bool, dst: Gpr, src: Gpr) {
        self.alu_rr(0x21, w, dst, src);
    }
    pub fn and_rm(&mut self, w: bool, dst: Gpr, mem: &Mem) {
        self.alu_rm(0x23, w, dst, mem);
    }
    pub fn and_ri(&mut self, w: bool, dst: Gpr, imm: i32) {
        self.alu_ri(4, w, dst, imm);
    }
    pub fn or_rr(&mut self, w: bool, dst: Gpr, src: Gpr) {
        self.alu_rr(0x09, w, dst, src);
    }
    pub fn or_rm(&mut self, w: bool, dst: Gpr, mem: &Mem) {
        self.alu_rm(0x0B, w, dst, mem);
    }
    pub fn or_ri(&mut self, w: bool, dst: Gpr, imm: i32) {
        self.alu_ri(1, w, dst, imm);
    }
    pub fn xor_rr(&mut self, w: bool, dst: Gpr, src: Gpr) {
        self.alu_rr(0x31, w, dst, src);
    }
    pub fn xor_rm(&mut self, w: bool, dst: Gpr, mem: &Mem) {
        self.alu_rm(0x33, w, dst, mem);
    }
    pub fn xor_ri(&mut self, w: bool, dst: Gpr, imm: i32) {
        self.alu_ri(6, w, dst, imm);
    }
    pub fn cmp_rr(&mut self, w: bool, left: Gpr, right: Gpr) {
        self.alu_rr(0x39, w, left, right);
    }
    pub fn cmp_rm(&mut self, w: bool, left: Gpr, mem: &Mem) {
        self.alu_rm(0x3B, w, left, mem);
    }
    pub fn cmp_ri(&mut self, w: bool, left: Gpr, imm: i32) {
        self.alu_ri(7, w, left, imm);
    }
    pub fn add_mr(&mut self, w: bool, mem: &Mem, src: Gpr) {
        self.alu_mr(0x01, w, mem, src);
    }
    pub fn sub_mr(&mut self, w: bool, mem: &Mem, src: Gpr) {
        self.alu_mr(0x29, w, mem, src);
    }
    pub fn and_mr(&mut self, w: bool, mem: &Mem, src: Gpr) {
        self.alu_mr(0x21, w, mem, src);
    }
    pub fn or_mr(&mut self, w: bool, mem: &Mem, src: Gpr) {
        self.alu_mr(0x09, w, mem, src);
    }
    pub fn xor_mr(&mut self, w: bool, mem: &Mem, src: Gpr) {
        self.alu_mr(0x31, w, mem, src);
    }
    pub fn cmp_mr(&mut self, w: bool, mem: &Mem, src: Gpr) {
        self.alu_mr(0x39, w, mem, src);
    }
    pub fn add_mi(&mut self, w: bool, mem: &Mem, imm: i32) {
        self.alu_mi(0, w, mem, imm);
    }
    pub fn sub_mi(&mut self, w: bool, mem: &Mem, imm: i32) {
        self.alu_mi(5, w, mem, imm);
    }
    pub fn and_mi(&mut self, w: bool, mem: &Mem, imm: i32) {
        self.alu_mi(4, w, mem, imm);
    }
    pub fn or_mi(&mut self, w: bool, mem: &Mem, imm: i32) {
        self.alu_mi(1, w, mem, imm);
    }
    pub fn xor_mi(&mut self, w: bool, mem: &Mem, imm: i32) {
        self.alu_mi(6, w, mem, imm);
    }
    pub fn cmp_mi(&mut self, w: bool, mem: &Mem, imm: i32) {
        self.alu_mi(7, w, mem, imm);
    }

    /// MOV [mem], imm32 (sign-extended when w).
    pub fn mov_mi(&mut self, w: bool, mem: &Mem, imm: i32) {
        let (x, b) = Self::mem_rex_bits(mem);
        self.rex(w, 0, x, b);
        self.buf.emit_u8(0xC7);
        self.modrm_mem(0, mem);
        self.buf.emit_u32(imm as u32);
    }

    /// MOV byte [mem], imm8.
    pub fn mov_mi8(&mut self, mem: &Mem, imm: u8) {
        let (x, b) = Self::mem_rex_bits(mem);
        self.rex(false, 0, x, b);
        self.buf.emit_u8(0xC6);
        self.modrm_mem(0, mem);
        self.buf.emit_u8(imm);
    }

    /// IMUL r, r.
    pub fn imul_rr(&mut self, w: bool, dst: Gpr, src: Gpr) {
        self.rex(w, dst.encoding(), 0, src.encoding());
        self.buf.emit_u8(0x0F);
        self.buf.emit_u8(0xAF);
        self.modrm_reg(dst.encoding(), src.encoding());
    }

    /// IMUL r, [mem].
    pub fn imul_rm(&mut self, w: bool, dst: Gpr, mem: &Mem) {
        let (x, b) = Self::mem_rex_bits(mem);
        self.rex(w, dst.encoding(), x, b);
        self.buf.emit_u8(0x0F);
        self.buf.emit_u8(0xAF);
        self.modrm_mem(dst.encoding(), mem);
    }

    /// Sign-extend RAX into RDX:RAX (CQO) or EAX into EDX:EAX (CDQ).
    pub fn cqo(&mut self, w: bool) {
        if w {
            self.buf.emit_u8(0x48);
        }
        self.buf.emit_u8(0x99);
    }

    /// IDIV r.
    pub fn idiv_r(&mut self, w: bool, divisor: Gpr) {
        self.rex(w, 0, 0, divisor.encoding());
        self.buf.emit_u8(0xF7);
        self.modrm_reg(7, divisor.encoding());
    }

    /// IDIV [mem].
    pub fn idiv_m(&mut self, w: bool, mem: &Mem) {
        let (x, b) = Self::mem_rex_bits(mem);
        self.rex(w, 0, x, b);
        self.buf.emit_u8(0xF7);
        self.modrm_mem(7, mem);
    }

    /// NEG r.
    pub fn neg(&mut self, w: bool, r: Gpr) {
        self.rex(w, 0, 0, r.encoding());
        self.buf.emit_u8(0xF7);
        self.modrm_reg(3, r.encoding());
    }

    /// NOT r.
    pub fn not(&mut self, w: bool, r: Gpr) {
        self.rex(w, 0, 0, r.encoding());
        self.buf.emit_u8(0xF7);
        self.modrm_reg(2, r.encoding());
    }

    fn shift_cl(&mut self, ext: u8, w: bool, r: Gpr) {
        self.rex(w, 0, 0, r.encoding());
        self.buf.emit_u8(0xD3);
        self.modrm_reg(ext, r.encoding());
    }

    fn shift_imm(&mut self, ext: u8, w: bool, r: Gpr, imm: u8) {
        self.rex(w, 0, 0, r.encoding());
        self.buf.emit_u8(0xC1);
        self.modrm_reg(ext, r.encoding());
        self.buf.emit_u8(imm);
    }

    pub fn shl_cl(&mut self, w: bool, r: Gpr) {
        self.shift_cl(4, w, r);
    }
    pub fn shl_imm(&mut self, w: bool, r: Gpr, imm: u8) {
        self.shift_imm(4, w, r, imm);
    }
    pub fn sar_cl(&mut self, w: bool, r: Gpr) {
        self.shift_cl(7, w, r);
    }
    pub fn sar_imm(&mut self, w: bool, r: Gpr, imm: u8) {
        self.shift_imm(7, w, r, imm);
    }
    pub fn shr_cl(&mut self, w: bool, r: Gpr) {
        self.shift_cl(5, w, r);
    }
    pub fn shr_imm(&mut self, w: bool, r: Gpr, imm: u8) {
        self.shift_imm(5, w, r, imm);
    }

    /// TEST r, r.
    pub fn test_rr(&mut self, w: bool, a: Gpr, b: Gpr) {
        self.rex(w, b.encoding(), 0, a.encoding());
        self.buf.emit_u8(0x85);
        self.modrm_reg(b.encoding(), a.encoding());
    }

    /// SETcc r8.
    pub fn setcc(&mut self, cc: CondCode, r: Gpr) {
        self.rex_force(false, 0, 0, r.encoding());
        self.buf.emit_u8(0x0F);
        self.buf.emit_u8(0x90 | cc.0);
        self.modrm_reg(0, r.encoding());
    }

    /// CMOVcc r, r.
    pub fn cmovcc_rr(&mut self, w: bool, cc: CondCode, dst: Gpr, src: Gpr) {
        self.rex(w, dst.encoding(), 0, src.encoding());
        self.buf.emit_u8(0x0F);
        self.buf.emit_u8(0x40 | cc.0);
        self.modrm_reg(dst.encoding(), src.encoding());
    }

    /// CMOVcc r, [mem].
    pub fn cmovcc_rm(&mut self, w: bool, cc: CondCode, dst: Gpr, mem: &Mem) {
        let (x, b) = Self::mem_rex_bits(mem);
        self.rex(w, dst.encoding(), x, b);
        self.buf.emit_u8(0x0F);
        self.buf.emit_u8(0x40 | cc.0);
        self.modrm_mem(dst.encoding(), mem);
    }

    /// BTR r64, imm8 (clear one bit).
    pub fn btr_ri(&mut self, r: Gpr, bit: u8) {
        self.rex(true, 0, 0, r.encoding());
        self.buf.emit_u8(0x0F);
        self.buf.emit_u8(0xBA);
        self.modrm_reg(6, r.encoding());
        self.buf.emit_u8(bit);
    }

    /// BTC r64, imm8 (flip one bit).
    pub fn btc_ri(&mut self, r: Gpr, bit: u8) {
        self.rex(true, 0, 0, r.encoding());
        self.buf.emit_u8(0x0F);
        self.buf.emit_u8(0xBA);
        self.modrm_reg(7, r.encoding());
        self.buf.emit_u8(bit);
    }

    /// BTC qword [mem], imm8.
    pub fn btc_mi(&mut self, mem: &Mem, bit: u8) {
        let (x, b) = Self::mem_rex_bits(mem);
        self.rex(true, 0, x, b);
        self.buf.emit_u8(0x0F);
        self.buf.emit_u8(0xBA);
        self.modrm_mem(7, mem);
        self.buf.emit_u8(bit);
    }

    /// IMUL r, r/m, imm32 (three-operand form).
    pub fn imul_rri(&mut self, w: bool, dst: Gpr, src: Gpr, imm: i32) {
        self.rex(w, dst.encoding(), 0, src.encoding());
        if let Ok(imm8) = i8::try_from(imm) {
            self.buf.emit_u8(0x6B);
            self.modrm_reg(dst.encoding(), src.encoding());
            self.buf.emit_u8(imm8 as u8);
        } else {
            self.buf.emit_u8(0x69);
            self.modrm_reg(dst.encoding(), src.encoding());
            self.buf.emit_u32(imm as u32);
        }
    }

    // -------------------------------------------------------------------------
    // Control flow
    // -------------------------------------------------------------------------

    /// Jcc rel32.
    pub fn jcc(&mut self, cc: CondCode, target: Label) {
        self.buf.emit_u8(0x0F);
        self.buf.emit_u8(0x80 | cc.0);
        self.buf.emit_rel32(target);
    }

    /// JMP rel32.
    pub fn jmp(&mut self, target: Label) {
        self.buf.emit_u8(0xE9);
        self.buf.emit_rel32(target);
    }

    /// JMP r.
    pub fn jmp_r(&mut self, r: Gpr) {
        self.rex(false, 0, 0, r.encoding());
        self.buf.emit_u8(0xFF);
        self.modrm_reg(4, r.encoding());
    }

    /// CALL rel32 with a zero displacement; returns the offset of the call
    /// instruction so the site can be recorded for patching.
    pub fn call_patchable(&mut self) -> u32 {
        let at = self.buf.position();
        self.buf.emit_u8(0xE8);
        self.buf.emit_u32(0);
        at
    }

    /// CALL r.
    pub fn call_r(&mut self, r: Gpr) {
        self.rex(false, 0, 0, r.encoding());
        self.buf.emit_u8(0xFF);
        self.modrm_reg(2, r.encoding());
    }

    /// CALL [mem].
    pub fn call_m(&mut self, mem: &Mem) {
        let (x, b) = Self::mem_rex_bits(mem);
        self.rex(false, 2, x, b);
        self.buf.emit_u8(0xFF);
        self.modrm_mem(2, mem);
    }

    pub fn push(&mut self, r: Gpr) {
        if r.needs_rex() {
            self.buf.emit_u8(0x41);
        }
        self.buf.emit_u8(0x50 | r.low_bits());
    }

    pub fn pop(&mut self, r: Gpr) {
        if r.needs_rex() {
            self.buf.emit_u8(0x41);
        }
        self.buf.emit_u8(0x58 | r.low_bits());
    }

    pub fn ret(&mut self) {
        self.buf.emit_u8(0xC3);
    }

    /// RET imm16: return and pop callee-popped argument bytes.
    pub fn ret_imm(&mut self, imm: u16) {
        self.buf.emit_u8(0xC2);
        self.buf.emit_u16(imm);
    }

    /// LEAVE: mov rsp, rbp; pop rbp.
    pub fn leave(&mut self) {
        self.buf.emit_u8(0xC9);
    }

    pub fn int3(&mut self) {
        self.buf.emit_u8(0xCC);
    }

    pub fn nop(&mut self) {
        self.buf.emit_u8(0x90);
    }

    /// MFENCE.
    pub fn mfence(&mut self) {
        self.buf.emit_slice(&[0x0F, 0xAE, 0xF0]);
    }

    /// LFENCE.
    pub fn lfence(&mut self) {
        self.buf.emit_slice(&[0x0F, 0xAE, 0xE8]);
    }

    /// SFENCE.
    pub fn sfence(&mut self) {
        self.buf.emit_slice(&[0x0F, 0xAE, 0xF8]);
    }

    /// TEST eax, [rip + disp32]: the safepoint poll form. Returns the
    /// offset of the displacement for install-time patching.
    pub fn test_eax_rip(&mut self, disp: i32) -> u32 {
        self.buf.emit_u8(0x85);
        self.buf.emit_u8(0x05);
        let at = self.buf.position();
        self.buf.emit_u32(disp as u32);
        at
    }

    /// LOCK CMPXCHG [mem], r.
    pub fn lock_cmpxchg(&mut self, w: bool, mem: &Mem, src: Gpr) {
        self.buf.emit_u8(0xF0);
        let (x, b) = Self::mem_rex_bits(mem);
        self.rex(w, src.encoding(), x, b);
        self.buf.emit_u8(0x0F);
        self.buf.emit_u8(0xB1);
        self.modrm_mem(src.encoding(), mem);
    }

    // -------------------------------------------------------------------------
    // SSE2 scalar
    // -------------------------------------------------------------------------

    fn sse_rr(&mut self, prefix: u8, opcode: u8, dst: u8, src: u8) {
        self.buf.emit_u8(prefix);
        self.rex(false, dst, 0, src);
        self.buf.emit_u8(0x0F);
        self.buf.emit_u8(opcode);
        self.modrm_reg(dst, src);
    }

    fn sse_rm(&mut self, prefix: u8, opcode: u8, reg: u8, mem: &Mem) {
        self.buf.emit_u8(prefix);
        let (x, b) = Self::mem_rex_bits(mem);
        self.rex(false, reg, x, b);
        self.buf.emit_u8(0x0F);
        self.buf.emit_u8(opcode);
        self.modrm_mem(reg, mem);
    }

    /// MOVSD/MOVSS xmm, xmm.
    pub fn movs_rr(&mut self, double: bool, dst: Xmm, src: Xmm) {
        self.sse_rr(if double { 0xF2 } else { 0xF3 }, 0x10, dst.encoding(), src.encoding());
    }

    /// MOVSD/MOVSS xmm, [mem].
    pub fn movs_rm(&mut self, double: bool, dst: Xmm, mem: &Mem) {
        self.sse_rm(if double { 0xF2 } else { 0xF3 }, 0x10, dst.encoding(), mem);
    }

    /// MOVSD/MOVSS [mem], xmm.
    pub fn movs_mr(&mut self, double: bool, mem: &Mem, src: Xmm) {
        self.sse_rm(if double { 0xF2 } else { 0xF3 }, 0x11, src.encoding(), mem);
    }

    fn sse_arith(&mut self, double: bool, opcode: u8, dst: Xmm, src: Xmm) {
        self.sse_rr(if double { 0xF2 } else { 0xF3 }, opcode, dst.encoding(), src.encoding());
    }

    pub fn adds(&mut self, double: bool, dst: Xmm, src: Xmm) {
        self.sse_arith(double, 0x58, dst, src);
    }
    pub fn subs(&mut self, double: bool, dst: Xmm, src: Xmm) {
        self.sse_arith(double, 0x5C, dst, src);
    }
    pub fn muls(&mut self, double: bool, dst: Xmm, src: Xmm) {
        self.sse_arith(double, 0x59, dst, src);
    }
    pub fn divs(&mut self, double: bool, dst: Xmm, src: Xmm) {
        self.sse_arith(double, 0x5E, dst, src);
    }
    pub fn adds_rm(&mut self, double: bool, dst: Xmm, mem: &Mem) {
        self.sse_rm(if double { 0xF2 } else { 0xF3 }, 0x58, dst.encoding(), mem);
    }
    pub fn subs_rm(&mut self, double: bool, dst: Xmm, mem: &Mem) {
        self.sse_rm(if double { 0xF2 } else { 0xF3 }, 0x5C, dst.encoding(), mem);
    }
    pub fn muls_rm(&mut self, double: bool, dst: Xmm, mem: &Mem) {
        self.sse_rm(if double { 0xF2 } else { 0xF3 }, 0x59, dst.encoding(), mem);
    }
    pub fn divs_rm(&mut self, double: bool, dst: Xmm, mem: &Mem) {
        self.sse_rm(if double { 0xF2 } else { 0xF3 }, 0x5E, dst.encoding(), mem);
    }

    /// SQRTSD/SQRTSS xmm, xmm.
    pub fn sqrts(&mut self, double: bool, dst: Xmm, src: Xmm) {
        self.sse_arith(double, 0x51, dst, src);
    }

    /// UCOMISD/UCOMISS xmm, xmm.
    pub fn ucomis(&mut self, double: bool, left: Xmm, right: Xmm) {
        if double {
            self.buf.emit_u8(0x66);
        }
        self.rex(false, left.encoding(), 0, right.encoding());
        self.buf.emit_u8(0x0F);
        self.buf.emit_u8(0x2E);
        self.modrm_reg(left.encoding(), right.encoding());
    }

    /// UCOMISD/UCOMISS xmm, [mem].
    pub fn ucomis_rm(&mut self, double: bool, left: Xmm, mem: &Mem) {
        if double {
            self.buf.emit_u8(0x66);
        }
        let (x, b) = Self::mem_rex_bits(mem);
        self.rex(false, left.encoding(), x, b);
        self.buf.emit_u8(0x0F);
        self.buf.emit_u8(0x2E);
        self.modrm_mem(left.encoding(), mem);
    }

    /// XORPS xmm, xmm (zeroing).
    pub fn xorps(&mut self, dst: Xmm, src: Xmm) {
        self.rex(false, dst.encoding(), 0, src.encoding());
        self.buf.emit_u8(0x0F);
        self.buf.emit_u8(0x57);
        self.modrm_reg(dst.encoding(), src.encoding());
    }

    /// CVTSI2SD/CVTSI2SS xmm, r (w selects 64-bit source).
    pub fn cvtsi2s(&mut self, double: bool, w: bool, dst: Xmm, src: Gpr) {
        self.buf.emit_u8(if double { 0xF2 } else { 0xF3 });
        self.rex(w, dst.encoding(), 0, src.encoding());
        self.buf.emit_u8(0x0F);
        self.buf.emit_u8(0x2A);
        self.modrm_reg(dst.encoding(), src.encoding());
    }

    /// CVTTSD2SI/CVTTSS2SI r, xmm (w selects 64-bit destination).
    pub fn cvtts2si(&mut self, double: bool, w: bool, dst: Gpr, src: Xmm) {
        self.buf.emit_u8(if double { 0xF2 } else { 0xF3 });
        self.rex(w, dst.encoding(), 0, src.encoding());
        self.buf.emit_u8(0x0F);
        self.buf.emit_u8(0x2C);
        self.modrm_reg(dst.encoding(), src.encoding());
    }

    /// CVTSS2SD xmm, xmm.
    pub fn cvtss2sd(&mut self, dst: Xmm, src: Xmm) {
        self.sse_rr(0xF3, 0x5A, dst.encoding(), src.encoding());
    }

    /// CVTSD2SS xmm, xmm.
    pub fn cvtsd2ss(&mut self, dst: Xmm, src: Xmm) {
        self.sse_rr(0xF2, 0x5A, dst.encoding(), src.encoding());
    }

    /// MOVQ xmm, r64.
    pub fn movq_xr(&mut self, dst: Xmm, src: Gpr) {
        self.buf.emit_u8(0x66);
        self.rex(true, dst.encoding(), 0, src.encoding());
        self.buf.emit_u8(0x0F);
        self.buf.emit_u8(0x6E);
        self.modrm_reg(dst.encoding(), src.encoding());
    }

    /// MOVQ r64, xmm.
    pub fn movq_rx(&mut self, dst: Gpr, src: Xmm) {
        self.buf.emit_u8(0x66);
        self.rex(true, src.encoding(), 0, dst.encoding());
        self.buf.emit_u8(0x0F);
        self.buf.emit_u8(0x7E);
        self.modrm_reg(src.encoding(), dst.encoding());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bytes(f: impl FnOnce(&mut Assembler)) -> Vec<u8> {
        let mut asm = Assembler::new(256);
        f(&mut asm);
        asm.into_buffer().finish().unwrap()
    }

    #[test]
    fn test_mov_rr_64() {
        // mov rbx, rax => 48 89 C3
        assert_eq!(
            bytes(|a| a.mov_rr(true, Gpr::Rbx, Gpr::Rax)),
            vec![0x48, 0x89, 0xC3]
        );
    }

    #[test]
    fn test_mov_rr_extended_registers() {
        // mov r8, r9 => 4D 89 C8
        assert_eq!(
            bytes(|a| a.mov_rr(true, Gpr::R8, Gpr::R9)),
            vec![0x4D, 0x89, 0xC8]
        );
    }

    #[test]
    fn test_mov_ri_small_uses_c7() {
        // mov rax, 1 => 48 C7 C0 01 00 00 00
        assert_eq!(
            bytes(|a| a.mov_ri(Gpr::Rax, 1)),
            vec![0x48, 0xC7, 0xC0, 0x01, 0x00, 0x00, 0x00]
        );
    }

    #[test]
    fn test_mov_ri_large_uses_movabs() {
        let code = bytes(|a| a.mov_ri(Gpr::Rax, 0x1122_3344_5566_7788));
        assert_eq!(code[0], 0x48);
        assert_eq!(code[1], 0xB8);
        assert_eq!(&code[2..], &0x1122_3344_5566_7788u64.to_le_bytes());
    }

    #[test]
    fn test_load_with_displacement() {
        // mov rax, [rbp - 8] => 48 8B 45 F8
        assert_eq!(
            bytes(|a| a.mov_rm(true, Gpr::Rax, &Mem::base(Gpr::Rbp, -8))),
            vec![0x48, 0x8B, 0x45, 0xF8]
        );
    }

    #[test]
    fn test_rsp_base_needs_sib() {
        // mov rax, [rsp + 8] => 48 8B 44 24 08
        assert_eq!(
            bytes(|a| a.mov_rm(true, Gpr::Rax, &Mem::base(Gpr::Rsp, 8))),
            vec![0x48, 0x8B, 0x44, 0x24, 0x08]
        );
    }

    #[test]
    fn test_rbp_base_zero_disp_needs_disp8() {
        // mov rax, [rbp] => 48 8B 45 00
        assert_eq!(
            bytes(|a| a.mov_rm(true, Gpr::Rax, &Mem::base(Gpr::Rbp, 0))),
            vec![0x48, 0x8B, 0x45, 0x00]
        );
    }

    #[test]
    fn test_indexed_addressing() {
        // mov eax, [rdi + rsi*4 + 16] => 8B 44 B7 10
        assert_eq!(
            bytes(|a| a.mov_rm(false, Gpr::Rax, &Mem::indexed(Gpr::Rdi, Gpr::Rsi, 2, 16))),
            vec![0x8B, 0x44, 0xB7, 0x10]
        );
    }

    #[test]
    fn test_add_imm8_form() {
        // add rax, 8 => 48 83 C0 08
        assert_eq!(
            bytes(|a| a.add_ri(true, Gpr::Rax, 8)),
            vec![0x48, 0x83, 0xC0, 0x08]
        );
    }

    #[test]
    fn test_cmp_imm32_form() {
        // cmp eax, 1000 => 81 F8 E8 03 00 00
        assert_eq!(
            bytes(|a| a.cmp_ri(false, Gpr::Rax, 1000)),
            vec![0x81, 0xF8, 0xE8, 0x03, 0x00, 0x00]
        );
    }

    #[test]
    fn test_forward_branch_patched() {
        let code = bytes(|a| {
            let l = a.buf().create_label();
            a.jcc(CondCode::E, l);
            a.nop();
            a.buf().bind(l);
            a.ret();
        });
        // jcc is 6 bytes; target at 7; disp = 7 - 6 = 1.
        assert_eq!(code[0], 0x0F);
        assert_eq!(code[1], 0x84);
        assert_eq!(&code[2..6], &1i32.to_le_bytes());
    }

    #[test]
    fn test_call_patchable_site() {
        let mut asm = Assembler::new(64);
        asm.nop();
        let site = asm.call_patchable();
        assert_eq!(site, 1);
        let code = asm.into_buffer().finish().unwrap();
        assert_eq!(code[1], 0xE8);
        assert_eq!(&code[2..6], &[0, 0, 0, 0]);
    }

    #[test]
    fn test_push_pop_extended() {
        // push r11; pop r11 => 41 53 41 5B
        assert_eq!(
            bytes(|a| {
                a.push(Gpr::R11);
                a.pop(Gpr::R11);
            }),
            vec![0x41, 0x53, 0x41, 0x5B]
        );
    }

    #[test]
    fn test_sse_add() {
        // addsd xmm0, xmm1 => F2 0F 58 C1
        assert_eq!(
            bytes(|a| a.adds(true, Xmm::Xmm0, Xmm::Xmm1)),
            vec![0xF2, 0x0F, 0x58, 0xC1]
        );
    }

    #[test]
    fn test_movq_round_trip_encodings() {
        // movq xmm0, rax => 66 48 0F 6E C0 ; movq rax, xmm0 => 66 48 0F 7E C0
        assert_eq!(
            bytes(|a| a.movq_xr(Xmm::Xmm0, Gpr::Rax)),
            vec![0x66, 0x48, 0x0F, 0x6E, 0xC0]
        );
        assert_eq!(
            bytes(|a| a.movq_rx(Gpr::Rax, Xmm::Xmm0)),
            vec![0x66, 0x48, 0x0F, 0x7E, 0xC0]
        );
    }

    #[test]
    fn test_idiv_sequence() {
        // cqo; idiv rcx => 48 99 48 F7 F9
        assert_eq!(
            bytes(|a| {
                a.cqo(true);
                a.idiv_r(true, Gpr::Rcx);
            }),
            vec![0x48, 0x99, 0x48, 0xF7, 0xF9]
        );
    }

    #[test]
    fn test_mfence() {
        assert_eq!(bytes(|a| a.mfence()), vec![0x0F, 0xAE, 0xF0]);
    }

    #[test]
    fn test_lock_cmpxchg() {
        // lock cmpxchg [rdi], rsi => F0 48 0F B1 37
        assert_eq!(
            bytes(|a| a.lock_cmpxchg(true, &Mem::base(Gpr::Rdi, 0), Gpr::Rsi)),
            vec![0xF0, 0x48, 0x0F, 0xB1, 0x37]
        );
    }
}
