//! ARM64 semantic emitter.
//!
//! Implements the [`Emitter`] contract on top of the A64 word builders:
//! placeholder emission with fixups for unknown targets, MOVZ/MOVK/MOVN
//! immediate synthesis, automatic scaled/unscaled addressing selection, and
//! the two-pass resolver with ADRP+LDR+BR indirection stubs.

use crate::buffer::CodeBuffer;
use crate::emitter::{
    Cond, Emitter, EmitterCore, FixupKind, FloatWidth, ResolvedTarget, SegmentLayout,
    GLOBAL_SIGIL,
};
use crate::error::{BackendError, Result};
use crate::symbols::{RelocationKind, RelocationRecord, Segment};
use crate::target::Target;

use super::encoding;
use super::registers::{FReg, Reg64, SCRATCH};

/// ARM64 code emitter. One instance per compilation unit.
pub struct Arm64Emitter {
    core: EmitterCore,
    target: Target,
}

impl Arm64Emitter {
    pub fn new(target: Target) -> Self {
        Self {
            core: EmitterCore::new(),
            target,
        }
    }

    fn buf(&mut self) -> &mut CodeBuffer {
        &mut self.core.code
    }

    /// MOVZ/MOVK chain for non-negative values, MOVN-seeded chain for
    /// negative ones. Only non-zero (resp. non-0xFFFF) chunks are emitted;
    /// the seeding instruction always is.
    fn emit_mov_imm(&mut self, rd: Reg64, value: i64) {
        let v = value as u64;
        if value < 0 {
            let inv = !v;
            encoding::movn_x(self.buf(), rd, (inv & 0xFFFF) as u16, 0);
            for shift in [16u8, 32, 48] {
                let chunk = ((v >> shift) & 0xFFFF) as u16;
                if chunk != 0xFFFF {
                    encoding::movk_x(self.buf(), rd, chunk, shift);
                }
            }
        } else if v == 0 {
            encoding::movz_x(self.buf(), rd, 0, 0);
        } else {
            let mut first = true;
            for shift in [0u8, 16, 32, 48] {
                let chunk = ((v >> shift) & 0xFFFF) as u16;
                if chunk != 0 {
                    if first {
                        encoding::movz_x(self.buf(), rd, chunk, shift);
                        first = false;
                    } else {
                        encoding::movk_x(self.buf(), rd, chunk, shift);
                    }
                }
            }
        }
    }

    // Inherent ops with no arch-neutral counterpart. The frame and system
    // instructions are driven directly by the prologue/epilogue and runtime
    // generators above this crate.

    /// STP Xt1, Xt2, [Xn, #offset]!
    pub fn stp_pre(&mut self, rt1: Reg64, rt2: Reg64, rn: Reg64, offset: i16) {
        encoding::stp_pre_x(self.buf(), rt1, rt2, rn, offset);
    }

    /// LDP Xt1, Xt2, [Xn], #offset
    pub fn ldp_post(&mut self, rt1: Reg64, rt2: Reg64, rn: Reg64, offset: i16) {
        encoding::ldp_post_x(self.buf(), rt1, rt2, rn, offset);
    }

    /// UDIV - unsigned divide
    pub fn udiv(&mut self, rd: Reg64, rn: Reg64, rm: Reg64) {
        encoding::udiv_x(self.buf(), rd, rn, rm);
    }

    /// MSUB - rd = ra - rn*rm (remainder synthesis)
    pub fn msub(&mut self, rd: Reg64, rn: Reg64, rm: Reg64, ra: Reg64) {
        encoding::msub_x(self.buf(), rd, rn, rm, ra);
    }

    /// CSEL - conditional select
    pub fn csel(&mut self, rd: Reg64, rn: Reg64, rm: Reg64, cond: Cond) {
        encoding::csel_x(self.buf(), rd, rn, rm, encoding::Condition::from_cond(cond));
    }

    /// LSL (register) - variable shift left
    pub fn lsl(&mut self, rd: Reg64, rn: Reg64, rm: Reg64) {
        encoding::lslv_x(self.buf(), rd, rn, rm);
    }

    /// LSR (register) - variable logical shift right
    pub fn lsr(&mut self, rd: Reg64, rn: Reg64, rm: Reg64) {
        encoding::lsrv_x(self.buf(), rd, rn, rm);
    }

    /// ASR (register) - variable arithmetic shift right
    pub fn asr(&mut self, rd: Reg64, rn: Reg64, rm: Reg64) {
        encoding::asrv_x(self.buf(), rd, rn, rm);
    }

    /// FMOV Xd, Dn - raw bit-pattern move out of the FP bank
    pub fn fmov_to_gpr(&mut self, dst: Reg64, src: FReg) {
        encoding::fmov_x_d(self.buf(), dst, src);
    }

    /// FMOV Dd, Xn - raw bit-pattern move into the FP bank
    pub fn fmov_from_gpr(&mut self, dst: FReg, src: Reg64) {
        encoding::fmov_d_x(self.buf(), dst, src);
    }

    /// SVC - supervisor call
    pub fn svc(&mut self, imm: u16) {
        encoding::svc(self.buf(), imm);
    }

    /// BRK - breakpoint
    pub fn brk(&mut self, imm: u16) {
        encoding::brk(self.buf(), imm);
    }
}

/// Check that `value` fits a signed `bits`-wide field
fn fits_signed(value: i64, bits: u32) -> bool {
    let bound = 1i64 << (bits - 1);
    (-bound..bound).contains(&value)
}

/// Re-encode one fixup site with its resolved absolute target
fn patch_site(code: &mut CodeBuffer, offset: usize, kind: &FixupKind, instr_addr: u64, target: u64) -> Result<()> {
    let disp = target as i64 - instr_addr as i64;
    match kind {
        FixupKind::Branch26 => {
            if !fits_signed(disp, 28) {
                return Err(BackendError::OutOfRange {
                    kind: "branch26",
                    offset,
                    value: disp,
                });
            }
            let word = code.read_u32(offset);
            let imm26 = ((disp >> 2) as u32) & 0x03FF_FFFF;
            code.patch_u32(offset, (word & 0xFC00_0000) | imm26);
        }
        FixupKind::CondBranch19(cond) => {
            if !fits_signed(disp, 21) {
                return Err(BackendError::OutOfRange {
                    kind: "cond-branch19",
                    offset,
                    value: disp,
                });
            }
            // full reconstruction; condition code comes from the fixup payload
            let cc = encoding::Condition::from_cond(*cond) as u32;
            let imm19 = ((disp >> 2) as u32) & 0x7FFFF;
            code.patch_u32(offset, 0x5400_0000 | (imm19 << 5) | cc);
        }
        FixupKind::CmpBranch19 => {
            if !fits_signed(disp, 21) {
                return Err(BackendError::OutOfRange {
                    kind: "cmp-branch19",
                    offset,
                    value: disp,
                });
            }
            // Rt and the CBZ/CBNZ opcode stay in the placeholder
            let word = code.read_u32(offset);
            let imm19 = ((disp >> 2) as u32) & 0x7FFFF;
            code.patch_u32(offset, (word & !(0x7FFFF << 5)) | (imm19 << 5));
        }
        FixupKind::Adr21 => {
            if !fits_signed(disp, 21) {
                return Err(BackendError::OutOfRange {
                    kind: "adr21",
                    offset,
                    value: disp,
                });
            }
            let word = code.read_u32(offset);
            let imm = disp as u32;
            let patched =
                (word & 0x9F00_001F) | ((imm & 0x3) << 29) | (((imm >> 2) & 0x7FFFF) << 5);
            code.patch_u32(offset, patched);
        }
        FixupKind::Page21 => {
            let pages = ((target >> 12) as i64) - ((instr_addr >> 12) as i64);
            if !fits_signed(pages, 21) {
                return Err(BackendError::OutOfRange {
                    kind: "page21",
                    offset,
                    value: pages,
                });
            }
            let word = code.read_u32(offset);
            let imm = pages as u32;
            let patched =
                (word & 0x9F00_001F) | ((imm & 0x3) << 29) | (((imm >> 2) & 0x7FFFF) << 5);
            code.patch_u32(offset, patched);
        }
        FixupKind::PageOff12 => {
            let lo12 = (target & 0xFFF) as u32;
            let word = code.read_u32(offset);
            code.patch_u32(offset, (word & !(0xFFF << 10)) | (lo12 << 10));
        }
        FixupKind::Rel32 | FixupKind::GotStub { .. } | FixupKind::IatStub { .. } => {
            return Err(BackendError::InvalidOperand {
                message: format!("fixup kind {:?} has no label-relative form on arm64", kind),
            });
        }
    }
    Ok(())
}

impl Emitter for Arm64Emitter {
    type Reg = Reg64;
    type FReg = FReg;

    fn core(&self) -> &EmitterCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut EmitterCore {
        &mut self.core
    }

    fn target(&self) -> Target {
        self.target
    }

    // ==================== Data movement ====================

    fn mov_imm(&mut self, dst: Reg64, value: i64) {
        self.emit_mov_imm(dst, value);
    }

    fn mov_reg(&mut self, dst: Reg64, src: Reg64) {
        encoding::mov_x(self.buf(), dst, src);
    }

    // ==================== Integer arithmetic ====================

    fn add(&mut self, dst: Reg64, lhs: Reg64, rhs: Reg64) {
        encoding::add_x(self.buf(), dst, lhs, rhs);
    }

    fn sub(&mut self, dst: Reg64, lhs: Reg64, rhs: Reg64) {
        encoding::sub_x(self.buf(), dst, lhs, rhs);
    }

    fn mul(&mut self, dst: Reg64, lhs: Reg64, rhs: Reg64) {
        encoding::mul_x(self.buf(), dst, lhs, rhs);
    }

    fn sdiv(&mut self, dst: Reg64, lhs: Reg64, rhs: Reg64) {
        encoding::sdiv_x(self.buf(), dst, lhs, rhs);
    }

    fn add_imm(&mut self, dst: Reg64, src: Reg64, imm: i32) -> Result<()> {
        if (0..=0xFFF).contains(&imm) {
            encoding::add_imm_x(self.buf(), dst, src, imm as u16);
        } else if (-0xFFF..0).contains(&imm) {
            encoding::sub_imm_x(self.buf(), dst, src, (-imm) as u16);
        } else {
            // same correctness-over-density route as the logical immediates
            self.emit_mov_imm(SCRATCH, imm as i64);
            encoding::add_x(self.buf(), dst, src, SCRATCH);
        }
        Ok(())
    }

    fn sub_imm(&mut self, dst: Reg64, src: Reg64, imm: i32) -> Result<()> {
        if (0..=0xFFF).contains(&imm) {
            encoding::sub_imm_x(self.buf(), dst, src, imm as u16);
        } else if (-0xFFF..0).contains(&imm) {
            encoding::add_imm_x(self.buf(), dst, src, (-imm) as u16);
        } else {
            self.emit_mov_imm(SCRATCH, imm as i64);
            encoding::sub_x(self.buf(), dst, src, SCRATCH);
        }
        Ok(())
    }

    // ==================== Bitwise ====================

    fn and_reg(&mut self, dst: Reg64, lhs: Reg64, rhs: Reg64) {
        encoding::and_x(self.buf(), dst, lhs, rhs);
    }

    fn or_reg(&mut self, dst: Reg64, lhs: Reg64, rhs: Reg64) {
        encoding::orr_x(self.buf(), dst, lhs, rhs);
    }

    fn xor_reg(&mut self, dst: Reg64, lhs: Reg64, rhs: Reg64) {
        encoding::eor_x(self.buf(), dst, lhs, rhs);
    }

    // The logical-immediate bitmask encoding is never synthesized: the
    // constant goes through the scratch register and the register form.

    fn and_imm(&mut self, dst: Reg64, src: Reg64, imm: u64) {
        self.emit_mov_imm(SCRATCH, imm as i64);
        encoding::and_x(self.buf(), dst, src, SCRATCH);
    }

    fn or_imm(&mut self, dst: Reg64, src: Reg64, imm: u64) {
        self.emit_mov_imm(SCRATCH, imm as i64);
        encoding::orr_x(self.buf(), dst, src, SCRATCH);
    }

    fn xor_imm(&mut self, dst: Reg64, src: Reg64, imm: u64) {
        self.emit_mov_imm(SCRATCH, imm as i64);
        encoding::eor_x(self.buf(), dst, src, SCRATCH);
    }

    fn tst_imm(&mut self, reg: Reg64, imm: u64) {
        self.emit_mov_imm(SCRATCH, imm as i64);
        encoding::tst_x(self.buf(), reg, SCRATCH);
    }

    fn shl_imm(&mut self, dst: Reg64, src: Reg64, amount: u8) -> Result<()> {
        if amount > 63 {
            return Err(BackendError::InvalidOperand {
                message: format!("shift amount {} out of range", amount),
            });
        }
        encoding::lsl_imm_x(self.buf(), dst, src, amount);
        Ok(())
    }

    fn shr_imm(&mut self, dst: Reg64, src: Reg64, amount: u8) -> Result<()> {
        if amount > 63 {
            return Err(BackendError::InvalidOperand {
                message: format!("shift amount {} out of range", amount),
            });
        }
        encoding::lsr_imm_x(self.buf(), dst, src, amount);
        Ok(())
    }

    fn sar_imm(&mut self, dst: Reg64, src: Reg64, amount: u8) -> Result<()> {
        if amount > 63 {
            return Err(BackendError::InvalidOperand {
                message: format!("shift amount {} out of range", amount),
            });
        }
        encoding::asr_imm_x(self.buf(), dst, src, amount);
        Ok(())
    }

    // ==================== Comparison ====================

    fn cmp(&mut self, lhs: Reg64, rhs: Reg64) {
        encoding::cmp_x(self.buf(), lhs, rhs);
    }

    fn cmp_imm(&mut self, lhs: Reg64, imm: i32) -> Result<()> {
        if (0..=0xFFF).contains(&imm) {
            encoding::cmp_imm_x(self.buf(), lhs, imm as u16);
        } else {
            self.emit_mov_imm(SCRATCH, imm as i64);
            encoding::cmp_x(self.buf(), lhs, SCRATCH);
        }
        Ok(())
    }

    fn set_cond(&mut self, dst: Reg64, cond: Cond) {
        encoding::cset_x(self.buf(), dst, encoding::Condition::from_cond(cond));
    }

    // ==================== Memory ====================

    // Scaled 12-bit form when the offset is a non-negative multiple of the
    // access width that fits after scaling; unscaled 9-bit form otherwise.

    fn load(&mut self, dst: Reg64, base: Reg64, offset: i32) -> Result<()> {
        if offset >= 0 && offset % 8 == 0 && offset / 8 <= 0xFFF {
            encoding::ldr_x_imm(self.buf(), dst, base, offset as u16);
        } else if (-256..256).contains(&offset) {
            encoding::ldur_x(self.buf(), dst, base, offset as i16);
        } else {
            return Err(BackendError::InvalidOperand {
                message: format!("load offset {} not encodable", offset),
            });
        }
        Ok(())
    }

    fn store(&mut self, src: Reg64, base: Reg64, offset: i32) -> Result<()> {
        if offset >= 0 && offset % 8 == 0 && offset / 8 <= 0xFFF {
            encoding::str_x_imm(self.buf(), src, base, offset as u16);
        } else if (-256..256).contains(&offset) {
            encoding::stur_x(self.buf(), src, base, offset as i16);
        } else {
            return Err(BackendError::InvalidOperand {
                message: format!("store offset {} not encodable", offset),
            });
        }
        Ok(())
    }

    fn load_u8(&mut self, dst: Reg64, base: Reg64, offset: i32) -> Result<()> {
        if (0..=0xFFF).contains(&offset) {
            encoding::ldrb_imm(self.buf(), dst, base, offset as u16);
        } else if (-256..256).contains(&offset) {
            encoding::ldurb(self.buf(), dst, base, offset as i16);
        } else {
            return Err(BackendError::InvalidOperand {
                message: format!("byte load offset {} not encodable", offset),
            });
        }
        Ok(())
    }

    fn store_u8(&mut self, src: Reg64, base: Reg64, offset: i32) -> Result<()> {
        if (0..=0xFFF).contains(&offset) {
            encoding::strb_imm(self.buf(), src, base, offset as u16);
        } else if (-256..256).contains(&offset) {
            encoding::sturb(self.buf(), src, base, offset as i16);
        } else {
            return Err(BackendError::InvalidOperand {
                message: format!("byte store offset {} not encodable", offset),
            });
        }
        Ok(())
    }

    // ==================== Control flow ====================

    fn branch(&mut self, label: &str) {
        let target = self.core.scoped(label);
        let offset = self.core.code.offset();
        encoding::b(self.buf(), 0);
        self.core.push_fixup(offset, FixupKind::Branch26, Some(target));
    }

    fn branch_cond(&mut self, cond: Cond, label: &str) {
        let target = self.core.scoped(label);
        let offset = self.core.code.offset();
        encoding::b_cond(self.buf(), encoding::Condition::from_cond(cond), 0);
        self.core
            .push_fixup(offset, FixupKind::CondBranch19(cond), Some(target));
    }

    fn branch_zero(&mut self, reg: Reg64, label: &str) {
        let target = self.core.scoped(label);
        let offset = self.core.code.offset();
        encoding::cbz_x(self.buf(), reg, 0);
        self.core.push_fixup(offset, FixupKind::CmpBranch19, Some(target));
    }

    fn branch_nonzero(&mut self, reg: Reg64, label: &str) {
        let target = self.core.scoped(label);
        let offset = self.core.code.offset();
        encoding::cbnz_x(self.buf(), reg, 0);
        self.core.push_fixup(offset, FixupKind::CmpBranch19, Some(target));
    }

    fn call_label(&mut self, label: &str) {
        let target = self.core.scoped(label);
        let offset = self.core.code.offset();
        encoding::bl(self.buf(), 0);
        self.core.push_fixup(offset, FixupKind::Branch26, Some(target));
    }

    fn call_reg(&mut self, reg: Reg64) {
        encoding::blr(self.buf(), reg);
    }

    fn call_extern(&mut self, name: &str) {
        // resolves through the indirection stub bound at finalize
        let target = format!("{}{}", GLOBAL_SIGIL, name);
        let offset = self.core.code.offset();
        encoding::bl(self.buf(), 0);
        self.core.push_fixup(offset, FixupKind::Branch26, Some(target));
    }

    fn addr_of(&mut self, dst: Reg64, label: &str) {
        let target = self.core.scoped(label);
        let offset = self.core.code.offset();
        encoding::adr(self.buf(), dst, 0);
        self.core.push_fixup(offset, FixupKind::Adr21, Some(target));
    }

    fn addr_of_page(&mut self, dst: Reg64, label: &str) {
        let target = self.core.scoped(label);
        let offset = self.core.code.offset();
        encoding::adrp(self.buf(), dst, 0);
        self.core
            .push_fixup(offset, FixupKind::Page21, Some(target.clone()));
        let add_offset = self.core.code.offset();
        encoding::add_imm_x(self.buf(), dst, dst, 0);
        self.core
            .push_fixup(add_offset, FixupKind::PageOff12, Some(target));
    }

    fn ret(&mut self) {
        encoding::ret(self.buf());
    }

    fn nop(&mut self) {
        encoding::nop(self.buf());
    }

    // ==================== Floating point ====================

    fn fmov(&mut self, dst: FReg, src: FReg) {
        encoding::fmov_d(self.buf(), dst, src);
    }

    fn fadd(&mut self, dst: FReg, lhs: FReg, rhs: FReg) {
        encoding::fadd_d(self.buf(), dst, lhs, rhs);
    }

    fn fsub(&mut self, dst: FReg, lhs: FReg, rhs: FReg) {
        encoding::fsub_d(self.buf(), dst, lhs, rhs);
    }

    fn fmul(&mut self, dst: FReg, lhs: FReg, rhs: FReg) {
        encoding::fmul_d(self.buf(), dst, lhs, rhs);
    }

    fn fdiv(&mut self, dst: FReg, lhs: FReg, rhs: FReg) {
        encoding::fdiv_d(self.buf(), dst, lhs, rhs);
    }

    fn fneg(&mut self, dst: FReg, src: FReg) {
        encoding::fneg_d(self.buf(), dst, src);
    }

    fn fcmp(&mut self, lhs: FReg, rhs: FReg) {
        encoding::fcmp_d(self.buf(), lhs, rhs);
    }

    fn fload(&mut self, dst: FReg, base: Reg64, offset: i32) -> Result<()> {
        if offset >= 0 && offset % 8 == 0 && offset / 8 <= 0xFFF {
            encoding::ldr_d_imm(self.buf(), dst, base, offset as u16);
        } else if (-256..256).contains(&offset) {
            encoding::ldur_d(self.buf(), dst, base, offset as i16);
        } else {
            return Err(BackendError::InvalidOperand {
                message: format!("fp load offset {} not encodable", offset),
            });
        }
        Ok(())
    }

    fn fstore(&mut self, src: FReg, base: Reg64, offset: i32) -> Result<()> {
        if offset >= 0 && offset % 8 == 0 && offset / 8 <= 0xFFF {
            encoding::str_d_imm(self.buf(), src, base, offset as u16);
        } else if (-256..256).contains(&offset) {
            encoding::stur_d(self.buf(), src, base, offset as i16);
        } else {
            return Err(BackendError::InvalidOperand {
                message: format!("fp store offset {} not encodable", offset),
            });
        }
        Ok(())
    }

    fn int_to_f64(&mut self, dst: FReg, src: Reg64) {
        encoding::scvtf_d_x(self.buf(), dst, src);
    }

    fn f64_to_int(&mut self, dst: Reg64, src: FReg) {
        encoding::fcvtzs_x_d(self.buf(), dst, src);
    }

    fn fcvt(&mut self, dst: FReg, src: FReg, from: FloatWidth, to: FloatWidth) -> Result<()> {
        match (from, to) {
            (FloatWidth::Single, FloatWidth::Double) => {
                encoding::fcvt_d_s(self.buf(), dst, src);
                Ok(())
            }
            (FloatWidth::Double, FloatWidth::Single) => {
                encoding::fcvt_s_d(self.buf(), dst, src);
                Ok(())
            }
            (a, b) if a == b => {
                encoding::fmov_d(self.buf(), dst, src);
                Ok(())
            }
            (from, to) => Err(BackendError::UnsupportedConversion {
                from: from.name(),
                to: to.name(),
            }),
        }
    }

    // ==================== Resolution ====================

    fn finalize(&mut self) {
        let use_iat = self.target.uses_iat();
        let externs = self.core.externals.entries().to_vec();
        for ext in &externs {
            let stub_offset = self.core.code.offset();
            let stub_label = format!("{}{}", GLOBAL_SIGIL, ext.name);
            self.core
                .labels
                .define(&stub_label, stub_offset, Segment::Code);
            // ADRP X16, page; LDR X16, [X16, #lo12]; BR X16
            encoding::adrp(self.buf(), SCRATCH, 0);
            encoding::ldr_x_imm(self.buf(), SCRATCH, SCRATCH, 0);
            encoding::br(self.buf(), SCRATCH);
            let kind = if use_iat {
                FixupKind::IatStub { slot: ext.slot }
            } else {
                FixupKind::GotStub { slot: ext.slot }
            };
            self.core.push_fixup(stub_offset, kind, None);
        }
        self.core.layout_strings();
        tracing::debug!(
            stubs = externs.len(),
            code_len = self.core.code.offset(),
            data_len = self.core.data.offset(),
            "arm64 finalize"
        );
    }

    fn fixup_all(&mut self, layout: &SegmentLayout) -> Result<()> {
        // reset so repeated invocation cannot duplicate entries
        self.core.relocations.clear();
        let mut failures: Vec<BackendError> = Vec::new();
        let fixups = self.core.fixups.clone();
        for fixup in &fixups {
            let instr_addr = layout.code_vaddr + fixup.offset as u64;
            match &fixup.kind {
                FixupKind::GotStub { slot } | FixupKind::IatStub { slot } => {
                    let slot_addr = match fixup.kind {
                        FixupKind::IatStub { .. } => layout.iat_slot(*slot),
                        _ => layout.got_slot(*slot),
                    };
                    // ADRP word, then the LDR's scaled low-12 page offset
                    if let Err(e) = patch_site(
                        &mut self.core.code,
                        fixup.offset,
                        &FixupKind::Page21,
                        instr_addr,
                        slot_addr,
                    ) {
                        failures.push(e);
                        continue;
                    }
                    let lo12 = (slot_addr & 0xFFF) as u32;
                    let ldr = self.core.code.read_u32(fixup.offset + 4);
                    self.core
                        .code
                        .patch_u32(fixup.offset + 4, (ldr & !(0xFFF << 10)) | ((lo12 / 8) << 10));
                    continue;
                }
                _ => {}
            }
            let Some(name) = fixup.target.as_deref() else {
                failures.push(BackendError::InvalidOperand {
                    message: format!("fixup at {:#x} has no target label", fixup.offset),
                });
                continue;
            };
            match self.core.resolve_fixup_target(name, layout) {
                ResolvedTarget::Address(target) => {
                    if let Err(e) =
                        patch_site(&mut self.core.code, fixup.offset, &fixup.kind, instr_addr, target)
                    {
                        failures.push(e);
                    }
                }
                ResolvedTarget::External(symbol) => {
                    let kind = match fixup.kind {
                        FixupKind::Branch26 => RelocationKind::Arm64Branch26,
                        FixupKind::Adr21 => RelocationKind::Arm64Adr21,
                        FixupKind::Page21 => RelocationKind::Arm64Page21,
                        FixupKind::PageOff12 => RelocationKind::Arm64PageOff12,
                        _ => {
                            failures.push(BackendError::InvalidOperand {
                                message: format!(
                                    "fixup kind {:?} cannot target undefined symbol `{}`",
                                    fixup.kind, symbol
                                ),
                            });
                            continue;
                        }
                    };
                    self.core.relocations.push(RelocationRecord {
                        offset: fixup.offset,
                        symbol,
                        kind,
                    });
                }
                ResolvedTarget::Missing(label) => {
                    tracing::error!(label = %label, offset = fixup.offset, "unresolved label");
                    failures.push(BackendError::UnresolvedLabel {
                        label,
                        offset: fixup.offset,
                    });
                }
            }
        }
        if failures.is_empty() {
            Ok(())
        } else {
            Err(BackendError::FixupFailed { errors: failures })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::target::{Arch, Os};

    fn emitter() -> Arm64Emitter {
        Arm64Emitter::new(Target::new(Arch::Arm64, Os::MacOs))
    }

    fn words(e: &Arm64Emitter) -> Vec<u32> {
        e.code()
            .chunks(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect()
    }

    /// Decode a MOVZ/MOVK/MOVN chain back into the value it loads
    fn decode_imm_chain(words: &[u32]) -> u64 {
        let mut value = 0u64;
        for &w in words {
            let imm16 = ((w >> 5) & 0xFFFF) as u64;
            let shift = ((w >> 21) & 0x3) * 16;
            if w & 0xFF80_0000 == 0x9280_0000 {
                // MOVN
                value = !(imm16 << shift);
            } else if w & 0xFF80_0000 == 0xD280_0000 {
                // MOVZ
                value = imm16 << shift;
            } else {
                // MOVK
                value = (value & !(0xFFFFu64 << shift)) | (imm16 << shift);
            }
        }
        value
    }

    #[test]
    fn test_mov_imm_golden_movz() {
        let mut e = emitter();
        e.mov_imm(Reg64::X0, 5);
        // MOVZ X0, #5
        assert_eq!(e.code(), &[0xA0, 0x00, 0x80, 0xD2]);
    }

    #[test]
    fn test_mov_imm_skips_zero_chunks() {
        let mut e = emitter();
        e.mov_imm(Reg64::X0, 0x0001_0000_0000);
        // single MOVZ with hw=2
        assert_eq!(words(&e), vec![0xD2C00020]);
    }

    #[test]
    fn test_mov_imm_roundtrip() {
        for value in [
            0i64,
            5,
            -1,
            -2,
            0x123456789ABCDEF0u64 as i64,
            i64::MIN,
            i64::MAX,
            -0x10000,
            0xFFFF_0000_0000u64 as i64,
        ] {
            let mut e = emitter();
            e.mov_imm(Reg64::X9, value);
            assert_eq!(
                decode_imm_chain(&words(&e)) as i64,
                value,
                "value {:#x} did not round-trip",
                value
            );
        }
    }

    #[test]
    fn test_mov_imm_negative_one_is_single_movn() {
        let mut e = emitter();
        e.mov_imm(Reg64::X1, -1);
        // MOVN X1, #0
        assert_eq!(words(&e), vec![0x92800001]);
    }

    #[test]
    fn test_scaled_vs_unscaled_selection() {
        let mut e = emitter();
        e.load(Reg64::X0, Reg64::X1, 16).unwrap();
        e.load(Reg64::X0, Reg64::X1, -8).unwrap();
        e.load(Reg64::X0, Reg64::X1, 12).unwrap();
        let w = words(&e);
        assert_eq!(w[0] & 0xFFC0_0000, 0xF940_0000, "scaled LDR");
        assert_eq!(w[1] & 0xFFE0_0C00, 0xF840_0000, "unscaled LDUR");
        assert_eq!(w[2] & 0xFFE0_0C00, 0xF840_0000, "unaligned goes unscaled");
    }

    #[test]
    fn test_load_rejects_unencodable_offset() {
        let mut e = emitter();
        assert!(e.load(Reg64::X0, Reg64::X1, 32768 + 7).is_err());
        assert!(e.store(Reg64::X0, Reg64::X1, -257).is_err());
    }

    #[test]
    fn test_logical_imm_goes_through_scratch() {
        let mut e = emitter();
        e.and_imm(Reg64::X0, Reg64::X0, 0xFF00FF00FF00FF00);
        let w = words(&e);
        // chain into X16 then AND X0, X0, X16
        assert_eq!(*w.last().unwrap(), 0x8A100000);
        assert!(w.len() > 2);
    }

    #[test]
    fn test_branch_fixup_and_patch() {
        let mut e = emitter();
        e.begin_function("f");
        e.branch("end");
        e.nop();
        e.label("end");
        e.ret();
        assert_eq!(e.fixups().len(), 1);
        e.finalize();
        e.fixup_all(&SegmentLayout::default()).unwrap();
        let w = words(&e);
        // B +8 = 0x14000002
        assert_eq!(w[0], 0x14000002);
    }

    #[test]
    fn test_cond_branch_reinserts_condition() {
        let mut e = emitter();
        e.begin_function("f");
        e.branch_cond(Cond::Lt, "out");
        e.nop();
        e.label("out");
        e.ret();
        e.finalize();
        e.fixup_all(&SegmentLayout::default()).unwrap();
        let w = words(&e);
        // B.LT +8: imm19=2, cond=LT(0b1011)
        assert_eq!(w[0], 0x5400004B);
    }

    #[test]
    fn test_cbz_register_preserved_in_placeholder() {
        let mut e = emitter();
        e.begin_function("f");
        e.branch_zero(Reg64::X7, "out");
        e.nop();
        e.nop();
        e.label("out");
        e.ret();
        e.finalize();
        e.fixup_all(&SegmentLayout::default()).unwrap();
        let w = words(&e);
        // CBZ X7, +12: imm19=3, Rt=7
        assert_eq!(w[0], 0xB4000067);
    }

    #[test]
    fn test_variable_shift_and_bit_moves() {
        let mut e = emitter();
        e.lsl(Reg64::X0, Reg64::X1, Reg64::X2);
        e.fmov_to_gpr(Reg64::X0, FReg::D0);
        e.fmov_from_gpr(FReg::D0, Reg64::X0);
        let w = words(&e);
        assert_eq!(w[0], 0x9AC22020);
        assert_eq!(w[1], 0x9E660000);
        assert_eq!(w[2], 0x9E670000);
    }

    #[test]
    fn test_unsupported_fcvt() {
        let mut e = emitter();
        let err = e
            .fcvt(FReg::D0, FReg::D1, FloatWidth::Double, FloatWidth::Half)
            .unwrap_err();
        assert!(matches!(err, BackendError::UnsupportedConversion { .. }));
    }

    #[test]
    fn test_got_stub_decodes_to_slot_address() {
        let mut e = emitter();
        e.begin_function("main");
        e.register_external("printf", 1);
        e.call_extern("printf");
        e.ret();
        e.finalize();
        let layout = SegmentLayout {
            code_vaddr: 0x4000,
            data_vaddr: 0x100000,
            got_offset: 64,
            iat_vaddr: 0,
        };
        e.fixup_all(&layout).unwrap();
        let w = words(&e);
        // stub starts after BL + RET
        let stub_idx = 2;
        let stub_addr = layout.code_vaddr + (stub_idx as u64) * 4;
        // decode ADRP
        let adrp = w[stub_idx];
        let immlo = (adrp >> 29) & 0x3;
        let immhi = (adrp >> 5) & 0x7FFFF;
        let pages = (((immhi << 2) | immlo) as i64) << 43 >> 43;
        let page = ((stub_addr >> 12) as i64 + pages) << 12;
        // decode LDR offset
        let ldr = w[stub_idx + 1];
        let lo12 = ((ldr >> 10) & 0xFFF) * 8;
        assert_eq!(page as u64 + lo12 as u64, 0x100000 + 64);
        // BL patched to reach the stub
        let bl = w[0];
        let imm26 = ((bl & 0x03FF_FFFF) as i64) << 38 >> 38;
        assert_eq!(layout.code_vaddr as i64 + imm26 * 4, stub_addr as i64);
    }
}
