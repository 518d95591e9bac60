//! x86-64 semantic emitter.
//!
//! Implements the [`Emitter`] contract over the x86-64 instruction methods:
//! rel32 placeholders with fixups, movabs/imm32 immediate selection, and
//! RIP-relative indirection stubs through the GOT (ELF/Mach-O) or the IAT
//! (Windows).
//!
//! The shared contract is three-address; where the ISA is two-address the
//! implementation materializes through moves, spilling into R11 when the
//! destination aliases the right operand.

use crate::emitter::{
    Cond, Emitter, EmitterCore, FixupKind, FloatWidth, ResolvedTarget, SegmentLayout,
    GLOBAL_SIGIL,
};
use crate::error::{BackendError, Result};
use crate::symbols::{RelocationKind, RelocationRecord, Segment};
use crate::target::Target;

use super::registers::{Reg64, Xmm, FSCRATCH, SCRATCH};

/// Jcc opcode byte (after 0F) for an architecture-neutral condition
fn jcc_opcode(cond: Cond) -> u8 {
    match cond {
        Cond::Eq => 0x84,
        Cond::Ne => 0x85,
        Cond::Lt => 0x8C,
        Cond::Le => 0x8E,
        Cond::Gt => 0x8F,
        Cond::Ge => 0x8D,
        Cond::Ult => 0x82,
        Cond::Ule => 0x86,
        Cond::Ugt => 0x87,
        Cond::Uge => 0x83,
    }
}

/// SETcc opcode byte (after 0F) for an architecture-neutral condition
fn setcc_opcode(cond: Cond) -> u8 {
    match cond {
        Cond::Eq => 0x94,
        Cond::Ne => 0x95,
        Cond::Lt => 0x9C,
        Cond::Le => 0x9E,
        Cond::Gt => 0x9F,
        Cond::Ge => 0x9D,
        Cond::Ult => 0x92,
        Cond::Ule => 0x96,
        Cond::Ugt => 0x97,
        Cond::Uge => 0x93,
    }
}

/// x86-64 code emitter. One instance per compilation unit.
pub struct X64Emitter {
    core: EmitterCore,
    target: Target,
}

impl X64Emitter {
    pub fn new(target: Target) -> Self {
        Self {
            core: EmitterCore::new(),
            target,
        }
    }

    /// Two-address binary op with three-address semantics
    fn binop(
        &mut self,
        dst: Reg64,
        lhs: Reg64,
        rhs: Reg64,
        op: fn(&mut crate::buffer::CodeBuffer, Reg64, Reg64),
    ) {
        if dst == lhs {
            op(&mut self.core.code, dst, rhs);
        } else if dst == rhs {
            self.core.code.mov_r64_r64(SCRATCH, lhs);
            op(&mut self.core.code, SCRATCH, rhs);
            self.core.code.mov_r64_r64(dst, SCRATCH);
        } else {
            self.core.code.mov_r64_r64(dst, lhs);
            op(&mut self.core.code, dst, rhs);
        }
    }

    // Inherent ops with no arch-neutral counterpart.

    /// PUSH r64
    pub fn push(&mut self, reg: Reg64) {
        self.core.code.push_r64(reg);
    }

    /// POP r64
    pub fn pop(&mut self, reg: Reg64) {
        self.core.code.pop_r64(reg);
    }

    /// SYSCALL
    pub fn syscall(&mut self) {
        self.core.code.syscall();
    }

    /// INT3 breakpoint
    pub fn int3(&mut self) {
        self.core.code.int3();
    }

    /// NEG r64
    pub fn neg(&mut self, dst: Reg64) {
        self.core.code.neg_r64(dst);
    }

    /// NOT r64
    pub fn not(&mut self, dst: Reg64) {
        self.core.code.not_r64(dst);
    }

    /// SHL r64, CL - variable shift (amount staged in RCX by the caller)
    pub fn shl_cl(&mut self, dst: Reg64) {
        self.core.code.shl_r64_cl(dst);
    }

    /// SAR r64, CL - variable arithmetic shift right
    pub fn sar_cl(&mut self, dst: Reg64) {
        self.core.code.sar_r64_cl(dst);
    }

    /// MOVQ r64, xmm - raw bit-pattern move out of the XMM bank
    pub fn movq_to_gpr(&mut self, dst: Reg64, src: Xmm) {
        self.core.code.movq_r_x(dst, src);
    }

    /// MOVQ xmm, r64 - raw bit-pattern move into the XMM bank
    pub fn movq_from_gpr(&mut self, dst: Xmm, src: Reg64) {
        self.core.code.movq_x_r(dst, src);
    }
}

impl Emitter for X64Emitter {
    type Reg = Reg64;
    type FReg = Xmm;

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
        // shorter sign-extended form whenever the value allows it
        if let Ok(imm32) = i32::try_from(value) {
            self.core.code.mov_r64_imm32(dst, imm32);
        } else {
            self.core.code.mov_r64_imm64(dst, value as u64);
        }
    }

    fn mov_reg(&mut self, dst: Reg64, src: Reg64) {
        self.core.code.mov_r64_r64(dst, src);
    }

    // ==================== Integer arithmetic ====================

    fn add(&mut self, dst: Reg64, lhs: Reg64, rhs: Reg64) {
        if dst == rhs && dst != lhs {
            // commutative: fold the other way instead of shuffling
            self.core.code.add_r64_r64(dst, lhs);
        } else {
            self.binop(dst, lhs, rhs, |c, a, b| c.add_r64_r64(a, b));
        }
    }

    fn sub(&mut self, dst: Reg64, lhs: Reg64, rhs: Reg64) {
        self.binop(dst, lhs, rhs, |c, a, b| c.sub_r64_r64(a, b));
    }

    fn mul(&mut self, dst: Reg64, lhs: Reg64, rhs: Reg64) {
        if dst == rhs && dst != lhs {
            self.core.code.imul_r64_r64(dst, lhs);
        } else {
            self.binop(dst, lhs, rhs, |c, a, b| c.imul_r64_r64(a, b));
        }
    }

    fn sdiv(&mut self, dst: Reg64, lhs: Reg64, rhs: Reg64) {
        // IDIV is anchored to RDX:RAX; route the divisor around both
        let divisor = if rhs == Reg64::RAX || rhs == Reg64::RDX {
            self.core.code.mov_r64_r64(SCRATCH, rhs);
            SCRATCH
        } else {
            rhs
        };
        if lhs != Reg64::RAX {
            self.core.code.mov_r64_r64(Reg64::RAX, lhs);
        }
        self.core.code.cqo();
        self.core.code.idiv_r64(divisor);
        if dst != Reg64::RAX {
            self.core.code.mov_r64_r64(dst, Reg64::RAX);
        }
    }

    fn add_imm(&mut self, dst: Reg64, src: Reg64, imm: i32) -> Result<()> {
        if dst != src {
            self.core.code.mov_r64_r64(dst, src);
        }
        self.core.code.add_r64_imm32(dst, imm);
        Ok(())
    }

    fn sub_imm(&mut self, dst: Reg64, src: Reg64, imm: i32) -> Result<()> {
        if dst != src {
            self.core.code.mov_r64_r64(dst, src);
        }
        self.core.code.sub_r64_imm32(dst, imm);
        Ok(())
    }

    // ==================== Bitwise ====================

    fn and_reg(&mut self, dst: Reg64, lhs: Reg64, rhs: Reg64) {
        if dst == rhs && dst != lhs {
            self.core.code.and_r64_r64(dst, lhs);
        } else {
            self.binop(dst, lhs, rhs, |c, a, b| c.and_r64_r64(a, b));
        }
    }

    fn or_reg(&mut self, dst: Reg64, lhs: Reg64, rhs: Reg64) {
        if dst == rhs && dst != lhs {
            self.core.code.or_r64_r64(dst, lhs);
        } else {
            self.binop(dst, lhs, rhs, |c, a, b| c.or_r64_r64(a, b));
        }
    }

    fn xor_reg(&mut self, dst: Reg64, lhs: Reg64, rhs: Reg64) {
        if dst == rhs && dst != lhs {
            self.core.code.xor_r64_r64(dst, lhs);
        } else {
            self.binop(dst, lhs, rhs, |c, a, b| c.xor_r64_r64(a, b));
        }
    }

    fn and_imm(&mut self, dst: Reg64, src: Reg64, imm: u64) {
        if dst != src {
            self.core.code.mov_r64_r64(dst, src);
        }
        if let Ok(imm32) = i32::try_from(imm as i64) {
            self.core.code.and_r64_imm32(dst, imm32);
        } else {
            self.core.code.mov_r64_imm64(SCRATCH, imm);
            self.core.code.and_r64_r64(dst, SCRATCH);
        }
    }

    fn or_imm(&mut self, dst: Reg64, src: Reg64, imm: u64) {
        if dst != src {
            self.core.code.mov_r64_r64(dst, src);
        }
        if let Ok(imm32) = i32::try_from(imm as i64) {
            self.core.code.or_r64_imm32(dst, imm32);
        } else {
            self.core.code.mov_r64_imm64(SCRATCH, imm);
            self.core.code.or_r64_r64(dst, SCRATCH);
        }
    }

    fn xor_imm(&mut self, dst: Reg64, src: Reg64, imm: u64) {
        if dst != src {
            self.core.code.mov_r64_r64(dst, src);
        }
        if let Ok(imm32) = i32::try_from(imm as i64) {
            self.core.code.xor_r64_imm32(dst, imm32);
        } else {
            self.core.code.mov_r64_imm64(SCRATCH, imm);
            self.core.code.xor_r64_r64(dst, SCRATCH);
        }
    }

    fn tst_imm(&mut self, reg: Reg64, imm: u64) {
        if let Ok(imm32) = i32::try_from(imm as i64) {
            self.core.code.test_r64_imm32(reg, imm32);
        } else {
            self.core.code.mov_r64_imm64(SCRATCH, imm);
            self.core.code.test_r64_r64(reg, SCRATCH);
        }
    }

    fn shl_imm(&mut self, dst: Reg64, src: Reg64, amount: u8) -> Result<()> {
        if amount > 63 {
            return Err(BackendError::InvalidOperand {
                message: format!("shift amount {} out of range", amount),
            });
        }
        if dst != src {
            self.core.code.mov_r64_r64(dst, src);
        }
        self.core.code.shl_r64_imm8(dst, amount);
        Ok(())
    }

    fn shr_imm(&mut self, dst: Reg64, src: Reg64, amount: u8) -> Result<()> {
        if amount > 63 {
            return Err(BackendError::InvalidOperand {
                message: format!("shift amount {} out of range", amount),
            });
        }
        if dst != src {
            self.core.code.mov_r64_r64(dst, src);
        }
        self.core.code.shr_r64_imm8(dst, amount);
        Ok(())
    }

    fn sar_imm(&mut self, dst: Reg64, src: Reg64, amount: u8) -> Result<()> {
        if amount > 63 {
            return Err(BackendError::InvalidOperand {
                message: format!("shift amount {} out of range", amount),
            });
        }
        if dst != src {
            self.core.code.mov_r64_r64(dst, src);
        }
        self.core.code.sar_r64_imm8(dst, amount);
        Ok(())
    }

    // ==================== Comparison ====================

    fn cmp(&mut self, lhs: Reg64, rhs: Reg64) {
        self.core.code.cmp_r64_r64(lhs, rhs);
    }

    fn cmp_imm(&mut self, lhs: Reg64, imm: i32) -> Result<()> {
        self.core.code.cmp_r64_imm32(lhs, imm);
        Ok(())
    }

    fn set_cond(&mut self, dst: Reg64, cond: Cond) {
        self.core.code.setcc(setcc_opcode(cond), dst);
        self.core.code.movzx_r64_r8(dst, dst);
    }

    // ==================== Memory ====================

    fn load(&mut self, dst: Reg64, base: Reg64, offset: i32) -> Result<()> {
        self.core.code.mov_r64_mem(dst, base, offset);
        Ok(())
    }

    fn store(&mut self, src: Reg64, base: Reg64, offset: i32) -> Result<()> {
        self.core.code.mov_mem_r64(base, offset, src);
        Ok(())
    }

    fn load_u8(&mut self, dst: Reg64, base: Reg64, offset: i32) -> Result<()> {
        self.core.code.movzx_r64_m8(dst, base, offset);
        Ok(())
    }

    fn store_u8(&mut self, src: Reg64, base: Reg64, offset: i32) -> Result<()> {
        self.core.code.mov_m8_r8(base, offset, src);
        Ok(())
    }

    // ==================== Control flow ====================

    fn branch(&mut self, label: &str) {
        let target = self.core.scoped(label);
        let disp = self.core.code.jmp_rel32();
        self.core.push_fixup(disp, FixupKind::Rel32, Some(target));
    }

    fn branch_cond(&mut self, cond: Cond, label: &str) {
        let target = self.core.scoped(label);
        let disp = self.core.code.jcc_rel32(jcc_opcode(cond));
        self.core.push_fixup(disp, FixupKind::Rel32, Some(target));
    }

    fn branch_zero(&mut self, reg: Reg64, label: &str) {
        self.core.code.test_r64_r64(reg, reg);
        self.branch_cond(Cond::Eq, label);
    }

    fn branch_nonzero(&mut self, reg: Reg64, label: &str) {
        self.core.code.test_r64_r64(reg, reg);
        self.branch_cond(Cond::Ne, label);
    }

    fn call_label(&mut self, label: &str) {
        let target = self.core.scoped(label);
        let disp = self.core.code.call_rel32();
        self.core.push_fixup(disp, FixupKind::Rel32, Some(target));
    }

    fn call_reg(&mut self, reg: Reg64) {
        self.core.code.call_r64(reg);
    }

    fn call_extern(&mut self, name: &str) {
        // resolves through the indirection stub bound at finalize
        let target = format!("{}{}", GLOBAL_SIGIL, name);
        let disp = self.core.code.call_rel32();
        self.core.push_fixup(disp, FixupKind::Rel32, Some(target));
    }

    fn addr_of(&mut self, dst: Reg64, label: &str) {
        let target = self.core.scoped(label);
        let disp = self.core.code.lea_rip(dst);
        self.core.push_fixup(disp, FixupKind::Rel32, Some(target));
    }

    fn addr_of_page(&mut self, dst: Reg64, label: &str) {
        // no page-relative addressing on x86-64; RIP-relative LEA covers it
        self.addr_of(dst, label);
    }

    fn ret(&mut self) {
        self.core.code.ret();
    }

    fn nop(&mut self) {
        self.core.code.nop();
    }

    // ==================== Floating point ====================

    fn fmov(&mut self, dst: Xmm, src: Xmm) {
        self.core.code.movsd_rr(dst, src);
    }

    fn fadd(&mut self, dst: Xmm, lhs: Xmm, rhs: Xmm) {
        if dst != lhs {
            self.core.code.movsd_rr(dst, lhs);
        }
        self.core.code.addsd(dst, rhs);
    }

    fn fsub(&mut self, dst: Xmm, lhs: Xmm, rhs: Xmm) {
        if dst == rhs && dst != lhs {
            self.core.code.movsd_rr(FSCRATCH, lhs);
            self.core.code.subsd(FSCRATCH, rhs);
            self.core.code.movsd_rr(dst, FSCRATCH);
        } else {
            if dst != lhs {
                self.core.code.movsd_rr(dst, lhs);
            }
            self.core.code.subsd(dst, rhs);
        }
    }

    fn fmul(&mut self, dst: Xmm, lhs: Xmm, rhs: Xmm) {
        if dst != lhs {
            self.core.code.movsd_rr(dst, lhs);
        }
        self.core.code.mulsd(dst, rhs);
    }

    fn fdiv(&mut self, dst: Xmm, lhs: Xmm, rhs: Xmm) {
        if dst == rhs && dst != lhs {
            self.core.code.movsd_rr(FSCRATCH, lhs);
            self.core.code.divsd(FSCRATCH, rhs);
            self.core.code.movsd_rr(dst, FSCRATCH);
        } else {
            if dst != lhs {
                self.core.code.movsd_rr(dst, lhs);
            }
            self.core.code.divsd(dst, rhs);
        }
    }

    fn fneg(&mut self, dst: Xmm, src: Xmm) {
        // flip the sign bit; SSE2 has no scalar negate
        if dst != src {
            self.core.code.movsd_rr(dst, src);
        }
        self.core.code.mov_r64_imm64(SCRATCH, 0x8000_0000_0000_0000);
        self.core.code.movq_x_r(FSCRATCH, SCRATCH);
        self.core.code.xorpd(dst, FSCRATCH);
    }

    fn fcmp(&mut self, lhs: Xmm, rhs: Xmm) {
        self.core.code.ucomisd(lhs, rhs);
    }

    fn fload(&mut self, dst: Xmm, base: Reg64, offset: i32) -> Result<()> {
        self.core.code.movsd_load(dst, base, offset);
        Ok(())
    }

    fn fstore(&mut self, src: Xmm, base: Reg64, offset: i32) -> Result<()> {
        self.core.code.movsd_store(base, offset, src);
        Ok(())
    }

    fn int_to_f64(&mut self, dst: Xmm, src: Reg64) {
        self.core.code.cvtsi2sd(dst, src);
    }

    fn f64_to_int(&mut self, dst: Reg64, src: Xmm) {
        self.core.code.cvttsd2si(dst, src);
    }

    fn fcvt(&mut self, dst: Xmm, src: Xmm, from: FloatWidth, to: FloatWidth) -> Result<()> {
        match (from, to) {
            (FloatWidth::Single, FloatWidth::Double) => {
                self.core.code.cvtss2sd(dst, src);
                Ok(())
            }
            (FloatWidth::Double, FloatWidth::Single) => {
                self.core.code.cvtsd2ss(dst, src);
                Ok(())
            }
            (a, b) if a == b => {
                self.core.code.movsd_rr(dst, src);
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
            // MOV r11, [rip + slot]; JMP r11
            let disp = self.core.code.mov_r64_rip(SCRATCH);
            let kind = if use_iat {
                FixupKind::IatStub { slot: ext.slot }
            } else {
                FixupKind::GotStub { slot: ext.slot }
            };
            self.core.push_fixup(disp, kind, None);
            self.core.code.jmp_r64(SCRATCH);
        }
        self.core.layout_strings();
        tracing::debug!(
            stubs = externs.len(),
            code_len = self.core.code.offset(),
            data_len = self.core.data.offset(),
            "x64 finalize"
        );
    }

    fn fixup_all(&mut self, layout: &SegmentLayout) -> Result<()> {
        // reset so repeated invocation cannot duplicate entries
        self.core.relocations.clear();
        let mut failures: Vec<BackendError> = Vec::new();
        let fixups = self.core.fixups.clone();
        for fixup in &fixups {
            // fixup.offset addresses the disp32 field itself
            let next_instr = layout.code_vaddr + fixup.offset as u64 + 4;
            let patch = |code: &mut crate::buffer::CodeBuffer, target: u64| -> Result<()> {
                let disp = target as i64 - next_instr as i64;
                if i32::try_from(disp).is_err() {
                    return Err(BackendError::OutOfRange {
                        kind: "rel32",
                        offset: fixup.offset,
                        value: disp,
                    });
                }
                code.patch_i32(fixup.offset, disp as i32);
                Ok(())
            };
            match &fixup.kind {
                FixupKind::GotStub { slot } => {
                    if let Err(e) = patch(&mut self.core.code, layout.got_slot(*slot)) {
                        failures.push(e);
                    }
                }
                FixupKind::IatStub { slot } => {
                    if let Err(e) = patch(&mut self.core.code, layout.iat_slot(*slot)) {
                        failures.push(e);
                    }
                }
                FixupKind::Rel32 => {
                    let Some(name) = fixup.target.as_deref() else {
                        failures.push(BackendError::InvalidOperand {
                            message: format!("fixup at {:#x} has no target label", fixup.offset),
                        });
                        continue;
                    };
                    match self.core.resolve_fixup_target(name, layout) {
                        ResolvedTarget::Address(target) => {
                            if let Err(e) = patch(&mut self.core.code, target) {
                                failures.push(e);
                            }
                        }
                        ResolvedTarget::External(symbol) => {
                            self.core.relocations.push(RelocationRecord {
                                offset: fixup.offset,
                                symbol,
                                kind: RelocationKind::X64Rel32,
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
                other => {
                    failures.push(BackendError::InvalidOperand {
                        message: format!("fixup kind {:?} is not encodable on x86-64", other),
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

    fn emitter() -> X64Emitter {
        X64Emitter::new(Target::new(Arch::X64, Os::Linux))
    }

    #[test]
    fn test_mov_imm_short_form() {
        let mut e = emitter();
        e.mov_imm(Reg64::RAX, 5);
        assert_eq!(e.code(), &[0x48, 0xC7, 0xC0, 0x05, 0x00, 0x00, 0x00]);
    }

    #[test]
    fn test_mov_imm_negative_short_form() {
        let mut e = emitter();
        e.mov_imm(Reg64::RAX, -1);
        assert_eq!(e.code(), &[0x48, 0xC7, 0xC0, 0xFF, 0xFF, 0xFF, 0xFF]);
    }

    #[test]
    fn test_mov_imm_movabs() {
        let mut e = emitter();
        e.mov_imm(Reg64::RAX, 0x123456789ABCDEF0u64 as i64);
        assert_eq!(e.code().len(), 10);
        assert_eq!(&e.code()[..2], &[0x48, 0xB8]);
        assert_eq!(
            u64::from_le_bytes(e.code()[2..10].try_into().unwrap()),
            0x123456789ABCDEF0
        );
    }

    #[test]
    fn test_branch_patch_roundtrip() {
        let mut e = emitter();
        e.begin_function("f");
        e.branch("end");
        e.nop();
        e.nop();
        e.label("end");
        e.ret();
        e.finalize();
        e.fixup_all(&SegmentLayout::default()).unwrap();
        // jmp at 0, disp at 1; target offset 7; disp = 7 - 5 = 2
        assert_eq!(&e.code()[..5], &[0xE9, 0x02, 0x00, 0x00, 0x00]);
    }

    #[test]
    fn test_cond_branch_backward() {
        let mut e = emitter();
        e.begin_function("f");
        e.label("head");
        e.nop();
        e.branch_cond(Cond::Lt, "head");
        e.finalize();
        e.fixup_all(&SegmentLayout::default()).unwrap();
        // jl at 1, disp at 3, next instr at 7, target 0 → disp = -7
        assert_eq!(&e.code()[1..7], &[0x0F, 0x8C, 0xF9, 0xFF, 0xFF, 0xFF]);
    }

    #[test]
    fn test_set_cond_sequence() {
        let mut e = emitter();
        e.set_cond(Reg64::RAX, Cond::Ne);
        // setne al; movzx rax, al
        assert_eq!(e.code(), &[0x0F, 0x95, 0xC0, 0x48, 0x0F, 0xB6, 0xC0]);
    }

    #[test]
    fn test_three_address_add_materializes() {
        let mut e = emitter();
        e.add(Reg64::RCX, Reg64::RAX, Reg64::RBX);
        // mov rcx, rax; add rcx, rbx
        assert_eq!(e.code(), &[0x48, 0x89, 0xC1, 0x48, 0x01, 0xD9]);
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
            code_vaddr: 0x401000,
            data_vaddr: 0x100000,
            got_offset: 64,
            iat_vaddr: 0,
        };
        e.fixup_all(&layout).unwrap();
        let code = e.code();
        // call rel32 (5) + ret (1), stub at 6: 4C 8B 1D disp32 41 FF E3
        assert_eq!(&code[6..9], &[0x4C, 0x8B, 0x1D]);
        let disp = i32::from_le_bytes(code[9..13].try_into().unwrap());
        let rip = layout.code_vaddr + 13;
        assert_eq!(rip as i64 + disp as i64, 0x100000 + 64);
        assert_eq!(&code[13..16], &[0x41, 0xFF, 0xE3]);
        // call displacement reaches the stub
        let call_disp = i32::from_le_bytes(code[1..5].try_into().unwrap());
        assert_eq!(layout.code_vaddr as i64 + 5 + call_disp as i64, layout.code_vaddr as i64 + 6);
    }

    #[test]
    fn test_iat_stub_on_windows() {
        let mut e = X64Emitter::new(Target::new(Arch::X64, Os::Windows));
        e.begin_function("main");
        e.register_external("ExitProcess", 0);
        e.call_extern("ExitProcess");
        e.ret();
        e.finalize();
        let layout = SegmentLayout {
            code_vaddr: 0x140001000,
            data_vaddr: 0x140003000,
            got_offset: 0,
            iat_vaddr: 0x140002000,
        };
        e.fixup_all(&layout).unwrap();
        let code = e.code();
        let disp = i32::from_le_bytes(code[9..13].try_into().unwrap());
        let rip = layout.code_vaddr + 13;
        assert_eq!(rip as i64 + disp as i64, 0x140002000);
    }

    #[test]
    fn test_cl_shift_and_bit_moves() {
        let mut e = emitter();
        e.shl_cl(Reg64::RAX);
        e.movq_to_gpr(Reg64::RAX, Xmm::XMM0);
        // shl rax, cl ; movq rax, xmm0
        assert_eq!(&e.code()[..3], &[0x48, 0xD3, 0xE0]);
        assert_eq!(&e.code()[3..], &[0x66, 0x48, 0x0F, 0x7E, 0xC0]);
    }

    #[test]
    fn test_fneg_sequence() {
        let mut e = emitter();
        e.fneg(Xmm::XMM0, Xmm::XMM0);
        // movabs r11, 1<<63; movq xmm15, r11; xorpd xmm0, xmm15
        assert_eq!(&e.code()[..2], &[0x49, 0xBB]);
        assert_eq!(&e.code()[10..15], &[0x66, 0x4D, 0x0F, 0x6E, 0xFB]);
        assert_eq!(&e.code()[15..], &[0x66, 0x41, 0x0F, 0x57, 0xC7]);
    }
}
