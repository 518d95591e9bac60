//! x86-64 register definitions.
//!
//! All 16 general-purpose 64-bit registers and the XMM bank, with encoding
//! values and the System V AMD64 / Win64 calling convention tables.

use std::fmt;

/// x86-64 64-bit general purpose register
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Reg64 {
    RAX = 0,
    RCX = 1,
    RDX = 2,
    RBX = 3,
    RSP = 4,
    RBP = 5,
    RSI = 6,
    RDI = 7,
    R8 = 8,
    R9 = 9,
    R10 = 10,
    R11 = 11,
    R12 = 12,
    R13 = 13,
    R14 = 14,
    R15 = 15,
}

impl Reg64 {
    /// Get the 3-bit encoding for ModR/M and SIB bytes
    #[inline]
    pub fn encoding(self) -> u8 {
        (self as u8) & 0x07
    }

    /// Check if this register requires REX.B or REX.R bit
    #[inline]
    pub fn needs_rex_ext(self) -> bool {
        (self as u8) >= 8
    }

    /// Check if this register is callee-saved (System V ABI)
    pub fn is_callee_saved(self) -> bool {
        matches!(
            self,
            Reg64::RBX | Reg64::RBP | Reg64::R12 | Reg64::R13 | Reg64::R14 | Reg64::R15
        )
    }

    /// Check if this register is caller-saved (System V ABI)
    pub fn is_caller_saved(self) -> bool {
        !self.is_callee_saved() && self != Reg64::RSP
    }
}

impl fmt::Display for Reg64 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Reg64::RAX => "rax",
            Reg64::RCX => "rcx",
            Reg64::RDX => "rdx",
            Reg64::RBX => "rbx",
            Reg64::RSP => "rsp",
            Reg64::RBP => "rbp",
            Reg64::RSI => "rsi",
            Reg64::RDI => "rdi",
            Reg64::R8 => "r8",
            Reg64::R9 => "r9",
            Reg64::R10 => "r10",
            Reg64::R11 => "r11",
            Reg64::R12 => "r12",
            Reg64::R13 => "r13",
            Reg64::R14 => "r14",
            Reg64::R15 => "r15",
        };
        write!(f, "{}", name)
    }
}

/// SSE2 register (double-precision scalar operand)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Xmm {
    XMM0 = 0,
    XMM1 = 1,
    XMM2 = 2,
    XMM3 = 3,
    XMM4 = 4,
    XMM5 = 5,
    XMM6 = 6,
    XMM7 = 7,
    XMM8 = 8,
    XMM9 = 9,
    XMM10 = 10,
    XMM11 = 11,
    XMM12 = 12,
    XMM13 = 13,
    XMM14 = 14,
    XMM15 = 15,
}

impl Xmm {
    #[inline]
    pub fn encoding(self) -> u8 {
        (self as u8) & 0x07
    }

    #[inline]
    pub fn needs_rex_ext(self) -> bool {
        (self as u8) >= 8
    }
}

impl fmt::Display for Xmm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "xmm{}", *self as u8)
    }
}

/// Scratch register for synthesized constants and two-address shuffling.
/// Never handed out by the register allocator above this crate.
pub const SCRATCH: Reg64 = Reg64::R11;

/// Floating point scratch register
pub const FSCRATCH: Xmm = Xmm::XMM15;

/// System V AMD64 ABI argument registers (in order) - Linux and macOS
pub const SYSV_ARG_REGS: [Reg64; 6] = [
    Reg64::RDI,
    Reg64::RSI,
    Reg64::RDX,
    Reg64::RCX,
    Reg64::R8,
    Reg64::R9,
];

/// System V AMD64 ABI floating point argument registers (in order)
pub const SYSV_FLOAT_ARG_REGS: [Xmm; 8] = [
    Xmm::XMM0,
    Xmm::XMM1,
    Xmm::XMM2,
    Xmm::XMM3,
    Xmm::XMM4,
    Xmm::XMM5,
    Xmm::XMM6,
    Xmm::XMM7,
];

/// System V AMD64 ABI return register
pub const SYSV_RET_REG: Reg64 = Reg64::RAX;

/// System V AMD64 ABI callee-saved registers
pub const SYSV_CALLEE_SAVED: [Reg64; 6] = [
    Reg64::RBX,
    Reg64::RBP,
    Reg64::R12,
    Reg64::R13,
    Reg64::R14,
    Reg64::R15,
];

/// Windows x64 calling convention argument registers (in order)
pub const WIN64_ARG_REGS: [Reg64; 4] = [Reg64::RCX, Reg64::RDX, Reg64::R8, Reg64::R9];

/// Windows x64 floating point argument registers (in order)
pub const WIN64_FLOAT_ARG_REGS: [Xmm; 4] = [Xmm::XMM0, Xmm::XMM1, Xmm::XMM2, Xmm::XMM3];

/// Windows x64 calling convention return register
pub const WIN64_RET_REG: Reg64 = Reg64::RAX;

/// Windows x64 callee-saved registers (non-volatile)
pub const WIN64_CALLEE_SAVED: [Reg64; 8] = [
    Reg64::RBX,
    Reg64::RBP,
    Reg64::RDI,
    Reg64::RSI,
    Reg64::R12,
    Reg64::R13,
    Reg64::R14,
    Reg64::R15,
];

/// Scratch registers available for codegen (caller-saved, excluding special purpose)
pub const SCRATCH_REGS: [Reg64; 7] = [
    Reg64::RAX,
    Reg64::RCX,
    Reg64::RDX,
    Reg64::R8,
    Reg64::R9,
    Reg64::R10,
    Reg64::R11,
];
