//! Shared emitter contract and state.
//!
//! One `Emitter` trait, two conforming implementations (`Arm64Emitter`,
//! `X64Emitter`), selected once at build configuration by the driver. The
//! mutable emission state common to both architectures lives in
//! [`EmitterCore`]: code and data buffers, the label table, the external and
//! undefined symbol registries, the fixup list, and the relocation output.
//!
//! ## Two-pass resolution
//!
//! Pass 1 (emission): every reference to a not-yet-known target emits a
//! placeholder instruction with a zeroed offset field and records a
//! [`Fixup`]. Pass 2a (`finalize`) emits GOT/IAT indirection stubs and lays
//! out deferred strings. Pass 2b (`fixup_all`) patches every site using the
//! final segment base addresses supplied by the container writer, emitting
//! relocation records for symbols a static linker must still resolve.

use std::collections::HashMap;

use crate::buffer::CodeBuffer;
use crate::data::DataBuffer;
use crate::error::Result;
use crate::symbols::{
    ExternalSymbols, LabelTable, RelocationRecord, Segment, UndefinedSymbols,
};
use crate::target::Target;

/// Names starting with this sigil are globally scoped: function entries,
/// extern stubs, and generated data labels. Everything else is prefixed
/// with the enclosing function name.
pub const GLOBAL_SIGIL: char = '@';

/// Architecture-neutral branch condition.
///
/// Mapped to ARM64 condition codes and x86-64 Jcc opcodes by the
/// respective emitters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cond {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Ult,
    Ule,
    Ugt,
    Uge,
}

/// Floating point operand width
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FloatWidth {
    Half,
    Single,
    Double,
}

impl FloatWidth {
    pub fn name(self) -> &'static str {
        match self {
            FloatWidth::Half => "f16",
            FloatWidth::Single => "f32",
            FloatWidth::Double => "f64",
        }
    }
}

/// What a recorded fixup site needs in order to be re-encoded.
///
/// Operand registers are re-extracted by masking the placeholder word, not
/// duplicated here; the condition code is the one payload the placeholder
/// cannot reproduce on its own (`B.cond` is rebuilt from scratch).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FixupKind {
    /// ARM64 B/BL: signed 26-bit word-granular displacement
    Branch26,
    /// ARM64 B.cond: signed 19-bit word-granular displacement
    CondBranch19(Cond),
    /// ARM64 CBZ/CBNZ: signed 19-bit word-granular displacement,
    /// Rt kept in the placeholder's low 5 bits
    CmpBranch19,
    /// ARM64 ADR: signed 21-bit byte displacement
    Adr21,
    /// ARM64 ADRP: signed 21-bit page delta
    Page21,
    /// ARM64 ADD/LDR immediate carrying the low 12 bits of a page offset
    PageOff12,
    /// x86-64 jmp/call/Jcc: signed 32-bit byte displacement
    Rel32,
    /// GOT indirection stub; target computed from the slot, not a label
    GotStub { slot: u32 },
    /// IAT indirection stub (Windows)
    IatStub { slot: u32 },
}

/// A deferred machine-code patch recorded during emission
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fixup {
    /// Byte offset of the patch site in the code buffer
    pub offset: usize,
    pub kind: FixupKind,
    /// Fully scoped target label; `None` for stub fixups
    pub target: Option<String>,
}

/// Final segment base virtual addresses, decided by the container writer
/// after file layout.
#[derive(Debug, Clone, Copy, Default)]
pub struct SegmentLayout {
    pub code_vaddr: u64,
    pub data_vaddr: u64,
    /// Offset of the GOT inside the data segment (8-byte aligned)
    pub got_offset: u64,
    /// Import address table base; only meaningful on Windows targets
    pub iat_vaddr: u64,
}

impl SegmentLayout {
    /// Absolute address of a GOT slot
    pub fn got_slot(&self, slot: u32) -> u64 {
        self.data_vaddr + self.got_offset + slot as u64 * 8
    }

    /// Absolute address of an IAT slot
    pub fn iat_slot(&self, slot: u32) -> u64 {
        self.iat_vaddr + slot as u64 * 8
    }
}

/// Where a fixup target ended up after label resolution
pub(crate) enum ResolvedTarget {
    /// Absolute virtual address
    Address(u64),
    /// Registered undefined symbol (bare name): leave the placeholder,
    /// report a relocation record
    External(String),
    /// Unknown: hard error
    Missing(String),
}

/// Mutable emission state shared by both architecture emitters.
///
/// Created fresh per compilation unit, populated single-threaded, consumed
/// by `finalize`/`fixup_all`. Never shared across units.
#[derive(Debug, Default)]
pub struct EmitterCore {
    pub(crate) code: CodeBuffer,
    pub(crate) data: DataBuffer,
    pub(crate) labels: LabelTable,
    pub(crate) externals: ExternalSymbols,
    pub(crate) undefined: UndefinedSymbols,
    pub(crate) fixups: Vec<Fixup>,
    pub(crate) relocations: Vec<RelocationRecord>,
    /// Enclosing function name used to prefix non-global labels
    scope: Option<String>,
    /// Strings registered during emission, laid out at `finalize`
    strings: Vec<(String, String)>,
    next_string: u32,
    /// Dedup maps for 64-bit data constants, keyed by bit pattern
    qword_labels: HashMap<u64, String>,
    f64_labels: HashMap<u64, String>,
}

impl EmitterCore {
    pub fn new() -> Self {
        Self {
            code: CodeBuffer::with_capacity(4096),
            ..Default::default()
        }
    }

    /// Apply function scoping: global-sigil names pass through untouched
    pub(crate) fn scoped(&self, name: &str) -> String {
        if name.starts_with(GLOBAL_SIGIL) {
            return name.to_string();
        }
        match &self.scope {
            Some(scope) => format!("{}.{}", scope, name),
            None => name.to_string(),
        }
    }

    /// Bind a (scoped) label to the current code offset
    pub(crate) fn label(&mut self, name: &str) {
        let scoped = self.scoped(name);
        let offset = self.code.offset();
        self.labels.define(&scoped, offset, Segment::Code);
    }

    /// Enter a function: set the label scope and bind the global entry
    /// label `@<name>` at the current code offset.
    pub(crate) fn begin_function(&mut self, name: &str) {
        let entry = format!("{}{}", GLOBAL_SIGIL, name);
        let offset = self.code.offset();
        self.labels.define(&entry, offset, Segment::Code);
        self.scope = Some(name.to_string());
    }

    pub(crate) fn alias_label(&mut self, alias: &str, target: &str) {
        let alias = self.scoped(alias);
        let target = self.scoped(target);
        self.labels.alias(&alias, &target);
    }

    /// Register a string constant; bytes are laid out at `finalize`.
    /// Returns the generated global label.
    pub(crate) fn add_string(&mut self, s: &str) -> String {
        let label = format!("{}str.{}", GLOBAL_SIGIL, self.next_string);
        self.next_string += 1;
        self.strings.push((label.clone(), s.to_string()));
        label
    }

    /// Add a deduplicated 64-bit constant to the data section
    pub(crate) fn add_qword(&mut self, value: u64) -> String {
        if let Some(label) = self.qword_labels.get(&value) {
            return label.clone();
        }
        self.data.align8();
        let label = format!("{}qword.{:#x}", GLOBAL_SIGIL, self.data.offset());
        self.labels.define(&label, self.data.offset(), Segment::Data);
        self.data.emit_u64(value);
        self.qword_labels.insert(value, label.clone());
        label
    }

    /// Add a deduplicated IEEE-754 double to the data section
    pub(crate) fn add_f64(&mut self, value: f64) -> String {
        let bits = value.to_bits();
        if let Some(label) = self.f64_labels.get(&bits) {
            return label.clone();
        }
        self.data.align8();
        let label = format!("{}f64.{:#x}", GLOBAL_SIGIL, self.data.offset());
        self.labels.define(&label, self.data.offset(), Segment::Data);
        self.data.emit_u64(bits);
        self.f64_labels.insert(bits, label.clone());
        label
    }

    /// Bind a caller-named data label at the current data offset.
    /// The same scoping rule as code labels applies.
    pub(crate) fn add_data_label(&mut self, name: &str) {
        let scoped = self.scoped(name);
        let offset = self.data.offset();
        self.labels.define(&scoped, offset, Segment::Data);
    }

    /// Lay out deferred strings into the data buffer (finalize step 2)
    pub(crate) fn layout_strings(&mut self) {
        let strings = std::mem::take(&mut self.strings);
        for (label, contents) in strings {
            self.labels.define(&label, self.data.offset(), Segment::Data);
            self.data.emit_cstr(&contents);
        }
    }

    pub(crate) fn push_fixup(&mut self, offset: usize, kind: FixupKind, target: Option<String>) {
        self.fixups.push(Fixup {
            offset,
            kind,
            target,
        });
    }

    /// Classify a fixup target once labels and registries are final
    pub(crate) fn resolve_fixup_target(
        &self,
        name: &str,
        layout: &SegmentLayout,
    ) -> ResolvedTarget {
        match self.labels.resolve(name) {
            Some((offset, Segment::Code)) => {
                ResolvedTarget::Address(layout.code_vaddr + offset as u64)
            }
            Some((offset, Segment::Data)) => {
                ResolvedTarget::Address(layout.data_vaddr + offset as u64)
            }
            None => {
                let bare = name.trim_start_matches(GLOBAL_SIGIL);
                if self.undefined.contains(bare) {
                    ResolvedTarget::External(bare.to_string())
                } else {
                    ResolvedTarget::Missing(name.to_string())
                }
            }
        }
    }
}

/// The instruction emission contract shared by both architectures.
///
/// Register allocation happens above this layer; operands arrive as
/// validated register enums. Arithmetic is three-address; the x86-64
/// implementation materializes through moves where the ISA is two-address.
/// Methods taking unconstrained immediates return `Result` and reject
/// unencodable values instead of truncating them.
pub trait Emitter {
    /// General-purpose register type
    type Reg: Copy;
    /// Floating point register type
    type FReg: Copy;

    fn core(&self) -> &EmitterCore;
    fn core_mut(&mut self) -> &mut EmitterCore;
    fn target(&self) -> Target;

    // ==================== Labels & Symbols ====================

    /// Bind a label at the current code offset. Names starting with
    /// [`GLOBAL_SIGIL`] bypass per-function scoping.
    fn label(&mut self, name: &str) {
        self.core_mut().label(name);
    }

    /// Set the label scope and bind the `@<name>` entry label
    fn begin_function(&mut self, name: &str) {
        self.core_mut().begin_function(name);
    }

    /// Bind `alias` as an alias of `target` (chain depth bounded)
    fn alias_label(&mut self, alias: &str, target: &str) {
        self.core_mut().alias_label(alias, target);
    }

    /// Register a string constant, returning its data label
    fn add_string(&mut self, s: &str) -> String {
        self.core_mut().add_string(s)
    }

    /// Add a deduplicated 8-byte-aligned 64-bit constant
    fn add_qword(&mut self, value: u64) -> String {
        self.core_mut().add_qword(value)
    }

    /// Add a deduplicated 8-byte-aligned IEEE-754 double
    fn add_f64(&mut self, value: f64) -> String {
        self.core_mut().add_f64(value)
    }

    /// Bind a named data label at the current data offset
    fn add_data_label(&mut self, name: &str) {
        self.core_mut().add_data_label(name);
    }

    /// Register a dynamically-linked symbol; returns its GOT/IAT slot
    /// (idempotent per name).
    fn register_external(&mut self, name: &str, dylib: u16) -> u32 {
        self.core_mut().externals.register(name, dylib)
    }

    /// Register a statically-linked symbol to be defined later
    fn register_undefined(&mut self, name: &str) {
        self.core_mut().undefined.register(name);
    }

    // ==================== Output ====================

    fn code(&self) -> &[u8] {
        self.core().code.code()
    }

    fn data(&self) -> &[u8] {
        self.core().data.bytes()
    }

    fn relocations(&self) -> &[RelocationRecord] {
        &self.core().relocations
    }

    fn fixups(&self) -> &[Fixup] {
        &self.core().fixups
    }

    fn current_offset(&self) -> usize {
        self.core().code.offset()
    }

    // ==================== Data movement ====================

    fn mov_imm(&mut self, dst: Self::Reg, value: i64);
    fn mov_reg(&mut self, dst: Self::Reg, src: Self::Reg);

    // ==================== Integer arithmetic ====================

    fn add(&mut self, dst: Self::Reg, lhs: Self::Reg, rhs: Self::Reg);
    fn sub(&mut self, dst: Self::Reg, lhs: Self::Reg, rhs: Self::Reg);
    fn mul(&mut self, dst: Self::Reg, lhs: Self::Reg, rhs: Self::Reg);
    fn sdiv(&mut self, dst: Self::Reg, lhs: Self::Reg, rhs: Self::Reg);
    fn add_imm(&mut self, dst: Self::Reg, src: Self::Reg, imm: i32) -> Result<()>;
    fn sub_imm(&mut self, dst: Self::Reg, src: Self::Reg, imm: i32) -> Result<()>;

    // ==================== Bitwise ====================

    fn and_reg(&mut self, dst: Self::Reg, lhs: Self::Reg, rhs: Self::Reg);
    fn or_reg(&mut self, dst: Self::Reg, lhs: Self::Reg, rhs: Self::Reg);
    fn xor_reg(&mut self, dst: Self::Reg, lhs: Self::Reg, rhs: Self::Reg);
    /// Logical AND with an immediate. On ARM64 the constant goes through
    /// the scratch register, never the logical-immediate bitmask encoding.
    fn and_imm(&mut self, dst: Self::Reg, src: Self::Reg, imm: u64);
    fn or_imm(&mut self, dst: Self::Reg, src: Self::Reg, imm: u64);
    fn xor_imm(&mut self, dst: Self::Reg, src: Self::Reg, imm: u64);
    /// Set flags for `reg & imm` (TST / TEST)
    fn tst_imm(&mut self, reg: Self::Reg, imm: u64);
    fn shl_imm(&mut self, dst: Self::Reg, src: Self::Reg, amount: u8) -> Result<()>;
    fn shr_imm(&mut self, dst: Self::Reg, src: Self::Reg, amount: u8) -> Result<()>;
    fn sar_imm(&mut self, dst: Self::Reg, src: Self::Reg, amount: u8) -> Result<()>;

    // ==================== Comparison ====================

    fn cmp(&mut self, lhs: Self::Reg, rhs: Self::Reg);
    fn cmp_imm(&mut self, lhs: Self::Reg, imm: i32) -> Result<()>;
    /// Materialize a condition as 0/1 in a register
    fn set_cond(&mut self, dst: Self::Reg, cond: Cond);

    // ==================== Memory ====================

    /// 64-bit load from `[base + offset]`. The addressing form (scaled vs
    /// unscaled on ARM64, ModRM/SIB shape on x86-64) is chosen here, never
    /// by the caller.
    fn load(&mut self, dst: Self::Reg, base: Self::Reg, offset: i32) -> Result<()>;
    fn store(&mut self, src: Self::Reg, base: Self::Reg, offset: i32) -> Result<()>;
    /// Zero-extending byte load
    fn load_u8(&mut self, dst: Self::Reg, base: Self::Reg, offset: i32) -> Result<()>;
    fn store_u8(&mut self, src: Self::Reg, base: Self::Reg, offset: i32) -> Result<()>;

    // ==================== Control flow ====================

    fn branch(&mut self, label: &str);
    fn branch_cond(&mut self, cond: Cond, label: &str);
    fn branch_zero(&mut self, reg: Self::Reg, label: &str);
    fn branch_nonzero(&mut self, reg: Self::Reg, label: &str);
    fn call_label(&mut self, label: &str);
    fn call_reg(&mut self, reg: Self::Reg);
    /// Call a dynamically-linked symbol through its indirection stub
    fn call_extern(&mut self, name: &str);
    /// PC-relative address of a label
    fn addr_of(&mut self, dst: Self::Reg, label: &str);
    /// Page-granular address of a label (ADRP+ADD on ARM64; equivalent to
    /// `addr_of` on x86-64, which has no page-relative form)
    fn addr_of_page(&mut self, dst: Self::Reg, label: &str);
    fn ret(&mut self);
    fn nop(&mut self);

    // ==================== Floating point (f64) ====================

    fn fmov(&mut self, dst: Self::FReg, src: Self::FReg);
    fn fadd(&mut self, dst: Self::FReg, lhs: Self::FReg, rhs: Self::FReg);
    fn fsub(&mut self, dst: Self::FReg, lhs: Self::FReg, rhs: Self::FReg);
    fn fmul(&mut self, dst: Self::FReg, lhs: Self::FReg, rhs: Self::FReg);
    fn fdiv(&mut self, dst: Self::FReg, lhs: Self::FReg, rhs: Self::FReg);
    fn fneg(&mut self, dst: Self::FReg, src: Self::FReg);
    fn fcmp(&mut self, lhs: Self::FReg, rhs: Self::FReg);
    fn fload(&mut self, dst: Self::FReg, base: Self::Reg, offset: i32) -> Result<()>;
    fn fstore(&mut self, src: Self::FReg, base: Self::Reg, offset: i32) -> Result<()>;
    /// Signed 64-bit integer to double (explicit opcode, never implicit)
    fn int_to_f64(&mut self, dst: Self::FReg, src: Self::Reg);
    /// Double to signed 64-bit integer, truncating
    fn f64_to_int(&mut self, dst: Self::Reg, src: Self::FReg);
    /// Float width conversion; unimplemented widths are an error
    fn fcvt(
        &mut self,
        dst: Self::FReg,
        src: Self::FReg,
        from: FloatWidth,
        to: FloatWidth,
    ) -> Result<()>;

    // ==================== Resolution ====================

    /// Pass 2a: emit indirection stubs for registered externals and lay
    /// out deferred strings. Must run after all emission, before
    /// `fixup_all`.
    fn finalize(&mut self);

    /// Pass 2b: patch every fixup site using final base addresses and
    /// collect relocation records. Idempotent: the relocation list is
    /// reset on entry, so repeated invocation does not duplicate entries.
    fn fixup_all(&mut self, layout: &SegmentLayout) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scoping_rules() {
        let mut core = EmitterCore::new();
        core.begin_function("main");
        assert_eq!(core.scoped("loop"), "main.loop");
        assert_eq!(core.scoped("@printf"), "@printf");
    }

    #[test]
    fn test_labels_scoped_per_function() {
        let mut core = EmitterCore::new();
        core.begin_function("f");
        core.label("exit");
        core.begin_function("g");
        core.label("exit");
        assert!(core.labels.resolve("f.exit").is_some());
        assert!(core.labels.resolve("g.exit").is_some());
        assert_eq!(core.labels.resolve("@f"), Some((0, Segment::Code)));
    }

    #[test]
    fn test_qword_dedup() {
        let mut core = EmitterCore::new();
        let a = core.add_qword(7);
        let b = core.add_qword(7);
        let c = core.add_qword(8);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(core.data.offset(), 16);
    }

    #[test]
    fn test_f64_dedup_by_bits() {
        let mut core = EmitterCore::new();
        let a = core.add_f64(1.5);
        let b = core.add_f64(1.5);
        assert_eq!(a, b);
        // 0.0 and -0.0 differ in bits, so they get distinct slots
        let z = core.add_f64(0.0);
        let nz = core.add_f64(-0.0);
        assert_ne!(z, nz);
    }

    #[test]
    fn test_string_layout_deferred() {
        let mut core = EmitterCore::new();
        let label = core.add_string("hello");
        assert_eq!(core.data.offset(), 0);
        core.layout_strings();
        assert_eq!(core.labels.resolve(&label), Some((0, Segment::Data)));
        assert_eq!(core.data.bytes(), b"hello\0");
    }

    #[test]
    fn test_got_slot_arithmetic() {
        let layout = SegmentLayout {
            code_vaddr: 0x1000,
            data_vaddr: 0x100000,
            got_offset: 64,
            iat_vaddr: 0x140002000,
        };
        assert_eq!(layout.got_slot(0), 0x100040);
        assert_eq!(layout.got_slot(3), 0x100040 + 24);
        assert_eq!(layout.iat_slot(2), 0x140002010);
    }
}
