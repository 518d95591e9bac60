//! # lith-native
//!
//! Native machine-code backend for the Lith compiler. Turns semantic
//! operations ("move immediate into register", "branch to label", "call a
//! GOT-indirected external symbol") into exact machine-code bytes for two
//! architectures (ARM64, x86-64) across three OS ABIs (macOS, Linux,
//! Windows), and resolves every deferred address reference once final
//! segment layout is known.
//!
//! ## Pipeline position
//!
//! ```text
//! TypedProgram → VM codegen → Emitter (this crate) → Mach-O/ELF/PE writer
//! ```
//!
//! The register-allocating code generator above drives one [`Emitter`]
//! call per semantic instruction; the container writer below supplies the
//! final [`SegmentLayout`] to `fixup_all` and embeds `code()`/`data()`
//! plus the relocation list into an executable.
//!
//! ## Modules
//!
//! - `target`: architecture/OS selection and calling convention lookup
//! - `buffer`, `data`: code and data section byte buffers
//! - `symbols`: labels, alias chains, GOT slots, relocation records
//! - `emitter`: the shared two-pass emission/resolution contract
//! - `arm64`, `x64`: the two conforming encoder implementations

pub mod arm64;
pub mod buffer;
pub mod data;
pub mod emitter;
pub mod error;
pub mod symbols;
pub mod target;
pub mod x64;

pub use buffer::CodeBuffer;
pub use data::DataBuffer;
pub use emitter::{Cond, Emitter, EmitterCore, Fixup, FixupKind, FloatWidth, SegmentLayout};
pub use error::{BackendError, Result};
pub use symbols::{
    ExternalSymbol, LabelTable, LabelValue, RelocationKind, RelocationRecord, Segment,
};
pub use target::{Arch, Os, Target};

pub use arm64::Arm64Emitter;
pub use x64::X64Emitter;
