//! x86-64 backend.
//!
//! ## Architecture
//!
//! ```text
//! semantic ops → X64Emitter → placeholders + fixups → finalize/fixup_all → bytes
//! ```
//!
//! ## Modules
//!
//! - `registers`: GP/XMM register definitions, SysV and Win64 tables
//! - `encoding`: x86-64 instruction encoding (REX, ModR/M, SIB)
//! - `emitter`: semantic emitter, GOT/IAT stubs, and the two-pass resolver

pub mod emitter;
pub mod encoding;
pub mod registers;

pub use emitter::X64Emitter;
pub use registers::{Reg64, Xmm};
