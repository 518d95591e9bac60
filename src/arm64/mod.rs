//! ARM64 (AArch64) backend.
//!
//! ## Architecture
//!
//! ```text
//! semantic ops → Arm64Emitter → placeholders + fixups → finalize/fixup_all → bytes
//! ```
//!
//! ## Modules
//!
//! - `registers`: X/W/D register definitions and AAPCS64 tables
//! - `encoding`: A64 instruction word encoding (always 4 bytes)
//! - `emitter`: semantic emitter, stubs, and the two-pass resolver

pub mod emitter;
pub mod encoding;
pub mod registers;

pub use emitter::Arm64Emitter;
pub use registers::{FReg, Reg32, Reg64};
