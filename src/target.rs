//! Compilation target description.
//!
//! A `Target` is constructed once per compilation unit and passed to the
//! emitter; it never lives in process-wide state. The per-ABI calling
//! convention tables live with their register definitions in
//! `arm64::registers` and `x64::registers` and are selected through the
//! helpers here.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::BackendError;

/// Instruction set architecture
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Arch {
    Arm64,
    X64,
}

/// Operating system ABI
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Os {
    MacOs,
    Linux,
    Windows,
}

/// Target platform for code generation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Target {
    pub arch: Arch,
    pub os: Os,
}

impl Target {
    pub fn new(arch: Arch, os: Os) -> Self {
        Self { arch, os }
    }

    /// Windows indirects dynamic symbols through the IAT; the ELF and
    /// Mach-O ABIs use a GOT in the data segment.
    pub fn uses_iat(&self) -> bool {
        self.os == Os::Windows
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let arch = match self.arch {
            Arch::Arm64 => "arm64",
            Arch::X64 => "x86_64",
        };
        let os = match self.os {
            Os::MacOs => "macos",
            Os::Linux => "linux",
            Os::Windows => "windows",
        };
        write!(f, "{}-{}", arch, os)
    }
}

impl FromStr for Target {
    type Err = BackendError;

    /// Parse a `"arch-os"` pair, e.g. `"arm64-macos"` or `"x86_64-linux"`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (arch, os) = s.split_once('-').ok_or_else(|| BackendError::InvalidOperand {
            message: format!("malformed target `{}`, expected `arch-os`", s),
        })?;
        let arch = match arch {
            "arm64" | "aarch64" => Arch::Arm64,
            "x86_64" | "x64" | "amd64" => Arch::X64,
            other => {
                return Err(BackendError::InvalidOperand {
                    message: format!("unknown architecture `{}`", other),
                })
            }
        };
        let os = match os {
            "macos" | "darwin" => Os::MacOs,
            "linux" => Os::Linux,
            "windows" => Os::Windows,
            other => {
                return Err(BackendError::InvalidOperand {
                    message: format!("unknown os `{}`", other),
                })
            }
        };
        Ok(Target { arch, os })
    }
}
