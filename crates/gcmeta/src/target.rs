//! Target machine parameters the tables depend on

use serde::{Deserialize, Serialize};

/// Pointer size and pc quantum of the machine the tables describe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Target {
    /// Size of a pointer (and of a stack map word) in bytes
    pub ptr_size: u8,
    /// Minimum instruction alignment; pc deltas are stored in these units
    pub pc_quantum: u8,
}

impl Target {
    /// 64-bit x86
    pub const AMD64: Target = Target { ptr_size: 8, pc_quantum: 1 };
    /// 64-bit ARM
    pub const ARM64: Target = Target { ptr_size: 8, pc_quantum: 4 };
    /// 32-bit x86
    pub const I386: Target = Target { ptr_size: 4, pc_quantum: 1 };
    /// 64-bit RISC-V (compressed instructions)
    pub const RISCV64: Target = Target { ptr_size: 8, pc_quantum: 2 };

    /// Look up a preset by architecture name
    pub fn preset(name: &str) -> Option<Target> {
        match name {
            "amd64" | "x86_64" => Some(Self::AMD64),
            "arm64" | "aarch64" => Some(Self::ARM64),
            "386" | "i386" | "x86" => Some(Self::I386),
            "riscv64" => Some(Self::RISCV64),
            _ => None,
        }
    }

    /// Check that both parameters are usable
    pub fn is_valid(&self) -> bool {
        matches!(self.ptr_size, 4 | 8) && matches!(self.pc_quantum, 1 | 2 | 4)
    }

    /// Pointer size as a byte count
    #[inline]
    pub fn ptr_bytes(&self) -> u32 {
        self.ptr_size as u32
    }

    /// pc quantum as a byte count
    #[inline]
    pub fn quantum(&self) -> u32 {
        self.pc_quantum as u32
    }
}

impl Default for Target {
    fn default() -> Self {
        Self::AMD64
    }
}
