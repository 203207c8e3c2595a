//! Register model
//!
//! The modeled ISA is a 64-bit machine with sixteen general-purpose
//! registers and sixteen 512-bit vector registers. Vector registers
//! are named canonically; the access width (xmm/ymm/zmm view) lives on
//! the operand, so all views of one register share an index by
//! construction.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Number of general-purpose registers.
pub const NUM_GPRS: usize = 16;
/// Number of vector registers.
pub const NUM_SIMD: usize = 16;

/// Architectural registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Reg {
    Rax,
    Rcx,
    Rdx,
    Rbx,
    Rsp,
    Rbp,
    Rsi,
    Rdi,
    R8,
    R9,
    R10,
    R11,
    R12,
    R13,
    R14,
    R15,
    Xmm0,
    Xmm1,
    Xmm2,
    Xmm3,
    Xmm4,
    Xmm5,
    Xmm6,
    Xmm7,
    Xmm8,
    Xmm9,
    Xmm10,
    Xmm11,
    Xmm12,
    Xmm13,
    Xmm14,
    Xmm15,
}

/// The accumulator, used by the flags capture sequence.
pub const ACCUMULATOR: Reg = Reg::Rax;
/// The architectural stack pointer, never handed out.
pub const STACK_POINTER: Reg = Reg::Rsp;

static GPRS: [Reg; NUM_GPRS] = [
    Reg::Rax,
    Reg::Rcx,
    Reg::Rdx,
    Reg::Rbx,
    Reg::Rsp,
    Reg::Rbp,
    Reg::Rsi,
    Reg::Rdi,
    Reg::R8,
    Reg::R9,
    Reg::R10,
    Reg::R11,
    Reg::R12,
    Reg::R13,
    Reg::R14,
    Reg::R15,
];

static SIMDS: [Reg; NUM_SIMD] = [
    Reg::Xmm0,
    Reg::Xmm1,
    Reg::Xmm2,
    Reg::Xmm3,
    Reg::Xmm4,
    Reg::Xmm5,
    Reg::Xmm6,
    Reg::Xmm7,
    Reg::Xmm8,
    Reg::Xmm9,
    Reg::Xmm10,
    Reg::Xmm11,
    Reg::Xmm12,
    Reg::Xmm13,
    Reg::Xmm14,
    Reg::Xmm15,
];

impl Reg {
    pub fn is_gpr(self) -> bool {
        (self as usize) < NUM_GPRS
    }

    pub fn is_simd(self) -> bool {
        !self.is_gpr()
    }

    /// Index into per-thread GPR state arrays.
    pub fn gpr_index(self) -> usize {
        debug_assert!(self.is_gpr());
        self as usize
    }

    /// Index into per-thread SIMD state arrays. The register name is
    /// already the canonical full-width register, so every view of it
    /// maps here.
    pub fn simd_index(self) -> usize {
        debug_assert!(self.is_simd());
        self as usize - NUM_GPRS
    }

    pub fn from_gpr_index(idx: usize) -> Reg {
        GPRS[idx]
    }

    pub fn from_simd_index(idx: usize) -> Reg {
        SIMDS[idx]
    }

    /// All general-purpose registers in architectural order.
    pub fn gprs() -> impl Iterator<Item = Reg> {
        GPRS.iter().copied()
    }

    /// All vector registers in architectural order.
    pub fn simds() -> impl Iterator<Item = Reg> {
        SIMDS.iter().copied()
    }

    pub fn name(self) -> &'static str {
        match self {
            Reg::Rax => "rax",
            Reg::Rcx => "rcx",
            Reg::Rdx => "rdx",
            Reg::Rbx => "rbx",
            Reg::Rsp => "rsp",
            Reg::Rbp => "rbp",
            Reg::Rsi => "rsi",
            Reg::Rdi => "rdi",
            Reg::R8 => "r8",
            Reg::R9 => "r9",
            Reg::R10 => "r10",
            Reg::R11 => "r11",
            Reg::R12 => "r12",
            Reg::R13 => "r13",
            Reg::R14 => "r14",
            Reg::R15 => "r15",
            Reg::Xmm0 => "xmm0",
            Reg::Xmm1 => "xmm1",
            Reg::Xmm2 => "xmm2",
            Reg::Xmm3 => "xmm3",
            Reg::Xmm4 => "xmm4",
            Reg::Xmm5 => "xmm5",
            Reg::Xmm6 => "xmm6",
            Reg::Xmm7 => "xmm7",
            Reg::Xmm8 => "xmm8",
            Reg::Xmm9 => "xmm9",
            Reg::Xmm10 => "xmm10",
            Reg::Xmm11 => "xmm11",
            Reg::Xmm12 => "xmm12",
            Reg::Xmm13 => "xmm13",
            Reg::Xmm14 => "xmm14",
            Reg::Xmm15 => "xmm15",
        }
    }
}

impl fmt::Display for Reg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A set of registers, used for reservation allowed-sets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RegSet(u32);

impl RegSet {
    pub fn empty() -> Self {
        RegSet(0)
    }

    /// All general-purpose registers except the stack pointer.
    pub fn all_gprs() -> Self {
        let mut set = RegSet::empty();
        for r in Reg::gprs() {
            if r != STACK_POINTER {
                set.add(r);
            }
        }
        set
    }

    /// All vector registers.
    pub fn all_simd() -> Self {
        let mut set = RegSet::empty();
        for r in Reg::simds() {
            set.add(r);
        }
        set
    }

    pub fn add(&mut self, reg: Reg) {
        self.0 |= 1 << reg as u32;
    }

    pub fn remove(&mut self, reg: Reg) {
        self.0 &= !(1 << reg as u32);
    }

    pub fn with(mut self, reg: Reg) -> Self {
        self.add(reg);
        self
    }

    pub fn without(mut self, reg: Reg) -> Self {
        self.remove(reg);
        self
    }

    pub fn contains(&self, reg: Reg) -> bool {
        self.0 & (1 << reg as u32) != 0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn len(&self) -> usize {
        self.0.count_ones() as usize
    }

    /// Registers in architectural order.
    pub fn iter(&self) -> impl Iterator<Item = Reg> + '_ {
        Reg::gprs().chain(Reg::simds()).filter(|r| self.contains(*r))
    }
}
