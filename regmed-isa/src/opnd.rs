//! Operand model
//!
//! Operands carry the access width explicitly: a four-byte write to a
//! general-purpose register zero-extends and therefore kills the full
//! register, while one- and two-byte writes are partial. Vector
//! registers are always named canonically and the width selects the
//! xmm/ymm/zmm view.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::reg::Reg;

/// Access width of a register or memory operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Width {
    /// One byte.
    B1,
    /// Two bytes.
    B2,
    /// Four bytes; zero-extends on GPR writes.
    B4,
    /// Full GPR width.
    B8,
    /// 128-bit vector view.
    X16,
    /// 256-bit vector view.
    Y32,
    /// 512-bit vector view.
    Z64,
}

impl Width {
    /// Natural full width for a register.
    pub fn natural(reg: Reg) -> Width {
        if reg.is_gpr() {
            Width::B8
        } else {
            Width::X16
        }
    }

    /// A GPR write of this width replaces the whole register.
    pub fn kills_gpr(self) -> bool {
        matches!(self, Width::B4 | Width::B8)
    }
}

/// A register operand with its access width.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegOpnd {
    pub reg: Reg,
    pub width: Width,
}

/// A memory reference through registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemRef {
    pub base: Option<Reg>,
    pub index: Option<Reg>,
    pub scale: u8,
    pub disp: i32,
}

impl MemRef {
    pub fn base_disp(base: Reg, disp: i32) -> MemRef {
        MemRef {
            base: Some(base),
            index: None,
            scale: 1,
            disp,
        }
    }

    pub fn uses_reg(&self, reg: Reg) -> bool {
        self.base == Some(reg) || self.index == Some(reg)
    }
}

/// An instruction operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Opnd {
    Reg(RegOpnd),
    Mem(MemRef),
    /// A segment-relative thread-local slot, addressed by byte offset.
    /// No general-purpose register participates in the addressing.
    Tls(u32),
    Imm(i64),
}

impl Opnd {
    /// Full-width register operand.
    pub fn reg(reg: Reg) -> Opnd {
        Opnd::Reg(RegOpnd {
            reg,
            width: Width::natural(reg),
        })
    }

    /// Register operand with an explicit access width.
    pub fn reg_w(reg: Reg, width: Width) -> Opnd {
        Opnd::Reg(RegOpnd { reg, width })
    }

    pub fn mem(base: Reg, disp: i32) -> Opnd {
        Opnd::Mem(MemRef::base_disp(base, disp))
    }

    pub fn tls(offset: u32) -> Opnd {
        Opnd::Tls(offset)
    }

    pub fn imm(value: i64) -> Opnd {
        Opnd::Imm(value)
    }

    pub fn as_reg(&self) -> Option<RegOpnd> {
        match self {
            Opnd::Reg(r) => Some(*r),
            _ => None,
        }
    }

    pub fn as_tls(&self) -> Option<u32> {
        match self {
            Opnd::Tls(off) => Some(*off),
            _ => None,
        }
    }

    pub fn as_mem(&self) -> Option<MemRef> {
        match self {
            Opnd::Mem(m) => Some(*m),
            _ => None,
        }
    }

    /// Registers read for addressing when this operand is accessed,
    /// whether it is a source or a destination.
    pub fn addressing_regs(&self) -> impl Iterator<Item = Reg> {
        let (a, b) = match self {
            Opnd::Mem(m) => (m.base, m.index),
            _ => (None, None),
        };
        a.into_iter().chain(b)
    }
}

impl fmt::Display for Opnd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Opnd::Reg(r) => write!(f, "{}", r.reg),
            Opnd::Mem(m) => {
                write!(f, "[")?;
                if let Some(base) = m.base {
                    write!(f, "{base}")?;
                }
                if let Some(index) = m.index {
                    write!(f, "+{}*{}", index, m.scale)?;
                }
                if m.disp != 0 {
                    write!(f, "{:+#x}", m.disp)?;
                }
                write!(f, "]")
            }
            Opnd::Tls(off) => write!(f, "tls:{off:#x}"),
            Opnd::Imm(v) => write!(f, "{v:#x}"),
        }
    }
}
