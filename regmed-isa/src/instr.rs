//! Instruction model and register introspection
//!
//! Instructions are an opcode plus explicit destination and source
//! operand lists. The introspection queries here are what the
//! mediator core consults during liveness analysis and insertion:
//! which registers an instruction reads (including addressing reads
//! inside destinations), which it fully or partially writes, whether
//! a write is conditional, and its arithmetic-flags effect.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::aflags::AFlags;
use crate::opnd::{Opnd, RegOpnd, Width};
use crate::reg::Reg;

/// Condition codes for conditional branches and moves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Cc {
    O,
    No,
    B,
    Ae,
    E,
    Ne,
    Be,
    A,
    S,
    Ns,
    P,
    Np,
    L,
    Ge,
    Le,
    G,
}

impl Cc {
    /// Arithmetic flags this condition reads.
    pub fn flags_read(self) -> AFlags {
        match self {
            Cc::O | Cc::No => AFlags::OF,
            Cc::B | Cc::Ae => AFlags::CF,
            Cc::E | Cc::Ne => AFlags::ZF,
            Cc::Be | Cc::A => AFlags::CF | AFlags::ZF,
            Cc::S | Cc::Ns => AFlags::SF,
            Cc::P | Cc::Np => AFlags::PF,
            Cc::L | Cc::Ge => AFlags::SF | AFlags::OF,
            Cc::Le | Cc::G => AFlags::SF | AFlags::ZF | AFlags::OF,
        }
    }
}

/// Instruction opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Opcode {
    /// GPR move, load or store depending on operand shapes.
    Mov,
    /// 128-bit vector move between a register and memory.
    MovSimd,
    Add,
    /// Add with carry; reads CF.
    Adc,
    Sub,
    Xor,
    Cmp,
    Test,
    /// Writes every arithmetic flag except CF.
    Inc,
    /// Writes every arithmetic flag except CF.
    Dec,
    /// Load the byte-representable flags into the accumulator's
    /// second byte.
    Lahf,
    /// Store the accumulator's second byte back into the flags.
    Sahf,
    /// Materialise the overflow flag into the accumulator's low byte.
    Seto,
    Cmov(Cc),
    Jmp,
    Jcc(Cc),
    Call,
    Ret,
    Syscall,
    Int,
    Nop,
}

impl Opcode {
    /// The first destination is also read (read-modify-write).
    fn dst_also_read(self) -> bool {
        matches!(
            self,
            Opcode::Add | Opcode::Adc | Opcode::Sub | Opcode::Xor | Opcode::Inc | Opcode::Dec
        )
    }

    fn mnemonic(self) -> &'static str {
        match self {
            Opcode::Mov => "mov",
            Opcode::MovSimd => "movdqa",
            Opcode::Add => "add",
            Opcode::Adc => "adc",
            Opcode::Sub => "sub",
            Opcode::Xor => "xor",
            Opcode::Cmp => "cmp",
            Opcode::Test => "test",
            Opcode::Inc => "inc",
            Opcode::Dec => "dec",
            Opcode::Lahf => "lahf",
            Opcode::Sahf => "sahf",
            Opcode::Seto => "seto",
            Opcode::Cmov(_) => "cmov",
            Opcode::Jmp => "jmp",
            Opcode::Jcc(_) => "jcc",
            Opcode::Call => "call",
            Opcode::Ret => "ret",
            Opcode::Syscall => "syscall",
            Opcode::Int => "int",
            Opcode::Nop => "nop",
        }
    }
}

/// Arithmetic-flags effect of one instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AflagsEffect {
    pub read: AFlags,
    pub written: AFlags,
}

/// One decoded instruction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instr {
    opcode: Opcode,
    dsts: Vec<Opnd>,
    srcs: Vec<Opnd>,
    app: bool,
    pred: Option<Cc>,
}

impl Instr {
    /// An original application instruction.
    pub fn app(opcode: Opcode, dsts: Vec<Opnd>, srcs: Vec<Opnd>) -> Instr {
        Instr {
            opcode,
            dsts,
            srcs,
            app: true,
            pred: None,
        }
    }

    /// A tool-inserted instruction.
    pub fn meta(opcode: Opcode, dsts: Vec<Opnd>, srcs: Vec<Opnd>) -> Instr {
        Instr {
            opcode,
            dsts,
            srcs,
            app: false,
            pred: None,
        }
    }

    pub fn mov(dst: Opnd, src: Opnd) -> Instr {
        Instr::meta(Opcode::Mov, vec![dst], vec![src])
    }

    pub fn mov_simd(dst: Opnd, src: Opnd) -> Instr {
        Instr::meta(Opcode::MovSimd, vec![dst], vec![src])
    }

    pub fn lahf() -> Instr {
        Instr::meta(Opcode::Lahf, vec![], vec![])
    }

    pub fn sahf() -> Instr {
        Instr::meta(Opcode::Sahf, vec![], vec![])
    }

    pub fn seto() -> Instr {
        Instr::meta(Opcode::Seto, vec![], vec![])
    }

    /// `add` on the accumulator's low byte; the restore sequence uses
    /// it to recreate the overflow flag.
    pub fn add_al(imm: i64) -> Instr {
        Instr::meta(
            Opcode::Add,
            vec![Opnd::reg_w(Reg::Rax, Width::B1)],
            vec![Opnd::imm(imm)],
        )
    }

    pub fn nop() -> Instr {
        Instr::meta(Opcode::Nop, vec![], vec![])
    }

    pub fn with_pred(mut self, cc: Cc) -> Instr {
        self.pred = Some(cc);
        self
    }

    pub fn opcode(&self) -> Opcode {
        self.opcode
    }

    pub fn dsts(&self) -> &[Opnd] {
        &self.dsts
    }

    pub fn srcs(&self) -> &[Opnd] {
        &self.srcs
    }

    pub fn is_app(&self) -> bool {
        self.app
    }

    pub fn pred(&self) -> Option<Cc> {
        self.pred
    }

    pub fn set_pred(&mut self, pred: Option<Cc>) {
        self.pred = pred;
    }

    /// Whether the auto-predication state may be applied to this
    /// instruction when it is inserted into a list.
    pub fn is_predicatable(&self) -> bool {
        matches!(
            self.opcode,
            Opcode::Mov
                | Opcode::MovSimd
                | Opcode::Add
                | Opcode::Adc
                | Opcode::Sub
                | Opcode::Xor
                | Opcode::Cmp
                | Opcode::Test
                | Opcode::Inc
                | Opcode::Dec
        )
    }

    /// Implicit register operands: the flag primitives move through
    /// the accumulator's low bytes.
    fn implicit_reg_dst(&self) -> Option<RegOpnd> {
        match self.opcode {
            Opcode::Lahf | Opcode::Seto => Some(RegOpnd {
                reg: Reg::Rax,
                width: Width::B1,
            }),
            _ => None,
        }
    }

    fn implicit_reg_src(&self) -> Option<RegOpnd> {
        match self.opcode {
            Opcode::Sahf => Some(RegOpnd {
                reg: Reg::Rax,
                width: Width::B1,
            }),
            _ => None,
        }
    }

    /// Does this instruction read `reg`, including addressing reads
    /// inside destination operands and read-modify-write
    /// destinations.
    pub fn reads_from_reg(&self, reg: Reg) -> bool {
        for src in &self.srcs {
            if let Some(r) = src.as_reg() {
                if r.reg == reg {
                    return true;
                }
            }
        }
        for opnd in self.srcs.iter().chain(self.dsts.iter()) {
            if opnd.addressing_regs().any(|r| r == reg) {
                return true;
            }
        }
        if self.implicit_reg_src().map(|r| r.reg) == Some(reg) {
            return true;
        }
        // A read-modify-write or conditional destination still carries
        // the old value in.
        if self.opcode.dst_also_read() || matches!(self.opcode, Opcode::Cmov(_)) || self.pred.is_some() {
            for dst in &self.dsts {
                if let Some(r) = dst.as_reg() {
                    if r.reg == reg {
                        return true;
                    }
                }
            }
        }
        false
    }

    /// Does this instruction write `reg` at any width.
    pub fn writes_to_reg(&self, reg: Reg) -> bool {
        if self.implicit_reg_dst().map(|r| r.reg) == Some(reg) {
            return true;
        }
        self.dsts
            .iter()
            .filter_map(|d| d.as_reg())
            .any(|r| r.reg == reg)
    }

    /// Does this instruction unconditionally replace the whole of
    /// `reg`: a full-width write, or a four-byte zero-extending write
    /// for GPRs.
    pub fn writes_to_exact_reg(&self, reg: Reg) -> bool {
        if self.pred.is_some() || matches!(self.opcode, Opcode::Cmov(_)) {
            return false;
        }
        self.dsts.iter().filter_map(|d| d.as_reg()).any(|r| {
            r.reg == reg
                && if reg.is_gpr() {
                    r.width.kills_gpr()
                } else {
                    // Exactness for vectors is width-specific; the
                    // liveness lattice consumes the width directly.
                    r.width >= Width::X16
                }
        })
    }

    /// Write that touches `reg` without replacing all of it.
    pub fn partially_writes_reg(&self, reg: Reg) -> bool {
        self.writes_to_reg(reg) && !self.writes_to_exact_reg(reg)
    }

    /// Write guarded by a condition; the old value may survive.
    pub fn conditionally_writes_reg(&self, reg: Reg) -> bool {
        (matches!(self.opcode, Opcode::Cmov(_)) || self.pred.is_some()) && self.writes_to_reg(reg)
    }

    /// Width of the widest read of vector register `reg`, if any.
    pub fn simd_read_width(&self, reg: Reg) -> Option<Width> {
        self.srcs
            .iter()
            .filter_map(|s| s.as_reg())
            .filter(|r| r.reg == reg)
            .map(|r| r.width)
            .max()
    }

    /// Width of an unpredicated write of vector register `reg`.
    pub fn simd_write_width(&self, reg: Reg) -> Option<Width> {
        if self.pred.is_some() || matches!(self.opcode, Opcode::Cmov(_)) {
            return None;
        }
        self.dsts
            .iter()
            .filter_map(|d| d.as_reg())
            .filter(|r| r.reg == reg)
            .map(|r| r.width)
            .max()
    }

    /// Control-transfer instruction.
    pub fn is_cti(&self) -> bool {
        matches!(
            self.opcode,
            Opcode::Jmp | Opcode::Jcc(_) | Opcode::Call | Opcode::Ret
        )
    }

    pub fn is_syscall_or_interrupt(&self) -> bool {
        matches!(self.opcode, Opcode::Syscall | Opcode::Int)
    }

    /// Arithmetic flags read and written by this instruction.
    pub fn aflags_effect(&self) -> AflagsEffect {
        let mut effect = match self.opcode {
            Opcode::Add | Opcode::Sub | Opcode::Cmp | Opcode::Test | Opcode::Xor => AflagsEffect {
                read: AFlags::NONE,
                written: AFlags::ALL,
            },
            Opcode::Adc => AflagsEffect {
                read: AFlags::CF,
                written: AFlags::ALL,
            },
            Opcode::Inc | Opcode::Dec => AflagsEffect {
                read: AFlags::NONE,
                written: AFlags::ALL - AFlags::CF,
            },
            Opcode::Jcc(cc) | Opcode::Cmov(cc) => AflagsEffect {
                read: cc.flags_read(),
                written: AFlags::NONE,
            },
            Opcode::Lahf => AflagsEffect {
                read: AFlags::BYTE,
                written: AFlags::NONE,
            },
            Opcode::Seto => AflagsEffect {
                read: AFlags::OF,
                written: AFlags::NONE,
            },
            Opcode::Sahf => AflagsEffect {
                read: AFlags::NONE,
                written: AFlags::BYTE,
            },
            _ => AflagsEffect::default(),
        };
        if let Some(cc) = self.pred {
            effect.read |= cc.flags_read();
        }
        effect
    }
}

impl fmt::Display for Instr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.opcode.mnemonic())?;
        let mut first = true;
        for opnd in self.dsts.iter().chain(self.srcs.iter()) {
            if first {
                write!(f, " {opnd}")?;
                first = false;
            } else {
                write!(f, ", {opnd}")?;
            }
        }
        Ok(())
    }
}
