//! Spill and restore emission
//!
//! GPR spills are single segment-relative stores; vector spills are a
//! two-instruction sequence that loads the indirect-block pointer
//! into a scratch GPR and moves the register through it. Every batch
//! is emitted with auto-predication saved and cleared so that spill
//! code is unconditional even when instrumentation predication is
//! active, then restored.

use log::trace;
use regmed_common::{Result, Status};
use regmed_isa::{Instr, InstrId, InstrList, MemRef, Opcode, Opnd, Reg, Width};

use crate::slots::SIMD_SLOT_BYTES;

/// Store the app (or tool) value of `reg` into a thread-local word.
pub(crate) fn gpr_spill(reg: Reg, offset: u32) -> Instr {
    Instr::mov(Opnd::tls(offset), Opnd::reg(reg))
}

/// Load `reg` back from a thread-local word.
pub(crate) fn gpr_restore(reg: Reg, offset: u32) -> Instr {
    Instr::mov(Opnd::reg(reg), Opnd::tls(offset))
}

fn simd_slot_ref(scratch: Reg, slot: usize) -> Opnd {
    Opnd::Mem(MemRef::base_disp(scratch, (slot * SIMD_SLOT_BYTES) as i32))
}

/// The two-instruction indirect vector spill: load the block pointer,
/// then move the register out through it.
pub(crate) fn simd_spill(reg: Reg, slot: usize, scratch: Reg, hidden_offset: u32) -> Vec<Instr> {
    vec![
        gpr_restore(scratch, hidden_offset),
        Instr::mov_simd(simd_slot_ref(scratch, slot), Opnd::reg_w(reg, Width::X16)),
    ]
}

pub(crate) fn simd_restore(reg: Reg, slot: usize, scratch: Reg, hidden_offset: u32) -> Vec<Instr> {
    vec![
        gpr_restore(scratch, hidden_offset),
        Instr::mov_simd(Opnd::reg_w(reg, Width::X16), simd_slot_ref(scratch, slot)),
    ]
}

/// Capture the arithmetic flags into the accumulator: the byte-load
/// primitive fills the second byte, and the overflow materialisation
/// fills the low byte without disturbing it.
pub(crate) fn flags_capture_tail() -> Vec<Instr> {
    vec![Instr::lahf(), Instr::seto()]
}

/// Write the captured flags in the accumulator back to the
/// architectural flags. The add on the low byte recreates the
/// overflow flag; the byte-store primitive writes the rest. With
/// `keep_captured`, the low byte is re-materialised afterwards so the
/// capture stays valid in the accumulator.
pub(crate) fn flags_release(keep_captured: bool) -> Vec<Instr> {
    let mut seq = vec![Instr::add_al(0x7f), Instr::sahf()];
    if keep_captured {
        seq.push(Instr::seto());
    }
    seq
}

/// Insert `instrs` immediately before `at`, unconditionally.
pub(crate) fn emit_before(ilist: &mut InstrList, at: InstrId, instrs: Vec<Instr>) -> Result<()> {
    let saved = ilist.set_auto_pred(None);
    for instr in instrs {
        trace!("emit before: {instr}");
        if ilist.insert_before(at, instr).is_none() {
            ilist.set_auto_pred(saved);
            return Err(Status::InvalidParameter);
        }
    }
    ilist.set_auto_pred(saved);
    Ok(())
}

/// Insert `instrs` immediately after `at`, in order, unconditionally.
pub(crate) fn emit_after(ilist: &mut InstrList, at: InstrId, instrs: Vec<Instr>) -> Result<()> {
    let saved = ilist.set_auto_pred(None);
    let mut cursor = at;
    for instr in instrs {
        trace!("emit after: {instr}");
        match ilist.insert_after(cursor, instr) {
            Some(id) => cursor = id,
            None => {
                ilist.set_auto_pred(saved);
                return Err(Status::InvalidParameter);
            }
        }
    }
    ilist.set_auto_pred(saved);
    Ok(())
}

/// A recognised single-instruction thread-local move.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TlsMove {
    Spill { reg: Reg, offset: u32 },
    Restore { reg: Reg, offset: u32 },
}

/// Recognise a GPR spill or restore by its thread-local operand.
pub(crate) fn classify_tls_move(instr: &Instr) -> Option<TlsMove> {
    if instr.opcode() != Opcode::Mov {
        return None;
    }
    let (dst, src) = (instr.dsts().first()?, instr.srcs().first()?);
    if let (Some(offset), Some(reg)) = (dst.as_tls(), src.as_reg()) {
        return Some(TlsMove::Spill {
            reg: reg.reg,
            offset,
        });
    }
    if let (Some(reg), Some(offset)) = (dst.as_reg(), src.as_tls()) {
        return Some(TlsMove::Restore {
            reg: reg.reg,
            offset,
        });
    }
    None
}

/// A recognised half of the indirect vector sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SimdMove {
    Spill { reg: Reg, base: Reg, disp: i32 },
    Restore { reg: Reg, base: Reg, disp: i32 },
}

pub(crate) fn classify_simd_move(instr: &Instr) -> Option<SimdMove> {
    if instr.opcode() != Opcode::MovSimd {
        return None;
    }
    let (dst, src) = (instr.dsts().first()?, instr.srcs().first()?);
    if let (Some(mem), Some(reg)) = (dst.as_mem(), src.as_reg()) {
        return Some(SimdMove::Spill {
            reg: reg.reg,
            base: mem.base?,
            disp: mem.disp,
        });
    }
    if let (Some(reg), Some(mem)) = (dst.as_reg(), src.as_mem()) {
        return Some(SimdMove::Restore {
            reg: reg.reg,
            base: mem.base?,
            disp: mem.disp,
        });
    }
    None
}
