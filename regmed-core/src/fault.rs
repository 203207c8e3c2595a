//! Fault-time state restoration
//!
//! When a fault lands inside instrumented code, exception handlers
//! must see the application's architectural state, as if no
//! instrumentation ran. The walker linearly decodes the fragment from
//! its start to the fault pc, recognising the spill and restore
//! shapes this crate emits, and maintains a shadow register-to-slot
//! mapping:
//!
//! - a spill of a register already mapped is a tool-value temp and is
//!   ignored; otherwise it records the mapping;
//! - a restore from the recorded slot erases the mapping; a restore
//!   from any other slot is a tool-value temp and is ignored.
//!
//! Whatever is still mapped at the fault pc is an app value sitting
//! in thread storage, and is written back into the machine context.

use log::{debug, trace};
use regmed_common::{Result, Status};
use regmed_isa::reg::ACCUMULATOR;
use regmed_isa::{AFlags, InstrList, MachineContext, Reg, NUM_GPRS, NUM_SIMD};

use crate::emit::{classify_simd_move, classify_tls_move, SimdMove, TlsMove};
use crate::slots::{SlotLoc, AFLAGS_SLOT, SIMD_SLOT_BYTES};
use crate::state::PerThread;

impl PerThread {
    /// Rewrite `mctx` so it reflects application state at `fault_pc`
    /// (an index into `fragment`).
    pub fn restore_fault_state(
        &self,
        fragment: &InstrList,
        fault_pc: usize,
        mctx: &mut MachineContext,
    ) -> Result<()> {
        if fault_pc > fragment.len() {
            return Err(Status::InvalidParameter);
        }
        let mut gpr_map = [None::<usize>; NUM_GPRS];
        let mut simd_map = [None::<usize>; NUM_SIMD];
        let mut flags_in_acc = false;
        let mut flags_in_mem = false;
        // Scratch register holding the indirect-block pointer, with
        // the index of the load, so only the adjacent instruction
        // pairs up.
        let mut pending_ptr: Option<(Reg, usize)> = None;

        for idx in 0..fault_pc {
            let instr = fragment.at(idx);
            if let Some(mv) = classify_tls_move(instr) {
                match mv {
                    TlsMove::Spill { reg, offset } => match self.slots.classify_offset(offset) {
                        Some(SlotLoc::Direct(AFLAGS_SLOT)) => {
                            // Flags capture evicted from the
                            // accumulator to its slot.
                            flags_in_mem = true;
                            flags_in_acc = false;
                        }
                        Some(SlotLoc::Direct(slot)) | Some(SlotLoc::Host(slot)) => {
                            if reg.is_gpr() && gpr_map[reg.gpr_index()].is_none() {
                                trace!("walk {idx}: spill {reg} -> slot {slot}");
                                gpr_map[reg.gpr_index()] = Some(slot);
                            } else {
                                trace!("walk {idx}: tool-temp spill of {reg}");
                            }
                        }
                        _ => {}
                    },
                    TlsMove::Restore { reg, offset } => match self.slots.classify_offset(offset) {
                        Some(SlotLoc::Hidden) => {
                            pending_ptr = Some((reg, idx));
                            continue;
                        }
                        Some(SlotLoc::Direct(AFLAGS_SLOT)) => {
                            // The capture is being routed back through
                            // the accumulator.
                            flags_in_acc = true;
                            flags_in_mem = false;
                        }
                        Some(SlotLoc::Direct(slot)) | Some(SlotLoc::Host(slot)) => {
                            if reg.is_gpr() && gpr_map[reg.gpr_index()] == Some(slot) {
                                trace!("walk {idx}: restore {reg} <- slot {slot}");
                                gpr_map[reg.gpr_index()] = None;
                            } else {
                                trace!("walk {idx}: tool-temp restore of {reg}");
                            }
                            if reg == ACCUMULATOR {
                                flags_in_acc = false;
                            }
                        }
                        _ => {}
                    },
                }
                pending_ptr = None;
                continue;
            }
            if let Some(sm) = classify_simd_move(instr) {
                let paired = pending_ptr.filter(|(_, at)| *at + 1 == idx);
                pending_ptr = None;
                match sm {
                    SimdMove::Spill { reg, base, disp } => {
                        if paired.map(|(ptr, _)| ptr) == Some(base) && reg.is_simd() {
                            let slot = disp as usize / SIMD_SLOT_BYTES;
                            if simd_map[reg.simd_index()].is_none() {
                                trace!("walk {idx}: simd spill {reg} -> slot {slot}");
                                simd_map[reg.simd_index()] = Some(slot);
                            }
                        }
                    }
                    SimdMove::Restore { reg, base, disp } => {
                        if paired.map(|(ptr, _)| ptr) == Some(base) && reg.is_simd() {
                            let slot = disp as usize / SIMD_SLOT_BYTES;
                            if simd_map[reg.simd_index()] == Some(slot) {
                                trace!("walk {idx}: simd restore {reg} <- slot {slot}");
                                simd_map[reg.simd_index()] = None;
                            }
                        }
                    }
                }
                continue;
            }
            pending_ptr = None;
            match instr.opcode() {
                regmed_isa::Opcode::Lahf | regmed_isa::Opcode::Seto => {
                    // A capture following an accumulator spill parks
                    // the flags in the accumulator.
                    if gpr_map[ACCUMULATOR.gpr_index()].is_some() {
                        flags_in_acc = true;
                    }
                }
                regmed_isa::Opcode::Sahf => {
                    // Flags released back to the architectural state.
                    flags_in_acc = false;
                }
                _ => {
                    if instr.is_app() {
                        // An app write invalidates a saved copy: the
                        // stale value must not be restored over it.
                        for reg in Reg::gprs() {
                            if instr.writes_to_exact_reg(reg) {
                                gpr_map[reg.gpr_index()] = None;
                                if reg == ACCUMULATOR {
                                    flags_in_acc = false;
                                }
                            }
                        }
                        for reg in Reg::simds() {
                            if instr.writes_to_exact_reg(reg) {
                                simd_map[reg.simd_index()] = None;
                            }
                        }
                        if instr.aflags_effect().written == AFlags::ALL {
                            flags_in_acc = false;
                            flags_in_mem = false;
                        }
                    } else if instr.writes_to_exact_reg(ACCUMULATOR) {
                        // A full accumulator rewrite ends the capture;
                        // the byte-wide capture machinery does not.
                        flags_in_acc = false;
                    }
                }
            }
        }

        // Flags come first: the capture byte may be sitting in the
        // accumulator that is itself about to be rewritten.
        if flags_in_acc {
            let acc = mctx.get_gpr(ACCUMULATOR);
            let byte = ((acc >> 8) & 0xff) as u8;
            let overflow = (acc & 0xff) == 1;
            debug!("fault: rebuilding flags from accumulator capture");
            mctx.set_flags_from_parts(byte, overflow);
        } else if flags_in_mem {
            let word = self.slots.read_slot(AFLAGS_SLOT);
            let byte = ((word >> 8) & 0xff) as u8;
            let overflow = (word & 0xff) == 1;
            debug!("fault: rebuilding flags from the flags slot");
            mctx.set_flags_from_parts(byte, overflow);
        }

        for (gi, slot) in gpr_map.iter().enumerate() {
            if let Some(slot) = *slot {
                let reg = Reg::from_gpr_index(gi);
                let value = self.slots.read_slot(slot);
                debug!("fault: {reg} <- slot {slot} ({value:#x})");
                mctx.set_gpr(reg, value);
            }
        }
        for (si, slot) in simd_map.iter().enumerate() {
            if let Some(slot) = *slot {
                let reg = Reg::from_simd_index(si);
                debug!("fault: {reg} <- simd slot {slot}");
                let bytes = *self.slots.simd_read(slot);
                mctx.set_simd_lane(reg, &bytes[..16]);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::emit;
    use regmed_common::Options;
    use regmed_isa::{Instr, Opcode, Opnd};

    fn thread() -> PerThread {
        PerThread::with_options(&Options::default())
    }

    #[test]
    fn test_simple_spill_is_replayed() {
        let mut pt = thread();
        let offset = pt.slots().slot_offset(1);
        pt.slots_mut().write_slot(1, 0x1234);
        let mut frag = InstrList::new();
        frag.append(emit::gpr_spill(Reg::Rbx, offset));
        frag.append(Instr::app(Opcode::Nop, vec![], vec![]));

        let mut ctx = MachineContext::default();
        ctx.set_gpr(Reg::Rbx, 0xffff); // tool value at fault time
        pt.restore_fault_state(&frag, 2, &mut ctx).unwrap();
        assert_eq!(ctx.get_gpr(Reg::Rbx), 0x1234);
    }

    #[test]
    fn test_matched_restore_erases_mapping() {
        let mut pt = thread();
        let offset = pt.slots().slot_offset(1);
        pt.slots_mut().write_slot(1, 0x1234);
        let mut frag = InstrList::new();
        frag.append(emit::gpr_spill(Reg::Rbx, offset));
        frag.append(emit::gpr_restore(Reg::Rbx, offset));
        frag.append(Instr::app(Opcode::Nop, vec![], vec![]));

        let mut ctx = MachineContext::default();
        ctx.set_gpr(Reg::Rbx, 0x5678);
        pt.restore_fault_state(&frag, 3, &mut ctx).unwrap();
        assert_eq!(ctx.get_gpr(Reg::Rbx), 0x5678, "mapping was erased");
    }

    #[test]
    fn test_tool_temp_spill_ignored() {
        let mut pt = thread();
        let app_off = pt.slots().slot_offset(1);
        let tmp_off = pt.slots().slot_offset(2);
        pt.slots_mut().write_slot(1, 0xaaaa);
        pt.slots_mut().write_slot(2, 0xbbbb);
        // spill to appslot, tool-temp spill, restore from non-matching
        // slot: the mapping to the appslot must survive.
        let mut frag = InstrList::new();
        frag.append(emit::gpr_spill(Reg::Rbx, app_off));
        frag.append(emit::gpr_spill(Reg::Rbx, tmp_off));
        frag.append(emit::gpr_restore(Reg::Rbx, tmp_off));
        frag.append(Instr::app(Opcode::Nop, vec![], vec![]));

        let mut ctx = MachineContext::default();
        pt.restore_fault_state(&frag, 4, &mut ctx).unwrap();
        assert_eq!(ctx.get_gpr(Reg::Rbx), 0xaaaa);
    }

    #[test]
    fn test_app_write_invalidates_mapping() {
        let mut pt = thread();
        let offset = pt.slots().slot_offset(1);
        pt.slots_mut().write_slot(1, 0xdead);
        let mut frag = InstrList::new();
        frag.append(emit::gpr_spill(Reg::Rbx, offset));
        frag.append(Instr::app(
            Opcode::Mov,
            vec![Opnd::reg(Reg::Rbx)],
            vec![Opnd::imm(7)],
        ));

        let mut ctx = MachineContext::default();
        ctx.set_gpr(Reg::Rbx, 7);
        pt.restore_fault_state(&frag, 2, &mut ctx).unwrap();
        assert_eq!(ctx.get_gpr(Reg::Rbx), 7, "stale slot must not be restored");
    }

    #[test]
    fn test_flags_in_accumulator_reconstructed() {
        let mut pt = thread();
        let acc_off = pt.slots().slot_offset(1);
        pt.slots_mut().write_slot(1, 0x9999); // app rax
        let mut frag = InstrList::new();
        frag.append(emit::gpr_spill(Reg::Rax, acc_off));
        for i in emit::flags_capture_tail() {
            frag.append(i);
        }
        frag.append(Instr::app(Opcode::Nop, vec![], vec![]));

        let mut ctx = MachineContext::default();
        // Fault-time rax: ah = captured byte (ZF|CF set), al = OF.
        ctx.set_gpr(Reg::Rax, (0x43u64 << 8) | 1);
        pt.restore_fault_state(&frag, 4, &mut ctx).unwrap();
        assert_eq!(
            ctx.aflags_set(),
            AFlags::CF | AFlags::ZF | AFlags::OF,
            "flags rebuilt from the captured byte and overflow bit"
        );
        assert_eq!(ctx.get_gpr(Reg::Rax), 0x9999, "app rax restored from slot");
    }

    #[test]
    fn test_flags_release_clears_tracking() {
        let pt = thread();
        let acc_off = pt.slots().slot_offset(1);
        let mut frag = InstrList::new();
        frag.append(emit::gpr_spill(Reg::Rax, acc_off));
        for i in emit::flags_capture_tail() {
            frag.append(i);
        }
        for i in emit::flags_release(false) {
            frag.append(i);
        }
        frag.append(emit::gpr_restore(Reg::Rax, acc_off));
        frag.append(Instr::app(Opcode::Nop, vec![], vec![]));

        let mut ctx = MachineContext::default();
        ctx.set_aflags(AFlags::SF);
        ctx.set_gpr(Reg::Rax, 0x42);
        pt.restore_fault_state(&frag, frag.len(), &mut ctx).unwrap();
        // Everything was released before the fault; nothing rewritten.
        assert_eq!(ctx.aflags_set(), AFlags::SF);
        assert_eq!(ctx.get_gpr(Reg::Rax), 0x42);
    }

    #[test]
    fn test_simd_pair_recognised() {
        let mut pt = thread();
        let mut bytes = [0u8; 16];
        bytes[0] = 0xab;
        bytes[15] = 0xcd;
        pt.slots_mut().simd_write(1, &bytes);
        let mut frag = InstrList::new();
        for i in emit::simd_spill(Reg::Xmm3, 1, Reg::Rcx, pt.slots().hidden_offset()) {
            frag.append(i);
        }
        frag.append(Instr::app(Opcode::Nop, vec![], vec![]));

        let mut ctx = MachineContext::default();
        pt.restore_fault_state(&frag, 3, &mut ctx).unwrap();
        assert_eq!(ctx.get_simd(Reg::Xmm3)[0], 0xab);
        assert_eq!(ctx.get_simd(Reg::Xmm3)[15], 0xcd);
    }

    #[test]
    fn test_fault_before_any_traffic_is_noop() {
        let pt = thread();
        let mut frag = InstrList::new();
        frag.append(Instr::app(Opcode::Nop, vec![], vec![]));
        let mut ctx = MachineContext::default();
        let reference = ctx.clone();
        pt.restore_fault_state(&frag, 0, &mut ctx).unwrap();
        assert_eq!(ctx, reference);
    }
}
