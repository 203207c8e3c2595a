//! The insertion driver
//!
//! Blocks are instrumented in two phases. `analyze_block` runs the
//! backward liveness scan; `insertion_pass` then visits each
//! application instruction in forward order, invoking the client hook
//! and wrapping the instruction with the minimum restore and re-spill
//! traffic:
//!
//! - before an instruction, non-native values the instruction (or the
//!   block end) needs are put back, lazily-deferred restores are
//!   retired, and reserved registers the instruction touches get
//!   their tool value parked in a fresh temp slot;
//! - after it, rewritten app values are re-saved and parked tool
//!   values come back.
//!
//! When a restore-for-read and a re-spill-for-write meet on the same
//! register, the emitted shape is exactly
//! `spill tool->tmp; restore app->reg; <app>; spill reg->appslot;
//! restore tmp->reg` - the fault walker depends on that ordering.

use log::{debug, trace};
use regmed_common::{BbProperties, Result, Status};
use regmed_isa::reg::ACCUMULATOR;
use regmed_isa::{AFlags, InstrId, InstrList, Reg};

use crate::emit;
use crate::liveness::{block_has_internal_cti, GprLive};
use crate::slots::AFLAGS_SLOT;
use crate::state::{PerThread, RegState};

/// Tool value parked around one application instruction.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Sandwich {
    pub reg: Reg,
    pub tmp_slot: usize,
    pub app_slot: usize,
    /// The app value was put back into the register, so it must be
    /// re-saved afterwards to keep the slot (and the fault walker's
    /// shadow mapping) consistent.
    pub restored_app: bool,
    /// The app slot lives in volatile host storage and must be
    /// refreshed after the instruction regardless of writes.
    pub volatile: bool,
}

impl PerThread {
    /// Per-block hints. Takes effect at the next `analyze_block`.
    pub fn set_bb_properties(&mut self, props: BbProperties) {
        self.props = props;
    }

    /// Run the backward liveness scan over the application
    /// instructions of `ilist` and latch per-block facts.
    pub fn analyze_block(&mut self, ilist: &InstrList) -> Result<()> {
        if ilist.is_empty() {
            return Err(Status::InvalidParameter);
        }
        self.live.analyze(ilist);
        self.uses.count(ilist);
        self.num_app = ilist.instrs().filter(|i| i.is_app()).count();
        self.internal_cti = block_has_internal_cti(ilist, self.props);
        debug!(
            "block analyzed: {} app instrs, internal cti: {}",
            self.num_app, self.internal_cti
        );
        Ok(())
    }

    /// Visit every application instruction in forward order. The
    /// client hook runs per instruction and may reserve and release
    /// registers and flags; the driver then emits the lazy restores
    /// and re-spills around the instruction.
    pub fn insertion_pass<F>(&mut self, ilist: &mut InstrList, mut client: F) -> Result<()>
    where
        F: FnMut(&mut PerThread, &mut InstrList, InstrId, usize) -> Result<()>,
    {
        let app_ids = ilist.app_ids();
        if app_ids.len() != self.num_app || app_ids.is_empty() {
            return Err(Status::InvalidParameter);
        }
        let n = app_ids.len();
        self.in_insertion = true;
        let result = (|| {
            for (ord, &id) in app_ids.iter().enumerate() {
                self.cur_ord = ord;
                let is_last = ord + 1 == n;
                client(&mut *self, ilist, id, ord)?;
                self.pre_instr(ilist, id, is_last)?;
                self.post_instr(ilist, id, ord)?;
                self.debug_check_invariants();
            }
            Ok(())
        })();
        self.in_insertion = false;
        self.props = BbProperties::default();
        self.sandwiches.clear();
        if result.is_ok() {
            debug_assert!(self.check_block_end(), "block left non-native state behind");
        }
        result
    }

    /// Restores and tool-value parking in front of one instruction.
    fn pre_instr(&mut self, ilist: &mut InstrList, id: InstrId, is_last: bool) -> Result<()> {
        let instr = ilist.get(id).ok_or(Status::InvalidParameter)?.clone();
        let effect = instr.aflags_effect();

        // A client that holds the flags into the last instruction
        // forgot to release them; restore the app state regardless.
        if is_last && self.aflags.is_reserved() {
            crate::report_inconsistency(Status::Error)?;
            self.restore_app_aflags(ilist, id, true)?;
            self.aflags.set_reserved(false);
        }

        if !self.aflags.is_native() {
            let reads_flags = !effect.read.is_empty();
            let partial_write = !effect.written.is_empty() && effect.written != AFlags::ALL;
            let volatile = self.slots.is_host_slot(AFLAGS_SLOT);
            if is_last || reads_flags || partial_write || volatile {
                let release = !self.aflags.is_reserved();
                trace!("pre: restoring app flags (release={release})");
                self.restore_app_aflags(ilist, id, release)?;
            }
        }

        // A capture parked in the accumulator cannot survive the app
        // touching the accumulator itself.
        if self.aflags.carried_in_accumulator()
            && (instr.reads_from_reg(ACCUMULATOR) || instr.writes_to_reg(ACCUMULATOR) || is_last)
        {
            trace!("pre: evicting flags capture around accumulator use");
            self.evict_aflags(ilist, id)?;
        }

        for reg in Reg::gprs().chain(Reg::simds()) {
            let st = *self.reg_state(reg);
            if st.native {
                continue;
            }
            if reg == ACCUMULATOR && self.aflags.carried_in_accumulator() {
                // The flags engine owns it; handled above.
                continue;
            }
            let volatile_slot = reg.is_gpr()
                && st.ever_spilled
                && st.slot.map_or(false, |s| self.slots.is_host_slot(s));
            let restore_needed = instr.reads_from_reg(reg)
                || instr.partially_writes_reg(reg)
                || instr.conditionally_writes_reg(reg)
                || volatile_slot
                || (self.internal_cti && !st.in_use);
            if st.in_use {
                if is_last {
                    // Client misuse: reserved into the last
                    // instruction. Give the app its value back.
                    crate::report_inconsistency(Status::Error)?;
                    self.force_release(ilist, id, reg)?;
                    continue;
                }
                let write_hazard = instr.writes_to_reg(reg);
                if restore_needed || write_hazard {
                    self.begin_sandwich(ilist, id, reg, restore_needed, volatile_slot)?;
                }
            } else if is_last || restore_needed {
                trace!("pre: lazy restore of {reg}");
                self.lazy_restore(ilist, id, reg)?;
            }
        }
        Ok(())
    }

    /// Park the tool value of a reserved register in a fresh slot
    /// and, when the instruction needs it, put the app value back in
    /// the register.
    fn begin_sandwich(
        &mut self,
        ilist: &mut InstrList,
        id: InstrId,
        reg: Reg,
        restore_app: bool,
        volatile: bool,
    ) -> Result<()> {
        let st = *self.reg_state(reg);
        let app_slot = st.slot.ok_or(Status::Error)?;
        if restore_app && !st.ever_spilled {
            // Liveness promised this register stays dead; an app read
            // of it here means the analysis and the block disagree.
            crate::report_inconsistency(Status::Error)?;
        }
        debug!("sandwich around {reg} (restore_app={restore_app})");
        if reg.is_gpr() {
            let tmp = self.slots.alloc_gpr_slot(reg)?;
            let mut seq = vec![emit::gpr_spill(reg, self.slots.slot_offset(tmp))];
            if restore_app && st.ever_spilled {
                seq.push(emit::gpr_restore(reg, self.slots.slot_offset(app_slot)));
            }
            emit::emit_before(ilist, id, seq)?;
            self.sandwiches.push(Sandwich {
                reg,
                tmp_slot: tmp,
                app_slot,
                restored_app: restore_app && st.ever_spilled,
                volatile,
            });
        } else {
            let tmp = self.slots.alloc_simd_slot(reg)?;
            self.emit_simd_spill(ilist, id, reg, tmp)?;
            if restore_app && st.ever_spilled {
                self.emit_simd_restore(ilist, id, reg, app_slot)?;
            }
            self.sandwiches.push(Sandwich {
                reg,
                tmp_slot: tmp,
                app_slot,
                restored_app: restore_app && st.ever_spilled,
                volatile,
            });
        }
        Ok(())
    }

    /// Retire a deferred restore: the client is done with the
    /// register, so put the app value back and free the slot.
    fn lazy_restore(&mut self, ilist: &mut InstrList, id: InstrId, reg: Reg) -> Result<()> {
        let st = *self.reg_state(reg);
        debug_assert!(!st.native && !st.in_use && st.ever_spilled);
        let slot = st.slot.ok_or(Status::Error)?;
        if reg.is_gpr() {
            let offset = self.slots.slot_offset(slot);
            emit::emit_before(ilist, id, vec![emit::gpr_restore(reg, offset)])?;
            self.slots.free_gpr_slot(slot);
        } else {
            self.emit_simd_restore(ilist, id, reg, slot)?;
            self.slots.free_simd_slot(slot);
        }
        *self.reg_state_mut(reg) = RegState::NATIVE;
        self.adjust_pending(reg, -1);
        Ok(())
    }

    /// Forced release of a client-held register (misuse recovery).
    fn force_release(&mut self, ilist: &mut InstrList, id: InstrId, reg: Reg) -> Result<()> {
        let st = *self.reg_state(reg);
        if let Some(slot) = st.slot {
            if st.ever_spilled {
                if reg.is_gpr() {
                    let offset = self.slots.slot_offset(slot);
                    emit::emit_before(ilist, id, vec![emit::gpr_restore(reg, offset)])?;
                } else {
                    self.emit_simd_restore(ilist, id, reg, slot)?;
                }
            }
            if reg.is_gpr() {
                self.slots.free_gpr_slot(slot);
            } else {
                self.slots.free_simd_slot(slot);
            }
        }
        *self.reg_state_mut(reg) = RegState::NATIVE;
        Ok(())
    }

    /// Re-spills and tool-value recovery behind one instruction.
    fn post_instr(&mut self, ilist: &mut InstrList, id: InstrId, ord: usize) -> Result<()> {
        let instr = ilist.get(id).ok_or(Status::InvalidParameter)?.clone();
        let effect = instr.aflags_effect();
        let flags_after = self
            .live_idx_after(ord)
            .map(|idx| self.live.aflags_at(idx))
            .unwrap_or(AFlags::NONE);

        if !effect.written.is_empty() {
            if self.aflags.is_reserved() && effect.written.intersects(flags_after) {
                // The app rewrote flags someone downstream still
                // reads; the saved copy is stale.
                trace!("post: re-capturing flags after app write");
                self.recapture_aflags_after(ilist, id)?;
            } else if !self.aflags.is_native() && !self.aflags.is_reserved() {
                trace!("post: dropping stale flags capture");
                self.drop_stale_aflags_after(ilist, id)?;
            }
        }

        // Close out parked tool values, innermost shape first: spill
        // the rewritten app value, then bring the tool value back.
        let sandwiches = std::mem::take(&mut self.sandwiches);
        for sw in sandwiches {
            let wrote = instr.writes_to_reg(sw.reg);
            let live_after = self.reg_live_after(sw.reg, ord);
            // A register that had its app value restored must re-save
            // it: the matching-slot restore erased the walker's
            // mapping, and the app may have rewritten the value.
            let respill_app = sw.restored_app || sw.volatile || (wrote && live_after);
            if sw.reg.is_gpr() {
                let mut seq = Vec::new();
                if respill_app {
                    seq.push(emit::gpr_spill(sw.reg, self.slots.slot_offset(sw.app_slot)));
                }
                seq.push(emit::gpr_restore(sw.reg, self.slots.slot_offset(sw.tmp_slot)));
                emit::emit_after(ilist, id, seq)?;
            } else {
                self.emit_simd_after(ilist, id, |scratch, hidden| {
                    let mut seq = vec![emit::gpr_restore(scratch, hidden)];
                    if respill_app {
                        seq.extend(
                            emit::simd_spill(sw.reg, sw.app_slot, scratch, hidden)
                                .into_iter()
                                .skip(1),
                        );
                    }
                    seq.extend(
                        emit::simd_restore(sw.reg, sw.tmp_slot, scratch, hidden)
                            .into_iter()
                            .skip(1),
                    );
                    seq
                })?;
            }
            if respill_app {
                self.reg_state_mut(sw.reg).ever_spilled = true;
            }
            if sw.reg.is_gpr() {
                self.slots.free_gpr_slot(sw.tmp_slot);
            } else {
                self.slots.free_simd_slot(sw.tmp_slot);
            }
        }

        // Stale spilled values: the app replaced the register, so the
        // deferred restore must not happen.
        for reg in Reg::gprs().chain(Reg::simds()) {
            let st = *self.reg_state(reg);
            if st.native || st.in_use {
                continue;
            }
            if reg == ACCUMULATOR && self.aflags.carried_in_accumulator() {
                continue;
            }
            if instr.writes_to_reg(reg) {
                trace!("post: dropping stale spill of {reg}");
                if let Some(slot) = st.slot {
                    if reg.is_gpr() {
                        self.slots.free_gpr_slot(slot);
                    } else {
                        self.slots.free_simd_slot(slot);
                    }
                }
                *self.reg_state_mut(reg) = RegState::NATIVE;
                self.adjust_pending(reg, -1);
            }
        }
        Ok(())
    }

    /// Is the app value of `reg` still needed after position `ord`.
    fn reg_live_after(&self, reg: Reg, ord: usize) -> bool {
        match self.live_idx_after(ord) {
            None => false,
            Some(idx) => {
                if self.conservative {
                    return true;
                }
                if reg.is_gpr() {
                    self.live.gpr_at(reg, idx) != GprLive::Dead
                } else {
                    self.live.simd_at(reg, idx).is_live()
                }
            }
        }
    }
}
