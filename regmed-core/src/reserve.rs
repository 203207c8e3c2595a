//! The reservation algorithm
//!
//! Selection order for a reservation request: reuse a register whose
//! lazy restore is still pending, then a dead register, then the
//! live register the block uses least, and finally the accumulator
//! after evicting a flags capture parked there. The stack pointer and
//! the host framework's stolen register are never handed out.

use log::{debug, trace};
use regmed_common::{Result, SpillClass, Status};
use regmed_isa::reg::{ACCUMULATOR, STACK_POINTER};
use regmed_isa::{Instr, InstrId, InstrList, Opnd, Reg, RegSet};

use crate::emit::{self, SimdMove, TlsMove};
use crate::slots::STOLEN_TLS_OFFSET;
use crate::state::{PerThread, RegState};

/// What a client can learn about a register's reservation state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReservationInfo {
    pub reserved: bool,
    /// The application value is currently in the register itself.
    pub holds_app_value: bool,
    /// A slot retains the application value.
    pub app_value_retained: bool,
    /// Where the application value lives right now, if anywhere.
    pub location: Option<Opnd>,
    /// The retaining slot is host-framework storage, which is not
    /// preserved across application instructions.
    pub is_host_slot: bool,
    pub slot_offset: Option<u32>,
}

/// Classification of a single instruction as mediator-emitted
/// spill/restore traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SpillRestoreInfo {
    pub spill: bool,
    pub restore: bool,
    pub reg: Option<Reg>,
}

impl PerThread {
    /// Liveness index for a reservation at `at`. Inside the insertion
    /// pass the per-block vectors are current; outside it a forward
    /// scan from `at` fills a single position.
    pub(crate) fn current_live_idx(&mut self, ilist: &InstrList, at: InstrId) -> Result<usize> {
        if self.in_insertion {
            Ok(self.live_idx(self.cur_ord))
        } else {
            let idx = ilist.index_of(at).ok_or(Status::InvalidParameter)?;
            self.live.analyze_forward(ilist, idx)?;
            Ok(0)
        }
    }

    /// Reserve a scratch register of `class`, spilling only when the
    /// register is live here.
    pub fn reserve_register(
        &mut self,
        ilist: &mut InstrList,
        at: InstrId,
        class: SpillClass,
        allowed: Option<&RegSet>,
    ) -> Result<Reg> {
        self.reserve_common(ilist, at, class, allowed, false)
    }

    /// Reserve a register that is dead at this point; never spills.
    pub fn reserve_dead_register(
        &mut self,
        ilist: &mut InstrList,
        at: InstrId,
        class: SpillClass,
        allowed: Option<&RegSet>,
    ) -> Result<Reg> {
        self.reserve_common(ilist, at, class, allowed, true)
    }

    fn reserve_common(
        &mut self,
        ilist: &mut InstrList,
        at: InstrId,
        class: SpillClass,
        allowed: Option<&RegSet>,
        only_if_free: bool,
    ) -> Result<Reg> {
        match class {
            SpillClass::SimdYmm | SpillClass::SimdZmm => {
                return Err(Status::FeatureNotAvailable);
            }
            SpillClass::SimdXmm if self.slots.num_simd() == 0 => {
                return Err(Status::OutOfSlots);
            }
            _ => {}
        }
        let default_set = match class {
            SpillClass::Gpr => {
                let mut set = RegSet::all_gprs();
                if let Some(stolen) = self.stolen {
                    set.remove(stolen);
                }
                set
            }
            _ => RegSet::all_simd(),
        };
        let allowed = allowed.copied().unwrap_or(default_set);
        for reg in allowed.iter() {
            if reg.is_gpr() != matches!(class, SpillClass::Gpr) {
                return Err(Status::InvalidSpillClass);
            }
        }
        let idx = self.current_live_idx(ilist, at)?;
        let candidates: Vec<Reg> = allowed
            .iter()
            .filter(|r| *r != STACK_POINTER && Some(*r) != self.stolen)
            .collect();

        // Reuse a register whose lazy restore is still pending: the
        // slot already holds the app value, so nothing is emitted.
        let pending = match class {
            SpillClass::Gpr => self.gpr_pending,
            _ => self.simd_pending,
        };
        if pending > 0 {
            for &reg in &candidates {
                let st = *self.reg_state(reg);
                if !st.native && !st.in_use {
                    if only_if_free && !self.dead_at(reg, idx) {
                        continue;
                    }
                    self.reg_state_mut(reg).in_use = true;
                    self.adjust_pending(reg, -1);
                    debug!("reserve {reg}: reusing un-restored register");
                    return Ok(reg);
                }
            }
        }

        // First dead register in the allowed set.
        for &reg in &candidates {
            let st = *self.reg_state(reg);
            if st.native && !st.in_use && self.dead_at(reg, idx) {
                debug!("reserve {reg}: dead here");
                return self.take_register(ilist, at, reg, false);
            }
        }
        if only_if_free {
            trace!("no dead register available");
            return Err(Status::RegConflict);
        }

        // Least-used live register.
        let victim = candidates
            .iter()
            .filter(|r| {
                let st = self.reg_state(**r);
                st.native && !st.in_use
            })
            .min_by_key(|r| {
                if r.is_gpr() {
                    self.uses.gpr[r.gpr_index()]
                } else {
                    self.uses.simd[r.simd_index()]
                }
            })
            .copied();
        if let Some(reg) = victim {
            debug!("reserve {reg}: least-used live register");
            return self.take_register(ilist, at, reg, true);
        }

        // The accumulator may only look taken because a flags capture
        // is parked there; evict the flags and reuse it.
        if self.aflags.carried_in_accumulator() && allowed.contains(ACCUMULATOR) {
            debug!("reserve: evicting flags capture to free the accumulator");
            self.evict_aflags(ilist, at)?;
            return self.take_register(ilist, at, ACCUMULATOR, true);
        }

        trace!("reservation failed: no candidate in allowed set");
        Err(Status::RegConflict)
    }

    fn dead_at(&self, reg: Reg, idx: usize) -> bool {
        if reg.is_gpr() {
            self.gpr_dead_at(reg, idx)
        } else {
            self.simd_dead_at(reg, idx)
        }
    }

    /// Claim `reg`: allocate the first free slot and spill iff the
    /// register is live here (conservative mode always spills).
    fn take_register(
        &mut self,
        ilist: &mut InstrList,
        at: InstrId,
        reg: Reg,
        live: bool,
    ) -> Result<Reg> {
        let spill = live || self.conservative;
        if reg.is_gpr() {
            let slot = self.slots.alloc_gpr_slot(reg)?;
            if spill {
                let offset = self.slots.slot_offset(slot);
                emit::emit_before(ilist, at, vec![emit::gpr_spill(reg, offset)])?;
            }
            *self.reg_state_mut(reg) = RegState {
                in_use: true,
                native: false,
                ever_spilled: spill,
                slot: Some(slot),
                xchg: None,
            };
        } else {
            let slot = self.slots.alloc_simd_slot(reg)?;
            if spill {
                self.emit_simd_spill(ilist, at, reg, slot)?;
            }
            *self.reg_state_mut(reg) = RegState {
                in_use: true,
                native: false,
                ever_spilled: spill,
                slot: Some(slot),
                xchg: None,
            };
        }
        trace!("{reg} reserved (spilled={spill})");
        Ok(reg)
    }

    /// Release a scratch register immediately, restoring its app
    /// value in place rather than lazily. Generated pointer loads
    /// leave garbage in the scratch, so it must not stay unrestored
    /// across the instruction being instrumented.
    fn release_scratch(&mut self, ilist: &mut InstrList, at: InstrId, scratch: Reg) -> Result<()> {
        let st = *self.reg_state(scratch);
        debug_assert!(st.in_use && scratch.is_gpr());
        if st.ever_spilled {
            self.restore_now(ilist, at, scratch)
        } else {
            if let Some(slot) = st.slot {
                self.slots.free_gpr_slot(slot);
            }
            *self.reg_state_mut(scratch) = RegState::NATIVE;
            Ok(())
        }
    }

    /// Vector spills go through a pointer in the hidden slot, so a
    /// scratch GPR is reserved around each one.
    pub(crate) fn emit_simd_spill(
        &mut self,
        ilist: &mut InstrList,
        at: InstrId,
        reg: Reg,
        slot: usize,
    ) -> Result<()> {
        let scratch = self.reserve_register(ilist, at, SpillClass::Gpr, None)?;
        let seq = emit::simd_spill(reg, slot, scratch, self.slots.hidden_offset());
        emit::emit_before(ilist, at, seq)?;
        self.release_scratch(ilist, at, scratch)
    }

    pub(crate) fn emit_simd_restore(
        &mut self,
        ilist: &mut InstrList,
        at: InstrId,
        reg: Reg,
        slot: usize,
    ) -> Result<()> {
        let scratch = self.reserve_register(ilist, at, SpillClass::Gpr, None)?;
        let seq = emit::simd_restore(reg, slot, scratch, self.slots.hidden_offset());
        emit::emit_before(ilist, at, seq)?;
        self.release_scratch(ilist, at, scratch)
    }

    /// Emit a vector move sequence after `at`. The scratch is chosen
    /// against the liveness of the position after the instruction and
    /// never from the registers the instruction writes, because its
    /// own spill still lands before the instruction.
    pub(crate) fn emit_simd_after(
        &mut self,
        ilist: &mut InstrList,
        at: InstrId,
        build: impl FnOnce(Reg, u32) -> Vec<Instr>,
    ) -> Result<()> {
        let written: Vec<Reg> = Reg::gprs()
            .filter(|r| ilist.get(at).map(|i| i.writes_to_reg(*r)).unwrap_or(false))
            .collect();
        let mut allowed = RegSet::all_gprs();
        if let Some(stolen) = self.stolen {
            allowed.remove(stolen);
        }
        for reg in &written {
            allowed.remove(*reg);
        }
        let saved_ord = self.cur_ord;
        let saved_conservative = self.conservative;
        if self.cur_ord + 1 < self.num_app {
            self.cur_ord += 1;
        } else {
            // No position after the last instruction; trust nothing.
            self.conservative = true;
        }
        let scratch = self.reserve_register(ilist, at, SpillClass::Gpr, Some(&allowed));
        self.cur_ord = saved_ord;
        self.conservative = saved_conservative;
        let scratch = scratch?;

        let mut seq = build(scratch, self.slots.hidden_offset());
        let st = *self.reg_state(scratch);
        if st.ever_spilled {
            if let Some(slot) = st.slot {
                seq.push(emit::gpr_restore(scratch, self.slots.slot_offset(slot)));
            }
        }
        emit::emit_after(ilist, at, seq)?;
        if let Some(slot) = st.slot {
            self.slots.free_gpr_slot(slot);
        }
        *self.reg_state_mut(scratch) = RegState::NATIVE;
        Ok(())
    }

    /// Give a register back. Inside the insertion pass the restore is
    /// lazy; outside it is emitted immediately. A register that was
    /// reserved while dead never wrote its slot and needs no restore.
    pub fn unreserve_register(
        &mut self,
        ilist: &mut InstrList,
        at: InstrId,
        reg: Reg,
    ) -> Result<()> {
        let st = *self.reg_state(reg);
        if !st.in_use {
            return Err(Status::InvalidParameter);
        }
        if st.native {
            // Free ownership taken while the value was dead.
            self.reg_state_mut(reg).in_use = false;
            return Ok(());
        }
        if !st.ever_spilled {
            let slot = st.slot.ok_or(Status::Error)?;
            if reg.is_gpr() {
                self.slots.free_gpr_slot(slot);
            } else {
                self.slots.free_simd_slot(slot);
            }
            *self.reg_state_mut(reg) = RegState::NATIVE;
            trace!("{reg} unreserved without restore (never spilled)");
            return Ok(());
        }
        if self.in_insertion {
            self.reg_state_mut(reg).in_use = false;
            self.adjust_pending(reg, 1);
            trace!("{reg} unreserved, restore deferred");
            return Ok(());
        }
        self.restore_now(ilist, at, reg)
    }

    /// Immediate restore and release of a spilled register.
    pub(crate) fn restore_now(
        &mut self,
        ilist: &mut InstrList,
        at: InstrId,
        reg: Reg,
    ) -> Result<()> {
        let st = *self.reg_state(reg);
        let slot = st.slot.ok_or(Status::Error)?;
        if reg.is_gpr() {
            let offset = self.slots.slot_offset(slot);
            emit::emit_before(ilist, at, vec![emit::gpr_restore(reg, offset)])?;
            self.slots.free_gpr_slot(slot);
        } else {
            self.emit_simd_restore(ilist, at, reg, slot)?;
            self.slots.free_simd_slot(slot);
        }
        *self.reg_state_mut(reg) = RegState::NATIVE;
        trace!("{reg} restored and released");
        Ok(())
    }

    /// Materialise the application value of `reg` into `dst`.
    pub fn get_app_value(
        &mut self,
        ilist: &mut InstrList,
        at: InstrId,
        reg: Reg,
        dst: Reg,
    ) -> Result<()> {
        if reg.is_gpr() != dst.is_gpr() {
            return Err(Status::InvalidSpillClass);
        }
        if Some(reg) == self.stolen {
            // The host framework keeps the app value of its stolen
            // register in its own storage.
            emit::emit_before(ilist, at, vec![emit::gpr_restore(dst, STOLEN_TLS_OFFSET)])?;
            return Ok(());
        }
        let st = *self.reg_state(reg);
        if st.native {
            if reg != dst {
                let instr = if reg.is_gpr() {
                    Instr::mov(Opnd::reg(dst), Opnd::reg(reg))
                } else {
                    Instr::mov_simd(Opnd::reg(dst), Opnd::reg(reg))
                };
                emit::emit_before(ilist, at, vec![instr])?;
            }
            return Ok(());
        }
        let slot = match (st.ever_spilled, st.slot) {
            (true, Some(slot)) => slot,
            _ => {
                trace!("{reg}: no app value recoverable");
                return Err(Status::NoAppValue);
            }
        };
        if reg.is_gpr() {
            let offset = self.slots.slot_offset(slot);
            emit::emit_before(ilist, at, vec![emit::gpr_restore(dst, offset)])?;
        } else {
            let scratch = self.reserve_register(ilist, at, SpillClass::Gpr, None)?;
            let seq = emit::simd_restore(dst, slot, scratch, self.slots.hidden_offset());
            emit::emit_before(ilist, at, seq)?;
            self.unreserve_register(ilist, at, scratch)?;
        }
        Ok(())
    }

    /// Rewrite a memory operand so it reads application values: a
    /// reference to the stolen register is redirected through a swap
    /// register (allocated here unless supplied), and any other
    /// non-native addressing register is reloaded in place.
    pub fn restore_app_values(
        &mut self,
        ilist: &mut InstrList,
        at: InstrId,
        opnd: &mut Opnd,
        swap: Option<Reg>,
    ) -> Result<Option<Reg>> {
        let Some(mut mem) = opnd.as_mem() else {
            return Ok(None);
        };
        let mut swap_used = swap;
        for part in [&mut mem.base, &mut mem.index] {
            let Some(reg) = *part else { continue };
            if Some(reg) == self.stolen {
                let swap_reg = match swap_used {
                    Some(r) => r,
                    None => {
                        let r = self.reserve_register(ilist, at, SpillClass::Gpr, None)?;
                        swap_used = Some(r);
                        r
                    }
                };
                self.get_app_value(ilist, at, reg, swap_reg)?;
                *part = Some(swap_reg);
            } else if !self.reg_state(reg).native {
                self.get_app_value(ilist, at, reg, reg)?;
            }
        }
        *opnd = Opnd::Mem(mem);
        Ok(if swap.is_some() { None } else { swap_used })
    }

    /// Restore the application value at one point and re-save it at
    /// another, without releasing the reservation. The fault walker
    /// sees a matched restore/spill pair, so state reconstruction is
    /// unaffected.
    pub fn statelessly_restore_app_value(
        &mut self,
        ilist: &mut InstrList,
        reg: Reg,
        at_restore: InstrId,
        at_respill: Option<InstrId>,
    ) -> Result<()> {
        let st = *self.reg_state(reg);
        if st.native {
            return Ok(());
        }
        let slot = match (st.ever_spilled, st.slot) {
            (true, Some(slot)) => slot,
            _ => return Err(Status::NoAppValue),
        };
        if reg.is_gpr() {
            let offset = self.slots.slot_offset(slot);
            emit::emit_before(ilist, at_restore, vec![emit::gpr_restore(reg, offset)])?;
            if let Some(respill) = at_respill {
                emit::emit_before(ilist, respill, vec![emit::gpr_spill(reg, offset)])?;
            }
        } else {
            self.emit_simd_restore(ilist, at_restore, reg, slot)?;
            if let Some(respill) = at_respill {
                self.emit_simd_spill(ilist, respill, reg, slot)?;
            }
        }
        trace!("{reg}: stateless app-value restore");
        Ok(())
    }

    /// Whether `reg` is dead at `at`, per the liveness vectors.
    pub fn is_register_dead(
        &mut self,
        ilist: &InstrList,
        at: InstrId,
        reg: Reg,
    ) -> Result<bool> {
        let idx = self.current_live_idx(ilist, at)?;
        Ok(if reg.is_gpr() {
            self.live.gpr_at(reg, idx) == crate::liveness::GprLive::Dead
        } else {
            !self.live.simd_at(reg, idx).is_live()
        })
    }

    /// Everything a client can learn about one register.
    pub fn reservation_info_ex(&self, reg: Reg) -> ReservationInfo {
        let st = *self.reg_state(reg);
        if st.native {
            return ReservationInfo {
                reserved: st.in_use,
                holds_app_value: true,
                app_value_retained: false,
                location: Some(Opnd::reg(reg)),
                is_host_slot: false,
                slot_offset: None,
            };
        }
        match (st.ever_spilled, st.slot) {
            (true, Some(slot)) if reg.is_gpr() => {
                let offset = self.slots.slot_offset(slot);
                ReservationInfo {
                    reserved: st.in_use,
                    holds_app_value: false,
                    app_value_retained: true,
                    location: Some(Opnd::tls(offset)),
                    is_host_slot: self.slots.is_host_slot(slot),
                    slot_offset: Some(offset),
                }
            }
            (true, Some(slot)) => ReservationInfo {
                reserved: st.in_use,
                holds_app_value: false,
                app_value_retained: true,
                location: None,
                is_host_slot: false,
                slot_offset: Some((slot * crate::slots::SIMD_SLOT_BYTES) as u32),
            },
            _ => ReservationInfo {
                reserved: st.in_use,
                holds_app_value: false,
                app_value_retained: false,
                location: None,
                is_host_slot: false,
                slot_offset: None,
            },
        }
    }

    /// Classify an instruction as mediator spill/restore traffic.
    pub fn is_instr_spill_or_restore(&self, instr: &Instr) -> SpillRestoreInfo {
        if let Some(mv) = emit::classify_tls_move(instr) {
            let (offset, reg, spill) = match mv {
                TlsMove::Spill { reg, offset } => (offset, reg, true),
                TlsMove::Restore { reg, offset } => (offset, reg, false),
            };
            if self.slots.classify_offset(offset).is_some() || offset == STOLEN_TLS_OFFSET {
                return SpillRestoreInfo {
                    spill,
                    restore: !spill,
                    reg: Some(reg),
                };
            }
            return SpillRestoreInfo::default();
        }
        match emit::classify_simd_move(instr) {
            Some(SimdMove::Spill { reg, .. }) => SpillRestoreInfo {
                spill: true,
                restore: false,
                reg: Some(reg),
            },
            Some(SimdMove::Restore { reg, .. }) => SpillRestoreInfo {
                spill: false,
                restore: true,
                reg: Some(reg),
            },
            None => SpillRestoreInfo::default(),
        }
    }
}
