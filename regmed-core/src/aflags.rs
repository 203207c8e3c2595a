//! Arithmetic-flags engine
//!
//! A sub-state-machine beside the register states. The flags value
//! moves between three homes: the architectural flags (native), the
//! reserved flags slot in memory, and the accumulator. Capturing
//! parks the value in the accumulator first and defers the memory
//! write; a client reserving the accumulator evicts the value to the
//! flags slot.

use log::{debug, trace};
use regmed_common::{Result, Status};
use regmed_isa::{AFlags, InstrId, InstrList, Reg};

use crate::emit;
use crate::slots::AFLAGS_SLOT;
use crate::state::PerThread;

const ACC: Reg = regmed_isa::reg::ACCUMULATOR;

/// Where the application's flags currently live. Instead of a slot,
/// the captured word can live in an exchange-partner register; only
/// this engine uses that alternative, and the partner is always the
/// accumulator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct AflagsTracker {
    /// The application value is in the architectural flags.
    native: bool,
    /// Reserved by a client.
    in_use: bool,
    /// The captured word sits in the flags slot.
    in_memory: bool,
    /// Register carrying the captured word, when not in memory.
    xchg: Option<Reg>,
}

impl AflagsTracker {
    pub(crate) fn new() -> Self {
        Self {
            native: true,
            in_use: false,
            in_memory: false,
            xchg: None,
        }
    }

    pub(crate) fn is_native(&self) -> bool {
        self.native
    }

    pub(crate) fn is_reserved(&self) -> bool {
        self.in_use
    }

    pub(crate) fn carried_in_accumulator(&self) -> bool {
        self.xchg.is_some()
    }

    pub(crate) fn set_reserved(&mut self, in_use: bool) {
        self.in_use = in_use;
    }

    fn set_native(&mut self) {
        self.native = true;
        self.in_memory = false;
        self.xchg = None;
    }
}

impl PerThread {
    /// Reserve the arithmetic flags for a client.
    ///
    /// If the flags are dead at this point, ownership is free and the
    /// engine stays native. If an earlier capture is still
    /// outstanding it is resumed without emitting anything. Otherwise
    /// a capture sequence is emitted and the value is parked in the
    /// accumulator, deferring the memory write.
    pub fn reserve_aflags(&mut self, ilist: &mut InstrList, at: InstrId) -> Result<()> {
        if self.aflags.in_use {
            return Err(Status::InUse);
        }
        if !self.aflags.native {
            debug!("aflags: resuming outstanding capture");
            self.aflags.in_use = true;
            return Ok(());
        }
        let idx = self.current_live_idx(ilist, at)?;
        if !self.conservative && self.live.aflags_at(idx).is_empty() {
            debug!("aflags: dead here, free ownership");
            self.aflags.in_use = true;
            return Ok(());
        }
        self.capture_aflags(ilist, at)?;
        self.aflags.in_use = true;
        Ok(())
    }

    /// Emit the capture sequence before `at`: preserve the
    /// accumulator, then load the flags into it.
    fn capture_aflags(&mut self, ilist: &mut InstrList, at: InstrId) -> Result<()> {
        let acc = self.gpr[ACC.gpr_index()];
        if acc.in_use {
            trace!("aflags: accumulator is client-reserved");
            return Err(Status::RegConflict);
        }
        if acc.native {
            let slot = self.slots.alloc_gpr_slot(ACC)?;
            let offset = self.slots.slot_offset(slot);
            emit::emit_before(ilist, at, vec![emit::gpr_spill(ACC, offset)])?;
            let st = &mut self.gpr[ACC.gpr_index()];
            st.native = false;
            st.ever_spilled = true;
            st.slot = Some(slot);
        } else {
            // A lazy restore was pending; the slot already holds the
            // app value and the engine takes the register over.
            self.adjust_pending(ACC, -1);
        }
        self.gpr[ACC.gpr_index()].in_use = true;
        emit::emit_before(ilist, at, emit::flags_capture_tail())?;
        self.aflags.native = false;
        self.aflags.xchg = Some(ACC);
        self.aflags.in_memory = false;
        debug!("aflags: captured into accumulator");
        Ok(())
    }

    /// Move a capture parked in the accumulator out to the flags slot
    /// and give the accumulator back.
    pub(crate) fn evict_aflags(&mut self, ilist: &mut InstrList, at: InstrId) -> Result<()> {
        debug_assert!(self.aflags.carried_in_accumulator());
        let flags_offset = self.slots.slot_offset(AFLAGS_SLOT);
        emit::emit_before(ilist, at, vec![emit::gpr_spill(ACC, flags_offset)])?;
        self.release_accumulator(ilist, at)?;
        self.aflags.xchg = None;
        self.aflags.in_memory = true;
        debug!("aflags: evicted to flags slot");
        Ok(())
    }

    /// Restore the accumulator's app value and return it to native
    /// state. The engine owns it at this point.
    fn release_accumulator(&mut self, ilist: &mut InstrList, at: InstrId) -> Result<()> {
        let st = self.gpr[ACC.gpr_index()];
        debug_assert!(st.in_use && !st.native);
        if let Some(slot) = st.slot {
            let offset = self.slots.slot_offset(slot);
            emit::emit_before(ilist, at, vec![emit::gpr_restore(ACC, offset)])?;
            self.slots.free_gpr_slot(slot);
        }
        self.gpr[ACC.gpr_index()] = crate::state::RegState::NATIVE;
        Ok(())
    }

    /// Write the application's flags back into the architectural
    /// flags. With `release`, the engine transitions to native and
    /// the accumulator goes back to the application; otherwise the
    /// capture stays valid for later use.
    pub fn restore_app_aflags(
        &mut self,
        ilist: &mut InstrList,
        at: InstrId,
        release: bool,
    ) -> Result<()> {
        if self.aflags.native {
            return Ok(());
        }
        if self.aflags.carried_in_accumulator() {
            emit::emit_before(ilist, at, emit::flags_release(!release))?;
            if release {
                self.release_accumulator(ilist, at)?;
                self.aflags.set_native();
                debug!("aflags: released from accumulator");
            }
            return Ok(());
        }
        // The capture sits in the flags slot; route it through the
        // accumulator, preserving whatever is there. The transient
        // slot briefly marks the accumulator as spilled so the walk
        // sees a matched pair.
        let flags_offset = self.slots.slot_offset(AFLAGS_SLOT);
        let tmp = self.slots.alloc_gpr_slot(ACC)?;
        let tmp_offset = self.slots.slot_offset(tmp);
        let mut seq = vec![
            emit::gpr_spill(ACC, tmp_offset),
            emit::gpr_restore(ACC, flags_offset),
        ];
        seq.extend(emit::flags_release(false));
        seq.push(emit::gpr_restore(ACC, tmp_offset));
        emit::emit_before(ilist, at, seq)?;
        self.slots.free_gpr_slot(tmp);
        if release {
            self.aflags.set_native();
            debug!("aflags: released from memory");
        }
        Ok(())
    }

    /// Give up a flags reservation. Inside the insertion pass the
    /// restore is deferred to the latest correct point; outside it
    /// happens immediately.
    pub fn unreserve_aflags(&mut self, ilist: &mut InstrList, at: InstrId) -> Result<()> {
        if !self.aflags.in_use {
            return Err(Status::InvalidParameter);
        }
        self.aflags.in_use = false;
        if self.aflags.native {
            trace!("aflags: free ownership returned");
            return Ok(());
        }
        if self.in_insertion {
            trace!("aflags: unreserved, restore deferred");
            return Ok(());
        }
        self.restore_app_aflags(ilist, at, true)
    }

    /// Flags still read downstream of the current point.
    pub fn aflags_liveness(&mut self, ilist: &InstrList, at: InstrId) -> Result<AFlags> {
        let idx = self.current_live_idx(ilist, at)?;
        Ok(self.live.aflags_at(idx))
    }

    /// Re-capture after an application instruction rewrote the flags
    /// while a client holds them: the saved copy is stale.
    pub(crate) fn recapture_aflags_after(
        &mut self,
        ilist: &mut InstrList,
        at: InstrId,
    ) -> Result<()> {
        debug_assert!(self.aflags.in_use);
        let acc = self.gpr[ACC.gpr_index()];
        if acc.in_use && !self.aflags.carried_in_accumulator() {
            // A client holds the accumulator: capture straight through
            // to the flags slot, preserving the client's value.
            let flags_offset = self.slots.slot_offset(AFLAGS_SLOT);
            let tmp = self.slots.alloc_gpr_slot(ACC)?;
            let tmp_offset = self.slots.slot_offset(tmp);
            let mut seq = vec![emit::gpr_spill(ACC, tmp_offset)];
            seq.extend(emit::flags_capture_tail());
            seq.push(emit::gpr_spill(ACC, flags_offset));
            seq.push(emit::gpr_restore(ACC, tmp_offset));
            emit::emit_after(ilist, at, seq)?;
            self.slots.free_gpr_slot(tmp);
            self.aflags.native = false;
            self.aflags.xchg = None;
            self.aflags.in_memory = true;
            debug!("aflags: re-captured to memory after app write");
            return Ok(());
        }
        let mut seq = Vec::new();
        if acc.native {
            let slot = self.slots.alloc_gpr_slot(ACC)?;
            seq.push(emit::gpr_spill(ACC, self.slots.slot_offset(slot)));
            let st = &mut self.gpr[ACC.gpr_index()];
            st.native = false;
            st.ever_spilled = true;
            st.slot = Some(slot);
            st.in_use = true;
        } else if !acc.in_use {
            // Pending lazy restore: the slot already holds the app
            // value and the engine takes the register over.
            self.adjust_pending(ACC, -1);
            self.gpr[ACC.gpr_index()].in_use = true;
        }
        seq.extend(emit::flags_capture_tail());
        emit::emit_after(ilist, at, seq)?;
        self.aflags.native = false;
        self.aflags.xchg = Some(ACC);
        self.aflags.in_memory = false;
        debug!("aflags: re-captured after app write");
        Ok(())
    }

    /// The saved flags are stale and dead: forget them and hand the
    /// accumulator back, emitting its restore after `at`.
    pub(crate) fn drop_stale_aflags_after(
        &mut self,
        ilist: &mut InstrList,
        at: InstrId,
    ) -> Result<()> {
        debug_assert!(!self.aflags.native && !self.aflags.in_use);
        if self.aflags.carried_in_accumulator() {
            let st = self.gpr[ACC.gpr_index()];
            if let Some(slot) = st.slot {
                let offset = self.slots.slot_offset(slot);
                emit::emit_after(ilist, at, vec![emit::gpr_restore(ACC, offset)])?;
                self.slots.free_gpr_slot(slot);
            }
            self.gpr[ACC.gpr_index()] = crate::state::RegState::NATIVE;
        }
        self.aflags.set_native();
        debug!("aflags: stale capture dropped");
        Ok(())
    }
}
