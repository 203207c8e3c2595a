//! Per-register and per-thread state
//!
//! Each application thread owns one `PerThread` record; nothing here
//! is shared between threads. Register state is created fully native
//! at thread start, mutated during block insertion, and must be fully
//! native again at the last instruction of every block.

use log::debug;
use regmed_common::{BbProperties, Options, Result, Status};
use regmed_isa::{Reg, NUM_GPRS, NUM_SIMD};

use crate::aflags::AflagsTracker;
use crate::insert::Sandwich;
use crate::liveness::{AppUses, GprLive, LiveVectors};
use crate::slots::SlotStore;

/// Model address published into the hidden slot for the SIMD block.
const SIMD_BLOCK_BASE: u64 = 0x5000_0000;

/// Bookkeeping for one register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct RegState {
    /// Currently reserved by some client.
    pub in_use: bool,
    /// The application value is in the architectural register.
    pub native: bool,
    /// The value has been written to a slot since reservation. A
    /// register reserved only while dead never actually writes one.
    pub ever_spilled: bool,
    /// Owned slot when not native and no exchange partner is chosen.
    pub slot: Option<usize>,
    /// Partner register holding the value instead of memory. Only
    /// the flags engine chooses this.
    pub xchg: Option<Reg>,
}

impl RegState {
    pub(crate) const NATIVE: RegState = RegState {
        in_use: false,
        native: true,
        ever_spilled: false,
        slot: None,
        xchg: None,
    };
}

/// Per-thread mediator state.
pub struct PerThread {
    pub(crate) gpr: [RegState; NUM_GPRS],
    pub(crate) simd: [RegState; NUM_SIMD],
    pub(crate) aflags: AflagsTracker,
    pub(crate) slots: SlotStore,
    pub(crate) live: LiveVectors,
    pub(crate) uses: AppUses,
    /// Registers with `!native && !in_use` awaiting lazy restore.
    pub(crate) gpr_pending: usize,
    pub(crate) simd_pending: usize,
    pub(crate) in_insertion: bool,
    pub(crate) cur_ord: usize,
    pub(crate) num_app: usize,
    pub(crate) props: BbProperties,
    pub(crate) internal_cti: bool,
    pub(crate) stolen: Option<Reg>,
    pub(crate) conservative: bool,
    pub(crate) sandwiches: Vec<Sandwich>,
}

impl PerThread {
    /// Thread-start state: everything native, storage sized from the
    /// process-wide options.
    pub fn new() -> Result<Self> {
        let ops = crate::global_options().ok_or(Status::Error)?;
        Ok(Self::with_options(&ops))
    }

    /// Thread-start state with explicit options, for embedding the
    /// mediator without the process-wide record.
    pub fn with_options(ops: &Options) -> Self {
        let mut slots = SlotStore::new(ops.num_gpr_slots, ops.num_simd_slots);
        slots.publish_simd_block(SIMD_BLOCK_BASE);
        debug!(
            "thread state: {} gpr slots, {} simd slots, conservative={}",
            ops.num_gpr_slots, ops.num_simd_slots, ops.conservative
        );
        Self {
            gpr: [RegState::NATIVE; NUM_GPRS],
            simd: [RegState::NATIVE; NUM_SIMD],
            aflags: AflagsTracker::new(),
            slots,
            live: LiveVectors::new(),
            uses: AppUses::default(),
            gpr_pending: 0,
            simd_pending: 0,
            in_insertion: false,
            cur_ord: 0,
            num_app: 0,
            props: BbProperties::default(),
            internal_cti: false,
            stolen: None,
            conservative: ops.conservative,
            sandwiches: Vec::new(),
        }
    }

    /// The host framework designates a register it keeps for itself.
    pub fn set_stolen_reg(&mut self, reg: Option<Reg>) {
        self.stolen = reg;
    }

    pub fn stolen_reg(&self) -> Option<Reg> {
        self.stolen
    }

    /// High-water mark of simultaneously owned GPR slots.
    pub fn max_slots_used(&self) -> usize {
        self.slots.max_slots_used()
    }

    /// Backing storage, exposed for the host framework and fault
    /// handling plumbing.
    pub fn slots(&self) -> &SlotStore {
        &self.slots
    }

    pub fn slots_mut(&mut self) -> &mut SlotStore {
        &mut self.slots
    }

    pub(crate) fn reg_state(&self, reg: Reg) -> &RegState {
        if reg.is_gpr() {
            &self.gpr[reg.gpr_index()]
        } else {
            &self.simd[reg.simd_index()]
        }
    }

    pub(crate) fn reg_state_mut(&mut self, reg: Reg) -> &mut RegState {
        if reg.is_gpr() {
            &mut self.gpr[reg.gpr_index()]
        } else {
            &mut self.simd[reg.simd_index()]
        }
    }

    /// Reverse liveness index for a forward app-instruction ordinal.
    pub(crate) fn live_idx(&self, ord: usize) -> usize {
        debug_assert!(ord < self.num_app);
        self.num_app - 1 - ord
    }

    /// Reverse index for the position just after `ord`, if any.
    pub(crate) fn live_idx_after(&self, ord: usize) -> Option<usize> {
        (ord + 1 < self.num_app).then(|| self.live_idx(ord + 1))
    }

    /// Liveness test at the current reservation point. Conservative
    /// mode never trusts deadness.
    pub(crate) fn gpr_dead_at(&self, reg: Reg, idx: usize) -> bool {
        !self.conservative && self.live.gpr_at(reg, idx) == GprLive::Dead
    }

    pub(crate) fn simd_dead_at(&self, reg: Reg, idx: usize) -> bool {
        !self.conservative && !self.live.simd_at(reg, idx).is_live()
    }

    pub(crate) fn adjust_pending(&mut self, reg: Reg, delta: isize) {
        let count = if reg.is_gpr() {
            &mut self.gpr_pending
        } else {
            &mut self.simd_pending
        };
        *count = count.checked_add_signed(delta).expect("pending underflow");
    }

    /// Conservation check: every register native, nothing reserved,
    /// every slot free. Holds at thread start and at the end of every
    /// instrumented block.
    pub fn check_block_end(&self) -> bool {
        let regs_ok = self
            .gpr
            .iter()
            .chain(self.simd.iter())
            .all(|s| s.native && !s.in_use && s.slot.is_none());
        regs_ok
            && self.aflags.is_native()
            && !self.aflags.is_reserved()
            && self.gpr_pending == 0
            && self.simd_pending == 0
            && self.slots.all_slots_free()
    }

    /// Structural invariants that must hold between instructions.
    #[cfg(debug_assertions)]
    pub(crate) fn debug_check_invariants(&self) {
        for reg in Reg::gprs().chain(Reg::simds()) {
            let st = self.reg_state(reg);
            if st.native {
                debug_assert!(st.xchg.is_none(), "{reg}: native with xchg partner");
                debug_assert!(st.slot.is_none(), "{reg}: native with owned slot");
            }
            if st.in_use && !st.native {
                debug_assert!(
                    st.xchg.is_some() != st.slot.is_some(),
                    "{reg}: reserved non-native needs slot xor xchg"
                );
            }
            if let Some(slot) = st.slot {
                let owner = if reg.is_gpr() {
                    self.slots.slot_owner(slot)
                } else {
                    self.slots.simd_slot_owner(slot)
                };
                debug_assert_eq!(owner, Some(reg), "slot {slot} ownership mismatch");
            }
        }
        let pending = Reg::gprs()
            .filter(|r| {
                let st = self.reg_state(*r);
                !st.native && !st.in_use
            })
            .count();
        debug_assert_eq!(pending, self.gpr_pending, "gpr pending accounting");
        let simd_pending = Reg::simds()
            .filter(|r| {
                let st = self.reg_state(*r);
                !st.native && !st.in_use
            })
            .count();
        debug_assert_eq!(simd_pending, self.simd_pending, "simd pending accounting");
    }

    #[cfg(not(debug_assertions))]
    pub(crate) fn debug_check_invariants(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    fn thread() -> PerThread {
        PerThread::with_options(&Options::default())
    }

    #[test]
    fn test_thread_starts_native() {
        let pt = thread();
        assert!(pt.check_block_end());
        for reg in Reg::gprs() {
            assert!(pt.reg_state(reg).native);
        }
    }

    #[test]
    fn test_live_index_mapping() {
        let mut pt = thread();
        pt.num_app = 4;
        assert_eq!(pt.live_idx(0), 3);
        assert_eq!(pt.live_idx(3), 0);
        assert_eq!(pt.live_idx_after(2), Some(0));
        assert_eq!(pt.live_idx_after(3), None);
    }

    #[test]
    fn test_pending_adjustment() {
        let mut pt = thread();
        pt.adjust_pending(Reg::Rbx, 1);
        pt.adjust_pending(Reg::Xmm2, 1);
        assert_eq!(pt.gpr_pending, 1);
        assert_eq!(pt.simd_pending, 1);
        pt.adjust_pending(Reg::Rbx, -1);
        assert_eq!(pt.gpr_pending, 0);
    }
}
