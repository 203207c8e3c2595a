//! Mediator configuration
//!
//! The options record passed to `init`. Initialization is idempotent:
//! each caller's options are merged into the process-wide record (see
//! `merge`), and real teardown only happens when the last `exit` runs.

use serde::{Deserialize, Serialize};

use crate::status::ErrorCallback;

/// Spill class requested from the reserver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SpillClass {
    /// General-purpose register.
    Gpr,
    /// 128-bit vector register.
    SimdXmm,
    /// 256-bit vector register (not available).
    SimdYmm,
    /// 512-bit vector register (not available).
    SimdZmm,
}

impl SpillClass {
    /// Whether this class is backed by the SIMD slot block.
    pub fn is_simd(self) -> bool {
        !matches!(self, SpillClass::Gpr)
    }
}

/// Per-block hints supplied by clients before analysis.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BbProperties {
    /// Treat the block as straight-line code even if it contains
    /// internal control transfers.
    pub ignore_control_flow: bool,
    /// The block contains control flow that spans reservations, so
    /// non-reserved values must not stay spilled across instructions.
    pub contains_spanning_control_flow: bool,
}

/// Options accepted by `init`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Options {
    /// Number of direct thread-local GPR spill slots to provide.
    /// Requests beyond these fall through to the host framework's own
    /// (volatile) slots.
    pub num_gpr_slots: u32,
    /// Number of 64-byte SIMD spill slots in the indirect block.
    pub num_simd_slots: u32,
    /// Spill on reservation regardless of liveness, and never rely on
    /// a register staying dead.
    pub conservative: bool,
    /// When several components init with their own slot counts, take
    /// the maximum instead of the sum.
    pub do_not_sum_slots: bool,
    /// Invoked on internal inconsistencies; first writer wins.
    #[serde(skip)]
    pub error_callback: Option<ErrorCallback>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            num_gpr_slots: 4,
            num_simd_slots: 2,
            conservative: false,
            do_not_sum_slots: false,
            error_callback: None,
        }
    }
}

impl Options {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_gpr_slots(mut self, n: u32) -> Self {
        self.num_gpr_slots = n;
        self
    }

    pub fn with_simd_slots(mut self, n: u32) -> Self {
        self.num_simd_slots = n;
        self
    }

    pub fn conservative(mut self) -> Self {
        self.conservative = true;
        self
    }

    pub fn no_slot_summing(mut self) -> Self {
        self.do_not_sum_slots = true;
        self
    }

    pub fn with_error_callback(mut self, cb: ErrorCallback) -> Self {
        self.error_callback = Some(cb);
        self
    }

    /// Merge another component's options into this record.
    ///
    /// Slot counts sum unless either side set `do_not_sum_slots`, in
    /// which case the maximum wins. The error callback is
    /// first-writer-wins and the conservative flag is OR'd.
    pub fn merge(&mut self, other: &Options) {
        let no_sum = self.do_not_sum_slots || other.do_not_sum_slots;
        if no_sum {
            self.num_gpr_slots = self.num_gpr_slots.max(other.num_gpr_slots);
            self.num_simd_slots = self.num_simd_slots.max(other.num_simd_slots);
        } else {
            self.num_gpr_slots += other.num_gpr_slots;
            self.num_simd_slots += other.num_simd_slots;
        }
        self.do_not_sum_slots = no_sum;
        self.conservative |= other.conservative;
        if self.error_callback.is_none() {
            self.error_callback = other.error_callback;
        }
    }
}
