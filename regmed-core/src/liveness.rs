//! Per-block liveness analysis
//!
//! A single backward pass over the block computes, for every
//! instruction position, whether each GPR is live, where each vector
//! register sits on its width lattice, and which arithmetic flags are
//! still read downstream. Information flows from the block exit
//! backward, so one pass reaches the fixpoint.
//!
//! Vectors are indexed by *reverse* position: index 0 is the last
//! instruction of the block. A separate forward scan serves
//! reservations made outside the insertion pass; it produces a single
//! value (index 0) that is live for anything it cannot prove dead
//! before the first control transfer.

use log::trace;
use regmed_common::{BbProperties, Result, Status};
use regmed_isa::{AFlags, Instr, InstrList, Reg, Width, NUM_GPRS, NUM_SIMD};

/// GPR liveness at one position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GprLive {
    Live,
    Dead,
    /// Only produced outside the block-scanning path.
    Unknown,
}

/// Vector-register liveness lattice. The ordering makes "larger
/// register wins" a monotone max, so `join` is `Ord::max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SimdLive {
    XmmDead,
    YmmDead,
    ZmmDead,
    XmmLive,
    YmmLive,
    ZmmLive,
    Unknown,
}

impl SimdLive {
    pub fn is_live(self) -> bool {
        matches!(self, SimdLive::XmmLive | SimdLive::YmmLive | SimdLive::ZmmLive)
    }

    /// Lattice join: the wider requirement wins.
    pub fn join(self, other: SimdLive) -> SimdLive {
        debug_assert!(self != SimdLive::Unknown && other != SimdLive::Unknown);
        self.max(other)
    }

    fn live_at(width: Width) -> SimdLive {
        match width {
            Width::Y32 => SimdLive::YmmLive,
            Width::Z64 => SimdLive::ZmmLive,
            _ => SimdLive::XmmLive,
        }
    }
}

/// Liveness vectors for one block, refilled per block.
#[derive(Debug)]
pub struct LiveVectors {
    gpr: Vec<Vec<GprLive>>,
    simd: Vec<Vec<SimdLive>>,
    aflags: Vec<AFlags>,
    len: usize,
}

impl LiveVectors {
    pub fn new() -> Self {
        Self {
            gpr: vec![Vec::new(); NUM_GPRS],
            simd: vec![Vec::new(); NUM_SIMD],
            aflags: Vec::new(),
            len: 0,
        }
    }

    /// GPR liveness at reverse position `idx`.
    pub fn gpr_at(&self, reg: Reg, idx: usize) -> GprLive {
        self.gpr[reg.gpr_index()].get(idx).copied().unwrap_or(GprLive::Unknown)
    }

    /// Vector liveness at reverse position `idx`.
    pub fn simd_at(&self, reg: Reg, idx: usize) -> SimdLive {
        self.simd[reg.simd_index()]
            .get(idx)
            .copied()
            .unwrap_or(SimdLive::Unknown)
    }

    /// Flags still read downstream at reverse position `idx`.
    pub fn aflags_at(&self, idx: usize) -> AFlags {
        self.aflags.get(idx).copied().unwrap_or(AFlags::ALL)
    }

    fn clear(&mut self) {
        for v in &mut self.gpr {
            v.clear();
        }
        for v in &mut self.simd {
            v.clear();
        }
        self.aflags.clear();
        self.len = 0;
    }

    /// Backward scan over the application instructions of `block`.
    pub fn analyze(&mut self, block: &InstrList) {
        self.clear();
        let app: Vec<&Instr> = block.instrs().filter(|i| i.is_app()).collect();
        self.len = app.len();

        // Everything is assumed live-out at the block exit.
        let mut gpr_prior = [GprLive::Live; NUM_GPRS];
        let mut simd_prior = [SimdLive::ZmmLive; NUM_SIMD];
        let mut aflags_prior = AFlags::ALL;

        for &instr in app.iter().rev() {
            for (gi, state) in gpr_prior.iter_mut().enumerate() {
                let reg = Reg::from_gpr_index(gi);
                *state = gpr_step(instr, reg, *state);
                self.gpr[gi].push(*state);
            }
            for (si, state) in simd_prior.iter_mut().enumerate() {
                let reg = Reg::from_simd_index(si);
                *state = simd_step(instr, reg, *state);
                self.simd[si].push(*state);
            }
            aflags_prior = aflags_step(instr, aflags_prior);
            self.aflags.push(aflags_prior);
        }
        trace!(
            "analyzed block of {} instrs, exit flags {}",
            self.len,
            self.aflags_at(0)
        );
    }

    /// Forward scan from `start` (a list index) to the first control
    /// transfer, for reservations outside the insertion pass. Fills a
    /// single position (index 0); anything indeterminate is live.
    pub fn analyze_forward(&mut self, block: &InstrList, start: usize) -> Result<()> {
        if start >= block.len() {
            return Err(Status::InvalidParameter);
        }
        self.clear();
        self.len = 1;

        let mut gpr_seen = [None::<GprLive>; NUM_GPRS];
        let mut simd_seen = [None::<SimdLive>; NUM_SIMD];
        let mut aflags_read = AFlags::NONE;
        let mut aflags_written = AFlags::NONE;

        for idx in start..block.len() {
            let instr = block.at(idx);
            if !instr.is_app() {
                continue;
            }
            for (gi, seen) in gpr_seen.iter_mut().enumerate() {
                if seen.is_some() {
                    continue;
                }
                let reg = Reg::from_gpr_index(gi);
                if instr.reads_from_reg(reg) {
                    *seen = Some(GprLive::Live);
                } else if instr.writes_to_exact_reg(reg) {
                    *seen = Some(GprLive::Dead);
                }
            }
            for (si, seen) in simd_seen.iter_mut().enumerate() {
                if seen.is_some() {
                    continue;
                }
                let reg = Reg::from_simd_index(si);
                if let Some(w) = instr.simd_read_width(reg) {
                    *seen = Some(SimdLive::live_at(w));
                } else if let Some(w) = instr.simd_write_width(reg) {
                    *seen = Some(match w {
                        Width::Z64 => SimdLive::ZmmDead,
                        Width::Y32 => SimdLive::YmmDead,
                        _ => SimdLive::XmmDead,
                    });
                }
            }
            // A flag is read iff it is read before any write.
            let effect = instr.aflags_effect();
            aflags_read |= effect.read - aflags_written;
            aflags_written |= effect.written;

            if instr.is_cti() || instr.is_syscall_or_interrupt() {
                break;
            }
        }

        for (gi, seen) in gpr_seen.iter().enumerate() {
            self.gpr[gi].push(seen.unwrap_or(GprLive::Live));
        }
        for (si, seen) in simd_seen.iter().enumerate() {
            self.simd[si].push(seen.unwrap_or(SimdLive::ZmmLive));
        }
        // Flags never written before the scan ended stay live.
        self.aflags.push(aflags_read | (AFlags::ALL - aflags_written));
        Ok(())
    }
}

/// One backward step for a GPR.
fn gpr_step(instr: &Instr, reg: Reg, prior: GprLive) -> GprLive {
    if instr.reads_from_reg(reg) {
        GprLive::Live
    } else if instr.writes_to_exact_reg(reg) {
        GprLive::Dead
    } else if instr.is_cti() || instr.is_syscall_or_interrupt() {
        // Assume anything outside the block reads it.
        GprLive::Live
    } else {
        prior
    }
}

/// One backward step for a vector register. Partial reads promote to
/// the enclosing class; writes only deaden at the exact width written.
fn simd_step(instr: &Instr, reg: Reg, prior: SimdLive) -> SimdLive {
    if let Some(w) = instr.simd_read_width(reg) {
        return prior.join(SimdLive::live_at(w));
    }
    if let Some(w) = instr.simd_write_width(reg) {
        return match w {
            Width::Z64 => SimdLive::ZmmDead,
            Width::Y32 => {
                if prior <= SimdLive::YmmDead || prior >= SimdLive::XmmLive {
                    SimdLive::YmmDead
                } else {
                    prior
                }
            }
            _ => {
                if prior >= SimdLive::XmmLive {
                    SimdLive::XmmDead
                } else {
                    prior
                }
            }
        };
    }
    if instr.is_cti() || instr.is_syscall_or_interrupt() {
        return SimdLive::ZmmLive;
    }
    prior
}

/// One backward step for the arithmetic flags:
/// `(prior ∪ read) ∖ (written ∖ read)`.
fn aflags_step(instr: &Instr, prior: AFlags) -> AFlags {
    if instr.is_cti() || instr.is_syscall_or_interrupt() {
        return AFlags::ALL;
    }
    let effect = instr.aflags_effect();
    (prior | effect.read) - (effect.written - effect.read)
}

/// App-use counts per register, accumulated during analysis and used
/// by the least-used selection rule.
#[derive(Debug, Default)]
pub struct AppUses {
    pub gpr: [u32; NUM_GPRS],
    pub simd: [u32; NUM_SIMD],
}

impl AppUses {
    pub fn count(&mut self, block: &InstrList) {
        self.gpr = [0; NUM_GPRS];
        self.simd = [0; NUM_SIMD];
        for instr in block.instrs().filter(|i| i.is_app()) {
            for reg in Reg::gprs() {
                if instr.reads_from_reg(reg) || instr.writes_to_reg(reg) {
                    self.gpr[reg.gpr_index()] += 1;
                }
            }
            for reg in Reg::simds() {
                if instr.simd_read_width(reg).is_some() || instr.writes_to_reg(reg) {
                    self.simd[reg.simd_index()] += 1;
                }
            }
        }
    }
}

/// Whether `props` and the block shape force values back into their
/// registers between instructions.
pub fn block_has_internal_cti(block: &InstrList, props: BbProperties) -> bool {
    if props.contains_spanning_control_flow {
        return true;
    }
    if props.ignore_control_flow {
        return false;
    }
    let app: Vec<&Instr> = block.instrs().filter(|i| i.is_app()).collect();
    app.iter()
        .rev()
        .skip(1)
        .any(|i| i.is_cti() || i.is_syscall_or_interrupt())
}
