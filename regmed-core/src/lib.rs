//! Register Mediator - Core
//!
//! Arbitrates scratch-register use between instrumentation components
//! transforming basic blocks of application code: backward liveness
//! analysis per block, register and flags reservation with lazy
//! spilling and restoration, thread-local spill-slot management, and
//! fault-time reconstruction of application register state.
//!
//! ## Lifecycle
//!
//! Components call [`init`] (idempotent, options are merged) and a
//! matching [`exit`]. Each application thread owns a [`PerThread`]
//! record. Per block, the host runs [`PerThread::analyze_block`] and
//! then [`PerThread::insertion_pass`], inside which clients reserve
//! and release registers and flags.

use std::sync::Mutex;

use log::error;
use once_cell::sync::Lazy;

mod aflags;
mod emit;
mod fault;
mod insert;
mod liveness;
mod reserve;
mod slots;
mod state;

pub use regmed_common::{BbProperties, ErrorCallback, Options, Result, SpillClass, Status};
pub use reserve::{ReservationInfo, SpillRestoreInfo};
pub use slots::{SlotLoc, SlotStore};
pub use state::PerThread;

struct Global {
    init_count: u32,
    ops: Options,
}

static GLOBAL: Lazy<Mutex<Option<Global>>> = Lazy::new(|| Mutex::new(None));

/// Process-wide initialization. Safe to call once per component: the
/// first caller installs its options, later callers merge theirs in
/// (slot counts sum unless summing is disabled, the conservative flag
/// is OR'd, the error callback is first-writer-wins).
pub fn init(ops: Options) -> Result<()> {
    let mut guard = GLOBAL.lock().map_err(|_| Status::Error)?;
    match guard.as_mut() {
        Some(global) => {
            global.ops.merge(&ops);
            global.init_count += 1;
        }
        None => {
            *guard = Some(Global {
                init_count: 1,
                ops,
            });
        }
    }
    Ok(())
}

/// Matching teardown for one [`init`] call. The process-wide record
/// is dropped when the last component exits.
pub fn exit() -> Result<()> {
    let mut guard = GLOBAL.lock().map_err(|_| Status::Error)?;
    let global = guard.as_mut().ok_or(Status::Error)?;
    if global.init_count == 0 {
        return Err(Status::Error);
    }
    global.init_count -= 1;
    if global.init_count == 0 {
        *guard = None;
    }
    Ok(())
}

pub(crate) fn global_options() -> Option<Options> {
    GLOBAL
        .lock()
        .ok()
        .and_then(|guard| guard.as_ref().map(|g| g.ops.clone()))
}

/// Route an internal inconsistency through the user's error callback.
/// A callback returning true means carry on; anything else is fatal.
pub(crate) fn report_inconsistency(status: Status) -> Result<()> {
    if let Some(cb) = global_options().and_then(|o| o.error_callback) {
        if cb(status) {
            return Ok(());
        }
    }
    error!("unrecoverable register-mediator state: {status}");
    std::process::abort();
}

#[cfg(test)]
mod tests {
    use super::*;

    // The process-wide record is shared; this test owns the whole
    // lifecycle and is the only unit test touching it.
    #[test]
    fn test_init_merge_and_exit() {
        assert!(global_options().is_none());
        init(Options::default().with_gpr_slots(2)).unwrap();
        init(Options::default().with_gpr_slots(3).conservative()).unwrap();
        let ops = global_options().unwrap();
        assert_eq!(ops.num_gpr_slots, 5);
        assert!(ops.conservative);

        let pt = PerThread::new().unwrap();
        assert!(pt.slots().num_slots() > 5);

        exit().unwrap();
        assert!(global_options().is_some(), "still one component alive");
        exit().unwrap();
        assert!(global_options().is_none(), "teardown on last exit");
        assert!(exit().is_err(), "unbalanced exit is rejected");
        assert!(PerThread::new().is_err(), "threads need an initialized core");
    }
}
