//! Status codes for the register mediator
//!
//! Every public operation returns one of these codes on failure; out
//! parameters are written only on success.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failure codes returned by mediator operations.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Status {
    #[error("operation failed")]
    Error,

    #[error("invalid parameter")]
    InvalidParameter,

    #[error("no register satisfies the request")]
    RegConflict,

    #[error("no spill slot available")]
    OutOfSlots,

    #[error("no application value is recoverable for this register")]
    NoAppValue,

    #[error("register is already reserved")]
    InUse,

    #[error("feature not available on this configuration")]
    FeatureNotAvailable,

    #[error("spill class does not match the register")]
    InvalidSpillClass,
}

/// Callback invoked on internal inconsistencies. Returning `true`
/// tells the mediator to continue; `false` aborts the process.
pub type ErrorCallback = fn(Status) -> bool;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_display() {
        assert_eq!(Status::OutOfSlots.to_string(), "no spill slot available");
        assert_eq!(Status::InvalidParameter.to_string(), "invalid parameter");
    }

    #[test]
    fn test_status_is_copy_and_comparable() {
        let s = Status::RegConflict;
        let t = s;
        assert_eq!(s, t);
        assert_ne!(s, Status::InUse);
    }
}
