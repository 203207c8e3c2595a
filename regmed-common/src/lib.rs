//! Register Mediator - Common Types
//!
//! This crate contains the status codes, the options record and the
//! small shared types used across the register-mediator workspace.

pub mod options;
pub mod status;

pub use options::{BbProperties, Options, SpillClass};
pub use status::{ErrorCallback, Status};

/// Result type used by every public mediator operation.
pub type Result<T> = std::result::Result<T, Status>;
