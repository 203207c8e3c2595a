//! Register Mediator - Instruction and Register Model
//!
//! This crate provides the host-framework surface the mediator core
//! consumes: the register model, instruction and operand types,
//! register/flags introspection, the instruction-list container and
//! the fault-time machine context.

pub mod aflags;
pub mod ilist;
pub mod instr;
pub mod mcontext;
pub mod opnd;
pub mod reg;

pub use aflags::AFlags;
pub use ilist::{InstrId, InstrList};
pub use instr::{AflagsEffect, Cc, Instr, Opcode};
pub use mcontext::MachineContext;
pub use opnd::{MemRef, Opnd, RegOpnd, Width};
pub use reg::{Reg, RegSet, NUM_GPRS, NUM_SIMD};
