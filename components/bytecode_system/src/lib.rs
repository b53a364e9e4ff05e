//! Register bytecode for the Skald virtual machine.
//!
//! Instructions are fixed-width 32-bit words addressing per-frame
//! local slots by small integer index (a register machine, not a stack
//! machine).
//!
//! - [`OpCode`] - the complete instruction set
//! - [`Instruction`] - the packed word with ABC / ABx / AsBx views
//! - [`disasm`] - human-readable instruction and function dumps

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod disasm;
mod instruction;
mod opcode;

pub use instruction::{Instruction, RSBX_MAX, RA_MAX, RBX_MAX};
pub use opcode::OpCode;
