//! Atomic instruction types of the Carve analysis core.
//!
//! A disassembler plugin decodes raw bytes into a [`DecodedOp`]: a tagged
//! operation kind plus a small set of orthogonal modifier flags, together
//! with the operands the analysis core cares about (branch targets, data
//! pointers, stack effects). The core never sees raw opcodes; this crate
//! is the entire vocabulary between the two.

#![warn(missing_docs)]
#![deny(unsafe_code)]
#![deny(unused_must_use)]

mod kind;
mod op;

pub use kind::{Arch, OpFamily, OpKind, OpMods, StackOp};
pub use op::DecodedOp;
