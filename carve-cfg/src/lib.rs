//! Function discovery and CFG reconstruction core.
//!
//! Given an entry address inside an executable image, the [`Analyzer`]
//! walks decoded instructions block by block, discovers successors
//! (direct and conditional jumps, calls, jump tables, returns), and
//! registers the finished function in an interval-indexed [`Catalog`]
//! queryable by entry address and by containment.
//!
//! The disassembler, the loaded image, the flag database and the xref
//! store are host-provided collaborators behind the narrow traits in
//! [`host`]. The core is single-threaded and cooperative: a shared
//! cancellation flag is polled at every block entry, every instruction,
//! and before every jump-table case.

#![warn(missing_docs)]
#![deny(unsafe_code)]
#![deny(unused_must_use)]

pub mod annotations;
pub mod block;
pub mod cache;
pub mod catalog;
pub mod config;
pub mod error;
pub mod function;
pub mod host;
pub mod index;
mod jumptable;
mod purity;
pub mod ranges;
mod walk;

#[cfg(any(test, feature = "test-helpers"))]
pub mod mock;

pub use annotations::Annotations;
pub use block::{BasicBlock, BlockKind, CaseOp, SwitchOp};
pub use catalog::{Catalog, FcnId};
pub use config::AnalysisOpt;
pub use error::{Outcome, RecurseError, RecurseResult};
pub use function::{Function, FunctionKind};
pub use index::FunctionIndex;
pub use walk::Analyzer;

// Re-export the instruction atoms; hosts implement `host::Disassembler`
// in terms of these.
#[doc(no_inline)]
pub use carve_asm;
