//! Outcome and error codes of the recursive walker.
//!
//! Errors are recovered locally: the walker reports them to its caller,
//! which stops growing the current branch and keeps whatever was already
//! discovered. Nothing unwinds.

/// Successful termination of one walker descent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The branch terminated normally (return, terminal jump, existing
    /// block reached...).
    End,
    /// New blocks were recorded speculatively (jump-table case walk);
    /// discovery continues at the caller.
    New,
}

/// Failure of one walker descent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
pub enum RecurseError {
    /// The recursion depth budget ran out.
    #[display(fmt = "recursion depth exhausted")]
    TooDeep,
    /// The address is not readable in the image.
    #[display(fmt = "address 0x{_0:x} is not mapped")]
    InvalidMemory(u64),
    /// The address already belongs to a different function.
    #[display(fmt = "address 0x{_0:x} is owned by another function")]
    Duplicate(u64),
    /// The function grew past the 256 KiB cap and was truncated to zero.
    #[display(fmt = "function exceeded the size cap")]
    Overflow,
    /// The byte stream does not decode as instructions.
    #[display(fmt = "bytes at 0x{_0:x} decode as data")]
    DecodedAsData(u64),
}

impl std::error::Error for RecurseError {}

/// Result of one walker descent.
pub type RecurseResult = Result<Outcome, RecurseError>;
