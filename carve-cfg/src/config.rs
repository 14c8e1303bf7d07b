//! Analysis parameters.

use core::{ops::Range, time::Duration};

use carve_asm::Arch;

/// Ceiling on the stored extent of a single function: 256 KiB.
pub const MAX_FCN_SIZE: u64 = 1024 * 256;

/// Alignment gap the end-size pass will bridge between adjacent blocks.
pub const BLOCK_ALIGN: u64 = 0x10;

/// Ceiling on jump-table entries when no compare immediate bounds them.
pub const JMPTBL_MAX_ENTRIES: u64 = 512;

/// Tuning knobs of the discovery walker.
///
/// The host fills one of these per session and hands it to
/// [`crate::Analyzer`]; there is no configuration file layer. Every
/// boolean maps to one decision point in the walker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnalysisOpt {
    /// Architecture of the session; selects a handful of per-arch quirks.
    pub arch: Arch,
    /// Pointer width in bits; jump-table entries default to this width.
    pub bits: u32,
    /// Follow both the target and the fall-through of a conditional jump.
    pub afterjmp: bool,
    /// Analyze regions not marked executable.
    pub noncode: bool,
    /// Allow a jump to land in the middle of an existing instruction
    /// (x86 only, where overlapping encodings are legal).
    pub jmpmid: bool,
    /// Allow discovered blocks to precede the function entry.
    pub jmpabove: bool,
    /// Keep walking after running into an already-discovered block.
    pub recont: bool,
    /// Treat any jump leaving the current memory map as end-of-block.
    pub eobjmp: bool,
    /// Recognize compiled switch idioms.
    pub jmptbl: bool,
    /// Record a code xref for direct jumps.
    pub jmpref: bool,
    /// Record a code xref for conditional jumps.
    pub cjmpref: bool,
    /// Skip harmless `mov reg, reg` pads at the function entry.
    pub hpskip: bool,
    /// Skip nop and zero pads at the function entry.
    pub nopskip: bool,
    /// Rewrite a push-then-ret trampoline into a direct jump.
    pub pushret: bool,
    /// Attempt analysis of indirect jumps.
    pub ijmp: bool,
    /// Trim the function extent to its contiguous block run at the end
    /// of discovery.
    pub endsize: bool,
    /// Recursion depth budget.
    pub depth: u32,
    /// Ceiling on the byte length of a single basic block.
    pub bb_max_size: u64,
    /// Optional throttle slept at every cancellation poll point.
    pub sleep: Option<Duration>,
    /// Optional clamp: discovery never leaves this address range.
    pub limit: Option<Range<u64>>,
}

impl Default for AnalysisOpt {
    fn default() -> Self {
        Self {
            arch: Arch::X86,
            bits: 64,
            afterjmp: true,
            noncode: false,
            jmpmid: false,
            jmpabove: false,
            recont: false,
            eobjmp: false,
            jmptbl: true,
            jmpref: true,
            cjmpref: false,
            hpskip: false,
            nopskip: true,
            pushret: false,
            ijmp: false,
            endsize: true,
            depth: 64,
            bb_max_size: 16 * 1024,
            sleep: None,
            limit: None,
        }
    }
}

impl AnalysisOpt {
    /// Entry width of a native-pointer jump table, in bytes.
    pub fn ptr_width(&self) -> u64 {
        u64::from(self.bits) / 8
    }

    /// Whether `addr` falls outside the configured analysis clamp.
    pub fn out_of_limit(&self, addr: u64) -> bool {
        match &self.limit {
            Some(range) => !range.contains(&addr),
            None => false,
        }
    }
}
