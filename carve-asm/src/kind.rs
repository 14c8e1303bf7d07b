use bitflags::bitflags;

/// Base operation kind of a decoded instruction.
///
/// Orthogonal properties (conditional execution, indirection through a
/// register or memory cell) are carried separately in [`OpMods`]: a
/// conditional jump is `Jmp` + [`OpMods::COND`], a `jmp [reg]` is `Jmp` +
/// [`OpMods::REG`], and so on. This keeps the dispatch in the walker a
/// plain match over the base kind.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, strum::Display, strum::EnumIter)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[non_exhaustive]
pub enum OpKind {
    /// Register or memory move, including conditional moves.
    Mov,
    /// Effective-address computation.
    Lea,
    /// Addition.
    Add,
    /// Subtraction.
    Sub,
    /// Comparison; the immediate operand feeds jump-table sizing.
    Cmp,
    /// Invalid encoding.
    Ill,
    /// Trap / breakpoint / software interrupt.
    Trap,
    /// No-operation (including multi-byte nop forms).
    Nop,
    /// Jump. Modifiers select direct/conditional/indirect variants.
    Jmp,
    /// Call. Modifiers select direct/conditional/indirect variants.
    Call,
    /// Return from function.
    Ret,
    /// Push onto the machine stack.
    Push,
    /// Pop off the machine stack.
    Pop,
    /// Anything the plugin decoded but the core has no special handling
    /// for (arithmetic, loads, stores, ...).
    Other,
    /// The plugin could not classify the instruction at all.
    #[default]
    Unknown,
}

bitflags! {
    /// Orthogonal modifiers over [`OpKind`].
    #[derive(Clone, Copy, Default, Debug, PartialEq, Eq, Hash)]
    #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
    pub struct OpMods: u8 {
        /// Execution is predicated (`je`, `cmovz`, conditional return...).
        const COND = 0x01;
        /// Target is taken from a register.
        const REG = 0x02;
        /// Target is loaded through memory.
        const MEM = 0x04;
        /// Target is otherwise indirect (computed, unknown at decode time).
        const IND = 0x08;
    }
}

impl OpMods {
    /// Whether any indirection flag is present.
    pub fn is_indirect(self) -> bool {
        self.intersects(OpMods::REG | OpMods::MEM | OpMods::IND)
    }
}

/// Stack-pointer effect of an instruction.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, strum::Display)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum StackOp {
    /// No stack effect.
    #[default]
    None,
    /// Adjusts the stack pointer by `DecodedOp::stackptr` bytes.
    Inc,
    /// Rewrites the stack pointer from scratch (frame setup).
    Reset,
    /// Reads the stack pointer.
    Get,
    /// Sets the stack pointer to an unrelated value.
    Set,
}

/// Coarse execution-unit family of an instruction.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, strum::Display)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[non_exhaustive]
pub enum OpFamily {
    /// Plain integer pipeline.
    #[default]
    Cpu,
    /// Floating point.
    Fpu,
    /// Vector/SIMD.
    Simd,
    /// Privileged instruction (ring-0, interrupt return...).
    Priv,
    /// Cryptographic extension.
    Crypto,
    /// Unclassified.
    Unknown,
}

/// Architecture tag of the session being analyzed.
///
/// The walker only branches on a handful of architecture quirks (x86
/// mid-instruction jumps, ARM `mov lr, pc` call idioms, MIPS delay-slot
/// flags), so the tag stays deliberately coarse.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, strum::Display, strum::EnumString)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[strum(serialize_all = "lowercase")]
#[non_exhaustive]
pub enum Arch {
    /// x86 / x86-64.
    #[default]
    X86,
    /// ARM / AArch64.
    Arm,
    /// MIPS.
    Mips,
    /// RISC-V.
    Riscv,
    /// PowerPC.
    Ppc,
    /// Everything else.
    Other,
}

impl Arch {
    /// x86 quirks: instructions may overlap, jumps may land mid-instruction.
    pub fn is_x86(self) -> bool {
        self == Arch::X86
    }

    /// ARM quirks: `mov lr, pc` turns the next indirect jump into a call.
    pub fn is_arm(self) -> bool {
        self == Arch::Arm
    }

    /// MIPS quirks: entry nops carry symbol flags worth keeping.
    pub fn is_mips(self) -> bool {
        self == Arch::Mips
    }
}
