use crate::{OpFamily, OpKind, OpMods, StackOp};

/// One decoded instruction, as reported by a disassembler plugin.
///
/// Fields the plugin could not determine are `None`; the analysis core
/// treats absence as "no successor / no operand", never as address zero.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DecodedOp {
    /// Address the instruction was decoded at.
    pub addr: u64,
    /// Encoded length in bytes.
    pub size: u16,
    /// Base operation kind.
    pub kind: OpKind,
    /// Orthogonal modifiers (conditional, register/memory indirection).
    pub mods: OpMods,
    /// Primary branch target (jump/call destination, when direct).
    pub jump: Option<u64>,
    /// Fall-through target of a conditional branch.
    pub fail: Option<u64>,
    /// Data pointer operand (memory reference, compare operand cell,
    /// jump-table base...).
    pub ptr: Option<u64>,
    /// Immediate value operand.
    pub val: Option<u64>,
    /// Byte width of the datum behind `ptr`, when the plugin knows it.
    pub refptr: Option<u64>,
    /// Number of branch-delay slots following this instruction.
    pub delay: u8,
    /// Stack-pointer effect class.
    pub stackop: StackOp,
    /// Stack-pointer delta for [`StackOp::Inc`].
    pub stackptr: i64,
    /// Execution-unit family.
    pub family: OpFamily,
    /// Name of the register a register-indirect target is read from.
    pub reg: Option<String>,
    /// Index register of a scaled memory operand (`[base + ireg * scale]`).
    pub ireg: Option<String>,
    /// Scale factor of a scaled memory operand; zero when unscaled.
    pub scale: u8,
    /// Source register name of a two-operand move, when plain.
    pub src: Option<String>,
    /// Destination register name of a two-operand move, when plain.
    pub dst: Option<String>,
    /// ESIL rendition of the instruction semantics, when the plugin
    /// produces one. The core only pattern-matches a few ARM idioms.
    pub esil: Option<String>,
    /// The plugin judged this instruction to end its block regardless of
    /// kind (e.g. an exception-raising form).
    pub eob: bool,
    /// Decode-width hint: instructions after `jump` decode with this many
    /// bits (Thumb/ARM interworking).
    pub new_bits: Option<u8>,
}

impl DecodedOp {
    /// A decoded op of the given kind.
    pub fn new(kind: OpKind, addr: u64, size: u16) -> Self {
        Self {
            addr,
            size,
            kind,
            ..Self::default()
        }
    }

    /// Repositions the op at another address.
    #[must_use]
    pub fn at(mut self, addr: u64) -> Self {
        self.addr = addr;
        self
    }

    /// Adds modifier flags.
    #[must_use]
    pub fn with_mods(mut self, mods: OpMods) -> Self {
        self.mods |= mods;
        self
    }

    /// Sets the branch target.
    #[must_use]
    pub fn with_jump(mut self, jump: u64) -> Self {
        self.jump = Some(jump);
        self
    }

    /// Sets the conditional fall-through target.
    #[must_use]
    pub fn with_fail(mut self, fail: u64) -> Self {
        self.fail = Some(fail);
        self
    }

    /// Sets the data-pointer operand.
    #[must_use]
    pub fn with_ptr(mut self, ptr: u64) -> Self {
        self.ptr = Some(ptr);
        self
    }

    /// Sets the immediate operand.
    #[must_use]
    pub fn with_val(mut self, val: u64) -> Self {
        self.val = Some(val);
        self
    }

    /// Sets the referenced-datum width.
    #[must_use]
    pub fn with_refptr(mut self, width: u64) -> Self {
        self.refptr = Some(width);
        self
    }

    /// Sets the branch-delay slot count.
    #[must_use]
    pub fn with_delay(mut self, slots: u8) -> Self {
        self.delay = slots;
        self
    }

    /// Sets the stack effect.
    #[must_use]
    pub fn with_stack(mut self, stackop: StackOp, delta: i64) -> Self {
        self.stackop = stackop;
        self.stackptr = delta;
        self
    }

    /// Sets the execution-unit family.
    #[must_use]
    pub fn with_family(mut self, family: OpFamily) -> Self {
        self.family = family;
        self
    }

    /// Sets the register an indirect target is read from.
    #[must_use]
    pub fn with_reg(mut self, reg: &str) -> Self {
        self.reg = Some(reg.into());
        self
    }

    /// Sets the scaled index register.
    #[must_use]
    pub fn with_ireg(mut self, ireg: &str, scale: u8) -> Self {
        self.ireg = Some(ireg.into());
        self.scale = scale;
        self
    }

    /// Sets plain source/destination register names.
    #[must_use]
    pub fn with_src_dst(mut self, src: &str, dst: &str) -> Self {
        self.src = Some(src.into());
        self.dst = Some(dst.into());
        self
    }

    /// Sets the ESIL string.
    #[must_use]
    pub fn with_esil(mut self, esil: &str) -> Self {
        self.esil = Some(esil.into());
        self
    }

    /// Marks the op as end-of-block regardless of kind.
    #[must_use]
    pub fn with_eob(mut self) -> Self {
        self.eob = true;
        self
    }

    /// Sets the decode-width hint for the branch target.
    #[must_use]
    pub fn with_bits_hint(mut self, bits: u8) -> Self {
        self.new_bits = Some(bits);
        self
    }

    /// Whether execution of the op is predicated.
    pub fn is_cond(&self) -> bool {
        self.mods.contains(OpMods::COND)
    }

    /// Whether the target is indirect in any way.
    pub fn is_indirect(&self) -> bool {
        self.mods.is_indirect()
    }

    /// Address of the first byte after this instruction.
    pub fn end(&self) -> u64 {
        self.addr.saturating_add(u64::from(self.size))
    }

    /// Whether a move writes a register to itself (`mov eax, eax` style
    /// hairpin, a common alignment pad).
    pub fn is_hairpin(&self) -> bool {
        match (&self.src, &self.dst) {
            (Some(s), Some(d)) => s == d,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case(OpMods::empty(), false; "plain op")]
    #[test_case(OpMods::COND, true; "conditional")]
    #[test_case(OpMods::COND | OpMods::REG, true; "conditional register")]
    fn cond_flag(mods: OpMods, expect: bool) {
        let op = DecodedOp::new(OpKind::Jmp, 0, 2).with_mods(mods);
        assert_eq!(op.is_cond(), expect);
    }

    #[test]
    fn hairpin_requires_matching_regs() {
        let pad = DecodedOp::new(OpKind::Mov, 0x10, 2).with_src_dst("edi", "edi");
        assert!(pad.is_hairpin());
        let mv = DecodedOp::new(OpKind::Mov, 0x10, 2).with_src_dst("eax", "edi");
        assert!(!mv.is_hairpin());
        let imm = DecodedOp::new(OpKind::Mov, 0x10, 2);
        assert!(!imm.is_hairpin());
    }

    #[test]
    fn end_saturates() {
        let op = DecodedOp::new(OpKind::Ret, u64::MAX - 1, 4);
        assert_eq!(op.end(), u64::MAX);
    }
}
