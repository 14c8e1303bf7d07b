//! Basic blocks.

use bitflags::bitflags;

bitflags! {
    /// Position of a block within a split chain.
    #[derive(Clone, Copy, Default, Debug, PartialEq, Eq, Hash)]
    #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
    pub struct BlockKind: u8 {
        /// First fragment of a block that was split.
        const HEAD = 0x01;
        /// Interior fragment.
        const BODY = 0x02;
        /// Final fragment.
        const TAIL = 0x04;
    }
}

/// One resolved case of a recognized switch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CaseOp {
    /// Case target address.
    pub addr: u64,
    /// Location of the table entry that produced the target.
    pub entry: u64,
    /// Case index.
    pub value: u64,
}

/// A recognized switch dispatch attached to its block.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SwitchOp {
    /// Address of the indirect jump.
    pub addr: u64,
    /// Smallest case value.
    pub min_val: u64,
    /// Largest case value.
    pub max_val: u64,
    /// Default target, when a guard was found.
    pub def_val: Option<u64>,
    /// Resolved cases, in table order.
    pub cases: Vec<CaseOp>,
}

/// A linear run of instructions with at most two successors.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct BasicBlock {
    /// Absolute start address.
    pub addr: u64,
    /// Byte length (sum of instruction sizes).
    pub size: u64,
    /// Branch successor.
    pub jump: Option<u64>,
    /// Fall-through successor; present only after a conditional branch.
    pub fail: Option<u64>,
    /// Instruction count.
    pub ninstr: usize,
    /// Byte offset of each instruction relative to `addr`; `op_pos[0] == 0`.
    pub op_pos: Vec<u16>,
    /// Split-chain position.
    pub kind: BlockKind,
    /// Stack delta at block end.
    pub stackptr: i64,
    /// Whether the terminating branch is conditional.
    pub conditional: bool,
    /// Switch descriptor, when the jump-table analyzer recognized one.
    pub switch_op: Option<SwitchOp>,
}

impl BasicBlock {
    /// An empty block at `addr`.
    pub fn new(addr: u64) -> Self {
        Self {
            addr,
            ..Self::default()
        }
    }

    /// First address past the block.
    pub fn end(&self) -> u64 {
        self.addr.saturating_add(self.size)
    }

    /// Whether `addr` falls inside the block.
    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.addr && addr < self.end()
    }

    /// Offset of instruction `i`, if recorded.
    pub fn op_offset(&self, i: usize) -> Option<u16> {
        self.op_pos.get(i).copied()
    }

    /// Record the offset of instruction `i`. Offsets arrive in order; a
    /// re-write of the last slot (delay-slot rewind) is allowed.
    pub fn set_op_offset(&mut self, i: usize, off: u16) {
        if i < self.op_pos.len() {
            self.op_pos[i] = off;
        } else if i == self.op_pos.len() {
            self.op_pos.push(off);
        }
    }

    /// Whether an instruction starts exactly at `addr`.
    pub fn op_starts_at(&self, addr: u64) -> bool {
        if !self.contains(addr) {
            return false;
        }
        let off = addr - self.addr;
        self.op_pos[..self.ninstr.min(self.op_pos.len())]
            .iter()
            .any(|&p| u64::from(p) == off)
    }
}
