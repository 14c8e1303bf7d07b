//! Discovered functions.

use crate::{
    block::{BasicBlock, BlockKind},
    ranges::RangeSet,
};

/// What a discovered function is, as far as naming and UI go.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum FunctionKind {
    /// A regular function.
    #[default]
    Function,
    /// A local code label reached by a jump rather than a call.
    Location,
    /// A function backed by a symbol-table entry.
    Symbol,
    /// An import trampoline.
    Import,
    /// An interrupt handler (detected via a privileged return).
    Interrupt,
    /// Catch-all used by exact-entry lookups.
    Root,
}

impl FunctionKind {
    /// Short tag used in names and listings.
    pub fn as_str(self) -> &'static str {
        match self {
            FunctionKind::Function => "fcn",
            FunctionKind::Location => "loc",
            FunctionKind::Symbol => "sym",
            FunctionKind::Import => "imp",
            FunctionKind::Interrupt => "int",
            FunctionKind::Root => "root",
        }
    }
}

/// A discovered function: entry, blocks, extent, aggregated stats.
///
/// Blocks stay in discovery order; callers needing address order sort on
/// demand. `bbr` is rebuilt from the blocks on every structural change
/// and answers containment queries.
#[derive(Debug, Clone)]
pub struct Function {
    /// Entry address. Unique across live functions in a catalog.
    pub addr: u64,
    /// Display name.
    pub name: String,
    /// Function kind.
    pub kind: FunctionKind,
    /// Owned basic blocks, in discovery order.
    pub bbs: Vec<BasicBlock>,
    /// Current stack delta while walking.
    pub stack: i64,
    /// Deepest stack delta seen.
    pub max_stack: i64,
    /// Total instruction count.
    pub ninstr: usize,
    pub(crate) size: u64,
    pub(crate) is_pure: bool,
    pub(crate) has_changed: bool,
    pub(crate) bbr: RangeSet,
}

impl Function {
    /// A fresh, empty function at `addr`, named `fcn.<hex(addr)>`.
    pub fn new(addr: u64) -> Self {
        Self {
            addr,
            name: format!("fcn.{addr:08x}"),
            kind: FunctionKind::Function,
            bbs: Vec::new(),
            stack: 0,
            max_stack: 0,
            ninstr: 0,
            size: 0,
            is_pure: false,
            has_changed: true,
            bbr: RangeSet::new(),
        }
    }

    /// Same, with an explicit name.
    #[must_use]
    pub fn with_name(mut self, name: &str) -> Self {
        self.name = name.into();
        self
    }

    /// Stored extent in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// First address past the stored extent.
    pub fn end(&self) -> u64 {
        self.addr.saturating_add(self.size)
    }

    /// Directly set the stored extent. When the function is registered in
    /// a catalog, resize through the catalog instead so the index
    /// augmentation stays correct.
    pub fn set_size(&mut self, size: u64) {
        self.size = size;
    }

    /// Cached purity bit; see [`crate::Analyzer::purity_of`].
    pub fn is_pure(&self) -> bool {
        self.is_pure
    }

    /// Append an empty block at `addr` and return its index.
    pub fn add_block(&mut self, addr: u64) -> usize {
        self.bbs.push(BasicBlock::new(addr));
        self.has_changed = true;
        self.bbs.len() - 1
    }

    /// Index of the block starting exactly at `addr`.
    pub fn block_at(&self, addr: u64) -> Option<usize> {
        self.bbs.iter().position(|bb| bb.addr == addr)
    }

    /// Index of the block covering `addr`. With `at_op_start`, only a
    /// block where an instruction begins exactly at `addr` counts
    /// (the x86 `jmpmid` rule).
    pub fn block_in(&self, addr: u64, at_op_start: bool) -> Option<usize> {
        self.bbs.iter().position(|bb| {
            let covered = (bb.size == 0 && addr == bb.addr) || bb.contains(addr);
            covered && (!at_op_start || bb.op_starts_at(addr))
        })
    }

    /// Split the block at index `i` at `addr`, which must lie inside it.
    ///
    /// The earlier fragment keeps everything up to `addr` and falls
    /// through to the later one; instruction offsets are redistributed.
    /// Splitting at the block's own start is a no-op and returns `false`.
    pub fn split_block(&mut self, i: usize, addr: u64) -> bool {
        let (head_size, old_end, jump, fail, conditional, was_head) = {
            let bbi = &self.bbs[i];
            debug_assert!(addr >= bbi.addr && addr <= bbi.end());
            if addr == bbi.addr {
                return false;
            }
            (
                addr - bbi.addr,
                bbi.end(),
                bbi.jump,
                bbi.fail,
                bbi.conditional,
                bbi.kind.contains(BlockKind::HEAD),
            )
        };

        let mut tail = BasicBlock::new(addr);
        tail.size = old_end - addr;
        tail.jump = jump;
        tail.fail = fail;
        tail.conditional = conditional;
        tail.kind = BlockKind::BODY;

        let bbi = &mut self.bbs[i];
        bbi.size = head_size;
        bbi.jump = Some(addr);
        bbi.fail = None;
        bbi.conditional = false;
        if !was_head {
            bbi.kind |= BlockKind::HEAD;
        }

        // Offsets below the cut stay with the head; the rest move to the
        // tail, rebased. A cut between instruction starts leaves the tail
        // without recorded offsets.
        let mut keep = 0;
        while keep < bbi.ninstr && u64::from(bbi.op_pos[keep]) < head_size {
            keep += 1;
        }
        if bbi.op_offset(keep).map(u64::from) == Some(head_size) {
            for j in keep..bbi.ninstr {
                let off = bbi.op_pos[j];
                tail.set_op_offset(tail.ninstr, off - head_size as u16);
                tail.ninstr += 1;
            }
        }
        bbi.ninstr = keep;
        bbi.op_pos.truncate(keep);

        self.bbs.push(tail);
        self.has_changed = true;
        true
    }

    /// Fold a freshly built block whose tail ran into an existing block:
    /// the new block is truncated at the existing one and chained to it.
    /// Returns whether an overlap was found (the block is appended either
    /// way).
    pub fn absorb_overlap(&mut self, mut bb: BasicBlock) -> bool {
        let overlap = self
            .bbs
            .iter()
            .position(|bbi| bb.end() > bbi.addr && bb.end() <= bbi.end());
        if let Some(i) = overlap {
            let bbi_addr = self.bbs[i].addr;
            bb.size = bbi_addr.saturating_sub(bb.addr);
            bb.jump = Some(bbi_addr);
            bb.fail = None;
            bb.conditional = false;
            if self.bbs[i].kind.contains(BlockKind::HEAD) {
                bb.kind = BlockKind::HEAD;
                self.bbs[i].kind.remove(BlockKind::HEAD);
            } else {
                bb.kind = BlockKind::BODY;
            }
        }
        self.bbs.push(bb);
        self.has_changed = true;
        overlap.is_some()
    }

    /// Rebuild the containment interval set from the blocks.
    pub fn rebuild_ranges(&mut self) {
        self.bbr.clear();
        for bb in &self.bbs {
            self.bbr.add(bb.addr, bb.end());
        }
    }

    /// Whether `addr` lies inside the function: inside a block when
    /// blocks exist, inside the stored extent otherwise.
    pub fn is_in(&self, addr: u64) -> bool {
        if self.bbs.is_empty() {
            return addr >= self.addr && addr < self.end();
        }
        self.bbr.contains(addr) || addr == self.addr
    }

    /// Shrink (or grow) the stored extent to `new_size`, dropping blocks
    /// past the new end, clamping straddlers, and clearing successors
    /// that now point outside.
    pub fn resize(&mut self, new_size: u64) -> bool {
        if new_size < 1 {
            return false;
        }
        self.size = new_size;
        let eof = self.addr.saturating_add(new_size);
        self.bbs.retain(|bb| bb.addr < eof);
        for bb in &mut self.bbs {
            if bb.end() > eof {
                bb.size = eof - bb.addr;
            }
            if bb.jump.is_some_and(|j| j >= eof) {
                bb.jump = None;
            }
            if bb.fail.is_some_and(|f| f >= eof) {
                bb.fail = None;
            }
        }
        self.rebuild_ranges();
        self.has_changed = true;
        true
    }

    /// Sum of all block sizes.
    pub fn real_size(&self) -> u64 {
        self.bbs.iter().map(|bb| bb.size).sum()
    }

    /// Sum of the sizes of blocks at or after the entry.
    pub fn contiguous_size(&self) -> u64 {
        self.bbs
            .iter()
            .filter(|bb| bb.addr >= self.addr)
            .map(|bb| bb.size)
            .sum()
    }

    /// Number of back edges (a successor below its own block).
    pub fn loops(&self) -> usize {
        self.bbs
            .iter()
            .map(|bb| {
                usize::from(bb.jump.is_some_and(|j| j < bb.addr))
                    + usize::from(bb.fail.is_some_and(|f| f < bb.addr))
            })
            .sum()
    }

    /// Edge count and exit-block count of the CFG.
    pub fn count_edges(&self) -> (usize, usize) {
        let mut edges = 0;
        let mut exits = 0;
        for bb in &self.bbs {
            if bb.jump.is_none() && bb.fail.is_none() {
                exits += 1;
            } else {
                edges += usize::from(bb.jump.is_some()) + usize::from(bb.fail.is_some());
            }
        }
        (edges, exits)
    }

    /// Cyclomatic complexity `E - N + 2P`, counting switch cases as
    /// edges. Degenerate results (below 1) are reported and returned
    /// as-is.
    pub fn cyclomatic_complexity(&self) -> i64 {
        let mut e: i64 = 0;
        let mut n: i64 = 0;
        let mut p: i64 = 0;
        for bb in &self.bbs {
            n += 1;
            if bb.jump.is_none() && bb.fail.is_some() {
                tracing::warn!(
                    "invalid jump/fail successor pair at 0x{:08x} (fcn 0x{:08x})",
                    bb.addr,
                    self.addr
                );
            }
            if bb.jump.is_none() && bb.fail.is_none() {
                p += 1;
            } else {
                e += 1;
                if bb.fail.is_some() {
                    e += 1;
                }
            }
            if let Some(sw) = &bb.switch_op {
                e += sw.cases.len() as i64;
            }
        }
        let result = e - n + 2 * p;
        if result < 1 {
            tracing::warn!(
                "degenerate cyclomatic complexity E({e}) - N({n}) + 2P({p}) < 1 at 0x{:08x}",
                self.addr
            );
        }
        result
    }
}
