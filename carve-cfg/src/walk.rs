//! The discovery walker.
//!
//! [`Analyzer::analyze_function`] drives a recursive, block-by-block walk
//! from an entry address: instructions are decoded one at a time through
//! the read-ahead cache, grown onto the current block, and dispatched on
//! their kind to discover successors. Every successor recurses with a
//! decremented depth budget. Errors never unwind past one descent; the
//! caller keeps whatever was discovered.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use carve_asm::{OpKind, OpMods, StackOp};
use itertools::Itertools;

use crate::{
    annotations::Annotations,
    block::BlockKind,
    cache::ReadAhead,
    catalog::{Catalog, FcnId},
    config::{AnalysisOpt, BLOCK_ALIGN, MAX_FCN_SIZE},
    error::{Outcome, RecurseError, RecurseResult},
    function::{Function, FunctionKind},
    host::{Disassembler, FlagSink, Image, XrefKind, XrefSink},
};

/// Bytes fetched per instruction; enough to hold any encoding.
const OP_WINDOW: usize = 32;

/// Stack deltas at or past this magnitude are treated as bogus.
const STACK_DELTA_SANITY: i64 = 8096;

/// Two-pass branch-delay bookkeeping.
///
/// The first encounter of a delayed branch records where it sits and how
/// many slot instructions follow; the walk continues straight ahead and,
/// once the slots are consumed, rewinds to re-dispatch the branch with
/// the slot bytes already accounted for.
#[derive(Debug, Default, Clone, Copy)]
struct DelaySlots {
    cnt: u8,
    idx: u64,
    after: u64,
    pending: bool,
    adjust: bool,
    un_idx: u64,
}

/// The analysis engine: oracles, options, caches and the catalogue.
#[derive(Debug)]
pub struct Analyzer<D, I, F, X> {
    pub(crate) decoder: D,
    pub(crate) image: I,
    pub(crate) flags: F,
    pub(crate) xrefs: X,
    pub(crate) opt: AnalysisOpt,
    pub(crate) cache: ReadAhead,
    pub(crate) annotations: Annotations,
    pub(crate) catalog: Catalog,
    cancel: Arc<AtomicBool>,
}

impl<D, I, F, X> Analyzer<D, I, F, X> {
    /// Build an analyzer over the given host collaborators.
    pub fn new(decoder: D, image: I, flags: F, xrefs: X, opt: AnalysisOpt) -> Self {
        Self {
            decoder,
            image,
            flags,
            xrefs,
            opt,
            cache: ReadAhead::new(),
            annotations: Annotations::new(),
            catalog: Catalog::new(),
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    /// The discovered-function catalogue.
    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    /// Mutable access to the catalogue.
    pub fn catalog_mut(&mut self) -> &mut Catalog {
        &mut self.catalog
    }

    /// The accumulated annotation stream.
    pub fn annotations(&self) -> &Annotations {
        &self.annotations
    }

    /// Drain the annotation stream.
    pub fn take_annotations(&mut self) -> String {
        self.annotations.take()
    }

    /// The active options.
    pub fn opt(&self) -> &AnalysisOpt {
        &self.opt
    }

    /// The flag store.
    pub fn flags(&self) -> &F {
        &self.flags
    }

    /// Mutable access to the flag store.
    pub fn flags_mut(&mut self) -> &mut F {
        &mut self.flags
    }

    /// The xref store.
    pub fn xrefs(&self) -> &X {
        &self.xrefs
    }

    /// Mutable access to the xref store.
    pub fn xrefs_mut(&mut self) -> &mut X {
        &mut self.xrefs
    }

    /// Shared cancellation flag; setting it makes every walk return
    /// promptly at its next poll point, keeping partial results.
    pub fn cancel_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    /// Whether the host asked us to stop.
    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::Relaxed)
    }

    /// One cooperative suspension point: honor the throttle, then report
    /// whether the host asked us to stop.
    fn pause_point(&self) -> bool {
        if let Some(nap) = self.opt.sleep {
            std::thread::sleep(nap);
        }
        self.cancel.load(Ordering::Relaxed)
    }
}

fn is_invalid_memory(buf: &[u8]) -> bool {
    let n = buf.len().min(4);
    n > 0 && buf[..n].iter().all(|&b| b == 0xff)
}

impl<D, I, F, X> Analyzer<D, I, F, X>
where
    D: Disassembler,
    I: Image,
    F: FlagSink,
    X: XrefSink,
{
    /// Discover the function at `addr` and register it.
    ///
    /// `reftype` selects the kind: a plain code reference produces a
    /// `Location`, anything else a `Function`. Partial results survive
    /// walker errors; only a duplicate entry address aborts creation.
    pub fn analyze_function(&mut self, addr: u64, reftype: XrefKind) -> Result<FcnId, RecurseError> {
        let mut fcn = Function::new(addr);
        fcn.kind = if reftype == XrefKind::Code {
            FunctionKind::Location
        } else {
            FunctionKind::Function
        };

        let result = self.recurse(&mut fcn, addr, self.opt.depth);
        fcn.rebuild_ranges();

        if self.opt.endsize && result == Ok(Outcome::End) && fcn.size() > 0 {
            self.trim_to_contiguous(&mut fcn);
            self.trim_jump_refs(&fcn);
        }

        match result {
            Err(RecurseError::Duplicate(at)) if at == fcn.addr => Err(RecurseError::Duplicate(at)),
            Err(e) if fcn.real_size() == 0 => Err(e),
            _ => self
                .catalog
                .insert(fcn)
                .map_err(|f| RecurseError::Duplicate(f.addr)),
        }
    }

    /// Re-run discovery for a function already in the catalogue, growing
    /// it from `addr` (used after jump-table edits and by block
    /// patching).
    pub fn extend_function(&mut self, id: FcnId, addr: u64) -> RecurseResult {
        let Some(mut fcn) = self.catalog.take(id) else {
            return Err(RecurseError::InvalidMemory(addr));
        };
        let ret = self.recurse(&mut fcn, addr, self.opt.depth);
        fcn.rebuild_ranges();
        self.catalog.restore(id, fcn);
        ret
    }

    /// Manually declare a block of a registered function.
    ///
    /// An existing block at `addr` is reused; a block straddling `addr`
    /// is shrunk to end there. On x86 the byte stream is re-walked from
    /// `addr` first so instruction offsets stay accurate.
    pub fn add_block(
        &mut self,
        id: FcnId,
        addr: u64,
        size: u64,
        jump: Option<u64>,
        fail: Option<u64>,
        kind: BlockKind,
    ) -> bool {
        if size == 0 {
            tracing::warn!("refusing empty basic block at 0x{addr:08x}");
            return false;
        }
        if size > self.opt.bb_max_size {
            tracing::warn!("refusing {size} byte basic block at 0x{addr:08x}");
            return false;
        }
        let Some(mut fcn) = self.catalog.take(id) else {
            return false;
        };
        let ok = self.add_block_inner(&mut fcn, addr, size, jump, fail, kind);
        fcn.rebuild_ranges();
        let grown = fcn.bbs.iter().map(|bb| bb.end()).max().unwrap_or(fcn.addr);
        if grown > fcn.addr && fcn.size() < grown - fcn.addr {
            fcn.set_size(grown - fcn.addr);
        }
        self.catalog.restore(id, fcn);
        ok
    }

    fn add_block_inner(
        &mut self,
        fcn: &mut Function,
        addr: u64,
        size: u64,
        jump: Option<u64>,
        fail: Option<u64>,
        kind: BlockKind,
    ) -> bool {
        let exact = fcn.block_at(addr);
        let mid = fcn
            .bbs
            .iter()
            .position(|bb| addr > bb.addr && addr < bb.end());
        if let Some(mi) = mid {
            fcn.bbs[mi].size = addr - fcn.bbs[mi].addr;
            fcn.rebuild_ranges();
        }

        let target = if self.opt.arch.is_x86() {
            if let Some(e) = exact {
                fcn.bbs.remove(e);
            }
            let _ = self.recurse(fcn, addr, 1);
            fcn.rebuild_ranges();
            match fcn.block_at(addr) {
                Some(b) => b,
                None if fcn.addr == addr => return true,
                None => {
                    tracing::warn!(
                        "block declaration failed in fcn 0x{:08x} at 0x{addr:08x}",
                        fcn.addr
                    );
                    return false;
                }
            }
        } else {
            exact.unwrap_or_else(|| fcn.add_block(addr))
        };

        let bb = &mut fcn.bbs[target];
        bb.size = size;
        bb.jump = jump;
        bb.fail = fail;
        bb.kind = kind;
        true
    }

    /// Heuristic probe: do the bytes at `addr` look like a function
    /// body whose near branches stay inside `[low, high)`?
    pub fn looks_like_function(&mut self, addr: u64, low: u64, high: u64) -> bool {
        let mut head = [0u8; 10];
        if self.read_window(addr, &mut head) < head.len() {
            return false;
        }
        const PRELUDES: [&[u8]; 5] = [
            b"\x55\x89\xe5",
            b"\x55\x8b\xec",
            b"\x8b\xff",
            b"\x55\x48\x89\xe5",
            b"\x55\x48\x8b\xec",
        ];
        if PRELUDES.iter().any(|p| head.starts_with(p)) {
            return true;
        }

        let mut buf = [0u8; OP_WINDOW];
        let (mut pushes, mut moves, mut branches) = (0u32, 0u32, 0u32);
        let mut at = addr;
        for _ in 0..10 {
            self.read_window(at, &mut buf);
            let Some(op) = self.decoder.decode(at, &buf) else {
                return false;
            };
            match op.kind {
                OpKind::Push => pushes += 1,
                OpKind::Mov => moves += 1,
                OpKind::Jmp | OpKind::Call => {
                    if op.jump.is_some_and(|j| j < low || j >= high) {
                        return false;
                    }
                    branches += 1;
                }
                OpKind::Unknown => return false,
                _ => {}
            }
            at += u64::from(op.size.max(1));
        }
        pushes + moves + branches > 5
    }

    /// Transitive purity of a registered function; cached until the
    /// function changes structurally.
    pub fn purity_of(&mut self, id: FcnId) -> bool {
        crate::purity::purity_of(self, id)
    }

    pub(crate) fn read_window(&mut self, addr: u64, buf: &mut [u8]) -> usize {
        self.cache.read(&self.image, addr, buf)
    }

    /// Grow the stored extent to cover block `bi`; truncate to zero and
    /// fail once the function passes the hard cap.
    pub(crate) fn fit_function(fcn: &mut Function, bi: usize) -> Result<(), RecurseError> {
        let end = fcn.bbs[bi].end();
        if end >= fcn.addr && fcn.size() < end - fcn.addr {
            fcn.set_size(end - fcn.addr);
        }
        if fcn.size() > MAX_FCN_SIZE {
            fcn.set_size(0);
            return Err(RecurseError::Overflow);
        }
        Ok(())
    }

    pub(crate) fn recurse_at(
        &mut self,
        fcn: &mut Function,
        addr: u64,
        depth: u32,
    ) -> RecurseResult {
        let ret = self.recurse(fcn, addr, depth.saturating_sub(1));
        fcn.rebuild_ranges();
        ret
    }

    /// One descent: append and grow a block at `addr`, dispatching each
    /// decoded instruction until the block terminates.
    pub(crate) fn recurse(&mut self, fcn: &mut Function, addr: u64, depth: u32) -> RecurseResult {
        if self.pause_point() {
            return Ok(Outcome::End);
        }
        if depth < 1 {
            return Err(RecurseError::TooDeep);
        }
        if !self.opt.noncode && !self.image.is_valid(addr, true) {
            return Ok(Outcome::End);
        }
        if !self.image.is_valid(addr, false) {
            tracing::warn!("invalid address 0x{addr:x}");
            return Err(RecurseError::InvalidMemory(addr));
        }
        if let Some(other) = self.catalog.at(addr) {
            if self.catalog.get(other).is_some() {
                return Err(RecurseError::Duplicate(addr));
            }
        }
        let split_mid = self.opt.jmpmid && self.opt.arch.is_x86();
        if let Some(existing) = fcn.block_in(addr, split_mid) {
            fcn.split_block(existing, addr);
            return if self.opt.recont {
                Ok(Outcome::End)
            } else {
                Err(RecurseError::Duplicate(addr))
            };
        }
        if self.opt.limit.as_ref().is_some_and(|l| addr < l.start) {
            return Ok(Outcome::End);
        }

        let bi = fcn.add_block(addr);
        tracing::debug!("append bb at 0x{addr:08x} (fcn 0x{:08x})", fcn.addr);

        let mut ret: RecurseResult = Ok(Outcome::End);
        let mut idx: u64 = 0;
        let mut delay = DelaySlots::default();
        let mut overlapped = false;
        let mut cmpval: Option<u64> = None;
        let mut movptr: Option<u64> = None;
        let mut leaddr: Option<u64> = None;
        let mut last_is_push = false;
        let mut last_push_addr: Option<u64> = None;
        let mut last_is_mov_lr_pc = false;
        let mut buf = [0u8; OP_WINDOW];

        'walk: while idx < self.opt.bb_max_size {
            if self.opt.limit.as_ref().is_some_and(|l| l.end <= addr + idx) {
                break;
            }
            if self.pause_point() {
                break;
            }
            let at = addr + idx;
            self.read_window(at, &mut buf);
            if is_invalid_memory(&buf) {
                Self::fit_function(fcn, bi)?;
                tracing::warn!("all-ones pattern at 0x{at:08x}");
                return Ok(Outcome::End);
            }
            let Some(mut op) = self.decoder.decode(at, &buf) else {
                Self::fit_function(fcn, bi)?;
                let ones = buf[..4].iter().filter(|&&b| b == 0xff).count();
                if ones >= 2 {
                    // Interspersed 0xff bytes: data, not a broken stream.
                    return Ok(Outcome::End);
                }
                return Err(RecurseError::DecodedAsData(at));
            };
            let oplen = u64::from(op.size.max(1));
            if let (Some(bits), Some(jump)) = (op.new_bits, op.jump) {
                self.flags.set_bits_hint(jump, bits);
            }

            if idx > 0 && !overlapped {
                if let Some(gi) = fcn.block_in(at, split_mid) {
                    if gi != bi {
                        fcn.bbs[bi].jump = Some(at);
                        if split_mid {
                            fcn.split_block(gi, at);
                        }
                        overlapped = true;
                        tracing::debug!("overlapped at 0x{at:08x}");
                    }
                }
            }
            if !overlapped {
                let bb = &mut fcn.bbs[bi];
                let off = (at - bb.addr) as u16;
                let slot = bb.ninstr;
                bb.set_op_offset(slot, off);
                bb.ninstr += 1;
                bb.size += oplen;
                fcn.ninstr += 1;
            }
            idx += oplen;
            delay.un_idx = idx;

            if op.delay > 0 && !delay.pending {
                // First pass over a delayed branch: note where it is and
                // walk the slot instructions before dispatching it.
                delay.idx = idx - oplen;
                delay.cnt = op.delay;
                delay.pending = true;
                delay.adjust = !overlapped;
                continue 'walk;
            }
            if delay.cnt > 0 {
                delay.cnt -= 1;
                if delay.cnt == 0 {
                    delay.after = idx;
                    idx = delay.idx;
                }
            } else if op.delay > 0 && delay.pending {
                // Second pass: the branch was sized into the block twice,
                // deduct the duplicate before dispatching it for real.
                if delay.adjust {
                    let bb = &mut fcn.bbs[bi];
                    bb.size -= oplen;
                    bb.ninstr -= 1;
                    bb.op_pos.truncate(bb.ninstr);
                    fcn.ninstr -= 1;
                    Self::fit_function(fcn, bi)?;
                }
                idx = delay.after;
                delay = DelaySlots {
                    un_idx: idx,
                    ..DelaySlots::default()
                };
            }

            match op.stackop {
                StackOp::Inc => {
                    if op.stackptr.abs() < STACK_DELTA_SANITY {
                        fcn.stack += op.stackptr;
                        if fcn.stack > fcn.max_stack {
                            fcn.max_stack = fcn.stack;
                        }
                    }
                    fcn.bbs[bi].stackptr += op.stackptr;
                }
                StackOp::Reset => fcn.bbs[bi].stackptr = 0,
                _ => {}
            }
            if let Some(p) = op.ptr {
                self.xrefs.set(op.addr, p, XrefKind::Data);
            }

            match op.kind {
                OpKind::Mov => {
                    if self.opt.arch.is_arm() && op.esil.as_deref() == Some("pc,lr,=") {
                        last_is_mov_lr_pc = true;
                    }
                    if self.opt.jmptbl && op.scale > 0 && op.ireg.is_some() {
                        movptr = op.ptr;
                    }
                    if self.opt.hpskip && op.is_hairpin() {
                        match self.skip_entry_pad(fcn, bi, addr, oplen, delay.un_idx, &mut idx, true)
                        {
                            PadSkip::Skipped => continue 'walk,
                            PadSkip::SkippedBefore => return Ok(Outcome::End),
                            PadSkip::Not => {}
                        }
                    }
                }
                OpKind::Lea => {
                    if let Some(p) = op.ptr {
                        // An all-ones tail in the pointed bytes marks a
                        // likely RVA-table base.
                        let mut probe = [0u8; 4];
                        self.image.read_at(p, &mut probe);
                        if probe[2] == 0xff && probe[3] == 0xff {
                            leaddr = Some(p);
                        }
                    }
                    if self.opt.hpskip && op.is_hairpin() {
                        match self.skip_entry_pad(fcn, bi, addr, oplen, delay.un_idx, &mut idx, true)
                        {
                            PadSkip::Skipped => continue 'walk,
                            PadSkip::SkippedBefore => return Ok(Outcome::End),
                            PadSkip::Not => {}
                        }
                    }
                    if self.opt.jmptbl {
                        if let Some(lea_ptr) = op.ptr {
                            if let Some((tbl_addr, jmp_op)) =
                                self.delta_table_candidate(fcn, op.addr, lea_ptr)
                            {
                                let info = self
                                    .table_info_from_block(fcn, jmp_op.addr, bi)
                                    .or_else(|| self.delta_table_info(jmp_op.addr, op.addr));
                                if let Some((table_size, default_case)) = info {
                                    ret = self.walk_table(
                                        fcn,
                                        depth,
                                        bi,
                                        jmp_op.addr,
                                        tbl_addr,
                                        lea_ptr,
                                        4,
                                        table_size,
                                        default_case,
                                        Ok(Outcome::New),
                                    );
                                }
                            }
                        }
                    }
                }
                OpKind::Add => {
                    // A stray `add [reg], reg` followed by four zero bytes
                    // is a pad between functions, not code.
                    if self.opt.ijmp {
                        let next = op.size as usize;
                        if next + 4 <= buf.len() && buf[next..next + 4] == [0, 0, 0, 0] {
                            let bb = &mut fcn.bbs[bi];
                            bb.size -= oplen;
                            bb.ninstr -= 1;
                            bb.op_pos.truncate(bb.ninstr);
                            fcn.ninstr -= 1;
                            Self::fit_function(fcn, bi)?;
                            return Ok(Outcome::End);
                        }
                    }
                }
                OpKind::Ill => {
                    if self.opt.nopskip && buf[..4] == [0, 0, 0, 0] {
                        match self.skip_entry_pad(fcn, bi, addr, oplen, delay.un_idx, &mut idx, false)
                        {
                            PadSkip::Skipped => continue 'walk,
                            PadSkip::SkippedBefore | PadSkip::Not => {
                                let bb = &mut fcn.bbs[bi];
                                bb.size -= oplen;
                                bb.ninstr -= 1;
                                bb.op_pos.truncate(bb.ninstr);
                                fcn.ninstr -= 1;
                            }
                        }
                    }
                    Self::fit_function(fcn, bi)?;
                    return Ok(Outcome::End);
                }
                OpKind::Trap => {
                    if self.opt.nopskip && buf[0] == 0xcc {
                        if let PadSkip::Skipped =
                            self.skip_entry_pad(fcn, bi, addr, oplen, delay.un_idx, &mut idx, false)
                        {
                            continue 'walk;
                        }
                    }
                    Self::fit_function(fcn, bi)?;
                    return Ok(Outcome::End);
                }
                OpKind::Nop => {
                    if self.opt.nopskip {
                        if self.opt.arch.is_mips() {
                            // Keep entry nops that carry a symbol flag.
                            let sym = self
                                .flags
                                .get_at(addr, false)
                                .is_some_and(|f| f.name.starts_with("sym."));
                            if !sym {
                                if let PadSkip::Skipped = self.skip_entry_pad(
                                    fcn,
                                    bi,
                                    addr,
                                    oplen,
                                    delay.un_idx,
                                    &mut idx,
                                    false,
                                ) {
                                    continue 'walk;
                                }
                            }
                        } else if self
                            .flags
                            .get_at(if fcn.addr != 0 { fcn.addr } else { addr }, false)
                            .is_none()
                        {
                            match self.skip_entry_pad(
                                fcn,
                                bi,
                                addr,
                                oplen,
                                delay.un_idx,
                                &mut idx,
                                true,
                            ) {
                                PadSkip::Skipped => continue 'walk,
                                PadSkip::SkippedBefore => return Ok(Outcome::End),
                                PadSkip::Not => {}
                            }
                        }
                    }
                }
                OpKind::Jmp if op.is_cond() => {
                    if self.opt.cjmpref {
                        if let Some(j) = op.jump {
                            self.xrefs.set(op.addr, j, XrefKind::Code);
                        }
                    }
                    if !overlapped {
                        let bb = &mut fcn.bbs[bi];
                        bb.jump = op.jump;
                        bb.fail = op.fail;
                        bb.conditional = true;
                    }
                    if self.opt.jmptbl {
                        if let (Some(tbl), Some(cmp), Some(default)) = (op.ptr, cmpval, op.fail) {
                            if op.reg.is_some() || op.ireg.is_some() {
                                let table_size = cmp.wrapping_add(1);
                                ret = if op.ireg.is_some() {
                                    self.walk_table(
                                        fcn,
                                        depth,
                                        bi,
                                        op.addr,
                                        tbl,
                                        tbl,
                                        self.opt.ptr_width(),
                                        table_size,
                                        Some(default),
                                        ret,
                                    )
                                } else {
                                    self.walk_arm_table(
                                        fcn,
                                        depth,
                                        bi,
                                        op.addr,
                                        tbl,
                                        self.opt.ptr_width(),
                                        table_size,
                                        Some(default),
                                        ret,
                                    )
                                };
                                // The matched operand was the table, not a
                                // code successor.
                                if op.jump == op.ptr {
                                    op.jump = None;
                                } else if op.fail == op.ptr {
                                    op.fail = None;
                                }
                                cmpval = None;
                            }
                        }
                    }
                    if self.opt.afterjmp {
                        if let Some(j) = op.jump {
                            ret = self.recurse_at(fcn, j, depth);
                        }
                        if let Some(f) = op.fail {
                            ret = self.recurse_at(fcn, f, depth);
                        }
                    } else if self.opt.eobjmp {
                        if !overlapped {
                            let bb = &mut fcn.bbs[bi];
                            bb.jump = op.jump;
                            bb.fail = None;
                        }
                        Self::fit_function(fcn, bi)?;
                        if let Some(j) = op.jump {
                            let _ = self.recurse_at(fcn, j, depth);
                        }
                        if let Some(f) = op.fail {
                            let _ = self.recurse_at(fcn, f, depth);
                        }
                        return Ok(Outcome::End);
                    } else {
                        if let Some(j) = op.jump {
                            ret = self.recurse_at(fcn, j, depth);
                        }
                        if let Some(f) = op.fail {
                            ret = self.recurse_at(fcn, f, depth);
                        }
                        if op.jump.is_some_and(|j| j < fcn.addr) {
                            if !overlapped {
                                let bb = &mut fcn.bbs[bi];
                                bb.jump = op.jump;
                                bb.fail = None;
                            }
                            Self::fit_function(fcn, bi)?;
                            return Ok(Outcome::End);
                        }
                    }
                    Self::fit_function(fcn, bi)?;
                    return ret;
                }
                OpKind::Jmp if op.is_indirect() => {
                    if self.opt.arch.is_arm() && last_is_mov_lr_pc && !op.mods.contains(OpMods::MEM)
                    {
                        // `mov lr, pc; bx reg` is a call, not a dispatch.
                    } else {
                        if self.opt.ijmp && self.symbol_follows(&op) {
                            Self::fit_function(fcn, bi)?;
                            return Ok(Outcome::End);
                        }
                        if self.opt.jmptbl {
                            if op.ptr.is_some() && (op.ireg.is_some() || op.reg.is_some()) {
                                let tbl = op.ptr.unwrap_or_default();
                                if let Some((table_size, default_case)) =
                                    self.table_info_from_block(fcn, op.addr, bi)
                                {
                                    ret = self.walk_table(
                                        fcn,
                                        depth,
                                        bi,
                                        op.addr,
                                        tbl,
                                        tbl,
                                        self.opt.ptr_width(),
                                        table_size,
                                        default_case,
                                        ret,
                                    );
                                }
                            } else if movptr == Some(0) {
                                if let Some(base) = leaddr {
                                    let table_size =
                                        cmpval.map(|c| c.wrapping_add(1)).unwrap_or(0);
                                    ret = self.walk_table(
                                        fcn, depth, bi, op.addr, base, base, 4, table_size, None,
                                        ret,
                                    );
                                }
                            } else if let Some(base) = movptr {
                                if let Some((table_size, default_case)) =
                                    self.table_info_from_block(fcn, op.addr, bi)
                                {
                                    ret = self.walk_table(
                                        fcn,
                                        depth,
                                        bi,
                                        op.addr,
                                        base,
                                        base,
                                        self.opt.ptr_width(),
                                        table_size,
                                        default_case,
                                        ret,
                                    );
                                }
                                movptr = None;
                            }
                        }
                        if self.opt.ijmp && self.opt.afterjmp {
                            if let Some(j) = op.jump {
                                ret = self.recurse_at(fcn, j, depth);
                            }
                            if let Some(f) = op.fail {
                                ret = self.recurse_at(fcn, f, depth);
                            }
                        }
                        Self::fit_function(fcn, bi)?;
                        return ret;
                    }
                }
                OpKind::Jmp => {
                    let Some(jump) = op.jump else {
                        Self::fit_function(fcn, bi)?;
                        return Ok(Outcome::End);
                    };
                    if self
                        .flags
                        .get_at(jump, false)
                        .is_some_and(|f| f.name.contains("imp."))
                    {
                        Self::fit_function(fcn, bi)?;
                        return Ok(Outcome::End);
                    }
                    if self.pause_point() {
                        return Ok(Outcome::End);
                    }
                    if self.opt.jmpref {
                        self.xrefs.set(op.addr, jump, XrefKind::Code);
                    }
                    if !self.opt.jmpabove && jump < fcn.addr {
                        Self::fit_function(fcn, bi)?;
                        return Ok(Outcome::End);
                    }
                    if self.flags.is_noreturn(jump) {
                        Self::fit_function(fcn, bi)?;
                        return Ok(Outcome::End);
                    }
                    let must_eob = self.opt.eobjmp
                        || match self.image.map_at(addr) {
                            Some(map) => !map.contains(jump),
                            None => true,
                        };
                    if must_eob {
                        Self::fit_function(fcn, bi)?;
                        return Ok(Outcome::End);
                    }
                    if !overlapped {
                        let bb = &mut fcn.bbs[bi];
                        bb.jump = Some(jump);
                        bb.fail = None;
                    }
                    ret = self.recurse_at(fcn, jump, depth);
                    Self::fit_function(fcn, bi)?;
                    return ret;
                }
                OpKind::Sub => {
                    if op.val.is_some_and(|v| v > 0) {
                        cmpval = op.val;
                    }
                }
                OpKind::Cmp => {
                    if op.ptr.is_some() {
                        cmpval = op.ptr;
                    }
                }
                OpKind::Call if op.is_indirect() => {
                    if let Some(p) = op.ptr {
                        self.xrefs.set(op.addr, p, XrefKind::Call);
                        if self.flags.is_noreturn(p) {
                            Self::fit_function(fcn, bi)?;
                            return Ok(Outcome::End);
                        }
                    }
                }
                OpKind::Call => {
                    if let Some(j) = op.jump {
                        self.xrefs.set(op.addr, j, XrefKind::Call);
                        if self.flags.is_noreturn(j) {
                            Self::fit_function(fcn, bi)?;
                            return Ok(Outcome::End);
                        }
                    }
                }
                OpKind::Push => {
                    last_is_push = true;
                    last_push_addr = op.val;
                    if let Some(v) = op.val {
                        if self.image.is_valid(v, true) {
                            self.xrefs.set(op.addr, v, XrefKind::Data);
                        }
                    }
                }
                OpKind::Ret => {
                    if op.family == carve_asm::OpFamily::Priv {
                        fcn.kind = FunctionKind::Interrupt;
                    }
                    if last_is_push && self.opt.pushret {
                        if let Some(target) = last_push_addr {
                            // push imm; ret: a trampoline, not a return.
                            fcn.bbs[bi].jump = Some(target);
                            ret = self.recurse_at(fcn, target, depth);
                            Self::fit_function(fcn, bi)?;
                            return ret;
                        }
                    }
                    if !op.is_cond() {
                        tracing::debug!(
                            "ret at 0x{:08x} closes bb (size {})",
                            addr + delay.un_idx - oplen,
                            fcn.bbs[bi].size
                        );
                        Self::fit_function(fcn, bi)?;
                        return Ok(Outcome::End);
                    }
                }
                _ => {}
            }

            if op.kind != OpKind::Push {
                last_is_push = false;
            }
            if self.opt.arch.is_arm() && op.kind != OpKind::Mov {
                last_is_mov_lr_pc = false;
            }
        }

        Self::fit_function(fcn, bi)?;
        ret
    }

    /// Whether the instruction after `op` carries an import/symbol flag;
    /// an indirect jump right before one is a thunk, not a dispatch.
    fn symbol_follows(&self, op: &carve_asm::DecodedOp) -> bool {
        self.flags.get_at(op.end(), false).is_some_and(|f| {
            ["imp.", "sym.", "entry", "main"]
                .iter()
                .any(|p| f.name.contains(p))
        })
    }

    /// Slide the function entry past a pad instruction sitting exactly
    /// on it. With `flag`, a `skip.` flag marks the spot so a
    /// re-analysis does not skip twice.
    fn skip_entry_pad(
        &mut self,
        fcn: &mut Function,
        bi: usize,
        addr: u64,
        oplen: u64,
        un_idx: u64,
        idx: &mut u64,
        flag: bool,
    ) -> PadSkip {
        if addr + un_idx - oplen != fcn.addr {
            return PadSkip::Not;
        }
        if flag {
            if self.flags.exist_at("skip", addr) {
                return PadSkip::SkippedBefore;
            }
            self.flags.set(&format!("skip.{addr}"), addr, oplen);
        }
        fcn.addr += oplen;
        let bb = &mut fcn.bbs[bi];
        bb.addr += oplen;
        bb.size -= oplen;
        bb.ninstr -= 1;
        bb.op_pos.truncate(bb.ninstr);
        fcn.ninstr -= 1;
        *idx = un_idx;
        PadSkip::Skipped
    }

    /// End-size pass: clamp the stored extent to the contiguous run of
    /// blocks from the entry, bridging small alignment gaps (and, under
    /// `jmpmid`, mid-instruction overlaps).
    fn trim_to_contiguous(&mut self, fcn: &mut Function) {
        let sorted = fcn.bbs.iter().map(|bb| (bb.addr, bb.end())).sorted();
        let bridge_mid = self.opt.jmpmid && self.opt.arch.is_x86();
        let mut endaddr = fcn.addr;
        for (start, end) in sorted {
            if endaddr == start {
                endaddr = end;
            } else if (endaddr < start && start - endaddr < BLOCK_ALIGN)
                || (bridge_mid && endaddr > start && end > endaddr)
            {
                endaddr = end;
            } else {
                break;
            }
        }
        if endaddr > fcn.addr {
            fcn.resize(endaddr - fcn.addr);
        }
    }

    /// Drop code xrefs originating in the function whose targets fell
    /// outside it after the end-size trim.
    fn trim_jump_refs(&mut self, fcn: &Function) {
        for r in self.xrefs.refs_in(fcn.addr, fcn.end()) {
            if r.kind == XrefKind::Code && !fcn.is_in(r.to) {
                self.xrefs.delete(r.from, r.to, r.kind);
            }
        }
    }
}

enum PadSkip {
    Not,
    Skipped,
    SkippedBefore,
}

#[cfg(test)]
mod tests;
