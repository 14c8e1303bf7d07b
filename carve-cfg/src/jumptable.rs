//! Jump-table recognition.
//!
//! Three compiled-switch idioms are matched:
//!
//! 1. ireg-scaled direct table: `jmp [base + index*scale]`, entries are
//!    native-width pointers, the preceding compare bounds the count.
//! 2. delta (RVA) table: `lea base; ...; mov reg, [base + idx*4 + off];
//!    add reg, base; jmp reg`, entries are signed 32-bit offsets from
//!    the lea target.
//! 3. ARM `add pc, pc, r, lsl 2` style: the table entries are the
//!    branch instructions themselves.
//!
//! Each accepted table queues, per case, a datum annotation, a code
//! xref, a block edge and a `case.<switch>.<i>` flag, then recurses on
//! the case target like any other jump destination.

use carve_asm::OpKind;

use crate::{
    annotations::Annotations,
    block::{CaseOp, SwitchOp},
    config::JMPTBL_MAX_ENTRIES,
    error::RecurseResult,
    function::Function,
    host::{Disassembler, FlagSink, Image, XrefSink},
    walk::Analyzer,
};

/// Window scanned ahead of a `lea` for the terminating indirect jump.
const LEA_SEARCH_WINDOW: usize = 64;

/// Delta-table entries must land within this span of the entry.
const DELTA_MAX_SPAN: u64 = 4096;

/// Compare immediates at or past this value are not case counts.
const CMP_SANITY: u64 = 0x200;

impl<D, I, F, X> Analyzer<D, I, F, X>
where
    D: Disassembler,
    I: Image,
    F: FlagSink,
    X: XrefSink,
{
    /// Queue the UI side effects of one resolved case.
    fn queue_case(&mut self, switch_addr: u64, case_addr: u64, id: u64, entry_loc: u64, sz: u64) {
        self.annotations.datum(sz, entry_loc);
        self.annotations.code_xref(case_addr, switch_addr);
        self.annotations.edge(switch_addr, case_addr);
        self.annotations
            .flag(&Annotations::case_flag(switch_addr, id), 1, case_addr);
    }

    /// Emit the trailing switch summary once at least one case walked.
    fn finish_table(&mut self, ip: u64, tbl_loc: u64, cases: usize, default_case: Option<u64>) {
        self.annotations.comment(
            &format!("switch table ({cases} cases) at 0x{tbl_loc:x}"),
            ip,
        );
        self.annotations.flag(&Annotations::switch_flag(ip), 1, ip);
        if let Some(d) = default_case.filter(|&d| d != 0) {
            self.annotations.flag(&Annotations::default_flag(d), 1, d);
        }
    }

    /// Walk a table of pointers (or sign-extended deltas against
    /// `tbl_off`) at `tbl_loc`, recursing into every resolved target.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn walk_table(
        &mut self,
        fcn: &mut Function,
        depth: u32,
        bi: usize,
        ip: u64,
        tbl_loc: u64,
        tbl_off: u64,
        sz: u64,
        table_size: u64,
        default_case: Option<u64>,
        ret0: RecurseResult,
    ) -> RecurseResult {
        let count = if table_size == 0 {
            JMPTBL_MAX_ENTRIES
        } else {
            table_size.min(JMPTBL_MAX_ENTRIES)
        };
        let mut table = vec![0u8; (count * sz) as usize];
        self.image.read_at(tbl_loc, &mut table);

        let mut ret = ret0;
        let mut cases: Vec<CaseOp> = Vec::new();
        let mut offs = 0u64;
        while offs + sz <= count * sz {
            if self.is_cancelled() {
                break;
            }
            let raw = read_le(&table[offs as usize..(offs + sz) as usize]);
            // A zero entry is the table running out, not case zero of the
            // program: stop before the base address aliases as a target.
            if raw == 0 {
                break;
            }
            let mut target = raw;
            if !self.image.is_valid(target, false) {
                // Sign-extended 32-bit delta against the table base.
                let delta = i64::from(raw as u32 as i32);
                target = tbl_off.wrapping_add_signed(delta);
                if !self.image.is_valid(target, false) {
                    break;
                }
            }
            if self.opt.out_of_limit(target) {
                break;
            }
            let id = offs / sz;
            self.queue_case(ip, target, id, tbl_loc + offs, sz);
            cases.push(CaseOp {
                addr: target,
                entry: tbl_loc + offs,
                value: id,
            });
            ret = self.recurse_at(fcn, target, depth);
            offs += sz;
        }

        if offs > 0 {
            self.finish_table(ip, tbl_loc, (offs / sz) as usize, default_case);
            let max_val = cases.last().map(|c| c.value).unwrap_or_default();
            fcn.bbs[bi].switch_op = Some(SwitchOp {
                addr: ip,
                min_val: 0,
                max_val,
                def_val: default_case,
                cases,
            });
        }
        ret
    }

    /// Walk an ARM-style table whose entries are the branch instructions
    /// themselves: case `i` lives at `tbl_loc + i*sz`.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn walk_arm_table(
        &mut self,
        fcn: &mut Function,
        depth: u32,
        bi: usize,
        ip: u64,
        tbl_loc: u64,
        sz: u64,
        table_size: u64,
        default_case: Option<u64>,
        ret0: RecurseResult,
    ) -> RecurseResult {
        let count = if table_size == 0 {
            JMPTBL_MAX_ENTRIES
        } else {
            table_size.min(JMPTBL_MAX_ENTRIES)
        };
        let mut ret = ret0;
        let mut cases: Vec<CaseOp> = Vec::new();
        let mut offs = 0u64;
        while offs + sz <= count * sz {
            if self.is_cancelled() {
                break;
            }
            let target = tbl_loc + offs;
            let id = offs / sz;
            self.queue_case(ip, target, id, target, sz);
            cases.push(CaseOp {
                addr: target,
                entry: target,
                value: id,
            });
            ret = self.recurse_at(fcn, target, depth);
            offs += sz;
        }
        if offs > 0 {
            self.finish_table(ip, tbl_loc, (offs / sz) as usize, default_case);
            let max_val = cases.last().map(|c| c.value).unwrap_or_default();
            fcn.bbs[bi].switch_op = Some(SwitchOp {
                addr: ip,
                min_val: 0,
                max_val,
                def_val: default_case,
                cases,
            });
        }
        ret
    }

    /// Screen a `lea` for the delta-table idiom: find the terminating
    /// indirect jump within 64 bytes, adjust the table base by the mov
    /// displacement, and require the first three deltas to resolve close
    /// to the function entry. Returns the table address and the jump op.
    pub(crate) fn delta_table_candidate(
        &mut self,
        fcn: &Function,
        lea_addr: u64,
        lea_ptr: u64,
    ) -> Option<(u64, carve_asm::DecodedOp)> {
        let mut buf = [0u8; LEA_SEARCH_WINDOW];
        self.read_window(lea_addr, &mut buf);

        let mut mov_op: Option<carve_asm::DecodedOp> = None;
        let mut add_op: Option<carve_asm::DecodedOp> = None;
        let mut jmp_op: Option<carve_asm::DecodedOp> = None;
        let mut i = 0usize;
        while i + 8 < LEA_SEARCH_WINDOW {
            let at = lea_addr + i as u64;
            let Some(op) = self.decoder.decode(at, &buf[i..]) else {
                i += 1;
                continue;
            };
            let len = usize::from(op.size.max(1));
            if op.kind == OpKind::Jmp && op.is_indirect() && !op.is_cond() {
                jmp_op = Some(op);
                break;
            }
            if op.kind == OpKind::Mov {
                mov_op = Some(op);
            } else if op.kind == OpKind::Add {
                add_op = Some(op);
            }
            i += len;
        }
        let jmp_op = jmp_op?;

        let mut tbl_addr = lea_ptr;
        if let (Some(mov), Some(add)) = (&mov_op, &add_op) {
            if mov.addr < add.addr && add.addr < jmp_op.addr {
                if let Some(disp) = mov.ptr {
                    // The mov displacement is the table offset from the
                    // lea base.
                    tbl_addr = tbl_addr.wrapping_add(disp);
                }
            }
        }

        let mut deltas = [0u8; 12];
        self.read_window(tbl_addr, &mut deltas);
        for k in 0..3 {
            let delta = i32::from_le_bytes(deltas[k * 4..k * 4 + 4].try_into().ok()?);
            let dst = lea_ptr.wrapping_add_signed(i64::from(delta));
            if !self.image.is_valid(dst, false) {
                return None;
            }
            if dst > fcn.addr.saturating_add(DELTA_MAX_SPAN) {
                return None;
            }
            if self.opt.jmpabove && dst < fcn.addr.saturating_sub(DELTA_MAX_SPAN) {
                return None;
            }
        }
        Some((tbl_addr, jmp_op))
    }

    /// Size/default discovery from the instruction window between the
    /// `lea` and the jump: the compare immediate bounds the table, the
    /// conditional jump after it is the guard.
    pub(crate) fn delta_table_info(
        &mut self,
        jmp_addr: u64,
        lea_addr: u64,
    ) -> Option<(u64, Option<u64>)> {
        if lea_addr > jmp_addr {
            return None;
        }
        let span = (jmp_addr - lea_addr) as usize;
        let mut buf = vec![0u8; span];
        self.image.read_at(lea_addr, &mut buf);

        let mut table_size = None;
        let mut default_case = None;
        let mut found_cmp = false;
        let mut i = 0usize;
        while i + 8 < span {
            let at = lea_addr + i as u64;
            let Some(op) = self.decoder.decode(at, &buf[i..]) else {
                i += 1;
                continue;
            };
            let len = usize::from(op.size.max(1));
            if found_cmp {
                if op.kind == OpKind::Jmp && op.is_cond() {
                    default_case = op.jump;
                    break;
                }
                i += len;
                continue;
            }
            if op.kind == OpKind::Cmp {
                table_size = cmp_table_size(&op);
                found_cmp = true;
            }
            i += len;
        }
        table_size.map(|size| (size, default_case))
    }

    /// Size/default discovery from the CFG: the predecessor of the
    /// switch block must be a conditional guard; its non-switch edge is
    /// the default, and its compare immediate bounds the table.
    pub(crate) fn table_info_from_block(
        &mut self,
        fcn: &Function,
        jmp_addr: u64,
        bi: usize,
    ) -> Option<(u64, Option<u64>)> {
        // Indirect jumps in linker stubs dispatch imports, not switches.
        if let Some(section) = self.image.section_at(jmp_addr) {
            if section.name.contains(".plt") || section.name.contains("_stubs") {
                return None;
            }
        }

        let my_addr = fcn.bbs[bi].addr;
        let prev = fcn
            .bbs
            .iter()
            .find(|bb| bb.jump == Some(my_addr) || bb.fail == Some(my_addr));
        let Some(prev) = prev else {
            tracing::warn!("missing predecessor cjmp bb at 0x{jmp_addr:08x}");
            return None;
        };
        let (Some(prev_jump), Some(prev_fail)) = (prev.jump, prev.fail) else {
            tracing::warn!("predecessor bb at 0x{:08x} is not conditional", prev.addr);
            return None;
        };
        let default_case = if prev_jump == my_addr {
            prev_fail
        } else {
            prev_jump
        };

        let mut buf = vec![0u8; prev.size as usize];
        self.image.read_at(prev.addr, &mut buf);
        for i in 0..prev.ninstr {
            let pos = usize::from(prev.op_offset(i)?);
            if pos >= buf.len() {
                continue;
            }
            let at = prev.addr + pos as u64;
            let Some(op) = self.decoder.decode(at, &buf[pos..]) else {
                continue;
            };
            if op.kind != OpKind::Cmp {
                continue;
            }
            return cmp_table_size(&op).map(|size| (size, Some(default_case)));
        }
        None
    }

    /// Linear scan of a case body: stop at the first trap, return or
    /// plain jump, declaring the recognized run as a block with an edge
    /// from the switch. Returns the bytes consumed.
    pub fn scan_case_body(&mut self, fcn_addr: u64, switch_addr: u64, addr: u64, len: u64) -> u64 {
        let mut buf = [0u8; 32];
        let mut idx = 0u64;
        while idx < len {
            if len - idx < 5 {
                break;
            }
            let at = addr + idx;
            self.read_window(at, &mut buf);
            let Some(op) = self.decoder.decode(at, &buf) else {
                return 0;
            };
            let oplen = u64::from(op.size.max(1));
            let terminal = matches!(op.kind, OpKind::Trap | OpKind::Ret)
                || (op.kind == OpKind::Jmp && !op.is_cond() && !op.is_indirect());
            if terminal {
                self.annotations.block(fcn_addr, addr, idx + oplen);
                self.annotations.edge(switch_addr, addr);
                return idx + oplen;
            }
            idx += oplen;
        }
        idx
    }
}

/// Table size from a compare op: a missing operand leaves the size to
/// the next screening stage; immediates must stay plausible.
fn cmp_table_size(op: &carve_asm::DecodedOp) -> Option<u64> {
    match (op.val, op.refptr) {
        (None, None) => Some(0),
        (Some(v), None) => {
            if v < CMP_SANITY {
                Some(v + 1)
            } else {
                tracing::warn!("overlarge compare constant 0x{v:x} at 0x{:08x}", op.addr);
                None
            }
        }
        (_, Some(r)) => {
            if r < CMP_SANITY {
                Some(r + 1)
            } else {
                tracing::warn!("overlarge compare width 0x{r:x} at 0x{:08x}", op.addr);
                None
            }
        }
    }
}

fn read_le(bytes: &[u8]) -> u64 {
    let mut v = 0u64;
    for (i, &b) in bytes.iter().enumerate().take(8) {
        v |= u64::from(b) << (8 * i);
    }
    v
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_le_widths() {
        assert_eq!(read_le(&[0x34, 0x12]), 0x1234);
        assert_eq!(read_le(&[0x78, 0x56, 0x34, 0x12]), 0x12345678);
        assert_eq!(
            read_le(&[1, 0, 0, 0, 0, 0, 0, 0x80]),
            0x8000_0000_0000_0001
        );
    }

    #[rstest::rstest]
    #[case(None, None, Some(0))]
    #[case(Some(3), None, Some(4))]
    #[case(Some(0x200), None, None)]
    #[case(Some(9), Some(7), Some(8))]
    #[case(Some(9), Some(0x200), None)]
    fn cmp_size_rules(
        #[case] val: Option<u64>,
        #[case] refptr: Option<u64>,
        #[case] expect: Option<u64>,
    ) {
        let mut op = carve_asm::DecodedOp::new(OpKind::Cmp, 0, 2);
        op.val = val;
        op.refptr = refptr;
        assert_eq!(cmp_table_size(&op), expect);
    }
}
