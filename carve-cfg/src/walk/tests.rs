use carve_asm::{Arch, DecodedOp, OpFamily, OpKind, OpMods, StackOp};

use crate::{
    block::BlockKind,
    config::AnalysisOpt,
    error::{Outcome, RecurseError},
    host::XrefKind,
    mock::{FlatImage, RecordingFlags, RecordingXrefs, ScriptedIsa},
    walk::Analyzer,
};

type TestAnalyzer = Analyzer<ScriptedIsa, FlatImage, RecordingFlags, RecordingXrefs>;

fn analyzer(isa: ScriptedIsa, image: FlatImage, opt: AnalysisOpt) -> TestAnalyzer {
    Analyzer::new(isa, image, RecordingFlags::new(), RecordingXrefs::new(), opt)
}

fn op(kind: OpKind, size: u16) -> DecodedOp {
    DecodedOp::new(kind, 0, size)
}

#[test]
fn straight_line_function() {
    // push; mov; add; ret
    let mut isa = ScriptedIsa::new();
    isa.seq(
        0x1000,
        [
            op(OpKind::Push, 1).with_stack(StackOp::Inc, 8),
            op(OpKind::Mov, 3),
            op(OpKind::Add, 2),
            op(OpKind::Ret, 1),
        ],
    );
    let mut anal = analyzer(isa, FlatImage::zeroed(0x1000, 0x100), AnalysisOpt::default());

    let id = anal.analyze_function(0x1000, XrefKind::Call).unwrap();
    let f = anal.catalog().get(id).unwrap();
    assert_eq!(anal.catalog().len(), 1);
    assert_eq!(f.bbs.len(), 1);
    assert_eq!(f.size(), 7);
    assert_eq!(f.ninstr, 4);
    let bb = &f.bbs[0];
    assert_eq!(bb.size, 7);
    assert_eq!(bb.ninstr, 4);
    assert_eq!(bb.op_pos, vec![0, 1, 4, 6]);
    assert_eq!(bb.jump, None);
    assert_eq!(bb.fail, None);
    assert_eq!(f.max_stack, 8);
    // No indirect control flow: the contiguous run is the whole extent.
    assert_eq!(f.contiguous_size(), f.size());
}

fn diamond_isa() -> ScriptedIsa {
    // cmp; je +6; mov; jmp +4; mov; ret — a conditional with a merge
    // block at the shared ret.
    let mut isa = ScriptedIsa::new();
    isa.seq(
        0x2000,
        [
            op(OpKind::Cmp, 2),
            op(OpKind::Jmp, 2)
                .with_mods(OpMods::COND)
                .with_jump(0x2009)
                .with_fail(0x2004),
            op(OpKind::Mov, 3),
            op(OpKind::Jmp, 2).with_jump(0x200c),
            op(OpKind::Mov, 3),
            op(OpKind::Ret, 1),
        ],
    );
    isa
}

#[test]
fn conditional_with_merge_splits_the_shared_tail() {
    let mut anal = analyzer(
        diamond_isa(),
        FlatImage::zeroed(0x2000, 0x100),
        AnalysisOpt::default(),
    );
    let id = anal.analyze_function(0x2000, XrefKind::Call).unwrap();
    let f = anal.catalog().get(id).unwrap();

    assert_eq!(f.bbs.len(), 4);
    let head = f.bbs.iter().find(|b| b.addr == 0x2000).unwrap();
    assert_eq!(head.jump, Some(0x2009));
    assert_eq!(head.fail, Some(0x2004));
    assert!(head.conditional);
    let merge = f.bbs.iter().find(|b| b.addr == 0x200c).unwrap();
    assert_eq!(merge.ninstr, 1);
    assert_eq!(merge.jump, None);
    // The split chained the earlier fragment into the merge block.
    let split_head = f.bbs.iter().find(|b| b.addr == 0x2009).unwrap();
    assert_eq!(split_head.jump, Some(0x200c));
    assert!(split_head.kind.contains(BlockKind::HEAD));
}

#[test]
fn recont_split_does_not_double_count_instructions() {
    let opt = AnalysisOpt {
        recont: true,
        ..AnalysisOpt::default()
    };
    let mut anal = analyzer(diamond_isa(), FlatImage::zeroed(0x2000, 0x100), opt);
    let id = anal.analyze_function(0x2000, XrefKind::Call).unwrap();
    let f = anal.catalog().get(id).unwrap();
    // cmp, je, mov, jmp, mov, ret: each counted exactly once.
    assert_eq!(f.ninstr, 6);
    assert_eq!(f.real_size(), 13);
    assert_eq!(f.bbs.len(), 4);
}

#[test]
fn pushret_trampoline_becomes_a_jump() {
    let mut isa = ScriptedIsa::new();
    isa.seq(
        0x5000,
        [
            op(OpKind::Push, 2).with_val(0x5100),
            op(OpKind::Ret, 1),
        ],
    );
    isa.put(op(OpKind::Ret, 1).with_mods(OpMods::empty()).at(0x5100));
    let opt = AnalysisOpt {
        pushret: true,
        endsize: false,
        ..AnalysisOpt::default()
    };
    let mut anal = analyzer(isa, FlatImage::zeroed(0x5000, 0x200), opt);
    let id = anal.analyze_function(0x5000, XrefKind::Call).unwrap();
    let f = anal.catalog().get(id).unwrap();

    let tramp = f.bbs.iter().find(|b| b.addr == 0x5000).unwrap();
    assert_eq!(tramp.jump, Some(0x5100));
    assert!(f.bbs.iter().any(|b| b.addr == 0x5100));
    // The pushed target also produced a data xref.
    assert!(anal
        .xrefs()
        .of_kind(XrefKind::Data)
        .iter()
        .any(|r| r.to == 0x5100));
}

#[test]
fn branch_delay_slot_is_counted_once() {
    // beq target; nop (delay slot); both successors walked afterwards.
    let mut isa = ScriptedIsa::new();
    isa.seq(
        0x6000,
        [
            op(OpKind::Jmp, 4)
                .with_mods(OpMods::COND)
                .with_jump(0x6010)
                .with_fail(0x6008)
                .with_delay(1),
            op(OpKind::Nop, 4),
        ],
    );
    isa.put(op(OpKind::Ret, 4).at(0x6008));
    isa.put(op(OpKind::Ret, 4).at(0x6010));
    let opt = AnalysisOpt {
        arch: Arch::Mips,
        ..AnalysisOpt::default()
    };
    let mut anal = analyzer(isa, FlatImage::zeroed(0x6000, 0x100), opt);
    let id = anal.analyze_function(0x6000, XrefKind::Call).unwrap();
    let f = anal.catalog().get(id).unwrap();

    let head = f.bbs.iter().find(|b| b.addr == 0x6000).unwrap();
    assert_eq!(head.size, 8, "branch + slot, slot counted once");
    assert_eq!(head.ninstr, 2);
    assert_eq!(head.op_pos, vec![0, 4]);
    assert_eq!(head.jump, Some(0x6010));
    assert_eq!(head.fail, Some(0x6008));
    assert!(f.bbs.iter().any(|b| b.addr == 0x6008));
    assert!(f.bbs.iter().any(|b| b.addr == 0x6010));
}

#[test]
fn duplicate_entry_aborts_reanalysis() {
    let mut isa = ScriptedIsa::new();
    isa.seq(0x1000, [op(OpKind::Ret, 1)]);
    let mut anal = analyzer(isa, FlatImage::zeroed(0x1000, 0x100), AnalysisOpt::default());
    anal.analyze_function(0x1000, XrefKind::Call).unwrap();
    let err = anal.analyze_function(0x1000, XrefKind::Call).unwrap_err();
    assert_eq!(err, RecurseError::Duplicate(0x1000));
    assert_eq!(anal.catalog().len(), 1);
}

#[test]
fn depth_budget_keeps_partial_results() {
    let mut anal = analyzer(
        diamond_isa(),
        FlatImage::zeroed(0x2000, 0x100),
        AnalysisOpt {
            depth: 1,
            ..AnalysisOpt::default()
        },
    );
    // Children run out of budget; the entry block still lands.
    let id = anal.analyze_function(0x2000, XrefKind::Call).unwrap();
    let f = anal.catalog().get(id).unwrap();
    assert_eq!(f.bbs.len(), 1);
    assert_eq!(f.bbs[0].addr, 0x2000);
}

#[test]
fn unmapped_entry_is_invalid_memory() {
    let isa = ScriptedIsa::new();
    let mut anal = analyzer(isa, FlatImage::zeroed(0x1000, 0x100), AnalysisOpt::default());
    let err = anal.analyze_function(0x4000, XrefKind::Call).unwrap_err();
    assert_eq!(err, RecurseError::InvalidMemory(0x4000));
    assert!(anal.catalog().is_empty());
}

#[test]
fn all_ones_bytes_terminate_discovery() {
    let isa = ScriptedIsa::new();
    let image = FlatImage::new(0x1000, vec![0xff; 0x40]);
    let mut anal = analyzer(isa, image, AnalysisOpt::default());
    let id = anal.analyze_function(0x1000, XrefKind::Call).unwrap();
    assert_eq!(anal.catalog().get(id).unwrap().real_size(), 0);
}

#[test]
fn undecodable_bytes_are_reported_as_data() {
    let isa = ScriptedIsa::new(); // decodes nothing
    let mut anal = analyzer(isa, FlatImage::zeroed(0x1000, 0x100), AnalysisOpt::default());
    let err = anal.analyze_function(0x1000, XrefKind::Call).unwrap_err();
    assert_eq!(err, RecurseError::DecodedAsData(0x1000));
    assert!(anal.catalog().is_empty());
}

#[test]
fn call_to_noreturn_ends_the_block() {
    let mut isa = ScriptedIsa::new();
    isa.seq(
        0x1000,
        [
            op(OpKind::Call, 2).with_jump(0x1080),
            op(OpKind::Mov, 3), // unreachable
        ],
    );
    let flags = RecordingFlags::new().with_noreturn(0x1080);
    let mut anal = Analyzer::new(
        isa,
        FlatImage::zeroed(0x1000, 0x100),
        flags,
        RecordingXrefs::new(),
        AnalysisOpt::default(),
    );
    let id = anal.analyze_function(0x1000, XrefKind::Call).unwrap();
    let f = anal.catalog().get(id).unwrap();
    assert_eq!(f.bbs.len(), 1);
    assert_eq!(f.bbs[0].size, 2);
    assert!(anal
        .xrefs()
        .of_kind(XrefKind::Call)
        .iter()
        .any(|r| r.from == 0x1000 && r.to == 0x1080));
}

#[test]
fn plain_call_falls_through() {
    let mut isa = ScriptedIsa::new();
    isa.seq(
        0x1000,
        [op(OpKind::Call, 2).with_jump(0x1080), op(OpKind::Ret, 1)],
    );
    isa.put(op(OpKind::Ret, 1).at(0x1080));
    let mut anal = analyzer(isa, FlatImage::zeroed(0x1000, 0x100), AnalysisOpt::default());
    let id = anal.analyze_function(0x1000, XrefKind::Call).unwrap();
    let f = anal.catalog().get(id).unwrap();
    // One block: the call does not split, and the callee is not walked.
    assert_eq!(f.bbs.len(), 1);
    assert_eq!(f.bbs[0].size, 3);
}

#[test]
fn jump_to_import_flag_terminates() {
    let mut isa = ScriptedIsa::new();
    isa.seq(0x1000, [op(OpKind::Jmp, 2).with_jump(0x1080)]);
    let flags = RecordingFlags::new().with_flag("imp.exit", 0x1080, 0);
    let mut anal = Analyzer::new(
        isa,
        FlatImage::zeroed(0x1000, 0x100),
        flags,
        RecordingXrefs::new(),
        AnalysisOpt::default(),
    );
    let id = anal.analyze_function(0x1000, XrefKind::Call).unwrap();
    let f = anal.catalog().get(id).unwrap();
    assert_eq!(f.bbs.len(), 1);
    assert_eq!(f.bbs[0].jump, None);
}

#[test]
fn jump_out_of_the_map_ends_the_block() {
    let mut isa = ScriptedIsa::new();
    isa.seq(0x1000, [op(OpKind::Jmp, 2).with_jump(0x9000)]);
    let mut anal = analyzer(isa, FlatImage::zeroed(0x1000, 0x100), AnalysisOpt::default());
    let id = anal.analyze_function(0x1000, XrefKind::Call).unwrap();
    let f = anal.catalog().get(id).unwrap();
    assert_eq!(f.bbs.len(), 1);
    assert_eq!(f.bbs[0].jump, None);
}

#[test]
fn backward_jump_without_jmpabove_ends_the_block() {
    let mut isa = ScriptedIsa::new();
    isa.put(op(OpKind::Ret, 1).at(0x1000));
    isa.seq(0x1010, [op(OpKind::Jmp, 2).with_jump(0x1000)]);
    // endsize off so the emitted ref survives the dangling-ref trim.
    let opt = AnalysisOpt {
        endsize: false,
        ..AnalysisOpt::default()
    };
    let mut anal = analyzer(isa, FlatImage::zeroed(0x1000, 0x100), opt);
    let id = anal.analyze_function(0x1010, XrefKind::Call).unwrap();
    let f = anal.catalog().get(id).unwrap();
    assert_eq!(f.bbs.len(), 1);
    assert_eq!(f.bbs[0].jump, None);
    // The code xref was still recorded before the fence.
    assert!(anal
        .xrefs()
        .of_kind(XrefKind::Code)
        .iter()
        .any(|r| r.to == 0x1000));
}

#[test]
fn hairpin_mov_at_entry_is_skipped_with_a_flag() {
    let mut isa = ScriptedIsa::new();
    isa.seq(
        0x1000,
        [
            op(OpKind::Mov, 2).with_src_dst("edi", "edi"),
            op(OpKind::Push, 1),
            op(OpKind::Ret, 1),
        ],
    );
    let opt = AnalysisOpt {
        hpskip: true,
        ..AnalysisOpt::default()
    };
    let mut anal = analyzer(isa, FlatImage::zeroed(0x1000, 0x100), opt);
    let id = anal.analyze_function(0x1000, XrefKind::Call).unwrap();
    let f = anal.catalog().get(id).unwrap();
    assert_eq!(f.addr, 0x1002, "entry slid past the pad");
    assert_eq!(f.bbs[0].addr, 0x1002);
    assert_eq!(f.bbs[0].ninstr, 2);
    assert!(anal.flags().any_named("skip"));
}

#[test]
fn interrupt_return_marks_the_function() {
    let mut isa = ScriptedIsa::new();
    isa.seq(
        0x1000,
        [op(OpKind::Ret, 2).with_family(OpFamily::Priv)],
    );
    let mut anal = analyzer(isa, FlatImage::zeroed(0x1000, 0x100), AnalysisOpt::default());
    let id = anal.analyze_function(0x1000, XrefKind::Call).unwrap();
    assert_eq!(
        anal.catalog().get(id).unwrap().kind,
        crate::FunctionKind::Interrupt
    );
}

#[test]
fn code_reference_discovers_a_location() {
    let mut isa = ScriptedIsa::new();
    isa.seq(0x1000, [op(OpKind::Ret, 1)]);
    let mut anal = analyzer(isa, FlatImage::zeroed(0x1000, 0x100), AnalysisOpt::default());
    let id = anal.analyze_function(0x1000, XrefKind::Code).unwrap();
    assert_eq!(
        anal.catalog().get(id).unwrap().kind,
        crate::FunctionKind::Location
    );
}

#[test]
fn cancellation_stops_promptly_and_keeps_partials() {
    let mut isa = ScriptedIsa::new();
    isa.seq(0x1000, [op(OpKind::Ret, 1)]);
    let mut anal = analyzer(isa, FlatImage::zeroed(0x1000, 0x100), AnalysisOpt::default());
    anal.cancel_handle().store(true, std::sync::atomic::Ordering::Relaxed);
    let id = anal.analyze_function(0x1000, XrefKind::Call).unwrap();
    assert!(anal.catalog().get(id).unwrap().bbs.is_empty());
}

#[test]
fn endsize_trims_far_blocks_and_dangling_code_refs() {
    let mut isa = ScriptedIsa::new();
    isa.seq(0x1000, [op(OpKind::Jmp, 2).with_jump(0x1800)]);
    isa.put(op(OpKind::Ret, 1).at(0x1800));
    let mut anal = analyzer(isa, FlatImage::zeroed(0x1000, 0x1000), AnalysisOpt::default());
    let id = anal.analyze_function(0x1000, XrefKind::Call).unwrap();
    let f = anal.catalog().get(id).unwrap();
    // The far block fell outside the contiguous run.
    assert_eq!(f.size(), 2);
    assert!(f.bbs.iter().all(|b| b.addr == 0x1000));
    assert!(
        !anal
            .xrefs()
            .of_kind(XrefKind::Code)
            .iter()
            .any(|r| r.from == 0x1000 && r.to == 0x1800),
        "dangling jump ref was trimmed"
    );
}

#[test]
fn add_block_appends_on_non_x86() {
    let mut isa = ScriptedIsa::new();
    isa.seq(0x1000, [op(OpKind::Ret, 4)]);
    let opt = AnalysisOpt {
        arch: Arch::Arm,
        ..AnalysisOpt::default()
    };
    let mut anal = analyzer(isa, FlatImage::zeroed(0x1000, 0x100), opt);
    let id = anal.analyze_function(0x1000, XrefKind::Call).unwrap();
    assert!(anal.add_block(id, 0x1010, 8, Some(0x1000), None, BlockKind::empty()));
    let f = anal.catalog().get(id).unwrap();
    let bb = f.bbs.iter().find(|b| b.addr == 0x1010).unwrap();
    assert_eq!(bb.size, 8);
    assert_eq!(bb.jump, Some(0x1000));
    assert_eq!(f.size(), 0x18, "extent grew to cover the new block");
}

#[test]
fn add_block_rejects_degenerate_sizes() {
    let mut isa = ScriptedIsa::new();
    isa.seq(0x1000, [op(OpKind::Ret, 4)]);
    let mut anal = analyzer(isa, FlatImage::zeroed(0x1000, 0x100), AnalysisOpt::default());
    let id = anal.analyze_function(0x1000, XrefKind::Call).unwrap();
    assert!(!anal.add_block(id, 0x1010, 0, None, None, BlockKind::empty()));
    let huge = anal.opt().bb_max_size + 1;
    assert!(!anal.add_block(id, 0x1010, huge, None, None, BlockKind::empty()));
}

#[test]
fn add_block_shrinks_a_straddling_block() {
    let mut isa = ScriptedIsa::new();
    isa.seq(0x1000, [op(OpKind::Ret, 8)]);
    isa.put(op(OpKind::Ret, 4).at(0x1004));
    let mut anal = analyzer(isa, FlatImage::zeroed(0x1000, 0x100), AnalysisOpt::default());
    let id = anal.analyze_function(0x1000, XrefKind::Call).unwrap();
    // 0x1004 lands mid-block: the old block is cut there.
    assert!(anal.add_block(id, 0x1004, 4, None, None, BlockKind::empty()));
    let f = anal.catalog().get(id).unwrap();
    let head = f.bbs.iter().find(|b| b.addr == 0x1000).unwrap();
    assert_eq!(head.size, 4);
    assert!(f.bbs.iter().any(|b| b.addr == 0x1004 && b.size == 4));
}

#[test]
fn extend_function_grows_a_registered_function() {
    let mut isa = ScriptedIsa::new();
    isa.seq(0x1000, [op(OpKind::Ret, 1)]);
    isa.put(op(OpKind::Ret, 1).at(0x1004));
    let mut anal = analyzer(isa, FlatImage::zeroed(0x1000, 0x100), AnalysisOpt::default());
    let id = anal.analyze_function(0x1000, XrefKind::Call).unwrap();
    assert_eq!(anal.extend_function(id, 0x1004), Ok(Outcome::End));
    let f = anal.catalog().get(id).unwrap();
    assert!(f.bbs.iter().any(|b| b.addr == 0x1004));
}

#[test]
fn oversized_function_is_truncated_to_zero() {
    let mut fcn = crate::Function::new(0x1000);
    let bi = fcn.add_block(0x1000);
    fcn.bbs[bi].size = crate::config::MAX_FCN_SIZE + 1;
    let err = TestAnalyzer::fit_function(&mut fcn, bi).unwrap_err();
    assert_eq!(err, RecurseError::Overflow);
    assert_eq!(fcn.size(), 0);
}

#[test]
fn looks_like_function_accepts_a_prologue_pattern() {
    let mut image = FlatImage::zeroed(0x1000, 0x100);
    image.write(0x1000, b"\x55\x48\x89\xe5");
    let mut anal = analyzer(ScriptedIsa::new(), image, AnalysisOpt::default());
    assert!(anal.looks_like_function(0x1000, 0x1000, 0x2000));
}

#[test]
fn looks_like_function_counts_op_mix() {
    let mut isa = ScriptedIsa::new();
    isa.seq(
        0x1000,
        [
            op(OpKind::Push, 1),
            op(OpKind::Push, 1),
            op(OpKind::Push, 1),
            op(OpKind::Mov, 2),
            op(OpKind::Mov, 2),
            op(OpKind::Call, 2).with_jump(0x1040),
            op(OpKind::Mov, 2),
            op(OpKind::Push, 1),
            op(OpKind::Ret, 1),
            op(OpKind::Nop, 1),
        ],
    );
    let mut anal = analyzer(isa, FlatImage::zeroed(0x1000, 0x100), AnalysisOpt::default());
    assert!(anal.looks_like_function(0x1000, 0x1000, 0x2000));
    // A branch leaving [low, high) disqualifies the candidate.
    assert!(!anal.looks_like_function(0x1000, 0x1000, 0x1020));
}
