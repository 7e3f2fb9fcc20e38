use pretty_assertions::assert_eq;

use super::*;
use crate::instr::{FrameState, HirConst, Opcode};
use crate::test_helpers::{b, empty_func, push, term, v};

#[test]
fn removed_blocks_leave_holes() {
    let mut f = empty_func(0, Type::OBJECT);
    let b1 = f.new_block();
    let b2 = f.new_block();
    assert_eq!(f.remove_block(b1).map(|bl| bl.id), Some(b1));
    assert!(!f.has_block(b1));
    assert_eq!(f.block_ids(), vec![b(0), b2]);
    assert_eq!(f.num_blocks(), 2);
    assert_eq!(f.block_capacity(), 3);
    assert!(f.remove_block(b1).is_none());
}

#[test]
fn split_block_moves_tail_and_rewires_phis() {
    let mut f = empty_func(3, Type::OBJECT);
    let join = f.new_block();
    push(&mut f, b(0), InstrKind::LoadConst { dst: v(0), value: HirConst::Nullptr });
    push(&mut f, b(0), InstrKind::Assign { dst: v(1), src: v(0) });
    term(&mut f, b(0), InstrKind::Branch { target: join });
    push(&mut f, join, InstrKind::Phi { dst: v(2), inputs: vec![(b(0), v(1))] });
    term(&mut f, join, InstrKind::Return { value: v(2) });

    let tail = f.split_block(b(0), 1);
    assert_eq!(f.block(b(0)).instrs.len(), 1);
    assert_eq!(f.block(b(0)).term.opcode(), Opcode::Unreachable);
    assert_eq!(f.block(tail).instrs.len(), 1);
    assert_eq!(f.block(tail).successors().as_slice(), &[join]);
    let InstrKind::Phi { inputs, .. } = &f.block(join).instrs[0].kind else {
        panic!("expected phi");
    };
    assert_eq!(inputs.as_slice(), &[(tail, v(1))]);
}

#[test]
fn replace_uses_follows_chains_into_frames() {
    let mut f = empty_func(4, Type::OBJECT);
    let mut frame = FrameState::new(Arc::clone(&f.code), None);
    frame.stack.push(v(0));
    f.push(
        b(0),
        Instr::new(InstrKind::IsTruthy { dst: v(3), src: v(0) }).with_deopt(frame),
    );
    term(&mut f, b(0), InstrKind::Return { value: v(0) });

    let mut subst = FxHashMap::default();
    subst.insert(v(0), v(1));
    subst.insert(v(1), v(2));
    f.replace_uses(&subst);

    let instr = &f.block(b(0)).instrs[0];
    assert_eq!(instr.kind.operands().as_slice(), &[v(2)]);
    assert_eq!(instr.deopt.as_ref().map(|d| d.frame.stack.clone()), Some(vec![v(2)]));
    assert_eq!(f.block(b(0)).term.kind.operands().as_slice(), &[v(2)]);
}

#[test]
fn use_counts_include_deopt_metadata() {
    let mut f = empty_func(2, Type::OBJECT);
    let mut frame = FrameState::new(Arc::clone(&f.code), None);
    frame.stack = vec![v(0), v(0)];
    f.push(
        b(0),
        Instr::new(InstrKind::IsTruthy { dst: v(1), src: v(0) }).with_deopt(frame),
    );
    term(&mut f, b(0), InstrKind::Return { value: v(0) });
    assert_eq!(f.use_counts(), vec![4, 0]);
}

#[test]
fn constants_are_deduplicated() {
    let mut f = empty_func(0, Type::OBJECT);
    let before = f.consts.len() as u32;
    let a = f.add_const(ConstValue::Int(7));
    let c = f.add_const(ConstValue::Str("x".into()));
    assert_eq!(f.add_const(ConstValue::Int(7)), a);
    assert_eq!((a, c), (before, before + 1));
}

#[test]
fn inline_failures_are_tallied() {
    let mut stats = InlineStats::default();
    stats.record_failure(InlineFailure::IsGenerator);
    stats.record_failure(InlineFailure::IsGenerator);
    stats.record_failure(InlineFailure::NotPreloaded);
    assert_eq!(stats.failures.get(&InlineFailure::IsGenerator), Some(&2));
    assert_eq!(stats.failures.get(&InlineFailure::NotPreloaded), Some(&1));
    assert_eq!(InlineFailure::IsGenerator.describe(), "callee is a generator");
}
