use pretty_assertions::assert_eq;

use super::*;
use crate::instr::{FrameState, HirConst, Instr};
use crate::test_helpers::{b, empty_func, push, term, v};
use crate::types::Type;

fn set(regs: &[Reg]) -> LiveSet {
    regs.iter().copied().collect()
}

#[test]
fn straight_line() {
    let mut f = empty_func(3, Type::OBJECT);
    let next = f.new_block();
    push(&mut f, b(0), InstrKind::LoadConst { dst: v(0), value: HirConst::Int64(1) });
    push(&mut f, b(0), InstrKind::LoadConst { dst: v(1), value: HirConst::Int64(2) });
    term(&mut f, b(0), InstrKind::Branch { target: next });
    push(&mut f, next, InstrKind::MakeTuple { dst: v(2), items: vec![v(0)] });
    term(&mut f, next, InstrKind::Return { value: v(2) });

    let live = compute_liveness(&f);
    assert_eq!(live.live_out(b(0)), &set(&[v(0)]));
    assert_eq!(live.live_in(next), &set(&[v(0)]));
    assert!(live.live_in(b(0)).is_empty());
}

#[test]
fn phi_inputs_live_out_of_their_predecessor_only() {
    let mut f = empty_func(4, Type::OBJECT);
    let left = f.new_block();
    let right = f.new_block();
    let join = f.new_block();
    push(&mut f, b(0), InstrKind::LoadConst { dst: v(3), value: HirConst::Bool(true) });
    term(&mut f, b(0), InstrKind::CondBranch { cond: v(3), if_true: left, if_false: right });
    push(&mut f, left, InstrKind::LoadConst { dst: v(0), value: HirConst::Int64(1) });
    term(&mut f, left, InstrKind::Branch { target: join });
    push(&mut f, right, InstrKind::LoadConst { dst: v(1), value: HirConst::Int64(2) });
    term(&mut f, right, InstrKind::Branch { target: join });
    push(&mut f, join, InstrKind::Phi { dst: v(2), inputs: vec![(left, v(0)), (right, v(1))] });
    term(&mut f, join, InstrKind::Return { value: v(2) });

    let live = compute_liveness(&f);
    assert_eq!(live.live_out(left), &set(&[v(0)]));
    assert_eq!(live.live_out(right), &set(&[v(1)]));
    assert!(live.live_in(join).is_empty());
}

#[test]
fn loop_carried_values_stay_live_around_the_back_edge() {
    let mut f = empty_func(3, Type::OBJECT);
    let header = f.new_block();
    let body = f.new_block();
    let exit = f.new_block();
    push(&mut f, b(0), InstrKind::LoadConst { dst: v(0), value: HirConst::Int64(0) });
    push(&mut f, b(0), InstrKind::LoadConst { dst: v(1), value: HirConst::Bool(true) });
    term(&mut f, b(0), InstrKind::Branch { target: header });
    term(&mut f, header, InstrKind::CondBranch { cond: v(1), if_true: body, if_false: exit });
    push(&mut f, body, InstrKind::MakeTuple { dst: v(2), items: vec![v(0)] });
    term(&mut f, body, InstrKind::Branch { target: header });
    term(&mut f, exit, InstrKind::Return { value: v(0) });

    let live = compute_liveness(&f);
    assert_eq!(live.live_in(header), &set(&[v(0), v(1)]));
    assert_eq!(live.live_out(body), &set(&[v(0), v(1)]));
    assert_eq!(live.live_in(exit), &set(&[v(0)]));
}

#[test]
fn frame_state_registers_are_uses() {
    let mut f = empty_func(3, Type::OBJECT);
    let next = f.new_block();
    push(&mut f, b(0), InstrKind::LoadConst { dst: v(0), value: HirConst::Int64(1) });
    term(&mut f, b(0), InstrKind::Branch { target: next });
    let mut frame = FrameState::new(std::sync::Arc::clone(&f.code), None);
    frame.stack.push(v(0));
    f.set_term(next, Instr::new(InstrKind::Deopt).with_deopt(frame));

    let live = compute_liveness(&f);
    assert_eq!(live.live_in(next), &set(&[v(0)]));
}

#[test]
fn filtered_liveness_ignores_untracked_registers() {
    let mut f = empty_func(2, Type::OBJECT);
    let next = f.new_block();
    push(&mut f, b(0), InstrKind::LoadConst { dst: v(0), value: HirConst::Int64(1) });
    push(&mut f, b(0), InstrKind::LoadConst { dst: v(1), value: HirConst::Int64(2) });
    term(&mut f, b(0), InstrKind::Branch { target: next });
    push(&mut f, next, InstrKind::MakeTuple { dst: v(1), items: vec![v(0), v(1)] });
    term(&mut f, next, InstrKind::Return { value: v(1) });

    let live = compute_liveness_filtered(&f, |r| r == v(0));
    assert_eq!(live.live_in(next), &set(&[v(0)]));
}
