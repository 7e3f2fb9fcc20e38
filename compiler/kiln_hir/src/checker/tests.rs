use pretty_assertions::assert_eq;

use super::*;
use crate::instr::{HirConst, Instr};
use crate::test_helpers::{b, empty_func, push, term, v};

fn cbool(f: &mut Function, block: BlockId, dst: u32) {
    f.set_reg_type(v(dst), Type::CBOOL);
    push(
        f,
        block,
        InstrKind::LoadConst {
            dst: v(dst),
            value: HirConst::Bool(true),
        },
    );
}

#[test]
fn well_formed_diamond_passes() {
    let mut f = empty_func(4, Type::OBJECT);
    let (l, r, join) = (f.new_block(), f.new_block(), f.new_block());
    cbool(&mut f, b(0), 0);
    term(
        &mut f,
        b(0),
        InstrKind::CondBranch {
            cond: v(0),
            if_true: l,
            if_false: r,
        },
    );
    push(&mut f, l, InstrKind::LoadArg { dst: v(1), idx: 0 });
    term(&mut f, l, InstrKind::Branch { target: join });
    push(&mut f, r, InstrKind::LoadArg { dst: v(2), idx: 1 });
    term(&mut f, r, InstrKind::Branch { target: join });
    push(
        &mut f,
        join,
        InstrKind::Phi {
            dst: v(3),
            inputs: vec![(l, v(1)), (r, v(2))],
        },
    );
    term(&mut f, join, InstrKind::Return { value: v(3) });
    assert_eq!(validate(&f), Ok(()));
}

#[test]
fn use_before_definition_is_reported() {
    let mut f = empty_func(2, Type::OBJECT);
    push(&mut f, b(0), InstrKind::Assign { dst: v(1), src: v(0) });
    push(&mut f, b(0), InstrKind::LoadArg { dst: v(0), idx: 0 });
    term(&mut f, b(0), InstrKind::Return { value: v(1) });
    assert_eq!(
        validate(&f),
        Err(CheckError::NotDominated {
            block: b(0),
            reg: v(0)
        })
    );
}

#[test]
fn definition_in_one_arm_does_not_dominate_the_join() {
    let mut f = empty_func(2, Type::OBJECT);
    let (l, r, join) = (f.new_block(), f.new_block(), f.new_block());
    cbool(&mut f, b(0), 0);
    term(
        &mut f,
        b(0),
        InstrKind::CondBranch {
            cond: v(0),
            if_true: l,
            if_false: r,
        },
    );
    push(&mut f, l, InstrKind::LoadArg { dst: v(1), idx: 0 });
    term(&mut f, l, InstrKind::Branch { target: join });
    term(&mut f, r, InstrKind::Branch { target: join });
    term(&mut f, join, InstrKind::Return { value: v(1) });
    assert_eq!(
        validate(&f),
        Err(CheckError::NotDominated {
            block: join,
            reg: v(1)
        })
    );
}

#[test]
fn double_definition_is_reported() {
    let mut f = empty_func(1, Type::OBJECT);
    push(&mut f, b(0), InstrKind::LoadArg { dst: v(0), idx: 0 });
    push(&mut f, b(0), InstrKind::LoadArg { dst: v(0), idx: 1 });
    term(&mut f, b(0), InstrKind::Return { value: v(0) });
    assert_eq!(validate(&f), Err(CheckError::Redefined { reg: v(0) }));
}

#[test]
fn undefined_register_is_reported() {
    let mut f = empty_func(2, Type::OBJECT);
    term(&mut f, b(0), InstrKind::Return { value: v(1) });
    assert_eq!(
        validate(&f),
        Err(CheckError::Undefined {
            block: b(0),
            reg: v(1)
        })
    );
}

#[test]
fn phi_inputs_must_match_predecessors() {
    let mut f = empty_func(2, Type::OBJECT);
    let next = f.new_block();
    push(&mut f, b(0), InstrKind::LoadArg { dst: v(0), idx: 0 });
    term(&mut f, b(0), InstrKind::Branch { target: next });
    push(
        &mut f,
        next,
        InstrKind::Phi {
            dst: v(1),
            inputs: vec![(b(0), v(0)), (b(0), v(0))],
        },
    );
    term(&mut f, next, InstrKind::Return { value: v(1) });
    assert_eq!(
        validate(&f),
        Err(CheckError::PhiInputs {
            block: next,
            reg: v(1)
        })
    );
}

#[test]
fn phis_must_lead_their_block() {
    let mut f = empty_func(3, Type::OBJECT);
    let next = f.new_block();
    push(&mut f, b(0), InstrKind::LoadArg { dst: v(0), idx: 0 });
    term(&mut f, b(0), InstrKind::Branch { target: next });
    push(&mut f, next, InstrKind::Assign { dst: v(2), src: v(0) });
    push(
        &mut f,
        next,
        InstrKind::Phi {
            dst: v(1),
            inputs: vec![(b(0), v(0))],
        },
    );
    term(&mut f, next, InstrKind::Return { value: v(1) });
    assert_eq!(
        validate(&f),
        Err(CheckError::PhiNotLeading {
            block: next,
            reg: v(1)
        })
    );
}

#[test]
fn misplaced_terminators_are_reported() {
    let mut f = empty_func(1, Type::OBJECT);
    push(&mut f, b(0), InstrKind::LoadArg { dst: v(0), idx: 0 });
    f.block_mut(b(0)).term = Instr::new(InstrKind::Assign { dst: v(0), src: v(0) });
    assert_eq!(
        validate(&f),
        Err(CheckError::NotATerminator {
            block: b(0),
            op: "Assign"
        })
    );

    let mut f = empty_func(1, Type::OBJECT);
    f.block_mut(b(0)).instrs.push(Instr::new(InstrKind::Deopt));
    term(&mut f, b(0), InstrKind::Unreachable);
    assert_eq!(
        validate(&f),
        Err(CheckError::TerminatorInBody {
            block: b(0),
            op: "Deopt"
        })
    );
}

#[test]
fn branch_to_removed_block_is_reported() {
    let mut f = empty_func(0, Type::OBJECT);
    let gone = f.new_block();
    term(&mut f, gone, InstrKind::Unreachable);
    term(&mut f, b(0), InstrKind::Branch { target: gone });
    f.remove_block(gone);
    assert_eq!(
        validate(&f),
        Err(CheckError::MissingBlock {
            block: b(0),
            target: gone
        })
    );
}

#[test]
fn unreachable_blocks_are_not_checked_for_dominance() {
    let mut f = empty_func(1, Type::OBJECT);
    let dead = f.new_block();
    push(&mut f, b(0), InstrKind::LoadArg { dst: v(0), idx: 0 });
    term(&mut f, b(0), InstrKind::Return { value: v(0) });
    term(&mut f, dead, InstrKind::Return { value: v(0) });
    assert_eq!(validate(&f), Ok(()));
}

#[test]
#[should_panic(expected = "widened")]
fn widening_a_type_is_caught() {
    let mut f = empty_func(1, Type::LONG);
    let before = f.reg_types();
    f.set_reg_type(v(0), Type::OBJECT);
    check_type_monotonic(&before, &f);
}
