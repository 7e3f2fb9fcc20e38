use pretty_assertions::assert_eq;

use super::*;
use crate::checker::validate;
use crate::instr::HirConst;
use crate::types::Type;
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
fn same_target_branch_collapses_into_one_block() {
    let mut f = empty_func(2, Type::OBJECT);
    let next = f.new_block();
    cbool(&mut f, b(0), 0);
    term(
        &mut f,
        b(0),
        InstrKind::CondBranch {
            cond: v(0),
            if_true: next,
            if_false: next,
        },
    );
    push(&mut f, next, InstrKind::LoadArg { dst: v(1), idx: 0 });
    term(&mut f, next, InstrKind::Return { value: v(1) });

    clean_cfg(&mut f);
    assert_eq!(f.num_blocks(), 1);
    assert_eq!(f.block(b(0)).instrs.len(), 2);
    assert_eq!(f.block(b(0)).term.kind, InstrKind::Return { value: v(1) });
}

#[test]
fn unreachable_blocks_are_removed() {
    let mut f = empty_func(1, Type::OBJECT);
    let dead = f.new_block();
    push(&mut f, b(0), InstrKind::LoadArg { dst: v(0), idx: 0 });
    term(&mut f, b(0), InstrKind::Return { value: v(0) });
    term(&mut f, dead, InstrKind::Return { value: v(0) });

    clean_cfg(&mut f);
    assert!(!f.has_block(dead));
    assert_eq!(f.num_blocks(), 1);
}

#[test]
fn absorbed_block_forwards_its_single_input_phis() {
    let mut f = empty_func(2, Type::OBJECT);
    let (hop, tail) = (f.new_block(), f.new_block());
    push(&mut f, b(0), InstrKind::LoadArg { dst: v(0), idx: 0 });
    term(&mut f, b(0), InstrKind::Branch { target: hop });
    term(&mut f, hop, InstrKind::Branch { target: tail });
    push(
        &mut f,
        tail,
        InstrKind::Phi {
            dst: v(1),
            inputs: vec![(hop, v(0))],
        },
    );
    term(&mut f, tail, InstrKind::Return { value: v(1) });

    clean_cfg(&mut f);
    assert_eq!(validate(&f), Ok(()));
    assert_eq!(f.num_blocks(), 1);
    assert_eq!(f.block(b(0)).term.kind, InstrKind::Return { value: v(0) });
    assert_eq!(f.block(b(0)).num_phis(), 0);
}

#[test]
fn trampoline_into_a_join_is_bypassed() {
    let mut f = empty_func(4, Type::OBJECT);
    let (hop, side, join) = (f.new_block(), f.new_block(), f.new_block());
    push(&mut f, b(0), InstrKind::LoadArg { dst: v(0), idx: 0 });
    cbool(&mut f, b(0), 3);
    term(
        &mut f,
        b(0),
        InstrKind::CondBranch {
            cond: v(3),
            if_true: hop,
            if_false: side,
        },
    );
    term(&mut f, hop, InstrKind::Branch { target: join });
    push(&mut f, side, InstrKind::LoadArg { dst: v(1), idx: 1 });
    term(&mut f, side, InstrKind::Branch { target: join });
    push(
        &mut f,
        join,
        InstrKind::Phi {
            dst: v(2),
            inputs: vec![(hop, v(0)), (side, v(1))],
        },
    );
    term(&mut f, join, InstrKind::Return { value: v(2) });

    clean_cfg(&mut f);
    assert_eq!(validate(&f), Ok(()));
    assert!(!f.has_block(hop));
    assert_eq!(f.num_blocks(), 3);
    assert_eq!(
        f.block(join).instrs[0].kind,
        InstrKind::Phi {
            dst: v(2),
            inputs: vec![(b(0), v(0)), (side, v(1))],
        }
    );
}

#[test]
fn loops_survive_cleanup() {
    let mut f = empty_func(2, Type::OBJECT);
    let (head, body, exit) = (f.new_block(), f.new_block(), f.new_block());
    push(&mut f, b(0), InstrKind::LoadArg { dst: v(0), idx: 0 });
    term(&mut f, b(0), InstrKind::Branch { target: head });
    cbool(&mut f, head, 1);
    term(
        &mut f,
        head,
        InstrKind::CondBranch {
            cond: v(1),
            if_true: body,
            if_false: exit,
        },
    );
    term(&mut f, body, InstrKind::Branch { target: head });
    term(&mut f, exit, InstrKind::Return { value: v(0) });

    clean_cfg(&mut f);
    assert_eq!(validate(&f), Ok(()));
    let back_edge = f
        .blocks()
        .any(|bl| bl.successors().iter().any(|&s| s == bl.id));
    assert!(back_edge, "loop lost:\n{}", crate::printer::print_function(&f));
}
