use pretty_assertions::assert_eq;

use super::*;
use crate::checker::validate;
use crate::test_helpers::{b, count_phis, empty_func, push, term, v};

/// `bb0 -> head <-> body`, `head -> exit`. The header phi is `v1`.
fn loop_with_phi(f: &mut Function, back_input: Reg) -> (BlockId, BlockId, BlockId) {
    let (head, body, exit) = (f.new_block(), f.new_block(), f.new_block());
    f.set_reg_type(v(2), Type::CBOOL);
    push(f, b(0), InstrKind::LoadArg { dst: v(0), idx: 0 });
    push(
        f,
        b(0),
        InstrKind::LoadConst {
            dst: v(2),
            value: HirConst::Bool(true),
        },
    );
    term(f, b(0), InstrKind::Branch { target: head });
    push(
        f,
        head,
        InstrKind::Phi {
            dst: v(1),
            inputs: vec![(b(0), v(0)), (body, back_input)],
        },
    );
    term(
        f,
        head,
        InstrKind::CondBranch {
            cond: v(2),
            if_true: body,
            if_false: exit,
        },
    );
    term(f, exit, InstrKind::Return { value: v(1) });
    (head, body, exit)
}

#[test]
fn self_referencing_phi_is_replaced_by_its_other_input() {
    let mut f = empty_func(3, Type::OBJECT);
    let (_, body, exit) = loop_with_phi(&mut f, v(1));
    term(&mut f, body, InstrKind::Branch { target: b(1) });

    phi_elimination(&mut f);
    assert_eq!(validate(&f), Ok(()));
    assert_eq!(count_phis(&f), 0);
    assert_eq!(f.block(exit).term.kind, InstrKind::Return { value: v(0) });
}

#[test]
fn phi_with_distinct_inputs_stays() {
    let mut f = empty_func(4, Type::OBJECT);
    let (_, body, _) = loop_with_phi(&mut f, v(3));
    push(&mut f, body, InstrKind::LoadArg { dst: v(3), idx: 1 });
    term(&mut f, body, InstrKind::Branch { target: b(1) });

    phi_elimination(&mut f);
    assert_eq!(validate(&f), Ok(()));
    assert_eq!(count_phis(&f), 1);
}

#[test]
fn phi_without_any_outside_value_becomes_null() {
    let mut f = empty_func(2, Type::OBJECT);
    let (head, exit) = (f.new_block(), f.new_block());
    f.set_reg_type(v(0), Type::CBOOL);
    push(
        &mut f,
        b(0),
        InstrKind::LoadConst {
            dst: v(0),
            value: HirConst::Bool(false),
        },
    );
    term(&mut f, b(0), InstrKind::Branch { target: head });
    push(
        &mut f,
        head,
        InstrKind::Phi {
            dst: v(1),
            inputs: vec![(b(0), v(1)), (head, v(1))],
        },
    );
    term(
        &mut f,
        head,
        InstrKind::CondBranch {
            cond: v(0),
            if_true: head,
            if_false: exit,
        },
    );
    term(&mut f, exit, InstrKind::Return { value: v(1) });

    phi_elimination(&mut f);
    assert_eq!(count_phis(&f), 0);
    let InstrKind::Return { value } = f.block(exit).term.kind else {
        panic!("exit no longer returns");
    };
    assert_eq!(f.reg_type(value), Type::NULLPTR);
    assert_eq!(
        f.block(b(0)).instrs[0].kind,
        InstrKind::LoadConst {
            dst: value,
            value: HirConst::Nullptr,
        }
    );
}

#[test]
fn copies_are_forwarded() {
    let mut f = empty_func(3, Type::OBJECT);
    push(&mut f, b(0), InstrKind::LoadArg { dst: v(0), idx: 0 });
    push(&mut f, b(0), InstrKind::Assign { dst: v(1), src: v(0) });
    push(&mut f, b(0), InstrKind::Assign { dst: v(2), src: v(1) });
    term(&mut f, b(0), InstrKind::Return { value: v(2) });

    assert_eq!(copy_propagation(&mut f), 2);
    assert_eq!(f.block(b(0)).instrs.len(), 1);
    assert_eq!(f.block(b(0)).term.kind, InstrKind::Return { value: v(0) });
}
