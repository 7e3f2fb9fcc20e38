use pretty_assertions::assert_eq;

use super::*;
use crate::checker::validate;
use crate::instr::Opcode;
use crate::test_helpers::{b, count, count_loop, count_phis, empty_func, push, term, v, Fixture};

#[test]
fn loop_variable_gets_a_header_phi() {
    let mut fx = Fixture::new();
    let (_, mut func) = fx.build(count_loop());
    assert!(count(&func, Opcode::Assign) > 0);

    ssaify(&mut func);
    assert_eq!(count(&func, Opcode::Assign), 0);
    assert!(count_phis(&func) >= 1);
    assert_eq!(validate(&func), Ok(()));
}

#[test]
fn straight_line_code_needs_no_phis() {
    let mut fx = Fixture::new();
    let (_, mut func) = fx.build(crate::test_helpers::add_args());
    ssaify(&mut func);
    assert_eq!(count_phis(&func), 0);
    assert_eq!(count(&func, Opcode::Assign), 0);
    assert_eq!(validate(&func), Ok(()));
}

#[test]
fn path_without_definition_reads_null() {
    // bb0: v2 = true; CondBranch v2 -> bb1, bb2
    // bb1: v1 = v0; Branch bb3
    // bb2: Branch bb3
    // bb3: Return v1
    let mut f = empty_func(3, Type::OBJECT);
    for _ in 0..3 {
        f.new_block();
    }
    f.set_reg_type(v(2), Type::CBOOL);
    push(&mut f, b(0), InstrKind::LoadArg { dst: v(0), idx: 0 });
    push(&mut f, b(0), InstrKind::LoadConst { dst: v(2), value: HirConst::Bool(true) });
    term(&mut f, b(0), InstrKind::CondBranch { cond: v(2), if_true: b(1), if_false: b(2) });
    push(&mut f, b(1), InstrKind::Assign { dst: v(1), src: v(0) });
    term(&mut f, b(1), InstrKind::Branch { target: b(3) });
    term(&mut f, b(2), InstrKind::Branch { target: b(3) });
    term(&mut f, b(3), InstrKind::Return { value: v(1) });

    ssaify(&mut f);

    let undef = match f.block(b(0)).instrs[0].kind {
        InstrKind::LoadConst { dst, value: HirConst::Nullptr } => dst,
        ref other => panic!("expected undef load at entry, got {other:?}"),
    };
    let InstrKind::Phi { dst, inputs } = &f.block(b(3)).instrs[0].kind else {
        panic!("expected a phi at the join");
    };
    assert!(inputs.contains(&(b(1), v(0))));
    assert!(inputs.contains(&(b(2), undef)));
    assert!(f.reg_type(*dst).maybe_null());
    assert_eq!(validate(&f), Ok(()));
}

#[test]
fn functions_without_variables_are_untouched() {
    let mut f = empty_func(1, Type::OBJECT);
    push(&mut f, b(0), InstrKind::LoadArg { dst: v(0), idx: 0 });
    term(&mut f, b(0), InstrKind::Return { value: v(0) });
    let before = crate::printer::print_function(&f);
    ssaify(&mut f);
    assert_eq!(crate::printer::print_function(&f), before);
}
