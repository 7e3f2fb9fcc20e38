use kiln_rt::{BinOp, CodeBuilder, ObjKind};
use pretty_assertions::assert_eq;

use super::*;
use crate::checker::{validate, CheckError};
use crate::passes::ssaify;
use crate::instr::Opcode;
use crate::test_helpers::{add_args, count, count_loop, Fixture};

fn entry_ops(func: &Function) -> Vec<Opcode> {
    func.block(func.entry).instrs.iter().map(Instr::opcode).collect()
}

fn find(func: &Function, op: Opcode) -> Option<&Instr> {
    func.blocks()
        .flat_map(|bl| bl.all_instrs())
        .find(|i| i.opcode() == op)
}

#[test]
fn prologue_loads_arguments_into_locals() {
    let mut fx = Fixture::new();
    let (_, func) = fx.build(add_args());
    assert_eq!(
        entry_ops(&func),
        vec![Opcode::LoadArg, Opcode::LoadArg, Opcode::Assign, Opcode::Assign]
    );
    assert_eq!(func.block(func.entry).term.opcode(), Opcode::Branch);
    assert_eq!(validate(&func), Ok(()));
}

#[test]
fn non_argument_locals_start_null() {
    let mut fx = Fixture::new();
    let (_, func) = fx.build(count_loop());
    assert_eq!(
        entry_ops(&func),
        vec![Opcode::LoadArg, Opcode::Assign, Opcode::LoadConst, Opcode::Assign]
    );
}

#[test]
fn primitive_arguments_are_boxed_on_entry() {
    let mut fx = Fixture::new();
    let code = CodeBuilder::new("f")
        .typed_arg("n", ArgAnnotation::Int64)
        .load_fast("n")
        .ret()
        .build();
    let (_, func) = fx.build(code);
    assert_eq!(func.arg_types, vec![Type::CINT64]);
    let load = find(&func, Opcode::LoadArg);
    assert_eq!(load.and_then(Instr::output).map(|r| func.reg_type(r)), Some(Type::CINT64));
    assert_eq!(count(&func, Opcode::PrimitiveBox), 1);
}

#[test]
fn annotated_arguments_are_guarded() {
    let mut fx = Fixture::new();
    let code = CodeBuilder::new("f")
        .typed_arg("s", ArgAnnotation::Kind(ObjKind::Str))
        .load_fast("s")
        .ret()
        .build();
    let (_, func) = fx.build(code);
    let Some(guard) = find(&func, Opcode::GuardType) else {
        panic!("no argument guard");
    };
    let InstrKind::GuardType { src, ty, .. } = guard.kind else {
        unreachable!()
    };
    assert_eq!(ty, Type::STR);
    let deopt = guard.deopt.as_deref();
    assert_eq!(deopt.and_then(|d| d.guilty), Some(src));
    assert_eq!(deopt.map(|d| d.frame.next_offset), Some(0));
}

#[test]
fn local_reads_are_checked_and_resume_at_their_own_offset() {
    let mut fx = Fixture::new();
    let (_, func) = fx.build(add_args());
    let checks: Vec<&Instr> = func
        .blocks()
        .flat_map(|bl| bl.instrs.iter())
        .filter(|i| i.opcode() == Opcode::CheckVar)
        .collect();
    assert_eq!(checks.len(), 2);
    let offsets: Vec<u32> = checks
        .iter()
        .filter_map(|i| i.deopt.as_ref().map(|d| d.frame.next_offset))
        .collect();
    assert_eq!(offsets, vec![0, 1]);
    // The second read sees the first value on the stack.
    assert_eq!(checks[1].deopt.as_ref().map(|d| d.frame.stack.len()), Some(1));
}

#[test]
fn builtin_global_is_watched() {
    let mut fx = Fixture::new();
    let code = CodeBuilder::new("f").load_global("len").ret().build();
    let (pre, func) = fx.build(code);
    assert_eq!(count(&func, Opcode::DeoptPatchpoint), 1);
    assert_eq!(count(&func, Opcode::LoadGlobalCached), 1);
    let Some(guard) = find(&func, Opcode::GuardIs) else {
        panic!("no identity guard");
    };
    let value = pre.global(Name::new("len")).map(|g| g.value);
    assert!(matches!(guard.kind, InstrKind::GuardIs { target, .. } if Some(target) == value));
}

#[test]
fn module_global_is_not_watched() {
    let mut fx = Fixture::new();
    fx.define(add_args());
    let code = CodeBuilder::new("f").load_global("add").ret().build();
    let (_, func) = fx.build(code);
    assert_eq!(count(&func, Opcode::DeoptPatchpoint), 0);
    assert_eq!(count(&func, Opcode::GuardIs), 1);
}

#[test]
fn unknown_global_falls_back_to_a_lookup() {
    let mut fx = Fixture::new();
    let code = CodeBuilder::new("f").load_global("later").ret().build();
    let (_, func) = fx.build(code);
    assert_eq!(count(&func, Opcode::LoadGlobal), 1);
    assert_eq!(count(&func, Opcode::LoadGlobalCached), 0);
}

#[test]
fn method_calls_push_a_null_self_slot() {
    let mut fx = Fixture::new();
    let code = CodeBuilder::new("f")
        .arg("s")
        .load_fast("s")
        .load_method("upper")
        .call_method(0)
        .ret()
        .build();
    let (_, func) = fx.build(code);
    let Some(call) = find(&func, Opcode::CallMethod) else {
        panic!("no method call");
    };
    let InstrKind::CallMethod { self_or_null, .. } = call.kind else {
        unreachable!()
    };
    assert_eq!(func.reg_type(self_or_null), Type::NULLPTR);
}

#[test]
fn branches_test_truthiness() {
    let mut fx = Fixture::new();
    let (_, mut func) = fx.build(count_loop());
    assert_eq!(count(&func, Opcode::CondBranch), 1);
    let Some(truthy) = find(&func, Opcode::IsTruthy) else {
        panic!("no truthiness test");
    };
    // The interpreter re-executes the jump with the condition on the stack.
    assert_eq!(truthy.deopt.as_ref().map(|d| d.frame.stack.len()), Some(1));

    // Loop locals are reassigned until SSA construction renames them.
    assert!(matches!(validate(&func), Err(CheckError::Redefined { .. })));
    ssaify(&mut func);
    assert_eq!(validate(&func), Ok(()));
}

#[test]
fn primitive_return_is_unboxed() {
    let mut fx = Fixture::new();
    let code = CodeBuilder::new("f")
        .typed_arg("a", ArgAnnotation::Int64)
        .returns(ArgAnnotation::Int64)
        .load_fast("a")
        .load_int(1)
        .binary(BinOp::Add)
        .ret()
        .build();
    let (_, func) = fx.build(code);
    assert_eq!(func.return_type, Type::CINT64);
    let ret = func.blocks().find_map(|bl| match bl.term.kind {
        InstrKind::Return { value } => Some(value),
        _ => None,
    });
    assert_eq!(ret.map(|r| func.reg_type(r)), Some(Type::CINT64));
    assert_eq!(count(&func, Opcode::PrimitiveUnbox), 1);
}

#[test]
fn raise_carries_a_frame_state() {
    let mut fx = Fixture::new();
    let code = CodeBuilder::new("f").arg("e").load_fast("e").raise().build();
    let (_, func) = fx.build(code);
    let raise = func.blocks().find(|bl| bl.term.opcode() == Opcode::Raise);
    assert!(raise.is_some_and(|bl| bl.term.deopt.is_some()));
}

#[test]
fn generators_and_cells_are_rejected() {
    let mut fx = Fixture::new();
    let gen = fx.define(CodeBuilder::new("g").generator().load_none().ret().build());
    let pre = fx.preload(gen);
    assert_eq!(build_hir(&pre).err(), Some(BuildError::Generator(Name::new("g"))));

    let cells = fx.define(CodeBuilder::new("c").cellvar("x").load_none().ret().build());
    let pre = fx.preload(cells);
    assert_eq!(build_hir(&pre).err(), Some(BuildError::CellVars(Name::new("c"))));
}
