use std::sync::Arc;

use kiln_rt::{CodeBuilder, ObjKind};
use pretty_assertions::assert_eq;

use super::*;
use crate::checker::validate;
use crate::instr::{FrameState, Opcode};
use crate::passes::{ssaify, PassConfig};
use crate::preload::{Preloader, PreloaderMap};
use crate::printer::print_function;
use crate::test_helpers::{b, count, empty_func, term, v, Fixture};

fn run(func: &mut Function, pre: &Preloader) {
    let callees = PreloaderMap::default();
    let config = PassConfig::default();
    let cx = PassContext {
        pre,
        callees: &callees,
        config: &config,
    };
    simplify(func, &cx);
}

fn simplified(fx: &mut Fixture, code: Arc<kiln_rt::CodeUnit>) -> Function {
    let (pre, mut func) = fx.build(code);
    ssaify(&mut func);
    run(&mut func, &pre);
    assert_eq!(validate(&func), Ok(()));
    func
}

fn returned_type(func: &Function) -> Type {
    let value = func
        .blocks()
        .find_map(|bl| match bl.term.kind {
            InstrKind::Return { value } => Some(value),
            _ => None,
        })
        .unwrap_or_else(|| panic!("no return in\n{}", print_function(func)));
    func.reg_type(value)
}

#[test]
fn constant_int_arithmetic_folds() {
    let mut fx = Fixture::new();
    let code = CodeBuilder::new("f")
        .load_int(2)
        .load_int(3)
        .binary(BinOp::Add)
        .ret()
        .build();
    let func = simplified(&mut fx, code);
    assert_eq!(count(&func, Opcode::BinaryOp), 0);
    assert_eq!(returned_type(&func), Type::long_const(5));
}

#[test]
fn division_by_zero_is_left_to_run_time() {
    let mut fx = Fixture::new();
    let code = CodeBuilder::new("f")
        .load_int(1)
        .load_int(0)
        .binary(BinOp::FloorDiv)
        .ret()
        .build();
    let func = simplified(&mut fx, code);
    assert_eq!(count(&func, Opcode::BinaryOp), 1);
}

#[test]
fn int_operands_use_checked_primitive_arithmetic() {
    let mut fx = Fixture::new();
    let code = CodeBuilder::new("f")
        .typed_arg("a", ArgAnnotation::Kind(ObjKind::Int))
        .typed_arg("b", ArgAnnotation::Kind(ObjKind::Int))
        .load_fast("a")
        .load_fast("b")
        .binary(BinOp::Mul)
        .ret()
        .build();
    let func = simplified(&mut fx, code);
    assert_eq!(count(&func, Opcode::BinaryOp), 0);
    assert_eq!(count(&func, Opcode::PrimitiveUnbox), 2);
    assert_eq!(count(&func, Opcode::IntBinaryOp), 1);
    assert_eq!(count(&func, Opcode::PrimitiveBox), 1);
    assert_eq!(returned_type(&func), Type::LONG);
    let checked = func
        .blocks()
        .flat_map(|bl| bl.instrs.iter())
        .find(|i| i.opcode() == Opcode::IntBinaryOp);
    assert!(checked.is_some_and(|i| i.deopt.is_some()));
}

#[test]
fn true_division_of_ints_stays_boxed() {
    let mut fx = Fixture::new();
    let code = CodeBuilder::new("f")
        .typed_arg("a", ArgAnnotation::Kind(ObjKind::Int))
        .typed_arg("b", ArgAnnotation::Kind(ObjKind::Int))
        .load_fast("a")
        .load_fast("b")
        .binary(BinOp::TrueDiv)
        .ret()
        .build();
    let func = simplified(&mut fx, code);
    assert_eq!(count(&func, Opcode::LongBinaryOp), 1);
    assert_eq!(returned_type(&func), Type::FLOAT);
}

#[test]
fn constant_condition_folds_the_branch() {
    let mut fx = Fixture::new();
    let mut cb = CodeBuilder::new("f");
    let other = cb.label();
    let code = cb
        .load_int(1)
        .load_int(2)
        .compare(CmpOp::Lt)
        .pop_jump_if_false(other)
        .load_int(10)
        .ret()
        .bind(other)
        .load_int(20)
        .ret()
        .build();
    let func = simplified(&mut fx, code);
    assert_eq!(count(&func, Opcode::CondBranch), 0);
    assert_eq!(count(&func, Opcode::Compare), 0);
    assert_eq!(count(&func, Opcode::Return), 1);
    assert_eq!(returned_type(&func), Type::long_const(10));
}

#[test]
fn none_is_falsy() {
    let mut fx = Fixture::new();
    let mut cb = CodeBuilder::new("f");
    let other = cb.label();
    let code = cb
        .load_none()
        .pop_jump_if_false(other)
        .load_int(1)
        .ret()
        .bind(other)
        .load_int(2)
        .ret()
        .build();
    let func = simplified(&mut fx, code);
    assert_eq!(count(&func, Opcode::IsTruthy), 0);
    assert_eq!(returned_type(&func), Type::long_const(2));
}

#[test]
fn int_comparison_unboxes() {
    let mut fx = Fixture::new();
    let code = CodeBuilder::new("f")
        .typed_arg("a", ArgAnnotation::Kind(ObjKind::Int))
        .load_fast("a")
        .load_int(3)
        .compare(CmpOp::Ge)
        .ret()
        .build();
    let func = simplified(&mut fx, code);
    assert_eq!(count(&func, Opcode::Compare), 0);
    assert_eq!(count(&func, Opcode::PrimitiveCompare), 1);
    assert_eq!(returned_type(&func), Type::BOOL);
}

#[test]
fn constant_tuple_subscript_folds() {
    let mut fx = Fixture::new();
    let code = CodeBuilder::new("f")
        .load_const(ConstValue::Tuple(vec![
            ConstValue::Int(4),
            ConstValue::Int(5),
            ConstValue::Int(6),
        ]))
        .load_int(-1)
        .subscr()
        .ret()
        .build();
    let func = simplified(&mut fx, code);
    assert_eq!(count(&func, Opcode::BinarySubscr), 0);
    assert_eq!(returned_type(&func), Type::long_const(6));
}

#[test]
fn tuple_subscript_checks_bounds() {
    let mut fx = Fixture::new();
    let code = CodeBuilder::new("f")
        .typed_arg("t", ArgAnnotation::Kind(ObjKind::Tuple))
        .typed_arg("i", ArgAnnotation::Kind(ObjKind::Int))
        .load_fast("t")
        .load_fast("i")
        .subscr()
        .ret()
        .build();
    let func = simplified(&mut fx, code);
    assert_eq!(count(&func, Opcode::BinarySubscr), 0);
    assert_eq!(count(&func, Opcode::CheckSequenceBounds), 1);
    assert_eq!(count(&func, Opcode::LoadTupleItem), 1);
}

#[test]
fn impossible_guard_ends_the_block_in_a_deopt() {
    let mut fx = Fixture::new();
    let (pre, _) = fx.build(CodeBuilder::new("host").load_none().ret().build());

    let mut f = empty_func(2, Type::STR);
    let idx = f.add_const(ConstValue::Str("s".into()));
    f.push(
        b(0),
        Instr::new(InstrKind::LoadConst {
            dst: v(0),
            value: HirConst::Object(idx),
        }),
    );
    let frame = FrameState::new(Arc::clone(&f.code), None);
    f.push(
        b(0),
        Instr::new(InstrKind::GuardType {
            dst: v(1),
            src: v(0),
            ty: Type::LONG,
        })
        .with_deopt(frame),
    );
    term(&mut f, b(0), InstrKind::Return { value: v(1) });

    run(&mut f, &pre);
    assert_eq!(f.block(b(0)).term.opcode(), Opcode::Deopt);
    assert!(f.block(b(0)).term.deopt.is_some());
    assert_eq!(f.block(b(0)).instrs.len(), 1);
}

#[test]
fn exact_instance_attribute_becomes_a_field_load() {
    let mut fx = Fixture::new();
    let class = fx.rt.new_class("Point", &["x", "y"]);
    fx.rt.set_global(fx.globals, "Point", class);
    let code = CodeBuilder::new("f")
        .typed_arg("p", ArgAnnotation::Class(Name::new("Point")))
        .load_fast("p")
        .load_attr("y")
        .ret()
        .build();
    let func = simplified(&mut fx, code);
    assert_eq!(count(&func, Opcode::LoadAttr), 0);
    assert_eq!(count(&func, Opcode::DeoptPatchpoint), 1);
    let field = func
        .blocks()
        .flat_map(|bl| bl.instrs.iter())
        .find_map(|i| match i.kind {
            InstrKind::LoadField { index, .. } => Some(index),
            _ => None,
        });
    assert_eq!(field, Some(1));
    assert_eq!(count(&func, Opcode::CheckField), 1);
}

#[test]
fn type_attribute_load_gets_an_inline_cache() {
    let mut fx = Fixture::new();
    let class = fx.rt.new_class("Config", &[]);
    fx.rt.set_global(fx.globals, "Config", class);
    let code = CodeBuilder::new("f")
        .load_global("Config")
        .load_attr("limit")
        .ret()
        .build();
    let func = simplified(&mut fx, code);
    assert_eq!(func.num_attr_caches, 1);
    assert_eq!(count(&func, Opcode::LoadAttr), 0);
    assert_eq!(count(&func, Opcode::CheckTypeAttrCache), 1);
    assert_eq!(count(&func, Opcode::LoadTypeAttrCacheItem), 1);
    assert_eq!(count(&func, Opcode::FillTypeAttrCache), 1);
    assert_eq!(crate::test_helpers::count_phis(&func), 1);
}

#[test]
fn new_block_limit_disables_cache_split() {
    let mut fx = Fixture::new();
    let class = fx.rt.new_class("Config", &[]);
    fx.rt.set_global(fx.globals, "Config", class);
    let code = CodeBuilder::new("f")
        .load_global("Config")
        .load_attr("limit")
        .ret()
        .build();
    let (pre, mut func) = fx.build(code);
    ssaify(&mut func);
    let callees = PreloaderMap::default();
    let config = PassConfig {
        simplify_new_block_limit: 2,
        ..PassConfig::default()
    };
    simplify(
        &mut func,
        &PassContext {
            pre: &pre,
            callees: &callees,
            config: &config,
        },
    );
    assert_eq!(count(&func, Opcode::LoadAttr), 1);
    assert_eq!(func.num_attr_caches, 0);
}

#[test]
fn call_to_static_function_is_direct() {
    let mut fx = Fixture::new();
    let callee = CodeBuilder::new("double")
        .typed_arg("x", ArgAnnotation::Int64)
        .returns(ArgAnnotation::Int64)
        .load_fast("x")
        .load_fast("x")
        .binary(BinOp::Add)
        .ret()
        .build();
    fx.define(callee);
    let code = CodeBuilder::new("f")
        .typed_arg("a", ArgAnnotation::Kind(ObjKind::Int))
        .load_global("double")
        .load_fast("a")
        .call_function(1)
        .ret()
        .build();
    let func = simplified(&mut fx, code);
    assert_eq!(count(&func, Opcode::VectorCall), 0);
    let call = func
        .blocks()
        .flat_map(|bl| bl.instrs.iter())
        .find(|i| i.opcode() == Opcode::InvokeStaticFunction);
    let Some(call) = call else {
        panic!("no direct call in\n{}", print_function(&func));
    };
    for &arg in &call.kind.operands() {
        assert_eq!(func.reg_type(arg), Type::CINT64);
    }
    assert_eq!(returned_type(&func), Type::LONG);
}

#[test]
fn simplify_is_idempotent() {
    let mut fx = Fixture::new();
    let code = CodeBuilder::new("f")
        .typed_arg("a", ArgAnnotation::Kind(ObjKind::Int))
        .load_fast("a")
        .load_int(1)
        .binary(BinOp::Sub)
        .load_int(0)
        .compare(CmpOp::Gt)
        .ret()
        .build();
    let (pre, mut func) = fx.build(code);
    ssaify(&mut func);
    run(&mut func, &pre);
    let once = print_function(&func);
    run(&mut func, &pre);
    assert_eq!(print_function(&func), once);
}
