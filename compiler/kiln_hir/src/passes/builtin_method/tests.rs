use kiln_rt::{ArgAnnotation, CodeBuilder};
use pretty_assertions::assert_eq;

use super::*;
use crate::checker::validate;
use crate::instr::Opcode;
use crate::passes::{simplify, ssaify, PassConfig, PassContext};
use crate::preload::PreloaderMap;
use crate::test_helpers::{count, Fixture};

fn resolved(code: std::sync::Arc<kiln_rt::CodeUnit>) -> Function {
    let mut fx = Fixture::new();
    let (pre, mut func) = fx.build(code);
    ssaify(&mut func);
    let callees = PreloaderMap::default();
    let config = PassConfig::default();
    simplify(
        &mut func,
        &PassContext {
            pre: &pre,
            callees: &callees,
            config: &config,
        },
    );
    builtin_load_method_elimination(&mut func, &pre);
    assert_eq!(validate(&func), Ok(()));
    func
}

fn static_call(func: &Function) -> Option<(BuiltinMethodId, Vec<Reg>)> {
    func.blocks()
        .flat_map(|bl| bl.instrs.iter())
        .find_map(|i| match &i.kind {
            InstrKind::CallStatic { method, args, .. } => Some((*method, args.clone())),
            _ => None,
        })
}

#[test]
fn instance_method_on_exact_str_is_called_directly() {
    let func = resolved(
        CodeBuilder::new("shout")
            .typed_arg("s", ArgAnnotation::Kind(ObjKind::Str))
            .load_fast("s")
            .load_method("upper")
            .call_method(0)
            .ret()
            .build(),
    );
    assert_eq!(count(&func, Opcode::LoadMethod), 0);
    assert_eq!(count(&func, Opcode::CallMethod), 0);
    let Some((method, args)) = static_call(&func) else {
        panic!("no direct call");
    };
    assert_eq!(Some(method), builtins::lookup_method(ObjKind::Str, "upper"));
    assert_eq!(args.len(), 1);
    assert_eq!(func.reg_type(args[0]).exact_kind(), Some(ObjKind::Str));
}

#[test]
fn class_method_receives_the_type_object() {
    let func = resolved(
        CodeBuilder::new("parse")
            .typed_arg("f", ArgAnnotation::Kind(ObjKind::Float))
            .arg("text")
            .load_fast("f")
            .load_method("fromhex")
            .load_fast("text")
            .call_method(1)
            .ret()
            .build(),
    );
    let Some((_, args)) = static_call(&func) else {
        panic!("no direct call");
    };
    assert_eq!(args.len(), 2);
    assert_eq!(func.reg_type(args[0]).exact_kind(), Some(ObjKind::Type));
}

#[test]
fn static_method_gets_no_implicit_argument() {
    let func = resolved(
        CodeBuilder::new("table")
            .typed_arg("s", ArgAnnotation::Kind(ObjKind::Str))
            .load_fast("s")
            .load_method("maketrans")
            .load_fast("s")
            .load_fast("s")
            .call_method(2)
            .ret()
            .build(),
    );
    let Some((_, args)) = static_call(&func) else {
        panic!("no direct call");
    };
    assert_eq!(args.len(), 2);
}

#[test]
fn unknown_receiver_type_keeps_the_lookup() {
    let func = resolved(
        CodeBuilder::new("shout")
            .arg("s")
            .load_fast("s")
            .load_method("upper")
            .call_method(0)
            .ret()
            .build(),
    );
    assert_eq!(count(&func, Opcode::LoadMethod), 1);
    assert_eq!(count(&func, Opcode::CallStatic), 0);
}

#[test]
fn wrong_argument_count_keeps_the_lookup() {
    let func = resolved(
        CodeBuilder::new("shout")
            .typed_arg("s", ArgAnnotation::Kind(ObjKind::Str))
            .load_fast("s")
            .load_method("upper")
            .load_int(1)
            .call_method(1)
            .ret()
            .build(),
    );
    assert_eq!(count(&func, Opcode::CallStatic), 0);
}
