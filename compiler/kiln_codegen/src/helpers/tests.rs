use pretty_assertions::assert_eq;

use kiln_rt::{CodeBuilder, CodeUnit, Name};

use super::*;
use crate::code_runtime::CodeRuntime;
use crate::test_helpers::{read_global, Fixture};

fn table(rt: &mut Runtime, names: &[&str], codes: Vec<std::sync::Arc<CodeUnit>>) -> CodeRuntime {
    let names = names.iter().map(|n| Name::from(*n)).collect();
    CodeRuntime::materialize(rt, &[], Vec::new(), names, codes, 0)
}

fn run(rt: &mut Runtime, code: &CodeRuntime, helper: Helper, args: &[u64]) -> Result<Option<u64>, CodegenError> {
    let machine = Machine::new(64);
    let mut ctx = ExecContext { rt, code };
    call(helper, args, &machine, &mut ctx)
}

// === Boxing ===

#[test]
fn box_makes_objects_from_raw_words() {
    let mut rt = Runtime::new();
    let code = table(&mut rt, &[], Vec::new());

    let int = run(&mut rt, &code, Helper::Box { kind: PrimKind::Int64 }, &[-5i64 as u64]);
    assert_eq!(int.ok().flatten().and_then(|w| rt.int_value(obj(w))), Some(-5));

    let float = run(&mut rt, &code, Helper::Box { kind: PrimKind::Double }, &[2.5f64.to_bits()]);
    let float = float.ok().flatten().map(obj);
    assert_eq!(float.map(|f| rt.kind_of(f)), Some(kiln_rt::ObjKind::Float));

    let yes = run(&mut rt, &code, Helper::Box { kind: PrimKind::Bool }, &[1]);
    assert_eq!(yes, Ok(Some(rt.bool_obj(true).to_word())));
}

#[test]
fn make_tuple_steals_its_items() {
    let mut rt = Runtime::new();
    let code = table(&mut rt, &[], Vec::new());
    let item = rt.new_str("x");
    let tuple = run(&mut rt, &code, Helper::MakeTuple, &[item.to_word(), item.to_word()]);
    assert!(matches!(tuple, Ok(Some(_))));
    // Two slots, but the reference count was not bumped.
    assert_eq!(rt.heap.refcount(item), 1);
}

// === Calls ===

#[test]
fn call_method_prepends_self_when_present() {
    let mut rt = Runtime::new();
    let code = table(&mut rt, &[], Vec::new());
    let Some(abs) = rt.get_global(rt.builtins(), "abs") else {
        panic!("abs is not a builtin");
    };
    let minus = rt.new_int(-4);

    let bound = run(&mut rt, &code, Helper::CallMethod, &[abs.to_word(), minus.to_word()]);
    assert_eq!(bound.ok().flatten().and_then(|w| rt.int_value(obj(w))), Some(4));

    let unbound = run(&mut rt, &code, Helper::CallMethod, &[abs.to_word(), 0, minus.to_word()]);
    assert_eq!(unbound.ok().flatten().and_then(|w| rt.int_value(obj(w))), Some(4));
}

#[test]
fn failing_call_returns_none_with_a_pending_exception() {
    let mut rt = Runtime::new();
    let code = table(&mut rt, &[], Vec::new());
    let not_callable = rt.new_int(1);
    assert_eq!(run(&mut rt, &code, Helper::VectorCall, &[not_callable.to_word()]), Ok(None));
    assert!(rt.has_pending());
}

#[test]
fn raise_sets_the_pending_exception() {
    let mut rt = Runtime::new();
    let code = table(&mut rt, &[], Vec::new());
    let exc = rt.new_exception(kiln_rt::ExcKind::ValueError, "bad");
    assert_eq!(run(&mut rt, &code, Helper::Raise, &[exc.to_word()]), Ok(None));
    assert_eq!(
        rt.pending_exception(),
        Some((kiln_rt::ExcKind::ValueError, "bad".to_string()))
    );
}

// === Globals ===

#[test]
fn global_helpers_use_the_function_namespace() {
    let mut fx = Fixture::new();
    let func = fx.define(read_global());
    let code = table(&mut fx.rt, &["g"], Vec::new());
    let value = fx.rt.new_int(8);

    let stored = run(&mut fx.rt, &code, Helper::StoreGlobal { name: 0 }, &[func.to_word(), value.to_word()]);
    assert_eq!(stored, Ok(Some(0)));
    assert_eq!(fx.rt.get_global(fx.globals, "g"), Some(value));

    let loaded = run(&mut fx.rt, &code, Helper::LoadGlobal { name: 0 }, &[func.to_word()]);
    assert_eq!(loaded, Ok(Some(value.to_word())));
}

#[test]
fn unknown_name_index_is_a_machine_error() {
    let mut rt = Runtime::new();
    let code = table(&mut rt, &[], Vec::new());
    assert_eq!(
        run(&mut rt, &code, Helper::GetAttr { name: 3 }, &[0]),
        Err(CodegenError::IndexOutOfRange { obj: 0, index: 3 })
    );
}

// === Shadow frames ===

#[test]
fn shadow_frames_follow_inlined_calls() {
    let mut rt = Runtime::new();
    let inner = CodeBuilder::new("inner").build();
    let code = table(&mut rt, &[], vec![inner.clone()]);
    let before = rt.shadow_frames().len();

    assert_eq!(run(&mut rt, &code, Helper::PushShadow { code: 0 }, &[]), Ok(Some(0)));
    assert_eq!(rt.shadow_frames().len(), before + 1);
    assert_eq!(rt.shadow_frames().last().map(|f| f.code.id), Some(inner.id));

    assert_eq!(run(&mut rt, &code, Helper::PopShadow, &[]), Ok(Some(0)));
    assert_eq!(rt.shadow_frames().len(), before);
}
