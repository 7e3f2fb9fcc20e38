//! Installed code over time: deopt and reopt, cache eviction, shutdown,
//! invalidation, and image notes.

use std::sync::Arc;

use kiln_jit::{decode_notes, encode_notes, AotNote, CompileResult};
use kiln_rt::{JitState, WatchKey};
use pretty_assertions::assert_eq;

use crate::common::{add, add64, get_len, sum_to, Jit};

#[test]
fn deopt_and_reopt_keep_results_stable() {
    let mut jit = Jit::new();
    let f = jit.compiled(sum_to());
    let JitState::Compiled(entry) = jit.rt.jit_state(f) else {
        panic!("expected compiled state");
    };

    assert!(jit.ctx.deopt(&mut jit.rt, f));
    assert_eq!(jit.rt.jit_state(f), JitState::Deopted(entry));
    assert_eq!(jit.call_ints(f, &[10]), Ok(55));

    assert!(jit.ctx.reopt(&mut jit.rt, f));
    assert_eq!(jit.rt.jit_state(f), JitState::Compiled(entry));
    assert_eq!(jit.call_ints(f, &[10]), Ok(55));
}

#[test]
fn evicted_code_keeps_running() {
    let mut jit = Jit::new();
    let code = add();
    let f = jit.define(Arc::clone(&code));
    jit.compile(f);
    let old = jit.artifact(f);

    jit.ctx.clear_cache();
    assert_eq!(jit.ctx.orphan_count(), 1);
    assert_eq!(jit.call_ints(f, &[2, 2]), Ok(4));

    let g = jit.rt.new_function(code, jit.globals);
    assert_eq!(jit.compile(g), CompileResult::Success);
    assert!(!Arc::ptr_eq(&old, &jit.artifact(g)));
    assert_eq!(jit.call_ints(g, &[2, 3]), Ok(5));
    jit.rt.decref(g);
}

#[test]
fn shutdown_falls_back_to_the_interpreter() {
    let mut jit = Jit::new();
    let f = jit.compiled(sum_to());
    let g = jit.compiled(add64());

    jit.ctx.shutdown(&mut jit.rt);
    assert!(jit.ctx.compiled_funcs().is_empty());
    assert!(jit.ctx.deopted_funcs().is_empty());
    assert!(matches!(jit.rt.jit_state(f), JitState::Deopted(_)));
    assert!(matches!(jit.rt.jit_state(g), JitState::Deopted(_)));
    assert_eq!(jit.call_ints(f, &[3]), Ok(6));
    assert_eq!(jit.call_static(g, &[3, 4]), Ok(7));
    assert!(!jit.ctx.reopt(&mut jit.rt, f));
}

#[test]
fn new_global_shadowing_a_builtin_invalidates_code() {
    let mut jit = Jit::new();
    let f = jit.compiled(get_len());
    assert_eq!(jit.ctx.watched_keys(), vec![WatchKey::Namespace(jit.globals)]);

    jit.set_int_global("len", 11);
    assert!(jit.ctx.watched_keys().is_empty());
    assert_eq!(jit.call_ints(f, &[]), Ok(11));
    assert!(jit.artifact(f).deopt_stats().total() >= 1);
}

#[test]
fn deleting_a_watched_global_invalidates_code() {
    let mut jit = Jit::new();
    jit.set_int_global("other", 1);
    let f = jit.compiled(get_len());

    jit.rt.delete_global(jit.globals, "other");
    assert!(jit.ctx.watched_keys().is_empty());
    // `len` still resolves to the builtin.
    let Ok(value) = jit.rt.call_function(f, &[]) else {
        panic!("call raised");
    };
    assert_eq!(jit.rt.get_global(jit.rt.builtins(), "len"), Some(value));
    jit.rt.decref(value);
}

#[test]
fn aot_notes_round_trip_and_validate() {
    let mut jit = Jit::new();
    let f = jit.compiled(add());
    let g = jit.compiled(add64());
    let (a, b) = (jit.artifact(f), jit.artifact(g));

    let notes = vec![AotNote::from_artifact(&a), AotNote::from_artifact(&b)];
    let Ok(bytes) = encode_notes(&notes) else {
        panic!("encoding failed");
    };
    let Ok(decoded) = decode_notes(&bytes) else {
        panic!("decoding failed");
    };
    assert_eq!(decoded, notes);
    assert_eq!(decoded[0].validate_against(&a), Ok(()));
    assert_eq!(decoded[1].validate_against(&b), Ok(()));
    assert!(decoded[0].validate_against(&b).is_err());
}
