//! Deopt exits: the interpreter finishes what compiled code started.

use kiln_hir::DeoptReason;
use kiln_jit::JitConfig;
use kiln_rt::{BinOp, CodeBuilder, ExcKind, JitState};
use pretty_assertions::assert_eq;

use crate::common::{self, add64, add64_twice, get_g, inc, inc_both, Jit};

#[test]
fn overflow_in_static_code_raises_like_the_interpreter() {
    let mut jit = Jit::new();
    let f = jit.compiled(add64());
    let mut interp = Jit::interpreter();
    let g = interp.define(add64());
    let args = [i64::MAX as u64, 1];

    assert_eq!(jit.call_static(f, &args), Err(ExcKind::OverflowError));
    assert_eq!(jit.call_static(f, &args), interp.call_static(g, &args));
    assert_eq!(jit.artifact(f).deopt_stats().total(), 2);
    assert_eq!(jit.call_static(f, &[1, 1]), Ok(2));
}

#[test]
fn exception_inside_inlined_callee_matches_interpreter() {
    let mut jit = Jit::new();
    jit.define(inc());
    let f = jit.compiled(inc_both());
    assert_eq!(jit.artifact(f).inline_stats().num_inlined, 2);

    let mut interp = Jit::interpreter();
    interp.define(inc());
    let g = interp.define(inc_both());

    let s = jit.rt.new_str("s");
    let compiled = jit.call_objs(f, &[s]);
    jit.rt.decref(s);
    let s = interp.rt.new_str("s");
    let interpreted = interp.call_objs(g, &[s]);
    interp.rt.decref(s);

    assert_eq!(compiled, Err(ExcKind::TypeError));
    assert_eq!(compiled, interpreted);
    // Nothing is left on the shadow stack.
    assert!(jit.rt.shadow_frames().is_empty());
    assert_eq!(jit.call_ints(f, &[1]), Ok(4));
}

#[test]
fn unbound_local_raises_like_the_interpreter() {
    // def f(): return x   (x local, never assigned)
    let code = || CodeBuilder::new("f").local("x").load_fast("x").ret().build();
    let mut jit = Jit::new();
    let f = jit.define(code());
    let result = jit.compile(f);
    let mut interp = Jit::interpreter();
    let g = interp.define(code());

    let compiled = jit.call_ints(f, &[]);
    assert_eq!(compiled, Err(ExcKind::UnboundLocalError));
    assert_eq!(compiled, interp.call_ints(g, &[]));
    if result.is_success() {
        assert_eq!(jit.artifact(f).deopt_stats().total(), 1);
    }
}

#[test]
fn failed_guard_resumes_with_the_new_value() {
    let mut jit = Jit::with_config(JitConfig {
        guard_failure_threshold: 1,
        ..common::config()
    });
    jit.set_int_global("g", 1);
    let f = jit.compiled(get_g());
    assert_eq!(jit.call_ints(f, &[]), Ok(1));

    jit.set_int_global("g", 2);
    assert_eq!(jit.call_ints(f, &[]), Ok(2));
    assert_eq!(jit.artifact(f).deopt_stats().count(DeoptReason::GuardFailure), 1);
    assert!(matches!(jit.rt.jit_state(f), JitState::Deopted(_)));
    assert_eq!(jit.ctx.deopted_funcs(), vec![f]);

    // Deoptimized functions interpret without counting more failures.
    assert_eq!(jit.call_ints(f, &[]), Ok(2));
    assert_eq!(jit.artifact(f).deopt_stats().total(), 1);
}

#[test]
fn argument_guard_failure_matches_interpreter_and_deopts() {
    let mut jit = Jit::with_config(JitConfig {
        guard_failure_threshold: 1,
        ..common::config()
    });
    jit.define(add64());
    let f = jit.compiled(add64_twice());
    let mut interp = Jit::interpreter();
    interp.define(add64());
    let g = interp.define(add64_twice());

    // Fast path first.
    assert_eq!(jit.call_ints(f, &[1]), Ok(5));
    assert_eq!(jit.artifact(f).deopt_stats().total(), 0);

    let s = jit.rt.new_str("s");
    let compiled = jit.call_objs(f, &[s]);
    jit.rt.decref(s);
    let s = interp.rt.new_str("s");
    let interpreted = interp.call_objs(g, &[s]);
    interp.rt.decref(s);

    assert!(compiled.is_err());
    assert_eq!(compiled, interpreted);
    assert_eq!(jit.artifact(f).deopt_stats().count(DeoptReason::GuardFailure), 1);
    assert_eq!(jit.ctx.deopted_funcs(), vec![f]);
    assert_eq!(jit.call_ints(f, &[1]), interp.call_ints(g, &[1]));
}

#[test]
fn guard_failures_feed_type_profiles() {
    let mut jit = Jit::new();
    jit.set_int_global("g", 1);
    let f = jit.compiled(get_g());
    let s = jit.rt.new_str("text");
    jit.rt.set_global(jit.globals, "g", s);
    jit.rt.decref(s);

    let result = jit.rt.call_function(f, &[]);
    let Ok(value) = result else {
        panic!("call raised");
    };
    assert_eq!(jit.rt.type_name_of(value).as_str(), "str");
    jit.rt.decref(value);

    let Some(code) = jit.rt.func_code(f) else {
        panic!("function lost its code");
    };
    let profile = jit.ctx.profiles().get(code.id, 0);
    assert_eq!(profile.len(), 1);
    assert_eq!(profile[0].0.as_str(), "str");
}

#[test]
fn deopt_inside_a_loop_resumes_mid_iteration() {
    // def f(n):
    //     acc = 0
    //     while n > 0:
    //         acc = acc + g
    //         n = n - 1
    //     return acc
    let mut b = CodeBuilder::new("f").arg("n").local("acc");
    let top = b.label();
    let done = b.label();
    let code = b
        .load_int(0)
        .store_fast("acc")
        .bind(top)
        .load_fast("n")
        .load_int(0)
        .compare(kiln_rt::CmpOp::Gt)
        .pop_jump_if_false(done)
        .load_fast("acc")
        .load_global("g")
        .binary(BinOp::Add)
        .store_fast("acc")
        .load_fast("n")
        .load_int(1)
        .binary(BinOp::Sub)
        .store_fast("n")
        .jump(top)
        .bind(done)
        .load_fast("acc")
        .ret()
        .build();

    let mut jit = Jit::new();
    jit.set_int_global("g", 3);
    let f = jit.compiled(code);
    assert_eq!(jit.call_ints(f, &[4]), Ok(12));

    // The guard on `g` fails on the first iteration; the interpreter
    // finishes the loop with the new binding.
    jit.set_int_global("g", 5);
    assert_eq!(jit.call_ints(f, &[4]), Ok(20));
}
