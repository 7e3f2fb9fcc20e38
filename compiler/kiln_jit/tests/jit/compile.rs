//! Compiled code computes what the interpreter computes.

use kiln_jit::{CompileResult, JitConfig};
use kiln_rt::{ExcKind, JitState};
use pretty_assertions::assert_eq;
use proptest::prelude::*;

use crate::common::{self, add, add64, add64_twice, inc, inc_both, sum_to, Jit};

// =============================================================================
// Generic entry
// =============================================================================

#[test]
fn compiled_loop_matches_interpreter() {
    let mut jit = Jit::new();
    let f = jit.compiled(sum_to());
    let mut interp = Jit::interpreter();
    let g = interp.define(sum_to());

    for n in [0, 1, 2, 10, 100] {
        assert_eq!(jit.call_ints(f, &[n]), interp.call_ints(g, &[n]), "sum_to({n})");
    }
    assert_eq!(jit.call_ints(f, &[100]), Ok(5050));
}

#[test]
fn wrong_argument_count_raises_like_the_interpreter() {
    let mut jit = Jit::new();
    let f = jit.compiled(add());
    let mut interp = Jit::interpreter();
    let g = interp.define(add());

    assert_eq!(jit.call_ints(f, &[1]), Err(ExcKind::TypeError));
    assert_eq!(jit.call_ints(f, &[1]), interp.call_ints(g, &[1]));
    // The function stays compiled.
    assert_eq!(jit.call_ints(f, &[1, 2]), Ok(3));
}

#[test]
fn artifact_reports_its_layout() {
    let mut jit = Jit::new();
    let f = jit.compiled(sum_to());
    let artifact = jit.artifact(f);

    assert!(artifact.code_size() > 0);
    assert!(artifact.stack_size() > 0);
    assert!(!artifact.is_static());
    assert!(!artifact.opcode_counts().is_empty());
    assert_eq!(artifact.generic_entry(), artifact.base);
    assert_eq!(artifact.name.as_str(), "sum_to");
    assert!(jit.ctx.code_bytes_used() >= artifact.code_size());
}

// =============================================================================
// Static entry
// =============================================================================

#[test]
fn static_entry_takes_raw_words() {
    let mut jit = Jit::new();
    let f = jit.compiled(add64());
    assert!(jit.artifact(f).is_static());

    assert_eq!(jit.call_static(f, &[2, 3]), Ok(5));
    assert_eq!(jit.call_static(f, &[(-4i64) as u64, 1]), Ok((-3i64) as u64));
    // Boxed calls go through the generic entry.
    assert_eq!(jit.call_ints(f, &[20, 22]), Ok(42));
}

// =============================================================================
// Inlining
// =============================================================================

#[test]
fn both_call_sites_are_inlined() {
    let mut jit = Jit::new();
    jit.define(inc());
    let f = jit.compiled(inc_both());

    let stats = jit.artifact(f).inline_stats().clone();
    assert_eq!(stats.num_inlined, 2);
    assert!(stats.failures.is_empty());
    assert_eq!(jit.call_ints(f, &[5]), Ok(12));
    assert_eq!(jit.call_ints(f, &[-1]), Ok(0));
}

#[test]
fn static_callee_is_inlined_at_both_sites() {
    let mut jit = Jit::new();
    jit.define(add64());
    let f = jit.compiled(add64_twice());

    let artifact = jit.artifact(f);
    assert_eq!(artifact.inline_stats().num_inlined, 2);
    assert!(artifact.inline_stats().cost <= common::config().passes.inline_cost_limit);
    assert_eq!(jit.call_ints(f, &[5]), Ok(13));
    assert_eq!(jit.call_ints(f, &[-3]), Ok(-3));
}

#[test]
fn inline_cost_limit_leaves_calls_in_place() {
    let mut config = common::config();
    config.passes.inline_cost_limit = 1;
    let mut jit = Jit::with_config(config);
    jit.define(add64());
    let f = jit.compiled(add64_twice());

    let stats = jit.artifact(f).inline_stats().clone();
    assert_eq!(stats.num_inlined, 0);
    assert_eq!(stats.failures.values().sum::<usize>(), 2);
    assert_eq!(jit.call_ints(f, &[5]), Ok(13));
}

#[test]
fn disabled_inliner_leaves_calls() {
    let mut config = common::config();
    config.passes.inliner = false;
    let mut jit = Jit::with_config(config);
    jit.define(inc());
    let f = jit.compiled(inc_both());

    assert_eq!(jit.artifact(f).inline_stats().num_inlined, 0);
    assert_eq!(jit.call_ints(f, &[5]), Ok(12));
}

// =============================================================================
// Hot functions
// =============================================================================

#[test]
fn hot_function_compiles_itself() {
    let mut jit = Jit::with_config(JitConfig {
        hot_threshold: 3,
        ..common::config()
    });
    let f = jit.define(add());

    for _ in 0..2 {
        assert_eq!(jit.call_ints(f, &[1, 1]), Ok(2));
        assert_eq!(jit.rt.jit_state(f), JitState::NotCompiled);
    }
    assert_eq!(jit.call_ints(f, &[1, 1]), Ok(2));
    assert!(matches!(jit.rt.jit_state(f), JitState::Compiled(_)));
    assert_eq!(jit.ctx.compiled_funcs(), vec![f]);
}

#[test]
fn zero_hot_threshold_never_compiles() {
    let mut jit = Jit::new();
    let f = jit.define(add());
    for _ in 0..20 {
        assert_eq!(jit.call_ints(f, &[1, 1]), Ok(2));
    }
    assert_eq!(jit.rt.jit_state(f), JitState::NotCompiled);
    assert_eq!(jit.ctx.cache_len(), 0);
}

#[test]
fn compile_result_of_unsupported_code() {
    let mut jit = Jit::new();
    let f = jit.define(kiln_rt::CodeBuilder::new("gen").generator().load_none().ret().build());
    assert_eq!(jit.compile(f), CompileResult::CannotCompile);
    assert!(!jit.compile(f).is_success());
}

// =============================================================================
// Properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn compiled_add_agrees_with_checked_arithmetic(a in any::<i64>(), b in any::<i64>()) {
        let mut jit = Jit::new();
        let f = jit.compiled(add());
        let expected = a.checked_add(b).ok_or(ExcKind::OverflowError);
        prop_assert_eq!(jit.call_ints(f, &[a, b]), expected);
    }

    #[test]
    fn compiled_static_add_agrees_with_interpreter(a in any::<i64>(), b in any::<i64>()) {
        let mut jit = Jit::new();
        let f = jit.compiled(add64());
        let mut interp = Jit::interpreter();
        let g = interp.define(add64());
        prop_assert_eq!(jit.call_static(f, &[a as u64, b as u64]), interp.call_static(g, &[a as u64, b as u64]));
    }

    #[test]
    fn compiled_loop_sums(n in 0i64..300) {
        let mut jit = Jit::new();
        let f = jit.compiled(sum_to());
        prop_assert_eq!(jit.call_ints(f, &[n]), Ok(n * (n + 1) / 2));
    }
}
