use kiln_rt::{BinOp, CodeBuilder, CodeUnit};
use pretty_assertions::assert_eq;

use super::*;
use crate::checker::validate;
use crate::instr::Opcode;
use crate::passes::PassConfig;
use crate::preload::PreloaderMap;
use crate::test_helpers::{count, Fixture};

/// `def inc(x): return x + 1`
fn inc() -> Arc<CodeUnit> {
    CodeBuilder::new("inc")
        .arg("x")
        .load_fast("x")
        .load_int(1)
        .binary(BinOp::Add)
        .ret()
        .build()
}

/// `def f(a): return inc(a)`
fn calls_inc() -> Arc<CodeUnit> {
    CodeBuilder::new("f")
        .arg("a")
        .load_global("inc")
        .load_fast("a")
        .call_function(1)
        .ret()
        .build()
}

struct Setup {
    fx: Fixture,
    callees: PreloaderMap,
    callee_code: Arc<CodeUnit>,
}

fn setup(preload_callee: bool) -> Setup {
    let mut fx = Fixture::new();
    let callee_code = inc();
    let callee = fx.define(Arc::clone(&callee_code));
    let mut callees = PreloaderMap::default();
    if preload_callee {
        callees.insert(callee, Arc::new(fx.preload(callee)));
    }
    Setup {
        fx,
        callees,
        callee_code,
    }
}

fn inlined(s: &mut Setup, caller: Arc<CodeUnit>, config: PassConfig) -> Function {
    let (pre, mut func) = s.fx.build(caller);
    ssaify(&mut func);
    let cx = PassContext {
        pre: &pre,
        callees: &s.callees,
        config: &config,
    };
    inline_function_calls(&mut func, &cx);
    assert_eq!(validate(&func), Ok(()));
    func
}

#[test]
fn preloaded_callee_is_spliced_in() {
    let mut s = setup(true);
    let func = inlined(&mut s, calls_inc(), PassConfig::default());
    assert_eq!(count(&func, Opcode::VectorCall), 0);
    assert_eq!(count(&func, Opcode::BeginInlinedFunction), 1);
    assert_eq!(count(&func, Opcode::EndInlinedFunction), 1);
    assert_eq!(count(&func, Opcode::LoadFunctionCode), 1);
    assert_eq!(func.inline_stats.num_inlined, 1);
    assert_eq!(func.inline_stats.cost, s.callee_code.ops.len());
}

#[test]
fn callee_frames_chain_to_the_caller() {
    let mut s = setup(true);
    let func = inlined(&mut s, calls_inc(), PassConfig::default());
    let nested = func
        .blocks()
        .flat_map(|bl| bl.all_instrs())
        .filter_map(|i| i.deopt.as_deref())
        .find(|d| d.frame.code.name.as_str() == "inc");
    let Some(nested) = nested else {
        panic!("no deopt point inside the inlined body");
    };
    let parent = nested.frame.parent.as_deref();
    assert_eq!(parent.map(|p| p.code.name.as_str()), Some("f"));
    // The caller resumes after the call with its inputs popped.
    assert!(parent.is_some_and(|p| p.stack.is_empty()));
}

#[test]
fn missing_preload_is_recorded() {
    let mut s = setup(false);
    let func = inlined(&mut s, calls_inc(), PassConfig::default());
    assert_eq!(count(&func, Opcode::VectorCall), 1);
    assert_eq!(func.inline_stats.failures.get(&InlineFailure::NotPreloaded), Some(&1));
}

#[test]
fn cost_limit_stops_inlining() {
    let mut s = setup(true);
    let config = PassConfig {
        inline_cost_limit: 1,
        ..PassConfig::default()
    };
    let func = inlined(&mut s, calls_inc(), config);
    assert_eq!(func.inline_stats.num_inlined, 0);
    assert_eq!(
        func.inline_stats.failures.get(&InlineFailure::CostLimitExceeded),
        Some(&1)
    );
}

#[test]
fn argument_count_must_match() {
    let mut s = setup(true);
    let caller = CodeBuilder::new("f")
        .load_global("inc")
        .call_function(0)
        .ret()
        .build();
    let func = inlined(&mut s, caller, PassConfig::default());
    assert_eq!(
        func.inline_stats.failures.get(&InlineFailure::ArgumentCountMismatch),
        Some(&1)
    );
}
