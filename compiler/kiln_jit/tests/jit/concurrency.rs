//! The compilation cache under concurrent compiles.

use std::sync::Arc;
use std::thread;

use kiln_hir::Preloader;
use kiln_jit::{compile_batch, CompileResult};
use kiln_rt::{CodeBuilder, JitState};
use pretty_assertions::assert_eq;

use crate::common::{add, inc, inc_both, sum_to, Jit};

const THREADS: usize = 8;

#[test]
fn racing_compiles_share_one_artifact() {
    let mut jit = Jit::new();
    let f = jit.define(sum_to());
    let Ok(pre) = Preloader::resolve(&mut jit.rt, f) else {
        panic!("preload failed");
    };

    let outcomes = thread::scope(|s| {
        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                let (ctx, pre) = (&jit.ctx, &pre);
                s.spawn(move || ctx.compile_preloaded(pre))
            })
            .collect();
        handles
            .into_iter()
            .map(|h| match h.join() {
                Ok(outcome) => outcome,
                Err(_) => panic!("compile thread panicked"),
            })
            .collect::<Vec<_>>()
    });

    let mut artifacts = Vec::new();
    for outcome in &outcomes {
        match outcome.result {
            CompileResult::Success => {
                let Some(artifact) = &outcome.artifact else {
                    panic!("success without an artifact");
                };
                artifacts.push(Arc::clone(artifact));
            }
            CompileResult::Retry => assert!(outcome.artifact.is_none()),
            other => panic!("unexpected result {other:?}"),
        }
    }
    assert!(!artifacts.is_empty());
    assert!(artifacts.iter().all(|a| Arc::ptr_eq(a, &artifacts[0])));
    assert_eq!(jit.ctx.cache_len(), 1);

    // A retry after the race finds the cached artifact.
    let again = jit.ctx.compile_preloaded(&pre);
    assert_eq!(again.result, CompileResult::Success);
    assert!(again.artifact.is_some_and(|a| Arc::ptr_eq(&a, &artifacts[0])));
    pre.release(&mut jit.rt);
}

#[test]
fn batch_compiles_many_functions_in_parallel() {
    let mut jit = Jit::new();
    jit.define(inc());
    let mut funcs = vec![jit.define(inc_both()), jit.define(add()), jit.define(sum_to())];
    for i in 0..12 {
        let code = CodeBuilder::new(&format!("k{i}")).arg("x").load_fast("x").load_int(i).binary(kiln_rt::BinOp::Mul).ret().build();
        funcs.push(jit.define(code));
    }

    let ctx = Arc::clone(&jit.ctx);
    let Ok(report) = compile_batch(&mut jit.rt, &ctx, &funcs, 4) else {
        panic!("batch raised");
    };
    // The roots plus `inc`.
    assert_eq!(report.results.len(), funcs.len() + 1);
    assert_eq!(report.succeeded(), report.results.len());
    for &func in &funcs {
        assert!(matches!(jit.rt.jit_state(func), JitState::Compiled(_)));
    }
    assert_eq!(jit.call_ints(funcs[0], &[1]), Ok(4));
    assert_eq!(jit.call_ints(funcs[3 + 7], &[6]), Ok(42));
}

#[test]
fn batch_after_single_compiles_reuses_the_cache() {
    let mut jit = Jit::new();
    let f = jit.compiled(add());
    let before = jit.artifact(f);

    let ctx = Arc::clone(&jit.ctx);
    let Ok(report) = compile_batch(&mut jit.rt, &ctx, &[f], 4) else {
        panic!("batch raised");
    };
    assert_eq!(report.result_of(f), Some(CompileResult::Success));
    assert!(Arc::ptr_eq(&before, &jit.artifact(f)));
    assert_eq!(jit.ctx.cache_len(), 1);
}
