use pretty_assertions::assert_eq;

use super::*;
use crate::test_helpers::{add_args, define_raising_lazy, Fixture};
use kiln_rt::{BinOp, CodeBuilder, CodeUnit, JitState};

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

/// `def twice(a): return inc(inc(a))`
fn twice() -> Arc<CodeUnit> {
    CodeBuilder::new("twice")
        .arg("a")
        .load_global("inc")
        .load_global("inc")
        .load_fast("a")
        .call_function(1)
        .call_function(1)
        .ret()
        .build()
}

// === Preloader cache ===

#[test]
fn cache_keeps_the_first_preloader() {
    let mut fx = Fixture::new();
    let f = fx.define(add_args());
    let cache = PreloaderCache::new();

    let (Ok(p1), Ok(p2)) = (Preloader::resolve(&mut fx.rt, f), Preloader::resolve(&mut fx.rt, f)) else {
        panic!("preload failed");
    };
    let a = cache.get_or_insert(&mut fx.rt, p1);
    let b = cache.get_or_insert(&mut fx.rt, p2);
    assert!(Arc::ptr_eq(&a, &b));
    assert_eq!(cache.len(), 1);
    assert!(cache.get(f).is_some_and(|p| Arc::ptr_eq(&p, &a)));
    cache.release(&mut fx.rt);
}

#[test]
fn releasing_the_cache_drops_its_references() {
    let mut fx = Fixture::new();
    let f = fx.define(add_args());
    let before = fx.rt.heap.refcount(f);
    let cache = PreloaderCache::new();

    for _ in 0..3 {
        let Ok(pre) = Preloader::resolve(&mut fx.rt, f) else {
            panic!("preload failed");
        };
        cache.get_or_insert(&mut fx.rt, pre);
    }
    assert!(fx.rt.heap.refcount(f) > before);

    cache.release(&mut fx.rt);
    assert!(cache.is_empty());
    assert_eq!(fx.rt.heap.refcount(f), before);
}

// === Dependencies ===

#[test]
fn dependencies_come_before_the_root() {
    let mut fx = Fixture::new();
    let callee = fx.define(inc());
    let root = fx.define(twice());
    let cache = PreloaderCache::new();

    let Ok(order) = preload_with_dependencies(&mut fx.rt, &cache, root, 32) else {
        panic!("preload failed");
    };
    let funcs: Vec<ObjRef> = order.iter().map(|p| p.func).collect();
    assert_eq!(funcs, vec![callee, root]);
    assert_eq!(cache.len(), 2);
    assert_eq!(cache.to_map().len(), 2);
    cache.release(&mut fx.rt);
}

#[test]
fn dependency_limit_bounds_the_walk() {
    let mut fx = Fixture::new();
    fx.define(inc());
    let root = fx.define(twice());
    let cache = PreloaderCache::new();

    let Ok(order) = preload_with_dependencies(&mut fx.rt, &cache, root, 1) else {
        panic!("preload failed");
    };
    assert_eq!(order.len(), 1);
    assert_eq!(order[0].func, root);
    cache.release(&mut fx.rt);
}

#[test]
fn preload_exception_propagates() {
    let mut fx = Fixture::new();
    define_raising_lazy(&mut fx);
    let f = fx.define(CodeBuilder::new("f").load_global("answer").ret().build());
    let cache = PreloaderCache::new();

    assert!(preload_with_dependencies(&mut fx.rt, &cache, f, 32).is_err());
    assert!(fx.rt.has_pending());
    cache.release(&mut fx.rt);
}

// === Batches ===

#[test]
fn batch_compiles_roots_and_dependencies() {
    let mut fx = Fixture::new();
    let callee = fx.define(inc());
    let root = fx.define(twice());
    let other = fx.define(add_args());

    let Ok(report) = compile_batch(&mut fx.rt, &fx.ctx, &[root, other], 4) else {
        panic!("batch raised");
    };
    assert_eq!(report.results.len(), 3);
    assert_eq!(report.succeeded(), 3);
    assert_eq!(report.retried, 0);
    for func in [callee, root, other] {
        assert_eq!(report.result_of(func), Some(CompileResult::Success));
        assert!(matches!(fx.rt.jit_state(func), JitState::Compiled(_)));
    }
    assert_eq!(fx.call_int(root, &[1]), Some(3));
    assert_eq!(fx.call_int(other, &[1, 1]), Some(2));
}

#[test]
fn shared_dependencies_compile_once() {
    let mut fx = Fixture::new();
    fx.define(inc());
    let a = fx.define(twice());
    let b = fx.rt.new_function(twice(), fx.globals);

    let Ok(report) = compile_batch(&mut fx.rt, &fx.ctx, &[a, b, a], 2) else {
        panic!("batch raised");
    };
    assert_eq!(report.results.len(), 3);
    assert_eq!(fx.ctx.cache_len(), 3);
    fx.rt.decref(b);
}

#[test]
fn single_worker_batch() {
    let mut fx = Fixture::new();
    let f = fx.define(add_args());
    let Ok(report) = compile_batch(&mut fx.rt, &fx.ctx, &[f], 1) else {
        panic!("batch raised");
    };
    assert_eq!(report.result_of(f), Some(CompileResult::Success));
}

#[test]
fn empty_batch_does_nothing() {
    let mut fx = Fixture::new();
    let Ok(report) = compile_batch(&mut fx.rt, &fx.ctx, &[], 4) else {
        panic!("batch raised");
    };
    assert!(report.results.is_empty());
    assert_eq!(fx.ctx.cache_len(), 0);
}

#[test]
fn failed_preload_installs_nothing() {
    let mut fx = Fixture::new();
    let ok = fx.define(add_args());
    define_raising_lazy(&mut fx);
    let bad = fx.define(CodeBuilder::new("f").load_global("answer").ret().build());

    assert!(compile_batch(&mut fx.rt, &fx.ctx, &[ok, bad], 2).is_err());
    assert_eq!(fx.rt.jit_state(ok), JitState::NotCompiled);
    assert_eq!(fx.ctx.cache_len(), 0);
}
