use pretty_assertions::assert_eq;

use super::*;
use crate::test_helpers::{add_args, read_builtin, Fixture};
use kiln_codegen::isa::Inst;
use kiln_hir::Preloader;
use kiln_rt::ObjRef;
use std::sync::Arc;

/// Compile `func` without installing it.
fn compiled(fx: &mut Fixture, func: ObjRef) -> Arc<CompiledArtifact> {
    let Ok(pre) = Preloader::resolve(&mut fx.rt, func) else {
        panic!("preload failed");
    };
    let outcome = fx.ctx.compile_preloaded(&pre);
    pre.release(&mut fx.rt);
    let Some(artifact) = outcome.artifact else {
        panic!("compilation failed: {:?}", outcome.result);
    };
    artifact
}

#[test]
fn builtin_load_registers_globals_key() {
    let mut fx = Fixture::new();
    let f = fx.define(read_builtin());
    let artifact = compiled(&mut fx, f);
    let key = WatchKey::Namespace(fx.globals);

    let mut list = WatchList::new();
    assert_eq!(list.register(&artifact), vec![key]);
    assert_eq!(list.len(), 1);
    assert_eq!(list.sites(key).len(), artifact.patch_sites().len());
    assert!(list.sites(key).iter().all(|p| p.artifact == artifact.entry().0));
}

#[test]
fn registering_twice_is_a_no_op() {
    let mut fx = Fixture::new();
    let f = fx.define(read_builtin());
    let artifact = compiled(&mut fx, f);
    let key = WatchKey::Namespace(fx.globals);

    let mut list = WatchList::new();
    list.register(&artifact);
    let before = list.sites(key).len();
    assert!(list.register(&artifact).is_empty());
    assert_eq!(list.sites(key).len(), before);
}

#[test]
fn second_artifact_on_a_watched_key_is_not_fresh() {
    let mut fx = Fixture::new();
    let code = read_builtin();
    let f = fx.define(Arc::clone(&code));
    let first = compiled(&mut fx, f);
    fx.ctx.clear_cache();
    let g = fx.rt.new_function(code, fx.globals);
    let second = compiled(&mut fx, g);
    let key = WatchKey::Namespace(fx.globals);

    let mut list = WatchList::new();
    assert_eq!(list.register(&first), vec![key]);
    assert!(list.register(&second).is_empty());
    assert_eq!(
        list.sites(key).len(),
        first.patch_sites().len() + second.patch_sites().len()
    );
    fx.rt.decref(g);
}

#[test]
fn code_without_assumptions_watches_nothing() {
    let mut fx = Fixture::new();
    let f = fx.define(add_args());
    let artifact = compiled(&mut fx, f);

    let mut list = WatchList::new();
    assert!(list.register(&artifact).is_empty());
    assert!(list.is_empty());
}

#[test]
fn take_is_one_shot() {
    let mut fx = Fixture::new();
    let f = fx.define(read_builtin());
    let artifact = compiled(&mut fx, f);
    let key = WatchKey::Namespace(fx.globals);

    let mut list = WatchList::new();
    list.register(&artifact);
    assert!(!list.take(key).is_empty());
    assert!(list.take(key).is_empty());
    assert_eq!(list.keys().count(), 0);
}

#[test]
fn invalidate_writes_jumps_to_the_deopt_stubs() {
    let mut fx = Fixture::new();
    let f = fx.define(read_builtin());
    let artifact = compiled(&mut fx, f);
    let key = WatchKey::Namespace(fx.globals);

    let mut list = WatchList::new();
    list.register(&artifact);
    let sites = list.take(key);
    for patch in &sites {
        assert_eq!(fx.ctx.buffer().lock().fetch(patch.offset()), Ok(Inst::Nop));
    }

    assert_eq!(invalidate(fx.ctx.buffer(), &sites), Ok(()));
    for patch in &sites {
        assert_eq!(fx.ctx.buffer().lock().fetch(patch.offset()), Ok(patch.site.jump()));
    }
}

#[test]
fn invalidate_rejects_offsets_that_are_not_patch_points() {
    let mut fx = Fixture::new();
    let f = fx.define(read_builtin());
    let artifact = compiled(&mut fx, f);
    let Some(&site) = artifact.patch_sites().first() else {
        panic!("builtin load should leave a patch site");
    };
    let bogus = PatchRef {
        artifact: artifact.entry().0,
        base: artifact.base + 1,
        site,
    };
    assert_eq!(
        invalidate(fx.ctx.buffer(), &[bogus]),
        Err(CodegenError::NotPatchable(bogus.offset()))
    );
}
