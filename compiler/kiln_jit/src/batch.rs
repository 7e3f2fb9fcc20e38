//! Batch compilation.
//!
//! Preloading needs the runtime and may run user code, so it happens
//! serially on the calling thread. Compilation does not, so preloaded
//! functions are handed to worker threads through a shared injector
//! queue. Keys another worker was already compiling come back as
//! [`CompileResult::Retry`] and get one more serial attempt once the
//! workers are done. Installation is back on the calling thread.

use std::collections::VecDeque;
use std::sync::Arc;
use std::thread;

use crossbeam::deque::{Injector, Steal};
use crossbeam::utils::Backoff;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use kiln_hir::{Preloader, PreloaderMap};
use kiln_rt::{ObjRef, RtResult, Runtime};
use parking_lot::Mutex;
use rustc_hash::FxHashSet;

use crate::context::{CompileOutcome, Context};
use crate::CompileResult;

/// Preloaders shared by one batch, one per function.
#[derive(Debug, Default)]
pub struct PreloaderCache {
    map: DashMap<ObjRef, Arc<Preloader>>,
}

impl PreloaderCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, func: ObjRef) -> Option<Arc<Preloader>> {
        self.map.get(&func).map(|p| Arc::clone(p.value()))
    }

    /// Cache `pre` unless a preloader for its function is already cached,
    /// in which case `pre` is released and the cached one returned.
    pub fn get_or_insert(&self, rt: &mut Runtime, pre: Preloader) -> Arc<Preloader> {
        let existing = match self.map.entry(pre.func) {
            Entry::Occupied(e) => Arc::clone(e.get()),
            Entry::Vacant(e) => return Arc::clone(e.insert(Arc::new(pre)).value()),
        };
        pre.release(rt);
        existing
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Every cached preloader, for the inliner.
    pub fn to_map(&self) -> PreloaderMap {
        self.map.iter().map(|e| (*e.key(), Arc::clone(e.value()))).collect()
    }

    /// Release and forget every cached preloader.
    pub fn release(&self, rt: &mut Runtime) {
        let all: Vec<Arc<Preloader>> = self.map.iter().map(|e| Arc::clone(e.value())).collect();
        self.map.clear();
        for pre in all {
            pre.release(rt);
        }
    }
}

/// Preload `root` and the functions it references as globals, breadth
/// first, at most `limit` functions in all. Returns them in reverse
/// discovery order, so `root` is last. Functions destroyed while later
/// ones were preloading are dropped from the result.
pub fn preload_with_dependencies(
    rt: &mut Runtime,
    cache: &PreloaderCache,
    root: ObjRef,
    limit: usize,
) -> RtResult<Vec<Arc<Preloader>>> {
    let limit = limit.max(1);
    let mut seen = FxHashSet::default();
    seen.insert(root);
    let mut queue = VecDeque::from([root]);
    let mut destroyed = FxHashSet::default();
    let mut order = Vec::new();

    while let Some(func) = queue.pop_front() {
        if destroyed.contains(&func) {
            continue;
        }
        let pre = match cache.get(func) {
            Some(pre) => pre,
            None => {
                let pre = Preloader::resolve(rt, func)?;
                cache.get_or_insert(rt, pre)
            }
        };
        destroyed.extend(pre.destroyed.iter().copied());
        for dep in pre.referenced_functions() {
            if seen.len() >= limit {
                break;
            }
            if seen.insert(dep) {
                queue.push_back(dep);
            }
        }
        order.push(pre);
    }

    order.retain(|pre| !destroyed.contains(&pre.func));
    order.reverse();
    tracing::debug!(root = ?root, preloaded = order.len(), "dependencies preloaded");
    Ok(order)
}

#[derive(Clone, Debug, Default)]
pub struct BatchReport {
    /// Per compiled function, requested roots and their dependencies, in
    /// compile order.
    pub results: Vec<(ObjRef, CompileResult)>,
    /// Compiles that had to be retried after the workers finished.
    pub retried: usize,
}

impl BatchReport {
    pub fn result_of(&self, func: ObjRef) -> Option<CompileResult> {
        self.results.iter().find(|(f, _)| *f == func).map(|&(_, r)| r)
    }

    pub fn succeeded(&self) -> usize {
        self.results.iter().filter(|(_, r)| r.is_success()).count()
    }
}

/// Compile `funcs` and everything they depend on with `workers` threads,
/// then install the results. Exceptions raised while preloading
/// propagate and nothing is installed.
pub fn compile_batch(rt: &mut Runtime, ctx: &Context, funcs: &[ObjRef], workers: usize) -> RtResult<BatchReport> {
    let span = tracing::debug_span!("compile_batch", funcs = funcs.len(), workers);
    let _guard = span.enter();

    let cache = PreloaderCache::new();
    let mut work: Vec<Arc<Preloader>> = Vec::new();
    let mut queued = FxHashSet::default();
    for &func in funcs {
        let preloaded = match preload_with_dependencies(rt, &cache, func, ctx.config().preload_dependency_limit) {
            Ok(preloaded) => preloaded,
            Err(raised) => {
                cache.release(rt);
                return Err(raised);
            }
        };
        for pre in preloaded {
            if queued.insert(pre.func) {
                work.push(pre);
            }
        }
    }

    let callees = cache.to_map();
    let mut outcomes = run_workers(ctx, &work, &callees, workers);

    let mut retried = 0;
    for (i, outcome) in outcomes.iter_mut().enumerate() {
        if outcome.result == CompileResult::Retry {
            retried += 1;
            *outcome = ctx.compile_preloaded_with(&work[i], &callees);
        }
    }

    let mut report = BatchReport {
        results: Vec::with_capacity(work.len()),
        retried,
    };
    for (pre, outcome) in work.iter().zip(&outcomes) {
        if let Some(artifact) = &outcome.artifact {
            ctx.install(rt, pre.func, artifact);
        }
        report.results.push((pre.func, outcome.result));
    }
    cache.release(rt);
    tracing::debug!(
        compiled = report.succeeded(),
        total = report.results.len(),
        retried,
        "batch done"
    );
    Ok(report)
}

/// Compile every preloader on `workers` threads. Outcomes are in `work`
/// order.
fn run_workers(ctx: &Context, work: &[Arc<Preloader>], callees: &PreloaderMap, workers: usize) -> Vec<CompileOutcome> {
    let injector = Injector::new();
    for i in 0..work.len() {
        injector.push(i);
    }
    let done: Mutex<Vec<(usize, CompileOutcome)>> = Mutex::new(Vec::with_capacity(work.len()));
    let threads = workers.clamp(1, work.len().max(1));

    thread::scope(|s| {
        for worker in 0..threads {
            let (injector, done) = (&injector, &done);
            s.spawn(move || {
                let backoff = Backoff::new();
                loop {
                    match injector.steal() {
                        Steal::Success(i) => {
                            let outcome = ctx.compile_preloaded_with(&work[i], callees);
                            tracing::trace!(worker, function = %work[i].code.name, result = ?outcome.result, "compiled");
                            done.lock().push((i, outcome));
                            backoff.reset();
                        }
                        Steal::Retry => backoff.spin(),
                        Steal::Empty => break,
                    }
                }
            });
        }
    });

    let mut done = done.into_inner();
    done.sort_by_key(|&(i, _)| i);
    done.into_iter().map(|(_, outcome)| outcome).collect()
}

#[cfg(test)]
mod tests;
