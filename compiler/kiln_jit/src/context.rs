//! The compilation context.
//!
//! One [`Context`] owns the shared code buffer and a cache with at most
//! one artifact per [`CompilationKey`]. Compilation itself runs without
//! any lock held; the state lock only guards the cache, the set of keys
//! being compiled, and the per-function bookkeeping.
//!
//! Installing code touches the function object, so it needs the runtime
//! and happens on the thread that owns it. That single mutable borrow is
//! the serialization point between compile workers and the running
//! program.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use kiln_codegen::{generate, CodeBuffer, CodegenError, SharedCodeBuffer};
use kiln_hir::{build_hir, PassPipeline, Preloader, PreloaderMap};
use kiln_rt::{CodeId, JitEntry, JitHook, JitState, Name, ObjRef, RtResult, Runtime, WatchKey};
use parking_lot::Mutex;
use rustc_hash::{FxHashMap, FxHashSet};

use crate::artifact::CompiledArtifact;
use crate::batch::{preload_with_dependencies, PreloaderCache};
use crate::config::JitConfig;
use crate::deopt::TypeProfiles;
use crate::error::JitError;
use crate::watch::{self, WatchList};
use crate::CompileResult;

/// Identity of compiled code: the same bytecode against the same
/// namespaces compiles to the same machine code.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub struct CompilationKey {
    pub code: CodeId,
    pub builtins: ObjRef,
    pub globals: ObjRef,
}

impl CompilationKey {
    pub fn of(pre: &Preloader) -> Self {
        CompilationKey {
            code: pre.code.id,
            builtins: pre.builtins,
            globals: pre.globals,
        }
    }
}

#[derive(Clone, Debug)]
pub struct CompileOutcome {
    pub artifact: Option<Arc<CompiledArtifact>>,
    pub result: CompileResult,
}

impl CompileOutcome {
    fn success(artifact: Arc<CompiledArtifact>) -> Self {
        CompileOutcome {
            artifact: Some(artifact),
            result: CompileResult::Success,
        }
    }

    fn failed(result: CompileResult) -> Self {
        CompileOutcome { artifact: None, result }
    }
}

/// What the context knows about one installed function.
#[derive(Copy, Clone, Debug)]
struct FuncRecord {
    entry: JitEntry,
    deopted: bool,
    guard_failures: u32,
}

#[derive(Default)]
struct State {
    cache: FxHashMap<CompilationKey, Arc<CompiledArtifact>>,
    active: FxHashSet<CompilationKey>,
    /// Evicted artifacts. Functions may still be bound to them.
    orphans: Vec<Arc<CompiledArtifact>>,
    /// Installed functions; each holds a reference.
    funcs: FxHashMap<ObjRef, FuncRecord>,
    watches: WatchList,
    shut_down: bool,
}

pub struct Context {
    config: JitConfig,
    pipeline: PassPipeline,
    buffer: SharedCodeBuffer,
    state: Mutex<State>,
    /// Every artifact ever compiled, by entry id.
    entries: DashMap<u64, Arc<CompiledArtifact>>,
    next_entry: AtomicU64,
    profiles: TypeProfiles,
}

impl Context {
    pub fn new(config: JitConfig) -> Self {
        Context {
            pipeline: PassPipeline::new(config.passes.clone()),
            buffer: CodeBuffer::shared(config.code_buffer_bytes),
            config,
            state: Mutex::new(State::default()),
            entries: DashMap::new(),
            next_entry: AtomicU64::new(1),
            profiles: TypeProfiles::new(),
        }
    }

    /// Route the runtime's compiled calls and watch events through `self`.
    pub fn attach(self: &Arc<Self>, rt: &mut Runtime) {
        rt.set_hook(Arc::clone(self) as Arc<dyn JitHook>);
    }

    pub fn config(&self) -> &JitConfig {
        &self.config
    }

    pub fn buffer(&self) -> &SharedCodeBuffer {
        &self.buffer
    }

    pub fn profiles(&self) -> &TypeProfiles {
        &self.profiles
    }

    // ── Compilation ────────────────────────────────────────────────

    /// Compile a preloaded function, or return the cached artifact for its
    /// key. Returns [`CompileResult::Retry`] if another thread is
    /// compiling the same key.
    pub fn compile_preloaded(&self, pre: &Preloader) -> CompileOutcome {
        self.compile_preloaded_with(pre, &PreloaderMap::default())
    }

    /// Like [`Context::compile_preloaded`], with preloaded callees
    /// available to the inliner.
    pub fn compile_preloaded_with(&self, pre: &Preloader, callees: &PreloaderMap) -> CompileOutcome {
        let key = CompilationKey::of(pre);
        {
            let mut state = self.state.lock();
            if state.shut_down {
                return CompileOutcome::failed(CompileResult::CannotCompile);
            }
            if let Some(artifact) = state.cache.get(&key) {
                return CompileOutcome::success(Arc::clone(artifact));
            }
            if !state.active.insert(key) {
                tracing::debug!(function = %pre.code.name, "already being compiled");
                return CompileOutcome::failed(CompileResult::Retry);
            }
        }

        let compiled = self.compile(pre, callees, key);

        let mut state = self.state.lock();
        state.active.remove(&key);
        match compiled {
            Ok(artifact) => {
                let artifact = Arc::new(artifact);
                self.entries.insert(artifact.entry().0, Arc::clone(&artifact));
                state.cache.insert(key, Arc::clone(&artifact));
                CompileOutcome::success(artifact)
            }
            Err(err) => {
                tracing::warn!(error = %err, "compilation failed");
                CompileOutcome::failed(err.result())
            }
        }
    }

    fn compile(&self, pre: &Preloader, callees: &PreloaderMap, key: CompilationKey) -> Result<CompiledArtifact, JitError> {
        let function = pre.code.name;
        let span = tracing::debug_span!("compile", %function);
        let _guard = span.enter();

        let mut hir = build_hir(pre).map_err(|source| JitError::Build { function, source })?;
        let records = self.pipeline.run(&mut hir, pre, callees);
        let codegen = |source: CodegenError| JitError::Codegen { function, source };
        let generated = generate(&hir).map_err(codegen)?;
        let points: Vec<usize> = generated.code.patch_sites.iter().map(|p| p.offset).collect();
        let base = self.buffer.lock().append(&generated.code.bytes, &points).map_err(codegen)?;

        let id = self.next_entry.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(
            entry = id,
            base,
            code_size = generated.code.code_size(),
            deopts = generated.code.deopt.len(),
            passes = records.len(),
            inlined = hir.inline_stats.num_inlined,
            "compiled"
        );
        Ok(CompiledArtifact::new(id, key, generated, base, hir.inline_stats))
    }

    /// Preload `func` with its dependencies, compile it, and install the
    /// result. Exceptions raised while preloading propagate.
    pub fn compile_function(&self, rt: &mut Runtime, func: ObjRef) -> RtResult<CompileResult> {
        if rt.jit_state(func).active_entry().is_some() {
            return Ok(CompileResult::Success);
        }
        let cache = PreloaderCache::new();
        let preloaded = match preload_with_dependencies(rt, &cache, func, self.config.preload_dependency_limit) {
            Ok(preloaded) => preloaded,
            Err(raised) => {
                cache.release(rt);
                return Err(raised);
            }
        };
        let callees = cache.to_map();
        let outcome = match preloaded.last() {
            Some(root) => self.compile_preloaded_with(root, &callees),
            None => CompileOutcome::failed(CompileResult::UnknownError),
        };
        if let Some(artifact) = &outcome.artifact {
            self.install(rt, func, artifact);
        }
        cache.release(rt);
        Ok(outcome.result)
    }

    /// Bind `func` to `artifact`.
    pub fn install(&self, rt: &mut Runtime, func: ObjRef, artifact: &Arc<CompiledArtifact>) {
        artifact.materialize(rt);
        let entry = artifact.entry();
        let (fresh_keys, newly_tracked) = {
            let mut state = self.state.lock();
            let fresh = state.watches.register(artifact);
            let record = FuncRecord {
                entry,
                deopted: false,
                guard_failures: 0,
            };
            (fresh, state.funcs.insert(func, record).is_none())
        };
        if newly_tracked {
            rt.incref(func);
        }
        for key in fresh_keys {
            if let WatchKey::Namespace(ns) = key {
                rt.watch_namespace(ns);
            }
        }
        rt.set_jit_state(func, JitState::Compiled(entry));
        tracing::debug!(function = %artifact.name, entry = entry.0, "installed");
    }

    // ── Function state ─────────────────────────────────────────────

    /// Route `func` back to the interpreter, keeping its code. Returns
    /// `false` if it is not running compiled code.
    pub fn deopt(&self, rt: &mut Runtime, func: ObjRef) -> bool {
        let entry = {
            let mut state = self.state.lock();
            match state.funcs.get_mut(&func) {
                Some(record) if !record.deopted => {
                    record.deopted = true;
                    record.entry
                }
                _ => return false,
            }
        };
        rt.set_jit_state(func, JitState::Deopted(entry));
        true
    }

    /// Undo [`Context::deopt`]. Returns `false` if `func` is not
    /// deoptimized or its code is gone.
    pub fn reopt(&self, rt: &mut Runtime, func: ObjRef) -> bool {
        let entry = {
            let mut state = self.state.lock();
            if state.shut_down {
                return false;
            }
            match state.funcs.get_mut(&func) {
                Some(record) if record.deopted && self.entries.contains_key(&record.entry.0) => {
                    record.deopted = false;
                    record.guard_failures = 0;
                    record.entry
                }
                _ => return false,
            }
        };
        rt.set_jit_state(func, JitState::Compiled(entry));
        true
    }

    /// Count a guard failure in `func`'s compiled code; at the configured
    /// threshold the function is deoptimized. Returns whether it was.
    pub fn report_guard_failure(&self, rt: &mut Runtime, func: ObjRef) -> bool {
        let threshold = self.config.guard_failure_threshold;
        let failures = {
            let mut state = self.state.lock();
            let Some(record) = state.funcs.get_mut(&func) else {
                return false;
            };
            record.guard_failures = record.guard_failures.saturating_add(1);
            record.guard_failures
        };
        if threshold == 0 || failures < threshold {
            return false;
        }
        let deopted = self.deopt(rt, func);
        if deopted {
            let name = rt.function(func).map(|f| f.name);
            tracing::info!(function = ?name, failures, "too many guard failures, deoptimized");
        }
        deopted
    }

    /// Move every cached artifact to the orphan list. Functions bound to
    /// them keep running; new compiles start from scratch.
    pub fn clear_cache(&self) {
        let mut state = self.state.lock();
        let evicted: Vec<_> = state.cache.drain().map(|(_, a)| a).collect();
        tracing::debug!(evicted = evicted.len(), "cache cleared");
        state.orphans.extend(evicted);
    }

    /// Stop using compiled code: deoptimize every function, clear the
    /// cache, release the artifacts' runtime tables, and drop the
    /// references held on installed functions. Nothing compiles
    /// afterwards.
    pub fn shutdown(&self, rt: &mut Runtime) {
        for func in self.compiled_funcs() {
            self.deopt(rt, func);
        }
        self.clear_cache();
        let funcs: Vec<ObjRef> = {
            let mut state = self.state.lock();
            state.shut_down = true;
            state.funcs.drain().map(|(func, _)| func).collect()
        };
        let artifacts: Vec<Arc<CompiledArtifact>> = self.entries.iter().map(|e| Arc::clone(e.value())).collect();
        self.entries.clear();
        for artifact in &artifacts {
            artifact.release(rt);
        }
        rt.decref_all(funcs);
        tracing::debug!(artifacts = artifacts.len(), "shut down");
    }

    // ── Watch events ───────────────────────────────────────────────

    /// Invalidate every patch site that depends on `key`.
    pub fn invalidate(&self, key: WatchKey) -> usize {
        let sites = self.state.lock().watches.take(key);
        if sites.is_empty() {
            return 0;
        }
        if let Err(err) = watch::invalidate(&self.buffer, &sites) {
            tracing::error!(error = %err, ?key, "patching failed");
            return 0;
        }
        tracing::debug!(?key, sites = sites.len(), "patch sites invalidated");
        sites.len()
    }

    // ── Introspection ──────────────────────────────────────────────

    pub fn artifact_for(&self, entry: JitEntry) -> Option<Arc<CompiledArtifact>> {
        self.entries.get(&entry.0).map(|a| Arc::clone(a.value()))
    }

    /// The artifact `func` is bound to, deoptimized or not.
    pub fn artifact_of(&self, func: ObjRef) -> Option<Arc<CompiledArtifact>> {
        let entry = self.state.lock().funcs.get(&func)?.entry;
        self.artifact_for(entry)
    }

    /// Functions currently running compiled code.
    pub fn compiled_funcs(&self) -> Vec<ObjRef> {
        self.funcs_where(|r| !r.deopted)
    }

    pub fn deopted_funcs(&self) -> Vec<ObjRef> {
        self.funcs_where(|r| r.deopted)
    }

    fn funcs_where(&self, pred: impl Fn(&FuncRecord) -> bool) -> Vec<ObjRef> {
        let state = self.state.lock();
        let mut out: Vec<ObjRef> = state.funcs.iter().filter(|(_, r)| pred(r)).map(|(&f, _)| f).collect();
        out.sort_unstable();
        out
    }

    pub fn cache_len(&self) -> usize {
        self.state.lock().cache.len()
    }

    pub fn orphan_count(&self) -> usize {
        self.state.lock().orphans.len()
    }

    pub fn watched_keys(&self) -> Vec<WatchKey> {
        self.state.lock().watches.keys().collect()
    }

    pub fn code_bytes_used(&self) -> usize {
        self.buffer.lock().len()
    }

    /// Names of functions with cached code, sorted.
    pub fn cached_names(&self) -> Vec<Name> {
        let state = self.state.lock();
        let mut names: Vec<Name> = state.cache.values().map(|a| a.name).collect();
        names.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        names
    }
}
