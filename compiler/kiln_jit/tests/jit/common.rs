//! Runtime fixture and sample code shared by the end-to-end tests.

use std::sync::Arc;

use kiln_hir::PassConfig;
use kiln_jit::{CompileResult, CompiledArtifact, Context, JitConfig};
use kiln_rt::{ArgAnnotation, BinOp, CmpOp, CodeBuilder, CodeUnit, ExcKind, JitState, ObjRef, Runtime};

pub fn config() -> JitConfig {
    JitConfig {
        passes: PassConfig {
            verify: true,
            ..PassConfig::default()
        },
        workers: 4,
        code_buffer_bytes: 1 << 20,
        ..JitConfig::default()
    }
}

/// A runtime with one module namespace, optionally with a JIT attached.
pub struct Jit {
    pub rt: Runtime,
    pub globals: ObjRef,
    pub ctx: Arc<Context>,
}

impl Jit {
    pub fn new() -> Self {
        Self::with_config(config())
    }

    pub fn with_config(config: JitConfig) -> Self {
        let mut jit = Self::detached(config);
        jit.ctx.attach(&mut jit.rt);
        jit
    }

    /// A context the runtime never calls into: every call interprets.
    pub fn detached(config: JitConfig) -> Self {
        let mut rt = Runtime::new();
        let globals = rt.new_namespace("test");
        Jit {
            rt,
            globals,
            ctx: Arc::new(Context::new(config)),
        }
    }

    pub fn interpreter() -> Self {
        Self::detached(config())
    }

    pub fn define(&mut self, code: Arc<CodeUnit>) -> ObjRef {
        let name = code.name.as_str();
        let func = self.rt.new_function(code, self.globals);
        self.rt.set_global(self.globals, name, func);
        self.rt.decref(func);
        func
    }

    pub fn compile(&mut self, func: ObjRef) -> CompileResult {
        match self.ctx.compile_function(&mut self.rt, func) {
            Ok(result) => result,
            Err(_) => panic!("preload raised: {:?}", self.rt.pending_exception()),
        }
    }

    /// Define and compile, failing the test unless compilation succeeds.
    pub fn compiled(&mut self, code: Arc<CodeUnit>) -> ObjRef {
        let func = self.define(code);
        assert_eq!(self.compile(func), CompileResult::Success);
        func
    }

    pub fn artifact(&self, func: ObjRef) -> Arc<CompiledArtifact> {
        let Some(artifact) = self.ctx.artifact_of(func) else {
            panic!("function is not installed");
        };
        artifact
    }

    /// Call with int arguments. An exception is returned as its kind and
    /// cleared.
    pub fn call_ints(&mut self, func: ObjRef, args: &[i64]) -> Result<i64, ExcKind> {
        let args: Vec<ObjRef> = args.iter().map(|&a| self.rt.new_int(a)).collect();
        let result = self.call_objs(func, &args);
        self.rt.decref_all(args);
        result
    }

    /// Call with borrowed object arguments, expecting an int result.
    pub fn call_objs(&mut self, func: ObjRef, args: &[ObjRef]) -> Result<i64, ExcKind> {
        let live = self.balance(func);
        let result = match self.rt.call_function(func, args) {
            Ok(value) => {
                let int = self.rt.int_value(value);
                self.rt.decref(value);
                int.ok_or(ExcKind::TypeError)
            }
            Err(_) => Err(self.take_exception()),
        };
        self.assert_balanced(func, live);
        result
    }

    pub fn call_static(&mut self, func: ObjRef, args: &[u64]) -> Result<u64, ExcKind> {
        let live = self.balance(func);
        let result = self.rt.call_static(func, args).map_err(|_| self.take_exception());
        self.assert_balanced(func, live);
        result
    }

    /// Live objects and `func`'s state before a call.
    fn balance(&self, func: ObjRef) -> (usize, JitState) {
        (self.rt.heap.live_count(), self.rt.jit_state(func))
    }

    /// Once the result and any exception are released, a call leaves the
    /// heap as it found it. A call that compiles or deopts `func` is
    /// exempt: installing code materializes its constants.
    fn assert_balanced(&self, func: ObjRef, (live, state): (usize, JitState)) {
        if self.rt.jit_state(func) == state {
            assert_eq!(self.rt.heap.live_count(), live, "call changed the number of live objects");
        }
    }

    pub fn take_exception(&mut self) -> ExcKind {
        let Some((kind, _)) = self.rt.pending_exception() else {
            panic!("call failed without a pending exception");
        };
        self.rt.clear_pending();
        kind
    }

    pub fn set_int_global(&mut self, name: &str, value: i64) {
        let obj = self.rt.new_int(value);
        self.rt.set_global(self.globals, name, obj);
        self.rt.decref(obj);
    }
}

// ── Sample code ────────────────────────────────────────────────────

/// `def add(a, b): return a + b`
pub fn add() -> Arc<CodeUnit> {
    CodeBuilder::new("add")
        .arg("a")
        .arg("b")
        .load_fast("a")
        .load_fast("b")
        .binary(BinOp::Add)
        .ret()
        .build()
}

/// `def add64(a: int64, b: int64) -> int64: return a + b`
pub fn add64() -> Arc<CodeUnit> {
    CodeBuilder::new("add64")
        .typed_arg("a", ArgAnnotation::Int64)
        .typed_arg("b", ArgAnnotation::Int64)
        .returns(ArgAnnotation::Int64)
        .load_fast("a")
        .load_fast("b")
        .binary(BinOp::Add)
        .ret()
        .build()
}

/// `def add64_twice(a): return add64(a, 1) + add64(a, 2)`
pub fn add64_twice() -> Arc<CodeUnit> {
    CodeBuilder::new("add64_twice")
        .arg("a")
        .load_global("add64")
        .load_fast("a")
        .load_int(1)
        .call_function(2)
        .load_global("add64")
        .load_fast("a")
        .load_int(2)
        .call_function(2)
        .binary(BinOp::Add)
        .ret()
        .build()
}

/// `def inc(x): return x + 1`
pub fn inc() -> Arc<CodeUnit> {
    CodeBuilder::new("inc")
        .arg("x")
        .load_fast("x")
        .load_int(1)
        .binary(BinOp::Add)
        .ret()
        .build()
}

/// `def inc_both(a): return inc(a) + inc(a)`
pub fn inc_both() -> Arc<CodeUnit> {
    CodeBuilder::new("inc_both")
        .arg("a")
        .load_global("inc")
        .load_fast("a")
        .call_function(1)
        .load_global("inc")
        .load_fast("a")
        .call_function(1)
        .binary(BinOp::Add)
        .ret()
        .build()
}

/// ```text
/// def sum_to(n):
///     acc = 0
///     while n > 0:
///         acc = acc + n
///         n = n - 1
///     return acc
/// ```
pub fn sum_to() -> Arc<CodeUnit> {
    let mut b = CodeBuilder::new("sum_to").arg("n").local("acc");
    let top = b.label();
    let done = b.label();
    b.load_int(0)
        .store_fast("acc")
        .bind(top)
        .load_fast("n")
        .load_int(0)
        .compare(CmpOp::Gt)
        .pop_jump_if_false(done)
        .load_fast("acc")
        .load_fast("n")
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
        .build()
}

/// `def get_g(): return g`
pub fn get_g() -> Arc<CodeUnit> {
    CodeBuilder::new("get_g").load_global("g").ret().build()
}

/// `def get_len(): return len`
pub fn get_len() -> Arc<CodeUnit> {
    CodeBuilder::new("get_len").load_global("len").ret().build()
}
