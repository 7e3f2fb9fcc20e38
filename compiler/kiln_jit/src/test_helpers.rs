//! Shared test utilities: a runtime with an attached context. Only
//! compiled in test builds.

use std::sync::Arc;

use kiln_hir::PassConfig;
use kiln_rt::{ArgAnnotation, BinOp, CodeBuilder, CodeUnit, ConstValue, ObjRef, RtResult, Runtime};

use crate::{CompileResult, Context, JitConfig};

pub(crate) fn test_config() -> JitConfig {
    JitConfig {
        passes: PassConfig {
            verify: true,
            ..PassConfig::default()
        },
        workers: 2,
        code_buffer_bytes: 1 << 20,
        ..JitConfig::default()
    }
}

pub(crate) struct Fixture {
    pub rt: Runtime,
    pub globals: ObjRef,
    pub ctx: Arc<Context>,
}

impl Fixture {
    pub fn new() -> Self {
        Self::with_config(test_config())
    }

    pub fn with_config(config: JitConfig) -> Self {
        let mut rt = Runtime::new();
        let globals = rt.new_namespace("test");
        let ctx = Arc::new(Context::new(config));
        ctx.attach(&mut rt);
        Fixture { rt, globals, ctx }
    }

    /// Bind a new function for `code` to its name in the test namespace.
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

    pub fn call(&mut self, func: ObjRef, args: &[ObjRef]) -> RtResult<ObjRef> {
        self.rt.call_function(func, args)
    }

    pub fn call_int(&mut self, func: ObjRef, args: &[i64]) -> Option<i64> {
        let args: Vec<ObjRef> = args.iter().map(|&a| self.rt.new_int(a)).collect();
        let result = self.call(func, &args);
        self.rt.decref_all(args);
        let value = result.ok()?;
        let int = self.rt.int_value(value);
        self.rt.decref(value);
        int
    }
}

/// Bind `answer` to a lazy global whose thunk raises.
pub(crate) fn define_raising_lazy(fx: &mut Fixture) {
    let thunk_code = CodeBuilder::new("thunk")
        .load_global("ValueError")
        .load_const(ConstValue::Str("no value".into()))
        .call_function(1)
        .raise()
        .build();
    let thunk = fx.rt.new_function(thunk_code, fx.globals);
    let lazy = fx.rt.new_lazy(thunk);
    fx.rt.decref(thunk);
    fx.rt.set_global(fx.globals, "answer", lazy);
    fx.rt.decref(lazy);
}

// ── Sample code units ──────────────────────────────────────────────

/// `def add(a, b): return a + b`
pub(crate) fn add_args() -> Arc<CodeUnit> {
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
pub(crate) fn add_static() -> Arc<CodeUnit> {
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

/// `def get_g(): return g`
pub(crate) fn read_global() -> Arc<CodeUnit> {
    CodeBuilder::new("get_g").load_global("g").ret().build()
}

/// `def get_len(): return len`
pub(crate) fn read_builtin() -> Arc<CodeUnit> {
    CodeBuilder::new("get_len").load_global("len").ret().build()
}
