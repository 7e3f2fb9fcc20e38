//! Shared test utilities: compile bytecode through the real HIR pipeline
//! and run the result on a machine. Only compiled in test builds.

use std::sync::Arc;

use kiln_hir::{build_hir, Function, PassConfig, PassPipeline, Preloader};
use kiln_rt::{ArgAnnotation, BinOp, CmpOp, CodeBuilder, CodeUnit, ObjRef, Runtime};

use crate::code_buffer::{CodeBuffer, SharedCodeBuffer};
use crate::code_runtime::CodeRuntime;
use crate::error::CodegenError;
use crate::lir::{LirBlock, LirBlockId, LirFunction, LirInstr, LirTerm, ValueKind};
use crate::machine::{ExecContext, Exit, Machine};
use crate::{generate, Generated};

/// Code appended to the fixture's buffer, ready to run.
pub(crate) struct Loaded {
    pub generated: Generated,
    pub base: usize,
    pub runtime: CodeRuntime,
    pub func: ObjRef,
}

pub(crate) struct Fixture {
    pub rt: Runtime,
    pub globals: ObjRef,
    pub buffer: SharedCodeBuffer,
}

impl Fixture {
    pub fn new() -> Self {
        let mut rt = Runtime::new();
        let globals = rt.new_namespace("test");
        Fixture {
            rt,
            globals,
            buffer: CodeBuffer::shared(1 << 20),
        }
    }

    pub fn define(&mut self, code: Arc<CodeUnit>) -> ObjRef {
        let name = code.name.as_str();
        let func = self.rt.new_function(code, self.globals);
        self.rt.set_global(self.globals, name, func);
        func
    }

    /// Build and optimize HIR for an already defined function.
    pub fn optimize_func(&mut self, func: ObjRef) -> Function {
        let pre = match Preloader::resolve(&mut self.rt, func) {
            Ok(p) => p,
            Err(_) => panic!("preload raised: {:?}", self.rt.pending_exception()),
        };
        let mut hir = match build_hir(&pre) {
            Ok(f) => f,
            Err(e) => panic!("build failed: {e}"),
        };
        let config = PassConfig {
            verify: true,
            ..PassConfig::default()
        };
        PassPipeline::new(config).run(&mut hir, &pre, &Default::default());
        hir
    }

    /// Define `code`, compile it, and append it to the buffer.
    pub fn load(&mut self, code: Arc<CodeUnit>) -> Loaded {
        let func = self.define(code);
        self.load_func(func)
    }

    pub fn load_func(&mut self, func: ObjRef) -> Loaded {
        let hir = self.optimize_func(func);
        let generated = match generate(&hir) {
            Ok(g) => g,
            Err(e) => panic!("codegen failed: {e}"),
        };
        let points: Vec<usize> = generated.code.patch_sites.iter().map(|p| p.offset).collect();
        let base = match self.buffer.lock().append(&generated.code.bytes, &points) {
            Ok(base) => base,
            Err(e) => panic!("append failed: {e}"),
        };
        let lir = &generated.lir;
        let runtime = CodeRuntime::materialize(
            &mut self.rt,
            &lir.consts,
            lir.references.clone(),
            lir.names.clone(),
            lir.inlined_codes.clone(),
            lir.num_attr_caches,
        );
        Loaded {
            generated,
            base,
            runtime,
            func,
        }
    }

    /// Run `loaded` from the entry at `entry` with raw argument words.
    pub fn run_words(&mut self, loaded: &Loaded, entry: usize, args: &[u64]) -> (Machine, Result<Exit, CodegenError>) {
        let stack = loaded.generated.code.stack_size as usize + 8 * (args.len() + 8);
        let mut machine = Machine::new(stack);
        let mut ctx = ExecContext {
            rt: &mut self.rt,
            code: &loaded.runtime,
        };
        let exit = machine.invoke(&self.buffer, loaded.base + entry, loaded.func, args, &mut ctx);
        (machine, exit)
    }

    /// Run through the generic entry with borrowed object arguments.
    pub fn call(&mut self, loaded: &Loaded, args: &[ObjRef]) -> Exit {
        let words: Vec<u64> = args.iter().map(|a| a.to_word()).collect();
        match self.run_words(loaded, crate::GENERIC_ENTRY_OFFSET, &words).1 {
            Ok(exit) => exit,
            Err(e) => panic!("machine error: {e}"),
        }
    }

    pub fn int(&self, word: u64) -> Option<i64> {
        self.rt.int_value(ObjRef::from_word(word))
    }
}

/// A hand-built LIR function over `vregs` Int64 registers; block `i`
/// gets id `i`.
pub(crate) fn lir_function(blocks: Vec<(Vec<LirInstr>, LirTerm)>, vregs: usize) -> LirFunction {
    let code = CodeBuilder::new("f").build();
    LirFunction {
        name: code.name,
        code,
        blocks: blocks
            .into_iter()
            .enumerate()
            .map(|(i, (instrs, term))| LirBlock {
                id: LirBlockId(i as u32),
                instrs,
                term,
            })
            .collect(),
        kinds: vec![ValueKind::Int64; vregs],
        deopts: Vec::new(),
        arg_kinds: Vec::new(),
        return_kind: None,
        is_static: false,
        references: Vec::new(),
        consts: Vec::new(),
        names: Vec::new(),
        inlined_codes: Vec::new(),
        num_attr_caches: 0,
        inline_depth: 0,
    }
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

/// `def count(n): i = 0; while i < n: i = i + 1; return i`
pub(crate) fn count_loop() -> Arc<CodeUnit> {
    let mut cb = CodeBuilder::new("count").arg("n").local("i");
    let top = cb.label();
    let done = cb.label();
    cb.load_int(0)
        .store_fast("i")
        .bind(top)
        .load_fast("i")
        .load_fast("n")
        .compare(CmpOp::Lt)
        .pop_jump_if_false(done)
        .load_fast("i")
        .load_int(1)
        .binary(BinOp::Add)
        .store_fast("i")
        .jump(top)
        .bind(done)
        .load_fast("i")
        .ret()
        .build()
}

/// `def pick(c, a, b): return a if c else b`
pub(crate) fn pick() -> Arc<CodeUnit> {
    let mut cb = CodeBuilder::new("pick").arg("c").arg("a").arg("b");
    let other = cb.label();
    cb.load_fast("c")
        .pop_jump_if_false(other)
        .load_fast("a")
        .ret()
        .bind(other)
        .load_fast("b")
        .ret()
        .build()
}

/// `def get_g(): return g`
pub(crate) fn read_global() -> Arc<CodeUnit> {
    CodeBuilder::new("get_g").load_global("g").ret().build()
}
