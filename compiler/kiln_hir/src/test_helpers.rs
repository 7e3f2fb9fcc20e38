//! Shared test utilities for HIR construction and passes.
//!
//! Two styles are supported: hand-assembled CFGs for graph algorithms
//! (`empty_func`, `push`, `term`), and bytecode-driven functions built
//! through a real runtime and preloader (`Fixture`). Only compiled in test
//! builds.

use std::sync::Arc;

use kiln_rt::{BinOp, CmpOp, CodeBuilder, CodeUnit, ObjRef, Runtime};

use crate::builder::build_hir;
use crate::function::Function;
use crate::instr::{BlockId, Instr, InstrKind, Opcode, Reg};
use crate::passes::{PassConfig, PassPipeline};
use crate::preload::Preloader;
use crate::types::Type;

/// Shorthand for `Reg::new(n)`.
pub(crate) fn v(n: u32) -> Reg {
    Reg::new(n)
}

/// Shorthand for `BlockId::new(n)`.
pub(crate) fn b(n: u32) -> BlockId {
    BlockId::new(n)
}

/// A function with only an entry block and `nregs` registers of type `ty`.
pub(crate) fn empty_func(nregs: u32, ty: Type) -> Function {
    let code = CodeBuilder::new("t").load_none().ret().build();
    let mut func = Function::new(code, ObjRef::NULL);
    for _ in 0..nregs {
        func.new_reg(ty);
    }
    func
}

/// Append a body instruction.
pub(crate) fn push(func: &mut Function, block: BlockId, kind: InstrKind) {
    func.push(block, Instr::new(kind));
}

pub(crate) fn term(func: &mut Function, block: BlockId, kind: InstrKind) {
    func.set_term(block, Instr::new(kind));
}

/// Number of instructions with opcode `op`, terminators included.
pub(crate) fn count(func: &Function, op: Opcode) -> usize {
    func.blocks()
        .flat_map(|bl| bl.all_instrs())
        .filter(|i| i.opcode() == op)
        .count()
}

/// A runtime with one module namespace, for bytecode-driven tests.
pub(crate) struct Fixture {
    pub rt: Runtime,
    pub globals: ObjRef,
}

impl Fixture {
    pub fn new() -> Self {
        let mut rt = Runtime::new();
        let globals = rt.new_namespace("test");
        Fixture { rt, globals }
    }

    /// Create a function over `code` and bind it as a global.
    pub fn define(&mut self, code: Arc<CodeUnit>) -> ObjRef {
        let name = code.name.as_str();
        let func = self.rt.new_function(code, self.globals);
        self.rt.set_global(self.globals, name, func);
        func
    }

    pub fn preload(&mut self, func: ObjRef) -> Preloader {
        match Preloader::resolve(&mut self.rt, func) {
            Ok(p) => p,
            Err(_) => panic!("preload raised: {:?}", self.rt.pending_exception()),
        }
    }

    /// Define, preload and build `code` without running any pass.
    pub fn build(&mut self, code: Arc<CodeUnit>) -> (Preloader, Function) {
        let func = self.define(code);
        let pre = self.preload(func);
        let hir = match build_hir(&pre) {
            Ok(f) => f,
            Err(e) => panic!("build failed: {e}"),
        };
        (pre, hir)
    }

    /// Build `code` and run the full default pipeline with verification.
    pub fn optimize(&mut self, code: Arc<CodeUnit>) -> (Preloader, Function) {
        let (pre, mut hir) = self.build(code);
        let config = PassConfig {
            verify: true,
            ..PassConfig::default()
        };
        PassPipeline::new(config).run(&mut hir, &pre, &Default::default());
        (pre, hir)
    }
}

// ── Sample code units ──────────────────────────────────────────────

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

/// Number of phis across all blocks.
pub(crate) fn count_phis(func: &Function) -> usize {
    func.blocks().map(|bl| bl.num_phis()).sum()
}
