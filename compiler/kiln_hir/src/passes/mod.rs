//! The HIR optimization pipeline.
//!
//! Passes run in a fixed canonical order. Optional passes are switched by
//! [`PassConfig`]; the order itself is not configurable because later
//! passes rely on what earlier ones establish (SSA form before everything,
//! a stable CFG before refcount insertion, refcounts before line
//! bookkeeping).
//!
//! # Pipeline
//!
//! 1. `ssaify`
//! 2. `simplify`
//! 3. `dynamic_comparison_elimination`
//! 4. `guard_type_removal`
//! 5. `phi_elimination` (with copy propagation and trampoline removal)
//! 6. `inline_function_calls` (optional)
//! 7. `begin_inlined_function_elimination` (optional)
//! 8. `builtin_load_method_elimination` (optional)
//! 9. `clean_cfg`
//! 10. `dead_code_elimination`
//! 11. `refcount_insertion`
//! 12. `insert_update_prev_instr` (optional)
//!
//! With [`PassConfig::verify`] (always in debug builds) the SSA checker and
//! the type-monotonicity checker run after every pass.

use std::time::{Duration, Instant};

use crate::checker;
use crate::function::Function;
use crate::instr::{Instr, InstrKind, PrimKind, Reg};
use crate::preload::{Preloader, PreloaderMap};
use crate::types::{Type, TypeSpec};

mod begin_inlined;
mod builtin_method;
mod clean_cfg;
mod dce;
mod dyn_compare;
mod guard_removal;
mod inline;
mod phi_elim;
mod refcount;
mod simplify;
mod ssa;
mod update_prev;

pub use begin_inlined::begin_inlined_function_elimination;
pub use builtin_method::builtin_load_method_elimination;
pub use clean_cfg::clean_cfg;
pub use dce::dead_code_elimination;
pub use dyn_compare::dynamic_comparison_elimination;
pub use guard_removal::guard_type_removal;
pub use inline::inline_function_calls;
pub use phi_elim::{copy_propagation, phi_elimination};
pub use refcount::refcount_insertion;
pub use simplify::simplify;
pub use ssa::ssaify;
pub use update_prev::insert_update_prev_instr;

/// Knobs for the optimization pipeline.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PassConfig {
    pub inliner: bool,
    /// Upper bound on the summed cost of all callees inlined into one
    /// function. Cost is the callee's bytecode instruction count.
    pub inline_cost_limit: usize,
    pub begin_inlined_elimination: bool,
    pub builtin_load_method_elimination: bool,
    pub update_prev_instr: bool,
    pub simplify_iteration_limit: u32,
    /// Blocks the simplifier may add to one function.
    pub simplify_new_block_limit: usize,
    /// Run the checkers after every pass even in release builds.
    pub verify: bool,
}

impl Default for PassConfig {
    fn default() -> Self {
        PassConfig {
            inliner: true,
            inline_cost_limit: 500,
            begin_inlined_elimination: true,
            builtin_load_method_elimination: true,
            update_prev_instr: true,
            simplify_iteration_limit: 10,
            simplify_new_block_limit: 64,
            verify: false,
        }
    }
}

/// One stage of the canonical pipeline.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub enum Pass {
    Ssaify,
    Simplify,
    DynamicComparisonElimination,
    GuardTypeRemoval,
    PhiElimination,
    InlineFunctionCalls,
    BeginInlinedFunctionElimination,
    BuiltinLoadMethodElimination,
    CleanCfg,
    DeadCodeElimination,
    RefcountInsertion,
    InsertUpdatePrevInstr,
}

impl Pass {
    pub const CANONICAL: [Pass; 12] = [
        Pass::Ssaify,
        Pass::Simplify,
        Pass::DynamicComparisonElimination,
        Pass::GuardTypeRemoval,
        Pass::PhiElimination,
        Pass::InlineFunctionCalls,
        Pass::BeginInlinedFunctionElimination,
        Pass::BuiltinLoadMethodElimination,
        Pass::CleanCfg,
        Pass::DeadCodeElimination,
        Pass::RefcountInsertion,
        Pass::InsertUpdatePrevInstr,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Pass::Ssaify => "ssaify",
            Pass::Simplify => "simplify",
            Pass::DynamicComparisonElimination => "dynamic_comparison_elimination",
            Pass::GuardTypeRemoval => "guard_type_removal",
            Pass::PhiElimination => "phi_elimination",
            Pass::InlineFunctionCalls => "inline_function_calls",
            Pass::BeginInlinedFunctionElimination => "begin_inlined_function_elimination",
            Pass::BuiltinLoadMethodElimination => "builtin_load_method_elimination",
            Pass::CleanCfg => "clean_cfg",
            Pass::DeadCodeElimination => "dead_code_elimination",
            Pass::RefcountInsertion => "refcount_insertion",
            Pass::InsertUpdatePrevInstr => "insert_update_prev_instr",
        }
    }

    pub fn is_enabled(self, config: &PassConfig) -> bool {
        match self {
            Pass::InlineFunctionCalls => config.inliner,
            Pass::BeginInlinedFunctionElimination => config.begin_inlined_elimination,
            Pass::BuiltinLoadMethodElimination => config.builtin_load_method_elimination,
            Pass::InsertUpdatePrevInstr => config.update_prev_instr,
            _ => true,
        }
    }

    /// Passes allowed to widen register types.
    fn relaxes_types(self) -> bool {
        matches!(self, Pass::GuardTypeRemoval)
    }
}

/// Inputs shared by every pass over one function.
pub struct PassContext<'a> {
    pub pre: &'a Preloader,
    pub callees: &'a PreloaderMap,
    pub config: &'a PassConfig,
}

/// Time spent in one pass and the function size afterwards.
#[derive(Clone, Debug)]
pub struct PassRecord {
    pub pass: Pass,
    pub elapsed: Duration,
    pub instrs: usize,
}

pub struct PassPipeline {
    config: PassConfig,
    passes: Vec<Pass>,
}

impl PassPipeline {
    /// The canonical pipeline with optional passes chosen by `config`.
    pub fn new(config: PassConfig) -> Self {
        let passes = Pass::CANONICAL
            .iter()
            .copied()
            .filter(|p| p.is_enabled(&config))
            .collect();
        PassPipeline { config, passes }
    }

    pub fn passes(&self) -> &[Pass] {
        &self.passes
    }

    pub fn config(&self) -> &PassConfig {
        &self.config
    }

    pub fn run(&self, func: &mut Function, pre: &Preloader, callees: &PreloaderMap) -> Vec<PassRecord> {
        let cx = PassContext {
            pre,
            callees,
            config: &self.config,
        };
        let verify = self.config.verify || cfg!(debug_assertions);
        let mut records = Vec::with_capacity(self.passes.len());

        for &pass in &self.passes {
            let span = tracing::debug_span!("pass", pass = pass.name(), function = %func.name);
            let _guard = span.enter();
            let before = verify.then(|| func.reg_types());
            let start = Instant::now();
            run_pass(pass, func, &cx);
            let elapsed = start.elapsed();

            if let Some(before) = before {
                checker::check_function(func);
                if !pass.relaxes_types() {
                    checker::check_type_monotonic(&before, func);
                }
            }
            tracing::debug!(
                elapsed_us = elapsed.as_micros() as u64,
                blocks = func.num_blocks(),
                instrs = func.instr_count(),
                "pass done"
            );
            tracing::trace!("{}", crate::printer::print_function(func));
            records.push(PassRecord {
                pass,
                elapsed,
                instrs: func.instr_count(),
            });
        }
        records
    }
}

fn run_pass(pass: Pass, func: &mut Function, cx: &PassContext<'_>) {
    match pass {
        Pass::Ssaify => ssaify(func),
        Pass::Simplify => simplify(func, cx),
        Pass::DynamicComparisonElimination => dynamic_comparison_elimination(func),
        Pass::GuardTypeRemoval => guard_type_removal(func),
        Pass::PhiElimination => phi_elimination(func),
        Pass::InlineFunctionCalls => inline_function_calls(func, cx),
        Pass::BeginInlinedFunctionElimination => begin_inlined_function_elimination(func),
        Pass::BuiltinLoadMethodElimination => builtin_load_method_elimination(func, cx.pre),
        Pass::CleanCfg => clean_cfg(func),
        Pass::DeadCodeElimination => dead_code_elimination(func),
        Pass::RefcountInsertion => refcount_insertion(func),
        Pass::InsertUpdatePrevInstr => insert_update_prev_instr(func),
    }
}

// ── Type refinement ────────────────────────────────────────────────

/// The type an instruction's output has given its operands' current
/// types, for instructions whose output type is derived. `None` means the
/// output type was fixed when the instruction was created.
pub(crate) fn derived_type(func: &Function, instr: &Instr) -> Option<Type> {
    let ty = |r: Reg| func.reg_type(r);
    match &instr.kind {
        InstrKind::Assign { src, .. } => Some(ty(*src)),
        InstrKind::Phi { inputs, .. } => {
            Some(inputs.iter().fold(Type::BOTTOM, |acc, &(_, r)| acc | ty(r)))
        }
        InstrKind::GuardType { src, ty: guard, .. } => Some(ty(*src).without_null() & *guard),
        InstrKind::CheckVar { src, .. }
        | InstrKind::CheckFreevar { src, .. }
        | InstrKind::CheckField { src, .. } => Some(ty(*src).without_null()),
        InstrKind::PrimitiveBox { src, kind, .. } => Some(boxed_of(ty(*src), *kind)),
        InstrKind::PrimitiveUnbox { src, kind, .. } => Some(unboxed_of(ty(*src), *kind)),
        _ => None,
    }
}

fn boxed_of(src: Type, kind: PrimKind) -> Type {
    match (kind, src.spec) {
        (PrimKind::Int64, TypeSpec::Int(v)) => Type::long_const(v),
        (PrimKind::Bool, TypeSpec::Bool(v)) => Type::bool_const(v),
        (PrimKind::Double, TypeSpec::Double(v)) => Type::double_const(v),
        _ => kind.boxed_type(),
    }
}

fn unboxed_of(src: Type, kind: PrimKind) -> Type {
    match (kind, src.spec) {
        (PrimKind::Int64, TypeSpec::Int(v)) => Type::cint64_const(v),
        (PrimKind::Bool, TypeSpec::Bool(v)) => Type::cbool_const(v),
        _ => kind.unboxed_type(),
    }
}

/// Narrow derived output types to a fixed point. Types only ever shrink
/// here; returns whether any changed.
pub(crate) fn refine_types(func: &mut Function) -> bool {
    let order = crate::graph::rpo(func);
    let mut any = false;
    loop {
        let mut changed = false;
        for &b in &order {
            let updates: Vec<(Reg, Type)> = func
                .block(b)
                .instrs
                .iter()
                .filter_map(|i| Some((i.output()?, derived_type(func, i)?)))
                .collect();
            for (r, computed) in updates {
                let old = func.reg_type(r);
                let new = old & computed;
                if new != old {
                    func.set_reg_type(r, new);
                    changed = true;
                }
            }
        }
        if !changed {
            break;
        }
        any = true;
    }
    any
}

// ── CFG helpers ────────────────────────────────────────────────────

/// Delete blocks unreachable from the entry, dropping the phi inputs they
/// fed. Returns whether any block was removed.
pub(crate) fn remove_unreachable_blocks(func: &mut Function) -> bool {
    let live = crate::graph::reachable(func);
    let dead: Vec<_> = func.block_ids().into_iter().filter(|b| !live.contains(b)).collect();
    for &d in &dead {
        let Some(block) = func.remove_block(d) else { continue };
        for succ in block.successors() {
            if func.has_block(succ) {
                func.remove_phi_inputs(succ, d);
            }
        }
    }
    !dead.is_empty()
}
