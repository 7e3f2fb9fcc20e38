//! Dead code elimination.
//!
//! Mark and sweep: instructions that can deopt, run arbitrary code, or
//! store to memory are roots, as are terminators; everything they use is
//! live, transitively. Any other instruction whose output is not live is
//! removed. Dead phi cycles go with it.

use rustc_hash::{FxHashMap, FxHashSet};

use crate::effects::{deopt_reason, has_arbitrary_execution, memory_effects};
use crate::function::Function;
use crate::instr::{Instr, Reg};

/// Whether `instr` may be deleted when its output is unused.
fn is_removable(instr: &Instr) -> bool {
    if instr.output().is_none() {
        return false;
    }
    if instr.is_phi() {
        return true;
    }
    let op = instr.opcode();
    deopt_reason(op).is_none()
        && !has_arbitrary_execution(op)
        && memory_effects(instr).may_store.is_empty()
}

pub fn dead_code_elimination(func: &mut Function) {
    let mut defs: FxHashMap<Reg, &Instr> = FxHashMap::default();
    let mut live: FxHashSet<Reg> = FxHashSet::default();
    let mut work: Vec<Reg> = Vec::new();
    for block in func.blocks() {
        for instr in block.all_instrs() {
            if let Some(d) = instr.output() {
                defs.insert(d, instr);
            }
            if !is_removable(instr) {
                instr.visit_uses(|r| {
                    if live.insert(r) {
                        work.push(r);
                    }
                });
            }
        }
    }
    while let Some(r) = work.pop() {
        let Some(def) = defs.get(&r) else { continue };
        def.visit_uses(|u| {
            if live.insert(u) {
                work.push(u);
            }
        });
    }
    drop(defs);

    let mut removed = 0usize;
    for block in func.blocks_mut() {
        let before = block.instrs.len();
        block.instrs.retain(|i| match i.output() {
            Some(d) if is_removable(i) => live.contains(&d),
            _ => true,
        });
        removed += before - block.instrs.len();
    }
    if removed > 0 {
        tracing::debug!(function = %func.name, removed, "removed dead instructions");
    }
}
