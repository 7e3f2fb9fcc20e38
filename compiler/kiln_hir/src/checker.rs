//! HIR well-formedness checks.
//!
//! Run after every pass in debug builds. What is checked:
//!
//! 1. Terminators appear only in the terminator slot.
//! 2. Phis lead their block and have exactly one input per distinct
//!    predecessor.
//! 3. Every register is defined once, and only registers that exist are
//!    used.
//! 4. Definitions dominate uses. A phi input counts as a use at the end of
//!    its predecessor; frame-state registers count as uses at the
//!    instruction carrying them.
//!
//! Unreachable blocks are skipped for dominance: nothing runs them, and
//! the next CFG cleanup deletes them.

use rustc_hash::FxHashMap;

use crate::function::Function;
use crate::graph::{predecessors, Dominators};
use crate::instr::{BlockId, InstrKind, Reg};
use crate::types::Type;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CheckError {
    #[error("{block}: terminator {op} in instruction list")]
    TerminatorInBody { block: BlockId, op: &'static str },
    #[error("{block}: {op} in terminator slot")]
    NotATerminator { block: BlockId, op: &'static str },
    #[error("{block}: phi {reg} after a non-phi instruction")]
    PhiNotLeading { block: BlockId, reg: Reg },
    #[error("{block}: phi {reg} inputs do not match predecessors")]
    PhiInputs { block: BlockId, reg: Reg },
    #[error("{reg} defined more than once")]
    Redefined { reg: Reg },
    #[error("{block}: {reg} used but never defined")]
    Undefined { block: BlockId, reg: Reg },
    #[error("{block}: use of {reg} not dominated by its definition")]
    NotDominated { block: BlockId, reg: Reg },
    #[error("{block}: branch to missing block {target}")]
    MissingBlock { block: BlockId, target: BlockId },
}

/// Check `func`, reporting the first problem found.
pub fn validate(func: &Function) -> Result<(), CheckError> {
    let preds = predecessors(func);
    let mut defs: FxHashMap<Reg, (BlockId, usize)> = FxHashMap::default();

    for block in func.blocks() {
        let b = block.id;
        if !block.term.opcode().is_terminator() {
            return Err(CheckError::NotATerminator {
                block: b,
                op: block.term.opcode().name(),
            });
        }
        for target in block.successors() {
            if !func.has_block(target) {
                return Err(CheckError::MissingBlock { block: b, target });
            }
        }
        let mut in_phis = true;
        for (i, instr) in block.instrs.iter().enumerate() {
            let op = instr.opcode();
            if op.is_terminator() {
                return Err(CheckError::TerminatorInBody {
                    block: b,
                    op: op.name(),
                });
            }
            if let InstrKind::Phi { dst, inputs } = &instr.kind {
                if !in_phis {
                    return Err(CheckError::PhiNotLeading { block: b, reg: *dst });
                }
                let expected = &preds[b.index()];
                let matches = inputs.len() == expected.len()
                    && expected.iter().all(|p| inputs.iter().filter(|(q, _)| q == p).count() == 1);
                if !matches {
                    return Err(CheckError::PhiInputs { block: b, reg: *dst });
                }
            } else {
                in_phis = false;
            }
            if let Some(d) = instr.output() {
                if defs.insert(d, (b, i)).is_some() {
                    return Err(CheckError::Redefined { reg: d });
                }
            }
        }
    }

    let dom = Dominators::compute(func);
    let dominated = |def: (BlockId, usize), at: BlockId, index: usize| {
        if def.0 == at {
            def.1 < index
        } else {
            dom.dominates(def.0, at)
        }
    };
    for block in func.blocks() {
        let b = block.id;
        if !dom.is_reachable(b) {
            continue;
        }
        let end = block.instrs.len();
        for (i, instr) in block.all_instrs().enumerate() {
            if let InstrKind::Phi { inputs, .. } = &instr.kind {
                for &(pred, v) in inputs {
                    let def = *defs.get(&v).ok_or(CheckError::Undefined { block: b, reg: v })?;
                    if dom.is_reachable(pred) && !dominated(def, pred, usize::MAX) {
                        return Err(CheckError::NotDominated { block: b, reg: v });
                    }
                }
                continue;
            }
            let index = i.min(end);
            let mut bad: Option<CheckError> = None;
            instr.visit_uses(|r| {
                if bad.is_some() {
                    return;
                }
                if r.index() >= func.num_regs() {
                    bad = Some(CheckError::Undefined { block: b, reg: r });
                    return;
                }
                match defs.get(&r) {
                    None => bad = Some(CheckError::Undefined { block: b, reg: r }),
                    Some(&def) if !dominated(def, b, index) => {
                        bad = Some(CheckError::NotDominated { block: b, reg: r });
                    }
                    Some(_) => {}
                }
            });
            if let Some(err) = bad {
                return Err(err);
            }
        }
    }
    Ok(())
}

/// Panic with a dump of `func` if it is malformed.
pub fn check_function(func: &Function) {
    if let Err(err) = validate(func) {
        panic!(
            "malformed HIR in {}: {err}\n{}",
            func.name,
            crate::printer::print_function(func)
        );
    }
}

/// Panic if a register that existed before a pass got a wider type.
pub fn check_type_monotonic(before: &[Type], func: &Function) {
    for (i, &old) in before.iter().enumerate().take(func.num_regs()) {
        let new = func.reg_type(Reg::new(i as u32));
        assert!(
            new.is_subtype(old),
            "type of v{i} in {} widened from {old} to {new}",
            func.name
        );
    }
}

#[cfg(test)]
mod tests;
