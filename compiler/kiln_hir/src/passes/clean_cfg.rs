//! CFG cleanup.
//!
//! Repeats until stable:
//!
//! - remove blocks unreachable from the entry;
//! - turn a `CondBranch` with identical targets into a `Branch`;
//! - absorb a block into its predecessor when that predecessor jumps to it
//!   unconditionally and is its only predecessor;
//! - bypass empty trampoline blocks.
//!
//! Edge removal can leave single-input phis behind, so phi elimination
//! runs once more at the end.

use rustc_hash::FxHashMap;

use super::phi_elim::remove_trampoline_blocks;
use super::{phi_elimination, remove_unreachable_blocks};
use crate::function::Function;
use crate::graph::predecessors;
use crate::instr::{BlockId, Instr, InstrKind, Reg};

pub fn clean_cfg(func: &mut Function) {
    let mut rounds = 0u32;
    loop {
        rounds += 1;
        let mut changed = remove_unreachable_blocks(func);
        changed |= fold_same_target_branches(func);
        changed |= merge_straight_line_blocks(func);
        changed |= remove_trampoline_blocks(func) > 0;
        if !changed {
            break;
        }
    }
    phi_elimination(func);
    tracing::debug!(function = %func.name, rounds, blocks = func.num_blocks(), "cfg cleaned");
}

fn fold_same_target_branches(func: &mut Function) -> bool {
    let mut changed = false;
    for block in func.blocks_mut() {
        if let InstrKind::CondBranch {
            if_true, if_false, ..
        } = block.term.kind
        {
            if if_true == if_false {
                block.term = Instr::at(InstrKind::Branch { target: if_true }, block.term.bc_offset);
                changed = true;
            }
        }
    }
    changed
}

fn merge_straight_line_blocks(func: &mut Function) -> bool {
    let mut merged = false;
    loop {
        let preds = predecessors(func);
        let candidate = func.blocks().find_map(|b| match b.term.kind {
            InstrKind::Branch { target }
                if target != b.id
                    && target != func.entry
                    && preds[target.index()].as_slice() == [b.id] =>
            {
                Some((b.id, target))
            }
            _ => None,
        });
        let Some((pred, succ)) = candidate else { break };
        absorb(func, pred, succ);
        merged = true;
    }
    merged
}

/// Append `succ` to `pred`, its only predecessor.
fn absorb(func: &mut Function, pred: BlockId, succ: BlockId) {
    let Some(block) = func.remove_block(succ) else { return };
    let mut subst: FxHashMap<Reg, Reg> = FxHashMap::default();
    let mut body = Vec::with_capacity(block.instrs.len());
    for instr in block.instrs {
        match &instr.kind {
            InstrKind::Phi { dst, inputs } => {
                if let Some(&(_, v)) = inputs.first() {
                    subst.insert(*dst, v);
                }
            }
            _ => body.push(instr),
        }
    }
    for s in block.term.kind.successors() {
        func.retarget_phis(s, succ, pred);
    }
    let p = func.block_mut(pred);
    p.instrs.extend(body);
    p.term = block.term;
    func.replace_uses(&subst);
}

#[cfg(test)]
mod tests;
