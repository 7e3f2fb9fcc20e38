//! Trivial phi removal, copy propagation and trampoline removal.
//!
//! A phi is trivial when all its inputs are itself or one other value `v`;
//! it is replaced by `v`. Removing one trivial phi can make others trivial,
//! so this runs to a fixed point. A phi whose inputs are all itself has
//! no defined value and becomes `NULL`.
//!
//! Copy propagation then forwards every `Assign` to its source, and blocks
//! that only jump elsewhere are bypassed.

use rustc_hash::FxHashMap;

use super::{refine_types, remove_unreachable_blocks};
use crate::function::Function;
use crate::graph::predecessors;
use crate::instr::{BlockId, HirConst, Instr, InstrKind, Reg};
use crate::types::Type;

pub fn phi_elimination(func: &mut Function) {
    let mut removed = 0usize;
    loop {
        let mut subst: FxHashMap<Reg, Reg> = FxHashMap::default();
        let mut undefined = Vec::new();
        for block in func.blocks() {
            for phi in block.phis() {
                let InstrKind::Phi { dst, inputs } = &phi.kind else {
                    continue;
                };
                let mut unique: Option<Reg> = None;
                let mut trivial = true;
                for &(_, v) in inputs {
                    if v == *dst || Some(v) == unique {
                        continue;
                    }
                    if unique.is_some() {
                        trivial = false;
                        break;
                    }
                    unique = Some(v);
                }
                match (trivial, unique) {
                    (true, Some(v)) => {
                        subst.insert(*dst, v);
                    }
                    (true, None) => undefined.push(*dst),
                    _ => {}
                }
            }
        }
        if subst.is_empty() && undefined.is_empty() {
            break;
        }

        if !undefined.is_empty() {
            let null = func.new_reg(Type::NULLPTR);
            let entry = func.entry;
            func.block_mut(entry).instrs.insert(
                0,
                Instr::new(InstrKind::LoadConst {
                    dst: null,
                    value: HirConst::Nullptr,
                }),
            );
            for r in undefined {
                subst.insert(r, null);
            }
        }
        removed += subst.len();
        for block in func.blocks_mut() {
            block.instrs.retain(|i| match &i.kind {
                InstrKind::Phi { dst, .. } => !subst.contains_key(dst),
                _ => true,
            });
        }
        func.replace_uses(&subst);
    }

    let copies = copy_propagation(func);
    let bypassed = remove_trampoline_blocks(func);
    refine_types(func);
    tracing::debug!(function = %func.name, phis = removed, copies, bypassed, "phis eliminated");
}

/// Forward every `Assign` to its source and delete it. Returns the number
/// of copies removed.
pub fn copy_propagation(func: &mut Function) -> usize {
    let mut subst: FxHashMap<Reg, Reg> = FxHashMap::default();
    for block in func.blocks() {
        for instr in &block.instrs {
            if let InstrKind::Assign { dst, src } = instr.kind {
                subst.insert(dst, src);
            }
        }
    }
    if subst.is_empty() {
        return 0;
    }
    for block in func.blocks_mut() {
        block.instrs.retain(|i| !matches!(i.kind, InstrKind::Assign { .. }));
    }
    func.replace_uses(&subst);
    subst.len()
}

/// Bypass blocks that contain nothing but a jump. A trampoline into a
/// block with phis is kept unless its single predecessor can take its
/// place in those phis. Returns the number of blocks removed.
pub(crate) fn remove_trampoline_blocks(func: &mut Function) -> usize {
    let mut bypassed = 0;
    for t in func.block_ids() {
        if t == func.entry || !func.has_block(t) {
            continue;
        }
        let block = func.block(t);
        let InstrKind::Branch { target } = block.term.kind else {
            continue;
        };
        if !block.instrs.is_empty() || target == t {
            continue;
        }
        let preds = predecessors(func);
        let from = &preds[t.index()];
        if from.is_empty() || from.contains(&t) {
            continue;
        }
        let target_has_phis = func.block(target).num_phis() > 0;
        if target_has_phis {
            let [p] = from.as_slice() else { continue };
            if preds[target.index()].contains(p) {
                continue;
            }
            let p = *p;
            func.retarget_phis(target, t, p);
        }
        let from: Vec<BlockId> = from.to_vec();
        for p in from {
            func.block_mut(p).term.kind.map_successors(|s| {
                if *s == t {
                    *s = target;
                }
            });
        }
        bypassed += 1;
    }
    remove_unreachable_blocks(func);
    bypassed
}

#[cfg(test)]
mod tests;
