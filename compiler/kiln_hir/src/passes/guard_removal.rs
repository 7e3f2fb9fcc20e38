//! Remove type guards whose refined type nothing relies on.
//!
//! A `GuardType` exists to give its output a narrower type. If no
//! instruction that depends on operand types (unboxing, field access,
//! static calls, ...) consumes the guard's output, directly or through
//! passthroughs and phis, the guard only costs a check and a deopt exit.
//! It becomes an `Assign`, and the types of values derived from it are
//! widened to match.
//!
//! This is the one pass allowed to widen register types.

use rustc_hash::FxHashSet;

use super::derived_type;
use crate::function::Function;
use crate::instr::{Instr, InstrKind, Reg};

pub fn guard_type_removal(func: &mut Function) {
    let required = required_regs(func);

    let mut relaxed: FxHashSet<Reg> = FxHashSet::default();
    let mut retype = Vec::new();
    for block in func.blocks_mut() {
        for instr in &mut block.instrs {
            if let InstrKind::GuardType { dst, src, .. } = instr.kind {
                if !required.contains(&dst) {
                    *instr = Instr::at(InstrKind::Assign { dst, src }, instr.bc_offset);
                    relaxed.insert(dst);
                    retype.push((dst, src));
                }
            }
        }
    }
    if relaxed.is_empty() {
        return;
    }
    for (dst, src) in retype {
        let ty = func.reg_type(src);
        func.set_reg_type(dst, ty);
    }
    widen_from(func, relaxed.clone());
    tracing::debug!(function = %func.name, removed = relaxed.len(), "removed guards");
}

/// Registers whose type some instruction depends on.
fn required_regs(func: &Function) -> FxHashSet<Reg> {
    let mut required = FxHashSet::default();
    let mut work = Vec::new();
    for instr in func.blocks().flat_map(|b| b.all_instrs()) {
        let mut mark = |r: Reg| {
            if required.insert(r) {
                work.push(r);
            }
        };
        match &instr.kind {
            InstrKind::PrimitiveUnbox { src, .. } => mark(*src),
            InstrKind::LoadTupleItem { tuple, .. } => mark(*tuple),
            InstrKind::CheckSequenceBounds { seq, .. } => mark(*seq),
            InstrKind::LoadField { obj, .. } | InstrKind::StoreField { obj, .. } => mark(*obj),
            InstrKind::CheckTypeAttrCache { receiver, .. }
            | InstrKind::FillTypeAttrCache { receiver, .. } => mark(*receiver),
            InstrKind::CallStatic { args, .. } | InstrKind::InvokeStaticFunction { args, .. } => {
                args.iter().copied().for_each(&mut mark);
            }
            InstrKind::LongBinaryOp { left, right, .. } => {
                mark(*left);
                mark(*right);
            }
            InstrKind::LoadFunctionCode { func, .. } => mark(*func),
            _ => {}
        }
    }

    // Propagate backwards through values the requirement flows from.
    let defs = func.def_sites();
    while let Some(r) = work.pop() {
        let Some(&(b, i)) = defs.get(&r) else { continue };
        let instr = &func.block(b).instrs[i];
        let sources: Vec<Reg> = match &instr.kind {
            InstrKind::Phi { inputs, .. } => inputs.iter().map(|&(_, v)| v).collect(),
            kind => kind.passthrough_source().into_iter().collect(),
        };
        for s in sources {
            if required.insert(s) {
                work.push(s);
            }
        }
    }
    required
}

/// Re-derive the types of everything downstream of `changed`, taking the
/// union with the current type.
fn widen_from(func: &mut Function, mut changed: FxHashSet<Reg>) {
    loop {
        let mut updates = Vec::new();
        for instr in func.blocks().flat_map(|b| b.instrs.iter()) {
            let Some(dst) = instr.output() else { continue };
            let mut touches = false;
            instr.kind.visit_operands(|r| touches |= changed.contains(&r));
            if !touches {
                continue;
            }
            if let Some(ty) = derived_type(func, instr) {
                let old = func.reg_type(dst);
                let new = old | ty;
                if new != old {
                    updates.push((dst, new));
                }
            }
        }
        if updates.is_empty() {
            break;
        }
        for (dst, ty) in updates {
            func.set_reg_type(dst, ty);
            changed.insert(dst);
        }
    }
}
