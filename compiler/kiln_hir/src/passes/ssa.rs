//! SSA construction.
//!
//! The builder models locals and cross-block stack slots as *variables*:
//! registers written by `Assign`, possibly many times. This pass renames
//! every read of a variable to the value reaching it and deletes the
//! copies, inserting phis where values merge.
//!
//! # Algorithm
//!
//! Braun et al., processing blocks in reverse postorder:
//!
//! - `write(var, block, value)` records the current definition.
//! - `read(var, block)` returns the local definition, else looks through
//!   predecessors. A block whose predecessors are not all processed
//!   ("unsealed") gets an operandless phi that is completed when the block
//!   is sealed; a block with one predecessor forwards to it; a merge point
//!   gets a phi whose operands are read from each predecessor.
//! - A block is sealed once every predecessor has been filled.
//!
//! Trivial phis are left for `phi_elimination`. Phi types are computed by
//! an optimistic fixed point starting from `Bottom`.
//!
//! # References
//!
//! - Braun, Buchwald, Hack, Leißa, Mallon, Zwinkau: "Simple and Efficient
//!   Construction of Static Single Assignment Form" (CC 2013)

use rustc_hash::{FxHashMap, FxHashSet};

use crate::function::Function;
use crate::graph::{predecessors, reachable, rpo, Preds};
use crate::instr::{BlockId, HirConst, Instr, InstrKind, Reg};
use crate::types::Type;

/// Put `func` into SSA form.
pub fn ssaify(func: &mut Function) {
    let vars: FxHashSet<Reg> = func
        .blocks()
        .flat_map(|b| b.instrs.iter())
        .filter_map(|i| match i.kind {
            InstrKind::Assign { dst, .. } => Some(dst),
            _ => None,
        })
        .collect();
    if vars.is_empty() {
        return;
    }

    let live = reachable(func);
    for id in func.block_ids() {
        if !live.contains(&id) {
            func.remove_block(id);
        }
    }

    let order = rpo(func);
    let preds = predecessors(func);
    let mut ssa = SsaBuilder {
        vars,
        current: FxHashMap::default(),
        sealed: FxHashSet::default(),
        filled: FxHashSet::default(),
        incomplete: FxHashMap::default(),
        phis: FxHashMap::default(),
        undef: None,
        preds,
    };

    for &b in &order {
        ssa.fill_block(func, b);
        ssa.filled.insert(b);
        for s in func.block(b).successors() {
            ssa.try_seal(func, s);
        }
        ssa.try_seal(func, b);
    }
    for &b in &order {
        ssa.try_seal(func, b);
    }

    ssa.materialize_phis(func);
    if let Some(undef) = ssa.undef {
        let entry = func.entry;
        func.block_mut(entry).instrs.insert(
            0,
            Instr::new(InstrKind::LoadConst {
                dst: undef,
                value: HirConst::Nullptr,
            }),
        );
    }
    super::refine_types(func);
    tracing::debug!(
        function = %func.name,
        variables = ssa.vars.len(),
        "ssa constructed"
    );
}

struct PhiData {
    block: BlockId,
    inputs: Vec<(BlockId, Reg)>,
}

struct SsaBuilder {
    vars: FxHashSet<Reg>,
    current: FxHashMap<(Reg, BlockId), Reg>,
    sealed: FxHashSet<BlockId>,
    filled: FxHashSet<BlockId>,
    incomplete: FxHashMap<BlockId, Vec<(Reg, Reg)>>,
    phis: FxHashMap<Reg, PhiData>,
    /// Value read on a path with no definition.
    undef: Option<Reg>,
    preds: Preds,
}

impl SsaBuilder {
    fn preds_of(&self, b: BlockId) -> Vec<BlockId> {
        self.preds[b.index()].to_vec()
    }

    fn fill_block(&mut self, func: &mut Function, b: BlockId) {
        let instrs = std::mem::take(&mut func.block_mut(b).instrs);
        let mut out = Vec::with_capacity(instrs.len());
        for mut instr in instrs {
            instr.map_uses(|r| {
                if self.vars.contains(r) {
                    *r = self.read(func, *r, b);
                }
            });
            match instr.kind {
                InstrKind::Assign { dst, src } if self.vars.contains(&dst) => {
                    self.current.insert((dst, b), src);
                }
                _ => {
                    if let Some(dst) = instr.output().filter(|d| self.vars.contains(d)) {
                        let fresh = func.new_reg(func.reg_type(dst));
                        if let Some(out) = instr.kind.output_mut() {
                            *out = fresh;
                        }
                        self.current.insert((dst, b), fresh);
                    }
                    out.push(instr);
                }
            }
        }
        let mut term = std::mem::replace(&mut func.block_mut(b).term, Instr::new(InstrKind::Unreachable));
        term.map_uses(|r| {
            if self.vars.contains(r) {
                *r = self.read(func, *r, b);
            }
        });
        let block = func.block_mut(b);
        block.instrs = out;
        block.term = term;
    }

    fn try_seal(&mut self, func: &mut Function, b: BlockId) {
        if self.sealed.contains(&b) {
            return;
        }
        if !self.preds[b.index()].iter().all(|p| self.filled.contains(p)) {
            return;
        }
        self.sealed.insert(b);
        for (var, phi) in self.incomplete.remove(&b).unwrap_or_default() {
            self.add_phi_operands(func, var, phi);
        }
    }

    fn read(&mut self, func: &mut Function, var: Reg, b: BlockId) -> Reg {
        // Walk single-predecessor chains iteratively; only merge points
        // and unsealed blocks need a phi.
        let mut chain = Vec::new();
        let mut at = b;
        let value = loop {
            if let Some(&v) = self.current.get(&(var, at)) {
                break v;
            }
            chain.push(at);
            if !self.sealed.contains(&at) {
                let phi = self.new_phi(func, at);
                self.incomplete.entry(at).or_default().push((var, phi));
                break phi;
            }
            match self.preds[at.index()].len() {
                0 => break self.undef(func),
                1 => at = self.preds[at.index()][0],
                _ => {
                    let phi = self.new_phi(func, at);
                    self.current.insert((var, at), phi);
                    self.add_phi_operands(func, var, phi);
                    break phi;
                }
            }
        };
        for blk in chain {
            self.current.insert((var, blk), value);
        }
        value
    }

    fn new_phi(&mut self, func: &mut Function, b: BlockId) -> Reg {
        let r = func.new_reg(Type::BOTTOM);
        self.phis.insert(
            r,
            PhiData {
                block: b,
                inputs: Vec::new(),
            },
        );
        r
    }

    fn add_phi_operands(&mut self, func: &mut Function, var: Reg, phi: Reg) {
        let Some(block) = self.phis.get(&phi).map(|p| p.block) else {
            return;
        };
        for pred in self.preds_of(block) {
            let v = self.read(func, var, pred);
            if let Some(data) = self.phis.get_mut(&phi) {
                data.inputs.push((pred, v));
            }
        }
    }

    fn undef(&mut self, func: &mut Function) -> Reg {
        *self.undef.get_or_insert_with(|| func.new_reg(Type::NULLPTR))
    }

    /// Insert the collected phis and compute their types.
    fn materialize_phis(&mut self, func: &mut Function) {
        // Optimistic typing: start at Bottom and grow to a fixed point.
        loop {
            let mut changed = false;
            for (&r, data) in &self.phis {
                let ty = data
                    .inputs
                    .iter()
                    .fold(Type::BOTTOM, |acc, &(_, v)| acc | func.reg_type(v));
                if ty != func.reg_type(r) {
                    func.set_reg_type(r, ty);
                    changed = true;
                }
            }
            if !changed {
                break;
            }
        }

        let mut by_block: FxHashMap<BlockId, Vec<(Reg, Vec<(BlockId, Reg)>)>> = FxHashMap::default();
        for (r, data) in self.phis.drain() {
            by_block.entry(data.block).or_default().push((r, data.inputs));
        }
        for (b, mut phis) in by_block {
            phis.sort_by_key(|(r, _)| *r);
            let block = func.block_mut(b);
            let body = std::mem::take(&mut block.instrs);
            block.instrs = phis
                .into_iter()
                .map(|(dst, inputs)| Instr::new(InstrKind::Phi { dst, inputs }))
                .chain(body)
                .collect();
        }
    }
}

#[cfg(test)]
mod tests;
