//! Backward dataflow liveness over HIR registers.
//!
//! Computes which registers are live at each block boundary. Used by
//! dynamic comparison elimination (is an intermediate used elsewhere?),
//! refcount insertion (where does a reference die?), and LIR interval
//! construction.
//!
//! # Algorithm
//!
//! 1. Precompute `gen`/`kill` per block with a forward scan. Phi outputs
//!    are kills at block entry; deopt frame-state registers are uses.
//! 2. Iterate in postorder until no set changes:
//!    - `live_out(B) = ∪ live_in(S) ∪ phi_inputs(S, from B)`
//!    - `live_in(B) = gen(B) ∪ (live_out(B) − kill(B))`
//!
//! Phi inputs are uses at the end of the corresponding predecessor, not in
//! the phi's own block.
//!
//! # References
//!
//! - Appel: "Modern Compiler Implementation" §10.1

use rustc_hash::FxHashSet;

use crate::function::{Block, Function};
use crate::graph::postorder;
use crate::instr::{BlockId, InstrKind, Reg};

pub type LiveSet = FxHashSet<Reg>;

pub struct BlockLiveness {
    /// Indexed by `BlockId::index()`.
    pub live_in: Vec<LiveSet>,
    pub live_out: Vec<LiveSet>,
}

impl BlockLiveness {
    pub fn live_in(&self, b: BlockId) -> &LiveSet {
        &self.live_in[b.index()]
    }

    pub fn live_out(&self, b: BlockId) -> &LiveSet {
        &self.live_out[b.index()]
    }
}

/// Liveness of every register.
pub fn compute_liveness(func: &Function) -> BlockLiveness {
    compute_liveness_filtered(func, |_| true)
}

/// Liveness restricted to registers accepted by `tracked`.
pub fn compute_liveness_filtered(func: &Function, tracked: impl Fn(Reg) -> bool) -> BlockLiveness {
    let cap = func.block_capacity();
    let mut gen: Vec<LiveSet> = vec![LiveSet::default(); cap];
    let mut kill: Vec<LiveSet> = vec![LiveSet::default(); cap];
    for block in func.blocks() {
        let (g, k) = gen_kill(block, &tracked);
        gen[block.id.index()] = g;
        kill[block.id.index()] = k;
    }

    let order = postorder(func);
    let mut live_in: Vec<LiveSet> = vec![LiveSet::default(); cap];
    let mut live_out: Vec<LiveSet> = vec![LiveSet::default(); cap];

    let mut iterations = 0u32;
    loop {
        iterations += 1;
        let mut changed = false;
        for &b in &order {
            let block = func.block(b);
            let mut out = LiveSet::default();
            for succ in block.successors() {
                out.extend(live_in[succ.index()].iter().copied());
                for phi in func.block(succ).phis() {
                    if let InstrKind::Phi { inputs, .. } = &phi.kind {
                        for &(pred, r) in inputs {
                            if pred == b && tracked(r) {
                                out.insert(r);
                            }
                        }
                    }
                }
            }
            let mut inn = gen[b.index()].clone();
            for &r in &out {
                if !kill[b.index()].contains(&r) {
                    inn.insert(r);
                }
            }
            if inn != live_in[b.index()] || out != live_out[b.index()] {
                live_in[b.index()] = inn;
                live_out[b.index()] = out;
                changed = true;
            }
        }
        if !changed {
            break;
        }
    }

    tracing::trace!(function = %func.name, iterations, "liveness converged");
    BlockLiveness { live_in, live_out }
}

fn gen_kill(block: &Block, tracked: &impl Fn(Reg) -> bool) -> (LiveSet, LiveSet) {
    let mut gen = LiveSet::default();
    let mut kill = LiveSet::default();
    for instr in block.all_instrs() {
        if !instr.is_phi() {
            instr.visit_uses(|r| {
                if tracked(r) && !kill.contains(&r) {
                    gen.insert(r);
                }
            });
        }
        if let Some(dst) = instr.output() {
            if tracked(dst) {
                kill.insert(dst);
            }
        }
    }
    (gen, kill)
}

#[cfg(test)]
mod tests;
