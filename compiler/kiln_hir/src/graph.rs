//! Shared CFG analyses.
//!
//! Passes depend on this module rather than on each other. Side tables are
//! indexed by [`BlockId::index`] and sized by
//! [`Function::block_capacity`]; entries for removed blocks stay empty.

use rustc_hash::FxHashSet;
use smallvec::SmallVec;

use crate::function::Function;
use crate::instr::BlockId;

pub type Preds = Vec<SmallVec<[BlockId; 4]>>;

/// Distinct predecessors of every reachable-or-not live block.
pub fn predecessors(func: &Function) -> Preds {
    let mut preds: Preds = vec![SmallVec::new(); func.block_capacity()];
    for block in func.blocks() {
        let mut seen: SmallVec<[BlockId; 2]> = SmallVec::new();
        for succ in block.successors() {
            if !seen.contains(&succ) {
                seen.push(succ);
                preds[succ.index()].push(block.id);
            }
        }
    }
    preds
}

/// Postorder over blocks reachable from the entry.
pub fn postorder(func: &Function) -> Vec<BlockId> {
    let mut visited = vec![false; func.block_capacity()];
    let mut order = Vec::with_capacity(func.num_blocks());
    // (block, next successor index)
    let mut stack: Vec<(BlockId, usize)> = vec![(func.entry, 0)];
    visited[func.entry.index()] = true;
    while let Some(top) = stack.last_mut() {
        let b = top.0;
        let succs = func.block(b).successors();
        if let Some(&s) = succs.get(top.1) {
            top.1 += 1;
            if !visited[s.index()] {
                visited[s.index()] = true;
                stack.push((s, 0));
            }
        } else {
            order.push(b);
            stack.pop();
        }
    }
    order
}

/// Reverse postorder: every block precedes its successors except along
/// back edges.
pub fn rpo(func: &Function) -> Vec<BlockId> {
    let mut order = postorder(func);
    order.reverse();
    order
}

pub fn reachable(func: &Function) -> FxHashSet<BlockId> {
    postorder(func).into_iter().collect()
}

/// Immediate dominators (Cooper, Harvey, Kennedy).
///
/// # References
///
/// - Cooper, Harvey, Kennedy: "A Simple, Fast Dominance Algorithm" (2001)
pub struct Dominators {
    idom: Vec<Option<BlockId>>,
    rpo_index: Vec<usize>,
}

impl Dominators {
    pub fn compute(func: &Function) -> Self {
        let order = rpo(func);
        let preds = predecessors(func);
        let cap = func.block_capacity();
        let mut rpo_index = vec![usize::MAX; cap];
        for (i, b) in order.iter().enumerate() {
            rpo_index[b.index()] = i;
        }
        let mut idom: Vec<Option<BlockId>> = vec![None; cap];
        idom[func.entry.index()] = Some(func.entry);

        let mut changed = true;
        while changed {
            changed = false;
            for &b in order.iter().skip(1) {
                let mut new_idom: Option<BlockId> = None;
                for &p in &preds[b.index()] {
                    if idom[p.index()].is_none() {
                        continue;
                    }
                    new_idom = Some(match new_idom {
                        None => p,
                        Some(cur) => intersect(&idom, &rpo_index, p, cur),
                    });
                }
                if new_idom.is_some() && idom[b.index()] != new_idom {
                    idom[b.index()] = new_idom;
                    changed = true;
                }
            }
        }
        Dominators { idom, rpo_index }
    }

    pub fn idom(&self, b: BlockId) -> Option<BlockId> {
        self.idom.get(b.index()).copied().flatten()
    }

    pub fn is_reachable(&self, b: BlockId) -> bool {
        self.idom(b).is_some()
    }

    /// Whether `a` dominates `b` (reflexive).
    pub fn dominates(&self, a: BlockId, b: BlockId) -> bool {
        if !self.is_reachable(b) {
            return true;
        }
        let mut cur = b;
        loop {
            if cur == a {
                return true;
            }
            match self.idom(cur) {
                Some(next) if next != cur => cur = next,
                _ => return false,
            }
        }
    }

    pub fn rpo_index(&self, b: BlockId) -> usize {
        self.rpo_index[b.index()]
    }
}

fn intersect(idom: &[Option<BlockId>], rpo_index: &[usize], a: BlockId, b: BlockId) -> BlockId {
    let (mut x, mut y) = (a, b);
    while x != y {
        while rpo_index[x.index()] > rpo_index[y.index()] {
            x = idom[x.index()].unwrap_or(x);
        }
        while rpo_index[y.index()] > rpo_index[x.index()] {
            y = idom[y.index()].unwrap_or(y);
        }
    }
    x
}

/// Whether the edge `from -> to` is critical: `from` has several
/// successors and `to` has several predecessors.
pub fn is_critical_edge(func: &Function, preds: &Preds, from: BlockId, to: BlockId) -> bool {
    func.block(from).successors().len() > 1 && preds[to.index()].len() > 1
}
