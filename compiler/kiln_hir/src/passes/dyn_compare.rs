//! Fuse a generic comparison with the truthiness test of its result.
//!
//! `c = Compare a, b; t = IsTruthy c; CondBranch t` becomes
//! `t = CompareBool a, b; CondBranch t`, skipping the boxed bool. The
//! rewrite applies only when `c` has no other use anywhere, including
//! deopt frame states other than the truthiness test's own (which
//! disappears with it), and `t` feeds nothing but the branch.

use rustc_hash::FxHashSet;

use crate::function::Function;
use crate::instr::{BlockId, Instr, InstrKind, Reg};
use crate::liveness::compute_liveness_filtered;

pub fn dynamic_comparison_elimination(func: &mut Function) {
    let candidates = find_candidates(func);
    if candidates.is_empty() {
        return;
    }
    let tracked: FxHashSet<Reg> = candidates.iter().map(|&(_, _, c)| c).collect();
    let liveness = compute_liveness_filtered(func, |r| tracked.contains(&r));

    let mut fused = 0usize;
    for (b, idx, c) in candidates {
        if liveness.live_out(b).contains(&c) {
            continue;
        }
        let block = func.block_mut(b);
        let compare = &block.instrs[idx];
        let InstrKind::Compare { op, left, right, .. } = compare.kind else {
            continue;
        };
        let InstrKind::IsTruthy { dst: t, .. } = block.instrs[idx + 1].kind else {
            continue;
        };
        let fused_instr = Instr {
            kind: InstrKind::CompareBool {
                dst: t,
                op,
                left,
                right,
            },
            bc_offset: compare.bc_offset,
            deopt: compare.deopt.clone(),
        };
        block.instrs[idx] = fused_instr;
        block.instrs.remove(idx + 1);
        fused += 1;
    }
    if fused > 0 {
        tracing::debug!(function = %func.name, fused, "fused comparisons");
    }
}

/// `(block, index of Compare, compare output)` for every fusable pair.
/// Indices within a block are returned in descending order so removals
/// do not disturb pending ones.
fn find_candidates(func: &Function) -> Vec<(BlockId, usize, Reg)> {
    let uses = func.use_counts();
    let mut out = Vec::new();
    for block in func.blocks() {
        let InstrKind::CondBranch { cond, .. } = block.term.kind else {
            continue;
        };
        let mut found = Vec::new();
        for (i, pair) in block.instrs.windows(2).enumerate() {
            let (InstrKind::Compare { dst: c, .. }, InstrKind::IsTruthy { dst: t, src }) =
                (&pair[0].kind, &pair[1].kind)
            else {
                continue;
            };
            if src != c || *t != cond || uses[t.index()] != 1 {
                continue;
            }
            let mut own = 0u32;
            if let Some(d) = &pair[1].deopt {
                d.visit_regs(&mut |r| {
                    if r == *c {
                        own += 1;
                    }
                });
            }
            if uses[c.index()] == 1 + own {
                found.push((block.id, i, *c));
            }
        }
        found.reverse();
        out.extend(found);
    }
    out
}
