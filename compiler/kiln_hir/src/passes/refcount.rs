//! Reference count insertion.
//!
//! Until this pass HIR ignores reference counts. Afterwards every owned
//! reference is released exactly once on every path, every stolen operand
//! receives a reference of its own, and every deopting instruction lists
//! the references compiled code holds at that point.
//!
//! # Model
//!
//! Passthrough outputs (guards, checks, copies) alias their source; all
//! bookkeeping is done on the *root* of an alias chain. A root is
//!
//! - **owned** when its definition returns a new reference (calls, boxes,
//!   phis);
//! - **promoted** when it borrows from memory some later store could
//!   clobber (globals, fields, cache entries): an `Incref` right after the
//!   definition turns it into an owned reference;
//! - **borrowed** when it borrows from something that outlives the
//!   function (arguments, constants);
//! - **untracked** when its type is not reference counted.
//!
//! # Algorithm
//!
//! 1. Split edges from multi-way branches into blocks with phis or several
//!    predecessors, so every edge that needs code has a block to hold it.
//! 2. Compute register liveness and map it onto tracked roots.
//! 3. Walk each block backward from the set of roots live at its end:
//!    - an output not live afterwards is released right after its
//!      definition;
//!    - a stolen operand is transferred if this is its last use and
//!      increfed otherwise;
//!    - any other last use is followed by a release.
//! 4. On an edge into phis, transfer (or incref) each input to the phi.
//!    On an edge out of a multi-way branch, release at the head of the
//!    successor whatever dies along that edge.
//!
//! # References
//!
//! - Lean 4: `src/Lean/Compiler/IR/RC.lean`

use rustc_hash::{FxHashMap, FxHashSet};

use crate::effects::{memory_effects, OutputEffect};
use crate::function::Function;
use crate::graph::predecessors;
use crate::instr::{BlockId, Instr, InstrKind, LiveRef, Reg, RefKind};
use crate::liveness::compute_liveness;

pub fn refcount_insertion(func: &mut Function) {
    let split = split_edges(func);
    let roots = Roots::compute(func);

    let liveness = compute_liveness(func);
    let mut live_in: Vec<FxHashSet<Reg>> = vec![FxHashSet::default(); func.block_capacity()];
    for b in func.block_ids() {
        live_in[b.index()] = liveness
            .live_in(b)
            .iter()
            .map(|&r| roots.root(r))
            .filter(|&r| roots.is_owned(r))
            .collect();
    }

    let mut plans: Vec<(BlockId, Plan)> = Vec::new();
    let mut entry_releases: FxHashMap<BlockId, Vec<Reg>> = FxHashMap::default();
    for b in func.block_ids() {
        let (plan, releases) = plan_block(func, &roots, &live_in, b);
        for (succ, regs) in releases {
            entry_releases.entry(succ).or_default().extend(regs);
        }
        plans.push((b, plan));
    }

    let mut stats = Stats::default();
    for (b, plan) in plans {
        apply(func, b, plan, &mut stats);
    }
    for (succ, regs) in entry_releases {
        let head = func.block(succ);
        let at = head.num_phis();
        let bc_offset = head.instrs.get(at).map_or(head.term.bc_offset, |i| i.bc_offset);
        let releases: Vec<Instr> = regs.into_iter().map(|r| release(func, r, bc_offset)).collect();
        stats.decrefs += releases.len();
        let block = func.block_mut(succ);
        block.instrs.splice(at..at, releases);
    }

    tracing::debug!(
        function = %func.name,
        split,
        increfs = stats.increfs,
        decrefs = stats.decrefs,
        "refcounts inserted"
    );
}

#[derive(Default)]
struct Stats {
    increfs: usize,
    decrefs: usize,
}

// ── Edge splitting ─────────────────────────────────────────────────

fn split_edges(func: &mut Function) -> usize {
    let preds = predecessors(func);
    let mut split = 0;
    for b in func.block_ids() {
        let succs = func.block(b).successors();
        if succs.len() < 2 {
            continue;
        }
        let mut seen: Vec<BlockId> = Vec::new();
        for s in succs {
            if seen.contains(&s) {
                continue;
            }
            seen.push(s);
            if func.block(s).num_phis() == 0 && preds[s.index()].len() < 2 {
                continue;
            }
            let bc_offset = func.block(b).term.bc_offset;
            let mid = func.new_block();
            func.set_term(mid, Instr::at(InstrKind::Branch { target: s }, bc_offset));
            func.retarget_phis(s, b, mid);
            func.block_mut(b).term.kind.map_successors(|t| {
                if *t == s {
                    *t = mid;
                }
            });
            split += 1;
        }
    }
    split
}

// ── Roots ──────────────────────────────────────────────────────────

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
enum Ownership {
    Untracked,
    Borrowed,
    Promoted,
    Owned,
}

struct Roots {
    root: Vec<Reg>,
    /// Indexed by root register.
    class: Vec<Ownership>,
}

impl Roots {
    fn compute(func: &Function) -> Self {
        let n = func.num_regs();
        let mut defs: Vec<Option<&Instr>> = vec![None; n];
        for instr in func.blocks().flat_map(|b| b.all_instrs()) {
            if let Some(d) = instr.output() {
                defs[d.index()] = Some(instr);
            }
        }

        let mut root: Vec<Reg> = (0..n as u32).map(Reg::new).collect();
        for (i, slot) in root.iter_mut().enumerate() {
            let mut r = Reg::new(i as u32);
            for _ in 0..n {
                match defs[r.index()].and_then(|d| d.kind.passthrough_source()) {
                    Some(src) => r = src,
                    None => break,
                }
            }
            *slot = r;
        }

        let class = (0..n)
            .map(|i| {
                let r = Reg::new(i as u32);
                if !func.reg_type(r).is_refcounted() {
                    return Ownership::Untracked;
                }
                let Some(def) = defs[i] else {
                    return Ownership::Untracked;
                };
                if def.is_phi() {
                    return Ownership::Owned;
                }
                match memory_effects(def).output {
                    OutputEffect::Owned => Ownership::Owned,
                    OutputEffect::Borrowed(support) if support.is_empty() => Ownership::Borrowed,
                    OutputEffect::Borrowed(_) => Ownership::Promoted,
                    OutputEffect::None => Ownership::Untracked,
                }
            })
            .collect();
        Roots { root, class }
    }

    fn root(&self, r: Reg) -> Reg {
        self.root[r.index()]
    }

    fn class(&self, root: Reg) -> Ownership {
        self.class[root.index()]
    }

    /// Whether compiled code holds its own reference to `root`.
    fn is_owned(&self, root: Reg) -> bool {
        matches!(self.class(root), Ownership::Owned | Ownership::Promoted)
    }
}

// ── Planning ───────────────────────────────────────────────────────

/// Code to add around the instructions of one block.
#[derive(Default)]
struct Plan {
    /// Indexed like the block's instructions.
    before: Vec<Vec<Instr>>,
    after: Vec<Vec<Instr>>,
    live_refs: Vec<Option<Vec<LiveRef>>>,
    /// Releases of phi outputs nobody uses.
    after_phis: Vec<Instr>,
    /// Before the terminator: edge increfs, then the terminator's own.
    before_term: Vec<Instr>,
    term_live_refs: Option<Vec<LiveRef>>,
}

struct Effect {
    before: Vec<Instr>,
    after: Vec<Instr>,
    live_refs: Option<Vec<LiveRef>>,
}

fn plan_block(
    func: &Function,
    roots: &Roots,
    live_in: &[FxHashSet<Reg>],
    b: BlockId,
) -> (Plan, Vec<(BlockId, Vec<Reg>)>) {
    let block = func.block(b);
    let n = block.instrs.len();
    let mut plan = Plan {
        before: vec![Vec::new(); n],
        after: vec![Vec::new(); n],
        live_refs: vec![None; n],
        ..Plan::default()
    };
    let mut releases = Vec::new();
    let mut live: FxHashSet<Reg> = FxHashSet::default();
    let term_offset = block.term.bc_offset;

    let succs = block.successors();
    match succs.as_slice() {
        [] => {}
        [s] => {
            let s = *s;
            live.extend(live_in[s.index()].iter().copied());
            let mut moved: FxHashSet<Reg> = FxHashSet::default();
            let mut dropped: Vec<Reg> = Vec::new();
            for phi in func.block(s).phis() {
                let InstrKind::Phi { dst, inputs } = &phi.kind else { continue };
                let Some(&(_, v)) = inputs.iter().find(|(p, _)| *p == b) else {
                    continue;
                };
                let r = roots.root(v);
                if roots.class(*dst) == Ownership::Owned {
                    match roots.class(r) {
                        Ownership::Untracked => {}
                        Ownership::Borrowed => plan.before_term.push(incref(v, term_offset)),
                        Ownership::Promoted | Ownership::Owned => {
                            if live_in[s.index()].contains(&r) || !moved.insert(r) {
                                plan.before_term.push(incref(v, term_offset));
                            }
                        }
                    }
                } else if roots.is_owned(r)
                    && !live_in[s.index()].contains(&r)
                    && !dropped.contains(&r)
                {
                    dropped.push(r);
                }
                if roots.is_owned(r) {
                    live.insert(r);
                }
            }
            for r in dropped {
                if !moved.contains(&r) {
                    plan.before_term.push(release(func, r, term_offset));
                }
            }
        }
        _ => {
            for s in &succs {
                live.extend(live_in[s.index()].iter().copied());
            }
            for s in &succs {
                let mut dying: Vec<Reg> = live
                    .iter()
                    .copied()
                    .filter(|r| !live_in[s.index()].contains(r))
                    .collect();
                if !dying.is_empty() {
                    dying.sort_unstable();
                    releases.push((*s, dying));
                }
            }
        }
    }

    let effect = visit(func, roots, &block.term, &mut live, true);
    plan.before_term.extend(effect.before);
    plan.term_live_refs = effect.live_refs;

    for i in (block.num_phis()..n).rev() {
        let effect = visit(func, roots, &block.instrs[i], &mut live, false);
        plan.before[i] = effect.before;
        plan.after[i] = effect.after;
        plan.live_refs[i] = effect.live_refs;
    }

    for phi in block.phis() {
        let Some(d) = phi.output() else { continue };
        if roots.class(d) == Ownership::Owned && !live.contains(&d) {
            plan.after_phis.push(release(func, d, phi.bc_offset));
        }
        live.remove(&d);
    }
    (plan, releases)
}

/// Step `live` backward over `instr`.
fn visit(
    func: &Function,
    roots: &Roots,
    instr: &Instr,
    live: &mut FxHashSet<Reg>,
    is_term: bool,
) -> Effect {
    let mut effect = Effect {
        before: Vec::new(),
        after: Vec::new(),
        live_refs: None,
    };
    let at = instr.bc_offset;

    if let Some(d) = instr.output() {
        if roots.root(d) == d {
            match roots.class(d) {
                Ownership::Owned if !live.contains(&d) => effect.after.push(release(func, d, at)),
                Ownership::Promoted if live.contains(&d) => effect.after.push(incref(d, at)),
                _ => {}
            }
            live.remove(&d);
        }
    }

    let stolen = memory_effects(instr).stolen;
    let mut consumed: FxHashSet<Reg> = FxHashSet::default();
    let mut used: Vec<Reg> = Vec::new();
    for (j, op) in instr.kind.operands().into_iter().enumerate() {
        let r = roots.root(op);
        if stolen.contains(j) {
            match roots.class(r) {
                Ownership::Untracked => {}
                Ownership::Borrowed => effect.before.push(incref(op, at)),
                Ownership::Promoted | Ownership::Owned => {
                    if live.contains(&r) || consumed.contains(&r) {
                        effect.before.push(incref(op, at));
                    } else {
                        consumed.insert(r);
                    }
                }
            }
        }
        if roots.is_owned(r) && !used.contains(&r) {
            used.push(r);
        }
    }
    if let Some(deopt) = &instr.deopt {
        deopt.frame.visit_regs(&mut |f| {
            let r = roots.root(f);
            if roots.is_owned(r) && !used.contains(&r) {
                used.push(r);
            }
        });
    }

    // Dying at a terminator only happens on exit paths, where the deopt
    // metadata or the consuming instruction accounts for the reference.
    if !is_term {
        let mut dying: Vec<Reg> = used
            .iter()
            .copied()
            .filter(|r| !live.contains(r) && !consumed.contains(r))
            .collect();
        dying.sort_unstable();
        effect.after.extend(dying.into_iter().map(|r| release(func, r, at)));
    }

    if let Some(deopt) = &instr.deopt {
        let mut held: Vec<Reg> = live
            .iter()
            .chain(used.iter())
            .copied()
            .filter(|r| !consumed.contains(r))
            .collect();
        held.sort_unstable();
        held.dedup();
        let mut refs: Vec<LiveRef> = held
            .into_iter()
            .map(|reg| LiveRef {
                reg,
                kind: RefKind::Owned,
            })
            .collect();
        deopt.frame.visit_regs(&mut |f| {
            if refs.iter().any(|l| l.reg == f) {
                return;
            }
            let kind = if func.reg_type(f).is_refcounted() {
                RefKind::Borrowed
            } else {
                RefKind::Uncounted
            };
            refs.push(LiveRef { reg: f, kind });
        });
        effect.live_refs = Some(refs);
    }

    live.extend(used);
    effect
}

fn apply(func: &mut Function, b: BlockId, plan: Plan, stats: &mut Stats) {
    let block = func.block_mut(b);
    let nphis = block.num_phis();
    let old = std::mem::take(&mut block.instrs);
    let mut instrs = Vec::with_capacity(old.len() + plan.after_phis.len());
    let mut before = plan.before.into_iter();
    let mut after = plan.after.into_iter();
    let mut live_refs = plan.live_refs.into_iter();

    let count = |is: &[Instr], stats: &mut Stats| {
        for i in is {
            match i.kind {
                InstrKind::Incref { .. } => stats.increfs += 1,
                InstrKind::Decref { .. } | InstrKind::XDecref { .. } => stats.decrefs += 1,
                _ => {}
            }
        }
    };

    for (i, mut instr) in old.into_iter().enumerate() {
        let pre = before.next().unwrap_or_default();
        let post = after.next().unwrap_or_default();
        let refs = live_refs.next().flatten();
        if let (Some(refs), Some(d)) = (refs, instr.deopt.as_mut()) {
            d.live = refs;
        }
        count(&pre, stats);
        count(&post, stats);
        instrs.extend(pre);
        instrs.push(instr);
        instrs.extend(post);
        if i + 1 == nphis {
            count(&plan.after_phis, stats);
            instrs.extend(plan.after_phis.iter().cloned());
        }
    }
    if nphis == 0 {
        count(&plan.after_phis, stats);
        instrs.splice(0..0, plan.after_phis);
    }
    count(&plan.before_term, stats);
    instrs.extend(plan.before_term);

    let block = func.block_mut(b);
    block.instrs = instrs;
    if let (Some(refs), Some(d)) = (plan.term_live_refs, block.term.deopt.as_mut()) {
        d.live = refs;
    }
}

fn incref(r: Reg, bc_offset: u32) -> Instr {
    Instr::at(InstrKind::Incref { src: r }, bc_offset)
}

/// `Decref`, or `XDecref` when the register may hold `NULL`.
fn release(func: &Function, r: Reg, bc_offset: u32) -> Instr {
    let kind = if func.reg_type(r).maybe_null() {
        InstrKind::XDecref { src: r }
    } else {
        InstrKind::Decref { src: r }
    };
    Instr::at(kind, bc_offset)
}
