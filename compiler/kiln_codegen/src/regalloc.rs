//! Linear-scan register allocation over LIR.
//!
//! # Algorithm
//!
//! 1. Number instructions in emission order: the `k`-th instruction
//!    (terminators included) sits at position `2k`.
//! 2. Compute block liveness with a backward dataflow. Deopt metadata
//!    counts as a use; for a `Call` those uses sit at `p + 1`, since the
//!    deopt is taken after the call returns.
//! 3. Build one interval per vreg: the hull of its definitions, uses, and
//!    the block ranges it is live across.
//! 4. Scan intervals by start. An interval that spans a call position
//!    (`start < p < end`) must survive the clobber, so it may only take a
//!    callee-saved register; others prefer caller-saved registers. When
//!    nothing suitable is free, the interval among the active ones (and
//!    the current one) ending furthest is spilled.
//!
//! Each vreg gets exactly one location for its whole life. Spill slots are
//! reused once their interval has expired.
//!
//! # References
//!
//! - Poletto, Sarkar: "Linear Scan Register Allocation" (TOPLAS 1999)

use rustc_hash::{FxHashMap, FxHashSet};

use crate::isa::{Gp, ALLOCATABLE_CALLER_SAVED, CALLEE_SAVED};
use crate::lir::{LirBlock, LirFunction, VReg};

/// Where a vreg lives.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub enum Assignment {
    Reg(Gp),
    Spill(u32),
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Allocation {
    /// Indexed by vreg; `None` for vregs with no interval.
    pub locations: Vec<Option<Assignment>>,
    /// Callee-saved registers in use, in ascending order.
    pub used_callee_saved: Vec<Gp>,
    pub spill_slots: u32,
}

impl Allocation {
    pub fn location(&self, r: VReg) -> Option<Assignment> {
        self.locations.get(r.index()).copied().flatten()
    }
}

// ── Intervals ──────────────────────────────────────────────────────

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct Interval {
    pub vreg: VReg,
    pub start: u32,
    pub end: u32,
    pub crosses_call: bool,
}

fn extend(map: &mut FxHashMap<VReg, (u32, u32)>, r: VReg, pos: u32) {
    map.entry(r)
        .and_modify(|(s, e)| {
            *s = (*s).min(pos);
            *e = (*e).max(pos);
        })
        .or_insert((pos, pos));
}

/// Vregs read by `block` before any write, and vregs it writes.
fn gen_kill(func: &LirFunction, block: &LirBlock) -> (FxHashSet<VReg>, FxHashSet<VReg>) {
    let mut gen = FxHashSet::default();
    let mut kill = FxHashSet::default();
    let mut use_reg = |r: VReg, kill: &FxHashSet<VReg>| {
        if !kill.contains(&r) {
            gen.insert(r);
        }
    };
    for instr in &block.instrs {
        instr.visit_operands(|r| use_reg(r, &kill));
        if let Some(d) = instr.deopt() {
            func.deopt(d).visit_regs(|r| use_reg(r, &kill));
        }
        if let Some(dst) = instr.output() {
            kill.insert(dst);
        }
    }
    block.term.visit_operands(|r| use_reg(r, &kill));
    if let crate::lir::LirTerm::Deopt(d) = block.term {
        func.deopt(d).visit_regs(|r| use_reg(r, &kill));
    }
    (gen, kill)
}

/// Live-out set of each block, indexed like `func.blocks`.
pub fn live_out(func: &LirFunction) -> Vec<FxHashSet<VReg>> {
    let n = func.blocks.len();
    let (gens, kills): (Vec<_>, Vec<_>) = func.blocks.iter().map(|b| gen_kill(func, b)).unzip();
    let mut live_in: Vec<FxHashSet<VReg>> = vec![FxHashSet::default(); n];
    let mut live_out: Vec<FxHashSet<VReg>> = vec![FxHashSet::default(); n];
    loop {
        let mut changed = false;
        for i in (0..n).rev() {
            let mut out = FxHashSet::default();
            for succ in func.blocks[i].term.successors() {
                out.extend(live_in[succ.index()].iter().copied());
            }
            let mut inn: FxHashSet<VReg> = out.difference(&kills[i]).copied().collect();
            inn.extend(gens[i].iter().copied());
            if inn != live_in[i] || out != live_out[i] {
                live_in[i] = inn;
                live_out[i] = out;
                changed = true;
            }
        }
        if !changed {
            break;
        }
    }
    live_out
}

/// Intervals sorted by start, plus the positions of every call.
pub fn build_intervals(func: &LirFunction) -> Vec<Interval> {
    let live_out = live_out(func);
    let mut ranges: FxHashMap<VReg, (u32, u32)> = FxHashMap::default();
    let mut calls: Vec<u32> = Vec::new();
    let mut pos = 0u32;

    for (bi, block) in func.blocks.iter().enumerate() {
        let block_start = pos;
        // Live-in values are exactly those live-out of a predecessor or
        // used before definition here; both extend to the block start.
        let (gen, _) = gen_kill(func, block);
        for &r in &gen {
            extend(&mut ranges, r, block_start);
        }
        for instr in &block.instrs {
            let deopt_pos = if instr.is_call() {
                calls.push(pos);
                pos + 1
            } else {
                pos
            };
            instr.visit_operands(|r| extend(&mut ranges, r, pos));
            if let Some(d) = instr.deopt() {
                func.deopt(d).visit_regs(|r| extend(&mut ranges, r, deopt_pos));
            }
            if let Some(dst) = instr.output() {
                extend(&mut ranges, dst, deopt_pos);
            }
            pos += 2;
        }
        block.term.visit_operands(|r| extend(&mut ranges, r, pos));
        if let crate::lir::LirTerm::Deopt(d) = block.term {
            func.deopt(d).visit_regs(|r| extend(&mut ranges, r, pos));
        }
        let block_end = pos + 1;
        for &r in &live_out[bi] {
            extend(&mut ranges, r, block_start);
            extend(&mut ranges, r, block_end);
        }
        pos += 2;
    }

    let mut intervals: Vec<Interval> = ranges
        .into_iter()
        .map(|(vreg, (start, end))| Interval {
            vreg,
            start,
            end,
            crosses_call: calls.iter().any(|&p| start < p && p < end),
        })
        .collect();
    intervals.sort_by_key(|i| (i.start, i.vreg));
    intervals
}

// ── Scan ───────────────────────────────────────────────────────────

struct Active {
    interval: Interval,
    reg: Gp,
}

pub fn allocate(func: &LirFunction) -> Allocation {
    let intervals = build_intervals(func);
    let mut locations: Vec<Option<Assignment>> = vec![None; func.num_vregs()];
    let mut active: Vec<Active> = Vec::new();
    let mut free: FxHashSet<Gp> = ALLOCATABLE_CALLER_SAVED.iter().chain(CALLEE_SAVED.iter()).copied().collect();
    let mut used_callee_saved: FxHashSet<Gp> = FxHashSet::default();
    // End of the last interval stored in each spill slot.
    let mut slot_free_at: Vec<u32> = Vec::new();

    // A slot is reusable once its occupant has ended by `iv.start`.
    let mut spill = |iv: &Interval| {
        let slot = match slot_free_at.iter().position(|&end| end <= iv.start) {
            Some(slot) => slot,
            None => {
                slot_free_at.push(0);
                slot_free_at.len() - 1
            }
        };
        slot_free_at[slot] = iv.end;
        Assignment::Spill(slot as u32)
    };

    for interval in intervals {
        active.retain(|a| {
            if a.interval.end <= interval.start {
                free.insert(a.reg);
                false
            } else {
                true
            }
        });

        let acceptable = |r: &Gp| !interval.crosses_call || r.is_callee_saved();
        let pick = if interval.crosses_call {
            CALLEE_SAVED.iter().find(|r| free.contains(r)).copied()
        } else {
            ALLOCATABLE_CALLER_SAVED
                .iter()
                .chain(CALLEE_SAVED.iter())
                .find(|r| free.contains(r))
                .copied()
        };

        let reg = match pick {
            Some(r) => Some(r),
            None => {
                let victim = active
                    .iter()
                    .enumerate()
                    .filter(|(_, a)| acceptable(&a.reg))
                    .max_by_key(|(_, a)| a.interval.end)
                    .map(|(i, a)| (i, a.interval.end));
                match victim {
                    Some((i, end)) if end > interval.end => {
                        let a = active.swap_remove(i);
                        locations[a.interval.vreg.index()] = Some(spill(&a.interval));
                        free.insert(a.reg);
                        Some(a.reg)
                    }
                    _ => None,
                }
            }
        };

        match reg {
            Some(r) => {
                free.remove(&r);
                if r.is_callee_saved() {
                    used_callee_saved.insert(r);
                }
                locations[interval.vreg.index()] = Some(Assignment::Reg(r));
                active.push(Active { interval, reg: r });
            }
            None => locations[interval.vreg.index()] = Some(spill(&interval)),
        }
    }

    let spill_slots = slot_free_at.len() as u32;
    let mut used_callee_saved: Vec<Gp> = used_callee_saved.into_iter().collect();
    used_callee_saved.sort();
    tracing::trace!(
        function = %func.name,
        spill_slots,
        callee_saved = used_callee_saved.len(),
        "registers allocated"
    );
    Allocation {
        locations,
        used_callee_saved,
        spill_slots,
    }
}
