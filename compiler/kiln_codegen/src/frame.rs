//! Native frame layout.
//!
//! ```text
//!  fp + 0                  saved fp of the caller
//!  fp - 8 * (1..=C)        callee-saved registers the body uses
//!  args_offset             pointer to the argument words
//!  func_offset             the function object
//!  inline_frame_offset(d)  function of the inlined frame at depth d
//!  spill_offset(s)         spill slot s
//!  ...
//!  sp + 8 * i              outgoing helper arguments
//! ```
//!
//! The return address sits at `fp + 8`, pushed by the caller.

use kiln_hir::{Function, InstrKind};
use rustc_hash::FxHashMap;

use crate::isa::{Gp, WORD};

/// Deepest nesting of `BeginInlinedFunction`/`EndInlinedFunction`.
///
/// Every inlined frame needs a native slot recording its function, so this
/// is the number of such slots the frame reserves.
pub fn inlined_frame_slots(func: &Function) -> u32 {
    entry_inline_depths(func).1
}

/// Inline depth on entry to each reachable block, and the maximum depth.
pub fn entry_inline_depths(func: &Function) -> (FxHashMap<kiln_hir::BlockId, u32>, u32) {
    let mut entry: FxHashMap<kiln_hir::BlockId, u32> = FxHashMap::default();
    entry.insert(func.entry, 0);
    let mut max = 0;
    for b in kiln_hir::graph::rpo(func) {
        let mut depth = entry.get(&b).copied().unwrap_or(0);
        let block = func.block(b);
        for instr in &block.instrs {
            match instr.kind {
                InstrKind::BeginInlinedFunction { .. } => {
                    depth += 1;
                    max = max.max(depth);
                }
                InstrKind::EndInlinedFunction { .. } => depth = depth.saturating_sub(1),
                _ => {}
            }
        }
        for succ in block.successors() {
            entry.entry(succ).or_insert(depth);
        }
    }
    (entry, max)
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FrameLayout {
    pub callee_saved: Vec<Gp>,
    pub inline_slots: u32,
    pub spill_slots: u32,
    /// Words reserved at the bottom for helper arguments.
    pub outgoing_words: u32,
}

impl FrameLayout {
    pub fn new(callee_saved: Vec<Gp>, inline_slots: u32, spill_slots: u32, outgoing_words: u32) -> Self {
        FrameLayout {
            callee_saved,
            inline_slots,
            spill_slots,
            outgoing_words,
        }
    }

    pub fn callee_save_offset(&self, i: usize) -> i32 {
        -WORD * (i as i32 + 1)
    }

    pub fn args_offset(&self) -> i32 {
        -WORD * (self.callee_saved.len() as i32 + 1)
    }

    pub fn func_offset(&self) -> i32 {
        self.args_offset() - WORD
    }

    /// `depth` counts from 1 for the outermost inlined frame.
    pub fn inline_frame_offset(&self, depth: u32) -> i32 {
        self.func_offset() - WORD * depth as i32
    }

    pub fn spill_offset(&self, slot: u32) -> i32 {
        self.func_offset() - WORD * (self.inline_slots + slot + 1) as i32
    }

    /// Bytes between `fp` and `sp` once the prologue has run.
    pub fn frame_size(&self) -> i32 {
        let words = self.callee_saved.len() as u32 + 2 + self.inline_slots + self.spill_slots + self.outgoing_words;
        WORD * words as i32
    }

    /// Bytes spent on spill slots.
    pub fn spill_size(&self) -> u32 {
        self.spill_slots * WORD as u32
    }
}

#[cfg(test)]
mod tests;
