use pretty_assertions::assert_eq;

use super::*;
use crate::test_helpers::{count_loop, Fixture};

#[test]
fn slots_are_laid_out_below_saved_registers() {
    let layout = FrameLayout::new(vec![Gp::R9, Gp::R10], 1, 3, 4);
    assert_eq!(layout.callee_save_offset(0), -8);
    assert_eq!(layout.callee_save_offset(1), -16);
    assert_eq!(layout.args_offset(), -24);
    assert_eq!(layout.func_offset(), -32);
    assert_eq!(layout.inline_frame_offset(1), -40);
    assert_eq!(layout.spill_offset(0), -48);
    assert_eq!(layout.spill_offset(2), -64);
    assert_eq!(layout.spill_size(), 24);
}

#[test]
fn frame_size_counts_every_word() {
    let layout = FrameLayout::new(vec![Gp::R9, Gp::R10], 1, 3, 4);
    // 2 saved + args + func + 1 inline + 3 spills + 4 outgoing.
    assert_eq!(layout.frame_size(), 8 * 12);
    // The deepest spill slot stays above the outgoing area.
    assert!(-layout.spill_offset(2) <= layout.frame_size() - 8 * 4);
}

#[test]
fn empty_layout_still_holds_args_and_func() {
    let layout = FrameLayout::new(Vec::new(), 0, 0, 0);
    assert_eq!(layout.args_offset(), -8);
    assert_eq!(layout.func_offset(), -16);
    assert_eq!(layout.frame_size(), 16);
}

#[test]
fn function_without_inlining_needs_no_inline_slots() {
    let mut fx = Fixture::new();
    let func = fx.define(count_loop());
    let hir = fx.optimize_func(func);
    let (entry, max) = entry_inline_depths(&hir);
    assert_eq!(max, 0);
    assert_eq!(inlined_frame_slots(&hir), 0);
    assert!(entry.values().all(|&d| d == 0));
    assert_eq!(entry.get(&hir.entry), Some(&0));
}
