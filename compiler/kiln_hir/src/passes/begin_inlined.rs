//! Drop inlined-function markers nobody needs.
//!
//! `BeginInlinedFunction` materializes a shadow frame for the callee so
//! the runtime sees it during the inlined body. That is only needed when
//! something in the body can deopt back into the callee's frame; a callee
//! whose body simplified down to pure operations keeps no frame state that
//! names it, and both its markers go.

use kiln_rt::{CodeId, ObjRef};
use rustc_hash::FxHashSet;

use crate::function::Function;
use crate::instr::{FrameState, InstrKind};

pub fn begin_inlined_function_elimination(func: &mut Function) {
    let mut needed: FxHashSet<(ObjRef, CodeId)> = FxHashSet::default();
    for instr in func.blocks().flat_map(|b| b.all_instrs()) {
        if let Some(d) = &instr.deopt {
            collect_frames(&d.frame, &mut needed);
        }
    }
    let needed_funcs: FxHashSet<ObjRef> = needed.iter().map(|&(f, _)| f).collect();

    let mut removed = 0usize;
    for block in func.blocks_mut() {
        let before = block.instrs.len();
        block.instrs.retain(|i| match &i.kind {
            InstrKind::BeginInlinedFunction { func, code } => needed.contains(&(*func, code.id)),
            InstrKind::EndInlinedFunction { func } => needed_funcs.contains(func),
            _ => true,
        });
        removed += before - block.instrs.len();
    }
    if removed > 0 {
        tracing::debug!(function = %func.name, removed, "removed inlined-function markers");
    }
}

fn collect_frames(frame: &FrameState, out: &mut FxHashSet<(ObjRef, CodeId)>) {
    if let Some(f) = frame.func {
        out.insert((f, frame.code.id));
    }
    if let Some(parent) = &frame.parent {
        collect_frames(parent, out);
    }
}

#[cfg(test)]
mod tests;
