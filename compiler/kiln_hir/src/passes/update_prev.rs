//! Keep the frame's current instruction in sync.
//!
//! Compiled code does not update the shadow frame's instruction pointer as
//! it runs. Wherever the runtime can look at it (a call into user code, an
//! exception being raised), an `UpdatePrevInstr` first stores the offset
//! of the instruction being executed. Inside an inlined region the offset
//! is the callee's and lands in the callee's shadow frame.
//!
//! Within a block, a store is skipped when the frame and offset match the
//! previous one. Block entries, `BeginInlinedFunction` and
//! `EndInlinedFunction` forget what was stored.

use kiln_rt::CodeId;

use crate::effects::{deopt_reason, has_arbitrary_execution};
use crate::function::Function;
use crate::instr::{Instr, InstrKind};

pub fn insert_update_prev_instr(func: &mut Function) {
    let own_code = func.code.id;
    let mut inserted = 0usize;
    for block in func.blocks_mut() {
        let old = std::mem::take(&mut block.instrs);
        let mut instrs = Vec::with_capacity(old.len());
        let mut last: Option<(CodeId, u32)> = None;
        for instr in old.into_iter().chain(std::iter::once(block.term.clone())) {
            if matches!(
                instr.kind,
                InstrKind::BeginInlinedFunction { .. } | InstrKind::EndInlinedFunction { .. }
            ) {
                last = None;
            } else if observes_frame(&instr) {
                let key = (
                    instr.deopt.as_ref().map_or(own_code, |d| d.frame.code.id),
                    instr.bc_offset,
                );
                if last != Some(key) {
                    instrs.push(Instr::at(
                        InstrKind::UpdatePrevInstr { offset: key.1 },
                        instr.bc_offset,
                    ));
                    inserted += 1;
                    last = Some(key);
                }
            }
            if !instr.opcode().is_terminator() {
                instrs.push(instr);
            }
        }
        block.instrs = instrs;
    }
    if inserted > 0 {
        tracing::debug!(function = %func.name, inserted, "prev-instr updates inserted");
    }
}

/// Whether the runtime may inspect the frame while `instr` runs.
fn observes_frame(instr: &Instr) -> bool {
    let op = instr.opcode();
    has_arbitrary_execution(op) || deopt_reason(op).is_some_and(|r| r.has_pending_exception())
}
