use std::sync::Arc;

use kiln_rt::{CodeBuilder, ObjRef};
use pretty_assertions::assert_eq;

use super::*;
use crate::instr::{Instr, Opcode};
use crate::types::Type;
use crate::test_helpers::{b, count, empty_func, push, term, v};

const CALLEE: ObjRef = ObjRef::from_raw(7);

/// A caller with one inlined region around a guard on `v0`. The guard's
/// frame names the callee when `deopts_into_callee` is set.
fn inlined_region(deopts_into_callee: bool) -> Function {
    let callee = CodeBuilder::new("callee").arg("x").load_fast("x").ret().build();
    let mut f = empty_func(2, Type::OBJECT);
    push(&mut f, b(0), InstrKind::LoadArg { dst: v(0), idx: 0 });
    push(
        &mut f,
        b(0),
        InstrKind::BeginInlinedFunction {
            func: CALLEE,
            code: Arc::clone(&callee),
        },
    );
    let caller_frame = FrameState::new(Arc::clone(&f.code), Some(f.func));
    let frame = if deopts_into_callee {
        let mut inner = FrameState::new(callee, Some(CALLEE));
        inner.parent = Some(Box::new(caller_frame));
        inner
    } else {
        caller_frame
    };
    f.push(
        b(0),
        Instr::new(InstrKind::GuardType {
            dst: v(1),
            src: v(0),
            ty: Type::LONG,
        })
        .with_deopt(frame),
    );
    push(&mut f, b(0), InstrKind::EndInlinedFunction { func: CALLEE });
    term(&mut f, b(0), InstrKind::Return { value: v(1) });
    f
}

#[test]
fn markers_without_callee_frames_are_removed() {
    let mut f = inlined_region(false);
    begin_inlined_function_elimination(&mut f);
    assert_eq!(count(&f, Opcode::BeginInlinedFunction), 0);
    assert_eq!(count(&f, Opcode::EndInlinedFunction), 0);
    assert_eq!(count(&f, Opcode::GuardType), 1);
}

#[test]
fn markers_named_by_a_deopt_frame_stay() {
    let mut f = inlined_region(true);
    begin_inlined_function_elimination(&mut f);
    assert_eq!(count(&f, Opcode::BeginInlinedFunction), 1);
    assert_eq!(count(&f, Opcode::EndInlinedFunction), 1);
}
