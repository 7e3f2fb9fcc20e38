use std::sync::Arc;

use kiln_rt::BinOp;
use pretty_assertions::assert_eq;

use super::*;
use crate::instr::{LiveRef, RefKind};
use crate::types::Type;
use crate::test_helpers::{b, empty_func, push, term, v};

#[test]
fn prints_blocks_and_types() {
    let mut f = empty_func(3, Type::OBJECT);
    f.set_reg_type(v(1), Type::CINT64);
    push(&mut f, b(0), InstrKind::LoadArg { dst: v(0), idx: 0 });
    push(
        &mut f,
        b(0),
        InstrKind::LoadConst {
            dst: v(1),
            value: HirConst::Int64(7),
        },
    );
    push(
        &mut f,
        b(0),
        InstrKind::BinaryOp {
            dst: v(2),
            op: BinOp::Add,
            left: v(0),
            right: v(0),
        },
    );
    term(&mut f, b(0), InstrKind::Return { value: v(2) });

    let expected = format!(
        "fun t {{\n  bb0:\n    v0:{obj} = LoadArg 0\n    v1:{int} = LoadConst 7\n    v2:{obj} = BinaryOp Add v0, v0\n    Return v2\n}}",
        obj = Type::OBJECT,
        int = Type::CINT64,
    );
    assert_eq!(print_function(&f), expected);
}

#[test]
fn deopt_metadata_shows_frames_outermost_first() {
    let mut f = empty_func(2, Type::OBJECT);
    let mut inner = FrameState::new(Arc::clone(&f.code), None);
    inner.next_offset = 3;
    inner.stack = vec![v(0)];
    let mut outer = FrameState::new(Arc::clone(&f.code), None);
    outer.next_offset = 9;
    inner.parent = Some(Box::new(outer));
    let mut guard = Instr::new(InstrKind::GuardType {
        dst: v(1),
        src: v(0),
        ty: Type::LONG,
    })
    .with_deopt(inner);
    if let Some(d) = &mut guard.deopt {
        d.guilty = Some(v(0));
        d.live = vec![LiveRef {
            reg: v(0),
            kind: RefKind::Borrowed,
        }];
    }

    let text = print_instr(&f, &guard);
    assert!(text.starts_with("v1:"), "{text}");
    assert!(text.contains("GuardType v0"), "{text}");
    let outer_at = text.find("next 9").unwrap_or(usize::MAX);
    let inner_at = text.find("next 3").unwrap_or(usize::MAX);
    assert!(outer_at < inner_at, "{text}");
    assert!(text.contains("stack [v0]"), "{text}");
    assert!(text.ends_with(", guilty v0, live [v0 borrowed]}"), "{text}");
}

#[test]
fn null_constants_and_branches() {
    let mut f = empty_func(1, Type::NULLPTR);
    let next = f.new_block();
    push(
        &mut f,
        b(0),
        InstrKind::LoadConst {
            dst: v(0),
            value: HirConst::Nullptr,
        },
    );
    term(&mut f, b(0), InstrKind::Branch { target: next });
    term(&mut f, next, InstrKind::Return { value: v(0) });
    let text = print_function(&f);
    assert!(text.contains("LoadConst null"), "{text}");
    assert!(text.contains("Branch bb1"), "{text}");
    assert!(text.contains("  bb1:\n    Return v0"), "{text}");
}
