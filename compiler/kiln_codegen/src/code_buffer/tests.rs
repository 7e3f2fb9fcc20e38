use pretty_assertions::assert_eq;

use super::*;

fn code(insts: &[Inst]) -> Vec<u8> {
    insts.iter().flat_map(|i| i.encode()).collect()
}

#[test]
fn append_returns_stable_offsets() {
    let mut buf = CodeBuffer::new(1024);
    let a = buf.append(&code(&[Inst::Nop, Inst::Ret]), &[]);
    let b = buf.append(&code(&[Inst::Trap]), &[]);
    assert_eq!(a, Ok(0));
    assert_eq!(b, Ok(2 * INSTR_SIZE));
    assert_eq!(buf.fetch(2 * INSTR_SIZE), Ok(Inst::Trap));
    assert_eq!(buf.len(), 3 * INSTR_SIZE);
}

#[test]
fn append_fails_when_full() {
    let mut buf = CodeBuffer::new(INSTR_SIZE);
    assert!(buf.append(&code(&[Inst::Nop]), &[]).is_ok());
    assert_eq!(
        buf.append(&code(&[Inst::Nop]), &[]),
        Err(CodegenError::NoMemory {
            requested: INSTR_SIZE,
            available: 0
        })
    );
    assert_eq!(buf.len(), INSTR_SIZE);
}

#[test]
fn patching_requires_a_registered_point() {
    let mut buf = CodeBuffer::new(1024);
    buf.append(&code(&[Inst::Ret]), &[]).ok();
    let base = buf.append(&code(&[Inst::Nop, Inst::Nop]), &[INSTR_SIZE]).unwrap_or(0);
    let site = base + INSTR_SIZE;
    assert!(buf.is_patch_point(site));
    assert!(!buf.is_patch_point(base));

    assert_eq!(buf.patch(base, Inst::Trap), Err(CodegenError::NotPatchable(base)));
    assert_eq!(buf.patch(site, Inst::Jmp { rel: -32 }), Ok(()));
    assert_eq!(buf.fetch(site), Ok(Inst::Jmp { rel: -32 }));
    assert_eq!(buf.fetch(base), Ok(Inst::Nop));
}

#[test]
fn fetch_past_the_end_is_a_bad_jump() {
    let buf = CodeBuffer::new(64);
    assert_eq!(buf.fetch(0), Err(CodegenError::BadJump(0)));
}

#[test]
fn bytes_clamps_to_the_written_range() {
    let mut buf = CodeBuffer::new(1024);
    buf.append(&code(&[Inst::Ret]), &[]).ok();
    assert_eq!(buf.bytes(0, 100).len(), INSTR_SIZE);
    assert!(buf.bytes(500, 10).is_empty());
}
