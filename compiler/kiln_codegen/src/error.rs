use kiln_hir::Opcode;

use crate::isa::Gp;

/// Why lowering, emission, or execution of KX code failed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodegenError {
    #[error("cannot lower {0:?}")]
    Unsupported(Opcode),
    #[error("{0:?} has no deopt metadata")]
    MissingDeopt(Opcode),
    #[error("{0} used before any definition")]
    UndefinedValue(String),
    #[error("code buffer exhausted: {requested} bytes requested, {available} available")]
    NoMemory { requested: usize, available: usize },
    #[error("offset {0:#x} is not a registered patch point")]
    NotPatchable(usize),
    #[error("bad instruction encoding at {offset:#x}: tag {tag:#04x}")]
    BadEncoding { offset: usize, tag: u8 },
    #[error("jump to {0:#x} outside the code buffer")]
    BadJump(i64),
    #[error("memory access at {0:#x} outside the machine stack")]
    MemoryFault(u64),
    #[error("{reg} holds {word:#x}, not a live object")]
    NotAnObject { reg: Gp, word: u64 },
    #[error("index {index} out of range for {obj:#x}")]
    IndexOutOfRange { obj: u64, index: u64 },
    #[error("machine stack overflow")]
    StackOverflow,
    #[error("trap at {0:#x}")]
    Trap(usize),
    #[error("deopt metadata index {0} out of range")]
    BadDeoptIndex(u64),
}
