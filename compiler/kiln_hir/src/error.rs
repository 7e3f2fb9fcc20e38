use kiln_rt::{Name, Op};

/// Why a code unit cannot be turned into HIR.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BuildError {
    #[error("{0} is a generator")]
    Generator(Name),
    #[error("{0} has cell variables")]
    CellVars(Name),
    #[error("{0} takes variable arguments")]
    Varargs(Name),
    #[error("unsupported bytecode {op:?} at offset {offset}")]
    UnsupportedOp { op: Op, offset: usize },
    #[error("stack underflow at offset {0}")]
    StackUnderflow(usize),
    #[error("inconsistent stack depth entering offset {0}")]
    StackMismatch(usize),
    #[error("control falls off the end of the code")]
    FallsOffEnd,
}
