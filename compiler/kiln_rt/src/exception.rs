//! Exception kinds and the pending-exception marker.

use std::fmt;

/// Builtin exception classes.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub enum ExcKind {
    TypeError,
    NameError,
    AttributeError,
    UnboundLocalError,
    ZeroDivisionError,
    OverflowError,
    IndexError,
    ValueError,
    RuntimeError,
    RecursionError,
}

impl ExcKind {
    pub fn name(self) -> &'static str {
        match self {
            ExcKind::TypeError => "TypeError",
            ExcKind::NameError => "NameError",
            ExcKind::AttributeError => "AttributeError",
            ExcKind::UnboundLocalError => "UnboundLocalError",
            ExcKind::ZeroDivisionError => "ZeroDivisionError",
            ExcKind::OverflowError => "OverflowError",
            ExcKind::IndexError => "IndexError",
            ExcKind::ValueError => "ValueError",
            ExcKind::RuntimeError => "RuntimeError",
            ExcKind::RecursionError => "RecursionError",
        }
    }
}

impl fmt::Display for ExcKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// An exception has been raised and is pending on the runtime.
///
/// The exception object itself lives in the runtime's pending slot; this
/// marker only signals that the caller must unwind.
#[derive(Copy, Clone, PartialEq, Eq, Debug, thiserror::Error)]
#[error("exception pending")]
pub struct Raised;

pub type RtResult<T> = Result<T, Raised>;
