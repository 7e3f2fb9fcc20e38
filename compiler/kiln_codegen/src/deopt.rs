//! Deopt metadata: where each interpreter-visible value lives when a deopt
//! exit is taken.
//!
//! Entries are appended while a function is emitted and indexed by the
//! number its stub pushes. Once the code is installed the table is frozen;
//! the runtime only reads it.

use std::sync::Arc;

use kiln_hir::DeoptReason;
use kiln_rt::{CodeUnit, Name, ObjRef};

use crate::isa::Gp;
use crate::lir::ValueKind;

#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub enum Location {
    Reg(Gp),
    /// Offset from the frame pointer.
    Stack(i32),
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct LiveValue {
    pub location: Location,
    pub kind: ValueKind,
}

/// One frame to rebuild.
#[derive(Clone, Debug, PartialEq)]
pub struct FrameMeta {
    pub code: Arc<CodeUnit>,
    /// `None` for the compiled function itself.
    pub func: Option<ObjRef>,
    pub next_offset: u32,
    pub locals: Vec<Option<LiveValue>>,
    pub stack: Vec<LiveValue>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct DeoptEntry {
    pub reason: DeoptReason,
    /// Outermost first.
    pub frames: Vec<FrameMeta>,
    /// References compiled code owns at the exit. The rebuilt frames take
    /// their own references, so these are released afterwards.
    pub owned: Vec<LiveValue>,
    pub guilty: Option<LiveValue>,
    pub name: Option<Name>,
    pub bc_offset: u32,
}

impl DeoptEntry {
    pub fn innermost(&self) -> Option<&FrameMeta> {
        self.frames.last()
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct DeoptMetadata {
    entries: Vec<DeoptEntry>,
    frozen: bool,
}

impl DeoptMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    /// Index the entry's stub will push.
    pub fn push(&mut self, entry: DeoptEntry) -> u32 {
        debug_assert!(!self.frozen, "deopt metadata appended after install");
        self.entries.push(entry);
        self.entries.len() as u32 - 1
    }

    pub fn freeze(&mut self) {
        self.frozen = true;
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    pub fn get(&self, index: u64) -> Option<&DeoptEntry> {
        usize::try_from(index).ok().and_then(|i| self.entries.get(i))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &DeoptEntry> {
        self.entries.iter()
    }
}
