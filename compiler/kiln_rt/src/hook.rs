//! The seam between the runtime and the JIT.
//!
//! The runtime never depends on the compiler. Functions carry a
//! [`JitState`] holding a non-owning [`JitEntry`] handle, and the runtime
//! dispatches through an installed [`JitHook`] when it sees one.

use crate::exception::RtResult;
use crate::object::ObjRef;
use crate::runtime::Runtime;

/// Opaque handle to a compiled artifact, owned by the JIT.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub struct JitEntry(pub u64);

/// Compilation state of a function. Exactly one holds at any time.
#[derive(Copy, Clone, PartialEq, Eq, Debug, Default)]
pub enum JitState {
    #[default]
    NotCompiled,
    Compiled(JitEntry),
    /// Compiled, but routed back to the interpreter.
    Deopted(JitEntry),
}

impl JitState {
    pub fn active_entry(self) -> Option<JitEntry> {
        match self {
            JitState::Compiled(entry) => Some(entry),
            JitState::NotCompiled | JitState::Deopted(_) => None,
        }
    }
}

/// Facts compiled code may depend on without re-checking them.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug, PartialOrd, Ord)]
pub enum WatchKey {
    /// A type's attributes or layout.
    Type(ObjRef),
    /// The key set of a namespace.
    Namespace(ObjRef),
}

/// Callbacks from the runtime into the JIT.
pub trait JitHook: Send + Sync {
    /// Run a compiled function through its generic entry point. `args` are
    /// borrowed; the result is a new reference.
    fn invoke(&self, rt: &mut Runtime, func: ObjRef, entry: JitEntry, args: &[ObjRef])
        -> RtResult<ObjRef>;

    /// Run a compiled function through its statically-typed entry point.
    /// `args` and the result are raw words: primitives unboxed per the
    /// code's annotations, objects as borrowed (args) or new (result)
    /// references.
    fn invoke_static(&self, rt: &mut Runtime, func: ObjRef, entry: JitEntry, args: &[u64])
        -> RtResult<u64>;

    /// A watched fact changed.
    fn watch_event(&self, rt: &mut Runtime, key: WatchKey);

    /// A function's interpreted call count reached the hot threshold. An
    /// exception raised while preparing it fails the call that made it hot.
    fn function_hot(&self, rt: &mut Runtime, func: ObjRef) -> RtResult<()>;

    /// Interpreted calls after which `function_hot` fires; `0` disables it.
    fn hot_threshold(&self) -> u32 {
        0
    }
}
