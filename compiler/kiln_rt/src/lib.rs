//! Host runtime for the Kiln JIT.
//!
//! A small reference-counted object model with a stack-based bytecode
//! interpreter. It provides everything compiled code interacts with:
//!
//! - **Objects** ([`Heap`], [`ObjRef`], [`Object`]) with explicit
//!   reference counts and immortal singletons.
//! - **Code units** ([`CodeUnit`], [`Op`], [`CodeBuilder`]): immutable
//!   bytecode shared with compile workers.
//! - **Namespaces** with stable slot indices for globals and builtins.
//! - **The interpreter** ([`Frame`], [`Runtime::eval_frame`],
//!   [`Runtime::resume_frame`]) which is also the deoptimization target.
//! - **The JIT seam** ([`JitHook`], [`JitState`], [`WatchKey`]).
//!
//! Exceptions are raised by storing a pending exception on the runtime and
//! returning [`Raised`].

pub mod builtins;
mod code;
mod exception;
mod hook;
mod interp;
mod intern;
mod namespace;
mod object;
mod ops;
mod runtime;

pub use builtins::{BuiltinFnId, BuiltinMethodId, MethodKind};
pub use code::{ArgAnnotation, BinOp, CmpOp, CodeBuilder, CodeFlags, CodeId, CodeUnit, ConstValue, Label, Op};
pub use exception::{ExcKind, Raised, RtResult};
pub use hook::{JitEntry, JitHook, JitState, WatchKey};
pub use interp::Frame;
pub use intern::{interner, Name, StringInterner};
pub use namespace::{Namespace, StoreOutcome};
pub use object::{ExceptionObj, FunctionObj, Heap, InstanceObj, ObjKind, ObjRef, Object, TypeObj};
pub use ops::{float_arith, int_arith, Num};
pub use runtime::{Runtime, ShadowFrame, MAX_CALL_DEPTH};
