//! High-level IR for the Kiln JIT.
//!
//! This crate provides:
//!
//! - **Types** ([`Type`]): a bitset lattice of object kinds and unboxed
//!   primitives, refined by an optional specialization (a known object,
//!   an int or double constant, an exact user class).
//!
//! - **HIR** ([`Function`], [`Block`], [`Instr`], [`InstrKind`]): typed
//!   SSA over virtual registers. Instructions that can fail carry a
//!   [`FrameState`] so compiled code can always hand the frame back to the
//!   interpreter.
//!
//! - **Memory effects** ([`effects`]): for every opcode, whether its
//!   output is owned or borrowed, which operands it steals, and what it may
//!   write. Refcount insertion is driven entirely by this table.
//!
//! - **Preloading** ([`Preloader`]): every runtime lookup compilation
//!   needs, done up front because it can run user code.
//!
//! - **Passes** ([`passes`]): the canonical optimization pipeline, ending
//!   with refcount insertion.
//!
//! # Crate Dependencies
//!
//! `kiln_hir` depends only on `kiln_rt` for code units, object handles and
//! interned names. After preloading, nothing here touches the runtime, so
//! HIR can be built and optimized on any thread.

mod builder;
pub mod checker;
pub mod effects;
mod error;
mod function;
pub mod graph;
mod instr;
pub mod liveness;
pub mod passes;
mod preload;
pub mod printer;
mod types;

#[cfg(test)]
mod test_helpers;

pub use builder::build_hir;
pub use effects::{memory_effects, memory_effects_of, AliasClass, MemoryEffects, OutputEffect};
pub use error::BuildError;
pub use function::{Block, Function, InlineFailure, InlineStats};
pub use instr::{
    BlockId, DeoptInfo, DeoptReason, FrameState, HirConst, Instr, InstrKind, LiveRef, Opcode,
    PrimKind, Reg, RefKind,
};
pub use passes::{Pass, PassConfig, PassPipeline};
pub use preload::{CallTarget, ClassInfo, GlobalSlot, Preloader, PreloaderMap};
pub use types::{Type, TypeBits, TypeSpec};
