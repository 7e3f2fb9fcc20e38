//! Back end of the Kiln JIT.
//!
//! Optimized HIR goes through three stages:
//!
//! - **Lowering** ([`lower()`]): HIR to LIR, a word-level IR where object
//!   operations are explicit and everything that can run user code is a
//!   helper call.
//! - **Register allocation** ([`allocate`]): linear scan over the LIR in
//!   emission order.
//! - **Emission** ([`emit()`]): KX machine code with three entry points,
//!   deopt stubs, and patchable jump slots, plus the deopt metadata that
//!   describes every stub.
//!
//! KX code runs on [`Machine`], fetching from a [`CodeBuffer`] shared by
//! every compiled function. Per-function runtime data (materialized
//! constants, attribute caches) lives in a [`CodeRuntime`].

mod code_buffer;
mod code_runtime;
pub mod deopt;
pub mod emit;
mod error;
pub mod frame;
mod helpers;
pub mod isa;
pub mod lir;
pub mod lower;
pub mod machine;
pub mod regalloc;

#[cfg(test)]
mod test_helpers;

pub use code_buffer::{CodeBuffer, SharedCodeBuffer};
pub use code_runtime::CodeRuntime;
pub use deopt::{DeoptEntry, DeoptMetadata, FrameMeta, LiveValue, Location};
pub use emit::{emit, EmittedCode, PatchSite, DEOPT_SAVE_AREA, GENERIC_ENTRY_OFFSET, REENTRY_OFFSET, STATIC_ENTRY_OFFSET};
pub use error::CodegenError;
pub use lir::{print_lir, LirFunction, ValueKind};
pub use lower::lower;
pub use machine::{DeoptCapture, ExecContext, Exit, Machine};
pub use regalloc::{allocate, Allocation};

use kiln_hir::Function;

/// Output of the back end for one function.
#[derive(Clone, Debug)]
pub struct Generated {
    pub lir: LirFunction,
    pub code: EmittedCode,
}

/// Lower, allocate, and emit `func`.
pub fn generate(func: &Function) -> Result<Generated, CodegenError> {
    let lir = lower(func)?;
    let alloc = allocate(&lir);
    tracing::debug!(
        function = %func.name,
        spill_slots = alloc.spill_slots,
        callee_saved = alloc.used_callee_saved.len(),
        "registers allocated"
    );
    let code = emit(&lir, &alloc)?;
    Ok(Generated { lir, code })
}
