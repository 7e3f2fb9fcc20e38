//! End-to-end tests for the JIT.
//!
//! Each test builds bytecode, compiles it through a [`kiln_jit::Context`]
//! attached to a live runtime, and calls it the way the interpreter
//! would. Where compiled code can fall back to the interpreter, results
//! are compared against an uncompiled copy of the same function.
//!
//! ## Test Categories
//!
//! - `compile` - compiled results and entry points
//! - `deopt` - deopt exits resume in the interpreter
//! - `concurrency` - shared cache under parallel compilation
//! - `lifecycle` - deopt/reopt, eviction, shutdown, invalidation, notes

#[path = "jit/common.rs"]
mod common;

#[path = "jit/compile.rs"]
mod compile;

#[path = "jit/deopt.rs"]
mod deopt;

#[path = "jit/concurrency.rs"]
mod concurrency;

#[path = "jit/lifecycle.rs"]
mod lifecycle;
