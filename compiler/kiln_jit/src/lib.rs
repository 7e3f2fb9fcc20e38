//! The Kiln JIT: compilation cache, installation, and deoptimization.
//!
//! A [`Context`] owns the shared code buffer and every artifact compiled
//! into it. Functions are compiled one at a time with
//! [`Context::compile_function`], or many at once with [`compile_batch`],
//! which preloads serially and compiles on worker threads.
//!
//! Installed code is entered through the runtime's [`kiln_rt::JitHook`],
//! implemented by `Context`. When compiled code hits a deopt exit, the
//! frames it was running are rebuilt as interpreter frames and resumed
//! there (see [`deopt`]).
//!
//! # Tracing
//!
//! Set `RUST_LOG=kiln_jit=debug` (or `kiln_hir=trace` for HIR dumps) and
//! call [`init_tracing`].

mod aot;
mod artifact;
pub mod batch;
mod config;
mod context;
pub mod deopt;
mod error;
mod hook;
pub mod watch;

#[cfg(test)]
mod test_helpers;

use std::sync::Once;

pub use aot::{decode_notes, encode_notes, AotNote, AOT_NOTE_VERSION};
pub use artifact::{CompiledArtifact, DeoptStats};
pub use batch::{compile_batch, preload_with_dependencies, BatchReport, PreloaderCache};
pub use config::JitConfig;
pub use context::{CompilationKey, CompileOutcome, Context};
pub use deopt::TypeProfiles;
pub use error::JitError;
pub use watch::{PatchRef, WatchList};

/// Outcome of one compilation request.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub enum CompileResult {
    Success,
    /// The function uses something the JIT does not support.
    CannotCompile,
    /// Another thread is compiling the same key; try again later.
    Retry,
    UnknownError,
    /// The code buffer is full.
    NoMemory,
}

impl CompileResult {
    pub fn is_success(self) -> bool {
        self == CompileResult::Success
    }
}

static TRACING_INIT: Once = Once::new();

/// Initialize tracing for debug output.
///
/// Only installs a subscriber when `RUST_LOG` is set. Safe to call
/// multiple times.
pub fn init_tracing() {
    TRACING_INIT.call_once(|| {
        use tracing_subscriber::{fmt, prelude::*, EnvFilter};

        if std::env::var("RUST_LOG").is_ok() {
            let filter = EnvFilter::from_default_env();
            tracing_subscriber::registry()
                .with(fmt::layer().with_target(true).with_level(true))
                .with(filter)
                .init();
        }
    });
}
