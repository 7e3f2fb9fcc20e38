use kiln_codegen::CodegenError;
use kiln_hir::BuildError;
use kiln_rt::Name;

use crate::CompileResult;

/// Internal JIT failures, with the function they concern.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum JitError {
    #[error("cannot build HIR for {function}: {source}")]
    Build {
        function: Name,
        #[source]
        source: BuildError,
    },
    #[error("code generation failed for {function}: {source}")]
    Codegen {
        function: Name,
        #[source]
        source: CodegenError,
    },
    #[error("compiled code for {function} faulted: {source}")]
    Machine {
        function: Name,
        #[source]
        source: CodegenError,
    },
    #[error("no compiled code registered for entry {0}")]
    UnknownEntry(u64),
    #[error("AOT note encoding failed: {0}")]
    AotEncoding(String),
    #[error("AOT note for {function} does not match: {reason}")]
    AotMismatch { function: String, reason: String },
}

impl JitError {
    /// How a compile that failed with this error is reported.
    pub fn result(&self) -> CompileResult {
        match self {
            JitError::Build { .. }
            | JitError::Codegen {
                source: CodegenError::Unsupported(_),
                ..
            } => CompileResult::CannotCompile,
            JitError::Codegen {
                source: CodegenError::NoMemory { .. },
                ..
            } => CompileResult::NoMemory,
            _ => CompileResult::UnknownError,
        }
    }
}
