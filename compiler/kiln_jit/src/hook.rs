//! Entering compiled code from the runtime.

use std::sync::Arc;

use kiln_codegen::isa::WORD;
use kiln_codegen::{ExecContext, Exit, Machine, GENERIC_ENTRY_OFFSET, STATIC_ENTRY_OFFSET};
use kiln_rt::{ExcKind, JitEntry, JitHook, ObjRef, Raised, RtResult, Runtime, WatchKey};

use crate::context::Context;
use crate::deopt::{self, ExitSite};
use crate::error::JitError;

/// Machine stack words beyond the frame and arguments, covering the
/// return address and the entry-failure path.
const STACK_SLACK_WORDS: usize = 8;

/// How a compiled call finished.
enum Finished {
    /// Straight from compiled code, in the calling convention of the
    /// entry used.
    Word(u64),
    /// From the interpreter after a deopt; always an object.
    Object(ObjRef),
}

impl Context {
    fn execute(&self, rt: &mut Runtime, func: ObjRef, entry: JitEntry, args: &[u64], offset: usize) -> RtResult<Finished> {
        let Some(artifact) = self.artifact_for(entry) else {
            let err = JitError::UnknownEntry(entry.0);
            tracing::error!(error = %err, "call through a stale entry");
            return Err(rt.raise(ExcKind::RuntimeError, err.to_string()));
        };
        let Some(tables) = artifact.runtime() else {
            let err = JitError::UnknownEntry(entry.0);
            tracing::error!(error = %err, "call into code that was never installed");
            return Err(rt.raise(ExcKind::RuntimeError, err.to_string()));
        };

        let shadow_depth = rt.shadow_frames().len();
        rt.push_shadow(Arc::clone(&artifact.code), 0);
        let stack = artifact.stack_size() as usize + WORD as usize * (args.len() + STACK_SLACK_WORDS);
        let mut machine = Machine::new(stack);
        let exit = {
            let mut ctx = ExecContext { rt: &mut *rt, code: &tables };
            machine.invoke(self.buffer(), artifact.base + offset, func, args, &mut ctx)
        };

        match exit {
            Ok(Exit::Return(word)) => {
                rt.truncate_shadow(shadow_depth);
                Ok(Finished::Word(word))
            }
            Ok(Exit::Deopt(capture)) => {
                let site = ExitSite {
                    artifact: &artifact,
                    machine: &machine,
                    capture: &capture,
                    shadow_depth,
                };
                deopt::resume(self, rt, func, &site).map(Finished::Object)
            }
            Err(source) => {
                rt.truncate_shadow(shadow_depth);
                Err(deopt::fault(rt, &artifact, source))
            }
        }
    }
}

impl JitHook for Context {
    fn invoke(&self, rt: &mut Runtime, func: ObjRef, entry: JitEntry, args: &[ObjRef]) -> RtResult<ObjRef> {
        let words: Vec<u64> = args.iter().map(|a| a.to_word()).collect();
        match self.execute(rt, func, entry, &words, GENERIC_ENTRY_OFFSET)? {
            Finished::Object(obj) => Ok(obj),
            // `NULL` is the error return of the generic entry.
            Finished::Word(0) if rt.has_pending() => Err(Raised),
            Finished::Word(0) => Err(rt.raise(ExcKind::RuntimeError, "compiled code returned NULL without an exception")),
            Finished::Word(word) => Ok(ObjRef::from_word(word)),
        }
    }

    fn invoke_static(&self, rt: &mut Runtime, func: ObjRef, entry: JitEntry, args: &[u64]) -> RtResult<u64> {
        match self.execute(rt, func, entry, args, STATIC_ENTRY_OFFSET)? {
            // Any word is a valid primitive result, so errors show only as a
            // pending exception.
            Finished::Word(_) if rt.has_pending() => Err(Raised),
            Finished::Word(word) => Ok(word),
            Finished::Object(obj) => {
                let ann = rt.func_code(func).map(|c| c.return_type);
                let word = match ann {
                    Some(ann) => rt.unbox_word(obj, ann),
                    None => Err(rt.raise(ExcKind::TypeError, "not a function")),
                };
                rt.decref(obj);
                word
            }
        }
    }

    fn watch_event(&self, _rt: &mut Runtime, key: WatchKey) {
        self.invalidate(key);
    }

    fn function_hot(&self, rt: &mut Runtime, func: ObjRef) -> RtResult<()> {
        let result = self.compile_function(rt, func)?;
        tracing::debug!(?result, "hot function compiled");
        Ok(())
    }

    fn hot_threshold(&self) -> u32 {
        self.config().hot_threshold
    }
}
