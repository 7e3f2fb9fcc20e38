//! Leaving compiled code.
//!
//! A deopt exit leaves the machine with the registers saved by the
//! trampoline and the deopt table index pushed by the stub. From that, the
//! logical frames the compiled code was running (the function itself plus
//! any inlined callees) are rebuilt as interpreter frames:
//!
//! 1. Every live value is read from its register or stack slot.
//! 2. Frames are rebuilt outermost first. Primitive values are boxed;
//!    object values get a new reference owned by the frame.
//! 3. References the compiled code owned at the exit are released.
//! 4. The reason decides what happens next: guard failures are profiled
//!    and reported, unbound variables and null fields raise the same
//!    exception the interpreter would, and exceptions that are already
//!    pending are left alone.
//! 5. The innermost frame resumes first. Its result is pushed onto its
//!    caller's stack and the caller resumes in turn; a pending exception
//!    unwinds each caller instead.

use dashmap::DashMap;
use kiln_codegen::{CodegenError, DeoptCapture, DeoptEntry, FrameMeta, LiveValue, Machine, ValueKind};
use kiln_hir::DeoptReason;
use kiln_rt::{CodeId, ExcKind, Frame, Name, ObjRef, RtResult, Runtime};
use rustc_hash::FxHashMap;

use crate::artifact::CompiledArtifact;
use crate::context::Context;
use crate::error::JitError;

/// Types observed at guard failures, by code unit and bytecode offset.
#[derive(Debug, Default)]
pub struct TypeProfiles {
    samples: DashMap<(CodeId, u32), FxHashMap<Name, u32>>,
}

impl TypeProfiles {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, code: CodeId, offset: u32, ty: Name) {
        *self.samples.entry((code, offset)).or_default().entry(ty).or_default() += 1;
    }

    /// Observed types at one site, most frequent first.
    pub fn get(&self, code: CodeId, offset: u32) -> Vec<(Name, u32)> {
        let mut out: Vec<(Name, u32)> = self
            .samples
            .get(&(code, offset))
            .map(|s| s.iter().map(|(&n, &c)| (n, c)).collect())
            .unwrap_or_default();
        out.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.as_str().cmp(b.0.as_str())));
        out
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// A value read out of the machine, not yet owned by anything.
#[derive(Copy, Clone, Debug)]
struct RawValue {
    word: u64,
    kind: ValueKind,
}

/// Interpreter-visible state of one frame, read before any reference
/// count changes.
struct RawFrame<'a> {
    meta: &'a FrameMeta,
    locals: Vec<Option<RawValue>>,
    stack: Vec<RawValue>,
}

/// Where a deopt exit was taken.
pub(crate) struct ExitSite<'a> {
    pub artifact: &'a CompiledArtifact,
    pub machine: &'a Machine,
    pub capture: &'a DeoptCapture,
    /// Shadow stack depth before the compiled function was entered.
    pub shadow_depth: usize,
}

/// Rebuild the frames of `func` described by the exit's metadata and
/// finish them in the interpreter.
pub(crate) fn resume(cx: &Context, rt: &mut Runtime, func: ObjRef, exit: &ExitSite<'_>) -> RtResult<ObjRef> {
    let ExitSite {
        artifact,
        machine,
        capture,
        shadow_depth,
    } = *exit;
    rt.truncate_shadow(shadow_depth);

    let Some(entry) = artifact.deopt_metadata().get(capture.index) else {
        return Err(fault(rt, artifact, CodegenError::BadDeoptIndex(capture.index)));
    };
    artifact.deopt_stats().record(entry.reason);
    tracing::debug!(
        function = %artifact.name,
        reason = ?entry.reason,
        offset = entry.bc_offset,
        frames = entry.frames.len(),
        "deopt"
    );

    let read = |v: &LiveValue| {
        machine.read_location(capture, v.location).map(|word| RawValue { word, kind: v.kind })
    };
    let values = match read_exit(entry, &read) {
        Ok(values) => values,
        Err((owned, e)) => {
            release_owned(rt, &owned);
            return Err(fault(rt, artifact, e));
        }
    };

    let mut frames: Vec<Frame> = values.frames.iter().map(|f| rebuild_frame(rt, func, f)).collect();

    apply_reason(cx, rt, func, entry, values.guilty);

    release_owned(rt, &values.owned);

    let Some(innermost) = frames.pop() else {
        return Err(rt.raise(ExcKind::RuntimeError, "deopt exit without frames"));
    };
    let mut result = rt.resume_frame(innermost);
    while let Some(mut caller) = frames.pop() {
        if let Ok(value) = result {
            caller.stack.push(value);
        }
        // With an exception pending, the caller unwinds immediately.
        result = rt.resume_frame(caller);
    }
    result
}

/// Everything a deopt exit needs from the machine.
struct ExitValues<'a> {
    frames: Vec<RawFrame<'a>>,
    owned: Vec<RawValue>,
    guilty: Option<RawValue>,
}

/// Read the exit's values. Owned references are read first; if a later
/// read fails, the ones already read come back with the error so they can
/// be released.
fn read_exit<'a>(
    entry: &'a DeoptEntry,
    read: &impl Fn(&LiveValue) -> Result<RawValue, CodegenError>,
) -> Result<ExitValues<'a>, (Vec<RawValue>, CodegenError)> {
    let mut owned = Vec::with_capacity(entry.owned.len());
    for value in &entry.owned {
        match read(value) {
            Ok(raw) => owned.push(raw),
            Err(e) => return Err((owned, e)),
        }
    }
    let frames = match read_frames(entry, read) {
        Ok(frames) => frames,
        Err(e) => return Err((owned, e)),
    };
    let guilty = match entry.guilty.as_ref().map(read).transpose() {
        Ok(guilty) => guilty,
        Err(e) => return Err((owned, e)),
    };
    Ok(ExitValues { frames, owned, guilty })
}

fn release_owned(rt: &mut Runtime, owned: &[RawValue]) {
    for value in owned {
        if value.kind == ValueKind::Object {
            rt.decref(ObjRef::from_word(value.word));
        }
    }
}

fn read_frames<'a>(
    entry: &'a DeoptEntry,
    read: &impl Fn(&LiveValue) -> Result<RawValue, CodegenError>,
) -> Result<Vec<RawFrame<'a>>, CodegenError> {
    entry
        .frames
        .iter()
        .map(|meta| {
            let locals = meta
                .locals
                .iter()
                .map(|slot| slot.as_ref().map(read).transpose())
                .collect::<Result<Vec<_>, _>>()?;
            let stack = meta.stack.iter().map(read).collect::<Result<Vec<_>, _>>()?;
            Ok(RawFrame { meta, locals, stack })
        })
        .collect()
}

fn rebuild_frame(rt: &mut Runtime, func: ObjRef, raw: &RawFrame<'_>) -> Frame {
    let mut frame = rt.empty_frame(raw.meta.func.unwrap_or(func));
    for (slot, value) in frame.locals.iter_mut().zip(&raw.locals) {
        if let Some(value) = value {
            *slot = materialize(rt, *value);
        }
    }
    frame.stack = raw.stack.iter().map(|&v| materialize(rt, v)).collect();
    frame.pc = raw.meta.next_offset as usize;
    frame
}

/// A new reference for `value`. `NULL` objects stay `NULL`.
fn materialize(rt: &mut Runtime, value: RawValue) -> ObjRef {
    match value.kind {
        ValueKind::Object => {
            let obj = ObjRef::from_word(value.word);
            rt.incref(obj);
            obj
        }
        ValueKind::Int64 => rt.new_int(value.word as i64),
        ValueKind::Double => rt.new_float(f64::from_bits(value.word)),
        ValueKind::Bool => {
            let obj = rt.bool_obj(value.word != 0);
            rt.incref(obj);
            obj
        }
    }
}

fn apply_reason(cx: &Context, rt: &mut Runtime, func: ObjRef, entry: &DeoptEntry, guilty: Option<RawValue>) {
    match entry.reason {
        DeoptReason::GuardFailure => {
            if let (Some(value), Some(frame)) = (guilty, entry.innermost()) {
                let ty = observed_type(rt, value);
                cx.profiles().record(frame.code.id, entry.bc_offset, ty);
            }
            cx.report_guard_failure(rt, func);
        }
        DeoptReason::UnboundLocal => {
            let name = entry.name.unwrap_or_else(|| Name::new("?"));
            rt.unbound_local(name);
        }
        DeoptReason::UnboundFreevar => {
            let name = entry.name.unwrap_or_else(|| Name::new("?"));
            rt.unbound_free(name);
        }
        DeoptReason::UnhandledNullField => {
            let name = entry.name.unwrap_or_else(|| Name::new("?"));
            match guilty.filter(|v| v.kind == ValueKind::Object && v.word != 0) {
                Some(obj) => {
                    rt.attribute_error(ObjRef::from_word(obj.word), name);
                }
                None => {
                    rt.raise(ExcKind::AttributeError, format!("attribute '{name}' is not set"));
                }
            }
        }
        DeoptReason::Raise | DeoptReason::UnhandledException => {
            if !rt.has_pending() {
                rt.raise(ExcKind::RuntimeError, "compiled code exited without an exception set");
            }
        }
    }
}

fn observed_type(rt: &Runtime, value: RawValue) -> Name {
    match value.kind {
        ValueKind::Object if value.word == 0 => Name::new("NULL"),
        ValueKind::Object => rt.type_name_of(ObjRef::from_word(value.word)),
        ValueKind::Int64 => Name::new("int64"),
        ValueKind::Double => Name::new("double"),
        ValueKind::Bool => Name::new("cbool"),
    }
}

/// Raise for a machine-level failure while leaving compiled code.
pub(crate) fn fault(rt: &mut Runtime, artifact: &CompiledArtifact, source: CodegenError) -> kiln_rt::Raised {
    let err = JitError::Machine {
        function: artifact.name,
        source,
    };
    tracing::error!(error = %err, "compiled code faulted");
    rt.raise(ExcKind::RuntimeError, err.to_string())
}
