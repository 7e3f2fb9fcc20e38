//! Runtime helpers reached through `Call`.
//!
//! A helper returns `Some(word)` on success and `None` once it has raised;
//! the machine turns `None` into the fault flag. Errors are machine
//! failures (a corrupt argument), never user exceptions.

use kiln_hir::PrimKind;
use kiln_rt::{builtins, BuiltinMethodId, ExcKind, ObjRef, RtResult, Runtime};

use crate::error::CodegenError;
use crate::isa::Helper;
use crate::machine::{ExecContext, Machine};

fn word(obj: ObjRef) -> u64 {
    obj.to_word()
}

fn obj(word: u64) -> ObjRef {
    ObjRef::from_word(word)
}

fn objs(words: &[u64]) -> Vec<ObjRef> {
    words.iter().map(|&w| obj(w)).collect()
}

fn arg(args: &[u64], i: usize) -> Result<u64, CodegenError> {
    args.get(i).copied().ok_or(CodegenError::IndexOutOfRange {
        obj: 0,
        index: i as u64,
    })
}

fn name_of(ctx: &ExecContext<'_>, index: u32) -> Result<kiln_rt::Name, CodegenError> {
    ctx.code.name(index).ok_or(CodegenError::IndexOutOfRange {
        obj: 0,
        index: u64::from(index),
    })
}

fn finish(result: RtResult<ObjRef>) -> Option<u64> {
    result.ok().map(word)
}

/// Globals and builtins of `func`, raising if it is not a function.
fn scopes(rt: &mut Runtime, func: ObjRef) -> RtResult<(ObjRef, ObjRef)> {
    match rt.function(func) {
        Some(f) => Ok((f.globals, f.builtins)),
        None => Err(rt.raise(ExcKind::TypeError, "global access outside a function")),
    }
}

pub fn call(
    helper: Helper,
    args: &[u64],
    machine: &Machine,
    ctx: &mut ExecContext<'_>,
) -> Result<Option<u64>, CodegenError> {
    tracing::trace!(helper = helper.name(), nargs = args.len(), "helper call");
    Ok(match helper {
        Helper::LoadGlobal { name } => {
            let name = name_of(ctx, name)?;
            let func = obj(arg(args, 0)?);
            let rt = &mut *ctx.rt;
            finish(scopes(rt, func).and_then(|(globals, builtins)| rt.load_global(globals, builtins, name)))
        }
        Helper::StoreGlobal { name } => {
            let name = name_of(ctx, name)?;
            let (func, value) = (obj(arg(args, 0)?), obj(arg(args, 1)?));
            let rt = &mut *ctx.rt;
            match scopes(rt, func) {
                Ok((globals, _)) => {
                    rt.incref(value);
                    rt.store_global_owned(globals, name, value);
                    Some(0)
                }
                Err(_) => None,
            }
        }
        Helper::GetAttr { name } => {
            let name = name_of(ctx, name)?;
            finish(ctx.rt.get_attr(obj(arg(args, 0)?), name))
        }
        Helper::SetAttr { name } => {
            let name = name_of(ctx, name)?;
            ctx.rt
                .set_attr(obj(arg(args, 0)?), name, obj(arg(args, 1)?))
                .ok()
                .map(|()| 0)
        }
        Helper::FillTypeAttrCache { name, cache } => {
            let name = name_of(ctx, name)?;
            let ty = obj(arg(args, 0)?);
            match ctx.rt.get_attr(ty, name) {
                Ok(value) => {
                    if ctx.rt.kind_of(ty) == kiln_rt::ObjKind::Type {
                        ctx.code.cache_fill(ctx.rt, cache, ty, value);
                    }
                    Some(word(value))
                }
                Err(_) => None,
            }
        }
        Helper::CallMethod => {
            let callable = obj(arg(args, 0)?);
            let self_or_null = obj(arg(args, 1)?);
            let rest = objs(args.get(2..).unwrap_or(&[]));
            let result = if self_or_null.is_null() {
                ctx.rt.call(callable, &rest)
            } else {
                let mut full = Vec::with_capacity(rest.len() + 1);
                full.push(self_or_null);
                full.extend(rest);
                ctx.rt.call(callable, &full)
            };
            finish(result)
        }
        Helper::CallBuiltinMethod { method } => {
            let def = builtins::method(BuiltinMethodId(method));
            finish((def.func)(ctx.rt, &objs(args)))
        }
        Helper::VectorCall => {
            let callable = obj(arg(args, 0)?);
            finish(ctx.rt.call(callable, &objs(args.get(1..).unwrap_or(&[]))))
        }
        Helper::InvokeStatic => {
            let func = obj(arg(args, 0)?);
            ctx.rt.call_static(func, args.get(1..).unwrap_or(&[])).ok()
        }
        Helper::BinaryOp { op } => finish(ctx.rt.binary_op(op, obj(arg(args, 0)?), obj(arg(args, 1)?))),
        Helper::UnaryNegative => finish(ctx.rt.unary_negative(obj(arg(args, 0)?))),
        Helper::Compare { op } => finish(ctx.rt.compare(op, obj(arg(args, 0)?), obj(arg(args, 1)?))),
        Helper::CompareBool { op } => ctx
            .rt
            .compare_bool(op, obj(arg(args, 0)?), obj(arg(args, 1)?))
            .ok()
            .map(u64::from),
        Helper::IsTruthy => ctx.rt.is_truthy(obj(arg(args, 0)?)).ok().map(u64::from),
        Helper::Box { kind } => {
            let raw = arg(args, 0)?;
            let boxed = match kind {
                PrimKind::Int64 => ctx.rt.new_int(raw as i64),
                PrimKind::Double => ctx.rt.new_float(f64::from_bits(raw)),
                PrimKind::Bool => ctx.rt.bool_obj(raw != 0),
            };
            Some(word(boxed))
        }
        Helper::MakeTuple => Some(word(ctx.rt.new_tuple(objs(args)))),
        Helper::MakeList => Some(word(ctx.rt.new_list(objs(args)))),
        Helper::Subscript => finish(ctx.rt.subscript(obj(arg(args, 0)?), obj(arg(args, 1)?))),
        Helper::Raise => {
            let _ = ctx.rt.raise_object(obj(arg(args, 0)?));
            None
        }
        Helper::PushShadow { code } => {
            let unit = ctx.code.inlined_code(code).ok_or(CodegenError::IndexOutOfRange {
                obj: 0,
                index: u64::from(code),
            })?;
            ctx.rt.push_shadow(std::sync::Arc::clone(unit), 0);
            Some(0)
        }
        Helper::PopShadow => {
            ctx.rt.pop_shadow();
            Some(0)
        }
        Helper::EntryCheckFailed => {
            let func = obj(arg(args, 0)?);
            let count = arg(args, 2)?;
            let nargs = usize::try_from(count).map_err(|_| CodegenError::IndexOutOfRange { obj: 0, index: count })?;
            let boxed = objs(&machine.read_words(arg(args, 1)?, nargs)?);
            tracing::debug!(nargs, "entry check failed; running in the interpreter");
            let rt = &mut *ctx.rt;
            finish(rt.new_frame(func, &boxed).and_then(|frame| rt.eval_frame(frame)))
        }
    })
}

#[cfg(test)]
mod tests;
