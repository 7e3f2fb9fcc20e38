//! Builtin functions and builtin-type methods.
//!
//! Both tables are static so that compile workers can resolve a builtin
//! method to a [`BuiltinMethodId`] without touching the runtime.

use crate::exception::{ExcKind, RtResult};
use crate::object::{ObjKind, ObjRef, Object};
use crate::runtime::Runtime;

pub type BuiltinFn = fn(&mut Runtime, &[ObjRef]) -> RtResult<ObjRef>;

#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub struct BuiltinFnId(pub u16);

#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub struct BuiltinMethodId(pub u16);

/// How a builtin method receives its implicit first argument.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub enum MethodKind {
    /// Receives the receiver object.
    Instance,
    /// Receives the receiver's type.
    Class,
    /// Receives nothing implicit.
    Static,
}

pub struct BuiltinFnDef {
    pub name: &'static str,
    /// `None` for variadic.
    pub arity: Option<usize>,
    pub func: BuiltinFn,
}

pub struct BuiltinMethodDef {
    pub owner: ObjKind,
    pub name: &'static str,
    pub kind: MethodKind,
    /// Explicit arguments, not counting the implicit receiver or class.
    pub arity: usize,
    pub func: BuiltinFn,
}

impl BuiltinMethodDef {
    /// Total arguments the implementation receives.
    pub fn full_arity(&self) -> usize {
        match self.kind {
            MethodKind::Instance | MethodKind::Class => self.arity + 1,
            MethodKind::Static => self.arity,
        }
    }
}

pub static FUNCTIONS: &[BuiltinFnDef] = &[
    BuiltinFnDef { name: "len", arity: Some(1), func: builtin_len },
    BuiltinFnDef { name: "abs", arity: Some(1), func: builtin_abs },
    BuiltinFnDef { name: "lineno", arity: Some(0), func: builtin_lineno },
    BuiltinFnDef { name: "print", arity: None, func: builtin_print },
    BuiltinFnDef { name: "ValueError", arity: Some(1), func: exc_value_error },
    BuiltinFnDef { name: "TypeError", arity: Some(1), func: exc_type_error },
    BuiltinFnDef { name: "RuntimeError", arity: Some(1), func: exc_runtime_error },
];

pub static METHODS: &[BuiltinMethodDef] = &[
    BuiltinMethodDef { owner: ObjKind::Str, name: "upper", kind: MethodKind::Instance, arity: 0, func: str_upper },
    BuiltinMethodDef { owner: ObjKind::Str, name: "lower", kind: MethodKind::Instance, arity: 0, func: str_lower },
    BuiltinMethodDef { owner: ObjKind::Str, name: "startswith", kind: MethodKind::Instance, arity: 1, func: str_startswith },
    BuiltinMethodDef { owner: ObjKind::Str, name: "maketrans", kind: MethodKind::Static, arity: 2, func: str_maketrans },
    BuiltinMethodDef { owner: ObjKind::Int, name: "bit_length", kind: MethodKind::Instance, arity: 0, func: int_bit_length },
    BuiltinMethodDef { owner: ObjKind::Float, name: "is_integer", kind: MethodKind::Instance, arity: 0, func: float_is_integer },
    BuiltinMethodDef { owner: ObjKind::Float, name: "fromhex", kind: MethodKind::Class, arity: 1, func: float_fromhex },
    BuiltinMethodDef { owner: ObjKind::Tuple, name: "count", kind: MethodKind::Instance, arity: 1, func: tuple_count },
    BuiltinMethodDef { owner: ObjKind::List, name: "append", kind: MethodKind::Instance, arity: 1, func: list_append },
    BuiltinMethodDef { owner: ObjKind::List, name: "pop", kind: MethodKind::Instance, arity: 0, func: list_pop },
];

pub fn function(id: BuiltinFnId) -> &'static BuiltinFnDef {
    &FUNCTIONS[id.0 as usize]
}

pub fn method(id: BuiltinMethodId) -> &'static BuiltinMethodDef {
    &METHODS[id.0 as usize]
}

/// Find a method defined directly on a builtin kind.
pub fn lookup_method(owner: ObjKind, name: &str) -> Option<BuiltinMethodId> {
    METHODS
        .iter()
        .position(|m| m.owner == owner && m.name == name)
        .map(|i| BuiltinMethodId(i as u16))
}

// ── Helpers ────────────────────────────────────────────────────────

fn expect_str(rt: &mut Runtime, obj: ObjRef, what: &str) -> RtResult<std::sync::Arc<str>> {
    match rt.heap.get(obj) {
        Object::Str(s) => Ok(std::sync::Arc::clone(s)),
        _ => {
            let tname = rt.type_name_of(obj);
            Err(rt.raise(
                ExcKind::TypeError,
                format!("{what} must be str, not {tname}"),
            ))
        }
    }
}

// ── Functions ──────────────────────────────────────────────────────

fn builtin_len(rt: &mut Runtime, args: &[ObjRef]) -> RtResult<ObjRef> {
    let n = match rt.heap.get(args[0]) {
        Object::Str(s) => s.chars().count(),
        Object::Tuple(items) | Object::List(items) => items.len(),
        _ => {
            let tname = rt.type_name_of(args[0]);
            return Err(rt.raise(
                ExcKind::TypeError,
                format!("object of type '{tname}' has no len()"),
            ));
        }
    };
    Ok(rt.new_int(n as i64))
}

fn builtin_abs(rt: &mut Runtime, args: &[ObjRef]) -> RtResult<ObjRef> {
    match rt.heap.get(args[0]) {
        Object::Int(i) => match i.checked_abs() {
            Some(v) => Ok(rt.new_int(v)),
            None => Err(rt.raise(ExcKind::OverflowError, "integer overflow")),
        },
        Object::Float(x) => {
            let v = x.abs();
            Ok(rt.new_float(v))
        }
        _ => {
            let tname = rt.type_name_of(args[0]);
            Err(rt.raise(
                ExcKind::TypeError,
                format!("bad operand type for abs(): '{tname}'"),
            ))
        }
    }
}

fn builtin_lineno(rt: &mut Runtime, _args: &[ObjRef]) -> RtResult<ObjRef> {
    let line = rt.current_line().unwrap_or(0);
    Ok(rt.new_int(i64::from(line)))
}

fn builtin_print(rt: &mut Runtime, args: &[ObjRef]) -> RtResult<ObjRef> {
    let line = args
        .iter()
        .map(|&a| rt.display(a))
        .collect::<Vec<_>>()
        .join(" ");
    rt.output.push(line);
    Ok(rt.none())
}

fn make_exception(rt: &mut Runtime, kind: ExcKind, arg: ObjRef) -> RtResult<ObjRef> {
    let message = rt.display(arg);
    Ok(rt.new_exception(kind, message))
}

fn exc_value_error(rt: &mut Runtime, args: &[ObjRef]) -> RtResult<ObjRef> {
    make_exception(rt, ExcKind::ValueError, args[0])
}

fn exc_type_error(rt: &mut Runtime, args: &[ObjRef]) -> RtResult<ObjRef> {
    make_exception(rt, ExcKind::TypeError, args[0])
}

fn exc_runtime_error(rt: &mut Runtime, args: &[ObjRef]) -> RtResult<ObjRef> {
    make_exception(rt, ExcKind::RuntimeError, args[0])
}

// ── Methods ────────────────────────────────────────────────────────

fn str_upper(rt: &mut Runtime, args: &[ObjRef]) -> RtResult<ObjRef> {
    let s = expect_str(rt, args[0], "self")?;
    Ok(rt.new_str(&s.to_uppercase()))
}

fn str_lower(rt: &mut Runtime, args: &[ObjRef]) -> RtResult<ObjRef> {
    let s = expect_str(rt, args[0], "self")?;
    Ok(rt.new_str(&s.to_lowercase()))
}

fn str_startswith(rt: &mut Runtime, args: &[ObjRef]) -> RtResult<ObjRef> {
    let s = expect_str(rt, args[0], "self")?;
    let prefix = expect_str(rt, args[1], "prefix")?;
    Ok(rt.bool_obj(s.starts_with(&*prefix)))
}

/// `str.maketrans(x, y)`: a tuple of `(ord(x[i]), ord(y[i]))` pairs.
fn str_maketrans(rt: &mut Runtime, args: &[ObjRef]) -> RtResult<ObjRef> {
    let from = expect_str(rt, args[0], "x")?;
    let to = expect_str(rt, args[1], "y")?;
    if from.chars().count() != to.chars().count() {
        return Err(rt.raise(
            ExcKind::ValueError,
            "the first two maketrans arguments must have equal length",
        ));
    }
    let mut pairs = Vec::new();
    for (a, b) in from.chars().zip(to.chars()) {
        let ka = rt.new_int(i64::from(u32::from(a)));
        let kb = rt.new_int(i64::from(u32::from(b)));
        pairs.push(rt.new_tuple(vec![ka, kb]));
    }
    Ok(rt.new_tuple(pairs))
}

fn int_bit_length(rt: &mut Runtime, args: &[ObjRef]) -> RtResult<ObjRef> {
    match rt.heap.get(args[0]) {
        Object::Int(i) => {
            let bits = 64 - i.unsigned_abs().leading_zeros();
            Ok(rt.new_int(i64::from(bits)))
        }
        _ => Err(rt.raise(ExcKind::TypeError, "descriptor 'bit_length' requires an int")),
    }
}

fn float_is_integer(rt: &mut Runtime, args: &[ObjRef]) -> RtResult<ObjRef> {
    match rt.heap.get(args[0]) {
        Object::Float(x) => {
            let b = x.is_finite() && x.fract() == 0.0;
            Ok(rt.bool_obj(b))
        }
        _ => Err(rt.raise(ExcKind::TypeError, "descriptor 'is_integer' requires a float")),
    }
}

/// `float.fromhex(s)`: `[-]0x<hex>[.<hex>][p<exp>]`.
fn float_fromhex(rt: &mut Runtime, args: &[ObjRef]) -> RtResult<ObjRef> {
    let s = expect_str(rt, args[1], "argument")?;
    match parse_hex_float(s.trim()) {
        Some(v) => Ok(rt.new_float(v)),
        None => Err(rt.raise(
            ExcKind::ValueError,
            "invalid hexadecimal floating-point string",
        )),
    }
}

fn parse_hex_float(s: &str) -> Option<f64> {
    let (neg, rest) = match s.strip_prefix('-') {
        Some(r) => (true, r),
        None => (false, s.strip_prefix('+').unwrap_or(s)),
    };
    let rest = rest
        .strip_prefix("0x")
        .or_else(|| rest.strip_prefix("0X"))
        .unwrap_or(rest);
    let (mantissa, exp) = match rest.find(['p', 'P']) {
        Some(i) => (&rest[..i], rest[i + 1..].parse::<i32>().ok()?),
        None => (rest, 0),
    };
    let (int_part, frac_part) = match mantissa.find('.') {
        Some(i) => (&mantissa[..i], &mantissa[i + 1..]),
        None => (mantissa, ""),
    };
    if int_part.is_empty() && frac_part.is_empty() {
        return None;
    }
    let mut value = 0.0f64;
    for c in int_part.chars() {
        value = value * 16.0 + f64::from(c.to_digit(16)?);
    }
    let mut scale = 1.0 / 16.0;
    for c in frac_part.chars() {
        value += f64::from(c.to_digit(16)?) * scale;
        scale /= 16.0;
    }
    let value = value * 2f64.powi(exp);
    Some(if neg { -value } else { value })
}

fn tuple_count(rt: &mut Runtime, args: &[ObjRef]) -> RtResult<ObjRef> {
    let items = match rt.heap.get(args[0]) {
        Object::Tuple(items) => items.clone(),
        _ => return Err(rt.raise(ExcKind::TypeError, "descriptor 'count' requires a tuple")),
    };
    let mut n = 0;
    for item in items {
        if rt.equals(item, args[1])? {
            n += 1;
        }
    }
    Ok(rt.new_int(n))
}

fn list_append(rt: &mut Runtime, args: &[ObjRef]) -> RtResult<ObjRef> {
    let value = args[1];
    match rt.heap.get_mut(args[0]) {
        Object::List(items) => items.push(value),
        _ => return Err(rt.raise(ExcKind::TypeError, "descriptor 'append' requires a list")),
    }
    rt.incref(value);
    Ok(rt.none())
}

fn list_pop(rt: &mut Runtime, args: &[ObjRef]) -> RtResult<ObjRef> {
    let popped = match rt.heap.get_mut(args[0]) {
        Object::List(items) => items.pop(),
        _ => return Err(rt.raise(ExcKind::TypeError, "descriptor 'pop' requires a list")),
    };
    match popped {
        Some(v) => Ok(v),
        None => Err(rt.raise(ExcKind::IndexError, "pop from empty list")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_float_parsing() {
        assert_eq!(parse_hex_float("0x1p1"), Some(2.0));
        assert_eq!(parse_hex_float("-0x1.8"), Some(-1.5));
        assert_eq!(parse_hex_float("0xff"), Some(255.0));
        assert_eq!(parse_hex_float("0x"), None);
        assert_eq!(parse_hex_float("0xzz"), None);
    }

    #[test]
    fn method_lookup_is_per_owner() {
        assert!(lookup_method(ObjKind::Str, "upper").is_some());
        assert!(lookup_method(ObjKind::Int, "upper").is_none());
        let id = lookup_method(ObjKind::Float, "fromhex");
        assert_eq!(id.map(|id| method(id).kind), Some(MethodKind::Class));
    }
}
